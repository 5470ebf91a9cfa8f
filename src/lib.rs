// Re-export the types most integrations need at the crate root
pub use config::SessionConfig;
pub use error::SignalingError;
pub use events::{CallInvite, SessionEvent};
pub use session::{SignalingSession, SignalingState};

pub mod backoff;
pub mod config;
pub mod edge;
pub mod error;
pub mod events;
pub mod protocol;
pub mod pstream;
pub mod session;
pub mod socket;
pub mod transport;
