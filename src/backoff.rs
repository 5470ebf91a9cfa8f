//! Exponential backoff scheduling for reconnect attempts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tuning for one [`Backoff`] instance.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied per completed attempt.
    pub factor: f64,
    /// Fraction of the computed delay used as the ± jitter bound. Zero
    /// disables jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            factor: 2.0,
            jitter: 0.4,
        }
    }
}

/// Schedule notifications emitted by a [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffEvent {
    /// A retry delay was scheduled (or rescheduled, replacing the pending
    /// timer).
    Scheduled { attempt: u32, delay: Duration },
    /// The scheduled delay elapsed; retry now.
    Ready { attempt: u32, delay: Duration },
}

/// Retry scheduler with an exponential curve, optional jitter, and
/// server-directed pacing overrides.
///
/// At most one timer is pending at any moment: calling [`Backoff::backoff`]
/// while a timer is pending replaces it, recomputed from the current attempt
/// counter. The counter advances only when a timer fires.
pub struct Backoff {
    config: BackoffConfig,
    attempt: Arc<AtomicU32>,
    retry_after: Option<Duration>,
    timer: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<BackoffEvent>,
}

impl Backoff {
    /// Returns the scheduler plus its event stream.
    pub fn new(config: BackoffConfig) -> (Self, mpsc::UnboundedReceiver<BackoffEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                attempt: Arc::new(AtomicU32::new(0)),
                retry_after: None,
                timer: None,
                events,
            },
            events_rx,
        )
    }

    /// Schedules the next retry, replacing any pending timer.
    pub fn backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let attempt = self.attempt.load(Ordering::Relaxed);
        let delay = match self.retry_after.take() {
            Some(paced) => paced,
            None => self.jittered(self.base_delay(attempt)),
        };
        debug!(target: "Backoff", "Scheduled retry #{attempt} in {delay:?}");
        let _ = self.events.send(BackoffEvent::Scheduled { attempt, delay });
        let events = self.events.clone();
        let counter = self.attempt.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            counter.fetch_add(1, Ordering::Relaxed);
            let _ = events.send(BackoffEvent::Ready { attempt, delay });
        }));
    }

    /// Cancels any pending timer, rewinds the attempt counter, and drops a
    /// pending pacing override.
    pub fn reset(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.retry_after = None;
        self.attempt.store(0, Ordering::Relaxed);
    }

    /// Overrides the next scheduled delay with a server-directed value. The
    /// override applies verbatim, without jitter, and is consumed by the
    /// next [`Backoff::backoff`] call.
    pub fn set_retry_after(&mut self, delay: Duration) {
        self.retry_after = Some(delay);
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let raw = self.config.min_delay.as_millis() as f64 * self.config.factor.powi(attempt as i32);
        let capped = raw.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let mut rng = rand::rng();
        let bound = (rng.random::<f64>() * self.config.jitter * delay.as_millis() as f64).floor();
        let perturbation = if rng.random::<bool>() {
            bound as i64
        } else {
            -(bound as i64)
        };
        let millis = (delay.as_millis() as i64 + perturbation).max(0) as u64;
        Duration::from_millis(millis)
    }
}

impl Drop for Backoff {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
