//! Edge names and the gateway URIs they resolve to.

/// Edge used when the caller configures none: global latency-based routing.
pub const DEFAULT_EDGE: &str = "roaming";

/// Signaling endpoint fronting the given edge.
pub fn uri_for_edge(edge: &str) -> String {
    format!("wss://{edge}.gw.callwire.io/signal")
}

/// Ranked endpoint list for the configured edges, falling back to
/// [`DEFAULT_EDGE`] when none are given.
pub fn uris_for_edges(edges: &[String]) -> Vec<String> {
    if edges.is_empty() {
        return vec![uri_for_edge(DEFAULT_EDGE)];
    }
    edges.iter().map(|edge| uri_for_edge(edge)).collect()
}

/// Maps a gateway-reported region hint (for example `US_EAST_VIRGINIA`) to
/// the edge fronting it. Unrecognized hints are used as edge names verbatim,
/// lowercased.
pub fn edge_for_region(region: &str) -> String {
    match region {
        "US_EAST_VIRGINIA" => "us1".to_owned(),
        "US_WEST_OREGON" => "us2".to_owned(),
        "EU_IRELAND" => "ie1".to_owned(),
        "EU_FRANKFURT" => "de1".to_owned(),
        "ASIAPAC_SINGAPORE" => "sg1".to_owned(),
        "ASIAPAC_TOKYO" => "jp1".to_owned(),
        "ASIAPAC_SYDNEY" => "au1".to_owned(),
        "SOUTH_AMERICA_SAO_PAULO" => "br1".to_owned(),
        other => other.to_ascii_lowercase(),
    }
}
