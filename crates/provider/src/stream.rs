//! Helpers for proxying the upstream SSE stream: hop-by-hop header
//! stripping and the terminal failure event emitted once any output has
//! already reached the client (spec §4.5/§7 streaming failover policy).

use reqwest::header::HeaderMap;

/// Headers that must not be forwarded verbatim between proxy hops.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Remove hop-by-hop headers from a header map in place.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let to_remove: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

/// Format the terminal SSE event emitted when an upstream error occurs
/// after output has already been streamed to the client. Once any byte has
/// reached the client the proxy cannot retry on another account — it must
/// surface the failure inline instead (spec §7: "Stream error after bytes
/// sent → emit terminal failed event; no retry").
pub fn terminal_failed_event(message: &str) -> String {
    let data = serde_json::json!({
        "type": "response.failed",
        "error": { "message": message },
    });
    format!("event: response.failed\ndata: {data}\n\n")
}
