use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Coordinates of an output-artifact isolated tree on CAS, carried inside a
/// shard's `output` side channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OutputLocation {
    pub storage: String,
    pub namespace: String,
    pub hash: String,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[run_isolated_out_hack\](.*)\[/run_isolated_out_hack\]").unwrap()
    })
}

/// The single place in this crate that parses the output-marker side
/// channel (Design Note: "do not sprinkle parsing elsewhere"). Returns
/// `None` if the marker is absent, malformed, or fails validation.
pub fn extract_output_location(text: &str) -> Option<OutputLocation> {
    let captures = marker_regex().captures(text)?;
    let payload = captures.get(1)?.as_str();

    let location: OutputLocation = serde_json::from_str(payload).ok()?;

    if !location.storage.is_ascii() || !location.namespace.is_ascii() || !location.hash.is_ascii() {
        return None;
    }
    if !(location.storage.starts_with("http://") || location.storage.starts_with("https://")) {
        return None;
    }

    Some(location)
}
