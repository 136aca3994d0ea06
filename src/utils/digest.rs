/// Content digests for change detection
use sha2::{Digest, Sha256};

use crate::types::Bar;

pub fn content_digest(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update(component.as_bytes());
        hasher.update([0x1f]);
    }
    let result = hasher.finalize();
    format!("{:x}", result)
}

/// Digest over everything a consumer can observe about a bar.
/// `written_at_ms` is excluded so a rewrite of identical content is a no-op.
pub fn bar_digest(bar: &Bar) -> String {
    let extensions = serde_json::to_string(bar.extensions()).unwrap_or_default();
    content_digest(&[
        bar.instrument(),
        bar.timeframe().as_str(),
        &bar.open_time_ms().to_string(),
        &bar.open().to_string(),
        &bar.high().to_string(),
        &bar.low().to_string(),
        &bar.close().to_string(),
        &bar.volume().to_string(),
        if bar.is_complete() { "complete" } else { "forming" },
        bar.provenance().as_str(),
        &extensions,
    ])
}
