// =============================================================================
// Order Idempotency — deterministic link_id generation
// =============================================================================
//
// Every order carries a `link_id` derived purely from its logical intent
// (strategy, symbol, side, and a coarse time bucket). Retrying the same
// intent inside the same bucket must produce a byte-identical id so the
// Order Engine can short-circuit on a duplicate before touching the network.

use sha2::{Digest, Sha256};

use crate::types::Side;

const MAX_LINK_ID_LEN: usize = 36;
const DEFAULT_BUCKET_SECS: u64 = 60;

/// The decoded components of a `link_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkIdParts {
    pub strategy: String,
    pub symbol: String,
    pub bucket: u64,
    pub side: Side,
}

/// Build the idempotency key for an order intent.
///
/// `link_id = "{strategy}_{symbol}_{bucket}_{side_code}"` where `bucket =
/// floor(timestamp_secs / bucket_secs)`. If the composed id would exceed
/// `MAX_LINK_ID_LEN` characters, `strategy` is shortened to fit; if it is
/// still too long, the tail is replaced with an 8-char hex digest of the full
/// id so the result stays both bounded and collision-resistant.
pub fn generate_link_id(strategy: &str, symbol: &str, timestamp_secs: u64, side: Side) -> String {
    generate_link_id_with_bucket(strategy, symbol, timestamp_secs, side, DEFAULT_BUCKET_SECS)
}

pub fn generate_link_id_with_bucket(
    strategy: &str,
    symbol: &str,
    timestamp_secs: u64,
    side: Side,
    bucket_secs: u64,
) -> String {
    let bucket = timestamp_secs / bucket_secs.max(1);
    let side_code = side.code();

    let full = format!("{strategy}_{symbol}_{bucket}_{side_code}");
    if full.len() <= MAX_LINK_ID_LEN {
        return full;
    }

    // Shorten the strategy name to make room, keeping symbol/bucket/side intact
    // since those carry the parseable identity.
    let suffix = format!("_{symbol}_{bucket}_{side_code}");
    let budget = MAX_LINK_ID_LEN.saturating_sub(suffix.len());
    if budget > 0 {
        let shortened = truncate_chars(strategy, budget);
        let candidate = format!("{shortened}{suffix}");
        if candidate.len() <= MAX_LINK_ID_LEN {
            return candidate;
        }
    }

    // Even the symbol/bucket/side suffix alone doesn't fit: fall back to a
    // fixed-width hash of the full logical id.
    let hash = hex::encode(Sha256::digest(full.as_bytes()));
    let short_hash = &hash[..8];
    format!("h_{short_hash}")
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    s.chars().take(max_len).collect()
}

/// Parse a `link_id` produced by [`generate_link_id`] back into its parts.
/// Returns `None` for hash-fallback ids, which are intentionally opaque.
pub fn parse_link_id(link_id: &str) -> Option<LinkIdParts> {
    let parts: Vec<&str> = link_id.rsplitn(4, '_').collect();
    if parts.len() != 4 {
        return None;
    }
    // rsplitn yields parts in reverse order: [side, bucket, symbol, strategy]
    let side = Side::from_code(parts[0].chars().next()?)?;
    let bucket: u64 = parts[1].parse().ok()?;
    let symbol = parts[2].to_string();
    let strategy = parts[3].to_string();
    Some(LinkIdParts {
        strategy,
        symbol,
        bucket,
        side,
    })
}
