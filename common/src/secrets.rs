use anyhow::{Context, Result};
use rand::Rng;
use subtle::ConstantTimeEq;

/// Number of leading characters of an API key stored in clear for candidate
/// lookup. Includes the `sk_` tag.
pub const API_KEY_PREFIX_LEN: usize = 8;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Caller API keys look like `sk_<40 random chars>`. Only the bcrypt hash and
/// the prefix are persisted; the full key is shown to the operator once.
pub fn generate_api_key() -> String {
    format!("sk_{}", random_token(40))
}

/// Per-cluster relayer tokens, returned in plaintext exactly once at
/// registration.
pub fn generate_cluster_token() -> String {
    format!("ct_{}", random_token(48))
}

pub fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(API_KEY_PREFIX_LEN)]
}

/// Correlation ids for audit records, in the W3C trace-context shape
/// (128-bit trace id, 64-bit span id, lowercase hex).
pub fn generate_trace_id() -> String {
    let mut rng = rand::rng();
    let hi: u64 = rng.random();
    let lo: u64 = rng.random();
    format!("{:016x}{:016x}", hi, lo)
}

pub fn generate_span_id() -> String {
    let mut rng = rand::rng();
    let id: u64 = rng.random();
    format!("{:016x}", id)
}

pub fn hash_secret(secret: &str) -> Result<String> {
    bcrypt::hash(secret, bcrypt::DEFAULT_COST).context("Failed to hash secret")
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    bcrypt::verify(secret, hash).unwrap_or(false)
}

/// Timing-safe equality for secret material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Check `secret` against every candidate without an early exit, so the scan
/// cost does not depend on which candidate (if any) matches.
pub fn verify_any<'a, T>(secret: &str, candidates: &'a [(T, String)]) -> Option<&'a T> {
    let mut matched: Option<&T> = None;
    for (item, hash) in candidates {
        let ok = verify_secret(secret, hash);
        if ok && matched.is_none() {
            matched = Some(item);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("sk_"));
        assert_eq!(key.len(), 43);
        assert_eq!(key_prefix(&key).len(), API_KEY_PREFIX_LEN);
        assert!(key_prefix(&key).starts_with("sk_"));
    }

    #[test]
    fn cluster_token_shape() {
        let token = generate_cluster_token();
        assert!(token.starts_with("ct_"));
        assert_eq!(token.len(), 51);
    }

    #[test]
    fn correlation_id_shapes() {
        assert_eq!(generate_trace_id().len(), 32);
        assert_eq!(generate_span_id().len(), 16);
        assert_ne!(generate_trace_id(), generate_trace_id());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn verify_any_picks_the_matching_candidate() {
        // Low cost keeps the test fast; production hashing uses DEFAULT_COST.
        let hash_a = bcrypt::hash("sk_aaa", 4).unwrap();
        let hash_b = bcrypt::hash("sk_bbb", 4).unwrap();
        let candidates = vec![("a", hash_a), ("b", hash_b)];

        assert_eq!(verify_any("sk_bbb", &candidates), Some(&"b"));
        assert_eq!(verify_any("sk_ccc", &candidates), None);
    }
}
