//! Utility functions and helpers

pub mod certificates;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Uniformly random duration in `[0, window)`. Zero or negative windows yield zero.
pub fn random_stagger(window: chrono::Duration) -> chrono::Duration {
    match window.num_nanoseconds() {
        Some(nanos) if nanos > 0 => chrono::Duration::nanoseconds(rand::thread_rng().gen_range(0..nanos)),
        _ => chrono::Duration::zero(),
    }
}

/// Deterministic `prefix:hash` key over the JSON encoding of `value`.
///
/// Returns `None` when the value cannot be encoded.
pub fn hash_key<T: Serialize>(prefix: &str, value: &T) -> Option<String> {
    let encoded = serde_json::to_vec(value).ok()?;
    let digest = Sha256::digest(&encoded);
    Some(format!("{}:{}", prefix, hex::encode(&digest[..16])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_stagger_bounds() {
        let window = chrono::Duration::milliseconds(50);
        for _ in 0..200 {
            let stagger = random_stagger(window);
            assert!(stagger >= chrono::Duration::zero());
            assert!(stagger < window);
        }
        assert_eq!(random_stagger(chrono::Duration::zero()), chrono::Duration::zero());
        assert_eq!(random_stagger(chrono::Duration::seconds(-3)), chrono::Duration::zero());
    }

    #[test]
    fn test_hash_key_is_deterministic_and_prefixed() {
        let a = hash_key("service", &("web", "default")).unwrap();
        let b = hash_key("service", &("web", "default")).unwrap();
        let c = hash_key("service", &("api", "default")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("service:"));
        assert_eq!(a.len(), "service:".len() + 32);
    }
}
