//! # Hashing Utilities
//!
//! BLAKE3 only. Nothing the engine hashes ever leaves for a system that
//! insists on SHA-256, so there's no reason to carry two hash functions.
//!
//! Token digests use BLAKE3's `derive_key` mode as a domain separator: a
//! digest computed for one purpose can never collide with one computed for
//! another, even over identical bytes.

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Domain-separated BLAKE3 hash.
///
/// `context` should be a hardcoded, globally unique string such as
/// [`crate::config::TOKEN_DOMAIN`]. Never build it from user input.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Domain-separated hash over several parts, fed sequentially.
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
pub fn domain_separated_hash_parts(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"zkredit"), blake3_hash(b"zkredit"));
        assert_ne!(blake3_hash(b"zkredit"), blake3_hash(b"zkcredit"));
    }

    #[test]
    fn domains_separate() {
        let a = domain_separated_hash("zkredit/test/a", b"payload");
        let b = domain_separated_hash("zkredit/test/b", b"payload");
        assert_ne!(a, b);
        assert_ne!(a, blake3_hash(b"payload"));
    }

    #[test]
    fn parts_are_length_prefixed() {
        let ctx = "zkredit/test/parts";
        let split_one = domain_separated_hash_parts(ctx, &[b"ab", b"c"]);
        let split_two = domain_separated_hash_parts(ctx, &[b"a", b"bc"]);
        assert_ne!(split_one, split_two);
    }
}
