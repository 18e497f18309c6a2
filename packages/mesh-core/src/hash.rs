//! FNV-1a hashing for sticky instance selection.
//!
//! The ip-hash load-balancing strategy maps a client address onto a healthy
//! instance with this hash, so the same client keeps landing on the same
//! instance while the healthy set is unchanged.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over the UTF-8 bytes of `s`.
///
/// # Examples
///
/// ```
/// use meshkit_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps `key` onto a bucket in `0..buckets`. Returns 0 when `buckets` is 0.
#[must_use]
pub fn bucket_for(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    fnv1a_hash(key) as usize % buckets
}
