//! XOR popcount distance over 32-byte positions.
//!
//! The distance between two positions is the Hamming weight of their XOR,
//! i.e. Kademlia's XOR metric at bit resolution. Smaller is closer.

use std::cmp::Ordering;

use super::hash::{Digest, DIGEST_SIZE};

/// Maximum possible distance between two positions (all 256 bits differ).
pub const MAX_DISTANCE: u32 = (DIGEST_SIZE as u32) * 8;

/// Calculate the XOR popcount distance between two positions.
pub fn xor_distance(a: &Digest, b: &Digest) -> u32 {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let mut bits = 0u32;
    for i in 0..DIGEST_SIZE {
        bits += (a_bytes[i] ^ b_bytes[i]).count_ones();
    }
    bits
}

/// Compare two candidates by distance to a target.
///
/// Returns `Ordering::Less` if `a` is closer to `target` than `b`.
pub fn compare_distance(target: &Digest, a: &Digest, b: &Digest) -> Ordering {
    xor_distance(target, a).cmp(&xor_distance(target, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::blake2b;

    #[test]
    fn test_distance_to_self_is_zero() {
        let digest = blake2b(b"self");
        assert_eq!(xor_distance(&digest, &digest), 0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = blake2b(b"a");
        let b = blake2b(b"b");
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
    }

    #[test]
    fn test_distance_counts_bits() {
        let zero = Digest::zero();
        let mut one_bit = [0u8; DIGEST_SIZE];
        one_bit[17] = 0b0001_0000;
        assert_eq!(xor_distance(&zero, &Digest::new(one_bit)), 1);

        let all = Digest::new([0xFF; DIGEST_SIZE]);
        assert_eq!(xor_distance(&zero, &all), MAX_DISTANCE);
    }

    #[test]
    fn test_compare_distance() {
        let target = Digest::zero();
        let mut near = [0u8; DIGEST_SIZE];
        near[0] = 0b0000_0001;
        let far = Digest::new([0xFF; DIGEST_SIZE]);

        assert_eq!(
            compare_distance(&target, &Digest::new(near), &far),
            Ordering::Less
        );
        assert_eq!(
            compare_distance(&target, &far, &Digest::new(near)),
            Ordering::Greater
        );
        assert_eq!(compare_distance(&target, &far, &far), Ordering::Equal);
    }

    #[test]
    fn test_triangle_inequality() {
        // Hamming weight of XOR is a metric, sanity-check on real digests
        let a = blake2b(b"x");
        let b = blake2b(b"y");
        let c = blake2b(b"z");

        assert!(xor_distance(&a, &c) <= xor_distance(&a, &b) + xor_distance(&b, &c));
    }
}
