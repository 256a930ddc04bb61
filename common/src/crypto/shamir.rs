//! Shamir secret sharing over GF(256).
//!
//! Each byte of the secret is shared independently through a random
//! polynomial of degree `threshold - 1` whose constant term is the secret
//! byte. A share is the evaluation point `x` (1..=shares) followed by the
//! polynomial evaluations, so a share of an `n`-byte secret is `n + 1`
//! bytes. Any `threshold` distinct shares reconstruct the secret by
//! Lagrange interpolation at `x = 0`; fewer reveal nothing.

use rand::RngCore;
use thiserror::Error;

/// Error type for split/combine operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShamirError {
    /// `threshold` must satisfy `1 <= threshold <= shares`.
    #[error("Invalid threshold {threshold} for {shares} shares")]
    InvalidThreshold { shares: u8, threshold: u8 },

    /// At least one share is required to combine.
    #[error("No shares provided")]
    NoShares,

    /// A share is too short to carry an evaluation point and data.
    #[error("Share too short: {0} bytes")]
    ShareTooShort(usize),

    /// Shares disagree on the secret length.
    #[error("Mismatched share lengths: expected {expected} bytes, got {got}")]
    MismatchedLength { expected: usize, got: usize },

    /// Two shares carry the same evaluation point.
    #[error("Duplicate share for point {0}")]
    DuplicatePoint(u8),

    /// A share carries the reserved evaluation point zero.
    #[error("Share with evaluation point zero")]
    ZeroPoint,
}

// Multiplication in GF(2^8) with the AES reduction polynomial x^8+x^4+x^3+x+1
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    for _ in 0..8 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80 != 0;
        a <<= 1;
        if carry {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

fn gf_pow(mut base: u8, mut exp: u8) -> u8 {
    let mut result = 1u8;
    while exp > 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

// Multiplicative inverse; a^254 == a^-1 in GF(2^8). Zero has no inverse,
// callers guarantee the argument is non-zero (distinct evaluation points).
fn gf_inv(a: u8) -> u8 {
    gf_pow(a, 254)
}

// Evaluate a polynomial (constant term first) at x, Horner form
fn poly_eval(coefficients: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for coefficient in coefficients.iter().rev() {
        acc = gf_mul(acc, x) ^ coefficient;
    }
    acc
}

/// Split `secret` into `shares` shares, any `threshold` of which suffice
/// to reconstruct it.
pub fn split(secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Vec<u8>>, ShamirError> {
    if threshold == 0 || threshold > shares {
        return Err(ShamirError::InvalidThreshold { shares, threshold });
    }

    let mut rng = rand::thread_rng();

    // One polynomial per secret byte; constant term is the byte itself
    let mut polynomials = Vec::with_capacity(secret.len());
    for &byte in secret {
        let mut coefficients = vec![0u8; threshold as usize];
        coefficients[0] = byte;
        rng.fill_bytes(&mut coefficients[1..]);
        polynomials.push(coefficients);
    }

    let mut out = Vec::with_capacity(shares as usize);
    for x in 1..=shares {
        let mut share = Vec::with_capacity(secret.len() + 1);
        share.push(x);
        for coefficients in &polynomials {
            share.push(poly_eval(coefficients, x));
        }
        out.push(share);
    }
    Ok(out)
}

/// Reconstruct a secret from shares.
///
/// All provided shares participate in the interpolation; passing more
/// than `threshold` consistent shares is fine. Passing fewer than the
/// original threshold yields bytes unrelated to the secret (by design
/// there is no way to detect this here; callers enforce the count).
pub fn combine(shares: &[Vec<u8>]) -> Result<Vec<u8>, ShamirError> {
    let first = shares.first().ok_or(ShamirError::NoShares)?;
    if first.is_empty() {
        return Err(ShamirError::ShareTooShort(0));
    }
    let secret_len = first.len() - 1;

    let mut points = Vec::with_capacity(shares.len());
    for share in shares {
        if share.len() != first.len() {
            return Err(ShamirError::MismatchedLength {
                expected: first.len(),
                got: share.len(),
            });
        }
        let x = share[0];
        if x == 0 {
            return Err(ShamirError::ZeroPoint);
        }
        if points.contains(&x) {
            return Err(ShamirError::DuplicatePoint(x));
        }
        points.push(x);
    }

    // Lagrange interpolation at x = 0, byte by byte
    let mut secret = Vec::with_capacity(secret_len);
    for byte_index in 0..secret_len {
        let mut value = 0u8;
        for (i, share_i) in shares.iter().enumerate() {
            let x_i = share_i[0];
            let y_i = share_i[byte_index + 1];
            let mut basis = 1u8;
            for (j, share_j) in shares.iter().enumerate() {
                if i == j {
                    continue;
                }
                let x_j = share_j[0];
                // x_j / (x_j - x_i); subtraction is XOR in GF(2^8)
                basis = gf_mul(basis, gf_mul(x_j, gf_inv(x_j ^ x_i)));
            }
            value ^= gf_mul(y_i, basis);
        }
        secret.push(value);
    }
    Ok(secret)
}
