//! splitting a version's value into per-helper fragments
//!
//! the coordination core treats fragments as opaque bytes and only needs the
//! [`Splitter`] contract. [`ShamirSplitter`] is the default: byte-wise shamir
//! over GF(256).
//!
//! ## prefix stability
//!
//! a helper added after a version was created must still receive a fragment of
//! the *same* polynomial as everyone else. splitters therefore must return the
//! same fragment at index `i` regardless of how many fragments are requested.
//! the shamir splitter derives its coefficients deterministically from a random
//! per-splitter key and the value (hkdf-sha256, salted with secret id, version
//! and threshold), which gives this property without remembering any
//! per-version randomness. the key never leaves the sharer, so a helper holding
//! fewer than `threshold` fragments cannot test guesses of the value.

use hkdf::Hkdf;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::Sha256;

use crate::ids::SecretId;
use crate::{Error, Result};

/// maximum number of fragments (x = 1..=255 in GF(256))
pub const MAX_FRAGMENTS: usize = 255;

/// fragment header: threshold byte + index byte
const HEADER_LEN: usize = 2;

/// external split/combine collaborator
pub trait Splitter: Send + Sync {
    /// split `value` into `count` fragments, any `threshold` of which recombine.
    /// fragment `i` must not depend on `count`.
    fn split(
        &self,
        secret_id: &SecretId,
        version: u64,
        value: &[u8],
        count: usize,
        threshold: usize,
    ) -> Result<Vec<Vec<u8>>>;

    /// recombine fragments produced by [`Splitter::split`]
    fn combine(&self, secret_id: &SecretId, version: u64, fragments: &[Vec<u8>]) -> Result<Vec<u8>>;
}

/// GF(256) multiplication using AES polynomial (x^8 + x^4 + x^3 + x + 1)
fn gf256_mul(a: u8, b: u8) -> u8 {
    let mut result = 0u8;
    let mut a = a;
    let mut b = b;

    while b != 0 {
        if b & 1 != 0 {
            result ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    result
}

/// a^254 = a^(-1) in GF(256)
fn gf256_inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    let mut result = a;
    for _ in 0..6 {
        result = gf256_mul(result, result);
        result = gf256_mul(result, a);
    }
    gf256_mul(result, result)
}

fn gf256_div(a: u8, b: u8) -> u8 {
    gf256_mul(a, gf256_inv(b))
}

/// horner evaluation of coeffs[0] + coeffs[1]x + ...
fn poly_eval(coeffs: &[u8], x: u8) -> u8 {
    coeffs
        .iter()
        .rev()
        .fold(0u8, |acc, &c| gf256_mul(acc, x) ^ c)
}

/// lagrange interpolation at x=0
fn lagrange_interpolate(points: &[(u8, u8)]) -> u8 {
    let mut result = 0u8;

    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;

        for (j, &(xj, _)) in points.iter().enumerate() {
            if i != j {
                num = gf256_mul(num, xj); // (0 - xj) = xj in GF(256)
                den = gf256_mul(den, xi ^ xj);
            }
        }

        result ^= gf256_mul(yi, gf256_div(num, den));
    }

    result
}

/// length of the coefficient key
pub const KEY_LEN: usize = 32;

/// shamir secret sharing over GF(256) with keyed deterministic coefficients
#[derive(Clone)]
pub struct ShamirSplitter {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for ShamirSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShamirSplitter").finish_non_exhaustive()
    }
}

impl Default for ShamirSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl ShamirSplitter {
    /// splitter with a fresh random coefficient key
    pub fn new() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// splitter with a caller-held key, for sharers that must re-split
    /// consistently across restarts
    pub fn with_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    fn coefficient_rng(&self, secret_id: &SecretId, version: u64, value: &[u8], threshold: usize) -> ChaCha20Rng {
        let mut salt = Vec::with_capacity(16 + 8 + 1);
        salt.extend_from_slice(secret_id.as_bytes());
        salt.extend_from_slice(&version.to_le_bytes());
        salt.push(threshold as u8);

        let mut ikm = Vec::with_capacity(KEY_LEN + value.len());
        ikm.extend_from_slice(&self.key);
        ikm.extend_from_slice(value);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut seed = [0u8; 32];
        // 32 bytes is always a valid hkdf-sha256 output length
        let _ = hk.expand(b"shareguard:shamir:coefficients:v1", &mut seed);
        ChaCha20Rng::from_seed(seed)
    }
}

impl Splitter for ShamirSplitter {
    fn split(
        &self,
        secret_id: &SecretId,
        version: u64,
        value: &[u8],
        count: usize,
        threshold: usize,
    ) -> Result<Vec<Vec<u8>>> {
        if threshold == 0 || threshold > MAX_FRAGMENTS || count == 0 || count > MAX_FRAGMENTS {
            return Err(Error::InvalidThreshold { threshold, count });
        }

        // one polynomial per byte: value[i] + c1 x + ... + c(t-1) x^(t-1)
        let mut rng = self.coefficient_rng(secret_id, version, value, threshold);
        let polys: Vec<Vec<u8>> = value
            .iter()
            .map(|&b| {
                let mut coeffs = vec![0u8; threshold];
                coeffs[0] = b;
                rng.fill_bytes(&mut coeffs[1..]);
                coeffs
            })
            .collect();

        let fragments = (1..=count)
            .map(|x| {
                let x = x as u8;
                let mut fragment = Vec::with_capacity(HEADER_LEN + value.len());
                fragment.push(threshold as u8);
                fragment.push(x);
                fragment.extend(polys.iter().map(|coeffs| poly_eval(coeffs, x)));
                fragment
            })
            .collect();

        Ok(fragments)
    }

    fn combine(&self, _secret_id: &SecretId, _version: u64, fragments: &[Vec<u8>]) -> Result<Vec<u8>> {
        let first = fragments.first().ok_or(Error::NotEnoughShares { have: 0, need: 1 })?;
        if first.len() < HEADER_LEN {
            return Err(Error::InvalidShareFormat);
        }
        let threshold = first[0] as usize;
        let len = first.len();

        let mut used: Vec<&Vec<u8>> = Vec::with_capacity(threshold);
        for fragment in fragments {
            if fragment.len() != len || fragment[0] as usize != threshold || fragment[1] == 0 {
                return Err(Error::InvalidShareFormat);
            }
            // duplicate indices carry no information
            if used.iter().any(|f| f[1] == fragment[1]) {
                continue;
            }
            used.push(fragment);
            if used.len() == threshold {
                break;
            }
        }

        if used.len() < threshold {
            return Err(Error::NotEnoughShares {
                have: used.len(),
                need: threshold,
            });
        }

        let value = (HEADER_LEN..len)
            .map(|i| {
                let points: Vec<(u8, u8)> = used.iter().map(|f| (f[1], f[i])).collect();
                lagrange_interpolate(&points)
            })
            .collect();

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gf256_ops() {
        assert_eq!(gf256_mul(0, 0), 0);
        assert_eq!(gf256_mul(1, 1), 1);
        assert_eq!(gf256_mul(2, 2), 4);

        for a in 1..=255u8 {
            let inv = gf256_inv(a);
            assert_eq!(gf256_mul(a, inv), 1, "inverse failed for {}", a);
        }
    }

    #[test]
    fn test_any_threshold_subset_recovers() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        let value = b"quite hush hush".to_vec();
        let fragments = splitter.split(&id, 1, &value, 5, 3).unwrap();
        assert_eq!(fragments.len(), 5);

        let pick = |idx: &[usize]| -> Vec<Vec<u8>> { idx.iter().map(|&i| fragments[i].clone()).collect() };
        assert_eq!(splitter.combine(&id, 1, &pick(&[0, 1, 2])).unwrap(), value);
        assert_eq!(splitter.combine(&id, 1, &pick(&[4, 2, 0])).unwrap(), value);
        assert_eq!(splitter.combine(&id, 1, &fragments).unwrap(), value);
    }

    #[test]
    fn test_below_threshold_fails() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        let fragments = splitter.split(&id, 1, b"secret", 4, 3).unwrap();
        let result = splitter.combine(&id, 1, &fragments[..2]);
        assert!(matches!(result, Err(Error::NotEnoughShares { have: 2, need: 3 })));

        // repeating a fragment does not help
        let repeated = vec![fragments[0].clone(), fragments[0].clone(), fragments[1].clone()];
        assert!(splitter.combine(&id, 1, &repeated).is_err());
    }

    #[test]
    fn test_fragments_are_prefix_stable() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        let few = splitter.split(&id, 2, b"value", 3, 2).unwrap();
        let many = splitter.split(&id, 2, b"value", 9, 2).unwrap();
        assert_eq!(few[..], many[..3]);

        // late fragment combines with early ones
        let mixed = vec![few[0].clone(), many[8].clone()];
        assert_eq!(splitter.combine(&id, 2, &mixed).unwrap(), b"value");
    }

    #[test]
    fn test_versions_use_distinct_polynomials() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        let v1 = splitter.split(&id, 1, b"same value", 3, 2).unwrap();
        let v2 = splitter.split(&id, 2, b"same value", 3, 2).unwrap();
        assert_ne!(v1[0], v2[0]);
    }

    #[test]
    fn test_invalid_parameters() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        assert!(splitter.split(&id, 1, b"x", 3, 0).is_err());
        assert!(splitter.split(&id, 1, b"x", 0, 1).is_err());
        assert!(splitter.split(&id, 1, b"x", 256, 2).is_err());
        assert!(matches!(
            splitter.combine(&id, 1, &[vec![1]]),
            Err(Error::InvalidShareFormat)
        ));
    }

    #[test]
    fn test_coefficients_depend_on_key() {
        let id = SecretId::random();
        let a = ShamirSplitter::new().split(&id, 1, b"4821", 3, 3).unwrap();
        let b = ShamirSplitter::new().split(&id, 1, b"4821", 3, 3).unwrap();
        assert_ne!(a, b);

        let keyed = ShamirSplitter::with_key([9u8; KEY_LEN]);
        assert_eq!(
            keyed.split(&id, 1, b"4821", 3, 3).unwrap(),
            ShamirSplitter::with_key([9u8; KEY_LEN]).split(&id, 1, b"4821", 3, 3).unwrap()
        );
    }

    #[test]
    fn test_single_fragment_does_not_single_out_guess() {
        let splitter = ShamirSplitter::new();
        let id = SecretId::random();
        let held = splitter.split(&id, 1, b"4821", 3, 2).unwrap().remove(0);

        // without the key, no candidate reproduces the held fragment
        let outsider = ShamirSplitter::new();
        let matches = (0..10_000u32)
            .map(|pin| format!("{:04}", pin))
            .filter(|guess| outsider.split(&id, 1, guess.as_bytes(), 3, 2).unwrap()[0] == held)
            .count();
        assert_eq!(matches, 0);
    }

    proptest! {
        #[test]
        fn prop_split_combine(value in proptest::collection::vec(any::<u8>(), 0..64),
                              threshold in 1usize..6,
                              extra in 0usize..4) {
            let splitter = ShamirSplitter::new();
            let id = SecretId([7u8; 16]);
            let count = threshold + extra;
            let fragments = splitter.split(&id, 1, &value, count, threshold).unwrap();
            let recovered = splitter.combine(&id, 1, &fragments[extra..]).unwrap();
            prop_assert_eq!(recovered, value);
        }
    }
}
