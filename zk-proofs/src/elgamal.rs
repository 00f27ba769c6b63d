//! Exponential EC-ElGamal over BN254 G1.
//!
//! Plaintexts are small signed integers encoded as `m·G`, which makes the scheme additively
//! homomorphic. Decryption recovers `m·G` and looks it up in a precomputed table, so only
//! values in `[-limit, limit]` decrypt to an integer.
//!
//! Besides encrypt/decrypt/add, this module holds the per-node transforms the protocol needs:
//! re-randomisation (shuffle), multiplicative blinding (obfuscation) and the key-switching
//! contribution that moves a ciphertext from the joint key to the querier's key without
//! decrypting it.

use crate::types::{fr_from_i64, point_hex};
use crate::ZkError;
use ark_bn254::{Fr, G1Projective};
use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::CanonicalSerialize;
use ark_std::{UniformRand, Zero};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Add, AddAssign};

pub fn generator() -> G1Projective {
    G1Projective::generator()
}

/// A non-zero random scalar.
pub fn random_scalar<R: RngCore>(rng: &mut R) -> Fr {
    loop {
        let s = Fr::rand(rng);
        if !s.is_zero() {
            return s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "point_hex")] pub G1Projective);

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(#[serde(with = "crate::types::fr_hex")] pub Fr);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let x = random_scalar(rng);
        Self {
            secret: SecretKey(x),
            public: PublicKey(generator() * x),
        }
    }
}

/// Joint public key of a set of nodes: the sum of their public keys.
pub fn aggregate_public_keys<'a>(keys: impl IntoIterator<Item = &'a PublicKey>) -> PublicKey {
    PublicKey(keys.into_iter().fold(G1Projective::zero(), |acc, k| acc + k.0))
}

/// `(K, C) = (r·G, m·G + r·P)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    #[serde(with = "point_hex")]
    pub k: G1Projective,
    #[serde(with = "point_hex")]
    pub c: G1Projective,
}

impl Ciphertext {
    pub fn zero() -> Self {
        Self {
            k: G1Projective::zero(),
            c: G1Projective::zero(),
        }
    }

    pub fn scale(&self, s: Fr) -> Self {
        Self {
            k: self.k * s,
            c: self.c * s,
        }
    }

    /// Compressed bytes of both components, used when absorbing into transcripts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for p in [self.k, self.c] {
            p.into_affine()
                .serialize_compressed(&mut out)
                .expect("in-memory serialization");
        }
        out
    }
}

impl Add for Ciphertext {
    type Output = Ciphertext;

    fn add(self, rhs: Ciphertext) -> Ciphertext {
        Ciphertext {
            k: self.k + rhs.k,
            c: self.c + rhs.c,
        }
    }
}

impl AddAssign<&Ciphertext> for Ciphertext {
    fn add_assign(&mut self, rhs: &Ciphertext) {
        self.k += rhs.k;
        self.c += rhs.c;
    }
}

/// A vector of ciphertexts, one per output slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherVector(pub Vec<Ciphertext>);

impl CipherVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ciphertext> {
        self.0.iter()
    }

    /// Slot-wise homomorphic addition.
    pub fn add_assign(&mut self, other: &CipherVector) -> Result<(), ZkError> {
        if self.len() != other.len() {
            return Err(ZkError::LengthMismatch {
                expected: self.len(),
                got: other.len(),
            });
        }
        for (a, b) in self.0.iter_mut().zip(other.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Adds `other[..self.len()]`; `other` may be longer (noise lists are).
    pub fn add_prefix(&mut self, other: &CipherVector) -> Result<(), ZkError> {
        if other.len() < self.len() {
            return Err(ZkError::LengthMismatch {
                expected: self.len(),
                got: other.len(),
            });
        }
        for (a, b) in self.0.iter_mut().zip(other.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Repeat the whole vector `times` times.
    pub fn replicate(&self, times: usize) -> CipherVector {
        let mut out = Vec::with_capacity(self.len() * times.max(1));
        for _ in 0..times.max(1) {
            out.extend_from_slice(&self.0);
        }
        CipherVector(out)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(Ciphertext::to_bytes).collect()
    }
}

impl FromIterator<Ciphertext> for CipherVector {
    fn from_iter<I: IntoIterator<Item = Ciphertext>>(iter: I) -> Self {
        CipherVector(iter.into_iter().collect())
    }
}

/// Encrypt `m` under `pk`, returning the randomness used.
pub fn encrypt_int_get_r<R: RngCore>(pk: &PublicKey, m: i64, rng: &mut R) -> (Ciphertext, Fr) {
    let r = random_scalar(rng);
    let ct = Ciphertext {
        k: generator() * r,
        c: generator() * fr_from_i64(m) + pk.0 * r,
    };
    (ct, r)
}

pub fn encrypt_int<R: RngCore>(pk: &PublicKey, m: i64, rng: &mut R) -> Ciphertext {
    encrypt_int_get_r(pk, m, rng).0
}

pub fn encrypt_int_vector<R: RngCore>(pk: &PublicKey, values: &[i64], rng: &mut R) -> CipherVector {
    values.iter().map(|m| encrypt_int(pk, *m, rng)).collect()
}

/// Recover `m·G`.
pub fn decrypt_point(sk: &SecretKey, ct: &Ciphertext) -> G1Projective {
    ct.c - ct.k * sk.0
}

/// True iff the ciphertext encrypts zero. Works for blinded (obfuscated) ciphertexts too.
pub fn decrypt_check_zero(sk: &SecretKey, ct: &Ciphertext) -> bool {
    decrypt_point(sk, ct).is_zero()
}

/// Encryption of zero with fresh randomness, added to `ct`.
pub fn rerandomize<R: RngCore>(pk: &PublicKey, ct: &Ciphertext, rng: &mut R) -> (Ciphertext, Fr) {
    let rho = random_scalar(rng);
    let out = Ciphertext {
        k: ct.k + generator() * rho,
        c: ct.c + pk.0 * rho,
    };
    (out, rho)
}

/// One node's share of a key switch for a single ciphertext.
///
/// `a = v·G`, `b = v·Q - x·K` where `x` is the node's secret share, `Q` the target key and
/// `K` the ciphertext's first component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySwitchShare {
    #[serde(with = "point_hex")]
    pub a: G1Projective,
    #[serde(with = "point_hex")]
    pub b: G1Projective,
}

impl KeySwitchShare {
    pub fn zero() -> Self {
        Self {
            a: G1Projective::zero(),
            b: G1Projective::zero(),
        }
    }
}

impl AddAssign<&KeySwitchShare> for KeySwitchShare {
    fn add_assign(&mut self, rhs: &KeySwitchShare) {
        self.a += rhs.a;
        self.b += rhs.b;
    }
}

/// Compute the share and return the fresh `v` (needed by the key-switch proof).
pub fn key_switch_share<R: RngCore>(
    secret: &SecretKey,
    target: &PublicKey,
    k: &G1Projective,
    rng: &mut R,
) -> (KeySwitchShare, Fr) {
    let v = random_scalar(rng);
    let share = KeySwitchShare {
        a: generator() * v,
        b: target.0 * v - *k * secret.0,
    };
    (share, v)
}

/// Combine the summed shares of every node with the original ciphertext.
pub fn apply_key_switch(original: &Ciphertext, summed: &KeySwitchShare) -> Ciphertext {
    Ciphertext {
        k: summed.a,
        c: original.c + summed.b,
    }
}

/// Lookup table `m·G -> m` for `m` in `[-limit, limit]`.
pub struct DecryptionTable {
    limit: i64,
    table: HashMap<Vec<u8>, i64>,
}

impl DecryptionTable {
    pub fn new(limit: i64) -> Self {
        let limit = limit.max(0);
        let g = generator();
        let mut points = Vec::with_capacity((2 * limit + 1) as usize);
        let mut acc = g * fr_from_i64(-limit);
        for _ in -limit..=limit {
            points.push(acc);
            acc += g;
        }
        let affine = G1Projective::normalize_batch(&points);

        let mut table = HashMap::with_capacity(affine.len());
        for (m, p) in (-limit..=limit).zip(affine.iter()) {
            let mut key = Vec::with_capacity(32);
            p.serialize_compressed(&mut key)
                .expect("in-memory serialization");
            table.insert(key, m);
        }

        Self { limit, table }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn lookup(&self, point: &G1Projective) -> Option<i64> {
        let mut key = Vec::with_capacity(32);
        point
            .into_affine()
            .serialize_compressed(&mut key)
            .expect("in-memory serialization");
        self.table.get(&key).copied()
    }

    pub fn decrypt_int(&self, sk: &SecretKey, ct: &Ciphertext) -> Result<i64, ZkError> {
        self.lookup(&decrypt_point(sk, ct))
            .ok_or(ZkError::DecryptionOutOfRange { limit: self.limit })
    }

    pub fn decrypt_int_vector(&self, sk: &SecretKey, cv: &CipherVector) -> Result<Vec<i64>, ZkError> {
        cv.iter().map(|ct| self.decrypt_int(sk, ct)).collect()
    }
}

impl std::fmt::Debug for DecryptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecryptionTable[-{0}..={0}]", self.limit)
    }
}
