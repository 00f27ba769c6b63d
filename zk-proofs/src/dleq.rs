//! Sigma-protocol proofs made non-interactive with the Poseidon transcript.
//!
//! - [`DleqProof`]: equality of discrete logs across any number of bases
//!   (`P_j = s·B_j` for all `j`). Used for obfuscation (`S = s·G`, `K' = s·K`, `C' = s·C`) and
//!   for the shuffle sum check (`ΔK = ρ·G`, `ΔC = ρ·P`).
//! - [`KeySwitchProof`]: knowledge of `(x, v)` with `X = x·G`, `A = v·G`, `B = v·Q - x·K`.

use crate::constants::{DOMAIN_DLEQ, DOMAIN_KEY_SWITCH};
use crate::elgamal::{generator, random_scalar, KeySwitchShare};
use crate::transcript::Transcript;
use crate::types::fr_hex;
use ark_bn254::{Fr, G1Projective};
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DleqProof {
    #[serde(with = "fr_hex")]
    pub challenge: Fr,
    #[serde(with = "fr_hex")]
    pub response: Fr,
}

fn dleq_challenge(bases: &[G1Projective], points: &[G1Projective], commitments: &[G1Projective]) -> Fr {
    let mut t = Transcript::new(DOMAIN_DLEQ);
    for p in bases.iter().chain(points).chain(commitments) {
        t.append_point(p);
    }
    t.challenge()
}

impl DleqProof {
    pub fn prove<R: RngCore>(bases: &[G1Projective], points: &[G1Projective], secret: Fr, rng: &mut R) -> Self {
        let w = random_scalar(rng);
        let commitments: Vec<G1Projective> = bases.iter().map(|b| *b * w).collect();
        let challenge = dleq_challenge(bases, points, &commitments);
        Self {
            challenge,
            response: w + challenge * secret,
        }
    }

    pub fn verify(&self, bases: &[G1Projective], points: &[G1Projective]) -> bool {
        if bases.is_empty() || bases.len() != points.len() {
            return false;
        }
        let commitments: Vec<G1Projective> = bases
            .iter()
            .zip(points)
            .map(|(b, p)| *b * self.response - *p * self.challenge)
            .collect();
        dleq_challenge(bases, points, &commitments) == self.challenge
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySwitchProof {
    #[serde(with = "fr_hex")]
    pub challenge: Fr,
    #[serde(with = "fr_hex")]
    pub z_secret: Fr,
    #[serde(with = "fr_hex")]
    pub z_blind: Fr,
}

fn key_switch_challenge(
    node_key: &G1Projective,
    target: &G1Projective,
    k: &G1Projective,
    share: &KeySwitchShare,
    t: [G1Projective; 3],
) -> Fr {
    let mut tr = Transcript::new(DOMAIN_KEY_SWITCH);
    for p in [*node_key, *target, *k, share.a, share.b].iter().chain(t.iter()) {
        tr.append_point(p);
    }
    tr.challenge()
}

impl KeySwitchProof {
    /// `secret` is the node's key share `x`, `blind` the per-ciphertext `v`.
    pub fn prove<R: RngCore>(
        secret: Fr,
        blind: Fr,
        node_key: &G1Projective,
        target: &G1Projective,
        k: &G1Projective,
        share: &KeySwitchShare,
        rng: &mut R,
    ) -> Self {
        let g = generator();
        let wx = random_scalar(rng);
        let wv = random_scalar(rng);
        let t = [g * wx, g * wv, *target * wv - *k * wx];
        let challenge = key_switch_challenge(node_key, target, k, share, t);
        Self {
            challenge,
            z_secret: wx + challenge * secret,
            z_blind: wv + challenge * blind,
        }
    }

    pub fn verify(&self, node_key: &G1Projective, target: &G1Projective, k: &G1Projective, share: &KeySwitchShare) -> bool {
        let g = generator();
        let c = self.challenge;
        let t = [
            g * self.z_secret - *node_key * c,
            g * self.z_blind - share.a * c,
            *target * self.z_blind - *k * self.z_secret - share.b * c,
        ];
        key_switch_challenge(node_key, target, k, share, t) == c
    }
}
