//! Fiat-Shamir transcript on top of the Poseidon sponge.

use crate::constants::poseidon_config;
use ark_bn254::{Fr, G1Projective};
use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ec::CurveGroup;
use ark_serialize::CanonicalSerialize;

pub struct Transcript {
    sponge: PoseidonSponge<Fr>,
}

impl Transcript {
    pub fn new(domain: &[u8]) -> Self {
        let cfg = poseidon_config();
        let mut sponge = PoseidonSponge::<Fr>::new(&cfg);
        sponge.absorb(&domain.to_vec());
        Self { sponge }
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        // Length prefix keeps concatenations unambiguous.
        self.sponge.absorb(&&[Fr::from(bytes.len() as u64)][..]);
        self.sponge.absorb(&bytes.to_vec());
    }

    pub fn append_point(&mut self, p: &G1Projective) {
        let mut bytes = Vec::with_capacity(32);
        p.into_affine()
            .serialize_compressed(&mut bytes)
            .expect("in-memory serialization");
        self.append_bytes(&bytes);
    }

    pub fn append_scalar(&mut self, x: &Fr) {
        self.sponge.absorb(&&[*x][..]);
    }

    pub fn challenge(&mut self) -> Fr {
        self.sponge.squeeze_field_elements::<Fr>(1)[0]
    }
}

/// Poseidon digest of arbitrary bytes, hex encoded.
pub fn digest_hex(domain: &[u8], parts: &[&[u8]]) -> String {
    let mut t = Transcript::new(domain);
    for p in parts {
        t.append_bytes(p);
    }
    let mut out = Vec::new();
    t.challenge()
        .serialize_compressed(&mut out)
        .expect("in-memory serialization");
    hex::encode(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_depend_on_every_part() {
        let a = digest_hex(b"d", &[b"ab", b"c"]);
        let b = digest_hex(b"d", &[b"a", b"bc"]);
        let c = digest_hex(b"d", &[b"ab", b"c"]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
