//! Types shared between the circuit, the cryptosystem and the host-side prover/verifier.

use crate::constants::RANGE_BITS;
use crate::ZkError;
use ark_bn254::{Fr, G1Affine, G1Projective};
use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};

/// Declared value range for one output slot: values must lie in `[0, u^l)`.
///
/// `(0, 0)` means "unchecked" and `(2, 1)` means "single bit".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeBound {
    pub u: u64,
    pub l: u32,
}

impl RangeBound {
    pub const UNCHECKED: RangeBound = RangeBound { u: 0, l: 0 };
    pub const BIT: RangeBound = RangeBound { u: 2, l: 1 };

    pub fn new(u: u64, l: u32) -> Self {
        Self { u, l }
    }

    pub fn is_unchecked(&self) -> bool {
        *self == Self::UNCHECKED
    }

    pub fn is_bit(&self) -> bool {
        *self == Self::BIT
    }

    /// Largest admissible value, `u^l - 1`.
    ///
    /// Fails when the bound does not fit the circuit's `RANGE_BITS`.
    pub fn max_value(&self) -> Result<u64, ZkError> {
        let bound = self
            .u
            .checked_pow(self.l)
            .filter(|b| *b >= 1 && *b <= (1u64 << RANGE_BITS))
            .ok_or(ZkError::RangeTooWide { u: self.u, l: self.l })?;
        Ok(bound - 1)
    }
}

/// Hex of the compressed arkworks encoding of a G1 point.
pub fn point_to_hex(p: &G1Projective) -> String {
    let mut bytes = Vec::new();
    p.into_affine()
        .serialize_compressed(&mut bytes)
        .expect("in-memory serialization");
    hex::encode(bytes)
}

pub fn point_from_hex(s: &str) -> Result<G1Projective, ZkError> {
    let bytes = hex::decode(s).map_err(|e| ZkError::Serialization(format!("invalid hex: {e}")))?;
    let affine = G1Affine::deserialize_compressed(&bytes[..])
        .map_err(|e| ZkError::Serialization(format!("invalid point bytes: {e}")))?;
    Ok(affine.into())
}

pub fn fr_to_hex(x: &Fr) -> String {
    let mut bytes = Vec::new();
    x.serialize_compressed(&mut bytes)
        .expect("in-memory serialization");
    hex::encode(bytes)
}

pub fn fr_from_hex(s: &str) -> Result<Fr, ZkError> {
    let bytes = hex::decode(s).map_err(|e| ZkError::Serialization(format!("invalid hex: {e}")))?;
    Fr::deserialize_compressed(&bytes[..])
        .map_err(|e| ZkError::Serialization(format!("invalid field bytes: {e}")))
}

/// Map a signed integer into the scalar field.
pub fn fr_from_i64(v: i64) -> Fr {
    if v >= 0 {
        Fr::from(v as u64)
    } else {
        -Fr::from(v.unsigned_abs())
    }
}

/// `#[serde(with = "point_hex")]` for G1 points.
pub mod point_hex {
    use ark_bn254::G1Projective;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &G1Projective, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::point_to_hex(p))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<G1Projective, D::Error> {
        let s = String::deserialize(d)?;
        super::point_from_hex(&s).map_err(D::Error::custom)
    }
}

/// `#[serde(with = "fr_hex")]` for scalars.
pub mod fr_hex {
    use ark_bn254::Fr;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &Fr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::fr_to_hex(x))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Fr, D::Error> {
        let s = String::deserialize(d)?;
        super::fr_from_hex(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ec::PrimeGroup;

    #[test]
    fn range_bounds() {
        assert_eq!(RangeBound::BIT.max_value().unwrap(), 1);
        assert_eq!(RangeBound::new(10, 3).max_value().unwrap(), 999);
        assert!(RangeBound::new(2, 40).max_value().is_err());
        assert!(RangeBound::new(0, 3).max_value().is_err());
    }

    #[test]
    fn point_hex_is_stable() {
        let g = G1Projective::generator() * Fr::from(7u64);
        let back = point_from_hex(&point_to_hex(&g)).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn negative_scalars() {
        assert_eq!(fr_from_i64(-3) + Fr::from(3u64), Fr::from(0u64));
    }
}
