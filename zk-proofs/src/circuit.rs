//! R1CS circuit for proving a committed value lies in a public range.
//!
//! What this circuit proves:
//! 1) The prover knows `(value, blinding)` with `Poseidon(value, blinding) == commitment`.
//! 2) `value` fits in `RANGE_BITS` bits.
//! 3) `max - value` fits in `RANGE_BITS` bits, i.e. `0 <= value <= max`.
//!
//! Public inputs are `commitment` then `max`, in that order.

use crate::constants::{poseidon_config, RANGE_BITS};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};

/// Convert little-endian boolean bits into an FpVar.
fn bits_le_to_fp(bits_le: &[Boolean<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    let zero = FpVar::<Fr>::constant(Fr::from(0u64));
    let mut acc = zero.clone();
    let mut coeff = FpVar::<Fr>::constant(Fr::from(1u64));

    for b in bits_le {
        acc += b.select(&coeff, &zero)?;
        coeff += coeff.clone();
    }

    Ok(acc)
}

/// Enforce that `v` fits in `RANGE_BITS` bits.
fn constrain_range_bits(v: &FpVar<Fr>) -> Result<(), SynthesisError> {
    let bits = v.to_bits_le()?;
    let reconstructed = bits_le_to_fp(&bits[..RANGE_BITS])?;
    reconstructed.enforce_equal(v)
}

#[derive(Clone, Debug)]
pub struct RangeCircuit {
    /// Private value and commitment blinding.
    pub value: Fr,
    pub blinding: Fr,

    /// Public commitment and inclusive upper bound.
    pub commitment: Fr,
    pub max: Fr,
}

impl ConstraintSynthesizer<Fr> for RangeCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // Ordering MUST match `groth16::range_public_inputs`.
        let commitment = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.commitment))?;
        let max = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.max))?;

        let value = FpVar::<Fr>::new_witness(cs.clone(), || Ok(self.value))?;
        let blinding = FpVar::<Fr>::new_witness(cs.clone(), || Ok(self.blinding))?;

        let cfg = poseidon_config();
        let mut sponge = PoseidonSpongeVar::<Fr>::new(cs.clone(), &cfg);
        sponge.absorb(&&[value.clone(), blinding][..])?;
        let computed = sponge.squeeze_field_elements(1)?[0].clone();
        computed.enforce_equal(&commitment)?;

        constrain_range_bits(&value)?;
        constrain_range_bits(&(max - &value))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groth16::commit_value;
    use ark_relations::r1cs::ConstraintSystem;

    fn satisfied(value: u64, max: u64) -> bool {
        let blinding = Fr::from(99u64);
        let circuit = RangeCircuit {
            value: Fr::from(value),
            blinding,
            commitment: commit_value(Fr::from(value), blinding),
            max: Fr::from(max),
        };
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit.generate_constraints(cs.clone()).unwrap();
        cs.is_satisfied().unwrap()
    }

    #[test]
    fn accepts_values_inside_the_range() {
        assert!(satisfied(0, 9));
        assert!(satisfied(9, 9));
    }

    #[test]
    fn rejects_values_above_the_bound() {
        assert!(!satisfied(10, 9));
    }

    #[test]
    fn rejects_wrong_commitment() {
        let circuit = RangeCircuit {
            value: Fr::from(3u64),
            blinding: Fr::from(1u64),
            commitment: commit_value(Fr::from(4u64), Fr::from(1u64)),
            max: Fr::from(9u64),
        };
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit.generate_constraints(cs.clone()).unwrap();
        assert!(!cs.is_satisfied().unwrap());
    }
}
