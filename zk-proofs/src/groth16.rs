//! Groth16 prover/verifier orchestration for the range circuit.
//!
//! SECURITY NOTE (prototype): Groth16 requires a trusted setup that produces a proving key (PK)
//! and verifying key (VK). Keys are generated locally by whoever bootstraps the network. In
//! production, an MPC ceremony (or a transparent system) should be used.

use crate::circuit::RangeCircuit;
use crate::constants::poseidon_config;
use crate::ZkError;
use ark_bn254::{Bn254, Fr};
use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_groth16::{prepare_verifying_key, Groth16, PreparedVerifyingKey, Proof, ProvingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use rand::RngCore;

/// Poseidon(value, blinding).
///
/// This MUST match the circuit's logic.
pub fn commit_value(value: Fr, blinding: Fr) -> Fr {
    let cfg = poseidon_config();
    let mut sponge = PoseidonSponge::<Fr>::new(&cfg);
    sponge.absorb(&&[value, blinding][..]);
    sponge.squeeze_field_elements(1)[0]
}

/// ORDERING MUST MATCH the circuit's `new_input` allocation order.
pub fn range_public_inputs(commitment: Fr, max: u64) -> Vec<Fr> {
    vec![commitment, Fr::from(max)]
}

/// Proving and verifying keys for the range circuit, plus the prepared VK.
#[derive(Clone)]
pub struct RangeKeys {
    pub pk: ProvingKey<Bn254>,
    pub vk: VerifyingKey<Bn254>,
    pub pvk: PreparedVerifyingKey<Bn254>,
}

impl std::fmt::Debug for RangeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RangeKeys(..)")
    }
}

/// Generate a Groth16 keypair for the range circuit.
///
/// The circuit shape does not depend on the bound, so one setup serves every range.
pub fn setup_keys(rng: &mut impl RngCore) -> Result<RangeKeys, ZkError> {
    let blinding = Fr::from(0u64);
    let circuit = RangeCircuit {
        value: Fr::from(0u64),
        blinding,
        commitment: commit_value(Fr::from(0u64), blinding),
        max: Fr::from(0u64),
    };

    let pk = Groth16::<Bn254>::generate_random_parameters_with_reduction(circuit, rng)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;

    let vk = pk.vk.clone();
    let pvk = prepare_verifying_key(&vk);
    Ok(RangeKeys { pk, vk, pvk })
}

/// A range proof together with its public inputs.
#[derive(Clone, Debug)]
pub struct RangeProofBundle {
    pub proof: Proof<Bn254>,
    pub commitment: Fr,
    pub max: u64,
}

/// Prove `0 <= value <= max` for a freshly committed `value`.
pub fn prove_range(
    rng: &mut impl RngCore,
    pk: &ProvingKey<Bn254>,
    value: i64,
    max: u64,
) -> Result<RangeProofBundle, ZkError> {
    if value < 0 || value as u64 > max {
        return Err(ZkError::ValueOutOfRange { value, max });
    }

    let value_fr = Fr::from(value as u64);
    let blinding = Fr::rand(rng);
    let commitment = commit_value(value_fr, blinding);

    let circuit = RangeCircuit {
        value: value_fr,
        blinding,
        commitment,
        max: Fr::from(max),
    };

    let proof = Groth16::<Bn254>::create_random_proof_with_reduction(circuit, pk, rng)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;

    Ok(RangeProofBundle { proof, commitment, max })
}

/// Verify against an already prepared verifying key.
pub fn verify_range_prepared(
    pvk: &PreparedVerifyingKey<Bn254>,
    proof: &Proof<Bn254>,
    commitment: Fr,
    max: u64,
) -> Result<(), ZkError> {
    let public_inputs = range_public_inputs(commitment, max);
    let ok = Groth16::<Bn254>::verify_proof(pvk, proof, &public_inputs)
        .map_err(|e| ZkError::Ark(format!("{e}")))?;
    if !ok {
        return Err(ZkError::VerificationFailed("range proof rejected".into()));
    }
    Ok(())
}

/// Verify a range proof, preparing the key on the fly.
pub fn verify_range(vk: &VerifyingKey<Bn254>, proof: &Proof<Bn254>, commitment: Fr, max: u64) -> Result<(), ZkError> {
    verify_range_prepared(&prepare_verifying_key(vk), proof, commitment, max)
}

pub fn serialize_pk(pk: &ProvingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    pk.serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

/// Rebuild the full key set from a stored proving key.
pub fn deserialize_keys(pk_bytes: &[u8]) -> Result<RangeKeys, ZkError> {
    let pk = ProvingKey::<Bn254>::deserialize_compressed(pk_bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    let vk = pk.vk.clone();
    let pvk = prepare_verifying_key(&vk);
    Ok(RangeKeys { pk, vk, pvk })
}

pub fn serialize_vk(vk: &VerifyingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    vk.serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_vk(bytes: &[u8]) -> Result<VerifyingKey<Bn254>, ZkError> {
    VerifyingKey::<Bn254>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}

pub fn serialize_proof(proof: &Proof<Bn254>) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    proof
        .serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn deserialize_proof(bytes: &[u8]) -> Result<Proof<Bn254>, ZkError> {
    Proof::<Bn254>::deserialize_compressed(bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))
}
