//! Proof payloads exchanged between nodes, one per verification category.
//!
//! | category      | claim                                                          |
//! |---------------|----------------------------------------------------------------|
//! | `range`       | each committed slot value lies in `[0, u^l)` (Groth16)         |
//! | `shuffle`     | the noise list was re-randomised without changing its sum      |
//! | `aggregation` | the output vector is the slot-wise sum of the inputs           |
//! | `obfuscation` | every ciphertext was multiplied by a known non-zero scalar     |
//! | `key_switch`  | each share was computed with the node's registered key         |

use crate::dleq::{DleqProof, KeySwitchProof};
use crate::elgamal::{generator, random_scalar, CipherVector, Ciphertext, KeySwitchShare, PublicKey};
use crate::groth16::{deserialize_proof, prove_range, serialize_proof, verify_range, verify_range_prepared};
use crate::types::{fr_hex, RangeBound};
use crate::ZkError;
use ark_bn254::{Bn254, Fr, G1Projective};
use ark_groth16::{PreparedVerifyingKey, ProvingKey, VerifyingKey};
use ark_std::Zero;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofCategory {
    Range,
    Shuffle,
    Aggregation,
    Obfuscation,
    KeySwitch,
}

impl ProofCategory {
    pub const ALL: [ProofCategory; 5] = [
        ProofCategory::Range,
        ProofCategory::Shuffle,
        ProofCategory::Aggregation,
        ProofCategory::Obfuscation,
        ProofCategory::KeySwitch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProofCategory::Range => "range",
            ProofCategory::Shuffle => "shuffle",
            ProofCategory::Aggregation => "aggregation",
            ProofCategory::Obfuscation => "obfuscation",
            ProofCategory::KeySwitch => "key_switch",
        }
    }
}

impl std::fmt::Display for ProofCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn fail(msg: &str) -> ZkError {
    ZkError::VerificationFailed(msg.to_string())
}

// ---------------------------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProofItem {
    pub slot: usize,
    #[serde(with = "fr_hex")]
    pub commitment: Fr,
    pub max: u64,
    /// Base64 of the compressed Groth16 proof.
    pub proof: String,
}

/// Range proofs for one encoded vector; unchecked slots carry no item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProofSet {
    pub items: Vec<RangeProofItem>,
}

impl RangeProofSet {
    pub fn prove<R: RngCore>(
        rng: &mut R,
        pk: &ProvingKey<Bn254>,
        values: &[i64],
        bounds: &[RangeBound],
    ) -> Result<Self, ZkError> {
        if values.len() != bounds.len() {
            return Err(ZkError::LengthMismatch {
                expected: bounds.len(),
                got: values.len(),
            });
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let mut items = Vec::new();
        for (slot, (value, bound)) in values.iter().zip(bounds).enumerate() {
            if bound.is_unchecked() {
                continue;
            }
            let bundle = prove_range(rng, pk, *value, bound.max_value()?)?;
            items.push(RangeProofItem {
                slot,
                commitment: bundle.commitment,
                max: bundle.max,
                proof: b64.encode(serialize_proof(&bundle.proof)?),
            });
        }
        Ok(Self { items })
    }

    /// Every checked slot must be covered exactly once, against the declared bound.
    pub fn verify(
        &self,
        vk: &VerifyingKey<Bn254>,
        prepared: Option<&PreparedVerifyingKey<Bn254>>,
        bounds: &[RangeBound],
    ) -> Result<(), ZkError> {
        let checked: Vec<usize> = bounds
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_unchecked())
            .map(|(i, _)| i)
            .collect();
        let covered: Vec<usize> = self.items.iter().map(|i| i.slot).collect();
        if checked != covered {
            return Err(fail("range proofs do not cover the checked slots"));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        for item in &self.items {
            if item.max != bounds[item.slot].max_value()? {
                return Err(fail("range proof claims a different bound"));
            }
            let bytes = b64
                .decode(&item.proof)
                .map_err(|e| ZkError::Serialization(format!("invalid base64: {e}")))?;
            let proof = deserialize_proof(&bytes)?;
            match prepared {
                Some(pvk) => verify_range_prepared(pvk, &proof, item.commitment, item.max)?,
                None => verify_range(vk, &proof, item.commitment, item.max)?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------------------------

/// Inputs and claimed slot-wise sum. Verified by recomputation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationClaim {
    pub inputs: Vec<CipherVector>,
    pub output: CipherVector,
}

impl AggregationClaim {
    /// `expected_inputs` is the number of vectors the submitter had to add up.
    pub fn verify(&self, expected_inputs: usize) -> Result<(), ZkError> {
        if self.inputs.len() != expected_inputs {
            return Err(fail(&format!(
                "aggregate has {} inputs, expected {expected_inputs}",
                self.inputs.len()
            )));
        }
        let mut acc = CipherVector(vec![Ciphertext::zero(); self.output.len()]);
        for input in &self.inputs {
            acc.add_assign(input)?;
        }
        if acc != self.output {
            return Err(fail("aggregate does not equal the sum of its inputs"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Obfuscation
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationProof {
    pub input: CipherVector,
    pub output: CipherVector,
    /// `S_i = s_i·G` for the scalar applied to ciphertext `i`.
    #[serde(with = "points_hex")]
    pub blinds: Vec<G1Projective>,
    pub proofs: Vec<DleqProof>,
}

impl ObfuscationProof {
    /// Multiply every ciphertext by a fresh non-zero scalar and prove it.
    pub fn obfuscate<R: RngCore>(rng: &mut R, input: &CipherVector) -> (CipherVector, Self) {
        let g = generator();
        let mut output = Vec::with_capacity(input.len());
        let mut blinds = Vec::with_capacity(input.len());
        let mut proofs = Vec::with_capacity(input.len());

        for ct in input.iter() {
            let s = random_scalar(rng);
            let out = ct.scale(s);
            let blind = g * s;
            let proof = DleqProof::prove(&[g, ct.k, ct.c], &[blind, out.k, out.c], s, rng);
            output.push(out);
            blinds.push(blind);
            proofs.push(proof);
        }

        let output = CipherVector(output);
        let claim = Self {
            input: input.clone(),
            output: output.clone(),
            blinds,
            proofs,
        };
        (output, claim)
    }

    pub fn verify(&self) -> Result<(), ZkError> {
        let n = self.input.len();
        if self.output.len() != n || self.blinds.len() != n || self.proofs.len() != n {
            return Err(fail("obfuscation proof has inconsistent lengths"));
        }
        let g = generator();
        for i in 0..n {
            let (a, b) = (&self.input.0[i], &self.output.0[i]);
            if self.blinds[i].is_zero() {
                return Err(fail("obfuscation scalar is zero"));
            }
            if !self.proofs[i].verify(&[g, a.k, a.c], &[self.blinds[i], b.k, b.c]) {
                return Err(fail("obfuscation DLEQ rejected"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Shuffle (noise list)
// ---------------------------------------------------------------------------------------------

/// Permutation and re-randomisation scalars, drawn ahead of the shuffle.
#[derive(Clone, Debug)]
pub struct ShuffleRandomness {
    pub permutation: Vec<usize>,
    pub rhos: Vec<Fr>,
}

impl ShuffleRandomness {
    pub fn precompute<R: RngCore>(rng: &mut R, len: usize) -> Self {
        let mut permutation: Vec<usize> = (0..len).collect();
        permutation.shuffle(rng);
        let rhos = (0..len).map(|_| random_scalar(rng)).collect();
        Self { permutation, rhos }
    }

    pub fn len(&self) -> usize {
        self.permutation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permutation.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleProof {
    pub input: CipherVector,
    pub output: CipherVector,
    /// DLEQ over bases `[G, P]` for `(ΣK_out - ΣK_in, ΣC_out - ΣC_in)`.
    pub proof: DleqProof,
}

fn sum_difference(input: &CipherVector, output: &CipherVector) -> (G1Projective, G1Projective) {
    let sum = |v: &CipherVector| v.iter().fold(Ciphertext::zero(), |acc, c| acc + *c);
    let (a, b) = (sum(input), sum(output));
    (b.k - a.k, b.c - a.c)
}

impl ShuffleProof {
    /// Permute and re-randomise `input` under `joint`, proving the sum is preserved.
    pub fn shuffle<R: RngCore>(
        rng: &mut R,
        joint: &PublicKey,
        input: &CipherVector,
        randomness: &ShuffleRandomness,
    ) -> Result<(CipherVector, Self), ZkError> {
        if randomness.len() != input.len() {
            return Err(ZkError::LengthMismatch {
                expected: input.len(),
                got: randomness.len(),
            });
        }

        let g = generator();
        let mut total = Fr::zero();
        let output: CipherVector = randomness
            .permutation
            .iter()
            .zip(&randomness.rhos)
            .map(|(src, rho)| {
                total += rho;
                let ct = input.0[*src];
                Ciphertext {
                    k: ct.k + g * rho,
                    c: ct.c + joint.0 * rho,
                }
            })
            .collect();

        let (dk, dc) = sum_difference(input, &output);
        let proof = DleqProof::prove(&[g, joint.0], &[dk, dc], total, rng);
        let claim = Self {
            input: input.clone(),
            output: output.clone(),
            proof,
        };
        Ok((output, claim))
    }

    pub fn verify(&self, joint: &PublicKey) -> Result<(), ZkError> {
        if self.input.len() != self.output.len() {
            return Err(fail("shuffle changed the list length"));
        }
        let (dk, dc) = sum_difference(&self.input, &self.output);
        if !self.proof.verify(&[generator(), joint.0], &[dk, dc]) {
            return Err(fail("shuffle sum proof rejected"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Key switch
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySwitchClaim {
    pub node_key: PublicKey,
    pub target: PublicKey,
    /// First components of the ciphertexts being switched.
    #[serde(with = "points_hex")]
    pub ks: Vec<G1Projective>,
    pub shares: Vec<KeySwitchShare>,
    pub proofs: Vec<KeySwitchProof>,
}

impl KeySwitchClaim {
    pub fn verify(&self, expected_node_key: &PublicKey, expected_target: &PublicKey) -> Result<(), ZkError> {
        if &self.node_key != expected_node_key || &self.target != expected_target {
            return Err(fail("key switch claim names the wrong keys"));
        }
        let n = self.ks.len();
        if self.shares.len() != n || self.proofs.len() != n {
            return Err(fail("key switch proof has inconsistent lengths"));
        }
        for i in 0..n {
            if !self.proofs[i].verify(&self.node_key.0, &self.target.0, &self.ks[i], &self.shares[i]) {
                return Err(fail("key switch proof rejected"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------------------------

/// Body of a proof record. Per-group payloads are keyed by group key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "body", rename_all = "snake_case")]
pub enum ProofPayload {
    Range(BTreeMap<String, RangeProofSet>),
    Shuffle(ShuffleProof),
    Aggregation(BTreeMap<String, AggregationClaim>),
    Obfuscation(BTreeMap<String, ObfuscationProof>),
    KeySwitch(BTreeMap<String, KeySwitchClaim>),
}

/// What a verifier needs beyond the payload itself.
#[derive(Clone, Copy, Debug)]
pub struct VerifyContext<'a> {
    pub range_vk: Option<&'a VerifyingKey<Bn254>>,
    /// Set in `optimized` proof mode: verify against the cached prepared key.
    pub range_pvk: Option<&'a PreparedVerifyingKey<Bn254>>,
    pub bounds: &'a [RangeBound],
    pub joint_key: &'a PublicKey,
    pub querier_key: &'a PublicKey,
    /// Registered public key of the submitting node, if it is a computing node.
    pub submitter_key: Option<&'a PublicKey>,
    /// Groups of the survey; aggregation payloads must cover exactly these.
    pub groups: &'a [String],
    /// Data providers plus tree children of the submitter.
    pub aggregation_inputs: usize,
}

impl ProofPayload {
    pub fn category(&self) -> ProofCategory {
        match self {
            ProofPayload::Range(_) => ProofCategory::Range,
            ProofPayload::Shuffle(_) => ProofCategory::Shuffle,
            ProofPayload::Aggregation(_) => ProofCategory::Aggregation,
            ProofPayload::Obfuscation(_) => ProofCategory::Obfuscation,
            ProofPayload::KeySwitch(_) => ProofCategory::KeySwitch,
        }
    }

    pub fn verify(&self, ctx: &VerifyContext<'_>) -> Result<(), ZkError> {
        match self {
            ProofPayload::Range(sets) => {
                let vk = ctx.range_vk.ok_or_else(|| fail("no range verifying key"))?;
                for set in sets.values() {
                    set.verify(vk, ctx.range_pvk, ctx.bounds)?;
                }
                Ok(())
            }
            ProofPayload::Shuffle(p) => p.verify(ctx.joint_key),
            ProofPayload::Aggregation(claims) => {
                let covered: BTreeSet<&String> = claims.keys().collect();
                let wanted: BTreeSet<&String> = ctx.groups.iter().collect();
                if covered != wanted {
                    return Err(fail("aggregation claims do not cover the survey's groups"));
                }
                claims.values().try_for_each(|c| c.verify(ctx.aggregation_inputs))
            }
            ProofPayload::Obfuscation(proofs) => proofs.values().try_for_each(ObfuscationProof::verify),
            ProofPayload::KeySwitch(claims) => {
                let node_key = ctx.submitter_key.ok_or_else(|| fail("unknown submitter"))?;
                claims.values().try_for_each(|c| c.verify(node_key, ctx.querier_key))
            }
        }
    }
}

/// `#[serde(with = "points_hex")]` for point lists.
mod points_hex {
    use crate::types::{point_from_hex, point_to_hex};
    use ark_bn254::G1Projective;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(ps: &[G1Projective], s: S) -> Result<S::Ok, S::Error> {
        ps.iter().map(point_to_hex).collect::<Vec<_>>().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<G1Projective>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|h| point_from_hex(h).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elgamal::{encrypt_int_vector, key_switch_share, DecryptionTable, KeyPair};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn aggregation_claim_is_checked_by_recomputation() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let kp = KeyPair::generate(&mut rng);
        let a = encrypt_int_vector(&kp.public, &[1, 2], &mut rng);
        let b = encrypt_int_vector(&kp.public, &[3, 4], &mut rng);
        let mut sum = a.clone();
        sum.add_assign(&b).unwrap();

        let claim = AggregationClaim {
            inputs: vec![a.clone(), b],
            output: sum,
        };
        claim.verify(2).unwrap();
        assert!(claim.verify(3).is_err());

        let bad = AggregationClaim {
            inputs: vec![a.clone()],
            output: claim.output.clone(),
        };
        assert!(bad.verify(1).is_err());
    }

    #[test]
    fn empty_aggregation_payloads_are_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let kp = KeyPair::generate(&mut rng);
        let groups = vec!["[0]".to_string()];
        let ctx = VerifyContext {
            range_vk: None,
            range_pvk: None,
            bounds: &[],
            joint_key: &kp.public,
            querier_key: &kp.public,
            submitter_key: None,
            groups: &groups,
            aggregation_inputs: 1,
        };

        assert!(ProofPayload::Aggregation(BTreeMap::new()).verify(&ctx).is_err());

        let zero = CipherVector(vec![Ciphertext::zero()]);
        let hollow = AggregationClaim {
            inputs: Vec::new(),
            output: zero.clone(),
        };
        let payload = ProofPayload::Aggregation(BTreeMap::from([("[0]".to_string(), hollow)]));
        assert!(payload.verify(&ctx).is_err());

        let honest = AggregationClaim {
            inputs: vec![zero.clone()],
            output: zero,
        };
        let payload = ProofPayload::Aggregation(BTreeMap::from([("[0]".to_string(), honest)]));
        payload.verify(&ctx).unwrap();
    }

    #[test]
    fn obfuscation_keeps_zeroes_and_proves() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let kp = KeyPair::generate(&mut rng);
        let input = encrypt_int_vector(&kp.public, &[0, 3], &mut rng);
        let (out, proof) = ObfuscationProof::obfuscate(&mut rng, &input);
        proof.verify().unwrap();
        assert!(crate::elgamal::decrypt_check_zero(&kp.secret, &out.0[0]));
        assert!(!crate::elgamal::decrypt_check_zero(&kp.secret, &out.0[1]));

        let mut tampered = proof.clone();
        tampered.output.0.swap(0, 1);
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn shuffle_preserves_multiset_and_sum() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let kp = KeyPair::generate(&mut rng);
        let table = DecryptionTable::new(50);
        let input = encrypt_int_vector(&kp.public, &[1, -2, 7, 0], &mut rng);
        let randomness = ShuffleRandomness::precompute(&mut rng, input.len());

        let (out, proof) = ShuffleProof::shuffle(&mut rng, &kp.public, &input, &randomness).unwrap();
        proof.verify(&kp.public).unwrap();

        let mut values = table.decrypt_int_vector(&kp.secret, &out).unwrap();
        values.sort();
        assert_eq!(values, vec![-2, 0, 1, 7]);

        let other = KeyPair::generate(&mut rng);
        assert!(proof.verify(&other.public).is_err());
    }

    #[test]
    fn key_switch_claim_binds_node_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let node = KeyPair::generate(&mut rng);
        let querier = KeyPair::generate(&mut rng);
        let cts = encrypt_int_vector(&node.public, &[5], &mut rng);

        let (share, v) = key_switch_share(&node.secret, &querier.public, &cts.0[0].k, &mut rng);
        let proof = KeySwitchProof::prove(
            node.secret.0,
            v,
            &node.public.0,
            &querier.public.0,
            &cts.0[0].k,
            &share,
            &mut rng,
        );
        let claim = KeySwitchClaim {
            node_key: node.public,
            target: querier.public,
            ks: vec![cts.0[0].k],
            shares: vec![share],
            proofs: vec![proof],
        };
        claim.verify(&node.public, &querier.public).unwrap();

        let impostor = KeyPair::generate(&mut rng);
        assert!(claim.verify(&impostor.public, &querier.public).is_err());
    }

    #[test]
    fn payload_serializes_with_category_tag() {
        let payload = ProofPayload::Aggregation(BTreeMap::new());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["category"], "aggregation");
        assert_eq!(payload.category(), ProofCategory::Aggregation);
    }
}
