//! Cryptographic layer for the verifiable survey network.
//!
//! This crate contains:
//! - Exponential EC-ElGamal over BN254 with the node-side transforms the protocol needs
//!   (re-randomisation, blinding, key switching).
//! - A Groth16 range circuit binding a Poseidon commitment to a bounded value.
//! - Sigma-protocol proofs (DLEQ, key switch) made non-interactive with a Poseidon transcript.
//! - The proof payloads exchanged between nodes, and their verification.

pub mod circuit;
pub mod constants;
pub mod dleq;
pub mod elgamal;
pub mod groth16;
pub mod proofs;
pub mod transcript;
pub mod types;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("plaintext outside the decryption table [-{limit}, {limit}]")]
    DecryptionOutOfRange { limit: i64 },

    #[error("range ({u}, {l}) does not fit the range circuit")]
    RangeTooWide { u: u64, l: u32 },

    #[error("value {value} outside [0, {max}]")]
    ValueOutOfRange { value: i64, max: u64 },

    #[error("proof verification failed: {0}")]
    VerificationFailed(String),

    #[error("arkworks error: {0}")]
    Ark(String),
}
