//! Crate-wide constants used by the range circuit, the transcripts and the cryptosystem.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ff::PrimeField;

/// Number of bits a range-checked value (and its distance to the upper bound) must fit in.
///
/// Ranges `(u, l)` are accepted only when `u^l - 1 < 2^RANGE_BITS`.
pub const RANGE_BITS: usize = 32;

/// Default half-width of the decryption lookup table: plaintexts in `[-limit, limit]`
/// decrypt to an integer, anything else is reported as out of range.
pub const DEFAULT_DECRYPTION_LIMIT: i64 = 10_000;

/// Domain separators absorbed first into every Fiat-Shamir transcript.
pub const DOMAIN_DLEQ: &[u8] = b"survey/dleq/v1";
pub const DOMAIN_KEY_SWITCH: &[u8] = b"survey/keyswitch/v1";
pub const DOMAIN_BLOCK: &[u8] = b"survey/ledger-block/v1";

// Poseidon sponge configuration.
//
// Width-3 sponge (rate=2, capacity=1): the range commitment absorbs exactly (value, blinding).
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;

pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent (alpha).
pub const POSEIDON_ALPHA: u64 = 5;

/// Deterministically derive Poseidon parameters for BN254::Fr.
///
/// The native sponge (commitments, transcripts) and the in-circuit gadget must agree on
/// these constants.
pub fn poseidon_config() -> PoseidonConfig<Fr> {
    let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
        prime_bits,
        POSEIDON_RATE,
        POSEIDON_FULL_ROUNDS as u64,
        POSEIDON_PARTIAL_ROUNDS as u64,
        0,
    );

    PoseidonConfig::new(
        POSEIDON_FULL_ROUNDS,
        POSEIDON_PARTIAL_ROUNDS,
        POSEIDON_ALPHA,
        mds,
        ark,
        POSEIDON_RATE,
        POSEIDON_CAPACITY,
    )
}
