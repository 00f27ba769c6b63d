//! Differential-privacy noise list.
//!
//! The list is a deterministic quantisation of a Laplace distribution; which entries end up
//! added to the result is decided by the DRO shuffle chain, not here.

use crate::models::DiffPParams;
use rand::RngCore;
use survey_zk::elgamal::{encrypt_int_vector, CipherVector, PublicKey};

/// Inverse CDF of Laplace(mean, b).
fn laplace_quantile(p: f64, mean: f64, b: f64) -> f64 {
    let centered = p - 0.5;
    mean - b * centered.signum() * (1.0 - 2.0 * centered.abs()).ln()
}

fn quantize(x: f64, quanta: f64) -> f64 {
    if quanta > 0.0 {
        (x / quanta).round() * quanta
    } else {
        x
    }
}

/// `noise_list_size` values at evenly spaced Laplace quantiles, clamped to `±limit`,
/// rounded to `quanta` and multiplied by `scale` (0 is treated as 1).
pub fn generate_noise_values(params: &DiffPParams) -> Vec<i64> {
    let n = params.noise_list_size;
    let scale = if params.scale == 0.0 { 1.0 } else { params.scale };
    let limit = params.limit.abs();

    (0..n)
        .map(|i| {
            let p = (i as f64 + 0.5) / n as f64;
            let mut x = laplace_quantile(p, params.lap_mean, params.lap_scale);
            if limit > 0.0 {
                x = x.clamp(-limit, limit);
            }
            (quantize(x, params.quanta) * scale).round() as i64
        })
        .collect()
}

/// Encrypt the noise list under the collective key.
pub fn encrypted_noise_list<R: RngCore>(params: &DiffPParams, joint: &PublicKey, rng: &mut R) -> CipherVector {
    let values = generate_noise_values(params);
    tracing::debug!(size = values.len(), "noise list generated");
    encrypt_int_vector(joint, &values, rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DiffPParams {
        DiffPParams {
            lap_mean: 0.0,
            lap_scale: 15.0,
            noise_list_size: 10,
            quanta: 1.0,
            scale: 1.0,
            limit: 60.0,
        }
    }

    #[test]
    fn list_is_bounded_ordered_and_centred() {
        let values = generate_noise_values(&params());
        assert_eq!(values.len(), 10);
        assert!(values.iter().all(|v| v.abs() <= 60));
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values[0] < 0 && values[9] > 0);
        assert!((values[0] + values[9]).abs() <= 1);
    }

    #[test]
    fn limit_clamps_the_tails() {
        let mut p = params();
        p.noise_list_size = 1000;
        p.limit = 5.0;
        let values = generate_noise_values(&p);
        assert_eq!(*values.iter().max().unwrap(), 5);
        assert_eq!(*values.iter().min().unwrap(), -5);
    }

    #[test]
    fn zero_scale_means_unit_scale() {
        let mut p = params();
        let unit = generate_noise_values(&p);
        p.scale = 0.0;
        assert_eq!(generate_noise_values(&p), unit);
        p.scale = 2.0;
        let doubled = generate_noise_values(&p);
        assert!(unit.iter().zip(&doubled).all(|(a, b)| 2 * a == *b));
    }

    #[test]
    fn quanta_rounds_to_multiples() {
        let mut p = params();
        p.quanta = 4.0;
        assert!(generate_noise_values(&p).iter().all(|v| v % 4 == 0));
    }
}
