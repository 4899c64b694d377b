//! Policy normalization over board cells.

use tch::Tensor;

use crate::neural::layers::{Layer, SpatialSoftmax};
use crate::{Connect4NetError, Result};

/// Turns `[batch, 1, height, width]` logits into a per-batch distribution.
///
/// Each batch element is divided by the sum of its exponentials. The logits
/// are shifted by their maximum first, which leaves the result unchanged and
/// keeps `exp` from overflowing. A batch element whose largest logit is not
/// finite (all `-inf`, any `+inf`, or NaN) has no well-defined distribution
/// and is rejected with [`Connect4NetError::NumericInstability`].
pub fn normalize_policy(logits: &Tensor) -> Result<Tensor> {
    check_logits(logits)?;
    Ok(SpatialSoftmax.forward(logits))
}

/// Returns the first batch element whose logits cannot be normalized.
fn check_logits(logits: &Tensor) -> Result<()> {
    let (maxima, _) = logits.flatten(1, -1).max_dim(1, false);
    let maxima = Vec::<f32>::try_from(&maxima.flatten(0, -1))?;

    match maxima.iter().position(|max| !max.is_finite()) {
        Some(batch_index) => {
            log::warn!(
                "⚠️ Policy logits for batch element {} peak at {}",
                batch_index,
                maxima[batch_index]
            );
            Err(Connect4NetError::NumericInstability { batch_index })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tch::{Device, Kind};

    #[test]
    fn test_distribution_is_non_negative_and_sums_to_one() {
        let logits = Tensor::randn([4, 1, 8, 7], (Kind::Float, Device::Cpu)) * 10.0;
        let policy = normalize_policy(&logits).unwrap();

        let values = Vec::<f32>::try_from(&policy.flatten(0, -1)).unwrap();
        for row in values.chunks(8 * 7) {
            assert!(row.iter().all(|&p| p >= 0.0));
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum was {sum}");
        }
    }

    #[test]
    fn test_large_logits_do_not_overflow() {
        let logits = Tensor::full([1, 1, 8, 7], 1000.0, (Kind::Float, Device::Cpu));
        let policy = normalize_policy(&logits).unwrap();

        let values = Vec::<f32>::try_from(&policy.flatten(0, -1)).unwrap();
        for p in values {
            assert!((p - 1.0 / 56.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_all_negative_infinity_is_rejected() {
        let finite = Tensor::zeros([1, 1, 8, 7], (Kind::Float, Device::Cpu));
        let degenerate = Tensor::full([1, 1, 8, 7], f64::NEG_INFINITY, (Kind::Float, Device::Cpu));
        let logits = Tensor::cat(&[finite, degenerate], 0);

        let err = normalize_policy(&logits).unwrap_err();
        assert_matches!(err, Connect4NetError::NumericInstability { batch_index: 1 });
    }

    #[test]
    fn test_nan_logits_are_rejected() {
        let logits = Tensor::full([2, 1, 8, 7], f64::NAN, (Kind::Float, Device::Cpu));
        assert_matches!(
            normalize_policy(&logits),
            Err(Connect4NetError::NumericInstability { batch_index: 0 })
        );
    }

    #[test]
    fn test_single_masked_cell_gets_zero_mass() {
        let logits = Tensor::zeros([1, 1, 8, 7], (Kind::Float, Device::Cpu));
        let _ = logits.get(0).get(0).get(0).get(0).fill_(f64::NEG_INFINITY);
        let policy = normalize_policy(&logits).unwrap();

        let values = Vec::<f32>::try_from(&policy.flatten(0, -1)).unwrap();
        assert_eq!(values[0], 0.0);
        assert!((values[1] - 1.0 / 55.0).abs() < 1e-6);
    }
}
