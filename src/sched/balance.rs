use std::collections::VecDeque;

/// Recommend a batch size from a client's recent throughput.
///
/// `samples` holds jobs-per-second figures newest first; `weights` is the
/// configured newest-first weighting (summing to 1 over a full ring). With
/// partial history the used weights are renormalized so a young client is
/// not dragged toward zero. The result is the weighted mean throughput
/// times the ideal contact interval, rounded, floored at 1. A client with
/// no samples gets the static default.
pub fn recommended_batch(
    samples: &VecDeque<f64>,
    weights: &[f64],
    ideal_interval_secs: u64,
    default_size: usize,
) -> usize {
    let used = samples.len().min(weights.len());
    if used == 0 {
        return default_size;
    }
    let weight_sum: f64 = weights[..used].iter().sum();
    if weight_sum <= 0.0 {
        return default_size;
    }
    let mean: f64 = samples
        .iter()
        .take(used)
        .zip(&weights[..used])
        .map(|(s, w)| s * w)
        .sum::<f64>()
        / weight_sum;
    let size = (mean * ideal_interval_secs as f64 + 0.5) as usize;
    size.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEIGHTS: [f64; 5] = [0.2, 0.2, 0.2, 0.2, 0.2];

    #[test]
    fn no_samples_gives_default() {
        let samples = VecDeque::new();
        assert_eq!(recommended_batch(&samples, &WEIGHTS, 60, 100), 100);
    }

    #[test]
    fn steady_throughput() {
        // 2 jobs per second, 60 second interval: 120 jobs.
        let samples: VecDeque<f64> = vec![2.0; 5].into();
        assert_eq!(recommended_batch(&samples, &WEIGHTS, 60, 100), 120);
    }

    #[test]
    fn partial_history_renormalizes() {
        // One sample must count at full weight, not one fifth.
        let samples: VecDeque<f64> = vec![1.0].into();
        assert_eq!(recommended_batch(&samples, &WEIGHTS, 60, 100), 60);
    }

    #[test]
    fn skewed_weights_favor_recent() {
        let weights = [0.6, 0.1, 0.1, 0.1, 0.1];
        // Recent collapse from 10/s to 1/s.
        let samples: VecDeque<f64> = vec![1.0, 10.0, 10.0, 10.0, 10.0].into();
        let flat = recommended_batch(&samples, &WEIGHTS, 60, 100);
        let skewed = recommended_batch(&samples, &weights, 60, 100);
        assert!(skewed < flat);
    }

    #[test]
    fn floor_at_one() {
        let samples: VecDeque<f64> = vec![0.0; 5].into();
        assert_eq!(recommended_batch(&samples, &WEIGHTS, 60, 100), 1);
    }

    #[test]
    fn rounding_is_nearest() {
        // 0.0249.. per second over 60s = 1.49 -> 1; 0.0251 -> 1.506 -> 2
        let lo: VecDeque<f64> = vec![0.0249].into();
        let hi: VecDeque<f64> = vec![0.0251].into();
        assert_eq!(recommended_batch(&lo, &WEIGHTS, 60, 100), 1);
        assert_eq!(recommended_batch(&hi, &WEIGHTS, 60, 100), 2);
    }
}
