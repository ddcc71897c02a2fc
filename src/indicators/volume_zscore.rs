// =============================================================================
// Volume Z-Score over a trailing window
// =============================================================================

/// Z-score of the most recent volume against the trailing `period` bars
/// (population standard deviation, matching the other indicators' convention).
/// Returns `None` when fewer than `period` samples are available or the
/// window has zero variance.
pub fn calculate_volume_zscore(volumes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || volumes.is_empty() {
        return vec![None; volumes.len()];
    }

    let mut out = Vec::with_capacity(volumes.len());
    for i in 0..volumes.len() {
        if i + 1 < period {
            out.push(None);
            continue;
        }
        let window = &volumes[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();

        if std_dev < f64::EPSILON || !std_dev.is_finite() {
            out.push(None);
            continue;
        }
        let current = volumes[i];
        out.push(Some((current - mean) / std_dev));
    }
    out
}

pub fn current_volume_zscore(volumes: &[f64], period: usize) -> Option<f64> {
    calculate_volume_zscore(volumes, period).last().copied().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_is_none() {
        assert_eq!(calculate_volume_zscore(&[1.0, 2.0], 5), vec![None, None]);
    }

    #[test]
    fn constant_volume_has_no_defined_zscore() {
        let volumes = vec![10.0; 5];
        let out = calculate_volume_zscore(&volumes, 5);
        assert_eq!(out[4], None);
    }

    #[test]
    fn spike_produces_large_positive_zscore() {
        let mut volumes = vec![10.0; 19];
        volumes.push(1000.0);
        let z = current_volume_zscore(&volumes, 20).unwrap();
        assert!(z > 3.0, "expected large z-score, got {z}");
    }

    #[test]
    fn below_average_produces_negative_zscore() {
        let mut volumes = vec![10.0; 19];
        volumes.push(1.0);
        let z = current_volume_zscore(&volumes, 20).unwrap();
        assert!(z < 0.0);
    }
}
