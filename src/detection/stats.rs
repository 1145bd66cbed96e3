//! Small descriptive statistics shared by the spike detector and the
//! predictive scorer.

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population standard deviation.
pub fn stddev(samples: &[f64]) -> Option<f64> {
    let m = mean(samples)?;
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / samples.len() as f64;
    Some(variance.sqrt())
}

/// Deviation of `value` from the baseline in standard deviations, with the
/// baseline deviation floored at `min_std`.
pub fn z_score(value: f64, baseline: &[f64], min_std: f64) -> Option<f64> {
    let m = mean(baseline)?;
    let s = stddev(baseline)?.max(min_std);
    if s <= 0.0 {
        return None;
    }
    Some((value - m) / s)
}

/// Least-squares slope of `(x, y)` points. `None` with fewer than two
/// distinct x values.
pub fn slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let covariance: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let spread: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if spread == 0.0 {
        return None;
    }
    Some(covariance / spread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_stddev() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&samples), Some(5.0));
        assert_eq!(stddev(&samples), Some(2.0));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_z_score_floor() {
        let flat = [0.0; 10];
        assert_eq!(z_score(3.0, &flat, 1.0), Some(3.0));
        assert_eq!(z_score(3.0, &flat, 0.0), None);
    }

    #[test]
    fn test_slope() {
        let points = [(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)];
        assert!((slope(&points).unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(slope(&[(1.0, 1.0), (1.0, 2.0)]), None);
        assert_eq!(slope(&[(1.0, 1.0)]), None);
    }
}
