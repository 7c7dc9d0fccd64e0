//! Derived metrics: pure functions over already-validated numeric columns.
//!
//! Callers guarantee equal lengths, finite inputs and non-zero denominators;
//! these functions do no checking of their own.

/// Element-wise `a - b`.
pub fn delta(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

/// Element-wise `numerator / denominator`.
pub fn ratio(numerator: &[f64], denominator: &[f64]) -> Vec<f64> {
    numerator
        .iter()
        .zip(denominator)
        .map(|(n, d)| n / d)
        .collect()
}

/// Growth from the first to the last value: `last / first - 1`.
pub fn growth_rate(first: f64, last: f64) -> f64 {
    last / first - 1.0
}

/// Period-over-period growth: one value per consecutive pair.
pub fn period_growth(series: &[f64]) -> Vec<f64> {
    series
        .windows(2)
        .map(|w| growth_rate(w[0], w[1]))
        .collect()
}

/// Arithmetic mean.
pub fn mean(series: &[f64]) -> f64 {
    series.iter().sum::<f64>() / series.len() as f64
}

/// Each value as a fraction of the column total.
pub fn share(series: &[f64]) -> Vec<f64> {
    let total: f64 = series.iter().sum();
    series.iter().map(|v| v / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn delta_and_ratio() {
        assert_eq!(delta(&[5.0, 3.0], &[2.0, 4.0]), vec![3.0, -1.0]);
        assert_eq!(ratio(&[6.0, 1.0], &[3.0, 4.0]), vec![2.0, 0.25]);
    }

    #[test]
    fn growth() {
        assert!(close(growth_rate(80.0, 100.0), 0.25));
        let pg = period_growth(&[100.0, 110.0, 99.0]);
        assert_eq!(pg.len(), 2);
        assert!(close(pg[0], 0.1));
        assert!(close(pg[1], -0.1));
    }

    #[test]
    fn mean_and_share() {
        assert!(close(mean(&[1.0, 2.0, 6.0]), 3.0));
        assert_eq!(share(&[1.0, 3.0]), vec![0.25, 0.75]);
    }
}
