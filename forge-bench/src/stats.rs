use serde::Serialize;

/// Descriptive statistics over timing samples in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub stddev: f64,
    pub cv_percent: f64,
    pub sample_count: usize,
    pub outliers_removed: usize,
}

impl Stats {
    /// Summarize `samples` after dropping values outside the Tukey fences
    /// `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]`. Fewer than two survivors keeps the
    /// unfiltered set.
    pub fn from_samples(samples: &[f64]) -> Stats {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let (q1, q3) = (percentile(&sorted, 25.0), percentile(&sorted, 75.0));
        let fence = 1.5 * (q3 - q1);
        let kept: Vec<f64> = sorted
            .iter()
            .copied()
            .filter(|v| (q1 - fence..=q3 + fence).contains(v))
            .collect();
        let data = if kept.len() >= 2 { kept } else { sorted };

        let n = data.len();
        if n == 0 {
            return Stats::empty();
        }
        let mean = data.iter().sum::<f64>() / n as f64;
        let stddev = if n > 1 {
            (data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        Stats {
            mean,
            median: percentile(&data, 50.0),
            min: data[0],
            max: data[n - 1],
            p95: percentile(&data, 95.0),
            stddev,
            cv_percent: if mean > 0.0 { stddev / mean * 100.0 } else { 0.0 },
            sample_count: n,
            outliers_removed: samples.len() - n,
        }
    }

    fn empty() -> Stats {
        Stats {
            mean: 0.0,
            median: 0.0,
            min: 0.0,
            max: 0.0,
            p95: 0.0,
            stddev: 0.0,
            cv_percent: 0.0,
            sample_count: 0,
            outliers_removed: 0,
        }
    }
}

/// Linear-interpolated percentile (0-100) of an ascending slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = pct / 100.0 * (len - 1) as f64;
            let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
