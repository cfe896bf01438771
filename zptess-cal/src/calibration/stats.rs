//! Robust per-channel statistics
//!
//! Outlier rejection keeps the interquartile window: samples sorted by
//! magnitude, the lowest and highest quarter (rounded down) dropped. This
//! removes glare and occlusion spikes without a parametric noise model.

use zptess_common::db::{ChannelStats, Sample};

/// Retained central samples, sorted by magnitude
///
/// Samples with a non-finite magnitude (reading at or below the dark
/// frequency) are discarded before trimming.
pub fn interquartile(samples: &[Sample]) -> Vec<&Sample> {
    let mut finite: Vec<&Sample> = samples.iter().filter(|s| s.magnitude.is_finite()).collect();
    finite.sort_by(|a, b| a.magnitude.total_cmp(&b.magnitude));

    let cut = finite.len() / 4;
    let end = finite.len() - cut;
    finite.drain(cut..end).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample (n − 1) standard deviation; 0 for a single value
pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() == 1 {
        return Some(0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Statistics over the interquartile window, `None` if nothing survives
pub fn channel_stats(samples: &[Sample]) -> Option<ChannelStats> {
    let retained = interquartile(samples);
    let mags: Vec<f64> = retained.iter().map(|s| s.magnitude).collect();
    let freqs: Vec<f64> = retained.iter().map(|s| s.frequency).collect();

    Some(ChannelStats {
        mean: mean(&mags)?,
        stddev: sample_stddev(&mags)?,
        n: retained.len(),
        frequency: mean(&freqs)?,
    })
}

/// Most frequent value at 0.01 resolution, else the low median
pub fn best_value(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut rounded: Vec<i64> = values.iter().map(|v| (v * 100.0).round() as i64).collect();
    rounded.sort_unstable();

    // Run-length count over the sorted values
    let mut runs: Vec<(i64, usize)> = Vec::new();
    for v in &rounded {
        match runs.last_mut() {
            Some((last, count)) if last == v => *count += 1,
            _ => runs.push((*v, 1)),
        }
    }

    let top = runs.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let modes: Vec<i64> = runs.iter().filter(|(_, c)| *c == top).map(|(v, _)| *v).collect();

    let picked = if modes.len() == 1 {
        modes[0]
    } else {
        rounded[(rounded.len() - 1) / 2]
    };
    Some(picked as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use zptess_common::db::Channel;

    fn samples(mags: &[f64]) -> Vec<Sample> {
        mags.iter()
            .enumerate()
            .map(|(i, m)| Sample {
                channel: Channel::Reference,
                sequence_no: i as u64 + 1,
                timestamp: Utc::now(),
                frequency: 10.0 + i as f64,
                magnitude: *m,
            })
            .collect()
    }

    #[test]
    fn test_interquartile_drops_spikes() {
        let s = samples(&[18.0, 25.0, 18.1, 11.0, 18.2]);
        let kept: Vec<f64> = interquartile(&s).iter().map(|s| s.magnitude).collect();
        assert_eq!(kept, vec![18.0, 18.1, 18.2]);
    }

    #[test]
    fn test_interquartile_small_windows_keep_everything() {
        for n in 1..=3 {
            let s = samples(&vec![18.0; n]);
            assert_eq!(interquartile(&s).len(), n);
        }
        assert_eq!(interquartile(&samples(&[1.0, 2.0, 3.0, 4.0])).len(), 2);
    }

    #[test]
    fn test_non_finite_magnitudes_discarded() {
        let s = samples(&[18.0, f64::NAN, 18.2, f64::INFINITY]);
        let stats = channel_stats(&s).unwrap();
        assert_eq!(stats.n, 2);
        assert!((stats.mean - 18.1).abs() < 1e-12);
    }

    #[test]
    fn test_channel_stats_none_when_nothing_retained() {
        assert!(channel_stats(&samples(&[f64::NAN])).is_none());
        assert!(channel_stats(&[]).is_none());
    }

    #[test]
    fn test_sample_stddev() {
        let sd = sample_stddev(&[20.0, 20.5, 19.6]).unwrap();
        assert!((sd - 0.4509).abs() < 1e-4);
        assert_eq!(sample_stddev(&[3.0]), Some(0.0));
        assert_eq!(sample_stddev(&[]), None);
    }

    #[test]
    fn test_best_value_prefers_unique_mode() {
        assert_eq!(best_value(&[20.12, 20.15, 20.12, 20.10]), Some(20.12));
    }

    #[test]
    fn test_best_value_falls_back_to_low_median() {
        // No repeated value: low median of [20.10, 20.12, 20.15, 20.20]
        assert_eq!(best_value(&[20.20, 20.12, 20.15, 20.10]), Some(20.12));
        // Two modes tie: low median again
        assert_eq!(best_value(&[20.1, 20.1, 20.3, 20.3]), Some(20.1));
        assert_eq!(best_value(&[]), None);
    }
}
