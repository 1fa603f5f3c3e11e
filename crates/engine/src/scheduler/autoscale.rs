//! Load prediction and worker scaling decisions

use clnrm_common::{ResourceUsage, RunRecord};
use serde::Serialize;
use std::time::Duration;

use crate::config::SchedulerConfig;

/// Smoothing factor of the moving average
const ALPHA: f64 = 0.3;
/// Fewer samples than this give no forecast
const MIN_SAMPLES: usize = 3;
const RECENT_WINDOW: usize = 5;
const OLDER_WINDOW: usize = 20;

/// Projected per-run footprint
#[derive(Debug, Clone, Serialize)]
pub struct LoadForecast {
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
    pub predicted: ResourceUsage,
    /// Relative growth of the recent window over the older one
    pub cpu_trend: f64,
    pub memory_trend: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "workers")]
pub enum ScalingDecision {
    ScaleUp(usize),
    ScaleDown(usize),
    Hold(usize),
}

impl ScalingDecision {
    pub fn workers(&self) -> usize {
        match self {
            ScalingDecision::ScaleUp(n) | ScalingDecision::ScaleDown(n) | ScalingDecision::Hold(n) => *n,
        }
    }
}

impl std::fmt::Display for ScalingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingDecision::ScaleUp(n) => write!(f, "scale up to {} worker(s)", n),
            ScalingDecision::ScaleDown(n) => write!(f, "scale down to {} worker(s)", n),
            ScalingDecision::Hold(n) => write!(f, "hold at {} worker(s)", n),
        }
    }
}

/// Exponential moving average over run resource snapshots
#[derive(Debug, Default)]
pub struct LoadPredictor {
    samples: Vec<ResourceUsage>,
}

impl LoadPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of the given runs, oldest first
    pub fn from_history(history: &[RunRecord]) -> Self {
        let mut records: Vec<&RunRecord> = history
            .iter()
            .filter(|r| r.resources.cpu_cores > 0.0 || r.resources.memory_mb > 0.0)
            .collect();
        records.sort_by_key(|r| r.started_at);
        Self {
            samples: records.into_iter().map(|r| r.resources).collect(),
        }
    }

    pub fn record(&mut self, usage: ResourceUsage) {
        self.samples.push(usage);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn average(&self, last_n: usize) -> ResourceUsage {
        let tail = &self.samples[self.samples.len().saturating_sub(last_n)..];
        let sum = tail.iter().fold(ResourceUsage::default(), |acc, u| acc + *u);
        let n = tail.len().max(1) as f64;
        ResourceUsage::new(sum.cpu_cores / n, sum.memory_mb / n)
    }

    /// Per-run footprint expected over the horizon
    pub fn predict(&self, horizon: Duration) -> Option<LoadForecast> {
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }

        let first = self.samples[0];
        let ema = self.samples[1..].iter().fold(first, |ema, u| {
            ResourceUsage::new(
                ALPHA * u.cpu_cores + (1.0 - ALPHA) * ema.cpu_cores,
                ALPHA * u.memory_mb + (1.0 - ALPHA) * ema.memory_mb,
            )
        });

        let recent = self.average(RECENT_WINDOW);
        let older = self.average(OLDER_WINDOW);
        let cpu_trend = (recent.cpu_cores - older.cpu_cores) / older.cpu_cores.max(1.0);
        let memory_trend = (recent.memory_mb - older.memory_mb) / older.memory_mb.max(1.0);

        Some(LoadForecast {
            horizon,
            predicted: ResourceUsage::new(
                (ema.cpu_cores * (1.0 + cpu_trend)).max(0.0),
                (ema.memory_mb * (1.0 + memory_trend)).max(0.0),
            ),
            cpu_trend,
            memory_trend,
            samples: self.samples.len(),
        })
    }
}

/// Workers whose predicted aggregate footprint stays under the ceilings
pub fn decide(forecast: &LoadForecast, current_workers: usize, config: &SchedulerConfig) -> ScalingDecision {
    let per_run = forecast.predicted;
    let by_cpu = if per_run.cpu_cores > 0.0 {
        (config.cpu_ceiling / per_run.cpu_cores).floor() as usize
    } else {
        config.max_workers
    };
    let by_memory = if per_run.memory_mb > 0.0 {
        (config.memory_ceiling_mb / per_run.memory_mb).floor() as usize
    } else {
        config.max_workers
    };
    let target = by_cpu
        .min(by_memory)
        .clamp(config.min_workers, config.max_workers.max(config.min_workers));

    match target.cmp(&current_workers) {
        std::cmp::Ordering::Greater => ScalingDecision::ScaleUp(target),
        std::cmp::Ordering::Less => ScalingDecision::ScaleDown(target),
        std::cmp::Ordering::Equal => ScalingDecision::Hold(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor(samples: &[(f64, f64)]) -> LoadPredictor {
        let mut p = LoadPredictor::new();
        for (cpu, mem) in samples {
            p.record(ResourceUsage::new(*cpu, *mem));
        }
        p
    }

    #[test]
    fn test_needs_minimum_samples() {
        assert!(predictor(&[(1.0, 100.0), (1.0, 100.0)])
            .predict(Duration::from_secs(600))
            .is_none());
    }

    #[test]
    fn test_steady_load() {
        let forecast = predictor(&[(1.0, 256.0); 6])
            .predict(Duration::from_secs(600))
            .unwrap();
        assert!((forecast.predicted.cpu_cores - 1.0).abs() < 1e-9);
        assert!((forecast.predicted.memory_mb - 256.0).abs() < 1e-9);
        assert_eq!(forecast.cpu_trend, 0.0);
    }

    #[test]
    fn test_rising_load_projects_higher() {
        let samples: Vec<(f64, f64)> = (0..12).map(|i| (1.0 + i as f64 * 0.25, 128.0)).collect();
        let forecast = predictor(&samples).predict(Duration::from_secs(600)).unwrap();
        assert!(forecast.cpu_trend > 0.0);
        assert!(forecast.predicted.cpu_cores > 2.0);
    }

    #[test]
    fn test_decide_against_ceiling() {
        let config = SchedulerConfig {
            cpu_ceiling: 4.0,
            memory_ceiling_mb: 4096.0,
            min_workers: 1,
            max_workers: 8,
            ..SchedulerConfig::default()
        };
        let forecast = predictor(&[(1.0, 256.0); 4]).predict(Duration::ZERO).unwrap();

        assert_eq!(decide(&forecast, 2, &config), ScalingDecision::ScaleUp(4));
        assert_eq!(decide(&forecast, 6, &config), ScalingDecision::ScaleDown(4));
        assert_eq!(decide(&forecast, 4, &config), ScalingDecision::Hold(4));
    }

    #[test]
    fn test_decide_clamps_to_bounds() {
        let config = SchedulerConfig {
            cpu_ceiling: 1.0,
            min_workers: 2,
            max_workers: 3,
            ..SchedulerConfig::default()
        };
        let forecast = predictor(&[(4.0, 64.0); 3]).predict(Duration::ZERO).unwrap();
        assert_eq!(decide(&forecast, 1, &config).workers(), 2);
    }
}
