//! Failure oracles: `(definition, history) -> RiskScore`

use async_trait::async_trait;
use clnrm_common::{Error, Result, RiskScore, RunRecord, TestDefinition};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait FailureOracle: Send + Sync {
    fn name(&self) -> &str;

    /// Score one test given its history, oldest record first
    async fn score(&self, definition: &TestDefinition, history: &[RunRecord]) -> Result<RiskScore>;
}

/// Recency-weighted failure rate over the run history
///
/// Ages are measured from the newest record in the history rather than the
/// wall clock, so the same history always scores the same.
pub struct HistoricalOracle {
    half_life_days: f64,
}

impl HistoricalOracle {
    pub fn new(half_life_days: f64) -> Self {
        Self {
            half_life_days: half_life_days.max(f64::EPSILON),
        }
    }

    /// Samples needed before the score is trusted halfway
    const HALF_CONFIDENCE_SAMPLES: f64 = 4.0;
}

#[async_trait]
impl FailureOracle for HistoricalOracle {
    fn name(&self) -> &str {
        "historical"
    }

    async fn score(&self, _definition: &TestDefinition, history: &[RunRecord]) -> Result<RiskScore> {
        let samples: Vec<&RunRecord> = history.iter().filter(|r| r.is_judged()).collect();
        let Some(newest) = samples.iter().map(|r| r.finished_at).max() else {
            return Ok(RiskScore::default());
        };

        let (mut weighted_failures, mut total_weight) = (0.0, 0.0);
        for record in &samples {
            let age_days = (newest - record.finished_at).num_seconds().max(0) as f64 / 86_400.0;
            let weight = 0.5f64.powf(age_days / self.half_life_days);
            total_weight += weight;
            if record.counts_as_failure() {
                weighted_failures += weight;
            }
        }

        let n = samples.len() as f64;
        Ok(RiskScore {
            score: if total_weight > 0.0 {
                weighted_failures / total_weight
            } else {
                0.0
            },
            confidence: n / (n + Self::HALF_CONFIDENCE_SAMPLES),
            samples: samples.len(),
        })
    }
}

/// What the remote oracle is sent for one test
#[derive(Debug, Serialize)]
struct OracleRequest<'a> {
    test_name: &'a str,
    tags: &'a [String],
    services: usize,
    steps: usize,
    runs: usize,
    failures: usize,
    avg_duration_ms: u64,
    /// Newest last, "pass" / "fail"
    recent_verdicts: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct OracleResponse {
    score: f64,
    #[serde(default)]
    confidence: Option<f64>,
}

/// External scoring service reached over HTTP
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOracle {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::infrastructure(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cheap reachability check used by `health`
    pub async fn probe(&self) -> Result<()> {
        self.client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| Error::infrastructure(format!("oracle {} unreachable: {}", self.endpoint, e)))?;
        Ok(())
    }
}

#[async_trait]
impl FailureOracle for HttpOracle {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, definition: &TestDefinition, history: &[RunRecord]) -> Result<RiskScore> {
        let samples: Vec<&RunRecord> = history.iter().filter(|r| r.is_judged()).collect();
        let failures = samples.iter().filter(|r| r.counts_as_failure()).count();
        let avg_duration_ms = if samples.is_empty() {
            0
        } else {
            samples.iter().map(|r| r.duration_ms()).sum::<u64>() / samples.len() as u64
        };
        let recent_verdicts = samples
            .iter()
            .rev()
            .take(20)
            .rev()
            .map(|r| if r.counts_as_failure() { "fail" } else { "pass" })
            .collect();

        let request = OracleRequest {
            test_name: &definition.name,
            tags: &definition.tags,
            services: definition.services.len(),
            steps: definition.steps.len(),
            runs: samples.len(),
            failures,
            avg_duration_ms,
            recent_verdicts,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::infrastructure(format!("oracle request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::infrastructure(format!(
                "oracle returned {}",
                resp.status()
            )));
        }
        let body: OracleResponse = resp
            .json()
            .await
            .map_err(|e| Error::infrastructure(format!("oracle response: {}", e)))?;
        if !body.score.is_finite() {
            return Err(Error::infrastructure("oracle returned a non-finite score"));
        }

        debug!("Oracle scored {} at {:.2}", definition.name, body.score);
        Ok(RiskScore {
            score: body.score.clamp(0.0, 1.0),
            confidence: body.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
            samples: samples.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use clnrm_common::{FailureCause, ResourceUsage, StepFailure, TraceBundleRef, Verdict};

    pub(crate) fn record(test: &str, day: i64, verdict: Verdict) -> RunRecord {
        let base: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let started_at = base + chrono::Duration::days(day);
        RunRecord {
            run_id: format!("{}-{}", test, day),
            test_name: test.to_string(),
            started_at,
            finished_at: started_at + chrono::Duration::seconds(2),
            step_results: Vec::new(),
            assertions: Vec::new(),
            verdict,
            resources: ResourceUsage::new(0.5, 256.0),
            trace: TraceBundleRef::default(),
        }
    }

    pub(crate) fn failed() -> Verdict {
        Verdict::Fail(FailureCause::Step {
            step: "s".into(),
            failure: StepFailure::OutputMismatch { pattern: "x".into() },
        })
    }

    fn definition() -> TestDefinition {
        TestDefinition::from_toml("[metadata]\nname = \"t\"\n[[steps]]\nname = \"s\"\ncommand = [\"true\"]\n")
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_history_scores_zero() {
        let score = HistoricalOracle::new(7.0).score(&definition(), &[]).await.unwrap();
        assert_eq!(score, RiskScore::default());
    }

    #[tokio::test]
    async fn test_recent_failures_weigh_more() {
        let oracle = HistoricalOracle::new(7.0);
        let recent_fail = vec![
            record("t", 0, Verdict::Pass),
            record("t", 14, failed()),
        ];
        let old_fail = vec![
            record("t", 0, failed()),
            record("t", 14, Verdict::Pass),
        ];

        let recent = oracle.score(&definition(), &recent_fail).await.unwrap();
        let old = oracle.score(&definition(), &old_fail).await.unwrap();
        assert!(recent.score > 0.5);
        assert!(old.score < 0.5);
        assert_eq!(recent.samples, 2);
        assert!((recent.score + old.score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_runs_are_not_samples() {
        let oracle = HistoricalOracle::new(7.0);
        let history = vec![
            record("t", 0, Verdict::Cancelled),
            record("t", 1, Verdict::Invalid("bad".into())),
            record("t", 2, Verdict::Pass),
        ];
        let score = oracle.score(&definition(), &history).await.unwrap();
        assert_eq!(score.samples, 1);
        assert_eq!(score.score, 0.0);
    }

    #[tokio::test]
    async fn test_errored_runs_carry_no_risk() {
        let oracle = HistoricalOracle::new(7.0);
        let outage: Vec<_> = (0..6)
            .map(|d| record("t", d, Verdict::Error("runtime unreachable".into())))
            .collect();
        assert_eq!(oracle.score(&definition(), &outage).await.unwrap(), RiskScore::default());

        let mut mixed = outage;
        mixed.push(record("t", 7, Verdict::Pass));
        let score = oracle.score(&definition(), &mixed).await.unwrap();
        assert_eq!(score.samples, 1);
        assert_eq!(score.score, 0.0);
    }

    #[tokio::test]
    async fn test_confidence_grows_with_samples() {
        let oracle = HistoricalOracle::new(7.0);
        let few: Vec<_> = (0..2).map(|d| record("t", d, Verdict::Pass)).collect();
        let many: Vec<_> = (0..20).map(|d| record("t", d, Verdict::Pass)).collect();
        let few = oracle.score(&definition(), &few).await.unwrap();
        let many = oracle.score(&definition(), &many).await.unwrap();
        assert!(many.confidence > few.confidence);
        assert!(many.confidence < 1.0);
    }

    #[tokio::test]
    async fn test_http_oracle_unreachable() {
        let oracle = HttpOracle::new("http://127.0.0.1:9/score", Duration::from_millis(200)).unwrap();
        let err = oracle.score(&definition(), &[]).await.unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
    }
}
