use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A time-boxed period of load at a fixed number of in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Maximum requests in flight during this stage
    pub concurrency: u32,
    /// How long to keep admitting requests, e.g. "20s"
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Stage {
    pub fn new(concurrency: u32, duration: Duration) -> Self {
        Self {
            concurrency,
            duration,
        }
    }
}

/// Ordered stage list: stages run strictly in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_concurrency(&self) -> u32 {
        self.stages.iter().map(|s| s.concurrency).max().unwrap_or(0)
    }

    /// Reject plans the driver cannot run: no stages, or a stage that
    /// admits nothing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("stage plan is empty");
        }
        if let Some(idx) = self.stages.iter().position(|s| s.concurrency == 0) {
            anyhow::bail!("stage {idx} has zero concurrency");
        }
        Ok(())
    }
}

impl From<Vec<Stage>> for StagePlan {
    fn from(stages: Vec<Stage>) -> Self {
        Self::new(stages)
    }
}

/// Parse a compact stage list such as `"2x20s,100x20s,2x20s"`.
pub fn parse_stages(spec: &str) -> anyhow::Result<StagePlan> {
    let mut stages = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (concurrency, duration) = part
            .split_once(['x', '@'])
            .ok_or_else(|| anyhow::anyhow!("stage '{part}' must look like <concurrency>x<duration>"))?;
        let concurrency: u32 = concurrency
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid concurrency in '{part}': {e}"))?;
        let duration = humantime::parse_duration(duration.trim())
            .map_err(|e| anyhow::anyhow!("invalid duration in '{part}': {e}"))?;
        stages.push(Stage::new(concurrency, duration));
    }
    let plan = StagePlan::new(stages);
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> StagePlan {
        StagePlan::new(vec![
            Stage::new(2, Duration::from_secs(5)),
            Stage::new(100, Duration::from_secs(10)),
        ])
    }

    #[test]
    fn test_total_duration() {
        assert_eq!(plan().total_duration(), Duration::from_secs(15));
        assert_eq!(plan().max_concurrency(), 100);
    }

    #[test]
    fn test_stages_keep_insertion_order() {
        let plan = plan();
        let stages = plan.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].concurrency, 2);
        assert_eq!(stages[1].concurrency, 100);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let plan = StagePlan::new(vec![
            Stage::new(2, Duration::from_secs(1)),
            Stage::new(0, Duration::from_secs(1)),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("stage 1"));
        assert!(StagePlan::default().validate().is_err());
    }

    #[test]
    fn test_zero_duration_stage_is_legal() {
        let plan = StagePlan::new(vec![Stage::new(3, Duration::ZERO)]);
        assert!(plan.validate().is_ok());
        assert_eq!(plan.total_duration(), Duration::ZERO);
    }

    #[test]
    fn test_parse_stages() {
        let plan = parse_stages("2x20s, 100x1m,2@500ms").unwrap();
        assert_eq!(
            plan.stages(),
            &[
                Stage::new(2, Duration::from_secs(20)),
                Stage::new(100, Duration::from_secs(60)),
                Stage::new(2, Duration::from_millis(500)),
            ]
        );
    }

    #[test]
    fn test_parse_stages_errors() {
        assert!(parse_stages("20s").is_err());
        assert!(parse_stages("ax20s").is_err());
        assert!(parse_stages("2xsoon").is_err());
        assert!(parse_stages("0x1s").is_err());
        assert!(parse_stages("").is_err());
    }

    #[test]
    fn test_stage_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            stages: StagePlan,
        }
        let w: Wrapper = toml::from_str(
            r#"
[[stages]]
concurrency = 2
duration = "20s"

[[stages]]
concurrency = 100
duration = "1m 30s"
            "#,
        )
        .unwrap();
        assert_eq!(w.stages.stages()[1].duration, Duration::from_secs(90));
    }
}
