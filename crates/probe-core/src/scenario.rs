use crate::client::{preset, ClientProfile, DEFAULT_MAX_IDLE_PER_HOST};
use crate::stage::{Stage, StagePlan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A named experiment: a stage plan plus the client it runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub stages: StagePlan,
    pub profile: ClientProfile,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown scenario '{id}', valid scenarios: {valid}")]
    Unknown { id: String, valid: String },
    #[error("scenario '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Scenarios by id, listed in id order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scenarios: BTreeMap<String, Scenario>,
}

const STAGE_DURATION: Duration = Duration::from_secs(20);
const SCENARIO_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

fn stages(levels: &[u32]) -> StagePlan {
    levels
        .iter()
        .map(|&c| Stage::new(c, STAGE_DURATION))
        .collect::<Vec<_>>()
        .into()
}

fn scenario_client(preset_name: &str, tweak: impl FnOnce(&mut ClientProfile)) -> ClientProfile {
    let mut profile = preset(preset_name).unwrap_or_default();
    profile.request_timeout = SCENARIO_REQUEST_TIMEOUT;
    tweak(&mut profile);
    profile
}

/// Shorthand for [`Catalog::builtin`].
pub fn catalog() -> Catalog {
    Catalog::builtin()
}

impl Catalog {
    /// The built-in experiments.
    pub fn builtin() -> Self {
        let baseline = [2, 100, 2];
        let extended = [2, 100, 200, 300, 400, 2];

        let defs = [
            Scenario {
                id: "1.1".into(),
                name: "default HTTP/1.1 client".into(),
                stages: stages(&baseline),
                profile: scenario_client("http11_keepalive", |p| {
                    p.max_idle_per_host = DEFAULT_MAX_IDLE_PER_HOST;
                }),
            },
            Scenario {
                id: "1.2".into(),
                name: "HTTP/1.1 client with larger idle pool".into(),
                stages: stages(&baseline),
                profile: scenario_client("http11_keepalive", |p| p.max_idle_per_host = 100),
            },
            Scenario {
                id: "1.3".into(),
                name: "HTTP/1.1 client with max conns per host".into(),
                stages: stages(&baseline),
                profile: scenario_client("http11_keepalive", |p| {
                    p.max_idle_per_host = 10;
                    p.max_conns_per_host = Some(20);
                }),
            },
            Scenario {
                id: "2.1".into(),
                name: "default HTTP/2 client".into(),
                stages: stages(&baseline),
                profile: scenario_client("http2_keepalive", |p| {
                    p.max_idle_per_host = DEFAULT_MAX_IDLE_PER_HOST;
                }),
            },
            Scenario {
                id: "2.2".into(),
                name: "HTTP/2 client with extended stages".into(),
                stages: stages(&extended),
                profile: scenario_client("http2_keepalive", |p| {
                    p.max_idle_per_host = DEFAULT_MAX_IDLE_PER_HOST;
                }),
            },
            Scenario {
                id: "2.3".into(),
                name: "HTTP/2 client with strict max concurrent streams".into(),
                stages: stages(&extended),
                profile: scenario_client("http2_only", |_| {}),
            },
        ];

        let mut catalog = Catalog::default();
        for scenario in defs {
            catalog.scenarios.insert(scenario.id.clone(), scenario);
        }
        catalog
    }

    /// Add or replace a scenario after validating its stages.
    pub fn insert(&mut self, scenario: Scenario) -> Result<(), CatalogError> {
        scenario
            .stages
            .validate()
            .map_err(|e| CatalogError::Invalid {
                id: scenario.id.clone(),
                reason: e.to_string(),
            })?;
        self.scenarios.insert(scenario.id.clone(), scenario);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Scenario, CatalogError> {
        self.scenarios.get(id).ok_or_else(|| CatalogError::Unknown {
            id: id.to_string(),
            valid: self.ids().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }
}
