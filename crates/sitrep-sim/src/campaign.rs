//! Campaign runner: many seeds, one report, the first failing seed first.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::feed::FaultConfig;
use crate::oracle::InvariantViolation;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration controlling how many seeds to run and
/// what simulation parameters to use for each seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    pub rounds: u64,
    pub initial_incidents: usize,
    pub page_size: u32,
    pub fault: FaultConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            rounds: 40,
            initial_incidents: 12,
            page_size: 8,
            fault: FaultConfig::default(),
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            rounds: self.rounds,
            initial_incidents: self.initial_incidents,
            page_size: self.page_size,
            fault: self.fault,
            ..SimulationConfig::default()
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (replay this one first).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that exercised every fault kind at least once.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let result = replay_seed(seed, config)?;
        if result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if result.oracle.passed {
            report.seeds_passed += 1;
            continue;
        }
        warn!(seed, violations = result.oracle.violations.len(), "seed failed");
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: result
                .oracle
                .violations
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        first_failure = ?report.first_failure,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed and return `Ok(())` on pass, the violations on failure.
///
/// # Errors
///
/// The outer error is an internal simulation failure, not an invariant
/// violation.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let result = replay_seed(seed, config)?;
    if result.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(result.oracle.violations))
    }
}

/// Re-run one seed with its full trace.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    simulator.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_config_default_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn campaign_config_empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn campaign_config_zero_page_size_rejected() {
        let config = CampaignConfig {
            page_size: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_for_seed_uses_correct_seed() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.rounds, config.rounds);
        assert_eq!(sim.fault, config.fault);
    }

    #[test]
    fn run_campaign_all_seeds_pass() {
        let config = CampaignConfig {
            seed_range: 0..12,
            rounds: 30,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert_eq!(report.seeds_run, 12);
        assert!(
            report.all_passed(),
            "campaign failed at seed {:?}: {:#?}",
            report.first_failure,
            report.failures
        );
        assert_eq!(report.seeds_passed, 12);
    }

    #[test]
    fn heavy_faults_reach_interesting_states() {
        let config = CampaignConfig {
            seed_range: 0..10,
            rounds: 60,
            fault: FaultConfig {
                max_delay_rounds: 3,
                duplicate_rate_percent: 25,
                reorder_rate_percent: 40,
                disconnect_rate_percent: 10,
                write_failure_percent: 30,
                lookup_failure_percent: 20,
                read_failure_percent: 10,
            },
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert!(report.all_passed(), "{:#?}", report.failures);
        assert!(report.interesting_states_reached > 0);
    }

    #[test]
    fn replay_is_deterministic() {
        let config = CampaignConfig {
            rounds: 20,
            ..CampaignConfig::default()
        };
        let first = replay_seed(7, &config).expect("replay 1");
        let second = replay_seed(7, &config).expect("replay 2");
        assert_eq!(first.trace, second.trace);
        assert_eq!(first.final_views, second.final_views);
    }

    #[test]
    fn single_seed_passes() {
        let result = run_single_seed(3, &CampaignConfig::default()).expect("sim should not error");
        assert!(result.is_ok(), "seed 3 should pass: {result:?}");
    }

    #[test]
    fn campaign_report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["active: incident inc-0001 held twice".into()],
            }],
            interesting_states_reached: 5,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }
}
