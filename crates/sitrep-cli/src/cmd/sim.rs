//! `sitrep sim`: deterministic simulation campaigns.
//!
//! `sitrep sim run`: execute a campaign across many seeds.
//! `sitrep sim replay`: replay a single seed with its trace.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use serde::Serialize;
use sitrep_sim::campaign::{CampaignConfig, SeedFailure, replay_seed, run_campaign};
use sitrep_sim::{FaultConfig, FaultCounters, TraceEvent};

use crate::output::{OutputMode, pretty_kv, pretty_section, render};

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    sitrep sim run --seeds 100\n\n\
                      # Double the fault rates\n    sitrep sim run --seeds 50 --fault-scale 200 --rounds 60"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with its trace",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    sitrep sim replay --seed 42"
    )]
    Replay(SimReplayArgs),
}

#[derive(Args, Debug, Clone, Copy)]
pub struct SimParams {
    /// Simulation rounds per seed.
    #[arg(long, default_value = "40")]
    pub rounds: u64,

    /// Incidents in the store before the first round.
    #[arg(long, default_value = "12")]
    pub incidents: usize,

    #[arg(long, default_value = "8")]
    pub page_size: u32,

    /// Fault rates as a percentage of the defaults. 0 disables every fault.
    #[arg(long, default_value = "100")]
    pub fault_scale: u16,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub params: SimParams,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    #[arg(long)]
    pub seed: u64,

    #[command(flatten)]
    pub params: SimParams,
}

fn scale_fault(base: u8, scale_pct: u16) -> u8 {
    let scaled = u32::from(base) * u32::from(scale_pct) / 100;
    u8::try_from(scaled.min(100)).unwrap_or(100)
}

fn build_campaign_config(seed_start: u64, seeds: u64, params: SimParams) -> CampaignConfig {
    let base = FaultConfig::default();
    let factor = params.fault_scale;
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        rounds: params.rounds,
        initial_incidents: params.incidents,
        page_size: params.page_size,
        fault: FaultConfig {
            max_delay_rounds: if factor == 0 { 0 } else { base.max_delay_rounds },
            duplicate_rate_percent: scale_fault(base.duplicate_rate_percent, factor),
            reorder_rate_percent: scale_fault(base.reorder_rate_percent, factor),
            disconnect_rate_percent: scale_fault(base.disconnect_rate_percent, factor),
            write_failure_percent: scale_fault(base.write_failure_percent, factor),
            lookup_failure_percent: scale_fault(base.lookup_failure_percent, factor),
            read_failure_percent: scale_fault(base.read_failure_percent, factor),
        },
    }
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<SeedFailure>,
}

pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed_start, args.seeds, args.params);
    let report = run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report.failures,
    };

    render(output, &out, |out, w| {
        if output == OutputMode::Pretty {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(w, "Rounds", args.params.rounds.to_string())?;
            pretty_kv(w, "Fault scale", format!("{}%", args.params.fault_scale))?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed,
                    out.failures.len(),
                    out.interesting_states_reached
                ),
            )?;
        } else {
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed,
                out.failures.len(),
                out.interesting_states_reached,
                out.all_passed
            )?;
        }
        for failure in out.failures.iter().take(5) {
            writeln!(w, "seed {} violations={}", failure.seed, failure.violations.len())?;
            for violation in &failure.violations {
                writeln!(w, "  - {violation}")?;
            }
        }
        if let Some(seed) = out.first_failure {
            writeln!(w, "replay: sitrep sim replay --seed {seed} --rounds {}", args.params.rounds)?;
        }
        Ok(())
    })?;

    if !out.all_passed {
        bail!("{} of {} seeds failed", out.failures.len(), out.seeds_run);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    oracle_passed: bool,
    violations: Vec<String>,
    interesting_state_reached: bool,
    counters: FaultCounters,
    trace: Vec<TraceEvent>,
}

pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed, 1, args.params);
    let result = replay_seed(args.seed, &config)?;

    let out = ReplayOutput {
        seed: result.seed,
        oracle_passed: result.oracle.passed,
        violations: result.oracle.violations.iter().map(ToString::to_string).collect(),
        interesting_state_reached: result.interesting_state_reached,
        counters: result.counters,
        trace: result.trace,
    };

    render(output, &out, |out, w| {
        pretty_section(w, &format!("Replay Seed {}", out.seed))?;
        pretty_kv(w, "Trace", format!("{} events", out.trace.len()))?;
        pretty_kv(
            w,
            "Faults",
            format!(
                "dup={} swaps={} disconnects={} resyncs={} raced_reads={} archived={}",
                out.counters.duplicates,
                out.counters.swaps,
                out.counters.disconnects,
                out.counters.resyncs,
                out.counters.raced_reads,
                out.counters.archived
            ),
        )?;
        pretty_kv(w, "Interesting", out.interesting_state_reached.to_string())?;
        pretty_kv(w, "Oracle", if out.oracle_passed { "passed" } else { "FAILED" })?;
        for violation in &out.violations {
            writeln!(w, "  - {violation}")?;
        }
        Ok(())
    })?;

    if !out.oracle_passed {
        bail!("seed {} violated {} invariants", out.seed, out.violations.len());
    }
    Ok(())
}
