#![forbid(unsafe_code)]

use anyhow::Result;
use sitrep_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let seed = std::env::args()
        .nth(1)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    let mut simulator = Simulator::new(SimulationConfig {
        seed,
        ..SimulationConfig::default()
    })?;
    let result = simulator.run()?;

    println!(
        "simulation complete: seed={} trace_events={} passed={} interesting={}",
        result.seed,
        result.trace.len(),
        result.oracle.passed,
        result.interesting_state_reached
    );
    for violation in &result.oracle.violations {
        println!("  {violation}");
    }

    Ok(())
}
