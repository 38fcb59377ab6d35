//! Simulate command - run maintenance passes over a fixture.

use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;
use tracing::debug;

use batchgate_engine::{EngineConfig, FailedChunkPolicy, MaintenanceReport, ZeroChunkStepPolicy};

use crate::{FixtureArgs, OutputFormat, Seeded};

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub fixture: FixtureArgs,

    /// Number of maintenance passes to run.
    #[arg(long, short = 'n', default_value = "1")]
    pub passes: u32,

    /// Keep gates shut behind steps with FAILED chunks.
    #[arg(long)]
    pub block_on_failed: bool,

    /// How a step without chunks is treated at the next gate.
    #[arg(long, value_enum)]
    pub zero_chunk_steps: Option<ZeroChunkSteps>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ZeroChunkSteps {
    RequireSealed,
    Vacuous,
    Block,
}

impl From<ZeroChunkSteps> for ZeroChunkStepPolicy {
    fn from(value: ZeroChunkSteps) -> Self {
        match value {
            ZeroChunkSteps::RequireSealed => Self::RequireSealed,
            ZeroChunkSteps::Vacuous => Self::VacuouslyComplete,
            ZeroChunkSteps::Block => Self::Block,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Simulation {
    pub snapshot: Vec<String>,
    pub reports: Vec<MaintenanceReport>,
}

impl Simulation {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        Ok(match format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => self.snapshot.iter().map(|l| format!("{l}\n")).collect(),
        })
    }
}

/// Execute the simulate command.
pub fn execute(args: &SimulateArgs, format: OutputFormat) -> Result<String> {
    let text = args.fixture.read()?;
    simulate(&text, args, crate::engine_config()?)?.render(format)
}

pub fn simulate(text: &str, args: &SimulateArgs, mut config: EngineConfig) -> Result<Simulation> {
    if args.block_on_failed {
        config.gate.failed_chunks = FailedChunkPolicy::BlockGate;
    }
    if let Some(policy) = args.zero_chunk_steps {
        config.gate.zero_chunk_steps = policy.into();
    }

    let seeded = Seeded::from_fixture(text, !args.fixture.ungated, config)?;
    debug!(
        job_instance_id = %seeded.instance.id,
        chunks = seeded.lines.len(),
        passes = args.passes,
        "simulating maintenance"
    );
    let mut reports = Vec::with_capacity(args.passes as usize);
    for _ in 0..args.passes {
        reports.push(seeded.engine.run_maintenance_pass(seeded.instance.id)?);
    }

    Ok(Simulation {
        snapshot: seeded.snapshot()?.lines().map(str::to_owned).collect(),
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(passes: u32) -> SimulateArgs {
        SimulateArgs {
            fixture: FixtureArgs {
                fixture: None,
                ungated: false,
            },
            passes,
            block_on_failed: false,
            zero_chunk_steps: None,
        }
    }

    #[test]
    fn queued_chunk_behind_completed_step_is_left_alone() {
        let sim = simulate("1|COMPLETED\n2|QUEUED\n", &args(1), EngineConfig::default()).unwrap();
        assert_eq!(sim.snapshot, vec!["1|COMPLETED", "2|QUEUED"]);
        assert_eq!(sim.reports[0].enqueued, 0);
    }

    #[test]
    fn waiting_chunk_is_released_and_queued() {
        let sim = simulate(
            "# finished first step\n1|COMPLETED\n1|COMPLETED\n\n2|GATE_WAITING\n",
            &args(2),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(sim.snapshot, vec!["1|COMPLETED", "1|COMPLETED", "2|QUEUED"]);
        assert_eq!(sim.reports[0].promoted, 1);
        assert!(!sim.reports[1].changed_chunks());
    }

    #[test]
    fn block_on_failed_keeps_gate_shut() {
        let mut args = args(1);
        args.block_on_failed = true;
        let sim = simulate("1|FAILED\n2|GATE_WAITING\n", &args, EngineConfig::default()).unwrap();
        assert_eq!(sim.snapshot, vec!["1|FAILED", "2|GATE_WAITING"]);
        assert_eq!(sim.reports[0].blocked_gates.len(), 1);
    }

    #[test]
    fn text_output_matches_fixture_format() {
        let sim = simulate("1|READY\n", &args(1), EngineConfig::default()).unwrap();
        assert_eq!(sim.render(OutputFormat::Text).unwrap(), "1|QUEUED\n");
    }

    #[test]
    fn json_output_carries_reports() {
        let sim = simulate("1|READY\n", &args(1), EngineConfig::default()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&sim.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["snapshot"][0], "1|QUEUED");
        assert_eq!(json["reports"][0]["enqueued"], 1);
    }

    #[test]
    fn malformed_fixture_is_an_error() {
        assert!(simulate("one|READY\n", &args(1), EngineConfig::default()).is_err());
        assert!(simulate("# nothing\n", &args(1), EngineConfig::default()).is_err());
    }
}
