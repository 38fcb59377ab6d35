//! Enqueue command - try to enqueue one chunk of a fixture.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use batchgate_engine::EngineConfig;

use crate::{FixtureArgs, OutputFormat, Seeded};

#[derive(Debug, Clone, Args)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub fixture: FixtureArgs,

    /// 1-based index of the chunk among the fixture's chunk lines.
    #[arg(long, short = 'c')]
    pub chunk: usize,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResult {
    pub rows_updated: usize,
    pub snapshot: Vec<String>,
}

impl EnqueueResult {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        Ok(match format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => {
                let mut out = format!("rows updated: {}\n", self.rows_updated);
                for line in &self.snapshot {
                    out.push_str(line);
                    out.push('\n');
                }
                out
            }
        })
    }
}

/// Execute the enqueue command.
pub fn execute(args: &EnqueueArgs, format: OutputFormat) -> Result<String> {
    let text = args.fixture.read()?;
    enqueue(&text, args, crate::engine_config()?)?.render(format)
}

pub fn enqueue(text: &str, args: &EnqueueArgs, config: EngineConfig) -> Result<EnqueueResult> {
    let seeded = Seeded::from_fixture(text, !args.fixture.ungated, config)?;
    let id = args
        .chunk
        .checked_sub(1)
        .and_then(|idx| seeded.chunks.get(idx))
        .copied()
        .with_context(|| {
            format!(
                "chunk {} out of range (fixture has {})",
                args.chunk,
                seeded.lines.len()
            )
        })?;

    let mut rows_updated = 0;
    seeded
        .engine
        .enqueue_work_chunk_for_processing(id, |rows| rows_updated = rows)?;

    Ok(EnqueueResult {
        rows_updated,
        snapshot: seeded.snapshot()?.lines().map(str::to_owned).collect(),
    })
}
