//! Reference command line for the gated batch engine.
//!
//! Fixtures list one chunk per line as `<step>|<STATUS>`, where `<step>` is
//! the 1-based step ordinal. Blank lines and lines starting with `#` are
//! ignored.
//!
//! - `batchgate simulate` runs maintenance passes over a fixture and prints
//!   the resulting chunk snapshot
//! - `batchgate enqueue` tries to enqueue one fixture chunk and prints the
//!   rows updated
//!
//! Engine settings come from the `BATCHGATE_*` environment variables.

pub mod commands;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use batchgate_engine::fixture::{definition_for, parse_fixture, seed, FixtureLine};
use batchgate_engine::{ChunkStore, EngineConfig, InMemoryEngine, JobInstance};
use batchgate_core::ChunkId;

#[derive(Debug, Parser)]
#[command(name = "batchgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run maintenance passes over a fixture.
    Simulate(commands::simulate::SimulateArgs),
    /// Enqueue a single fixture chunk.
    Enqueue(commands::enqueue::EnqueueArgs),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Fixture source shared by the subcommands.
#[derive(Debug, Clone, clap::Args)]
pub struct FixtureArgs {
    /// Fixture file; reads stdin when omitted or `-`.
    #[arg()]
    pub fixture: Option<PathBuf>,

    /// Treat the job as ungated.
    #[arg(long)]
    pub ungated: bool,
}

impl FixtureArgs {
    pub fn read(&self) -> Result<String> {
        match self.fixture.as_deref() {
            None => read_stdin(),
            Some(path) if path == Path::new("-") => read_stdin(),
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read fixture {}", path.display())),
        }
    }
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("failed to read fixture from stdin")?;
    Ok(text)
}

/// An in-memory engine with one instance seeded from a fixture.
pub struct Seeded {
    pub engine: InMemoryEngine,
    pub instance: JobInstance,
    pub lines: Vec<FixtureLine>,
    /// Chunk ids in fixture line order.
    pub chunks: Vec<ChunkId>,
}

impl Seeded {
    pub fn from_fixture(text: &str, gated: bool, config: EngineConfig) -> Result<Self> {
        let lines = parse_fixture(text).context("invalid fixture")?;
        anyhow::ensure!(!lines.is_empty(), "fixture has no chunks");

        let engine = InMemoryEngine::in_memory(config);
        let definition = engine.register_definition(definition_for("fixture", &lines, gated)?)?;
        let instance = engine.start_instance(definition.key())?;
        let chunks = seed(engine.store(), &definition, instance.id, &lines)?;
        Ok(Self {
            engine,
            instance,
            lines,
            chunks,
        })
    }

    /// Current snapshot, one `<step>|<STATUS>` line per chunk.
    pub fn snapshot(&self) -> Result<String> {
        let chunks: Vec<_> = self
            .engine
            .store()
            .fetch_all_chunks_iterator(self.instance.id, false)
            .collect::<Result<_, _>>()?;
        Ok(batchgate_engine::fixture::render_snapshot(&chunks))
    }
}

/// Engine settings from the environment.
pub fn engine_config() -> Result<EngineConfig> {
    EngineConfig::from_env().context("invalid BATCHGATE_* configuration")
}
