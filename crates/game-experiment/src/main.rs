//! Game Experiment CLI.
//!
//! Commands:
//! - list: List scenarios in a directory
//! - draw: Print sampled condition sets for a scenario
//! - factorial: Print every factorial cell of a scenario
//! - play: Play one session interactively on stdin
//! - simulate: Run a batch of sessions with a simulated human

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use experiment_kernel::{
    Agent, ConditionSet, ConditionValue, ExperimentDesign, InMemorySessionStore, ScenarioBundle,
    Session, SessionStore,
};
use game_experiment::agents::ChatAgent;
use game_experiment::experiment::{AgentSet, DesignMode, ExperimentRunner, ExperimentRunnerConfig};
use game_experiment::openai_client::{OpenAiClient, DEFAULT_BASE_URL};
use game_experiment::results::timestamped_path;
use game_experiment::scenario::{list_scenarios, load_scenario, parse_override};

#[derive(Parser)]
#[command(name = "game-experiment")]
#[command(version)]
#[command(about = "Manager/player game experiments with randomized conditions")]
struct Cli {
    /// OpenAI-compatible API base URL
    #[arg(long = "base-url", env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// API key (sent as a bearer token)
    #[arg(long = "api-key", env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List scenarios in a directory
    List {
        /// Directory containing scenario JSON files
        #[arg(default_value = "scenarios")]
        dir: PathBuf,
    },

    /// Print sampled condition sets
    Draw {
        /// Scenario file
        scenario: PathBuf,

        /// Number of sessions to draw
        #[arg(long, default_value = "5")]
        count: usize,

        /// Random seed (session i uses seed + i)
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Parameter overrides (name=value, repeatable)
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, ConditionValue)>,
    },

    /// Print every factorial cell
    Factorial {
        /// Scenario file
        scenario: PathBuf,
    },

    /// Play one session interactively
    Play {
        /// Scenario file
        scenario: PathBuf,

        /// Random seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Parameter overrides (name=value, repeatable)
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, ConditionValue)>,

        /// Save the transcript to this file (timestamped)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a batch of sessions with a simulated human
    Simulate {
        /// Scenario file
        scenario: PathBuf,

        /// Number of sampled sessions
        #[arg(long, default_value = "10")]
        sessions: usize,

        /// Run every factorial cell instead of sampling
        #[arg(long)]
        factorial: bool,

        /// Sessions per factorial cell
        #[arg(long, default_value = "1")]
        repetitions: usize,

        /// Simulated human turns per session
        #[arg(long, default_value = "5")]
        max_turns: usize,

        /// Maximum sessions running at once
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Random seed (session i uses seed + i)
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Parameter overrides (name=value, repeatable)
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, ConditionValue)>,

        /// Output file for results
        #[arg(long, default_value = "results.json")]
        output: PathBuf,
    },
}

fn load_design(path: &Path) -> Result<(ScenarioBundle, ExperimentDesign)> {
    let bundle = load_scenario(path)?;
    let design = ExperimentDesign::compile(&bundle.variables)
        .with_context(|| format!("Invalid variables in {}", path.display()))?;
    Ok((bundle, design))
}

fn print_conditions(label: &str, conditions: &ConditionSet) -> Result<()> {
    println!("{label}: {}", serde_json::to_string(conditions)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let client = OpenAiClient::new(&cli.base_url, cli.api_key.clone());

    match cli.command {
        Commands::List { dir } => {
            for scenario in list_scenarios(&dir)? {
                println!("{}  {}  {}", scenario.path.display(), scenario.name, scenario.description);
            }
        }

        Commands::Draw {
            scenario,
            count,
            seed,
            overrides,
        } => {
            let (_, design) = load_design(&scenario)?;
            let overrides: BTreeMap<_, _> = overrides.into_iter().collect();
            for index in 0..count {
                let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(index as u64));
                let conditions = design.draw(index, &mut rng)?.with_overrides(&overrides);
                print_conditions(&format!("session {index}"), &conditions)?;
            }
        }

        Commands::Factorial { scenario } => {
            let (_, design) = load_design(&scenario)?;
            let cells = design.factorial()?;
            for (index, cell) in cells.iter().enumerate() {
                print_conditions(&format!("cell {index}"), cell)?;
            }
            println!("{} cells", cells.len());
        }

        Commands::Play {
            scenario,
            seed,
            overrides,
            output,
        } => {
            let (bundle, design) = load_design(&scenario)?;
            let seed = seed.unwrap_or_else(rand::random);
            let overrides: BTreeMap<_, _> = overrides.into_iter().collect();
            let conditions = design
                .draw(0, &mut ChaCha8Rng::seed_from_u64(seed))?
                .with_overrides(&overrides);
            info!(seed, conditions = %serde_json::to_string(&conditions)?, "Drew conditions");

            let manager: Arc<dyn Agent> = Arc::new(ChatAgent::participant("manager", client.clone()));
            let player: Arc<dyn Agent> = Arc::new(ChatAgent::observer("player", client));

            let store = InMemorySessionStore::new();
            let id = store.create(Session::new(&bundle, conditions, manager, player));
            let shared = store.get(id).context("Session vanished from store")?;
            let mut session = shared.lock().await;

            println!("\n=== {} ===\n", bundle.name);
            println!("{}\n", session.open().await?);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();
            loop {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if matches!(line, "quit" | "exit") {
                    break;
                }
                match session.respond(line).await {
                    Ok(reply) => println!("\n{reply}\n"),
                    Err(e) => eprintln!("Turn failed, try again: {e:#}"),
                }
            }
            session.end();

            let transcript = session.transcript();
            println!("\nToken Usage:");
            println!("  Total input tokens: {}", transcript.total_input_tokens());
            println!("  Total output tokens: {}", transcript.total_output_tokens());

            if let Some(output) = output {
                let output_path = timestamped_path(&output);
                std::fs::write(&output_path, serde_json::to_string_pretty(transcript)?)
                    .with_context(|| format!("Failed to write {}", output_path.display()))?;
                println!("Transcript saved to: {}", output_path.display());
            }
            drop(session);
            store.delete(id);
        }

        Commands::Simulate {
            scenario,
            sessions,
            factorial,
            repetitions,
            max_turns,
            concurrency,
            seed,
            overrides,
            output,
        } => {
            let bundle = load_scenario(&scenario)?;
            let mode = if factorial {
                DesignMode::Factorial { repetitions }
            } else {
                DesignMode::Sampled { sessions }
            };
            let config = ExperimentRunnerConfig {
                mode,
                max_turns,
                max_concurrent_sessions: concurrency,
                seed,
                overrides: overrides.into_iter().collect(),
            };
            let agents = AgentSet {
                manager: Arc::new(ChatAgent::participant("manager", client.clone())),
                player: Arc::new(ChatAgent::observer("player", client.clone())),
                human: Arc::new(ChatAgent::participant("human", client)),
            };

            let runner = ExperimentRunner::new(config, agents);
            let results = runner.run(&bundle).await?;

            let output_path = timestamped_path(&output);
            results.save(&output_path)?;

            println!("\n=== Simulation Complete ===");
            println!("Scenario: {}", results.scenario);
            println!(
                "Sessions: {} ({} completed, {} failed)",
                results.summary.sessions, results.summary.completed, results.summary.failed
            );
            println!("\nToken Usage:");
            println!("  Total input tokens: {}", results.summary.total_input_tokens);
            println!("  Total output tokens: {}", results.summary.total_output_tokens);
            println!("\nBy condition:");
            for (key, cell) in &results.summary.by_condition {
                println!(
                    "  {}: sessions={}, failed={}, avg_turns={:.1}, avg_decisions={:.1}",
                    key, cell.sessions, cell.failed, cell.avg_turns, cell.avg_player_decisions
                );
            }
            println!("\nResults saved to: {}", output_path.display());
        }
    }

    Ok(())
}
