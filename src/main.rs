use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use risk_agents::agents::miner::default_example_rules;
use risk_agents::config::Config;
use risk_agents::console::Console;
use risk_agents::knowledge::KnowledgeStore;
use risk_agents::llm::LlmClient;
use risk_agents::orchestrator::Orchestrator;
use risk_agents::prompts::PromptTemplates;
use risk_agents::types::RiskWarningFile;

#[derive(Debug, Parser)]
#[command(name = "risk_agents", version, about = "LLM-driven financial risk analysis agents")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract knowledge from CSV article exports into the knowledge store
    Research {
        /// CSV files to analyse
        #[arg(long = "input", required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,

        /// Knowledge store file (defaults to <DATA_DIR>/knowledge_base.json)
        #[arg(long)]
        knowledge: Option<PathBuf>,
    },

    /// Generate one validated rule per risk point
    Mine {
        /// JSON array of risk point names (defaults to <DATA_DIR>/risk_points.json)
        #[arg(long)]
        risk_points: Option<PathBuf>,

        /// JSON array of few-shot rules; built-in examples when omitted
        #[arg(long)]
        example_rules: Option<PathBuf>,

        /// Knowledge store used as prompt context (defaults to <DATA_DIR>/knowledge_base.json)
        #[arg(long)]
        knowledge: Option<PathBuf>,
    },

    /// Turn risk descriptions into check_risk snippets and run them against company data
    Analyze {
        /// risk_warning.json input (defaults to <DATA_DIR>/risk_warning.json)
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Structure regulatory notice .txt files into JSON
    Structure {
        #[arg(long)]
        input_dir: PathBuf,

        #[arg(long)]
        output_dir: PathBuf,
    },
}

impl Command {
    fn mode(&self) -> &'static str {
        match self {
            Command::Research { .. } => "research",
            Command::Mine { .. } => "mine",
            Command::Analyze { .. } => "analyze",
            Command::Structure { .. } => "structure",
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // logging
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter_layer).init();

    tracing::info!("Starting risk agents ({})", args.command.mode());

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Batch interrupted by user");
            Console::display_aborted();
            Ok(())
        }
        result = run(args.command) => result,
    };

    match result {
        Ok(()) => {
            Console::display_goodbye();
            Ok(())
        }
        Err(e) => {
            Console::display_error(&e);
            Err(e)
        }
    }
}

async fn run(command: Command) -> Result<()> {
    let config = Config::load()?;
    let prompts = PromptTemplates::load(config.prompts_file.as_deref())?;
    let client = LlmClient::new(config.clone())?;
    Console::display_welcome(&config.app_title, command.mode());

    let default_knowledge = config.data_dir.join("knowledge_base.json");
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(client), prompts);

    match command {
        Command::Research { inputs, knowledge } => {
            let knowledge = knowledge.unwrap_or(default_knowledge);
            let outcomes = orchestrator.run_research(&inputs, &knowledge).await?;
            let ok = outcomes.iter().filter(|o| o.success).count();
            info!("Research finished: {}/{} file(s) processed", ok, outcomes.len());
        }
        Command::Mine { risk_points, example_rules, knowledge } => {
            let risk_points_path = risk_points.unwrap_or_else(|| config.data_dir.join("risk_points.json"));
            let risk_points: Vec<String> = read_json(&risk_points_path).await?;
            if risk_points.is_empty() {
                bail!("no risk points in {}", risk_points_path.display());
            }
            let example_rules: Vec<JsonValue> = match example_rules {
                Some(path) => read_json(&path).await?,
                None => default_example_rules(),
            };
            let store = KnowledgeStore::open(knowledge.unwrap_or(default_knowledge)).await;
            orchestrator.run_mining(&risk_points, example_rules, store.combined_text()).await?;
        }
        Command::Analyze { data } => {
            let path = data.unwrap_or_else(|| config.data_dir.join("risk_warning.json"));
            let data: RiskWarningFile = read_json(&path).await?;
            info!("Loaded risk data for {} compan(ies) from {}", data.data.len(), path.display());
            orchestrator.run_analysis(&data).await?;
        }
        Command::Structure { input_dir, output_dir } => {
            let outcomes = orchestrator.run_structuring(&input_dir, &output_dir).await?;
            let ok = outcomes.iter().filter(|o| o.success).count();
            info!("Structuring finished: {}/{} file(s) saved", ok, outcomes.len());
        }
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(text.trim_start_matches('\u{feff}'))
        .with_context(|| format!("failed to parse {}", path.display()))
}
