use clap::{Parser, Subcommand};

use taskforge::config::Config;
use taskforge::core::{Intent, IntentKind, TaskGraph};
use taskforge::orchestration::{DecomposeContext, DecompositionResult, TaskGraphPlanner};
use taskforge::{tlog, Error, Result};

/// Taskforge - decompose engineering intents into executable task graphs
#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKFORGE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskforge/taskforge.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose an intent and print the task graph
    Plan {
        /// The intent in natural language
        intent: String,

        /// Override the detected intent kind (create, modify, fix, review, other)
        #[arg(long, short = 'k')]
        kind: Option<IntentKind>,

        /// Component to implement separately (repeatable)
        #[arg(long = "component", short = 'c')]
        components: Vec<String>,

        /// Print the decomposition result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the execution waves for an intent
    Order {
        /// The intent in natural language
        intent: String,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to ~/.taskforge/taskforge.toml if it does not exist
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskforge::log::init_with_debug(cli.debug);
    let config = Config::load()?;
    if !cli.debug {
        if let Some(level) = config.log_level() {
            taskforge::log::set_level(level);
        }
    }

    match cli.command {
        Command::Plan {
            intent,
            kind,
            components,
            json,
        } => run_plan(&config, &intent, kind, &components, json),
        Command::Order { intent } => run_order(&config, &intent),
        Command::Config { init } => run_config(config, init),
    }
}

fn parse_intent(text: &str, kind: Option<IntentKind>) -> Result<Intent> {
    if text.trim().is_empty() {
        return Err(Error::Validation("intent must not be empty".to_string()));
    }
    Ok(match kind {
        Some(kind) => Intent::new(kind, text),
        None => Intent::parse(text),
    })
}

fn decompose(config: &Config, intent: &Intent, components: &[String]) -> DecompositionResult {
    let planner = TaskGraphPlanner::new(config.planner.clone());
    let context = components
        .iter()
        .fold(DecomposeContext::new(), |ctx, c| ctx.with_component(c));
    planner.decompose(intent, Some(&context))
}

fn run_plan(
    config: &Config,
    text: &str,
    kind: Option<IntentKind>,
    components: &[String],
    json: bool,
) -> Result<()> {
    let intent = parse_intent(text, kind)?;
    let result = decompose(config, &intent, components);
    tlog!("CLI plan: {} tasks for {:?}", result.graph.task_count(), intent.description);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Intent: {} ({})", intent.description, intent.kind);
    println!();
    for node in &result.graph.nodes {
        let deps: Vec<String> = result
            .graph
            .dependencies_of(&node.id)
            .iter()
            .map(|d| d.name.clone())
            .collect();
        println!(
            "  {}  {:<24} {:<10} p={:<3} work={:<6} after=[{}]",
            node.id.short(),
            node.name,
            node.agent,
            node.priority,
            node.estimated_work_units,
            deps.join(", ")
        );
    }
    println!();
    println!("Estimated work: {}", result.graph.estimated_total_work);
    println!("Critical path:  {}", names(&result.graph, &result.graph.critical_path));
    if !result.architecture_validated {
        println!();
        println!("Validation failed:");
        for error in &result.validation_errors {
            println!("  - {}", error);
        }
    }
    Ok(())
}

fn run_order(config: &Config, text: &str) -> Result<()> {
    let intent = parse_intent(text, None)?;
    let result = decompose(config, &intent, &[]);
    for (i, wave) in result.graph.execution_waves().iter().enumerate() {
        println!("Wave {}: {}", i + 1, names(&result.graph, wave));
    }
    Ok(())
}

fn run_config(config: Config, init: bool) -> Result<()> {
    if init {
        let path = Config::config_path()?;
        if path.exists() {
            println!("Config already exists at {}", path.display());
        } else {
            let path = config.save()?;
            println!("Wrote default config to {}", path.display());
        }
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn names(graph: &TaskGraph, ids: &[taskforge::core::TaskId]) -> String {
    ids.iter()
        .filter_map(|id| graph.get_task(id))
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
