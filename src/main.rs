use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sst2_lora::cli::{self, commands::*};

#[derive(Parser)]
#[command(
    name = "sst2-lora",
    version,
    about = "Fine-tune, merge, evaluate, prune and distill LoRA adapters for sentiment classification"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON log format
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SST2_LORA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured stage sequence
    Run(RunCommand),

    /// Fine-tune a LoRA adapter on the training split
    Train(TrainCommand),

    /// Merge the trained adapter into the base model
    Merge,

    /// Measure sentiment accuracy of the merged model
    Evaluate(EvaluateCommand),

    /// Classify a single sentence with the merged model
    Generate(GenerateCommand),

    /// Prune the trained adapter by weight magnitude
    Prune(PruneCommand),

    /// Distill the unpruned adapter into the pruned one
    Distill(DistillCommand),

    /// Merge the pruned adapter and save the result
    ExportPruned,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    cli::logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(cmd) => run(cmd, config).await,
        Commands::Train(cmd) => train(cmd, config).await,
        Commands::Merge => merge(config).await,
        Commands::Evaluate(cmd) => evaluate(cmd, config).await,
        Commands::Generate(cmd) => generate(cmd, config).await,
        Commands::Prune(cmd) => prune(cmd, config).await,
        Commands::Distill(cmd) => distill(cmd, config).await,
        Commands::ExportPruned => export_pruned(config).await,
        Commands::Config { subcommand } => handle_config(subcommand, &config),
    }
}
