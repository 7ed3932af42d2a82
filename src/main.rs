use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(name = "unitsmith")]
#[command(about = "Generates pytest suites for Python functions with a local LLM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Enable verbose debug output")]
    verbose: bool,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Settings file (defaults to unitsmith.yml)"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List the functions found in Python source files")]
    Extract {
        #[arg(required = true, help = "Python source files")]
        files: Vec<PathBuf>,

        #[arg(long, help = "Print the functions as JSON")]
        json: bool,
    },

    #[command(about = "Generate test files for functions in Python source files")]
    Generate {
        #[arg(required = true, help = "Python source files")]
        files: Vec<PathBuf>,

        #[arg(
            long = "function",
            value_name = "NAME",
            help = "Only generate tests for this function (repeatable)"
        )]
        functions: Vec<String>,
    },

    #[command(about = "Check that the LLM provider and model are available")]
    Health,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli::Config {
        verbose: cli.verbose,
        settings_path: cli.config,
    };

    match cli.command {
        Commands::Extract { files, json } => {
            cli::extract(files, json, &config).await?;
        }
        Commands::Generate { files, functions } => {
            cli::generate(files, functions, &config).await?;
        }
        Commands::Health => {
            cli::health(&config).await?;
        }
    }

    Ok(())
}
