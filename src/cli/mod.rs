use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigLoader;
use crate::engine::Engine;
use crate::storage;

pub mod commands;

use self::commands::{AddArgs, DeleteArgs, ExportArgs, ImportArgs, ListArgs, SearchArgs};

#[derive(Parser, Debug)]
#[command(
    name = "copyboard",
    version,
    about = "Bounded, searchable clipboard history"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over COPYBOARD_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over COPYBOARD_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add text to the history (reads stdin when TEXT is omitted)
    Add(AddArgs),
    /// Print the history, most recent first
    List(ListArgs),
    /// Rank history entries against a query
    Search(SearchArgs),
    /// Delete one entry by id
    Delete(DeleteArgs),
    /// Empty the history
    Clear,
    /// Switch copy detection on or off
    Toggle,
    /// Show entry counts and compression ratios
    Stats,
    /// Write the history as JSON
    Export(ExportArgs),
    /// Replace the history with entries from a JSON file
    Import(ImportArgs),
    /// Treat each stdin line as a copy event and debounce it into the history
    Watch,
    /// Answer one JSON request per stdin line
    Serve,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("COPYBOARD_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("COPYBOARD_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let persistence = storage::init(&paths, &config.storage)?;
    let engine = Engine::new(&config, persistence)?;

    match cli.command {
        Commands::Add(args) => commands::add(&engine, args),
        Commands::List(args) => commands::list(&engine, args),
        Commands::Search(args) => commands::search(&engine, args),
        Commands::Delete(args) => commands::delete(&engine, args),
        Commands::Clear => commands::clear(&engine),
        Commands::Toggle => commands::toggle(&engine),
        Commands::Stats => commands::stats(&engine),
        Commands::Export(args) => commands::export(&engine, args),
        Commands::Import(args) => commands::import(&engine, args),
        Commands::Watch => commands::watch(&engine),
        Commands::Serve => commands::serve(&engine),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
    })
    .map(|_| ())
}
