mod commands;
mod config_loader;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "alto", version, about = "Singer pipeline orchestration with a build-system heart")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to walking up from the working directory)
    #[arg(long, short = 'r', global = true)]
    root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tasks the configuration implies
    List {
        /// Include plumbing tasks (per-pipeline config renders)
        #[arg(long)]
        all: bool,
    },
    /// Run one or more tasks (and everything they depend on)
    Run {
        /// Task selectors: `build`, `catalog:tap-x`, `tap-x:target-y`, ...
        #[arg(required = true)]
        tasks: Vec<String>,
        /// Run independent tasks on this many worker threads
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Run the clean actions of the selected tasks
    Clean {
        /// Task selectors to clean
        #[arg(required = true)]
        scopes: Vec<String>,
    },
    /// Build (if needed) and execute a plugin with pass-through arguments
    Invoke {
        /// Plugin name
        plugin: String,
        /// Arguments forwarded to the plugin
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Scaffold alto.yaml and alto.secrets.yaml in the current directory
    Init,
    /// Print the effective merged configuration as JSON
    Dump,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let root = cli.root.as_deref();
    let code = match cli.command {
        Commands::List { all } => commands::list::execute(root, all)?,
        Commands::Run { tasks, parallel } => commands::run::execute(root, &tasks, parallel)?,
        Commands::Clean { scopes } => commands::clean::execute(root, &scopes)?,
        Commands::Invoke { plugin, args } => commands::invoke::execute(root, &plugin, &args)?,
        Commands::Init => {
            let dir = root
                .map(std::path::Path::to_path_buf)
                .unwrap_or(std::env::current_dir()?);
            commands::init::execute(&dir)?
        }
        Commands::Dump => commands::dump::execute(root)?,
    };
    std::process::exit(code);
}
