use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repolist::config::API_KEY;
use repolist::github::repository_names;
use repolist::{AppContext, Config, Preferences};

#[derive(Parser)]
#[command(name = "repolist")]
#[command(about = "List a GitHub user's repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Preferences file path (defaults to XDG config location)
    #[arg(long)]
    preferences: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List repository names
    List {
        /// Users to list (defaults to the configured user)
        users: Vec<String>,

        /// Use the cached client profile
        #[arg(long)]
        cached: bool,
    },

    /// Manage the stored API token
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Inspect or empty the response cache
    Cache {
        #[command(subcommand)]
        cache_command: CacheCommands,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Store a token
    Set {
        /// GitHub token
        token: String,
    },

    /// Remove the stored token
    Clear,

    /// Show whether a token is configured
    Status,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache location and usage
    Info,

    /// Remove all cached responses
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config)?;
    debug!("Starting repolist v{}", env!("CARGO_PKG_VERSION"));

    let mut prefs = match &cli.preferences {
        Some(path) => Preferences::load(path)?,
        None => Preferences::load_default()?,
    };

    match cli.command {
        Commands::List { users, cached } => cmd_list(config, &prefs, users, cached).await,
        Commands::Auth { auth_command } => cmd_auth(auth_command, &mut prefs),
        Commands::Cache { cache_command } => cmd_cache(cache_command, config, &prefs).await,
        Commands::Config { config_command } => cmd_config(config_command, &config, &cli.config),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// List repositories for each user, concurrently
async fn cmd_list(
    config: Config,
    prefs: &Preferences,
    users: Vec<String>,
    cached: bool,
) -> Result<ExitCode> {
    let users = if users.is_empty() {
        vec![config.api.user.clone()]
    } else {
        users
    };

    let context = AppContext::init(config, prefs)?;
    let github = context.github();

    let results = futures::future::join_all(users.iter().map(|user| async move {
        let result = if cached {
            github.list_repositories_cached(user).await
        } else {
            github.list_repositories(user).await
        };
        (user, result)
    }))
    .await;

    let mut failed = false;
    let show_headers = users.len() > 1;

    for (user, result) in results {
        if show_headers {
            println!("# {}", user);
        }
        match result {
            Ok(repositories) => {
                for name in repository_names(&repositories) {
                    println!("{}", name);
                }
            }
            Err(e) => {
                debug!("Listing {} failed: {:?}", user, e);
                eprintln!("{}", e.user_message());
                failed = true;
            }
        }
    }

    context.shutdown();

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_auth(command: AuthCommands, prefs: &mut Preferences) -> Result<ExitCode> {
    match command {
        AuthCommands::Set { token } => {
            prefs.set_string(API_KEY, token.trim());
            prefs.save()?;
            info!("Token stored in {:?}", prefs.path());
            println!("Token saved");
        }
        AuthCommands::Clear => {
            if prefs.remove(API_KEY).is_some() {
                prefs.save()?;
                println!("Token removed");
            } else {
                println!("No token stored");
            }
        }
        AuthCommands::Status => {
            let token = repolist::AuthToken::from_store(prefs);
            if token.is_present() {
                println!("Token configured, requests are authenticated");
            } else {
                println!("No token configured, requests are anonymous");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_cache(command: CacheCommands, config: Config, prefs: &Preferences) -> Result<ExitCode> {
    let context = AppContext::init(config, prefs)?;

    let Some(cache) = context.cached_client().cache() else {
        println!("Response cache is disabled");
        context.shutdown();
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        CacheCommands::Info => {
            println!("Location: {}", cache.directory().display());
            println!("Entries:  {}", cache.entry_count().await?);
            println!(
                "Size:     {} / {} bytes",
                cache.size().await?,
                cache.max_size()
            );
        }
        CacheCommands::Clear => {
            cache.clear().await?;
            println!("Response cache cleared");
        }
    }

    context.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(
    command: ConfigCommands,
    config: &Config,
    config_path: &Option<std::path::PathBuf>,
) -> Result<ExitCode> {
    match command {
        ConfigCommands::Show => {
            let rendered =
                serde_yaml::to_string(config).context("Failed to serialize configuration")?;
            print!("{}", rendered);
        }
        ConfigCommands::Path => {
            let path = match config_path {
                Some(path) => path.clone(),
                None => Config::default_config_path()?,
            };
            println!("{}", path.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}
