//! Snare CLI

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use serde_json::json;
use tracing::info;

use snare::{Config, Extractor, InterceptionConfig};

#[derive(Parser)]
#[command(
    name = "snare",
    about = "Capture requests and evaluate scripts in a rendering engine",
    version
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Site description for the scripted engine
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the requests a page issues
    Intercept {
        /// Page to load
        url: String,

        /// Capture window in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum number of requests to capture
        #[arg(long)]
        max_requests: Option<usize>,

        /// Only capture URLs matching this regular expression
        #[arg(long)]
        pattern: Option<String>,

        /// Filter script such as `return url.includes('api')`
        #[arg(long)]
        filter: Option<String>,

        /// Script injected once the page finished loading
        #[arg(long)]
        page_script: Option<String>,

        /// Identity string presented while loading
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Print the first request URL matching a pattern
    Urls {
        /// Page to load
        url: String,

        /// Regular expression the URL must match
        pattern: String,

        /// Capture window in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the VRF token of the page's reader request
    Vrf {
        /// Page to load
        url: String,

        /// Capture window in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Evaluate a script, optionally after loading a page
    Eval {
        /// Script to evaluate
        script: String,

        /// Page to load first
        #[arg(long)]
        url: Option<String>,

        /// Evaluation budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Identity string presented while polling
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Print the engine's default identity string
    UserAgent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("snare=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(replay) = cli.replay {
        config.engine.replay_file = Some(replay);
    }

    let extractor = Extractor::from_config(&config).context("starting engine")?;
    info!("Using {} engine", extractor.pool().backend());

    tokio::select! {
        output = run(&extractor, &config, cli.command) => {
            println!("{}", serde_json::to_string_pretty(&output?)?);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}

async fn run(
    extractor: &Extractor,
    config: &Config,
    command: Commands,
) -> Result<serde_json::Value> {
    let millis = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));

    let output = match command {
        Commands::Intercept {
            url,
            timeout_ms,
            max_requests,
            pattern,
            filter,
            page_script,
            user_agent,
        } => {
            let mut request_config = InterceptionConfig::new(
                timeout_ms.unwrap_or(config.timeouts.capture_ms),
                max_requests.unwrap_or(config.timeouts.filter_max_requests),
            );
            if let Some(pattern) = pattern {
                request_config = request_config.with_pattern_str(&pattern)?;
            }
            if let Some(filter) = filter {
                request_config = request_config.with_filter_script(filter);
            }
            if let Some(page_script) = page_script {
                request_config = request_config.with_page_script(page_script);
            }
            if let Some(user_agent) = user_agent {
                request_config = request_config.with_user_agent(user_agent);
            }

            let requests = extractor.intercept_requests(&url, request_config).await?;
            serde_json::to_value(requests)?
        }
        Commands::Urls {
            url,
            pattern,
            timeout_ms,
        } => {
            let pattern = Regex::new(&pattern).context("invalid pattern")?;
            let urls = extractor
                .capture_urls(&url, &pattern, millis(timeout_ms, config.timeouts.capture_ms))
                .await?;
            json!(urls)
        }
        Commands::Vrf { url, timeout_ms } => {
            let token = extractor
                .extract_vrf_token(&url, millis(timeout_ms, config.timeouts.vrf_ms))
                .await?;
            json!({ "vrf": token })
        }
        Commands::Eval {
            script,
            url,
            timeout_ms,
            user_agent,
        } => {
            let timeout = millis(timeout_ms, config.timeouts.script_ms);
            let result = match user_agent {
                Some(user_agent) => {
                    extractor
                        .evaluate_script_as(url.as_deref(), &script, timeout, &user_agent)
                        .await?
                }
                None => {
                    extractor
                        .evaluate_script(url.as_deref(), &script, timeout)
                        .await?
                }
            };
            json!({ "result": result })
        }
        Commands::UserAgent => json!({ "user_agent": extractor.default_user_agent().await }),
    };

    Ok(output)
}
