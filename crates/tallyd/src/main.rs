use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tallyd::{format_history, format_snapshot, run_sweep, spawn_sweeper, stale_job_age};
use tl_api::rest::health::init_start_time;
use tl_api::{build_router, AppState};
use tl_config::DaemonConfig;
use tl_usage::{UsagePeriod, UsageSnapshot};

#[derive(Parser)]
#[command(
    name = "tallyd",
    version = tallyd::DAEMON_VERSION,
    about = "Tally usage accounting daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Port to bind to (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check daemon status
    Status,
    /// Show an account's usage for the current period
    Usage {
        account_id: String,
        /// Plan tier used when the account has no active period
        #[arg(long)]
        plan: Option<String>,
        /// Tokens the next report is expected to consume
        #[arg(long, default_value_t = 0)]
        estimated_tokens: i64,
    },
    /// List an account's usage periods, newest first
    History { account_id: String },
    /// Run one reconciliation pass against the local database
    Sweep,
    /// Print version
    Version,
}

fn account_url(
    config: &DaemonConfig,
    account_id: &str,
    leaf: &str,
) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(&format!("http://{}/", config.bind_addr()))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Daemon address cannot carry a path"))?
        .extend(["api", "v1", "accounts", account_id, leaf]);
    Ok(url)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    config: &DaemonConfig,
    request: reqwest::RequestBuilder,
) -> anyhow::Result<T> {
    let request = match &config.api_token {
        Some(token) => request.bearer_auth(token),
        None => request,
    };
    let resp = request.send().await.map_err(|e| {
        anyhow::anyhow!("Could not reach daemon at {}: {}", config.bind_addr(), e)
    })?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("Daemon returned {}: {}", status, text);
    }
    Ok(resp.json().await?)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutting down...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tallyd=info,tl_api=info,tl_usage=info,tower_http=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { port } => {
            let mut config = DaemonConfig::load()?;
            if let Some(port) = port {
                config.port = port;
            }
            config.paths()?.ensure_config_dir()?;

            init_start_time();

            let state = AppState::new(config.clone())?;
            let sweep_plan = state.default_plan();
            let sweeper = spawn_sweeper(state.tracker.clone(), &config.sweep, sweep_plan);
            if state.api_token_hash.is_none() {
                tracing::warn!("No api_token configured; account and job routes are open");
            }
            let app = build_router(state);

            let addr: SocketAddr = config.bind_addr().parse()?;
            tracing::info!("Listening on {}", addr);
            println!("Tally daemon running...");
            println!();
            println!("  API:  http://{}", addr);
            println!();

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if let Some(handle) = sweeper {
                handle.abort();
            }
            Ok(())
        }

        Commands::Status => {
            let config = DaemonConfig::load()?;
            match reqwest::get(format!("http://{}/api/v1/health", config.bind_addr())).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Daemon is running at {}", config.bind_addr());
                    println!("Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("Uptime: {}s", body["uptime_secs"].as_u64().unwrap_or(0));
                    println!(
                        "Auth: {}",
                        if body["auth_required"].as_bool().unwrap_or(false) {
                            "service token required"
                        } else {
                            "open"
                        }
                    );
                }
                Err(_) => {
                    println!("Daemon is not running (could not reach {})", config.bind_addr());
                }
            }
            Ok(())
        }

        Commands::Usage {
            account_id,
            plan,
            estimated_tokens,
        } => {
            let config = DaemonConfig::load()?;
            let url = account_url(&config, &account_id, "usage")?;
            let mut query = vec![("estimated_tokens", estimated_tokens.to_string())];
            if let Some(plan) = plan {
                query.push(("plan", plan));
            }
            let request = reqwest::Client::new().get(url).query(&query);
            let snapshot: UsageSnapshot = get_json(&config, request).await?;
            println!("{}", format_snapshot(&account_id, &snapshot));
            Ok(())
        }

        Commands::History { account_id } => {
            let config = DaemonConfig::load()?;
            let url = account_url(&config, &account_id, "periods")?;
            let request = reqwest::Client::new().get(url);
            let periods: Vec<UsagePeriod> = get_json(&config, request).await?;
            println!("{}", format_history(&periods));
            Ok(())
        }

        Commands::Sweep => {
            let config = DaemonConfig::load()?;
            let state = AppState::new(config.clone())?;
            let plan = state.default_plan();
            let stale_after = stale_job_age(&config.sweep);
            let report = run_sweep(state.tracker.clone(), stale_after, plan).await?;
            println!("Released leaked reservations: {}", report.leaked_released);
            println!("Settled stale jobs:           {}", report.stale_settled);
            Ok(())
        }

        Commands::Version => {
            println!("tallyd {}", tallyd::DAEMON_VERSION);
            Ok(())
        }
    }
}
