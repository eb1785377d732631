use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rls_broker::auth::Provider;
use rls_broker::config;
use rls_broker::context::{self, BrokerContext};
use rls_broker::db::create_pool;
use rls_broker::db::postgres::PostgresConnector;
use rls_broker::observability::init_observability;

#[derive(Parser, Debug)]
#[command(name = "rls-broker")]
#[command(about = "Token exchange and row-level-security session broker", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity provider whose tokens are accepted
    #[arg(long)]
    provider: Option<Provider>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate both pools and bootstrap, then wait for Ctrl+C (default)
    Serve,
    /// Load configuration and validate both database pools
    Check,
    /// Print the public key as a JWK for database configuration
    Jwk,
    /// Exchange an external token and print the internal claims
    Exchange {
        /// Bearer token issued by the identity provider
        #[arg(long, env = "RLS_BROKER_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration with precedence: env > file > CLI > defaults
    let mut builder = if let Some(ref path) = args.config {
        config::load_config_from_path(path)?
    } else {
        config::load_config()?
    };

    if let Some(provider) = args.provider {
        builder = builder.provider(provider);
    }
    if args.verbose {
        builder = builder.log_level("debug");
    }
    if args.json_logs {
        builder = builder.json_logs(true);
    }

    let config = builder.build()?;

    init_observability(&config.telemetry)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let ctx = BrokerContext::from_config(&config).await?;
            tracing::info!(
                "Serving; admin {} authenticated {}",
                config::redact_url(&config.admin_url),
                config::redact_url(&config.authenticated_url),
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown signal received");
            ctx.shutdown();
        }
        Command::Check => {
            let ctx = BrokerContext::from_config(&config).await?;
            ctx.shutdown();
            println!("ok");
        }
        Command::Jwk => {
            let keys = context::load_keys(&config)?;
            println!("{}", keys.jwk().to_json());
        }
        Command::Exchange { token } => {
            let verifiers = context::build_verifiers(&config)?;
            let connector = PostgresConnector::new(
                config.authenticated_url.as_str(),
                config.pool.connect_timeout,
                &config.tls,
            )?;
            let pool = create_pool(connector, &config.pool)?;
            let broker = context::build_broker(&config, verifiers, pool)?;

            match broker.exchange(&token, config.provider).await {
                Ok(internal) => {
                    println!("{}", serde_json::to_string_pretty(internal.claims())?);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Exchange failed");
                    anyhow::bail!("{}", e.public());
                }
            }
        }
    }

    Ok(())
}
