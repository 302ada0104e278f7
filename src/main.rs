//! QuizCluster - Replicated Quiz Service
//!
//! Runs either the directory service or one data node.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quizcluster::api::StatusServer;
use quizcluster::config::ClusterConfig;
use quizcluster::directory::DirectoryService;
use quizcluster::error::Result;
use quizcluster::node::DataNode;

/// QuizCluster - Replicated Quiz Service
#[derive(Parser)]
#[command(name = "quizcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when it is missing)
    #[arg(short, long, default_value = "quizcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the directory service
    Directory {
        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Status API address (host:port)
        #[arg(long)]
        api: Option<String>,
    },

    /// Run a data node
    Node {
        /// Directory address (host:port)
        #[arg(short, long)]
        directory: Option<String>,

        /// Store file
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Interface address used for multicast
        #[arg(short, long)]
        interface: Option<Ipv4Addr>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "quizcluster.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        Commands::Directory { port, api } => {
            let mut config = load(&cli.config, cli.log_level.as_deref())?;
            if let Some(port) = port {
                config.directory.bind_address = format!("0.0.0.0:{}", port);
            }
            if let Some(api) = api {
                config.api.bind_address = api;
            }
            run_directory(config).await
        }
        Commands::Node {
            directory,
            store,
            interface,
        } => {
            let mut config = load(&cli.config, cli.log_level.as_deref())?;
            if let Some(directory) = directory {
                config.node.directory_address = directory;
            }
            if let Some(store) = store {
                config.node.store_path = store;
            }
            if let Some(interface) = interface {
                config.node.multicast_interface = interface;
            }
            config.validate()?;
            run_node(config).await
        }
    }
}

/// Load the configuration, then initialize logging from it
fn load(path: &std::path::Path, log_level: Option<&str>) -> Result<ClusterConfig> {
    let config = ClusterConfig::load_or_default(path);
    let level = match (&config, log_level) {
        (_, Some(level)) => level.to_string(),
        (Ok(c), None) => c.logging.level.clone(),
        (Err(_), None) => "info".to_string(),
    };
    init_logging(&level);

    match config {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            Err(e)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel `token` on ctrl-c
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
        }
        token.cancel();
    });
}

/// Run the directory service and its status API
async fn run_directory(config: ClusterConfig) -> Result<()> {
    tracing::info!("Starting QuizCluster directory...");

    let service = DirectoryService::bind(&config.directory).await?;
    let api = StatusServer::new(config.api.clone(), service.registry());

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let api_shutdown = shutdown.child_token();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.start(api_shutdown).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    let result = service.run(shutdown.clone()).await;
    shutdown.cancel();
    let _ = api_handle.await;

    tracing::info!("QuizCluster directory shutdown complete");
    result
}

/// Run one data node until shutdown or a fatal fault
async fn run_node(config: ClusterConfig) -> Result<()> {
    tracing::info!("Starting QuizCluster data node...");

    let node = match DataNode::start(config.node.clone()).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("Failed to start data node: {}", e);
            tracing::error!("  Store: {:?}", config.node.store_path);
            tracing::error!("  Directory: {}", config.node.directory_address);
            return Err(e);
        }
    };

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let result = node.run(shutdown).await;
    if let Err(ref e) = result {
        if e.is_fatal() {
            tracing::error!("Node must be restarted to rejoin the cluster");
        }
    }

    tracing::info!("QuizCluster data node shutdown complete");
    result
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# QuizCluster Configuration
# Generated configuration file

[directory]
bind_address = "0.0.0.0:4545"
# Nodes silent for longer than this are dropped
node_timeout_ms = 17000
monitor_interval_ms = 5000

[node]
directory_address = "127.0.0.1:4545"
store_path = "/var/lib/quizcluster/quiz.db"
client_bind_address = "0.0.0.0:0"
transfer_bind_address = "0.0.0.0:0"
multicast_group = "230.30.30.30"
multicast_port = 4446
# Set to this host's address on multi-homed machines
multicast_interface = "0.0.0.0"
heartbeat_interval_ms = 5000
reply_timeout_ms = 3000
register_retry_ms = 2000
bootstrap_attempts = 5
client_keepalive_ms = 10000

[client]
directory_address = "127.0.0.1:4545"
discovery_timeout_ms = 5000
discovery_retry_ms = 2000
same_primary_backoff_ms = 20000
connect_timeout_ms = 5000
request_timeout_ms = 30000

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart the directory with: quizcluster --config {} directory", output.display());
    println!("Then start nodes with:    quizcluster --config {} node", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Directory:      {}", config.directory.bind_address);
            println!("  Node timeout:   {} ms", config.directory.node_timeout_ms);
            println!("  Store:          {}", config.node.store_path.display());
            println!(
                "  Multicast:      {}:{} via {}",
                config.node.multicast_group, config.node.multicast_port, config.node.multicast_interface
            );
            println!("  Heartbeat:      {} ms", config.node.heartbeat_interval_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
