//! NodeLink - Private binary node protocol
//!
//! A length-prefixed TCP protocol with an IP allow-list login, client-driven
//! heartbeats and automatic reconnect.

mod config;
mod network;
mod protocol;
mod session;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{resolve_host, Client, ClientEvent, Server, ServerEvent};

/// NodeLink - Private binary node protocol
#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(author = "NodeLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run a NodeLink server or client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept client logins and answer heartbeats
    Server {
        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Allow logins from this IP (repeatable, replaces the configured list)
        #[arg(short, long = "allow")]
        allow: Vec<String>,
    },

    /// Connect to a server and keep the session alive
    Client {
        /// Server host name or IP
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Fixed local address to bind, e.g. 127.0.0.1:12088
        #[arg(short, long)]
        local: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { bind, port, allow } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if !allow.is_empty() {
                config.server.allow_list = allow;
            }
            config.validate()?;
            run_server(config).await?;
        }
        Commands::Client { host, port, local } => {
            if let Some(host) = host {
                config.client.server_host = host;
            }
            if let Some(port) = port {
                config.client.server_port = port;
            }
            if local.is_some() {
                config.client.local_address = local;
            }
            config.validate()?;
            run_client(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the server
async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server_bind_addr()?;
    let mut server = Server::new(bind_addr, config.network_config()?, config.allow_list());

    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    tracing::info!(
        "Starting NodeLink server '{}', allowing {:?}",
        config.general.name,
        config.server.allow_list
    );
    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  NodeLink Server Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Listening: {}", local_addr);
    println!("  Allowed: {}", config.server.allow_list.join(", "));
    println!("========================================");
    println!("\nWaiting for clients to log in...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr } => {
                        tracing::debug!("Client connected: {}", addr);
                    }
                    ServerEvent::ClientAuthenticated { addr } => {
                        println!("+ Client logged in: {}", addr);
                    }
                    ServerEvent::ClientDisconnected { addr, reason } => {
                        tracing::info!("Client disconnected: {} - {}", addr, reason);
                        println!("- Client disconnected: {} ({})", addr, reason);
                    }
                    ServerEvent::MessageReceived { addr, message } => {
                        tracing::info!("Message from {}: {}", addr, message);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the client until Ctrl+C
async fn run_client(config: Config) -> anyhow::Result<()> {
    let server_addr: SocketAddr =
        resolve_host(&config.client.server_host, config.client.server_port).await?;
    let net_config = config.network_config()?;

    tracing::info!(
        "Connecting to server at {} as '{}'",
        server_addr,
        config.general.name
    );
    if let Some(local_addr) = net_config.local_addr {
        tracing::info!("Binding local address {}", local_addr);
    }

    let mut client = Client::new(net_config, server_addr);
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    // Print events while the client runs
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ClientEvent::Connected { server_addr } => {
                    tracing::debug!("Connected to {}", server_addr);
                }
                ClientEvent::Authenticated { server_addr } => {
                    println!("+ Logged in to {}", server_addr);
                }
                ClientEvent::Disconnected { reason } => {
                    println!("- Disconnected: {}", reason);
                }
                ClientEvent::MessageReceived { message } => {
                    tracing::info!("Message: {}", message);
                }
            }
        }
    });

    println!("Press Ctrl+C to disconnect.\n");

    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nDisconnecting...");
        })
        .await;

    drop(client);
    let _ = printer.await;
    tracing::info!("Client stopped");

    Ok(())
}
