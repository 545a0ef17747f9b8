//! SockProxy - A Packet-Driven Socket Proxy
//!
//! This is the main entry point for the SockProxy server.
//! Each peer that connects over TCP gets its own proxy instance.

use anyhow::Context;
use sockproxy::protocol::ACK_HEADER_SIZE;
use sockproxy::proxy::ProxyConfig;
use sockproxy::storage::InstanceId;
use sockproxy::transport::serve_peer;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Bulk ring size per peer, in bytes
    ring_capacity: usize,
    /// Largest message exchanged with a peer
    max_message: usize,
    /// Log level used when RUST_LOG is not set
    log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: sockproxy::DEFAULT_HOST.to_string(),
            port: sockproxy::DEFAULT_PORT,
            ring_capacity: sockproxy::ingress::DEFAULT_RING_CAPACITY,
            max_message: sockproxy::DEFAULT_MAX_MESSAGE_SIZE,
            log_level: Level::INFO,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i).to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_value(&args, i, "port number");
                    i += 2;
                }
                "--ring-capacity" => {
                    config.ring_capacity = parse_value(&args, i, "ring capacity");
                    i += 2;
                }
                "--max-message" => {
                    config.max_message = parse_value(&args, i, "message size");
                    i += 2;
                }
                "--log-level" => {
                    config.log_level = parse_value(&args, i, "log level");
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("SockProxy version {}", sockproxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-peer instance configuration
    fn instance_config(&self, instance_id: InstanceId) -> ProxyConfig {
        ProxyConfig {
            ring_capacity: self.ring_capacity,
            ..ProxyConfig::for_instance(instance_id)
        }
    }
}

fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    value_of(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid {}", what);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
SockProxy - A Packet-Driven Socket Proxy

USAGE:
    sockproxy [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 7878)
        --ring-capacity <BYTES>  Bulk ring size per peer, a power of two (default: 65536)
        --max-message <BYTES>    Largest message exchanged with a peer (default: 16384)
        --log-level <LEVEL>      trace, debug, info, warn or error (default: info)
    -v, --version                Print version information
        --help                   Print this help message

RUST_LOG, when set, takes precedence over --log-level.

EXAMPLES:
    sockproxy                          # Start on 127.0.0.1:7878
    sockproxy --port 9000              # Start on port 9000
    sockproxy --host 0.0.0.0           # Listen on all interfaces
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
SockProxy v{} - Packet-Driven Socket Proxy
──────────────────────────────────────────────────────────────
Listening for peers on {}
Ring capacity {} bytes, max message {} bytes

Use Ctrl+C to shutdown gracefully.
"#,
        sockproxy::VERSION,
        config.bind_address(),
        config.ring_capacity,
        config.max_message
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    config
        .instance_config(InstanceId::new(0))
        .validate()
        .context("invalid proxy configuration")?;
    anyhow::ensure!(
        config.max_message > ACK_HEADER_SIZE,
        "--max-message must be larger than {} bytes",
        ACK_HEADER_SIZE
    );

    print_banner(&config);

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, &config) => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts peers, one proxy instance each
async fn accept_loop(listener: TcpListener, config: &Config) {
    let mut next_instance: u16 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                next_instance = next_instance.wrapping_add(1);
                let instance_config = config.instance_config(InstanceId::new(next_instance));
                let max_message = config.max_message;

                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, addr, instance_config, max_message).await {
                        debug!(peer = %addr, error = %e, "Peer session failed");
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
