use clap::Parser;
use roma_server::{BasicCommands, Config, Server};
use std::thread;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Read shards for socket reads (0 = auto, 1 = reactor thread only)
    #[arg(short = 't', long, default_value_t = 0)]
    io_threads: usize,

    /// Maximum number of connected clients
    #[arg(long, default_value_t = 10_000)]
    max_clients: usize,

    /// Close clients idle for this many seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config {
            bind_addr: args.bind.clone(),
            port: args.port,
            io_threads: args.io_threads,
            max_clients: args.max_clients,
            client_idle_timeout_secs: args.timeout,
            ..Default::default()
        }
    };

    // Initialize tracing
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("roma_server={}", log_level))
        .init();

    info!(
        "Starting roma-server v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port
    );

    let server = Server::bind(config, Box::new(BasicCommands))?;
    let mut el = server.event_loop()?;
    let stop = el.stop_handle();

    // Setup signal handlers for graceful shutdown
    let (signal_tx, signal_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })?;

    let reactor = thread::Builder::new()
        .name("reactor".to_string())
        .spawn(move || {
            let mut server = server;
            el.run(&mut server);
            server.terminate(&mut el);
        })?;

    if signal_rx.recv().is_ok() {
        info!("Received shutdown signal, shutting down gracefully...");
    }
    stop.stop_and_wait();

    if reactor.join().is_err() {
        error!("Reactor thread panicked");
        anyhow::bail!("reactor thread panicked");
    }

    info!("Server shutdown complete");
    Ok(())
}
