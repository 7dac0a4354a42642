//! DNS seed node.
//!
//! A node whose sole purpose is answering "who else is out there?": it
//! accepts connections, replies with its address book, and disconnects.

use chain_p2p::{FixedHeight, NullEventSink, P2pConfig, Server};
use clap::Parser;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dns-seed")]
#[command(about = "Blockchain DNS seed node", long_about = None)]
struct Cli {
    /// Address book file path
    #[arg(long = "path", default_value = "./address_book.json")]
    path: String,

    /// Listen address
    #[arg(long = "listen", default_value = "tcp://0.0.0.0:8888")]
    listen: String,

    /// Maximum number of connected outbound peers
    #[arg(long = "out", default_value_t = 4)]
    out: usize,

    /// Maximum number of connected inbound peers
    #[arg(long = "in", default_value_t = 8)]
    inbound: usize,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = P2pConfig {
        addr_book_file_path: cli.path,
        listen_address: cli.listen,
        max_conn_out_bound: cli.out,
        max_conn_in_bound: cli.inbound,
        seed_mode: true,
        ..Default::default()
    };

    let server = match Server::new(config, Arc::new(NullEventSink), Arc::new(FixedHeight(0))) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            eprintln!("failed to create dns seed: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = server.clone().start().await {
        eprintln!("failed to start dns seed: {}", err);
        std::process::exit(1);
    }

    wait_for_shutdown().await;
    println!("Stop DNS Seed");
    server.stop().await;
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                log::warn!("failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
