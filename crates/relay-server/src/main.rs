use std::net::IpAddr;

use clap::Parser;
use log::LevelFilter;
use relay_net::{Server, ServerConfig};
use tokio_util::sync::CancellationToken;

/// Broadcast relay server: accepts clients, groups them into rooms, and
/// fans out room commands to the other members.
#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 7890)]
    port: u16,

    /// Capacity of each connection's outbound command queue.
    #[arg(long, default_value_t = 256)]
    outbound_queue_cap: usize,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (-q for warn, -qq for error, -qqq for silent).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

/// Default level is `info`, shifted by `-v`/`-q`, matching `args.verbose`/`args.quiet`.
fn level_filter(verbose: u8, quiet: u8) -> LevelFilter {
    let levels = [
        LevelFilter::Off,
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];
    let base = 3i32; // Info
    let shift = i32::from(verbose) - i32::from(quiet);
    let idx = (base + shift).clamp(0, levels.len() as i32 - 1) as usize;
    levels[idx]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(level_filter(args.verbose, args.quiet))
        .parse_default_env()
        .init();

    let server = Server::new(ServerConfig {
        listen_ip: args.bind,
        port: args.port,
        outbound_queue_cap: args.outbound_queue_cap,
        ..ServerConfig::default()
    });

    let listener = server.bind().await?;
    log::info!("listening on {}:{}", args.bind, args.port);

    let ct = CancellationToken::new();
    let shutdown = ct.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("received ctrl-c, shutting down");
        shutdown.cancel();
    });

    server.serve(listener, ct).await;
    Ok(())
}
