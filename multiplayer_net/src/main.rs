// CLI entry point for the multiplayer relay.
//
// Starts a standalone relay server that clients connect to over TCP. The
// relay only routes messages between clients; see `server.rs` for the
// routing rules and `socket.rs` for the networking architecture.
//
// Usage:
//   relay [OPTIONS]
//     --bind <ADDR>    Listen address (default: 127.0.0.1)
//     --port <PORT>    Listen port (default: 7878)
//     --debug          Log at debug level (RUST_LOG overrides)
//
// Ctrl+C disposes the server, closing every client connection, and exits.

use std::sync::mpsc;

use anyhow::Context;
use multiplayer_lifetime::Lifetime;
use multiplayer_net::MultiPlayerServer;
use multiplayer_net::config::{RELAY_USAGE, RelayArgs, RelayConfig, parse_relay_args};
use multiplayer_protocol::{ClientId, MultiPlayerMessage};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = match parse_relay_args(std::env::args().skip(1)) {
        Ok(RelayArgs::Run(config)) => config,
        Ok(RelayArgs::Help) => {
            println!("{RELAY_USAGE}");
            return Ok(());
        }
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{RELAY_USAGE}");
            std::process::exit(1);
        }
    };
    init_logging(&config);

    let server = MultiPlayerServer::socket(config.server.clone());
    log_activity(&server);
    server
        .open_for_new_connections()
        .wait()
        .with_context(|| format!("failed to listen on {}", config.server.socket_addr()))?;

    info!(server = %server.server_id(), "relay listening; press Ctrl+C to stop");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        stop_tx.send(()).ok();
    })
    .context("failed to install Ctrl+C handler")?;
    stop_rx.recv().ok();

    info!(clients = server.client_count(), "shutting down");
    server.dispose();
    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` wins over `--debug`.
fn init_logging(config: &RelayConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn log_activity(server: &MultiPlayerServer) {
    let forever = Lifetime::forever();
    server.new_remote_user().subscribe(
        |id: &ClientId| info!(client = %id, "joined"),
        &forever,
    );
    server.remote_user_left().subscribe(
        |id: &ClientId| info!(client = %id, "left"),
        &forever,
    );
    server.message_received().subscribe(
        |msg: &MultiPlayerMessage| {
            debug!(
                from = %msg.sender_id(),
                to = ?msg.recipient(),
                event = msg.event_id(),
                bytes = msg.payload().len(),
                "relaying"
            );
        },
        &forever,
    );
    server.undeliverable().subscribe(
        |msg: &MultiPlayerMessage| {
            info!(from = %msg.sender_id(), to = ?msg.recipient(), "undeliverable");
        },
        &forever,
    );
}
