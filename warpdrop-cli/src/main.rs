mod event;
mod ui;

use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

use warpdrop_core::auth::{Authenticator, Credentials, SelfSignedAuthenticator};
use warpdrop_core::config::Settings;
use warpdrop_engine::discovery::Discovery;
use warpdrop_engine::orchestrator::{ErrorReporter, LanMonitor, ServiceOrchestrator};
use warpdrop_engine::registry::{RegistryDiscoveryBridge, RemoteRegistry};
use warpdrop_engine::server::RpcServer;
use warpdrop_engine::session::{RegistrationSessionHandler, TransferSessionHandler};
use warpdrop_engine::tls::{TlsListenerFactory, TlsPeerConnector};
use warpdrop_engine::trust::TrustStore;

use crate::event::{Console, spawn_loading_printer};
use crate::ui::{print_banner, print_help, print_peer_table, print_prompt, read_line};

/// Warpdrop — secure peer-to-peer transfer over the local network.
///
/// Advertises this device over mDNS, watches for other devices, and
/// keeps a mutually-authenticated TLS channel to every discovered peer.
/// An interactive prompt shows the peer list and lets you reconnect,
/// forget peers, or restart the whole service stack.
#[derive(Parser, Debug)]
#[command(name = "warpdrop", version, about)]
struct Args {
    /// Stable identity advertised to peers. Random for each run when
    /// not given.
    #[arg(short, long)]
    identity: Option<String>,

    /// Human-readable name for this device.
    #[arg(short = 'n', long, default_value = "Warpdrop-CLI")]
    name: String,

    /// Port for the transfer endpoint.
    #[arg(long, default_value_t = 42000)]
    transfer_port: u16,

    /// Port for the registration endpoint.
    #[arg(long, default_value_t = 42001)]
    registration_port: u16,

    /// Delete stored credentials and regenerate before starting.
    #[arg(long)]
    refresh_credentials: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warpdrop_cli=info,warn")),
        )
        .init();

    let identity = args
        .identity
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let settings = Settings {
        device_identity: identity.clone(),
        hostname: args.name.clone(),
        transfer_port: args.transfer_port,
        registration_port: args.registration_port,
        refresh_credentials: args.refresh_credentials,
    };

    let authenticator: Arc<dyn Authenticator> = Arc::new(SelfSignedAuthenticator::new(
        settings.device_identity.clone(),
        settings.hostname.clone(),
    ));
    let trust = Arc::new(TrustStore::new());
    let console = Arc::new(Console);

    // Peer connections dial registration endpoints with first-contact
    // trust; the handshake pins certificates for everything after.
    let connector = Arc::new(TlsPeerConnector::first_contact(authenticator.clone()));
    let registry = Arc::new(RemoteRegistry::new(
        connector,
        authenticator.clone(),
        trust.clone(),
        console.clone(),
        settings.clone(),
    ));

    let bridge = Arc::new(RegistryDiscoveryBridge::new(registry.clone()));
    let discovery = match Discovery::new(settings.clone(), bridge) {
        Ok(discovery) => Arc::new(discovery),
        Err(e) => {
            eprintln!("Failed to initialise discovery: {e}");
            std::process::exit(1);
        }
    };

    let transfer_server = Arc::new(RpcServer::new(
        "transfer",
        format!("0.0.0.0:{}", settings.transfer_port),
        authenticator.clone(),
        {
            let trust = trust.clone();
            move |credentials: &Credentials| TlsListenerFactory::transfer(credentials, trust.clone())
        },
        Arc::new(TransferSessionHandler::new(settings.clone())),
    ));

    let registration_server = Arc::new(RpcServer::new(
        "registration",
        format!("0.0.0.0:{}", settings.registration_port),
        authenticator.clone(),
        |credentials: &Credentials| TlsListenerFactory::registration(credentials),
        Arc::new(RegistrationSessionHandler::new(
            settings.clone(),
            authenticator.clone(),
            trust.clone(),
        )),
    ));

    let orchestrator = Arc::new(ServiceOrchestrator::new(
        discovery,
        transfer_server,
        registration_server,
        registry.clone(),
        LanMonitor,
        console.clone(),
        authenticator.clone(),
        settings.clone(),
    ));

    spawn_loading_printer(orchestrator.subscribe_loading());

    if let Err(e) = orchestrator.startup().await {
        console.report(e.kind(), &format!("Could not start services: {e}"));
        std::process::exit(1);
    }
    if let Err(e) = orchestrator.publish_discovery().await {
        // Stay up but undiscoverable; peers can still reach us directly.
        console.report(e.kind(), &format!("Could not publish discovery record: {e}"));
    }

    print_banner(
        &settings.device_identity,
        &settings.hostname,
        settings.transfer_port,
        settings.registration_port,
    );
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        let Some(line) = read_line(&mut stdin).await else {
            // EOF — shut down.
            break;
        };

        if line.is_empty() {
            print_prompt();
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        match parts[0] {
            "list" | "ls" => {
                print_peer_table(&registry.snapshot().await);
            }
            "connect" => match parts.get(1) {
                Some(identity) => registry.start_connection(identity.trim()).await,
                None => println!("  Usage: connect <identity>"),
            },
            "remove" => match parts.get(1) {
                Some(identity) => registry.remove_peer(identity.trim()).await,
                None => println!("  Usage: remove <identity>"),
            },
            "restart" => {
                // Same path a settings screen with restart_required
                // would take.
                orchestrator.restart().await;
            }
            "help" | "?" => {
                print_help();
            }
            "quit" | "exit" | "q" => {
                break;
            }
            other => {
                println!("  Unknown command: \"{other}\".  Type 'help' for usage.");
            }
        }

        print_prompt();
    }

    println!("\n  Shutting down...");
    orchestrator.shutdown().await;
    println!("  Bye! 👋");
}
