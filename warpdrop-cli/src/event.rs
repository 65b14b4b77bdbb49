use tokio::sync::watch;

use warpdrop_core::peer::PeerRecord;
use warpdrop_engine::orchestrator::{ErrorKind, ErrorReporter};
use warpdrop_engine::registry::PeerObserver;

use crate::ui::print_prompt;

/// Terminal implementation of the presentation callbacks: peer
/// add/remove lines and error reports, printed over the prompt.
pub struct Console;

impl PeerObserver for Console {
    fn peer_added(&self, record: &PeerRecord) {
        println!(
            "\n  📡 Found \"{}\" ({}) — connecting...",
            record.hostname, record.identity
        );
        print_prompt();
    }

    fn peer_removed(&self, identity: &str) {
        println!("\n  👋 Peer {identity} left");
        print_prompt();
    }
}

impl ErrorReporter for Console {
    fn report(&self, kind: ErrorKind, message: &str) {
        println!("\n  ❌ [{kind}] {message}");
        print_prompt();
    }
}

/// Prints a spinner-less loading notice while server startup runs.
pub fn spawn_loading_printer(mut loading_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        while loading_rx.changed().await.is_ok() {
            if *loading_rx.borrow() {
                println!("  ⏳ Starting services...");
            }
        }
    });
}
