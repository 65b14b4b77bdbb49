use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader, Stdin};

use warpdrop_core::peer::PeerRecord;

pub fn print_banner(identity: &str, hostname: &str, transfer_port: u16, registration_port: u16) {
    println!();
    println!("  Warpdrop — LAN peer transfer");
    println!("  Identity:  {identity}");
    println!("  Hostname:  {hostname}");
    println!("  Ports:     transfer {transfer_port}, registration {registration_port}");
    println!();
}

pub fn print_help() {
    println!("  Commands:");
    println!("    list               show discovered peers and their status");
    println!("    connect <identity> connect to a peer");
    println!("    remove <identity>  forget a peer");
    println!("    restart            restart discovery and servers");
    println!("    help               show this help");
    println!("    quit               shut down and exit");
    println!();
}

pub fn print_prompt() {
    print!("warpdrop> ");
    let _ = std::io::stdout().flush();
}

pub fn print_peer_table(records: &[PeerRecord]) {
    if records.is_empty() {
        println!("  No peers discovered yet.");
        return;
    }
    println!(
        "  {:<24} {:<16} {:<12} {:<8} {}",
        "IDENTITY", "HOSTNAME", "STATUS", "API", "ADDRESS"
    );
    for record in records {
        let address = record
            .ip_address
            .clone()
            .unwrap_or_else(|| record.endpoint.host.clone());
        println!(
            "  {:<24} {:<16} {:<12} {:<8} {}",
            record.identity, record.hostname, record.status, record.api_version, address
        );
        if let Some(cause) = &record.last_error {
            println!("      last error: {cause}");
        }
    }
}

/// Reads one line from stdin, trimmed. `None` on EOF.
pub async fn read_line(stdin: &mut BufReader<Stdin>) -> Option<String> {
    let mut line = String::new();
    match stdin.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
