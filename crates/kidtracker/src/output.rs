use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use kidtracker_frame::Packet;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput<'a> {
    manufacturer: &'a str,
    device_id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a str,
    length: usize,
    timestamp: String,
}

#[derive(Serialize)]
struct ListenerOutput<'a> {
    listener: &'a str,
    addr: String,
}

/// Print a packet received from the gateway.
pub fn print_packet(packet: &Packet, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PacketOutput {
                manufacturer: &packet.manufacturer,
                device_id: &packet.device_id,
                kind: packet.kind(),
                payload: packet.payload(),
                length: packet.content.len(),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MF", "DEVICE", "TYPE", "PAYLOAD"])
                .add_row(vec![
                    packet.manufacturer.clone(),
                    packet.device_id.clone(),
                    packet.kind().to_string(),
                    packet.payload().to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "mf={} device={} type={} length={} payload={}",
                packet.manufacturer,
                packet.device_id,
                packet.kind(),
                packet.content.len(),
                packet.payload()
            );
        }
        OutputFormat::Raw => {
            print_raw(packet.content.as_bytes());
            println!();
        }
    }
}

/// Announce a bound listener. Printed once per listener on startup so that
/// callers binding port 0 learn the actual address.
pub fn print_listening(name: &str, addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListenerOutput {
            listener: name,
            addr: addr.to_string(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["LISTENER", "ADDRESS"])
                .add_row(vec![name.to_string(), addr.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("listening listener={name} addr={addr}"),
        OutputFormat::Raw => println!("{name} {addr}"),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
