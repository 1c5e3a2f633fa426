use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
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
struct MessageOutput<'a> {
    sequence: u64,
    size: usize,
    payload: String,
    peer: &'a str,
    timestamp: String,
}

pub fn print_message(payload: &[u8], sequence: u64, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                sequence,
                size: payload.len(),
                payload: payload_preview(payload),
                peer,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "SIZE", "PEER", "PAYLOAD"])
                .add_row(vec![
                    sequence.to_string(),
                    payload.len().to_string(),
                    peer.to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "seq={} size={} peer={} payload={}",
                sequence,
                payload.len(),
                peer,
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

/// Outcome of a `pump` run.
#[derive(Debug, Serialize)]
pub struct PumpReport {
    pub bytes: u64,
    pub element_size: usize,
    pub capacity: usize,
    pub two_phase: bool,
    pub elapsed_ms: u64,
    pub throughput_mib_s: f64,
    pub checksum_ok: bool,
}

pub fn print_pump_report(report: &PumpReport, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["BYTES", "ELEMENT", "CAPACITY", "MODE", "MS", "MiB/s", "CHECKSUM"])
                .add_row(vec![
                    report.bytes.to_string(),
                    report.element_size.to_string(),
                    report.capacity.to_string(),
                    mode(report).to_string(),
                    report.elapsed_ms.to_string(),
                    format!("{:.1}", report.throughput_mib_s),
                    checksum_label(report).to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "bytes={} element={} capacity={} mode={} elapsed_ms={} throughput={:.1}MiB/s checksum={}",
                report.bytes,
                report.element_size,
                report.capacity,
                mode(report),
                report.elapsed_ms,
                report.throughput_mib_s,
                checksum_label(report)
            );
        }
    }
}

fn mode(report: &PumpReport) -> &'static str {
    if report.two_phase {
        "two-phase"
    } else {
        "copy"
    }
}

fn checksum_label(report: &PumpReport) -> &'static str {
    if report.checksum_ok {
        "ok"
    } else {
        "MISMATCH"
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
