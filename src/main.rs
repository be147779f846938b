use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use shadow_rs::shadow;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use sharktooth::correlator::CorrelatorConfig;
use sharktooth::devices::RegistryConfig;
use sharktooth::protocol::{hex_string, DecodedOperation};
use sharktooth::session::{DeviceSession, Session, SessionOptions};
use sharktooth::types::{DecodeStatus, DeviceId};

shadow!(build);

#[derive(Debug, Parser)]
#[command(
    about = "Reconstructs spectrometer protocol sessions from Wireshark USB captures",
    version = build::CLAP_LONG_VERSION
)]
struct Cli {
    /// Wireshark JSON export ("Export Packet Dissections > As JSON")
    #[arg()]
    capture: PathBuf,

    /// Idle seconds after which an address is assumed re-enumerated
    #[arg(long, default_value_t = 5.0)]
    idle_gap: f64,

    /// Bulk command endpoint (inferred per device when omitted)
    #[arg(long)]
    command_endpoint: Option<u8>,

    /// Bulk response endpoint (inferred per device when omitted)
    #[arg(long)]
    response_endpoint: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the devices seen in the capture
    #[command()]
    Devices,

    /// List decoded operations
    #[command()]
    Operations {
        /// Only this device (e.g. "7" or "7.1" for a later epoch)
        #[arg(short, long)]
        device: Option<DeviceId>,

        /// Only operations with this opcode name
        #[arg(short, long)]
        opcode: Option<String>,

        /// Only operations overlapping this sequence range, e.g. "10..250"
        #[arg(short, long)]
        range: Option<String>,

        /// Only operations the decoder could not name
        #[arg(short, long)]
        unknown: bool,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Capture overview: time span and per-device totals
    #[command()]
    Summary,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let options = SessionOptions {
        registry: RegistryConfig {
            idle_gap: args.idle_gap,
        },
        correlator: CorrelatorConfig {
            command_endpoint: args.command_endpoint,
            response_endpoint: args.response_endpoint,
        },
    };
    let session = Session::from_path(&args.capture, &options)
        .with_context(|| format!("Failed to load capture {}", args.capture.display()))?;

    match args.command {
        Command::Devices => print_devices(&session),
        Command::Operations {
            device,
            opcode,
            range,
            unknown,
            json,
        } => {
            let range = range.map(|r| parse_range(&r)).transpose()?;
            let rows = collect_operations(&session, device, opcode.as_deref(), range, unknown);
            if json {
                print_json(&rows)?;
            } else {
                print_operations(&rows);
            }
        }
        Command::Summary => print_summary(&session),
    }
    Ok(())
}

fn parse_range(range: &str) -> anyhow::Result<(u64, u64)> {
    let (lo, hi) = range
        .split_once("..")
        .ok_or(anyhow::anyhow!("Range must look like LO..HI"))?;
    Ok((lo.parse()?, hi.parse()?))
}

fn collect_operations<'a>(
    session: &'a Session,
    device: Option<DeviceId>,
    opcode: Option<&str>,
    range: Option<(u64, u64)>,
    unknown: bool,
) -> Vec<(DeviceId, &'a DecodedOperation)> {
    let mut rows = Vec::new();
    for dev in session.sessions() {
        if device.is_some_and(|id| id != dev.id()) {
            continue;
        }
        for operation in dev.operations() {
            if opcode.is_some_and(|name| operation.opcode != name) {
                continue;
            }
            if let Some((lo, hi)) = range {
                if operation.end_seq < lo || operation.start_seq > hi {
                    continue;
                }
            }
            if unknown && operation.status != DecodeStatus::UnknownOpcode {
                continue;
            }
            rows.push((dev.id(), operation));
        }
    }
    rows.sort_by_key(|(_, operation)| operation.start_seq);
    rows
}

fn print_json(rows: &[(DeviceId, &DecodedOperation)]) -> anyhow::Result<()> {
    let out: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, operation)| {
            serde_json::json!({
                "device": id,
                "operation": operation,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_operations(rows: &[(DeviceId, &DecodedOperation)]) {
    let mut table = Table::new();
    table.set_header(vec![
        "Seq", "Time", "Device", "Kind", "Opcode", "Status", "Confidence", "Arguments", "Response",
    ]);
    for (id, operation) in rows {
        table.add_row(vec![
            format!("{}..{}", operation.start_seq, operation.end_seq),
            format_timestamp(operation.timestamp),
            id.to_string(),
            operation.kind.to_string(),
            operation.opcode.clone(),
            operation.status.to_string(),
            operation.confidence.to_string(),
            join_arguments(&operation.arguments),
            format_response(operation),
        ]);
    }
    println!("{table}");
}

fn print_devices(session: &Session) {
    let mut table = Table::new();
    table.set_header(vec![
        "Device", "VID:PID", "Records", "Operations", "Unknown", "Orphaned",
    ]);
    for device in session.sessions() {
        table.add_row(vec![
            device.id().to_string(),
            device
                .descriptor()
                .map(|d| format!("{:04x}:{:04x}", d.vendor_id, d.product_id))
                .unwrap_or_else(|| "-".to_string()),
            device.records().len().to_string(),
            device.operations().len().to_string(),
            unknown_count(device).to_string(),
            device.orphaned_seqs().len().to_string(),
        ]);
    }
    println!("{table}");
}

fn print_summary(session: &Session) {
    let timestamps: Vec<f64> = session
        .sessions()
        .iter()
        .flat_map(|device| device.records())
        .map(|record| record.timestamp)
        .collect();
    if let (Some(first), Some(last)) = (
        timestamps.iter().copied().reduce(f64::min),
        timestamps.iter().copied().reduce(f64::max),
    ) {
        println!(
            "Capture span: {} .. {} ({:.3} s)",
            format_timestamp(first),
            format_timestamp(last),
            last - first
        );
    }
    println!(
        "{} devices, {} records, {} orphaned",
        session.devices().len(),
        session.total_records(),
        session.total_orphaned()
    );
    print_devices(session);
}

fn unknown_count(device: &DeviceSession) -> usize {
    device
        .operations()
        .iter()
        .filter(|operation| operation.status == DecodeStatus::UnknownOpcode)
        .count()
}

fn join_arguments(arguments: &[sharktooth::types::Argument]) -> String {
    if arguments.is_empty() {
        return "-".to_string();
    }
    arguments
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_response(operation: &DecodedOperation) -> String {
    if !operation.response_values.is_empty() {
        return join_arguments(&operation.response_values);
    }
    match operation.raw_response.len() {
        0 => "-".to_string(),
        n if n <= 16 => hex_string(&operation.raw_response),
        n => format!("{}… ({n} bytes)", hex_string(&operation.raw_response[..16])),
    }
}

/// Captures carry either absolute epoch times or small relative offsets;
/// only the former are worth rendering as dates.
fn format_timestamp(timestamp: f64) -> String {
    if timestamp > 1_000_000_000.0 {
        OffsetDateTime::from_unix_timestamp_nanos((timestamp * 1e9) as i128)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| format!("{timestamp:.6}"))
    } else {
        format!("{timestamp:.6}")
    }
}
