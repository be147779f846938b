//! Capture loader: turns a Wireshark "Export Packet Dissections > As JSON"
//! document into an ordered sequence of [`RawTransferRecord`]s.
//!
//! Only the USB layer fields and the secondary data sources are consumed.
//! A packet that cannot be interpreted is skipped with a warning; the load
//! as a whole only fails if the document shape is wrong or nothing usable
//! remains.

use crate::parser::{self, UsbAddr};
use crate::types::{ControlStage, Direction, RawTransferRecord, SetupPacket, TransferType};
use log::{info, warn};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CaptureFormatError {
    #[error("failed to read capture file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("capture document is not an array of packets")]
    NotPacketArray,
    #[error("no usable USB packets in capture")]
    NoUsablePackets,
}

pub fn load_path<P: AsRef<Path>>(path: P) -> Result<Vec<RawTransferRecord>, CaptureFormatError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| CaptureFormatError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<Vec<RawTransferRecord>, CaptureFormatError> {
    load_value(&serde_json::from_str(text)?)
}

pub fn load_value(doc: &Value) -> Result<Vec<RawTransferRecord>, CaptureFormatError> {
    let packets = doc.as_array().ok_or(CaptureFormatError::NotPacketArray)?;

    let mut records: Vec<RawTransferRecord> = Vec::with_capacity(packets.len());
    let mut skipped = 0usize;
    let mut last_seq = 0u64;

    for (index, packet) in packets.iter().enumerate() {
        match parse_packet(packet) {
            Ok(mut record) => {
                // Frame numbers are the capture order, but keep the
                // sequence strictly monotonic even if they are missing or
                // repeat.
                if record.seq <= last_seq {
                    record.seq = last_seq + 1;
                }
                last_seq = record.seq;
                records.push(record);
            }
            Err(reason) => {
                warn!("skipping packet {index}: {reason}");
                skipped += 1;
            }
        }
    }

    if records.is_empty() {
        return Err(CaptureFormatError::NoUsablePackets);
    }

    info!(
        "loaded {} USB transfer records ({} packets skipped)",
        records.len(),
        skipped
    );
    Ok(records)
}

fn parse_packet(packet: &Value) -> Result<RawTransferRecord, String> {
    let layers = packet
        .get("_source")
        .and_then(|s| s.get("layers"))
        .ok_or("no _source.layers")?;
    let usb = layers.get("usb").ok_or("no usb layer")?;

    let frame = layers.get("frame");
    let seq = frame
        .and_then(|f| field_uint(f, "frame.number"))
        .unwrap_or(0);
    let timestamp = frame
        .and_then(|f| {
            field_f64(f, "frame.time_epoch").or_else(|| field_f64(f, "frame.time_relative"))
        })
        .unwrap_or(0.0);

    // usb.src / usb.dst identify the device side and imply a direction;
    // used as fallback when the endpoint fields are absent.
    let src = field_str(usb, "usb.src").and_then(parser::parse_usb_addr);
    let dst = field_str(usb, "usb.dst").and_then(parser::parse_usb_addr);
    let (peer, addr_direction) = match (src, dst) {
        (Some(UsbAddr::Host), Some(UsbAddr::Device { device, endpoint, .. })) => {
            (Some((device, endpoint)), Some(Direction::Out))
        }
        (Some(UsbAddr::Device { device, endpoint, .. }), _) => {
            (Some((device, endpoint)), Some(Direction::In))
        }
        _ => (None, None),
    };

    let device_address = field_uint(usb, "usb.device_address")
        .map(|v| v as u8)
        .or(peer.map(|(device, _)| device))
        .ok_or("no device address")?;

    let endpoint_address = field_uint(usb, "usb.endpoint_address")
        .or_else(|| field_uint(usb, "usb.endpoint_number"))
        .map(|v| v as u8);
    let (endpoint, direction) = match endpoint_address {
        Some(addr) => (addr & 0x7f, Direction::from_endpoint_address(addr)),
        None => {
            let ep = peer.map(|(_, endpoint)| endpoint).ok_or("no endpoint")?;
            (ep & 0x7f, addr_direction.ok_or("no direction")?)
        }
    };

    let transfer_code = field_uint(usb, "usb.transfer_type").ok_or("no transfer type")? as u8;
    let transfer_type = TransferType::from_code(transfer_code)
        .ok_or_else(|| format!("unknown transfer type {transfer_code:#x}"))?;

    let mut setup = setup_from_fields(usb);
    let mut payload = extract_payload(layers, usb);

    let stage = if transfer_type == TransferType::Control {
        let stage = control_stage(usb, setup.is_some(), payload.len());
        if stage == ControlStage::Setup {
            if let Some(sp) = setup {
                // USBPcap embeds the raw setup packet ahead of any data
                // stage payload; drop the duplicate.
                if payload.len() >= 8 && payload[..8] == sp.to_bytes() {
                    payload.drain(..8);
                }
            } else {
                setup = SetupPacket::from_bytes(&payload);
                if setup.is_some() {
                    payload.drain(..8);
                } else {
                    return Err("setup stage without setup packet".into());
                }
            }
        }
        Some(stage)
    } else {
        None
    };

    Ok(RawTransferRecord {
        seq,
        timestamp,
        device_address,
        endpoint,
        direction,
        transfer_type,
        stage,
        setup,
        payload,
    })
}

/// Classify the control-transfer phase this record belongs to. USBPcap
/// captures carry an explicit stage field; usbmon captures only have
/// submit/complete URB events, where the setup rides the submit and any
/// response data rides the complete.
fn control_stage(usb: &Value, has_setup: bool, payload_len: usize) -> ControlStage {
    if let Some(code) = field_uint(usb, "usb.control_stage") {
        return match code {
            0 => ControlStage::Setup,
            1 => ControlStage::Data,
            _ => ControlStage::Status,
        };
    }
    if has_setup {
        return ControlStage::Setup;
    }
    match urb_type(usb) {
        Some('S') if payload_len >= 8 => ControlStage::Setup,
        Some('C') => ControlStage::Status,
        _ => ControlStage::Data,
    }
}

fn urb_type(usb: &Value) -> Option<char> {
    let value = find_field(usb, "usb.urb_type")?;
    let s = value.as_str()?;
    if s.contains('S') {
        Some('S')
    } else if s.contains('C') {
        Some('C')
    } else {
        parser::parse_uint(s).and_then(|n| char::from_u32(n as u32))
    }
}

fn setup_from_fields(usb: &Value) -> Option<SetupPacket> {
    let b_request = setup_field(usb, "bRequest")? as u8;
    Some(SetupPacket {
        bm_request_type: setup_field(usb, "bmRequestType").unwrap_or(0) as u8,
        b_request,
        w_value: setup_field(usb, "wValue").unwrap_or(0) as u16,
        w_index: setup_field(usb, "wIndex").unwrap_or(0) as u16,
        w_length: setup_field(usb, "wLength").unwrap_or(0) as u16,
    })
}

/// Setup fields appear as `usb.setup.*` in some dissections and as plain
/// `usb.*` in others (bmRequestType in particular).
fn setup_field(usb: &Value, name: &str) -> Option<u64> {
    field_uint(usb, &format!("usb.setup.{name}"))
        .or_else(|| field_uint(usb, &format!("usb.{name}")))
}

/// Recover the transfer payload. Preferred source is the dissected capture
/// data; the fallback is the whole frame minus the URB pseudo-header.
fn extract_payload(layers: &Value, usb: &Value) -> Vec<u8> {
    const DATA_KEYS: [&str; 4] = [
        "usb.capdata_raw",
        "usb.capdata",
        "usb.data_fragment_raw",
        "usb.data_fragment",
    ];
    for key in DATA_KEYS {
        if let Some(bytes) = find_field(usb, key)
            .or_else(|| find_field(layers, key))
            .and_then(raw_bytes)
        {
            return bytes;
        }
    }

    find_field(layers, "frame_raw")
        .and_then(raw_bytes)
        .map(|frame| strip_urb_header(&frame))
        .unwrap_or_default()
}

/// USBPcap's pseudo-header starts with its own length as a u16 LE; usbmon
/// headers are a fixed 64 bytes.
fn strip_urb_header(frame: &[u8]) -> Vec<u8> {
    if frame.len() >= 27 {
        let header_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if (27..=40).contains(&header_len) && header_len <= frame.len() {
            return frame[header_len..].to_vec();
        }
    }
    if frame.len() >= 64 {
        return frame[64..].to_vec();
    }
    Vec::new()
}

/// Look up `key` in `obj`, or in any object nested one level below it.
/// "All Expanded" exports wrap fields in named subtrees ("Setup Data",
/// "URB setup", ...).
fn find_field<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    let map = obj.as_object()?;
    if let Some(value) = map.get(key) {
        return Some(value);
    }
    map.values()
        .filter_map(|v| v.as_object())
        .find_map(|m| m.get(key))
}

fn field_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    find_field(obj, key)?.as_str()
}

fn field_uint(obj: &Value, key: &str) -> Option<u64> {
    match find_field(obj, key)? {
        Value::String(s) => parser::parse_uint(s),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn field_f64(obj: &Value, key: &str) -> Option<f64> {
    match find_field(obj, key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn raw_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => parser::parse_hex_bytes(s),
        // Secondary data sources export as [hex, offset, length, bitmask, type]
        Value::Array(items) => items.first().and_then(raw_bytes),
        _ => None,
    }
}
