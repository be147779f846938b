use serde::{Serialize, Serializer};

/// Transfer direction, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn from_endpoint_address(addr: u8) -> Self {
        if addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferType {
    Isochronous,
    Interrupt,
    Control,
    Bulk,
}

impl TransferType {
    /// Wire encoding used by both usbmon and USBPcap dissections.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TransferType::Isochronous),
            1 => Some(TransferType::Interrupt),
            2 => Some(TransferType::Control),
            3 => Some(TransferType::Bulk),
            _ => None,
        }
    }
}

/// Phase of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlStage {
    Setup,
    Data,
    Status,
}

/// Request type bits (5..6) of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The 8-byte setup packet of a control transfer. All multi-byte fields are
/// little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 8 {
            return None;
        }
        Some(SetupPacket {
            bm_request_type: raw[0],
            b_request: raw[1],
            w_value: u16::from_le_bytes([raw[2], raw[3]]),
            w_index: u16::from_le_bytes([raw[4], raw[5]]),
            w_length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.bm_request_type;
        out[1] = self.b_request;
        out[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        out[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        out[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        out
    }

    /// Data phase flows device-to-host.
    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }

    pub fn request_kind(&self) -> RequestKind {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }
}

/// One USB-level event, exactly as captured on the wire.
///
/// Created once by the capture loader and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransferRecord {
    /// Capture-order sequence number. Unique and strictly increasing across
    /// the whole capture.
    pub seq: u64,
    /// Capture timestamp, in seconds.
    pub timestamp: f64,
    /// Bus address of the device. May be reused across device lifetimes.
    pub device_address: u8,
    /// Endpoint number with the direction bit stripped.
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    /// Set for control transfers only.
    pub stage: Option<ControlStage>,
    /// Set for control SETUP stages only.
    pub setup: Option<SetupPacket>,
    /// Payload bytes, excluding URB pseudo-headers and the setup packet.
    pub payload: Vec<u8>,
}

/// Identity of one physical device lifetime: bus address plus an epoch
/// counter distinguishing reuse of the same address after re-enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub address: u8,
    pub epoch: u32,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.address, self.epoch)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (address, epoch) = match s.split_once('.') {
            Some((a, e)) => (a.parse()?, e.parse()?),
            None => (s.parse()?, 0),
        };
        Ok(DeviceId { address, epoch })
    }
}

impl Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// How confidently a transaction's request and response were paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    /// Single SETUP, at most one DATA stage, closing STATUS, nothing
    /// interleaved.
    Exact,
    /// Pairing rests on sequence adjacency (all bulk pairs) or a
    /// multi-fragment data phase.
    Inferred,
    /// Interleaved, dangling or unsolicited; records reported as seen.
    Ambiguous,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::Exact => "EXACT",
            Confidence::Inferred => "INFERRED",
            Confidence::Ambiguous => "AMBIGUOUS",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionKind {
    #[serde(rename = "CONTROL_TRANSFER")]
    ControlTransfer,
    #[serde(rename = "BULK_COMMAND_RESPONSE")]
    BulkCommandResponse,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionKind::ControlTransfer => "CONTROL",
            TransactionKind::BulkCommandResponse => "BULK",
        };
        write!(f, "{s}")
    }
}

/// A correlated request/response unit within one device session.
///
/// Records are referenced by index into the owning session's record list;
/// no record ever belongs to more than one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalTransaction {
    pub kind: TransactionKind,
    /// Indexes of the request-side records (SETUP plus OUT data, or the
    /// bulk command transfer).
    pub request: Vec<usize>,
    /// Indexes of the response-side records. Empty if the device never
    /// answered or the capture is truncated.
    pub response: Vec<usize>,
    /// Whether a closing STATUS stage was observed (control only).
    pub closed: bool,
    pub confidence: Confidence,
    pub start_seq: u64,
    pub end_seq: u64,
}

/// Outcome of decoding one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "UNKNOWN_OPCODE")]
    UnknownOpcode,
    #[serde(rename = "MALFORMED_LENGTH")]
    MalformedLength,
    #[serde(rename = "NO_RESPONSE")]
    NoResponse,
}

impl std::fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecodeStatus::Ok => "OK",
            DecodeStatus::UnknownOpcode => "UNKNOWN_OPCODE",
            DecodeStatus::MalformedLength => "MALFORMED_LENGTH",
            DecodeStatus::NoResponse => "NO_RESPONSE",
        };
        write!(f, "{s}")
    }
}

/// An interpreted field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Major/minor version pair, e.g. firmware revision 1.5
    Version(u8, u8),
    Text(String),
    /// A length in elements (e.g. pixels in a spectrum)
    Length(usize),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v:.3}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Version(major, minor) => write!(f, "{major}.{minor}"),
            FieldValue::Text(v) => write!(f, "{v}"),
            FieldValue::Length(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::Uint(v) => serializer.serialize_u64(*v),
            FieldValue::Int(v) => serializer.serialize_i64(*v),
            FieldValue::Float(v) => serializer.serialize_f64(*v),
            FieldValue::Bool(v) => serializer.serialize_bool(*v),
            FieldValue::Version(..) | FieldValue::Text(_) => {
                serializer.serialize_str(&self.to_string())
            }
            FieldValue::Length(v) => serializer.serialize_u64(*v as u64),
        }
    }
}

/// A named, interpreted field of a request or response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Argument {
    pub name: &'static str,
    pub value: FieldValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
}

impl std::fmt::Display for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(unit) = self.unit {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}
