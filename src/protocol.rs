//! ENG-001 protocol decoder.
//!
//! Maps a correlated [`LogicalTransaction`] to a named operation with
//! interpreted fields. Decoding is a lookup in closed static tables plus
//! fixed-offset field extraction; all multi-byte fields are little-endian
//! per the USB wire convention. Growing the protocol means adding a table
//! row, nothing else.

use crate::types::{
    Argument, Confidence, DecodeStatus, FieldValue, LogicalTransaction, RawTransferRecord,
    RequestKind, SetupPacket, TransactionKind,
};
use serde::{Serialize, Serializer};

/// Second-tier dispatch request: the real opcode sits in wValue.
const SECOND_TIER_COMMAND: u16 = 0xff;

/// Bulk reads at least this long are treated as spectral data. Smaller
/// spectrometers deliver 512 pixels of 2 bytes each.
const SPECTRAL_MIN_LEN: usize = 1024;

/// Where a request argument is read from.
#[derive(Debug, Clone, Copy)]
enum ArgSource {
    WValue,
    WIndex,
    WValueLow,
    WValueHigh,
    /// 24-bit value split across wValue (low word) and wIndex (high byte),
    /// as used by the integration time commands.
    WValueIndex24,
}

/// How a numeric field is interpreted.
#[derive(Debug, Clone, Copy)]
enum ArgFormat {
    Uint,
    Bool,
    I16,
    /// Unsigned 8.8 fixed point (detector gain).
    Gain,
}

struct RequestArg {
    name: &'static str,
    source: ArgSource,
    format: ArgFormat,
    unit: Option<&'static str>,
}

/// Typed layout of one response payload field.
#[derive(Debug, Clone, Copy)]
enum RespKind {
    U8,
    U16,
    U24,
    I16,
    Bool,
    Gain,
    /// Two bytes, major then minor.
    Version2,
    /// NUL-padded text from the offset to the end of the payload.
    Ascii,
}

struct RespField {
    name: &'static str,
    offset: usize,
    kind: RespKind,
    unit: Option<&'static str>,
}

/// One table row: a known operation and the shape of its request and
/// response.
struct OpcodeSpec {
    key: u16,
    name: &'static str,
    args: &'static [RequestArg],
    response: &'static [RespField],
    /// Declared minimum response length; a shorter payload is malformed.
    min_response_len: usize,
}

const STANDARD_REQUESTS: &[OpcodeSpec] = &[
    OpcodeSpec {
        key: 0x00,
        name: "GET_STATUS",
        args: &[],
        response: &[RespField { name: "status", offset: 0, kind: RespKind::U16, unit: None }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0x01,
        name: "CLEAR_FEATURE",
        args: &[RequestArg { name: "feature", source: ArgSource::WValue, format: ArgFormat::Uint, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0x03,
        name: "SET_FEATURE",
        args: &[RequestArg { name: "feature", source: ArgSource::WValue, format: ArgFormat::Uint, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0x05,
        name: "SET_ADDRESS",
        args: &[RequestArg { name: "address", source: ArgSource::WValue, format: ArgFormat::Uint, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0x06,
        name: "GET_DESCRIPTOR",
        args: &[
            RequestArg { name: "descriptor_type", source: ArgSource::WValueHigh, format: ArgFormat::Uint, unit: None },
            RequestArg { name: "descriptor_index", source: ArgSource::WValueLow, format: ArgFormat::Uint, unit: None },
        ],
        response: &[
            RespField { name: "length", offset: 0, kind: RespKind::U8, unit: Some("bytes") },
            RespField { name: "descriptor_type", offset: 1, kind: RespKind::U8, unit: None },
        ],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0x07,
        name: "SET_DESCRIPTOR",
        args: &[],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0x08,
        name: "GET_CONFIGURATION",
        args: &[],
        response: &[RespField { name: "configuration", offset: 0, kind: RespKind::U8, unit: None }],
        min_response_len: 1,
    },
    OpcodeSpec {
        key: 0x09,
        name: "SET_CONFIGURATION",
        args: &[RequestArg { name: "configuration", source: ArgSource::WValue, format: ArgFormat::Uint, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0x0a,
        name: "GET_INTERFACE",
        args: &[RequestArg { name: "interface", source: ArgSource::WIndex, format: ArgFormat::Uint, unit: None }],
        response: &[RespField { name: "alternate", offset: 0, kind: RespKind::U8, unit: None }],
        min_response_len: 1,
    },
    OpcodeSpec {
        key: 0x0b,
        name: "SET_INTERFACE",
        args: &[
            RequestArg { name: "alternate", source: ArgSource::WValue, format: ArgFormat::Uint, unit: None },
            RequestArg { name: "interface", source: ArgSource::WIndex, format: ArgFormat::Uint, unit: None },
        ],
        response: &[],
        min_response_len: 0,
    },
];

/// ENG-001 vendor requests.
const ENG1_REQUESTS: &[OpcodeSpec] = &[
    OpcodeSpec {
        key: 0x01,
        name: "GET_FIRMWARE_VERSION",
        args: &[],
        response: &[RespField { name: "version", offset: 0, kind: RespKind::Version2, unit: None }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0xad,
        name: "ACQUIRE_SPECTRUM",
        args: &[],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xb2,
        name: "SET_INTEGRATION_TIME",
        args: &[RequestArg { name: "integration_time_ms", source: ArgSource::WValueIndex24, format: ArgFormat::Uint, unit: Some("ms") }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xbf,
        name: "GET_INTEGRATION_TIME",
        args: &[],
        response: &[RespField { name: "integration_time_ms", offset: 0, kind: RespKind::U24, unit: Some("ms") }],
        min_response_len: 3,
    },
    OpcodeSpec {
        key: 0xb4,
        name: "GET_FPGA_VERSION",
        args: &[],
        response: &[RespField { name: "fpga_version", offset: 0, kind: RespKind::Ascii, unit: None }],
        min_response_len: 7,
    },
    OpcodeSpec {
        key: 0xb6,
        name: "SET_DETECTOR_OFFSET",
        args: &[RequestArg { name: "offset", source: ArgSource::WValue, format: ArgFormat::I16, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xc4,
        name: "GET_DETECTOR_OFFSET",
        args: &[],
        response: &[RespField { name: "offset", offset: 0, kind: RespKind::I16, unit: None }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0xb7,
        name: "SET_DETECTOR_GAIN",
        args: &[RequestArg { name: "gain", source: ArgSource::WValue, format: ArgFormat::Gain, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xc5,
        name: "GET_DETECTOR_GAIN",
        args: &[],
        response: &[RespField { name: "gain", offset: 0, kind: RespKind::Gain, unit: None }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0xbe,
        name: "SET_LASER_ENABLE",
        args: &[RequestArg { name: "enabled", source: ArgSource::WValue, format: ArgFormat::Bool, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xe2,
        name: "GET_LASER_ENABLE",
        args: &[],
        response: &[RespField { name: "enabled", offset: 0, kind: RespKind::Bool, unit: None }],
        min_response_len: 1,
    },
    OpcodeSpec {
        key: 0xd6,
        name: "SET_DETECTOR_TEC_ENABLE",
        args: &[RequestArg { name: "enabled", source: ArgSource::WValue, format: ArgFormat::Bool, unit: None }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xda,
        name: "GET_DETECTOR_TEC_ENABLE",
        args: &[],
        response: &[RespField { name: "enabled", offset: 0, kind: RespKind::Bool, unit: None }],
        min_response_len: 1,
    },
    OpcodeSpec {
        key: 0xd8,
        name: "SET_DETECTOR_TEC_SETPOINT",
        args: &[RequestArg { name: "setpoint", source: ArgSource::WValue, format: ArgFormat::Uint, unit: Some("DAC counts") }],
        response: &[],
        min_response_len: 0,
    },
    OpcodeSpec {
        key: 0xd9,
        name: "GET_DETECTOR_TEC_SETPOINT",
        args: &[],
        response: &[RespField { name: "setpoint", offset: 0, kind: RespKind::U16, unit: Some("DAC counts") }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0xd7,
        name: "GET_DETECTOR_TEMPERATURE",
        args: &[],
        response: &[RespField { name: "temperature", offset: 0, kind: RespKind::U16, unit: Some("ADC counts") }],
        min_response_len: 2,
    },
];

/// Subcommands of the 0xFF second-tier request, keyed on wValue.
const ENG1_SECOND_TIER: &[OpcodeSpec] = &[
    OpcodeSpec {
        key: 0x01,
        name: "GET_MODEL_CONFIG",
        args: &[RequestArg { name: "page", source: ArgSource::WIndex, format: ArgFormat::Uint, unit: None }],
        response: &[],
        min_response_len: 64,
    },
    OpcodeSpec {
        key: 0x02,
        name: "GET_LINE_LENGTH",
        args: &[],
        response: &[RespField { name: "pixels", offset: 0, kind: RespKind::U16, unit: Some("pixels") }],
        min_response_len: 2,
    },
    OpcodeSpec {
        key: 0x03,
        name: "GET_COMPILATION_OPTIONS",
        args: &[],
        response: &[RespField { name: "options", offset: 0, kind: RespKind::U16, unit: None }],
        min_response_len: 2,
    },
];

/// Known first command bytes on the bulk command endpoint.
const BULK_COMMANDS: &[(u8, &str)] = &[(0xad, "ACQUIRE_SPECTRUM")];

/// The protocol-level interpretation of one logical transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedOperation {
    pub opcode: String,
    pub kind: TransactionKind,
    pub arguments: Vec<Argument>,
    #[serde(serialize_with = "serialize_hex")]
    pub raw_response: Vec<u8>,
    pub response_values: Vec<Argument>,
    pub status: DecodeStatus,
    pub confidence: Confidence,
    pub start_seq: u64,
    pub end_seq: u64,
    pub timestamp: f64,
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_string(bytes))
}

/// Decode one transaction. Never fails: anything unrecognized is reported
/// through the decode status with its raw bytes preserved.
pub fn decode(
    transaction: &LogicalTransaction,
    records: &[RawTransferRecord],
) -> DecodedOperation {
    let request_payload = concat_payloads(&transaction.request, records);
    let response_payload = concat_payloads(&transaction.response, records);

    let (opcode, arguments, status, response_values) = match transaction.kind {
        TransactionKind::ControlTransfer => {
            decode_control(transaction, records, &response_payload)
        }
        TransactionKind::BulkCommandResponse => {
            decode_bulk(&request_payload, &response_payload, transaction)
        }
    };

    let first = transaction
        .request
        .first()
        .or(transaction.response.first())
        .copied()
        .unwrap_or(0);

    DecodedOperation {
        opcode,
        kind: transaction.kind,
        arguments,
        raw_response: response_payload,
        response_values,
        status,
        confidence: transaction.confidence,
        start_seq: transaction.start_seq,
        end_seq: transaction.end_seq,
        timestamp: records[first].timestamp,
    }
}

fn concat_payloads(indexes: &[usize], records: &[RawTransferRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for &index in indexes {
        out.extend_from_slice(&records[index].payload);
    }
    out
}

fn decode_control(
    transaction: &LogicalTransaction,
    records: &[RawTransferRecord],
    response: &[u8],
) -> (String, Vec<Argument>, DecodeStatus, Vec<Argument>) {
    let Some(setup) = transaction
        .request
        .iter()
        .find_map(|&index| records[index].setup)
    else {
        return (
            "UNKNOWN".into(),
            Vec::new(),
            DecodeStatus::UnknownOpcode,
            Vec::new(),
        );
    };

    let spec = match setup.request_kind() {
        RequestKind::Standard => find_spec(STANDARD_REQUESTS, setup.b_request as u16),
        RequestKind::Vendor => {
            if setup.b_request as u16 == SECOND_TIER_COMMAND {
                let tier = find_spec(ENG1_SECOND_TIER, setup.w_value);
                if tier.is_none() {
                    return (
                        format!("UNKNOWN_SECOND_TIER_0x{:02X}", setup.w_value),
                        Vec::new(),
                        DecodeStatus::UnknownOpcode,
                        Vec::new(),
                    );
                }
                tier
            } else {
                find_spec(ENG1_REQUESTS, setup.b_request as u16)
            }
        }
        RequestKind::Class | RequestKind::Reserved => None,
    };

    let Some(spec) = spec else {
        return (
            format!("UNKNOWN_0x{:02X}", setup.b_request),
            Vec::new(),
            DecodeStatus::UnknownOpcode,
            Vec::new(),
        );
    };

    let arguments = spec
        .args
        .iter()
        .map(|arg| Argument {
            name: arg.name,
            value: arg_value(&setup, arg),
            unit: arg.unit,
        })
        .collect();

    let expects_response = setup.is_device_to_host() && setup.w_length > 0;
    let status = if response.is_empty() {
        if expects_response || !transaction.closed {
            DecodeStatus::NoResponse
        } else {
            DecodeStatus::Ok
        }
    } else if response.len() < spec.min_response_len {
        DecodeStatus::MalformedLength
    } else {
        DecodeStatus::Ok
    };

    let response_values = if response.is_empty() {
        Vec::new()
    } else {
        extract_response_fields(spec.response, response)
    };

    (spec.name.to_string(), arguments, status, response_values)
}

fn decode_bulk(
    request: &[u8],
    response: &[u8],
    transaction: &LogicalTransaction,
) -> (String, Vec<Argument>, DecodeStatus, Vec<Argument>) {
    if !transaction.request.is_empty() {
        let Some(&opcode) = request.first() else {
            return (
                "UNKNOWN_BULK_OUT".into(),
                Vec::new(),
                DecodeStatus::UnknownOpcode,
                Vec::new(),
            );
        };
        let Some(&(_, name)) = BULK_COMMANDS.iter().find(|(key, _)| *key == opcode) else {
            return (
                format!("UNKNOWN_0x{opcode:02X}"),
                Vec::new(),
                DecodeStatus::UnknownOpcode,
                Vec::new(),
            );
        };
        if response.is_empty() {
            return (name.to_string(), Vec::new(), DecodeStatus::NoResponse, Vec::new());
        }
        return (
            name.to_string(),
            Vec::new(),
            DecodeStatus::Ok,
            spectral_summary(response),
        );
    }

    // Response-only unit: an unsolicited read, most often the spectrum
    // that follows an ACQUIRE_SPECTRUM issued over the control pipe.
    if response.len() >= SPECTRAL_MIN_LEN {
        (
            "SPECTRAL_DATA".into(),
            Vec::new(),
            DecodeStatus::Ok,
            spectral_summary(response),
        )
    } else {
        (
            "UNKNOWN_BULK_IN".into(),
            Vec::new(),
            DecodeStatus::UnknownOpcode,
            Vec::new(),
        )
    }
}

/// Pixels are u16 little-endian.
fn spectral_summary(payload: &[u8]) -> Vec<Argument> {
    let pixels: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut values = vec![Argument {
        name: "pixel_count",
        value: FieldValue::Length(pixels.len()),
        unit: Some("pixels"),
    }];
    if let (Some(&min), Some(&max)) = (pixels.iter().min(), pixels.iter().max()) {
        values.push(Argument {
            name: "min",
            value: FieldValue::Uint(min as u64),
            unit: Some("counts"),
        });
        values.push(Argument {
            name: "max",
            value: FieldValue::Uint(max as u64),
            unit: Some("counts"),
        });
    }
    values
}

fn find_spec(table: &'static [OpcodeSpec], key: u16) -> Option<&'static OpcodeSpec> {
    table.iter().find(|spec| spec.key == key)
}

fn arg_value(setup: &SetupPacket, arg: &RequestArg) -> FieldValue {
    let raw = match arg.source {
        ArgSource::WValue => setup.w_value as u64,
        ArgSource::WIndex => setup.w_index as u64,
        ArgSource::WValueLow => (setup.w_value & 0xff) as u64,
        ArgSource::WValueHigh => (setup.w_value >> 8) as u64,
        ArgSource::WValueIndex24 => setup.w_value as u64 | ((setup.w_index as u64 & 0xff) << 16),
    };
    match arg.format {
        ArgFormat::Uint => FieldValue::Uint(raw),
        ArgFormat::Bool => FieldValue::Bool(raw != 0),
        ArgFormat::I16 => FieldValue::Int(raw as u16 as i16 as i64),
        ArgFormat::Gain => FieldValue::Float(raw as f64 / 256.0),
    }
}

/// Extract every declared field that fits in the payload; a short payload
/// yields the fields that fit (the decode status already says MALFORMED).
fn extract_response_fields(fields: &[RespField], payload: &[u8]) -> Vec<Argument> {
    fields
        .iter()
        .filter_map(|field| {
            field_value_at(payload, field).map(|value| Argument {
                name: field.name,
                value,
                unit: field.unit,
            })
        })
        .collect()
}

fn field_value_at(payload: &[u8], field: &RespField) -> Option<FieldValue> {
    let at = field.offset;
    let le = |n: usize| -> Option<u64> {
        let slice = payload.get(at..at + n)?;
        Some(
            slice
                .iter()
                .rev()
                .fold(0u64, |acc, &byte| (acc << 8) | byte as u64),
        )
    };
    match field.kind {
        RespKind::U8 => payload.get(at).map(|&b| FieldValue::Uint(b as u64)),
        RespKind::U16 => le(2).map(FieldValue::Uint),
        RespKind::U24 => le(3).map(FieldValue::Uint),
        RespKind::I16 => le(2).map(|v| FieldValue::Int(v as u16 as i16 as i64)),
        RespKind::Bool => payload.get(at).map(|&b| FieldValue::Bool(b != 0)),
        RespKind::Gain => le(2).map(|v| FieldValue::Float(v as f64 / 256.0)),
        RespKind::Version2 => {
            let slice = payload.get(at..at + 2)?;
            Some(FieldValue::Version(slice[0], slice[1]))
        }
        RespKind::Ascii => {
            let slice = payload.get(at..)?;
            let text: String = slice
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            Some(FieldValue::Text(text))
        }
    }
}
