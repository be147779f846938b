//! Session model: the fully reconstructed capture, and the read-only
//! queries the interactive layer composes.
//!
//! The pipeline runs once, in full: load, partition into device sessions,
//! correlate, decode. The result is immutable; analyzing a different
//! capture means building a new [`Session`].

use crate::capture::{self, CaptureFormatError};
use crate::correlator::{correlate, CorrelatorConfig};
use crate::devices::{partition, DescriptorInfo, DevicePartition, RegistryConfig};
use crate::protocol::{decode, DecodedOperation};
use crate::types::{DeviceId, LogicalTransaction, RawTransferRecord};
use log::info;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub registry: RegistryConfig,
    pub correlator: CorrelatorConfig,
}

/// All traffic attributable to one device lifetime, correlated and
/// decoded.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    id: DeviceId,
    descriptor: Option<DescriptorInfo>,
    records: Vec<RawTransferRecord>,
    transactions: Vec<LogicalTransaction>,
    operations: Vec<DecodedOperation>,
    orphaned: Vec<u64>,
}

impl DeviceSession {
    fn build(part: DevicePartition, config: &CorrelatorConfig) -> Self {
        let correlation = correlate(&part.records, config);
        let operations = correlation
            .transactions
            .iter()
            .map(|transaction| decode(transaction, &part.records))
            .collect();
        let orphaned = correlation
            .orphaned
            .iter()
            .map(|&index| part.records[index].seq)
            .collect();
        DeviceSession {
            id: part.id,
            descriptor: part.descriptor,
            records: part.records,
            transactions: correlation.transactions,
            operations,
            orphaned,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn descriptor(&self) -> Option<DescriptorInfo> {
        self.descriptor
    }

    pub fn records(&self) -> &[RawTransferRecord] {
        &self.records
    }

    pub fn transactions(&self) -> &[LogicalTransaction] {
        &self.transactions
    }

    /// Decoded operations, in capture order.
    pub fn operations(&self) -> &[DecodedOperation] {
        &self.operations
    }

    /// Sequence numbers of records no correlation rule could attribute.
    pub fn orphaned_seqs(&self) -> &[u64] {
        &self.orphaned
    }
}

/// The reconstructed capture. Built once, then queried.
#[derive(Debug, Clone)]
pub struct Session {
    devices: Vec<DeviceSession>,
}

/// Load a capture export and run the full reconstruction pipeline with
/// default options.
pub fn load_capture<P: AsRef<Path>>(path: P) -> Result<Session, CaptureFormatError> {
    Session::from_path(path, &SessionOptions::default())
}

impl Session {
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        options: &SessionOptions,
    ) -> Result<Session, CaptureFormatError> {
        Ok(Session::from_records(capture::load_path(path)?, options))
    }

    pub fn from_json_str(
        text: &str,
        options: &SessionOptions,
    ) -> Result<Session, CaptureFormatError> {
        Ok(Session::from_records(capture::load_str(text)?, options))
    }

    pub fn from_value(
        doc: &Value,
        options: &SessionOptions,
    ) -> Result<Session, CaptureFormatError> {
        Ok(Session::from_records(capture::load_value(doc)?, options))
    }

    fn from_records(records: Vec<RawTransferRecord>, options: &SessionOptions) -> Session {
        let devices: Vec<DeviceSession> = partition(records, &options.registry)
            .into_iter()
            .map(|part| DeviceSession::build(part, &options.correlator))
            .collect();

        for device in &devices {
            info!(
                "device {}: {} records, {} operations, {} orphaned",
                device.id,
                device.records.len(),
                device.operations.len(),
                device.orphaned.len()
            );
        }
        Session { devices }
    }

    /// Device identities, in first-seen order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|device| device.id).collect()
    }

    pub fn sessions(&self) -> &[DeviceSession] {
        &self.devices
    }

    pub fn select_device(&self, id: &DeviceId) -> Option<&DeviceSession> {
        self.devices.iter().find(|device| device.id == *id)
    }

    /// Operations of one device, or nothing if the identity is unknown.
    pub fn operations_for(&self, id: &DeviceId) -> &[DecodedOperation] {
        self.select_device(id)
            .map(|device| device.operations())
            .unwrap_or(&[])
    }

    /// All operations with the given opcode name, across devices, ordered
    /// by sequence number.
    pub fn operations_by_opcode(&self, name: &str) -> Vec<&DecodedOperation> {
        self.all_operations(|operation| operation.opcode == name)
    }

    /// All operations whose sequence range overlaps `[lo, hi]`.
    pub fn operations_in_range(&self, lo: u64, hi: u64) -> Vec<&DecodedOperation> {
        self.all_operations(|operation| operation.end_seq >= lo && operation.start_seq <= hi)
    }

    /// Operations the decoder could not name.
    pub fn unknown_operations(&self) -> Vec<&DecodedOperation> {
        self.all_operations(|operation| {
            operation.status == crate::types::DecodeStatus::UnknownOpcode
        })
    }

    fn all_operations(&self, keep: impl Fn(&DecodedOperation) -> bool) -> Vec<&DecodedOperation> {
        let mut operations: Vec<&DecodedOperation> = self
            .devices
            .iter()
            .flat_map(|device| device.operations())
            .filter(|operation| keep(operation))
            .collect();
        operations.sort_by_key(|operation| operation.start_seq);
        operations
    }

    pub fn total_records(&self) -> usize {
        self.devices.iter().map(|device| device.records.len()).sum()
    }

    pub fn total_orphaned(&self) -> usize {
        self.devices.iter().map(|device| device.orphaned.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, DecodeStatus, FieldValue};
    use serde_json::json;

    /// A control transfer as two exported frames: the submit carrying the
    /// setup, and the complete carrying any response bytes.
    fn control_frames(
        frame: u64,
        address: u8,
        setup: (&str, &str, &str, &str, &str),
        response_hex: Option<&str>,
    ) -> Vec<Value> {
        let (bm, request, value, index, length) = setup;
        let submit = json!({
            "_source": { "layers": {
                "frame": { "frame.number": frame.to_string() },
                "usb": {
                    "usb.device_address": address.to_string(),
                    "usb.endpoint_address": "0x80",
                    "usb.transfer_type": "0x02",
                    "usb.urb_type": "'S'",
                    "Setup Data": {
                        "usb.setup.bmRequestType": bm,
                        "usb.setup.bRequest": request,
                        "usb.setup.wValue": value,
                        "usb.setup.wIndex": index,
                        "usb.setup.wLength": length,
                    },
                },
            }}
        });
        let mut complete = json!({
            "_source": { "layers": {
                "frame": { "frame.number": (frame + 1).to_string() },
                "usb": {
                    "usb.device_address": address.to_string(),
                    "usb.endpoint_address": "0x80",
                    "usb.transfer_type": "0x02",
                    "usb.urb_type": "'C'",
                },
            }}
        });
        if let Some(hex) = response_hex {
            complete["_source"]["layers"]["usb.capdata"] = json!(hex);
        }
        vec![submit, complete]
    }

    #[test]
    fn test_end_to_end_firmware_version() {
        let doc = json!(control_frames(
            1,
            7,
            ("0xc0", "1", "0x0000", "0", "2"),
            Some("01:05"),
        ));
        let session = Session::from_value(&doc, &SessionOptions::default()).unwrap();

        assert_eq!(session.devices().len(), 1);
        let device = session.select_device(&session.devices()[0]).unwrap();
        let operations = device.operations();
        assert_eq!(operations.len(), 1);

        let operation = &operations[0];
        assert_eq!(operation.opcode, "GET_FIRMWARE_VERSION");
        assert_eq!(operation.status, DecodeStatus::Ok);
        assert_eq!(operation.response_values[0].value, FieldValue::Version(1, 5));
        assert_eq!((operation.start_seq, operation.end_seq), (1, 2));
    }

    #[test]
    fn test_end_to_end_two_devices() {
        let mut frames = control_frames(1, 7, ("0xc0", "1", "0", "0", "2"), Some("01:05"));
        frames.extend(control_frames(3, 9, ("0x40", "0xb2", "100", "0", "0"), None));
        let session = Session::from_value(&json!(frames), &SessionOptions::default()).unwrap();

        let devices = session.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, 7);
        assert_eq!(devices[1].address, 9);

        for id in &devices {
            let device = session.select_device(id).unwrap();
            assert!(device.records().iter().all(|r| r.device_address == id.address));
            assert_eq!(device.operations().len(), 1);
        }
        assert_eq!(
            session.operations_for(&devices[1])[0].opcode,
            "SET_INTEGRATION_TIME"
        );
    }

    #[test]
    fn test_queries() {
        let mut frames = control_frames(1, 7, ("0xc0", "1", "0", "0", "2"), Some("01:05"));
        frames.extend(control_frames(3, 7, ("0x40", "0xb2", "250", "0", "0"), None));
        frames.extend(control_frames(5, 7, ("0xc0", "0x77", "0", "0", "2"), Some("aa:bb")));
        let session = Session::from_value(&json!(frames), &SessionOptions::default()).unwrap();

        let by_opcode = session.operations_by_opcode("SET_INTEGRATION_TIME");
        assert_eq!(by_opcode.len(), 1);
        assert_eq!(
            by_opcode[0].arguments[0].value,
            FieldValue::Uint(250)
        );

        let in_range = session.operations_in_range(1, 2);
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].opcode, "GET_FIRMWARE_VERSION");

        let unknown = session.unknown_operations();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].opcode, "UNKNOWN_0x77");
    }

    #[test]
    fn test_dangling_setup_boundary() {
        let mut frames = control_frames(1, 7, ("0xc0", "1", "0", "0", "2"), Some("01:05"));
        frames.truncate(1); // keep only the SETUP
        let session = Session::from_value(&json!(frames), &SessionOptions::default()).unwrap();

        let device = session.sessions().first().unwrap();
        assert_eq!(device.transactions().len(), 1);
        assert!(device.transactions()[0].response.is_empty());

        let operation = &device.operations()[0];
        assert_eq!(operation.confidence, Confidence::Ambiguous);
        assert_eq!(operation.status, DecodeStatus::NoResponse);
    }

    #[test]
    fn test_no_record_lost() {
        let mut frames = control_frames(1, 7, ("0xc0", "1", "0", "0", "2"), Some("01:05"));
        // An interrupt transfer nothing can correlate.
        frames.push(json!({
            "_source": { "layers": {
                "frame": { "frame.number": "3" },
                "usb": {
                    "usb.device_address": "7",
                    "usb.endpoint_address": "0x83",
                    "usb.transfer_type": "0x01",
                },
            }}
        }));
        let session = Session::from_value(&json!(frames), &SessionOptions::default()).unwrap();

        let consumed: usize = session
            .sessions()
            .iter()
            .flat_map(|device| device.transactions())
            .map(|transaction| transaction.request.len() + transaction.response.len())
            .sum();
        assert_eq!(consumed + session.total_orphaned(), session.total_records());
        assert_eq!(session.total_orphaned(), 1);
    }
}
