//! Device registry: attributes raw transfer records to physical device
//! lifetimes.
//!
//! A bus address can be reused after a disconnect, so one address may span
//! several device instances ("epochs"). Splitting is deliberately
//! conservative: only a long idle gap or a repeated enumeration pattern
//! starts a new epoch; anything ambiguous stays merged.

use crate::types::{ControlStage, DeviceId, RawTransferRecord, RequestKind, TransferType};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;

/// GET_DESCRIPTOR, descriptor type DEVICE.
const GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_DEVICE: u16 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Idle time (seconds) between two records of the same address after
    /// which a new epoch is assumed.
    pub idle_gap: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig { idle_gap: 5.0 }
    }
}

/// Vendor/product identity gleaned from an in-capture device descriptor
/// read. Best-effort: absent when the capture starts after enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriptorInfo {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// All records attributable to one device lifetime, in capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePartition {
    pub id: DeviceId,
    pub descriptor: Option<DescriptorInfo>,
    pub records: Vec<RawTransferRecord>,
}

struct AddrState {
    partition: usize,
    epoch: u32,
    last_timestamp: f64,
    /// Vendor or bulk traffic seen since the last enumeration.
    post_enumeration: bool,
    /// A device descriptor fetch is awaiting its response payload.
    pending_descriptor: bool,
}

/// Pure grouping of records into device partitions, in first-seen order.
pub fn partition(
    records: Vec<RawTransferRecord>,
    config: &RegistryConfig,
) -> Vec<DevicePartition> {
    let mut partitions: Vec<DevicePartition> = Vec::new();
    let mut states: HashMap<u8, AddrState> = HashMap::new();

    for record in records {
        let address = record.device_address;
        let state = states.entry(address).or_insert_with(|| {
            partitions.push(DevicePartition {
                id: DeviceId { address, epoch: 0 },
                descriptor: None,
                records: Vec::new(),
            });
            AddrState {
                partition: partitions.len() - 1,
                epoch: 0,
                last_timestamp: record.timestamp,
                post_enumeration: false,
                pending_descriptor: false,
            }
        });

        let gap = record.timestamp - state.last_timestamp;
        let re_enumerated = is_device_descriptor_fetch(&record) && state.post_enumeration;
        if gap > config.idle_gap || re_enumerated {
            state.epoch += 1;
            debug!(
                "device {address}: starting epoch {} ({})",
                state.epoch,
                if re_enumerated { "re-enumeration" } else { "idle gap" }
            );
            partitions.push(DevicePartition {
                id: DeviceId {
                    address,
                    epoch: state.epoch,
                },
                descriptor: None,
                records: Vec::new(),
            });
            state.partition = partitions.len() - 1;
            state.post_enumeration = false;
            state.pending_descriptor = false;
        }
        state.last_timestamp = record.timestamp;

        let current = &mut partitions[state.partition];
        if record.stage == Some(ControlStage::Setup) {
            state.pending_descriptor = is_device_descriptor_fetch(&record);
        } else if state.pending_descriptor {
            if let Some(info) = descriptor_info(&record) {
                debug!(
                    "device {address}: descriptor {:04x}:{:04x}",
                    info.vendor_id, info.product_id
                );
                current.descriptor.get_or_insert(info);
                state.pending_descriptor = false;
            }
        }
        if is_post_enumeration_traffic(&record) {
            state.post_enumeration = true;
        }

        current.records.push(record);
    }

    partitions
}

fn is_device_descriptor_fetch(record: &RawTransferRecord) -> bool {
    record.stage == Some(ControlStage::Setup)
        && record.setup.is_some_and(|setup| {
            setup.request_kind() == RequestKind::Standard
                && setup.b_request == GET_DESCRIPTOR
                && setup.w_value >> 8 == DESCRIPTOR_TYPE_DEVICE
        })
}

/// Vendor control requests and bulk transfers only happen once a driver is
/// talking to the device; their presence marks the enumeration as done.
fn is_post_enumeration_traffic(record: &RawTransferRecord) -> bool {
    record.transfer_type == TransferType::Bulk
        || record
            .setup
            .is_some_and(|setup| setup.request_kind() == RequestKind::Vendor)
}

/// idVendor and idProduct sit at offsets 8 and 10 of the 18-byte device
/// descriptor, little-endian.
fn descriptor_info(record: &RawTransferRecord) -> Option<DescriptorInfo> {
    let payload = &record.payload;
    if payload.len() >= 12 && payload[1] as u16 == DESCRIPTOR_TYPE_DEVICE {
        Some(DescriptorInfo {
            vendor_id: u16::from_le_bytes([payload[8], payload[9]]),
            product_id: u16::from_le_bytes([payload[10], payload[11]]),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bulk, control_setup, control_status_with};
    use crate::types::SetupPacket;

    fn descriptor_fetch(seq: u64, address: u8) -> RawTransferRecord {
        control_setup(
            seq,
            address,
            SetupPacket {
                bm_request_type: 0x80,
                b_request: GET_DESCRIPTOR,
                w_value: 0x0100,
                w_index: 0,
                w_length: 18,
            },
        )
    }

    #[test]
    fn test_two_addresses_two_partitions() {
        let records = vec![
            bulk(1, 2, 1, crate::types::Direction::Out, vec![0xad]),
            bulk(2, 5, 1, crate::types::Direction::Out, vec![0xad]),
            bulk(3, 2, 2, crate::types::Direction::In, vec![0x00; 4]),
        ];
        let parts = partition(records, &RegistryConfig::default());

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, DeviceId { address: 2, epoch: 0 });
        assert_eq!(parts[1].id, DeviceId { address: 5, epoch: 0 });
        assert_eq!(parts[0].records.len(), 2);
        assert_eq!(parts[1].records.len(), 1);
        assert!(parts[0].records.iter().all(|r| r.device_address == 2));
        assert!(parts[1].records.iter().all(|r| r.device_address == 5));
    }

    #[test]
    fn test_idle_gap_starts_new_epoch() {
        let mut early = bulk(1, 2, 1, crate::types::Direction::Out, vec![0xad]);
        early.timestamp = 1.0;
        let mut late = bulk(2, 2, 1, crate::types::Direction::Out, vec![0xad]);
        late.timestamp = 20.0;

        let parts = partition(vec![early, late], &RegistryConfig::default());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, DeviceId { address: 2, epoch: 0 });
        assert_eq!(parts[1].id, DeviceId { address: 2, epoch: 1 });
    }

    #[test]
    fn test_re_enumeration_starts_new_epoch() {
        let records = vec![
            descriptor_fetch(1, 2),
            bulk(2, 2, 1, crate::types::Direction::Out, vec![0xad]),
            descriptor_fetch(3, 2),
        ];
        let parts = partition(records, &RegistryConfig::default());

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].id, DeviceId { address: 2, epoch: 1 });
        // The descriptor fetch itself belongs to the new epoch.
        assert_eq!(parts[1].records[0].seq, 3);
    }

    #[test]
    fn test_initial_enumeration_does_not_split() {
        // Two descriptor fetches during first enumeration, no vendor
        // traffic in between: stay merged.
        let records = vec![descriptor_fetch(1, 2), descriptor_fetch(2, 2)];
        let parts = partition(records, &RegistryConfig::default());
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_descriptor_fingerprint() {
        let mut descriptor = vec![0u8; 18];
        descriptor[0] = 18;
        descriptor[1] = 0x01;
        descriptor[8..10].copy_from_slice(&0x24aau16.to_le_bytes());
        descriptor[10..12].copy_from_slice(&0x1000u16.to_le_bytes());

        let records = vec![
            descriptor_fetch(1, 2),
            control_status_with(2, 2, descriptor),
        ];
        let parts = partition(records, &RegistryConfig::default());

        assert_eq!(
            parts[0].descriptor,
            Some(DescriptorInfo {
                vendor_id: 0x24aa,
                product_id: 0x1000
            })
        );
    }

    #[test]
    fn test_sequence_numbers_strictly_increasing_per_partition() {
        let records = vec![
            bulk(1, 2, 1, crate::types::Direction::Out, vec![]),
            bulk(2, 5, 1, crate::types::Direction::Out, vec![]),
            bulk(3, 2, 2, crate::types::Direction::In, vec![]),
            bulk(4, 5, 2, crate::types::Direction::In, vec![]),
        ];
        for part in partition(records, &RegistryConfig::default()) {
            let seqs: Vec<u64> = part.records.iter().map(|r| r.seq).collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
