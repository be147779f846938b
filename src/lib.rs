pub mod capture;
pub mod correlator;
pub mod devices;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod types;

pub use capture::CaptureFormatError;
pub use session::{load_capture, Session, SessionOptions};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::types::{
        ControlStage, Direction, RawTransferRecord, SetupPacket, TransferType,
    };

    pub fn control_setup(seq: u64, address: u8, setup: SetupPacket) -> RawTransferRecord {
        RawTransferRecord {
            seq,
            timestamp: seq as f64 * 0.01,
            device_address: address,
            endpoint: 0,
            direction: if setup.is_device_to_host() {
                Direction::In
            } else {
                Direction::Out
            },
            transfer_type: TransferType::Control,
            stage: Some(ControlStage::Setup),
            setup: Some(setup),
            payload: Vec::new(),
        }
    }

    pub fn control_data(
        seq: u64,
        address: u8,
        direction: Direction,
        payload: Vec<u8>,
    ) -> RawTransferRecord {
        RawTransferRecord {
            seq,
            timestamp: seq as f64 * 0.01,
            device_address: address,
            endpoint: 0,
            direction,
            transfer_type: TransferType::Control,
            stage: Some(ControlStage::Data),
            setup: None,
            payload,
        }
    }

    pub fn control_status(seq: u64, address: u8) -> RawTransferRecord {
        control_status_with(seq, address, Vec::new())
    }

    /// A STATUS/complete record; usbmon captures carry the response data
    /// here rather than in a separate DATA stage.
    pub fn control_status_with(seq: u64, address: u8, payload: Vec<u8>) -> RawTransferRecord {
        RawTransferRecord {
            seq,
            timestamp: seq as f64 * 0.01,
            device_address: address,
            endpoint: 0,
            direction: Direction::In,
            transfer_type: TransferType::Control,
            stage: Some(ControlStage::Status),
            setup: None,
            payload,
        }
    }

    pub fn bulk(
        seq: u64,
        address: u8,
        endpoint: u8,
        direction: Direction,
        payload: Vec<u8>,
    ) -> RawTransferRecord {
        RawTransferRecord {
            seq,
            timestamp: seq as f64 * 0.01,
            device_address: address,
            endpoint,
            direction,
            transfer_type: TransferType::Bulk,
            stage: None,
            setup: None,
            payload,
        }
    }
}
