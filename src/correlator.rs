//! Transaction correlator: the state machine that merges one device's raw
//! transfer records into logical request/response units.
//!
//! Two rules run side by side over the same ordered stream: control
//! transfers are bracketed by their SETUP and STATUS stages, bulk pairs
//! rest on OUT/IN sequence adjacency. The correlator never reorders
//! records; it only groups them, and every record ends up either in
//! exactly one transaction or in the orphan list.

use crate::types::{
    Confidence, ControlStage, Direction, LogicalTransaction, RawTransferRecord, TransactionKind,
    TransferType,
};
use log::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelatorConfig {
    /// Bulk endpoint carrying commands (host to device). `None` infers it
    /// from the first bulk OUT transfer of each device.
    pub command_endpoint: Option<u8>,
    /// Bulk endpoint carrying responses (device to host). `None` infers it
    /// from the first bulk IN transfer of each device.
    pub response_endpoint: Option<u8>,
}

/// Correlation result for one device session. `orphaned` holds indexes of
/// records no rule could attribute; they are reported, never dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub transactions: Vec<LogicalTransaction>,
    pub orphaned: Vec<usize>,
}

struct OpenControl {
    endpoint: u8,
    setup: usize,
    data: Vec<usize>,
}

pub fn correlate(records: &[RawTransferRecord], config: &CorrelatorConfig) -> Correlation {
    let mut transactions = Vec::new();
    let mut orphaned = Vec::new();

    let mut open_control: Option<OpenControl> = None;
    let mut open_bulk: Option<usize> = None;
    let mut command_endpoint = config.command_endpoint;
    let mut response_endpoint = config.response_endpoint;

    for (index, record) in records.iter().enumerate() {
        match record.transfer_type {
            TransferType::Control => match record.stage {
                Some(ControlStage::Setup) => {
                    if let Some(open) = open_control.take() {
                        // Interleaved control transfer: emit what we have.
                        debug!(
                            "setup at seq {} interrupts open transfer at seq {}",
                            record.seq, records[open.setup].seq
                        );
                        transactions.push(finish_control(
                            open,
                            records,
                            None,
                            Confidence::Ambiguous,
                        ));
                    }
                    open_control = Some(OpenControl {
                        endpoint: record.endpoint,
                        setup: index,
                        data: Vec::new(),
                    });
                }
                Some(ControlStage::Data) => match open_control.as_mut() {
                    Some(open) if open.endpoint == record.endpoint => open.data.push(index),
                    _ => orphaned.push(index),
                },
                Some(ControlStage::Status) => match open_control.take() {
                    Some(open) if open.endpoint == record.endpoint => {
                        let confidence = if open.data.len() <= 1 {
                            Confidence::Exact
                        } else {
                            Confidence::Inferred
                        };
                        transactions.push(finish_control(
                            open,
                            records,
                            Some(index),
                            confidence,
                        ));
                    }
                    other => {
                        open_control = other;
                        orphaned.push(index);
                    }
                },
                None => orphaned.push(index),
            },
            TransferType::Bulk => match record.direction {
                Direction::Out => {
                    let endpoint = *command_endpoint.get_or_insert(record.endpoint);
                    if record.endpoint != endpoint {
                        orphaned.push(index);
                        continue;
                    }
                    if let Some(out) = open_bulk.take() {
                        // Two commands back to back: never merge them.
                        transactions.push(finish_bulk(Some(out), None, records));
                    }
                    open_bulk = Some(index);
                }
                Direction::In => {
                    let endpoint = *response_endpoint.get_or_insert(record.endpoint);
                    if record.endpoint != endpoint {
                        orphaned.push(index);
                        continue;
                    }
                    match open_bulk.take() {
                        Some(out) => {
                            transactions.push(finish_bulk(Some(out), Some(index), records))
                        }
                        None => {
                            // Unsolicited read; the command may predate the
                            // capture or have gone over the control pipe.
                            transactions.push(finish_bulk(None, Some(index), records));
                        }
                    }
                }
            },
            TransferType::Interrupt | TransferType::Isochronous => orphaned.push(index),
        }
    }

    // End of capture: report dangling state rather than dropping it.
    if let Some(open) = open_control.take() {
        debug!("setup at seq {} dangling at end of capture", records[open.setup].seq);
        transactions.push(finish_control(open, records, None, Confidence::Ambiguous));
    }
    if let Some(out) = open_bulk.take() {
        transactions.push(finish_bulk(Some(out), None, records));
    }

    transactions.sort_by_key(|t| t.start_seq);

    Correlation {
        transactions,
        orphaned,
    }
}

fn finish_control(
    open: OpenControl,
    records: &[RawTransferRecord],
    status: Option<usize>,
    confidence: Confidence,
) -> LogicalTransaction {
    let mut request = vec![open.setup];
    let mut response = Vec::new();
    for &index in &open.data {
        match records[index].direction {
            Direction::Out => request.push(index),
            Direction::In => response.push(index),
        }
    }
    if let Some(index) = status {
        response.push(index);
    }

    let last = status
        .or(open.data.last().copied())
        .unwrap_or(open.setup);
    LogicalTransaction {
        kind: TransactionKind::ControlTransfer,
        request,
        response,
        closed: status.is_some(),
        confidence,
        start_seq: records[open.setup].seq,
        end_seq: records[last].seq,
    }
}

fn finish_bulk(
    out: Option<usize>,
    response: Option<usize>,
    records: &[RawTransferRecord],
) -> LogicalTransaction {
    let first = out.or(response).expect("bulk transaction without records");
    let last = response.or(out).expect("bulk transaction without records");
    LogicalTransaction {
        kind: TransactionKind::BulkCommandResponse,
        request: out.into_iter().collect(),
        response: response.into_iter().collect(),
        closed: response.is_some(),
        // Bulk endpoints carry no request/response linkage; adjacency
        // pairing is the best available. Unsolicited reads are weaker
        // still.
        confidence: if out.is_some() {
            Confidence::Inferred
        } else {
            Confidence::Ambiguous
        },
        start_seq: records[first].seq,
        end_seq: records[last].seq,
    }
}
