use std::collections::{BTreeMap, BTreeSet};

use snafu::{ensure, OptionExt};
use tracing::trace;

use super::{
    Command, DataSetMismatchSnafu, DimseMessage, PduTooSmallSnafu, Result,
    UnexpectedCommandFragmentSnafu, UnexpectedDataFragmentSnafu, UnknownPresentationContextSnafu,
};
use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_HEADER_SIZE};

/// Determine the maximum length of actual PDV data
/// when encapsulated in a P-DATA-TF PDU with the given length property.
///
/// Returns `None` if the PDU length cannot hold
/// a single byte of data.
#[inline]
pub fn max_data_length(max_pdu_length: u32) -> Option<u32> {
    // data length: 4 bytes
    // presentation context id: 1 byte
    // control header: 1 byte
    max_pdu_length
        .checked_sub(PDV_HEADER_SIZE)
        .filter(|len| *len > 0)
}

/// Split a DIMSE message into P-DATA-TF PDUs,
/// each carrying a single presentation data value
/// and fitting in `max_pdu_length`,
/// the maximum PDU length announced by the receiving node.
///
/// All command fragments come first,
/// with the last one flagged as such,
/// followed by the data set fragments if there is a data set.
pub fn fragment(message: &DimseMessage, max_pdu_length: u32) -> Result<Vec<Pdu>> {
    let max_data_len = max_data_length(max_pdu_length)
        .context(PduTooSmallSnafu { max_pdu_length })? as usize;

    let data_set_type = message.command.data_set_type;
    ensure!(
        data_set_type.has_data_set() == message.dataset.is_some(),
        DataSetMismatchSnafu { data_set_type }
    );

    let command = message.command.encode()?;

    let mut pdus = Vec::new();
    push_fragments(
        &mut pdus,
        message.presentation_context_id,
        PDataValueType::Command,
        &command,
        max_data_len,
    );
    if let Some(dataset) = &message.dataset {
        push_fragments(
            &mut pdus,
            message.presentation_context_id,
            PDataValueType::Data,
            dataset,
            max_data_len,
        );
    }
    Ok(pdus)
}

fn push_fragments(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_data_len: usize,
) {
    if bytes.is_empty() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        });
        return;
    }

    let count = bytes.len().div_ceil(max_data_len);
    for (i, chunk) in bytes.chunks(max_data_len).enumerate() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        });
    }
}

/// Partial state of a message on one presentation context.
#[derive(Debug, Default)]
struct Pending {
    command_bytes: Vec<u8>,
    /// the decoded command, once all of its fragments arrived,
    /// while waiting for the data set
    command: Option<Command>,
    data_bytes: Vec<u8>,
}

/// Accumulates incoming presentation data values
/// into complete DIMSE messages.
///
/// Fragments are tracked per presentation context,
/// and only fragments on accepted contexts are admitted.
/// A message is only handed out once
/// its last command fragment was received and,
/// if the command announces a data set,
/// its last data fragment as well.
#[derive(Debug)]
pub struct Reassembler {
    accepted: BTreeSet<u8>,
    pending: BTreeMap<u8, Pending>,
}

impl Reassembler {
    /// Create a reassembler admitting the given presentation context IDs.
    pub fn new(accepted: impl IntoIterator<Item = u8>) -> Self {
        Reassembler {
            accepted: accepted.into_iter().collect(),
            pending: BTreeMap::new(),
        }
    }

    /// Feed one presentation data value,
    /// returning the message it completes, if any.
    pub fn push(&mut self, value: PDataValue) -> Result<Option<DimseMessage>> {
        let presentation_context_id = value.presentation_context_id;
        ensure!(
            self.accepted.contains(&presentation_context_id),
            UnknownPresentationContextSnafu {
                presentation_context_id
            }
        );

        let pending = self.pending.entry(presentation_context_id).or_default();

        match value.value_type {
            PDataValueType::Command => {
                ensure!(
                    pending.command.is_none(),
                    UnexpectedCommandFragmentSnafu {
                        presentation_context_id
                    }
                );
                pending.command_bytes.extend(value.data);
                if !value.is_last {
                    return Ok(None);
                }

                let command = Command::decode(&pending.command_bytes)?;
                trace!(
                    "Command {} complete on presentation context {}",
                    command,
                    presentation_context_id
                );
                if command.data_set_type.has_data_set() {
                    pending.command_bytes.clear();
                    pending.command = Some(command);
                    Ok(None)
                } else {
                    self.pending.remove(&presentation_context_id);
                    Ok(Some(DimseMessage {
                        presentation_context_id,
                        command,
                        dataset: None,
                    }))
                }
            }
            PDataValueType::Data => {
                ensure!(
                    pending.command.is_some(),
                    UnexpectedDataFragmentSnafu {
                        presentation_context_id
                    }
                );
                pending.data_bytes.extend(value.data);
                if !value.is_last {
                    return Ok(None);
                }

                let Some(pending) = self.pending.remove(&presentation_context_id) else {
                    return Ok(None);
                };
                Ok(pending.command.map(|command| DimseMessage {
                    presentation_context_id,
                    command,
                    dataset: Some(pending.data_bytes),
                }))
            }
        }
    }

    /// Whether a message is partially received on any context.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
