//! DIMSE message layer
//!
//! This module turns the presentation data values carried by P-DATA-TF PDUs
//! into whole DIMSE messages (a command set plus an optional data set),
//! and back.
//!
//! - [`Command`] is the typed command set,
//!   encoded in Implicit VR Little Endian.
//! - [`fragment`] splits an outgoing [`DimseMessage`] into P-DATA-TF PDUs
//!   which fit the peer's maximum PDU length.
//! - [`Reassembler`] accumulates incoming fragments per presentation context
//!   and yields a message only once it is complete.
pub mod command;
mod fragment;

use snafu::{Backtrace, Snafu};

pub use command::{
    status, Command, CommandDataSetType, CommandField, Priority, StatusType, DATA_SET_ABSENT,
};
pub use fragment::{fragment, max_data_length, Reassembler};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Could not decode command element
    DecodeElement {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Element (0000,{:04X}) has invalid length {}", element, length))]
    InvalidElementLength {
        element: u16,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Element (0000,{:04X}) has an invalid value", element))]
    InvalidElementValue { element: u16, backtrace: Backtrace },

    #[snafu(display("Missing required command element (0000,{:04X})", element))]
    MissingElement { element: u16, backtrace: Backtrace },

    #[snafu(display(
        "Element ({:04X},{:04X}) does not belong to the command group",
        group,
        element
    ))]
    NotACommandGroup {
        group: u16,
        element: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("Command set of {} bytes is too long", length))]
    CommandTooLong { length: usize, backtrace: Backtrace },

    #[snafu(display(
        "Maximum PDU length {} leaves no room for presentation data",
        max_pdu_length
    ))]
    PduTooSmall {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Command data set type ({:?}) does not match the presence of a data set",
        data_set_type
    ))]
    DataSetMismatch {
        data_set_type: CommandDataSetType,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Presentation data value on unknown or rejected presentation context {}",
        presentation_context_id
    ))]
    UnknownPresentationContext {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Data fragment on presentation context {} without a command expecting a data set",
        presentation_context_id
    ))]
    UnexpectedDataFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Command fragment on presentation context {} while awaiting a data set",
        presentation_context_id
    ))]
    UnexpectedCommandFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A complete DIMSE message:
/// a command set and an optional data set
/// exchanged on one presentation context.
///
/// The data set is kept as an opaque byte buffer,
/// encoded in the transfer syntax of the presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: Command,
    pub dataset: Option<Vec<u8>>,
}

impl DimseMessage {
    /// Create a message without a data set.
    pub fn new(presentation_context_id: u8, command: Command) -> Self {
        DimseMessage {
            presentation_context_id,
            command: Command {
                data_set_type: CommandDataSetType::Absent,
                ..command
            },
            dataset: None,
        }
    }

    /// Create a message with a data set,
    /// flagging its presence in the command.
    pub fn with_dataset(presentation_context_id: u8, command: Command, dataset: Vec<u8>) -> Self {
        let data_set_type = if command.data_set_type.has_data_set() {
            command.data_set_type
        } else {
            CommandDataSetType::PRESENT
        };
        DimseMessage {
            presentation_context_id,
            command: Command {
                data_set_type,
                ..command
            },
            dataset: Some(dataset),
        }
    }
}
