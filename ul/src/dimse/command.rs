//! DIMSE command sets.
//!
//! A command set is a small data set made only of group 0000 elements,
//! always encoded in Implicit VR Little Endian
//! regardless of the transfer syntax negotiated for the presentation context.
use std::collections::BTreeMap;
use std::fmt;

use byteordered::byteorder::{LittleEndian, ReadBytesExt};
use snafu::{ensure, OptionExt, ResultExt};

use super::{
    CommandTooLongSnafu, DecodeElementSnafu, InvalidElementLengthSnafu, InvalidElementValueSnafu,
    MissingElementSnafu, NotACommandGroupSnafu, Result,
};
use crate::uids::trim_uid;

/// Element numbers of the command group (0000,xxxx)
/// known to this implementation.
pub mod tags {
    pub const COMMAND_GROUP_LENGTH: u16 = 0x0000;
    pub const AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
    pub const REQUESTED_SOP_CLASS_UID: u16 = 0x0003;
    pub const COMMAND_FIELD: u16 = 0x0100;
    pub const MESSAGE_ID: u16 = 0x0110;
    pub const MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
    pub const MOVE_DESTINATION: u16 = 0x0600;
    pub const PRIORITY: u16 = 0x0700;
    pub const COMMAND_DATA_SET_TYPE: u16 = 0x0800;
    pub const STATUS: u16 = 0x0900;
    pub const AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;
    pub const REQUESTED_SOP_INSTANCE_UID: u16 = 0x1001;
}

/// The value of Command Data Set Type (0000,0800)
/// stating that no data set follows the command.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// The kind of DIMSE operation, as in Command Field (0000,0100).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
    /// a command field value not defined by the standard
    Other(u16),
}

impl CommandField {
    const KNOWN: [(CommandField, u16); 23] = [
        (CommandField::CStoreRq, 0x0001),
        (CommandField::CStoreRsp, 0x8001),
        (CommandField::CGetRq, 0x0010),
        (CommandField::CGetRsp, 0x8010),
        (CommandField::CFindRq, 0x0020),
        (CommandField::CFindRsp, 0x8020),
        (CommandField::CMoveRq, 0x0021),
        (CommandField::CMoveRsp, 0x8021),
        (CommandField::CEchoRq, 0x0030),
        (CommandField::CEchoRsp, 0x8030),
        (CommandField::NEventReportRq, 0x0100),
        (CommandField::NEventReportRsp, 0x8100),
        (CommandField::NGetRq, 0x0110),
        (CommandField::NGetRsp, 0x8110),
        (CommandField::NSetRq, 0x0120),
        (CommandField::NSetRsp, 0x8120),
        (CommandField::NActionRq, 0x0130),
        (CommandField::NActionRsp, 0x8130),
        (CommandField::NCreateRq, 0x0140),
        (CommandField::NCreateRsp, 0x8140),
        (CommandField::NDeleteRq, 0x0150),
        (CommandField::NDeleteRsp, 0x8150),
        (CommandField::CCancelRq, 0x0FFF),
    ];

    pub fn from_code(code: u16) -> Self {
        Self::KNOWN
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(field, _)| *field)
            .unwrap_or(CommandField::Other(code))
    }

    /// The same command field, with `Other` codes of known commands
    /// mapped to their named variants.
    pub fn normalized(self) -> Self {
        Self::from_code(self.code())
    }

    pub fn code(self) -> u16 {
        match self {
            CommandField::Other(code) => code,
            field => Self::KNOWN
                .iter()
                .find(|(f, _)| *f == field)
                .map(|(_, c)| *c)
                .unwrap_or_default(),
        }
    }

    /// Whether this is a response command (bit 15 set).
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// The response command field matching this request,
    /// or `None` if this is already a response or has no response (C-CANCEL).
    pub fn response(self) -> Option<Self> {
        let field = self.normalized();
        if field.is_response() || field == CommandField::CCancelRq {
            return None;
        }
        Some(Self::from_code(field.code() | 0x8000))
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::NEventReportRq => "N-EVENT-REPORT-RQ",
            CommandField::NEventReportRsp => "N-EVENT-REPORT-RSP",
            CommandField::NGetRq => "N-GET-RQ",
            CommandField::NGetRsp => "N-GET-RSP",
            CommandField::NSetRq => "N-SET-RQ",
            CommandField::NSetRsp => "N-SET-RSP",
            CommandField::NActionRq => "N-ACTION-RQ",
            CommandField::NActionRsp => "N-ACTION-RSP",
            CommandField::NCreateRq => "N-CREATE-RQ",
            CommandField::NCreateRsp => "N-CREATE-RSP",
            CommandField::NDeleteRq => "N-DELETE-RQ",
            CommandField::NDeleteRsp => "N-DELETE-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
            CommandField::Other(code) => return write!(f, "command {:#06x}", code),
        };
        f.write_str(name)
    }
}

/// Priority (0000,0700) of a C-STORE, C-FIND, C-GET or C-MOVE request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Priority {
    Low = 0x0002,
    #[default]
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Command Data Set Type (0000,0800):
/// whether a data set follows the command.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandDataSetType {
    /// no data set, encoded as 0101H
    #[default]
    Absent,
    /// a data set follows; any value other than 0101H
    Present(u16),
}

impl CommandDataSetType {
    /// A data set is present, with the usual encoded value 0000H.
    pub const PRESENT: CommandDataSetType = CommandDataSetType::Present(0x0000);

    pub fn from_code(code: u16) -> Self {
        if code == DATA_SET_ABSENT {
            CommandDataSetType::Absent
        } else {
            CommandDataSetType::Present(code)
        }
    }

    pub fn code(self) -> u16 {
        match self {
            CommandDataSetType::Absent => DATA_SET_ABSENT,
            CommandDataSetType::Present(code) => code,
        }
    }

    pub fn has_data_set(self) -> bool {
        matches!(self, CommandDataSetType::Present(_))
    }
}

/// The category of a DIMSE status code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
    Success,
    Warning,
    Failure,
    Cancel,
    Pending,
}

impl StatusType {
    /// Classify a status code as defined in PS3.7 Annex C.
    pub fn of(status: u16) -> Self {
        match status {
            0x0000 => StatusType::Success,
            0xFF00 | 0xFF01 => StatusType::Pending,
            0xFE00 => StatusType::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusType::Warning,
            _ => StatusType::Failure,
        }
    }
}

/// Well-known status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;
    pub const REFUSED_SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
}

/// A DIMSE command set.
///
/// The elements most services rely on are typed fields.
/// Any other element of group 0000 is kept verbatim in [`other`](Command::other),
/// keyed by element number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub move_destination: Option<String>,
    pub priority: Option<Priority>,
    pub data_set_type: CommandDataSetType,
    pub status: Option<u16>,
    pub other: BTreeMap<u16, Vec<u8>>,
}

impl Command {
    /// A bare command of the given kind, with no data set.
    pub fn new(command_field: CommandField) -> Self {
        Command {
            command_field: command_field.normalized(),
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            requested_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_instance_uid: None,
            move_destination: None,
            priority: None,
            data_set_type: CommandDataSetType::Absent,
            status: None,
            other: BTreeMap::new(),
        }
    }

    /// A request addressed to the given SOP class.
    ///
    /// Requests of the composite services which carry a priority
    /// (C-STORE, C-FIND, C-GET and C-MOVE) start at medium priority.
    pub fn request(
        command_field: CommandField,
        message_id: u16,
        affected_sop_class_uid: impl Into<String>,
    ) -> Self {
        let priority = match command_field.normalized() {
            CommandField::CStoreRq
            | CommandField::CFindRq
            | CommandField::CGetRq
            | CommandField::CMoveRq => Some(Priority::Medium),
            _ => None,
        };
        Command {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(affected_sop_class_uid.into()),
            priority,
            ..Command::new(command_field)
        }
    }

    /// A C-ECHO-RQ for the Verification SOP class.
    pub fn echo_rq(message_id: u16) -> Self {
        Command::request(CommandField::CEchoRq, message_id, crate::uids::VERIFICATION)
    }

    /// The response to the given request, with no data set.
    ///
    /// Returns `None` if the command is not a request with a response.
    pub fn response_to(request: &Command, status: u16) -> Option<Self> {
        let command_field = request.command_field.response()?;
        Some(Command {
            message_id_being_responded_to: request.message_id,
            affected_sop_class_uid: request
                .affected_sop_class_uid
                .clone()
                .or_else(|| request.requested_sop_class_uid.clone()),
            affected_sop_instance_uid: request
                .affected_sop_instance_uid
                .clone()
                .or_else(|| request.requested_sop_instance_uid.clone()),
            status: Some(status),
            ..Command::new(command_field)
        })
    }

    /// Attach a data set announcement to this command.
    pub fn with_data_set(mut self) -> Self {
        self.data_set_type = CommandDataSetType::PRESENT;
        self
    }

    pub fn status_type(&self) -> Option<StatusType> {
        self.status.map(StatusType::of)
    }

    /// Encode the command set in Implicit VR Little Endian,
    /// starting with Command Group Length (0000,0000).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut elements: BTreeMap<u16, Vec<u8>> = self.other.clone();
        elements.remove(&tags::COMMAND_GROUP_LENGTH);

        let mut put_uid = |element: u16, value: &Option<String>| {
            if let Some(uid) = value {
                let mut bytes = uid.as_bytes().to_vec();
                if bytes.len() % 2 == 1 {
                    bytes.push(b'\0');
                }
                elements.insert(element, bytes);
            }
        };
        put_uid(tags::AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        put_uid(tags::REQUESTED_SOP_CLASS_UID, &self.requested_sop_class_uid);
        put_uid(
            tags::AFFECTED_SOP_INSTANCE_UID,
            &self.affected_sop_instance_uid,
        );
        put_uid(
            tags::REQUESTED_SOP_INSTANCE_UID,
            &self.requested_sop_instance_uid,
        );

        let us = |value: u16| value.to_le_bytes().to_vec();
        elements.insert(tags::COMMAND_FIELD, us(self.command_field.code()));
        if let Some(id) = self.message_id {
            elements.insert(tags::MESSAGE_ID, us(id));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.insert(tags::MESSAGE_ID_BEING_RESPONDED_TO, us(id));
        }
        if let Some(destination) = &self.move_destination {
            let mut bytes = destination.as_bytes().to_vec();
            if bytes.len() % 2 == 1 {
                bytes.push(b' ');
            }
            elements.insert(tags::MOVE_DESTINATION, bytes);
        }
        if let Some(priority) = self.priority {
            elements.insert(tags::PRIORITY, us(priority as u16));
        }
        elements.insert(tags::COMMAND_DATA_SET_TYPE, us(self.data_set_type.code()));
        if let Some(status) = self.status {
            elements.insert(tags::STATUS, us(status));
        }

        let mut body = Vec::new();
        for (element, value) in &elements {
            write_element(&mut body, *element, value)?;
        }

        let group_length = u32::try_from(body.len())
            .ok()
            .context(CommandTooLongSnafu { length: body.len() })?;
        let mut out = Vec::with_capacity(body.len() + 12);
        write_element(&mut out, tags::COMMAND_GROUP_LENGTH, &group_length.to_le_bytes())?;
        out.extend(body);
        Ok(out)
    }

    /// Decode a command set from its Implicit VR Little Endian encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut elements = BTreeMap::new();
        let mut reader = bytes;
        while !reader.is_empty() {
            let group = reader
                .read_u16::<LittleEndian>()
                .context(DecodeElementSnafu)?;
            let element = reader
                .read_u16::<LittleEndian>()
                .context(DecodeElementSnafu)?;
            ensure!(group == 0x0000, NotACommandGroupSnafu { group, element });
            let length = reader
                .read_u32::<LittleEndian>()
                .context(DecodeElementSnafu)? as usize;
            ensure!(
                length <= reader.len(),
                InvalidElementLengthSnafu { element, length }
            );
            let (value, rest) = reader.split_at(length);
            elements.insert(element, value.to_vec());
            reader = rest;
        }
        // recomputed on encoding
        elements.remove(&tags::COMMAND_GROUP_LENGTH);

        let command_field = take_us(&mut elements, tags::COMMAND_FIELD)?
            .map(CommandField::from_code)
            .context(MissingElementSnafu {
                element: tags::COMMAND_FIELD,
            })?;
        let priority = match take_us(&mut elements, tags::PRIORITY)? {
            Some(code) => Some(
                Priority::from_code(code).context(InvalidElementValueSnafu {
                    element: tags::PRIORITY,
                })?,
            ),
            None => None,
        };
        let data_set_type = take_us(&mut elements, tags::COMMAND_DATA_SET_TYPE)?
            .map(CommandDataSetType::from_code)
            .context(MissingElementSnafu {
                element: tags::COMMAND_DATA_SET_TYPE,
            })?;

        Ok(Command {
            command_field,
            message_id: take_us(&mut elements, tags::MESSAGE_ID)?,
            message_id_being_responded_to: take_us(
                &mut elements,
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
            )?,
            affected_sop_class_uid: take_uid(&mut elements, tags::AFFECTED_SOP_CLASS_UID),
            requested_sop_class_uid: take_uid(&mut elements, tags::REQUESTED_SOP_CLASS_UID),
            affected_sop_instance_uid: take_uid(&mut elements, tags::AFFECTED_SOP_INSTANCE_UID),
            requested_sop_instance_uid: take_uid(&mut elements, tags::REQUESTED_SOP_INSTANCE_UID),
            move_destination: elements
                .remove(&tags::MOVE_DESTINATION)
                .map(|v| decode_text(&v).trim().to_string()),
            priority,
            data_set_type,
            status: take_us(&mut elements, tags::STATUS)?,
            other: elements,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_field)?;
        if let Some(id) = self.message_id {
            write!(f, " (message {})", id)?;
        }
        if let Some(id) = self.message_id_being_responded_to {
            write!(f, " (responding to {})", id)?;
        }
        if let Some(status) = self.status {
            write!(f, " status {:#06x}", status)?;
        }
        Ok(())
    }
}

fn write_element(out: &mut Vec<u8>, element: u16, value: &[u8]) -> Result<()> {
    let length = u32::try_from(value.len())
        .ok()
        .context(CommandTooLongSnafu {
            length: value.len(),
        })?;
    out.extend_from_slice(&0x0000_u16.to_le_bytes());
    out.extend_from_slice(&element.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn take_us(elements: &mut BTreeMap<u16, Vec<u8>>, element: u16) -> Result<Option<u16>> {
    match elements.remove(&element) {
        None => Ok(None),
        Some(value) => {
            ensure!(
                value.len() == 2,
                InvalidElementLengthSnafu {
                    element,
                    length: value.len()
                }
            );
            Ok(Some(u16::from_le_bytes([value[0], value[1]])))
        }
    }
}

fn take_uid(elements: &mut BTreeMap<u16, Vec<u8>>, element: u16) -> Option<String> {
    elements
        .remove(&element)
        .map(|v| trim_uid(&decode_text(&v)).to_string())
}

fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
