//! PDU reader module
//!
//! Decoding happens from a byte buffer
//! which the caller fills from the transport.
//! [`read_pdu`] consumes one PDU when the buffer holds a complete one,
//! and leaves the buffer untouched otherwise.
use crate::pdu::*;
use crate::uids::trim_uid;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use bytes::Buf;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, Read};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Unrecognized PDU type {:#04x}", pdu_type))]
    UnrecognizedPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Field `{}` needs {} bytes but only {} remain",
        field,
        expected,
        available
    ))]
    Truncated {
        field: &'static str,
        expected: usize,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an unexpected item {:?}", var_item))]
    InvalidPduVariable {
        var_item: Box<PduVariableItem>,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted in context {}", id))]
    MultipleTransferSyntaxesAccepted { id: u8, backtrace: Backtrace },

    #[snafu(display("Invalid reject source {} or reason {}", source_code, reason))]
    InvalidRejectSourceOrReason {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid abort source {} or reason {}", source_code, reason))]
    InvalidAbortSourceOrReason {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid presentation context result reason {}", code))]
    InvalidPresentationContextResultReason { code: u8, backtrace: Backtrace },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax in presentation context {}", id))]
    MissingAbstractSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax in accepted presentation context {}", id))]
    MissingTransferSyntax { id: u8, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Try to decode one PDU from the front of the given buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full PDU,
/// in which case nothing is consumed.
/// The buffer must expose the PDU header in its first chunk,
/// which is always the case for `BytesMut` and byte slices.
///
/// `max_pdu_length` is the maximum PDU length announced by this node.
/// It bounds incoming P-DATA-TF PDUs:
/// in strict mode a larger one is an error,
/// otherwise it is tolerated up to [`MAXIMUM_PDU_SIZE`].
/// The remaining PDU types are bounded by [`MAXIMUM_PDU_SIZE`].
pub fn read_pdu<B>(buf: &mut B, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    B: Buf,
{
    if buf.remaining() < PDU_HEADER_SIZE as usize {
        return Ok(None);
    }

    let header = buf.chunk();
    let pdu_type = header[0];
    let pdu_length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

    ensure!(
        (0x01..=0x07).contains(&pdu_type),
        UnrecognizedPduTypeSnafu { pdu_type }
    );

    if pdu_type == 0x04 {
        if strict {
            ensure!(
                pdu_length <= max_pdu_length,
                PduTooLargeSnafu {
                    pdu_length,
                    max_pdu_length
                }
            );
        } else if pdu_length > max_pdu_length {
            ensure!(
                pdu_length <= MAXIMUM_PDU_SIZE,
                PduTooLargeSnafu {
                    pdu_length,
                    max_pdu_length: MAXIMUM_PDU_SIZE
                }
            );
            warn!(
                "Incoming pdu was too large: length {}, maximum is {}",
                pdu_length, max_pdu_length
            );
        }
    } else {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
    }

    if buf.remaining() - (PDU_HEADER_SIZE as usize) < pdu_length as usize {
        return Ok(None);
    }

    buf.advance(PDU_HEADER_SIZE as usize);
    let body = buf.copy_to_bytes(pdu_length as usize);
    let mut cursor = Cursor::new(&body[..]);

    let pdu = match pdu_type {
        0x01 => read_association_rq(&mut cursor)?,
        0x02 => read_association_ac(&mut cursor)?,
        0x03 => {
            // A-ASSOCIATE-RJ
            // 7 - Reserved
            skip_reserved(&mut cursor, 1)?;
            // 8 - Result: 1 rejected-permanent, 2 rejected-transient
            let result_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Result" })?;
            // 9 - Source, 10 - Reason/Diag.
            let source_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;
            let result = AssociationRJResult::from_code(result_code).context(
                InvalidRejectSourceOrReasonSnafu {
                    source_code,
                    reason,
                },
            )?;
            let source = AssociationRJSource::from_codes(source_code, reason).context(
                InvalidRejectSourceOrReasonSnafu {
                    source_code,
                    reason,
                },
            )?;
            Pdu::AssociationRJ(AssociationRJ { result, source })
        }
        0x04 => {
            // P-DATA-TF: one or more presentation data value items
            let mut values = vec![];
            while remaining(&cursor) > 0 {
                // 1-4 - Item-length, counting from the context ID onwards
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message control header:
                // bit 0 set for command, bit 1 set for last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;

                let data = read_n(
                    &mut cursor,
                    (item_length - 2) as usize,
                    "Presentation-data-value",
                )?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }
            Pdu::PData { data: values }
        }
        0x05 => {
            // A-RELEASE-RQ, 7-10 reserved
            skip_reserved(&mut cursor, 4)?;
            Pdu::ReleaseRQ
        }
        0x06 => {
            // A-RELEASE-RP, 7-10 reserved
            skip_reserved(&mut cursor, 4)?;
            Pdu::ReleaseRP
        }
        _ => {
            // A-ABORT
            // 7-8 - Reserved
            skip_reserved(&mut cursor, 2)?;
            // 9 - Source: 0 service-user, 1 reserved, 2 service-provider
            // 10 - Reason/Diag., only significant for the service-provider
            let source_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;
            let source = AbortRQSource::from_codes(source_code, reason).context(
                InvalidAbortSourceOrReasonSnafu {
                    source_code,
                    reason,
                },
            )?;
            Pdu::AbortRQ { source }
        }
    };

    Ok(Some(pdu))
}

/// The fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
struct AssociationHeader {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_header(cursor: &mut Cursor<&[u8]>) -> Result<AssociationHeader> {
    // 7-8 - Protocol-version, bit 0 set for version 1
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    skip_reserved(cursor, 2)?;

    // 11-26 - Called-AE-title, 16 characters,
    // leading and trailing spaces are not significant
    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;

    // 43-74 - Reserved
    skip_reserved(cursor, 32)?;

    Ok(AssociationHeader {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn read_association_rq(cursor: &mut Cursor<&[u8]>) -> Result<Pdu> {
    let header = read_association_header(cursor)?;

    let mut application_context_name = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    // 75-xxx - one application context item,
    // one or more presentation context items,
    // one user information item
    while remaining(cursor) > 0 {
        match read_pdu_variable(cursor)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("Skipping unknown A-ASSOCIATE-RQ item {:#04x}", item_type);
            }
            var_item => {
                return InvalidPduVariableSnafu {
                    var_item: Box::new(var_item),
                }
                .fail();
            }
        }
    }

    Ok(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: header.protocol_version,
        calling_ae_title: header.calling_ae_title,
        called_ae_title: header.called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_association_ac(cursor: &mut Cursor<&[u8]>) -> Result<Pdu> {
    // the AE title fields are echoed back from the request
    // and not tested on reception
    let header = read_association_header(cursor)?;

    let mut application_context_name = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while remaining(cursor) > 0 {
        match read_pdu_variable(cursor)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextResult(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("Skipping unknown A-ASSOCIATE-AC item {:#04x}", item_type);
            }
            var_item => {
                return InvalidPduVariableSnafu {
                    var_item: Box::new(var_item),
                }
                .fail();
            }
        }
    }

    Ok(Pdu::AssociationAC(AssociationAC {
        protocol_version: header.protocol_version,
        calling_ae_title: header.calling_ae_title,
        called_ae_title: header.called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_pdu_variable(cursor: &mut Cursor<&[u8]>) -> Result<PduVariableItem> {
    // 1 - Item-type
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    // 2 - Reserved
    skip_reserved(cursor, 1)?;
    // 3-4 - Item-length
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(cursor, item_length as usize, "Item")?;
    let mut item = Cursor::new(&bytes[..]);

    match item_type {
        0x10 => {
            // Application Context Item: a UID
            Ok(PduVariableItem::ApplicationContext(
                trim_uid(&decode_text(&bytes)).to_string(),
            ))
        }
        0x20 => {
            // Presentation Context Item (proposed)
            // 5 - Presentation-context-ID
            let id = item.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            // 6-8 - Reserved
            skip_reserved(&mut item, 3)?;

            // 9-xxx - one abstract syntax sub-item
            // and one or more transfer syntax sub-items
            let mut abstract_syntax = None;
            let mut transfer_syntaxes = vec![];
            while remaining(&item) > 0 {
                let (sub_type, value) = read_sub_item(&mut item)?;
                match sub_type {
                    0x30 => abstract_syntax = Some(trim_uid(&decode_text(&value)).to_string()),
                    0x40 => transfer_syntaxes.push(trim_uid(&decode_text(&value)).to_string()),
                    _ => warn!(
                        "Skipping unknown sub-item {:#04x} in presentation context {}",
                        sub_type, id
                    ),
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu { id })?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result)
            // 5 - Presentation-context-ID
            let id = item.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            // 6 - Reserved
            skip_reserved(&mut item, 1)?;
            // 7 - Result/Reason
            let code = item.read_u8().context(ReadPduFieldSnafu {
                field: "Result/Reason",
            })?;
            let reason = PresentationContextResultReason::from_code(code)
                .context(InvalidPresentationContextResultReasonSnafu { code })?;
            // 8 - Reserved
            skip_reserved(&mut item, 1)?;

            // 9-xxx - one transfer syntax sub-item,
            // not significant unless the context was accepted
            let mut transfer_syntax = None;
            while remaining(&item) > 0 {
                let (sub_type, value) = read_sub_item(&mut item)?;
                match sub_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu { id }
                        );
                        transfer_syntax = Some(trim_uid(&decode_text(&value)).to_string());
                    }
                    _ => warn!(
                        "Skipping unknown sub-item {:#04x} in presentation context {}",
                        sub_type, id
                    ),
                }
            }

            if reason == PresentationContextResultReason::Acceptance {
                ensure!(transfer_syntax.is_some(), MissingTransferSyntaxSnafu { id });
            } else {
                transfer_syntax = None;
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item, made of user data sub-items
            let mut user_variables = vec![];
            while remaining(&item) > 0 {
                let (sub_type, value) = read_sub_item(&mut item)?;
                user_variables.push(read_user_variable(sub_type, value)?);
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_user_variable(sub_type: u8, value: Vec<u8>) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(&value[..]);
    let item = match sub_type {
        0x51 => {
            // Maximum-length-received, 0 meaning unlimited
            UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
                ReadPduFieldSnafu {
                    field: "Maximum-length-received",
                },
            )?)
        }
        0x52 => UserVariableItem::ImplementationClassUID(trim_uid(&decode_text(&value)).to_string()),
        0x55 => UserVariableItem::ImplementationVersionName(decode_text(&value).trim().to_string()),
        0x56 => {
            // SOP Class Extended Negotiation:
            // SOP-class-uid-length, SOP-class-uid,
            // then service-class-application-information up to the end of the item
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let uid = read_n(&mut cursor, uid_length as usize, "SOP-class-uid")?;
            let info_length = remaining(&cursor);
            let info = read_n(
                &mut cursor,
                info_length,
                "Service-class-application-information",
            )?;
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                trim_uid(&decode_text(&uid)).to_string(),
                info,
            )
        }
        0x58 => {
            // User Identity Negotiation
            let type_code = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-Type",
            })?;
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Positive-response-requested",
            })?;
            let primary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Primary-field-length",
            })?;
            let primary_field = read_n(&mut cursor, primary_length as usize, "Primary-field")?;
            let secondary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Secondary-field-length",
            })?;
            let secondary_field =
                read_n(&mut cursor, secondary_length as usize, "Secondary-field")?;

            match UserIdentityType::from_code(type_code) {
                Some(identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", type_code);
                    UserVariableItem::Unknown(sub_type, value)
                }
            }
        }
        _ => UserVariableItem::Unknown(sub_type, value),
    };
    Ok(item)
}

/// Read a sub-item with the usual framing
/// (type, reserved byte, 2-byte length), returning its type and value.
fn read_sub_item(cursor: &mut Cursor<&[u8]>) -> Result<(u8, Vec<u8>)> {
    let sub_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    skip_reserved(cursor, 1)?;
    let length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let value = read_n(cursor, length as usize, "Sub-item")?;
    Ok((sub_type, value))
}

fn read_ae_title(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<String> {
    let mut ae_bytes = [0; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(decode_text(&ae_bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

/// Decode text of the basic G0 set.
/// Bytes outside of it are mapped as ISO 8859-1
/// so that decoding never fails.
fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn read_n(cursor: &mut Cursor<&[u8]>, n: usize, field: &'static str) -> Result<Vec<u8>> {
    let available = remaining(cursor);
    ensure!(
        n <= available,
        TruncatedSnafu {
            field,
            expected: n,
            available
        }
    );
    let start = cursor.position() as usize;
    let out = cursor.get_ref()[start..start + n].to_vec();
    cursor.set_position((start + n) as u64);
    Ok(out)
}

fn skip_reserved(cursor: &mut Cursor<&[u8]>, n: usize) -> Result<()> {
    let available = remaining(cursor);
    ensure!(
        n <= available,
        TruncatedSnafu {
            field: "Reserved",
            expected: n,
            available
        }
    );
    cursor.set_position(cursor.position() + n as u64);
    Ok(())
}
