//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Field `{}` contains characters outside of the basic set", field))]
    EncodeField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Accepted presentation context {} has no transfer syntax", id))]
    MissingTransferSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("AE title `{}` is longer than 16 characters", ae_title))]
    AeTitleTooLong {
        ae_title: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit in its length field", length))]
    ChunkTooLong { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = u32::try_from(data.len())
        .ok()
        .ok_or_else(|| ChunkTooLongSnafu { length: data.len() }.build())?;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = u16::try_from(data.len())
        .ok()
        .ok_or_else(|| ChunkTooLongSnafu { length: data.len() }.build())?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Encode text in the basic character set,
/// mapping each character to a single byte.
fn encode_text(text: &str, field: &'static str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(c).ok())
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| EncodeFieldSnafu { field }.build())
}

/// Encode a UID, padded to an even length with a trailing null character.
fn encode_uid(uid: &str, field: &'static str) -> Result<Vec<u8>> {
    let mut bytes = encode_text(uid, field)?;
    if bytes.len() % 2 == 1 {
        bytes.push(b'\0');
    }
    Ok(bytes)
}

/// Encode an AE title as 16 characters,
/// padded with trailing spaces.
fn encode_ae_title(ae_title: &str, field: &'static str) -> Result<[u8; 16]> {
    let bytes = encode_text(ae_title, field)?;
    ensure!(
        bytes.len() <= 16,
        AeTitleTooLongSnafu {
            ae_title: ae_title.to_string()
        }
    );
    let mut out = [b' '; 16];
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(out)
}

/// Write the association header fields shared by A-ASSOCIATE-RQ and -AC
/// (protocol version, reserved, called and calling AE titles, reserved).
fn write_association_header(
    writer: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version, bit 0 set for version 1
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, 16 characters of the basic G0 set,
    // with non-significant trailing spaces
    let called = encode_ae_title(called_ae_title, "Called-AE-title")?;
    writer.write_all(&called).context(WriteFieldSnafu {
        field: "Called-AE-title",
    })?;

    // 27-42 - Calling-AE-title
    let calling = encode_ae_title(calling_ae_title, "Calling-AE-title")?;
    writer.write_all(&calling).context(WriteFieldSnafu {
        field: "Calling-AE-title",
    })?;

    // 43-74 - Reserved
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })?;

    Ok(())
}

/// Write a full PDU to the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    // 1 - PDU-type
    writer
        .write_u8(pdu.pdu_type())
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-6 - PDU-length, then the PDU body
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, |writer| {
            write_association_header(writer, *protocol_version, called_ae_title, calling_ae_title)?;

            // 75-xxx - Variable items
            write_pdu_variable_application_context_name(writer, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_proposed(writer, presentation_context)?;
            }
            write_pdu_variable_user_variables(writer, user_variables)?;
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "A-ASSOCIATE-RQ",
        }),
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, |writer| {
            // the AE titles are those of the A-ASSOCIATE-RQ
            write_association_header(writer, *protocol_version, called_ae_title, calling_ae_title)?;

            write_pdu_variable_application_context_name(writer, application_context_name)?;
            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_result(writer, presentation_context)?;
            }
            write_pdu_variable_user_variables(writer, user_variables)?;
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "A-ASSOCIATE-AC",
        }),
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_chunk_u32(writer, |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result
                writer
                    .write_u8(*result as u8)
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source, 10 - Reason/Diag.
                let (source_code, reason) = source.codes();
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => write_chunk_u32(writer, |writer| {
            for presentation_data_value in data {
                write_chunk_u32(writer, |writer| {
                    // 5 - Presentation-context-ID
                    writer
                        .write_u8(presentation_data_value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;

                    // 6 - Message control header
                    writer
                        .write_u8(presentation_data_value.control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;

                    writer
                        .write_all(&presentation_data_value.data)
                        .context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })?;
                    Ok(())
                })
                .context(WriteChunkSnafu {
                    name: "Presentation-data-value item",
                })?;
            }
            Ok(())
        })
        .context(WriteChunkSnafu { name: "P-DATA-TF" }),
        Pdu::ReleaseRQ | Pdu::ReleaseRP => write_chunk_u32(writer, |writer| {
            // 7-10 - Reserved
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        })
        .context(WriteChunkSnafu { name: "A-RELEASE" }),
        Pdu::AbortRQ { source } => write_chunk_u32(writer, |writer| {
            // 7-8 - Reserved
            writer
                .write_u16::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source, 10 - Reason/Diag.
            let (source_code, reason) = source.codes();
            writer
                .write_u8(source_code)
                .context(WriteFieldSnafu { field: "Source" })?;
            writer.write_u8(reason).context(WriteFieldSnafu {
                field: "Reason/Diag.",
            })?;
            Ok(())
        })
        .context(WriteChunkSnafu { name: "A-ABORT" }),
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
) -> Result<()> {
    // 1 - Item-type - 10H
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    // 3-4 - Item-length, 5-xxx - Application-context-name
    write_chunk_u16(writer, |writer| {
        let bytes = encode_uid(application_context_name, "Application-context-name")?;
        writer.write_all(&bytes).context(WriteFieldSnafu {
            field: "Application-context-name",
        })?;
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })
}

/// Write a sub-item of the form type, reserved, u16 length, UID.
fn write_uid_sub_item(
    writer: &mut dyn Write,
    item_type: u8,
    uid: &str,
    name: &'static str,
) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        let bytes = encode_uid(uid, name)?;
        writer
            .write_all(&bytes)
            .context(WriteFieldSnafu { field: name })?;
        Ok(())
    })
    .context(WriteChunkSnafu { name })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // 1 - Item-type - 20H
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        // 6-8 - Reserved
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - one Abstract Syntax sub-item (30H)
        // and one or more Transfer Syntax sub-items (40H)
        write_uid_sub_item(
            writer,
            0x30,
            &presentation_context.abstract_syntax,
            "Abstract-syntax-name",
        )?;
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_uid_sub_item(writer, 0x40, transfer_syntax, "Transfer-syntax-name")?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    ensure!(
        presentation_context.reason != PresentationContextResultReason::Acceptance
            || presentation_context.transfer_syntax.is_some(),
        MissingTransferSyntaxSnafu {
            id: presentation_context.id
        }
    );

    // 1 - Item-type - 21H
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        // 6 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        // 7 - Result/Reason
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        // 8 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 9-xxx - one Transfer Syntax sub-item,
        // only significant when the context is accepted;
        // rejected contexts without one carry a placeholder
        let transfer_syntax = presentation_context
            .transfer_syntax
            .as_deref()
            .unwrap_or(crate::uids::IMPLICIT_VR_LITTLE_ENDIAN);
        write_uid_sub_item(writer, 0x40, transfer_syntax, "Transfer-syntax-name")
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type - 50H
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // Maximum Length Sub-Item (51H)
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_uid_sub_item(writer, 0x52, uid, "Implementation-class-uid")?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    // Implementation Version Name Sub-Item (55H),
                    // not padded
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let bytes = encode_text(name, "Implementation-version-name")?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-version-name",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Version Name Sub-Item",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    // SOP Class Extended Negotiation Sub-Item (56H)
                    writer
                        .write_u8(0x56)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        // SOP-class-uid-length and SOP-class-uid
                        write_chunk_u16(writer, |writer| {
                            let bytes = encode_uid(sop_class_uid, "SOP-class-uid")?;
                            writer.write_all(&bytes).context(WriteFieldSnafu {
                                field: "SOP-class-uid",
                            })?;
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        // Service-class-application-information,
                        // up to the end of the sub-item
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    // User Identity Negotiation Sub-Item (58H)
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-Type",
                            })?;
                        writer
                            .write_u8(u8::from(user_identity.positive_response_requested()))
                            .context(WriteFieldSnafu {
                                field: "Positive-response-requested",
                            })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "Primary-field",
                                })?;
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "Primary-field",
                        })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "Secondary-field",
                                })?;
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "Secondary-field",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Unknown Sub-Item",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}
