use dicom_ulp::pdu::reader::{read_pdu, Error as ReadError};
use dicom_ulp::pdu::writer::write_pdu;
use dicom_ulp::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderASCEReason, AssociationRJSource,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use matches::assert_matches;
use rstest::rstest;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

fn encode(pdu: &Pdu) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu)?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Pdu> {
    let mut buf = bytes;
    let pdu = read_pdu(&mut buf, MAXIMUM_PDU_SIZE, true)?.ok_or("incomplete PDU")?;
    assert!(buf.is_empty(), "{} bytes left over", buf.len());
    Ok(pdu)
}

fn association_rq() -> AssociationRQ {
    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "ECHO-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.5".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(DEFAULT_MAX_PDU),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("TEST 1.0".to_string()),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.1.2".to_string(),
                vec![1, 1, 0, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"jdoe".to_vec(),
                b"secret".to_vec(),
            )),
            // asynchronous operations window, not interpreted
            UserVariableItem::Unknown(0x53, vec![0, 1, 0, 1]),
        ],
    }
}

#[rstest]
#[case(Pdu::AssociationRQ(association_rq()))]
#[case(Pdu::AssociationAC(AssociationAC {
    protocol_version: 1,
    calling_ae_title: "ECHO-SCU".to_string(),
    called_ae_title: "ECHO-SCP".to_string(),
    application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
    presentation_contexts: vec![
        PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: Some("1.2.840.10008.1.2".to_string()),
        },
        PresentationContextResult {
            id: 3,
            reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
            transfer_syntax: None,
        },
    ],
    user_variables: vec![
        UserVariableItem::MaxLength(0),
        UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
    ],
}))]
#[case(Pdu::AssociationRJ(AssociationRJ {
    result: AssociationRJResult::Permanent,
    source: AssociationRJSource::ServiceProviderASCE(
        AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
    ),
}))]
#[case(Pdu::PData {
    data: vec![
        PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0x55; 10],
        },
        PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![0xAA; 300],
        },
    ],
})]
#[case(Pdu::ReleaseRQ)]
#[case(Pdu::ReleaseRP)]
#[case(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
#[case(Pdu::AbortRQ {
    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
})]
fn pdus_survive_the_wire(#[case] pdu: Pdu) -> Result {
    let bytes = encode(&pdu)?;
    assert_eq!(bytes[0], pdu.pdu_type());
    assert_eq!(
        u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize,
        bytes.len() - 6
    );
    assert_eq!(decode(&bytes)?, pdu);
    Ok(())
}

#[test]
fn rejected_context_result_has_no_transfer_syntax() -> Result {
    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextResult {
            id: 5,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            transfer_syntax: None,
        }],
        user_variables: vec![],
    };
    let Pdu::AssociationAC(decoded) = decode(&encode(&ac.clone().into())?)? else {
        panic!("expected A-ASSOCIATE-AC");
    };
    assert_eq!(decoded.presentation_contexts[0].transfer_syntax, None);
    assert_eq!(decoded, ac);
    Ok(())
}

#[test]
fn partial_pdu_needs_more_bytes() -> Result {
    let bytes = encode(&Pdu::AssociationRQ(association_rq()))?;
    for split in [0, 1, 5, 6, bytes.len() / 2, bytes.len() - 1] {
        let mut buf = &bytes[..split];
        assert_eq!(read_pdu(&mut buf, MAXIMUM_PDU_SIZE, true)?, None);
        // nothing consumed
        assert_eq!(buf.len(), split);
    }
    Ok(())
}

#[test]
fn consecutive_pdus_are_read_in_order() -> Result {
    let mut bytes = encode(&Pdu::ReleaseRQ)?;
    bytes.extend(encode(&Pdu::ReleaseRP)?);
    let mut buf = &bytes[..];
    assert_eq!(read_pdu(&mut buf, DEFAULT_MAX_PDU, true)?, Some(Pdu::ReleaseRQ));
    assert_eq!(read_pdu(&mut buf, DEFAULT_MAX_PDU, true)?, Some(Pdu::ReleaseRP));
    assert!(buf.is_empty());
    Ok(())
}

#[test]
fn unknown_pdu_type_is_an_error() {
    let bytes = [0x42, 0, 0, 0, 0, 2, 0, 0];
    let mut buf = &bytes[..];
    assert_matches!(
        read_pdu(&mut buf, DEFAULT_MAX_PDU, true),
        Err(ReadError::UnrecognizedPduType { pdu_type: 0x42, .. })
    );
}

#[test]
fn oversized_pdata_depends_on_strict_mode() -> Result {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 5000],
        }],
    };
    let bytes = encode(&pdu)?;

    let mut buf = &bytes[..];
    assert_matches!(
        read_pdu(&mut buf, 4096, true),
        Err(ReadError::PduTooLarge { .. })
    );

    let mut buf = &bytes[..];
    assert_eq!(read_pdu(&mut buf, 4096, false)?, Some(pdu));
    Ok(())
}
