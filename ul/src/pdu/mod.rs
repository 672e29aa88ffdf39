//! Protocol Data Unit module
//!
//! This module holds the in-memory representation of every
//! protocol data unit (PDU) exchanged by the upper layer protocol,
//! together with the [reader](reader::read_pdu) and [writer](writer::write_pdu)
//! that map them to and from the wire format described in PS3.8.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size admitted when not in strict mode,
/// and the ceiling used when a peer announces an unlimited length.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The number of bytes taken by a presentation data value item
/// before its fragment:
/// item length (4 bytes),
/// presentation context ID (1 byte)
/// and message control header (1 byte).
pub const PDV_HEADER_SIZE: u32 = 6;

/// Whether the given number is a valid presentation context identifier,
/// meaning an odd integer between 1 and 255.
#[inline]
pub fn is_valid_presentation_context_id(id: u8) -> bool {
    id % 2 == 1
}

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier
    pub id: u8,
    /// the proposed abstract syntax UID
    /// (commonly referring to a SOP class)
    pub abstract_syntax: String,
    /// the transfer syntax UIDs proposed for this context,
    /// in order of preference of the requestor
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the outcome of a presentation context,
/// as sent by the association acceptor.
///
/// The transfer syntax sub-item is only significant
/// when the reason is [`Acceptance`](PresentationContextResultReason::Acceptance).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: Option<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        use PresentationContextResultReason::*;
        [
            Acceptance,
            UserRejection,
            NoReason,
            AbstractSyntaxNotSupported,
            TransferSyntaxesNotSupported,
        ]
        .into_iter()
        .find(|r| *r as u8 == code)
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Acceptance => "acceptance",
            Self::UserRejection => "user rejection",
            Self::NoReason => "no reason",
            Self::AbstractSyntaxNotSupported => "abstract syntax not supported",
            Self::TransferSyntaxesNotSupported => "transfer syntaxes not supported",
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Permanent),
            2 => Some(Self::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection,
/// each carrying its own set of reasons.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => AssociationRJServiceUserReason::from_code(reason).map(Self::ServiceUser),
            2 => AssociationRJServiceProviderASCEReason::from_code(reason)
                .map(Self::ServiceProviderASCE),
            3 => AssociationRJServiceProviderPresentationReason::from_code(reason)
                .map(Self::ServiceProviderPresentation),
            _ => None,
        }
    }

    /// The pair of source and reason/diag. codes of this rejection.
    pub(crate) fn codes(&self) -> (u8, u8) {
        match self {
            Self::ServiceUser(r) => (1, r.code()),
            Self::ServiceProviderASCE(r) => (2, r.code()),
            Self::ServiceProviderPresentation(r) => (3, r.code()),
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderASCE(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderPresentation(r) => Display::fmt(r, f),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    /// codes 4-6 and 8-10
    Reserved(u8),
}

impl AssociationRJServiceUserReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NoReasonGiven),
            2 => Some(Self::ApplicationContextNameNotSupported),
            3 => Some(Self::CallingAETitleNotRecognized),
            7 => Some(Self::CalledAETitleNotRecognized),
            4..=6 | 8..=10 => Some(Self::Reserved(code)),
            _ => None,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::NoReasonGiven => 1,
            Self::ApplicationContextNameNotSupported => 2,
            Self::CallingAETitleNotRecognized => 3,
            Self::CalledAETitleNotRecognized => 7,
            Self::Reserved(code) => *code,
        }
    }
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoReasonGiven => f.write_str("no reason given"),
            Self::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            Self::CallingAETitleNotRecognized => f.write_str("calling AE title not recognized"),
            Self::CalledAETitleNotRecognized => f.write_str("called AE title not recognized"),
            Self::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl AssociationRJServiceProviderASCEReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NoReasonGiven),
            2 => Some(Self::ProtocolVersionNotSupported),
            _ => None,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::NoReasonGiven => 1,
            Self::ProtocolVersionNotSupported => 2,
        }
    }
}

impl Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoReasonGiven => f.write_str("no reason given"),
            Self::ProtocolVersionNotSupported => f.write_str("protocol version not supported"),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    /// codes 0 and 3-7
    Reserved(u8),
}

impl AssociationRJServiceProviderPresentationReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::TemporaryCongestion),
            2 => Some(Self::LocalLimitExceeded),
            0 | 3..=7 => Some(Self::Reserved(code)),
            _ => None,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::TemporaryCongestion => 1,
            Self::LocalLimitExceeded => 2,
            Self::Reserved(code) => *code,
        }
    }
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TemporaryCongestion => f.write_str("temporary congestion"),
            Self::LocalLimitExceeded => f.write_str("local limit exceeded"),
            Self::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// A single presentation data value (PDV),
/// which is one fragment of a command or data set.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    /// The message control header byte of this value.
    pub(crate) fn control_header(&self) -> u8 {
        let command = match self.value_type {
            PDataValueType::Command => 0x01,
            PDataValueType::Data => 0x00,
        };
        let last = if self.is_last { 0x02 } else { 0x00 };
        command | last
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an A-ABORT.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(Self::ServiceUser),
            1 => Some(Self::Reserved),
            2 => AbortRQServiceProviderReason::from_code(reason).map(Self::ServiceProvider),
            _ => None,
        }
    }

    pub(crate) fn codes(&self) -> (u8, u8) {
        match self {
            Self::ServiceUser => (0, 0),
            Self::Reserved => (1, 0),
            Self::ServiceProvider(reason) => (2, *reason as u8),
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceUser => f.write_str("service user"),
            Self::Reserved => f.write_str("reserved source"),
            Self::ServiceProvider(reason) => write!(f, "service provider ({})", reason),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified = 0,
    UnrecognizedPdu = 1,
    UnexpectedPdu = 2,
    Reserved = 3,
    UnrecognizedPduParameter = 4,
    UnexpectedPduParameter = 5,
    InvalidPduParameter = 6,
}

impl AbortRQServiceProviderReason {
    fn from_code(code: u8) -> Option<Self> {
        use AbortRQServiceProviderReason::*;
        [
            ReasonNotSpecified,
            UnrecognizedPdu,
            UnexpectedPdu,
            Reserved,
            UnrecognizedPduParameter,
            UnexpectedPduParameter,
            InvalidPduParameter,
        ]
        .into_iter()
        .find(|r| *r as u8 == code)
    }
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ReasonNotSpecified => "reason not specified",
            Self::UnrecognizedPdu => "unrecognized PDU",
            Self::UnexpectedPdu => "unexpected PDU",
            Self::Reserved => "reserved code",
            Self::UnrecognizedPduParameter => "unrecognized PDU parameter",
            Self::UnexpectedPduParameter => "unexpected PDU parameter",
            Self::InvalidPduParameter => "invalid PDU parameter",
        })
    }
}

/// A variable item of an A-ASSOCIATE-RQ or A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    /// An item of unrecognized type, skipped on read
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// An unrecognized sub-item, kept as its type and raw content
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    /// SOP class UID and service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    UserIdentityItem(UserIdentity),
}

/// User identity negotiation sub-item, as proposed by the requestor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Shortcut for a username-only identity.
    pub fn username(username: impl Into<String>) -> Self {
        Self::new(
            false,
            UserIdentityType::Username,
            username.into().into_bytes(),
            Vec::new(),
        )
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username = 1,
    UsernamePassword = 2,
    KerberosServiceTicket = 3,
    SamlAssertion = 4,
    Jwt = 5,
}

impl UserIdentityType {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        use UserIdentityType::*;
        [
            Username,
            UsernamePassword,
            KerberosServiceTicket,
            SamlAssertion,
            Jwt,
        ]
        .into_iter()
        .find(|t| *t as u8 == code)
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acceptance (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data (P-DATA-TF)
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// The PDU type code, as written in the first byte of the PDU header.
    pub fn pdu_type(&self) -> u8 {
        match self {
            Pdu::AssociationRQ(_) => 0x01,
            Pdu::AssociationAC(_) => 0x02,
            Pdu::AssociationRJ(_) => 0x03,
            Pdu::PData { .. } => 0x04,
            Pdu::ReleaseRQ => 0x05,
            Pdu::ReleaseRP => 0x06,
            Pdu::AbortRQ { .. } => 0x07,
        }
    }

    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::AssociationRQ(rq) => write!(
                f,
                "AssociationRQ {{ {} -> {}, {} presentation contexts }}",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "AssociationAC {{ {} presentation contexts }}",
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ(rj) => write!(f, "AssociationRJ {{ {:?}: {} }}", rj.result, rj.source),
            Pdu::ReleaseRQ | Pdu::ReleaseRP | Pdu::AbortRQ { .. } => {
                std::fmt::Debug::fmt(self.0, f)
            }
            Pdu::PData { data } => match data.as_slice() {
                [pdv] => write!(f, "PData [({:?}, {} bytes)]", pdv.value_type, pdv.data.len()),
                [a, b] => write!(
                    f,
                    "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                    a.value_type,
                    a.data.len(),
                    b.value_type,
                    b.data.len(),
                ),
                _ => write!(f, "PData [{} p-data values]", data.len()),
            },
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acceptance
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_short_description() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRQ { source: ServiceUser }",
        );

        let pdu = Pdu::PData {
            data: vec![PDataValue {
                is_last: true,
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                data: vec![0x55; 384],
            }],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(Data, 384 bytes)]",
        );
    }

    #[test]
    fn reject_source_codes_are_symmetric() {
        for source in 1..=3 {
            for reason in 0..=10 {
                if let Some(rj) = AssociationRJSource::from_codes(source, reason) {
                    assert_eq!(rj.codes(), (source, reason));
                }
            }
        }
        assert_eq!(AssociationRJSource::from_codes(2, 3), None);
        assert_eq!(AssociationRJSource::from_codes(4, 1), None);
    }

    #[test]
    fn control_header_bits() {
        let mut pdv = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![],
        };
        assert_eq!(pdv.control_header(), 0x03);
        pdv.value_type = PDataValueType::Data;
        assert_eq!(pdv.control_header(), 0x02);
        pdv.is_last = false;
        assert_eq!(pdv.control_header(), 0x00);
    }

    #[test]
    fn valid_presentation_context_ids() {
        assert!(is_valid_presentation_context_id(1));
        assert!(is_valid_presentation_context_id(255));
        assert!(!is_valid_presentation_context_id(0));
        assert!(!is_valid_presentation_context_id(128));
    }
}
