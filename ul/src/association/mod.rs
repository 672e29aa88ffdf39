//! DICOM association module
//!
//! This module contains the machinery for establishing,
//! driving and terminating associations between DICOM nodes.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! The minimum required properties are the proposed abstract syntaxes
//! and the address of the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! an accepted transport stream can be passed to
//! a previously prepared [`ServerAssociationOptions`][2],
//! together with an [`AssociationHandler`][3] receiving the association events.
//! The [`listener`](crate::listener) module builds on this
//! to serve many associations at once.
//!
//! Both sides share the same [state machine](machine::StateMachine),
//! which owns the transport and tracks the association state.
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: crate::association::server::ServerAssociationOptions
//! [3]: crate::association::handler::AssociationHandler
pub mod client;
pub mod handler;
pub mod machine;
pub mod negotiation;
pub mod server;

use std::net::SocketAddr;
use std::time::Duration;

use snafu::{Backtrace, Snafu};

use crate::codec::CodecSelection;
use crate::pdu::{
    AbortRQSource, AssociationRJ, Pdu, UserIdentity, UserVariableItem, MAXIMUM_PDU_SIZE,
};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use handler::{AssociationDecision, AssociationHandler, Outbox};
pub use machine::{AssociationState, StateMachine, TransmissionStatistics};
pub use negotiation::{
    negotiate, PresentationContextNegotiated, SupportedSyntaxes, TransferSyntaxPriority,
};
pub use server::{
    AcceptAny, AcceptCalledAeTitle, AccessControl, ServerAssociation, ServerAssociationOptions,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Invalid AE address `{}`", address))]
    InvalidAddress {
        address: String,
        backtrace: Backtrace,
    },

    /// could not connect to the remote node
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to decode incoming PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to send PDU on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read PDU from the wire
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// connection closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display(
        "Connection closed by the peer in the middle of a PDU ({} bytes pending)",
        pending
    ))]
    TruncatedPdu { pending: usize, backtrace: Backtrace },

    #[snafu(display("Unexpected PDU `{}` in state {:?}", pdu.short_description(), state))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("Protocol version {:#06x} is not supported", got))]
    ProtocolVersionMismatch { got: u16, backtrace: Backtrace },

    #[snafu(display("Unsupported application context name `{}`", name))]
    UnsupportedApplicationContext { name: String, backtrace: Backtrace },

    #[snafu(display("Invalid presentation context ID {}", id))]
    InvalidPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "Transfer syntax `{}` was not proposed for presentation context {}",
        transfer_syntax,
        id
    ))]
    UnproposedTransferSyntax {
        id: u8,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation context ID {} was used more than once", id))]
    DuplicatePresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("Association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity (maximum {})",
        length,
        max
    ))]
    SendTooLongPdu {
        length: usize,
        max: u32,
        backtrace: Backtrace,
    },

    /// invalid DIMSE message
    Dimse {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    #[snafu(display("{} timeout expired after {:?}", stage, duration))]
    Timeout {
        stage: TimeoutStage,
        duration: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("Association aborted by {}", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    /// the association is already closed
    Closed { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The broad category of an association error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// malformed or unexpected PDU, or invalid presentation context
    Protocol,
    /// association negotiation failure
    Negotiation,
    /// a timer expired
    Timeout,
    /// I/O failure on the transport
    Transport,
    /// abort signal from the peer or the local side
    Aborted,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAbstractSyntax { .. }
            | Error::Rejected { .. }
            | Error::NoAcceptedPresentationContexts { .. } => ErrorKind::Negotiation,
            Error::InvalidAddress { .. }
            | Error::Connect { .. }
            | Error::WireSend { .. }
            | Error::WireRead { .. }
            | Error::ConnectionClosed { .. }
            | Error::Closed { .. } => ErrorKind::Transport,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::SendPdu { .. }
            | Error::ReceivePdu { .. }
            | Error::TruncatedPdu { .. }
            | Error::UnexpectedPdu { .. }
            | Error::ProtocolVersionMismatch { .. }
            | Error::UnsupportedApplicationContext { .. }
            | Error::InvalidPresentationContextId { .. }
            | Error::DuplicatePresentationContextId { .. }
            | Error::UnproposedTransferSyntax { .. }
            | Error::SendTooLongPdu { .. }
            | Error::Dimse { .. } => ErrorKind::Protocol,
        }
    }
}

/// The stage of an association guarded by a timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimeoutStage {
    Connect,
    Accept,
    Release,
    Dimse,
}

impl std::fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutStage::Connect => "Connect",
            TimeoutStage::Accept => "Accept",
            TimeoutStage::Release => "Release",
            TimeoutStage::Dimse => "DIMSE",
        })
    }
}

/// Timers applied to an association.
///
/// A value of `None` disables the respective timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// time to establish the transport connection
    pub connect: Option<Duration>,
    /// time to wait for the association request (acceptor)
    /// or its response (requestor)
    pub accept: Option<Duration>,
    /// time to wait for the release response
    pub release: Option<Duration>,
    /// idle time allowed between incoming DIMSE messages
    pub dimse: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Some(Duration::from_secs(30)),
            accept: Some(Duration::from_secs(30)),
            release: Some(Duration::from_secs(30)),
            dimse: Some(Duration::from_secs(60)),
        }
    }
}

/// Run a future under an optional timer.
pub(crate) async fn with_timeout<F, T>(
    duration: Option<Duration>,
    stage: TimeoutStage,
    future: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(out) => out,
            Err(_) => TimeoutSnafu { stage, duration }.fail(),
        },
        None => future.await,
    }
}

/// Interpret a maximum length announced by a peer,
/// where 0 stands for no limit.
pub(crate) fn effective_max_pdu_length(announced: u32) -> u32 {
    if announced == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        announced
    }
}

/// The negotiated state of an association.
///
/// It is filled in while negotiating,
/// and stays the same for the rest of the association.
#[derive(Debug, Clone)]
pub struct AssociationParameters {
    pub(crate) calling_ae_title: String,
    pub(crate) called_ae_title: String,
    pub(crate) peer_address: Option<SocketAddr>,
    pub(crate) application_context_name: String,
    pub(crate) requestor_max_pdu_length: u32,
    pub(crate) acceptor_max_pdu_length: u32,
    pub(crate) presentation_contexts: Vec<PresentationContextNegotiated>,
    pub(crate) requestor_user_variables: Vec<UserVariableItem>,
    pub(crate) acceptor_user_variables: Vec<UserVariableItem>,
    pub(crate) codecs: CodecSelection,
}

impl AssociationParameters {
    /// The AE title of the association requestor.
    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    /// The AE title of the association acceptor.
    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// The network address of the other node, if known.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    pub fn application_context_name(&self) -> &str {
        &self.application_context_name
    }

    /// The maximum PDU length the requestor is willing to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The maximum PDU length the acceptor is willing to receive.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// All presentation contexts, in proposal order,
    /// with their negotiation outcome.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    pub fn accepted_presentation_contexts(
        &self,
    ) -> impl Iterator<Item = &PresentationContextNegotiated> {
        self.presentation_contexts.iter().filter(|pc| pc.is_accepted())
    }

    /// Obtain the presentation context with the given ID.
    pub fn presentation_context(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts.iter().find(|pc| pc.id == id)
    }

    /// Find the first accepted presentation context
    /// for the given abstract syntax.
    pub fn accepted_context_for(
        &self,
        abstract_syntax: &str,
    ) -> Option<&PresentationContextNegotiated> {
        self.accepted_presentation_contexts()
            .find(|pc| pc.abstract_syntax == crate::uids::trim_uid(abstract_syntax))
    }

    /// The user information items sent by the requestor.
    pub fn requestor_user_variables(&self) -> &[UserVariableItem] {
        &self.requestor_user_variables
    }

    /// The user information items sent by the acceptor.
    pub fn acceptor_user_variables(&self) -> &[UserVariableItem] {
        &self.acceptor_user_variables
    }

    /// The user identity proposed by the requestor, if any.
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.requestor_user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::UserIdentityItem(identity) => Some(identity),
                _ => None,
            })
    }

    /// The SOP class extended negotiation items proposed by the requestor.
    pub fn sop_class_extended_negotiation(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.requestor_user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info) => {
                    Some((uid.as_str(), info.as_slice()))
                }
                _ => None,
            })
    }

    /// The codec selected for each accepted presentation context.
    pub fn codecs(&self) -> &CodecSelection {
        &self.codecs
    }
}

/// Find the maximum length item among user variables.
pub(crate) fn max_length_of(user_variables: &[UserVariableItem]) -> Option<u32> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    })
}

/// Find the implementation class UID among user variables.
pub(crate) fn implementation_class_uid_of(user_variables: &[UserVariableItem]) -> Option<&str> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::ImplementationClassUID(uid) => Some(uid.as_str()),
        _ => None,
    })
}
