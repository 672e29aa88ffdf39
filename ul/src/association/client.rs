//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::net::SocketAddr;

use snafu::{ensure, OptionExt, ResultExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::codec::CodecRegistry;
use crate::dimse::{fragment, DimseMessage, Reassembler, StatusType};
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRQ, Pdu, PresentationContextProposed,
    PresentationContextResultReason, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::uids::{
    trim_uid, DICOM_APPLICATION_CONTEXT, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use crate::{AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::server::provider_abort_source;
use super::{
    implementation_class_uid_of, max_length_of, with_timeout, AssociationParameters,
    AssociationState, ClosedSnafu, ConnectSnafu, DimseSnafu, Error, ErrorKind,
    InvalidAddressSnafu, InvalidPresentationContextIdSnafu, MissingAbstractSyntaxSnafu,
    NoAcceptedPresentationContextsSnafu, PresentationContextNegotiated,
    ProtocolVersionMismatchSnafu, RejectedSnafu, Result, StateMachine, TimeoutStage, Timeouts,
    TransmissionStatistics, UnexpectedPduSnafu, UnproposedTransferSyntaxSnafu,
};

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_ulp::association::ClientAssociationOptions;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish("129.168.0.5:104")
///    .await?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// in the resulting presentation context.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the protocol version to announce
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    timeouts: Timeouts,
    /// user identity to propose
    user_identity: Option<UserIdentity>,
    /// SOP class extended negotiation sub-items
    extended_negotiation: Vec<(Cow<'a, str>, Vec<u8>)>,
    codecs: CodecRegistry,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            timeouts: Timeouts::default(),
            user_identity: None,
            extended_negotiation: Vec::new(),
            codecs: CodecRegistry::default(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one passed via [`establish_with`](ClientAssociationOptions::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_cow(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_cow(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> = vec![
            EXPLICIT_VR_LITTLE_ENDIAN.into(),
            IMPLICIT_VR_LITTLE_ENDIAN.into(),
        ];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override the association timers.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Propose a user identity to the acceptor.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Propose a plain username as the user identity.
    pub fn username<T>(self, username: T) -> Self
    where
        T: Into<String>,
    {
        self.user_identity(UserIdentity::username(username))
    }

    /// Include a SOP class extended negotiation sub-item,
    /// carrying service class specific application information.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, application_info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiation
            .push((trim_cow(sop_class_uid.into()), application_info));
        self
    }

    /// Set the codec registry used to select
    /// a codec for each accepted presentation context.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Whether a presentation context for this abstract syntax
    /// is already proposed.
    pub fn proposes(&self, abstract_syntax_uid: &str) -> bool {
        let abstract_syntax_uid = trim_uid(abstract_syntax_uid);
        self.presentation_contexts
            .iter()
            .any(|(uid, _)| uid == abstract_syntax_uid)
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub async fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation<TcpStream>> {
        let connect = async { TcpStream::connect(address).await.context(ConnectSnafu) };
        let stream = with_timeout(self.timeouts.connect, TimeoutStage::Connect, connect).await?;
        let peer_address = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle's algorithm: {}", e);
        }
        self.establish_over(stream, peer_address).await
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// This method allows you to specify the called AE title
    /// alongside with the socket address.
    /// See [AeAddr](`crate::AeAddr`) for more details.
    /// However, the AE title in this parameter
    /// is overridden by any `called_ae_title` option
    /// previously received.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use dicom_ulp::association::ClientAssociationOptions;
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let association = ClientAssociationOptions::new()
    ///     .with_abstract_syntax("1.2.840.10008.1.1")
    ///     // called AE title in address
    ///     .establish_with("MY-STORAGE@10.0.0.100:104")
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn establish_with(mut self, ae_address: &str) -> Result<ClientAssociation<TcpStream>> {
        let ae_address: AeAddr<String> = ae_address.parse().ok().context(InvalidAddressSnafu {
            address: ae_address,
        })?;
        let (ae_title, socket_addr) = ae_address.into_parts();
        match (&self.called_ae_title, ae_title) {
            (Some(aec), Some(_)) => {
                warn!("Option `called_ae_title` overrides the AE title to `{}`", aec);
            }
            (None, Some(aec)) => self.called_ae_title = Some(aec.into()),
            _ => {}
        }
        self.establish(socket_addr.as_str()).await
    }

    /// Request a new DICOM association
    /// over an already open transport stream.
    pub async fn establish_over<S>(
        self,
        stream: S,
        peer_address: Option<SocketAddr>,
    ) -> Result<ClientAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            protocol_version,
            max_pdu_length,
            strict,
            timeouts,
            user_identity,
            extended_negotiation,
            codecs,
        } = self;

        // fail if no presentation contexts were provided: they represent intent,
        // should not be omitted by the user
        ensure!(
            !presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        // only odd identifiers from 1 to 255
        ensure!(
            presentation_contexts.len() <= 128,
            InvalidPresentationContextIdSnafu { id: u8::MAX }
        );

        let called_ae_title = called_ae_title.as_deref().unwrap_or("ANY-SCP");

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(extended_negotiation.into_iter().map(|(uid, info)| {
            UserVariableItem::SopClassExtendedNegotiationSubItem(uid.to_string(), info)
        }));
        user_variables.extend(user_identity.map(UserVariableItem::UserIdentityItem));

        let rq = AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: user_variables.clone(),
        };

        let mut machine =
            StateMachine::new(stream, AssociationState::TransportConnecting, max_pdu_length, strict);
        machine.send_pdu(&Pdu::AssociationRQ(rq)).await?;
        machine.transition(AssociationState::AssociationRequesting);

        let response =
            with_timeout(timeouts.accept, TimeoutStage::Accept, machine.receive_pdu()).await;
        let ac = match response {
            Ok(Pdu::AssociationAC(ac)) => ac,
            Ok(Pdu::AssociationRJ(association_rj)) => {
                info!("Association rejected: {}", association_rj.source);
                machine.close().await;
                return RejectedSnafu { association_rj }.fail();
            }
            Ok(pdu) => {
                let e = UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state: machine.state(),
                }
                .build();
                machine.abort(provider_abort_source(&e)).await;
                return Err(e);
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Protocol => machine.abort(provider_abort_source(&e)).await,
                    _ => machine.close().await,
                }
                return Err(e);
            }
        };

        let AssociationAC {
            protocol_version: protocol_version_scp,
            presentation_contexts: results,
            user_variables: acceptor_user_variables,
            ..
        } = ac;

        if protocol_version_scp & 0x0001 == 0 {
            machine.abort(AbortRQSource::ServiceUser).await;
            return ProtocolVersionMismatchSnafu {
                got: protocol_version_scp,
            }
            .fail();
        }

        let negotiated: Vec<_> = presentation_contexts
            .iter()
            .map(|proposed| {
                let result = results.iter().find(|result| result.id == proposed.id);
                match result {
                    Some(result) if result.reason == PresentationContextResultReason::Acceptance => {
                        PresentationContextNegotiated {
                            id: proposed.id,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            transfer_syntax: result
                                .transfer_syntax
                                .as_deref()
                                .map(|ts| trim_uid(ts).to_string()),
                            reason: result.reason,
                        }
                    }
                    Some(result) => PresentationContextNegotiated {
                        id: proposed.id,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: None,
                        reason: result.reason,
                    },
                    None => PresentationContextNegotiated {
                        id: proposed.id,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: None,
                        reason: PresentationContextResultReason::NoReason,
                    },
                }
            })
            .collect();

        // the acceptor may only pick one of the transfer syntaxes proposed for a context
        let unproposed = negotiated.iter().find_map(|pc| {
            let transfer_syntax = pc.transfer_syntax.as_deref()?;
            let proposed = presentation_contexts.iter().find(|p| p.id == pc.id)?;
            if proposed
                .transfer_syntaxes
                .iter()
                .any(|ts| trim_uid(ts) == transfer_syntax)
            {
                None
            } else {
                Some((pc.id, transfer_syntax.to_string()))
            }
        });
        if let Some((id, transfer_syntax)) = unproposed {
            let e = UnproposedTransferSyntaxSnafu {
                id,
                transfer_syntax,
            }
            .build();
            machine.abort(provider_abort_source(&e)).await;
            return Err(e);
        }

        if !negotiated.iter().any(|pc| pc.is_accepted()) {
            machine.abort(AbortRQSource::ServiceUser).await;
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        let acceptor_max_pdu_length =
            max_length_of(&acceptor_user_variables).unwrap_or(DEFAULT_MAX_PDU);
        machine.set_peer_max_pdu_length(acceptor_max_pdu_length);
        machine.transition(AssociationState::Established);

        let codecs = codecs.select(negotiated.iter().filter_map(|pc| {
            pc.transfer_syntax
                .as_deref()
                .map(|transfer_syntax| (pc.id, transfer_syntax))
        }));
        let reassembler = Reassembler::new(
            negotiated
                .iter()
                .filter(|pc| pc.is_accepted())
                .map(|pc| pc.id),
        );

        let parameters = AssociationParameters {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            peer_address,
            application_context_name: application_context_name.to_string(),
            requestor_max_pdu_length: max_pdu_length,
            acceptor_max_pdu_length,
            presentation_contexts: negotiated,
            requestor_user_variables: user_variables,
            acceptor_user_variables,
            codecs,
        };
        info!(
            "Association established with {} ({}), {} of {} presentation contexts accepted",
            parameters.called_ae_title,
            implementation_class_uid_of(&parameters.acceptor_user_variables)
                .unwrap_or("unknown implementation"),
            parameters.accepted_presentation_contexts().count(),
            parameters.presentation_contexts.len()
        );

        Ok(ClientAssociation {
            machine,
            parameters,
            timeouts,
            reassembler,
            next_message_id: 1,
        })
    }
}

fn trim_cow(uid: Cow<'_, str>) -> Cow<'_, str> {
    match uid {
        Cow::Borrowed(s) => Cow::Borrowed(trim_uid(s)),
        Cow::Owned(s) => Cow::Owned(trim_uid(&s).to_string()),
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send_message`](Self::send_message),
/// [`receive_message`](Self::receive_message)
/// and [`request`](Self::request), which combines both.
///
/// The association should be terminated with
/// [`release`](Self::release) or [`abort`](Self::abort).
/// Dropping it closes the transport without notifying the peer.
#[derive(Debug)]
pub struct ClientAssociation<S> {
    machine: StateMachine<S>,
    parameters: AssociationParameters,
    timeouts: Timeouts,
    reassembler: Reassembler,
    next_message_id: u16,
}

impl<S> ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The negotiated parameters of this association.
    pub fn parameters(&self) -> &AssociationParameters {
        &self.parameters
    }

    pub fn state(&self) -> AssociationState {
        self.machine.state()
    }

    pub fn statistics(&self) -> &TransmissionStatistics {
        self.machine.statistics()
    }

    /// Reserve a fresh message ID for a new request.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Send a DIMSE message on an accepted presentation context,
    /// split into as many P-DATA-TF PDUs as the acceptor requires.
    pub async fn send_message(&mut self, message: &DimseMessage) -> Result<()> {
        let id = message.presentation_context_id;
        ensure!(
            self.parameters
                .presentation_context(id)
                .map_or(false, |pc| pc.is_accepted()),
            InvalidPresentationContextIdSnafu { id }
        );
        debug!("Sending {} on presentation context {}", message.command, id);
        let pdus = fragment(message, self.machine.peer_max_pdu_length()).context(DimseSnafu)?;
        for pdu in &pdus {
            self.machine.send_pdu(pdu).await?;
        }
        Ok(())
    }

    /// Wait for the next complete DIMSE message.
    ///
    /// The association is aborted
    /// if no message arrives within the DIMSE timeout
    /// or if the peer breaks the protocol.
    pub async fn receive_message(&mut self) -> Result<DimseMessage> {
        loop {
            let received = with_timeout(
                self.timeouts.dimse,
                TimeoutStage::Dimse,
                self.machine.receive_pdu(),
            )
            .await;
            let pdu = match received {
                Ok(pdu) => pdu,
                Err(e) => return self.fail(e).await,
            };

            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        match self.reassembler.push(value).context(DimseSnafu) {
                            Ok(Some(message)) => {
                                debug!(
                                    "Received {} on presentation context {}",
                                    message.command, message.presentation_context_id
                                );
                                return Ok(message);
                            }
                            Ok(None) => {}
                            Err(e) => return self.fail(e).await,
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    info!("Release requested by {}", self.parameters.called_ae_title);
                    self.machine.respond_release().await?;
                    return ClosedSnafu.fail();
                }
                pdu => {
                    let e = UnexpectedPduSnafu {
                        pdu: Box::new(pdu),
                        state: self.machine.state(),
                    }
                    .build();
                    return self.fail(e).await;
                }
            }
        }
    }

    /// Send a request and wait for its final response,
    /// skipping pending responses.
    pub async fn request(&mut self, message: &DimseMessage) -> Result<DimseMessage> {
        self.send_message(message).await?;
        let message_id = message.command.message_id;
        loop {
            let response = self.receive_message().await?;
            if response.command.message_id_being_responded_to != message_id {
                warn!(
                    "Ignoring {} not responding to message {:?}",
                    response.command, message_id
                );
                continue;
            }
            if response.command.status_type() == Some(StatusType::Pending) {
                debug!("Pending response to message {:?}", message_id);
                continue;
            }
            return Ok(response);
        }
    }

    /// Gracefully terminate the association by exchanging release messages
    /// and then shutting down the transport.
    pub async fn release(mut self) -> Result<()> {
        self.machine.release(self.timeouts.release).await
    }

    /// Send an abort message and shut down the transport.
    pub async fn abort(mut self) {
        self.machine.abort(AbortRQSource::ServiceUser).await
    }

    async fn fail<T>(&mut self, error: Error) -> Result<T> {
        match error.kind() {
            ErrorKind::Aborted => {}
            ErrorKind::Protocol | ErrorKind::Timeout => {
                self.machine.abort(provider_abort_source(&error)).await
            }
            ErrorKind::Transport | ErrorKind::Negotiation => self.machine.close().await,
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{
        read_pdu, write_pdu, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
        AssociationRJSource, PresentationContextResult, MAXIMUM_PDU_SIZE,
    };
    use crate::uids::VERIFICATION;
    use matches::assert_matches;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_one(peer: &mut DuplexStream) -> Pdu {
        let mut buf = Vec::new();
        loop {
            let mut cursor = &buf[..];
            if let Some(pdu) = read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, false).unwrap() {
                return pdu;
            }
            let mut chunk = [0_u8; 1024];
            let n = peer.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_one(peer: &mut DuplexStream, pdu: &Pdu) {
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, pdu).unwrap();
        peer.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn proposes_odd_context_ids() {
        let (ours, mut peer) = tokio::io::duplex(1 << 16);
        let options = ClientAssociationOptions::new()
            .calling_ae_title("ECHO-SCU")
            .called_ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION)
            .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.7")
            .username("jdoe");

        let acceptor = async move {
            let Pdu::AssociationRQ(rq) = read_one(&mut peer).await else {
                panic!("expected association request");
            };
            assert_eq!(rq.calling_ae_title, "ECHO-SCU");
            assert_eq!(rq.called_ae_title, "ECHO-SCP");
            let ids: Vec<_> = rq.presentation_contexts.iter().map(|pc| pc.id).collect();
            assert_eq!(ids, vec![1, 3]);
            assert!(rq
                .user_variables
                .iter()
                .any(|item| matches!(item, UserVariableItem::UserIdentityItem(_))));

            let ac = AssociationAC {
                protocol_version: 1,
                calling_ae_title: rq.calling_ae_title,
                called_ae_title: rq.called_ae_title,
                application_context_name: rq.application_context_name,
                presentation_contexts: vec![
                    PresentationContextResult {
                        id: 1,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: Some(IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
                    },
                    PresentationContextResult {
                        id: 3,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        transfer_syntax: None,
                    },
                ],
                user_variables: vec![UserVariableItem::MaxLength(0)],
            };
            write_one(&mut peer, &Pdu::AssociationAC(ac)).await;
            peer
        };

        let (association, _peer) = tokio::join!(options.establish_over(ours, None), acceptor);
        let association = association.unwrap();
        assert_eq!(association.state(), AssociationState::Established);
        let parameters = association.parameters();
        assert_eq!(parameters.acceptor_max_pdu_length(), 0);
        assert_eq!(
            parameters
                .accepted_context_for(VERIFICATION)
                .and_then(|pc| pc.transfer_syntax.as_deref()),
            Some(IMPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(
            parameters.presentation_context(3).map(|pc| pc.reason),
            Some(PresentationContextResultReason::AbstractSyntaxNotSupported)
        );
        assert_eq!(parameters.user_identity().map(|u| u.primary_field()), Some(&b"jdoe"[..]));
    }

    #[tokio::test]
    async fn rejection_is_reported() {
        let (ours, mut peer) = tokio::io::duplex(1 << 16);
        let options = ClientAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let rj = AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        };
        let expected = rj.clone();
        let acceptor = async move {
            read_one(&mut peer).await;
            write_one(&mut peer, &Pdu::AssociationRJ(rj)).await;
            peer
        };
        let (out, _peer) = tokio::join!(options.establish_over(ours, None), acceptor);
        assert_matches!(out, Err(Error::Rejected { association_rj, .. }) if association_rj == expected);
    }

    #[tokio::test]
    async fn transfer_syntax_not_proposed_aborts() {
        let (ours, mut peer) = tokio::io::duplex(1 << 16);
        let options = ClientAssociationOptions::new()
            .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LITTLE_ENDIAN]);
        let acceptor = async move {
            let Pdu::AssociationRQ(rq) = read_one(&mut peer).await else {
                panic!("expected association request");
            };
            let ac = AssociationAC {
                protocol_version: 1,
                calling_ae_title: rq.calling_ae_title,
                called_ae_title: rq.called_ae_title,
                application_context_name: rq.application_context_name,
                presentation_contexts: vec![PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    // JPEG Baseline, never offered
                    transfer_syntax: Some("1.2.840.10008.1.2.4.50".to_string()),
                }],
                user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
            };
            write_one(&mut peer, &Pdu::AssociationAC(ac)).await;
            read_one(&mut peer).await
        };

        let (out, reply) = tokio::join!(options.establish_over(ours, None), acceptor);
        let Err(e) = out else {
            panic!("association should not be established");
        };
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_matches!(
            e,
            Error::UnproposedTransferSyntax { id: 1, ref transfer_syntax, .. }
                if transfer_syntax == "1.2.840.10008.1.2.4.50"
        );
        assert_matches!(
            reply,
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(_)
            }
        );
    }

    #[tokio::test]
    async fn no_response_times_out() {
        let (ours, _peer) = tokio::io::duplex(1 << 16);
        let options = ClientAssociationOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .timeouts(Timeouts {
                accept: Some(Duration::from_millis(50)),
                ..Timeouts::default()
            });
        let out = options.establish_over(ours, None).await;
        assert_matches!(
            out,
            Err(Error::Timeout {
                stage: TimeoutStage::Accept,
                ..
            })
        );
    }

    #[tokio::test]
    async fn nothing_proposed() {
        let (ours, _peer) = tokio::io::duplex(1024);
        let out = ClientAssociationOptions::new()
            .establish_over(ours, None)
            .await;
        assert_matches!(out, Err(Error::MissingAbstractSyntax { .. }));
    }

    #[tokio::test]
    async fn bad_address() {
        let out = ClientAssociationOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .establish_with("SCP@")
            .await;
        assert!(out.is_err());
    }
}
