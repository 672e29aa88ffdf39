//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::SocketAddr;

use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::codec::CodecRegistry;
use crate::dimse::{fragment, DimseMessage, Reassembler};
use crate::pdu::{
    is_valid_presentation_context_id, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextResult, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::uids::{trim_uid, DICOM_APPLICATION_CONTEXT, NATIVE_TRANSFER_SYNTAXES};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::handler::OutboxItem;
use super::{
    implementation_class_uid_of, max_length_of, negotiate, with_timeout, AbortedSnafu,
    AssociationDecision, AssociationHandler, AssociationParameters, AssociationState, DimseSnafu,
    DuplicatePresentationContextIdSnafu, Error, ErrorKind, InvalidPresentationContextIdSnafu,
    MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu, Outbox,
    ProtocolVersionMismatchSnafu, RejectedSnafu, Result, StateMachine, SupportedSyntaxes,
    TimeoutStage, Timeouts, TransferSyntaxPriority, TransmissionStatistics,
    UnexpectedPduSnafu, UnsupportedApplicationContextSnafu,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;

    /// Decide whether the requesting node may use the given abstract syntax.
    ///
    /// Presentation contexts refused here
    /// are rejected with the `UserRejection` reason.
    /// The default implementation allows any supported abstract syntax.
    fn check_abstract_syntax(&self, _calling_ae_title: &str, _abstract_syntax: &str) -> bool {
        true
    }
}

impl<T> AccessControl for Box<T>
where
    T: AccessControl + ?Sized,
{
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        (**self).check_access(this_ae_title, calling_ae_title, called_ae_title, user_identity)
    }

    fn check_abstract_syntax(&self, calling_ae_title: &str, abstract_syntax: &str) -> bool {
        (**self).check_abstract_syntax(calling_ae_title, abstract_syntax)
    }
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is a [`ServerAssociation`].
/// Unlike the [`ClientAssociationOptions`],
/// a value of this type can be reused for multiple connections.
///
/// [`ClientAssociationOptions`]: crate::association::ClientAssociationOptions
///
/// Abstract syntaxes registered through [`with_abstract_syntax`][1]
/// are accepted with the transfer syntaxes given through
/// [`with_transfer_syntax`][2].
/// When no transfer syntax is given,
/// the native transfer syntaxes are supported,
/// plus every transfer syntax with a codec in the [codec registry][3].
/// An abstract syntax may also be given its own list of transfer syntaxes
/// through [`with_supported_syntax`][4].
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`]
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// [`accept_called_ae_title`]: Self::accept_called_ae_title
/// [1]: ServerAssociationOptions::with_abstract_syntax
/// [2]: ServerAssociationOptions::with_transfer_syntax
/// [3]: ServerAssociationOptions::codecs
/// [4]: ServerAssociationOptions::with_supported_syntax
///
/// ## Basic Usage
///
/// Spawn a task for each incoming association request.
///
/// ```no_run
/// # use std::net::{Ipv4Addr, SocketAddrV4};
/// # use dicom_ulp::association::ServerAssociationOptions;
/// # use dicom_ulp::verification::VerificationHandler;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listen_addr = SocketAddrV4::new(Ipv4Addr::from(0), 11111);
/// let listener = tokio::net::TcpListener::bind(listen_addr).await?;
/// let options = std::sync::Arc::new(
///     ServerAssociationOptions::new()
///         .accept_any()
///         .with_abstract_syntax("1.2.840.10008.1.1")
///         .with_transfer_syntax("1.2.840.10008.1.2.1"),
/// );
/// loop {
///     let (socket, addr) = listener.accept().await?;
///     let options = options.clone();
///     tokio::task::spawn(async move {
///         let mut handler = VerificationHandler::default();
///         if let Ok(association) = options.establish(socket, Some(addr), &mut handler).await {
///             let _ = association.run(&mut handler).await;
///         }
///     });
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// abstract syntaxes with their own transfer syntaxes
    supported: SupportedSyntaxes,
    /// whose order of transfer syntaxes prevails
    priority: TransferSyntaxPriority,
    /// the protocol version announced in the response
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    timeouts: Timeouts,
    codecs: CodecRegistry,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            supported: SupportedSyntaxes::new(),
            priority: TransferSyntaxPriority::default(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            timeouts: Timeouts::default(),
            codecs: CodecRegistry::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            supported,
            priority,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timeouts,
            codecs,
            ae_access_control: _,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            supported,
            priority,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timeouts,
            codecs,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// The application entity title of this node.
    pub fn get_ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Include this abstract syntax
    /// in the list of supported abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_cow(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// for each abstract syntax without a list of its own.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_cow(transfer_syntax_uid.into()));
        self
    }

    /// Support an abstract syntax with its own transfer syntaxes,
    /// in this node's order of preference.
    pub fn with_supported_syntax<I, T>(mut self, abstract_syntax_uid: &str, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.supported.add(abstract_syntax_uid, transfer_syntaxes);
        self
    }

    /// Define whose order of preference decides the transfer syntax
    /// when more than one proposed transfer syntax is supported.
    ///
    /// The default is the requestor's order.
    pub fn transfer_syntax_priority(mut self, priority: TransferSyntaxPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Retrieve the maximum PDU length
    /// that this application entity admits.
    pub fn get_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Override the maximum expected PDU length.
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Override the association timers.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn get_timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Set the codec registry,
    /// used to extend the default transfer syntaxes
    /// and to select a codec for each accepted presentation context.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// The table of supported syntaxes
    /// that incoming proposals are negotiated against.
    pub fn supported_syntaxes(&self) -> SupportedSyntaxes {
        let default_ts: Vec<&str> = if self.transfer_syntax_uids.is_empty() {
            NATIVE_TRANSFER_SYNTAXES
                .iter()
                .copied()
                .chain(self.codecs.supported_transfer_syntaxes())
                .collect()
        } else {
            self.transfer_syntax_uids.iter().map(|ts| ts.as_ref()).collect()
        };

        let mut supported = self.supported.clone();
        for abstract_syntax in &self.abstract_syntax_uids {
            supported.add(abstract_syntax, &default_ts);
        }
        if self.promiscuous {
            supported = supported.promiscuous(&default_ts);
        }
        supported
    }

    /// Process an association request PDU
    ///
    /// In the success case, returns
    /// * the A-ASSOCIATE-AC to be written back to the requestor
    /// * the negotiated association parameters
    ///
    /// In the error case, returns
    /// * the A-ASSOCIATE-RJ or A-ABORT to be written back
    /// * the error
    #[allow(clippy::result_large_err)]
    pub(crate) fn process_association_rq(
        &self,
        rq: AssociationRQ,
        peer_address: Option<SocketAddr>,
    ) -> std::result::Result<(AssociationAC, AssociationParameters), (Pdu, Error)> {
        let AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } = rq;

        let mut ids = BTreeSet::new();
        for pc in &presentation_contexts {
            let id = pc.id;
            let abort = Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ),
            };
            if !is_valid_presentation_context_id(id) {
                return Err((abort, InvalidPresentationContextIdSnafu { id }.build()));
            }
            if !ids.insert(id) {
                return Err((abort, DuplicatePresentationContextIdSnafu { id }.build()));
            }
        }

        // only bit 0 (version 1) is defined
        if protocol_version & 0x0001 == 0 {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                ),
            };
            return Err((
                association_rj.into(),
                ProtocolVersionMismatchSnafu {
                    got: protocol_version,
                }
                .build(),
            ));
        }

        if trim_uid(&application_context_name) != trim_uid(&self.application_context_name) {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            };
            return Err((
                association_rj.into(),
                UnsupportedApplicationContextSnafu {
                    name: application_context_name,
                }
                .build(),
            ));
        }

        let user_identity = user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        });
        if let Err(reason) = self.ae_access_control.check_access(
            &self.ae_title,
            &calling_ae_title,
            &called_ae_title,
            user_identity,
        ) {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            };
            return Err((
                association_rj.clone().into(),
                RejectedSnafu { association_rj }.build(),
            ));
        }

        let supported = self.supported_syntaxes();
        let negotiated = negotiate(&presentation_contexts, &supported, self.priority, |abstract_syntax| {
            self.ae_access_control
                .check_abstract_syntax(&calling_ae_title, abstract_syntax)
        });

        if !negotiated.iter().any(|pc| pc.is_accepted()) {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                ),
            };
            return Err((
                association_rj.into(),
                NoAcceptedPresentationContextsSnafu.build(),
            ));
        }

        let requestor_max_pdu_length = max_length_of(&user_variables).unwrap_or(DEFAULT_MAX_PDU);
        let acceptor_user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];

        let codecs = self.codecs.select(negotiated.iter().filter_map(|pc| {
            pc.transfer_syntax
                .as_deref()
                .map(|transfer_syntax| (pc.id, transfer_syntax))
        }));

        let ac = AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title: called_ae_title.clone(),
            application_context_name: application_context_name.clone(),
            presentation_contexts: negotiated.iter().map(PresentationContextResult::from).collect(),
            user_variables: acceptor_user_variables.clone(),
        };

        let parameters = AssociationParameters {
            calling_ae_title,
            called_ae_title,
            peer_address,
            application_context_name,
            requestor_max_pdu_length,
            acceptor_max_pdu_length: self.max_pdu_length,
            presentation_contexts: negotiated,
            requestor_user_variables: user_variables,
            acceptor_user_variables,
            codecs,
        };

        Ok((ac, parameters))
    }

    /// Negotiate an association over the given transport stream,
    /// which the peer at `peer_address` has just opened.
    ///
    /// The handler is asked to accept the association
    /// once negotiation succeeds,
    /// and learns about failures through its callbacks,
    /// except for requests rejected on negotiation grounds.
    pub async fn establish<S, H>(
        &self,
        socket: S,
        peer_address: Option<SocketAddr>,
        handler: &mut H,
    ) -> Result<ServerAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        H: AssociationHandler + ?Sized,
    {
        ensure!(
            !self.abstract_syntax_uids.is_empty()
                || !self.supported.is_empty()
                || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        let mut machine = StateMachine::new(
            socket,
            AssociationState::TransportConnecting,
            self.max_pdu_length,
            self.strict,
        );
        let rq = match receive_association_rq(&mut machine, self.timeouts.accept).await {
            Ok(rq) => rq,
            Err(e) => {
                notify_failure(handler, &e);
                return Err(e);
            }
        };
        self.accept_request(machine, rq, peer_address, handler).await
    }

    /// Answer an association request already read from the transport.
    pub(crate) async fn accept_request<S, H>(
        &self,
        mut machine: StateMachine<S>,
        rq: AssociationRQ,
        peer_address: Option<SocketAddr>,
        handler: &mut H,
    ) -> Result<ServerAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        H: AssociationHandler + ?Sized,
    {
        debug!(
            "Association requested by {} ({}) for {} with {} presentation contexts",
            rq.calling_ae_title,
            implementation_class_uid_of(&rq.user_variables).unwrap_or("unknown implementation"),
            rq.called_ae_title,
            rq.presentation_contexts.len()
        );

        let (ac, parameters) = match self.process_association_rq(rq, peer_address) {
            Ok(out) => out,
            Err((pdu, e)) => {
                match pdu {
                    Pdu::AbortRQ { source } => {
                        machine.abort(source).await;
                        notify_failure(handler, &e);
                    }
                    pdu => {
                        info!("Rejecting association: {}", e);
                        if let Err(send_error) = machine.send_pdu(&pdu).await {
                            warn!("Could not send rejection: {}", send_error);
                        }
                        machine.close().await;
                    }
                }
                return Err(e);
            }
        };

        if let AssociationDecision::Reject(association_rj) =
            handler.on_association_requested(&parameters)
        {
            info!("Association rejected by handler: {}", association_rj.source);
            if let Err(e) = machine.send_pdu(&association_rj.clone().into()).await {
                warn!("Could not send rejection: {}", e);
            }
            machine.close().await;
            return RejectedSnafu { association_rj }.fail();
        }

        machine.set_peer_max_pdu_length(parameters.requestor_max_pdu_length);
        if let Err(e) = machine.send_pdu(&Pdu::AssociationAC(ac)).await {
            machine.close().await;
            notify_failure(handler, &e);
            return Err(e);
        }
        machine.transition(AssociationState::Established);

        info!(
            "Association established with {} ({} of {} presentation contexts accepted)",
            parameters.calling_ae_title,
            parameters.accepted_presentation_contexts().count(),
            parameters.presentation_contexts.len()
        );
        handler.on_association_established(&parameters);

        let reassembler = Reassembler::new(parameters.accepted_presentation_contexts().map(|pc| pc.id));
        Ok(ServerAssociation {
            machine,
            parameters,
            timeouts: self.timeouts,
            reassembler,
        })
    }
}

fn trim_cow(uid: Cow<'_, str>) -> Cow<'_, str> {
    match uid {
        Cow::Borrowed(s) => Cow::Borrowed(trim_uid(s)),
        Cow::Owned(s) => Cow::Owned(trim_uid(&s).to_string()),
    }
}

/// Wait for the association request on a fresh transport.
///
/// Anything else than an A-ASSOCIATE-RQ aborts the association.
/// If no request arrives in time, the transport is closed.
pub(crate) async fn receive_association_rq<S>(
    machine: &mut StateMachine<S>,
    timeout: Option<std::time::Duration>,
) -> Result<AssociationRQ>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match with_timeout(timeout, TimeoutStage::Accept, machine.receive_pdu()).await {
        Ok(Pdu::AssociationRQ(rq)) => {
            machine.transition(AssociationState::AssociationRequested);
            Ok(rq)
        }
        Ok(pdu) => {
            let e = UnexpectedPduSnafu {
                pdu: Box::new(pdu),
                state: machine.state(),
            }
            .build();
            machine.abort(provider_abort_source(&e)).await;
            Err(e)
        }
        Err(e) => {
            match e.kind() {
                ErrorKind::Protocol => machine.abort(provider_abort_source(&e)).await,
                _ => machine.close().await,
            }
            Err(e)
        }
    }
}

/// Turn down an association request already read from the transport.
pub(crate) async fn reject_request<S>(
    machine: &mut StateMachine<S>,
    association_rj: AssociationRJ,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let sent = machine.send_pdu(&association_rj.into()).await;
    machine.close().await;
    sent
}

/// The A-ABORT source to send on a protocol error.
pub(crate) fn provider_abort_source(error: &Error) -> AbortRQSource {
    let reason = match error {
        Error::ReceivePdu {
            source: crate::pdu::reader::Error::UnrecognizedPduType { .. },
            ..
        } => AbortRQServiceProviderReason::UnrecognizedPdu,
        Error::UnexpectedPdu { .. } => AbortRQServiceProviderReason::UnexpectedPdu,
        Error::Timeout { .. } => AbortRQServiceProviderReason::ReasonNotSpecified,
        _ => AbortRQServiceProviderReason::InvalidPduParameter,
    };
    AbortRQSource::ServiceProvider(reason)
}

/// Report an association failure to the handler through
/// the one callback matching its kind.
pub(crate) fn notify_failure<H>(handler: &mut H, error: &Error)
where
    H: AssociationHandler + ?Sized,
{
    match error {
        Error::Aborted { abort_source, .. } => handler.on_abort(abort_source),
        Error::Timeout {
            stage: TimeoutStage::Dimse,
            ..
        } => handler.on_dimse_timeout(),
        e if e.kind() == ErrorKind::Negotiation => {}
        e => handler.on_transport_error(e),
    }
}

/// An association accepted by this node.
///
/// Once established, the association is driven by
/// [`run`](Self::run), which dispatches every event
/// to an [`AssociationHandler`] until the association ends.
#[derive(Debug)]
pub struct ServerAssociation<S> {
    machine: StateMachine<S>,
    parameters: AssociationParameters,
    timeouts: Timeouts,
    reassembler: Reassembler,
}

impl<S> ServerAssociation<S>
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

    /// Drive the association until it ends,
    /// dispatching incoming messages to the handler
    /// and sending the replies it queues.
    ///
    /// Returns `Ok` if the association was released.
    pub async fn run<H>(mut self, handler: &mut H) -> Result<()>
    where
        H: AssociationHandler + ?Sized,
    {
        loop {
            let received = with_timeout(
                self.timeouts.dimse,
                TimeoutStage::Dimse,
                self.machine.receive_pdu(),
            )
            .await;
            let pdu = match received {
                Ok(pdu) => pdu,
                Err(e) => return self.fail(handler, e).await,
            };

            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        let message = match self.reassembler.push(value).context(DimseSnafu) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(e) => return self.fail(handler, e).await,
                        };
                        debug!(
                            "Received {} on presentation context {}",
                            message.command, message.presentation_context_id
                        );
                        let mut outbox = Outbox::new();
                        handler.on_dimse_message(message, &mut outbox);
                        if let Some(outcome) = self.drain(&mut outbox, handler).await {
                            return outcome;
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    info!("Release requested by {}", self.parameters.calling_ae_title);
                    handler.on_release_requested();
                    return self.machine.respond_release().await;
                }
                pdu => {
                    let e = UnexpectedPduSnafu {
                        pdu: Box::new(pdu),
                        state: self.machine.state(),
                    }
                    .build();
                    return self.fail(handler, e).await;
                }
            }
        }
    }

    /// Carry out the actions queued by the handler.
    ///
    /// Returns the outcome of the association
    /// if one of the actions ended it.
    async fn drain<H>(&mut self, outbox: &mut Outbox, handler: &mut H) -> Option<Result<()>>
    where
        H: AssociationHandler + ?Sized,
    {
        for item in outbox.drain() {
            match item {
                OutboxItem::Message(message) => {
                    if let Err(e) = self.send_message(&message).await {
                        return Some(self.fail(handler, e).await);
                    }
                }
                OutboxItem::Release => {
                    info!("Releasing association");
                    return Some(match self.machine.release(self.timeouts.release).await {
                        Ok(()) => Ok(()),
                        Err(e) => self.fail(handler, e).await,
                    });
                }
                OutboxItem::Abort => {
                    info!("Aborting association");
                    self.machine.abort(AbortRQSource::ServiceUser).await;
                    handler.on_abort(&AbortRQSource::ServiceUser);
                    return Some(
                        AbortedSnafu {
                            abort_source: AbortRQSource::ServiceUser,
                        }
                        .fail(),
                    );
                }
            }
        }
        None
    }

    /// Send a DIMSE message on an accepted presentation context.
    async fn send_message(&mut self, message: &DimseMessage) -> Result<()> {
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

    /// Terminate the association after a failure
    /// and report it to the handler.
    async fn fail<H>(&mut self, handler: &mut H, error: Error) -> Result<()>
    where
        H: AssociationHandler + ?Sized,
    {
        match error.kind() {
            ErrorKind::Aborted => {}
            ErrorKind::Protocol | ErrorKind::Timeout => {
                self.machine.abort(provider_abort_source(&error)).await
            }
            ErrorKind::Transport | ErrorKind::Negotiation => self.machine.close().await,
        }
        warn!("Association terminated: {}", error);
        notify_failure(handler, &error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PresentationContextProposed, PresentationContextResultReason};
    use crate::uids::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN, VERIFICATION};
    use matches::assert_matches;

    fn request(contexts: &[(u8, &str)]) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT.to_string(),
            presentation_contexts: contexts
                .iter()
                .map(|(id, abstract_syntax)| PresentationContextProposed {
                    id: *id,
                    abstract_syntax: abstract_syntax.to_string(),
                    transfer_syntaxes: vec![
                        IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                        EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    ],
                })
                .collect(),
            user_variables: vec![UserVariableItem::MaxLength(0)],
        }
    }

    fn rejection_of(pdu: Pdu) -> AssociationRJSource {
        match pdu {
            Pdu::AssociationRJ(rj) => rj.source,
            pdu => panic!("expected rejection, got {:?}", pdu),
        }
    }

    #[test]
    fn accepts_supported_context() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (ac, parameters) = options
            .process_association_rq(request(&[(1, VERIFICATION), (3, "1.2.3.4")]), None)
            .unwrap();

        assert_eq!(ac.presentation_contexts.len(), 2);
        assert_eq!(
            ac.presentation_contexts[0].transfer_syntax.as_deref(),
            Some(IMPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(
            ac.presentation_contexts[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert!(ac
            .user_variables
            .contains(&UserVariableItem::MaxLength(DEFAULT_MAX_PDU)));
        assert_eq!(parameters.requestor_max_pdu_length(), 0);
        assert_eq!(parameters.accepted_presentation_contexts().count(), 1);
        assert_eq!(
            parameters.codecs().get(1).map(|c| c.transfer_syntax.as_str()),
            Some(IMPLICIT_VR_LITTLE_ENDIAN)
        );
        assert!(parameters.codecs().get(3).is_none());
    }

    #[test]
    fn duplicate_context_id_aborts() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, e) = options
            .process_association_rq(request(&[(1, VERIFICATION), (1, VERIFICATION)]), None)
            .unwrap_err();
        assert_eq!(
            pdu,
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter
                )
            }
        );
        assert_matches!(e, Error::DuplicatePresentationContextId { id: 1, .. });
    }

    #[test]
    fn even_context_id_aborts() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (_, e) = options
            .process_association_rq(request(&[(2, VERIFICATION)]), None)
            .unwrap_err();
        assert_matches!(e, Error::InvalidPresentationContextId { id: 2, .. });
        assert_eq!(e.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn unsupported_protocol_version() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let mut rq = request(&[(1, VERIFICATION)]);
        rq.protocol_version = 2;
        let (pdu, _) = options.process_association_rq(rq, None).unwrap_err();
        assert_eq!(
            rejection_of(pdu),
            AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported
            )
        );
    }

    #[test]
    fn unknown_application_context() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let mut rq = request(&[(1, VERIFICATION)]);
        rq.application_context_name = "1.2.3".to_string();
        let (pdu, _) = options.process_association_rq(rq, None).unwrap_err();
        assert_eq!(
            rejection_of(pdu),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported
            )
        );
    }

    #[test]
    fn called_ae_title_must_match() {
        let options = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title("OTHER-SCP")
            .with_abstract_syntax(VERIFICATION);
        let (pdu, e) = options
            .process_association_rq(request(&[(1, VERIFICATION)]), None)
            .unwrap_err();
        assert_eq!(
            rejection_of(pdu),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        );
        assert_eq!(e.kind(), ErrorKind::Negotiation);
    }

    #[test]
    fn nothing_accepted_is_rejected() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, e) = options
            .process_association_rq(request(&[(1, "1.2.3.4")]), None)
            .unwrap_err();
        assert_eq!(
            rejection_of(pdu),
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
        );
        assert_matches!(e, Error::NoAcceptedPresentationContexts { .. });
    }

    struct NoStorageFrom(&'static str);

    impl AccessControl for NoStorageFrom {
        fn check_access(
            &self,
            _this_ae_title: &str,
            _calling_ae_title: &str,
            _called_ae_title: &str,
            _user_identity: Option<&UserIdentity>,
        ) -> Result<(), AssociationRJServiceUserReason> {
            Ok(())
        }

        fn check_abstract_syntax(&self, calling_ae_title: &str, abstract_syntax: &str) -> bool {
            !(calling_ae_title == self.0 && abstract_syntax.starts_with("1.2.840.10008.5.1.4.1.1"))
        }
    }

    #[test]
    fn abstract_syntax_policy() {
        const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
        let options = ServerAssociationOptions::new()
            .ae_access_control(NoStorageFrom("STORE-SCU"))
            .with_abstract_syntax(VERIFICATION)
            .with_supported_syntax(CT_IMAGE_STORAGE, [EXPLICIT_VR_LITTLE_ENDIAN]);
        let (ac, _) = options
            .process_association_rq(request(&[(1, VERIFICATION), (3, CT_IMAGE_STORAGE)]), None)
            .unwrap();
        assert_eq!(
            ac.presentation_contexts[1].reason,
            PresentationContextResultReason::UserRejection
        );
    }

    #[test]
    fn supported_syntaxes_default_to_native() {
        let options = ServerAssociationOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .promiscuous(true);
        let supported = options.supported_syntaxes();
        assert_eq!(
            supported.transfer_syntaxes_for(VERIFICATION).map(|ts| ts.len()),
            Some(NATIVE_TRANSFER_SYNTAXES.len())
        );
        assert!(supported.transfer_syntaxes_for("1.2.3.4").is_some());
    }
}
