//! Association event handling on the acceptor side.
//!
//! An [`AssociationHandler`] is given to a
//! [server association](super::ServerAssociation)
//! and receives the events of its lifecycle.
//! Handlers reply through an [`Outbox`],
//! which the association drains after each callback.
use crate::dimse::DimseMessage;
use crate::pdu::{AbortRQSource, AssociationRJ};

use super::{AssociationParameters, Error};

/// The decision of a handler over an association request
/// which passed negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationDecision {
    Accept,
    Reject(AssociationRJ),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutboxItem {
    Message(DimseMessage),
    Release,
    Abort,
}

/// Queue of actions requested by a handler,
/// carried out in order once the callback returns.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<OutboxItem>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a DIMSE message to the peer.
    pub fn send(&mut self, message: DimseMessage) {
        self.items.push(OutboxItem::Message(message));
    }

    /// Request the release of the association
    /// after the messages queued so far.
    pub fn release(&mut self) {
        self.items.push(OutboxItem::Release);
    }

    /// Abort the association
    /// after the messages queued so far.
    pub fn abort(&mut self) {
        self.items.push(OutboxItem::Abort);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, OutboxItem> {
        self.items.drain(..)
    }
}

/// Receiver of the events of an association
/// on the acceptor side.
///
/// Only [`on_dimse_message`](Self::on_dimse_message) is required.
/// The callbacks of one association are invoked sequentially,
/// and exactly one of
/// [`on_release_requested`](Self::on_release_requested),
/// [`on_abort`](Self::on_abort),
/// [`on_transport_error`](Self::on_transport_error) or
/// [`on_dimse_timeout`](Self::on_dimse_timeout)
/// ends an association which was established,
/// unless the handler itself asked for a release.
pub trait AssociationHandler: Send {
    /// Decide over an association request which passed negotiation.
    fn on_association_requested(&mut self, _parameters: &AssociationParameters) -> AssociationDecision {
        AssociationDecision::Accept
    }

    fn on_association_established(&mut self, _parameters: &AssociationParameters) {}

    /// A complete DIMSE message was received.
    fn on_dimse_message(&mut self, message: DimseMessage, outbox: &mut Outbox);

    /// The peer asked to release the association.
    /// The release is answered once this returns.
    fn on_release_requested(&mut self) {}

    fn on_abort(&mut self, _source: &AbortRQSource) {}

    fn on_transport_error(&mut self, _error: &Error) {}

    /// No message arrived within the DIMSE timeout.
    /// The association is aborted once this returns.
    fn on_dimse_timeout(&mut self) {}
}

impl<H> AssociationHandler for Box<H>
where
    H: AssociationHandler + ?Sized,
{
    fn on_association_requested(&mut self, parameters: &AssociationParameters) -> AssociationDecision {
        (**self).on_association_requested(parameters)
    }

    fn on_association_established(&mut self, parameters: &AssociationParameters) {
        (**self).on_association_established(parameters)
    }

    fn on_dimse_message(&mut self, message: DimseMessage, outbox: &mut Outbox) {
        (**self).on_dimse_message(message, outbox)
    }

    fn on_release_requested(&mut self) {
        (**self).on_release_requested()
    }

    fn on_abort(&mut self, source: &AbortRQSource) {
        (**self).on_abort(source)
    }

    fn on_transport_error(&mut self, error: &Error) {
        (**self).on_transport_error(error)
    }

    fn on_dimse_timeout(&mut self) {
        (**self).on_dimse_timeout()
    }
}
