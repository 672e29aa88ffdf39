//! Verification service class, on both sides of an association.
//!
//! [`verify`] is a complete C-ECHO round trip as a service class user:
//! it establishes an association, sends a C-ECHO-RQ,
//! waits for the response and releases the association.
//!
//! [`VerificationHandler`] is the service class provider counterpart,
//! to be given to a [server association](crate::association::ServerAssociation)
//! or to a [listener](crate::listener).
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::association::{
    AssociationHandler, ClientAssociation, ClientAssociationOptions, Error, ErrorKind, Outbox,
};
use crate::dimse::{status, Command, CommandField, DimseMessage, StatusType};
use crate::uids::VERIFICATION;

/// The outcome of a verification attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VerificationResult {
    /// The peer answered the C-ECHO with a success status.
    Success,
    /// The peer answered with another status,
    /// or the association failed for another reason.
    Failed,
    /// A timer expired while connecting, negotiating or waiting for the response.
    TimeoutExpired,
    /// The peer rejected the association,
    /// or did not accept the Verification SOP class.
    AssociationRejected,
}

impl VerificationResult {
    fn of_error(e: &Error) -> Self {
        match e {
            Error::Rejected { .. } | Error::NoAcceptedPresentationContexts { .. } => {
                VerificationResult::AssociationRejected
            }
            e if e.kind() == ErrorKind::Timeout => VerificationResult::TimeoutExpired,
            _ => VerificationResult::Failed,
        }
    }
}

/// Verify that the node at the given address
/// answers C-ECHO requests.
///
/// The address may be prefixed with the called AE title,
/// as in `ECHO-SCP@127.0.0.1:11112`.
/// A Verification presentation context with the default transfer syntaxes
/// is proposed unless the options already propose one.
///
/// # Example
///
/// ```no_run
/// # use dicom_ulp::association::ClientAssociationOptions;
/// # use dicom_ulp::verification::{verify, VerificationResult};
/// # async fn run() {
/// let options = ClientAssociationOptions::new().calling_ae_title("ECHO-SCU");
/// let result = verify(options, "ECHO-SCP@127.0.0.1:11112").await;
/// assert_eq!(result, VerificationResult::Success);
/// # }
/// ```
pub async fn verify(options: ClientAssociationOptions<'_>, address: &str) -> VerificationResult {
    let options = if options.proposes(VERIFICATION) {
        options
    } else {
        options.with_abstract_syntax(VERIFICATION)
    };
    match options.establish_with(address).await {
        Ok(association) => verify_over(association).await,
        Err(e) => {
            error!("Could not establish association: {}", e);
            VerificationResult::of_error(&e)
        }
    }
}

/// Send a C-ECHO-RQ over an established association
/// and release it afterwards.
pub async fn verify_over<S>(mut association: ClientAssociation<S>) -> VerificationResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let accepted = association
        .parameters()
        .accepted_context_for(VERIFICATION)
        .map(|pc| pc.id);
    let Some(pc_id) = accepted else {
        error!("Verification SOP class was not accepted");
        association.abort().await;
        return VerificationResult::AssociationRejected;
    };

    let message_id = association.next_message_id();
    let request = DimseMessage::new(pc_id, Command::echo_rq(message_id));
    let response = match association.request(&request).await {
        Ok(response) => response,
        Err(e) => {
            error!("C-ECHO failed: {}", e);
            return VerificationResult::of_error(&e);
        }
    };

    let result = match response.command.status_type() {
        Some(StatusType::Success) => {
            info!("C-ECHO successful");
            VerificationResult::Success
        }
        _ => {
            warn!("C-ECHO answered with {}", response.command);
            VerificationResult::Failed
        }
    };

    if let Err(e) = association.release().await {
        warn!("Could not release association: {}", e);
    }
    result
}

/// An association handler for the Verification service class.
///
/// Every C-ECHO-RQ is answered with a success status.
/// Other requests are answered with _unrecognized operation_.
#[derive(Debug, Default, Clone)]
pub struct VerificationHandler {
    echoes: usize,
}

impl VerificationHandler {
    /// The number of C-ECHO requests answered so far.
    pub fn echoes(&self) -> usize {
        self.echoes
    }
}

impl AssociationHandler for VerificationHandler {
    fn on_dimse_message(&mut self, message: DimseMessage, outbox: &mut Outbox) {
        let status = if message.command.command_field == CommandField::CEchoRq {
            self.echoes += 1;
            status::SUCCESS
        } else {
            status::UNRECOGNIZED_OPERATION
        };
        match Command::response_to(&message.command, status) {
            Some(response) => {
                debug!("Answering {} with {}", message.command, response);
                outbox.send(DimseMessage::new(message.presentation_context_id, response));
            }
            None => warn!("Ignoring unsolicited {}", message.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_is_answered_with_success() {
        let mut handler = VerificationHandler::default();
        let mut outbox = Outbox::new();
        handler.on_dimse_message(DimseMessage::new(1, Command::echo_rq(7)), &mut outbox);
        assert_eq!(handler.echoes(), 1);

        let sent: Vec<_> = outbox.drain().collect();
        let [crate::association::handler::OutboxItem::Message(response)] = &sent[..] else {
            panic!("expected one response, got {:?}", sent);
        };
        assert_eq!(response.presentation_context_id, 1);
        assert_eq!(response.command.command_field, CommandField::CEchoRsp);
        assert_eq!(response.command.message_id_being_responded_to, Some(7));
        assert_eq!(response.command.status, Some(status::SUCCESS));
        assert_eq!(
            response.command.affected_sop_class_uid.as_deref(),
            Some(VERIFICATION)
        );
    }

    #[test]
    fn other_requests_are_unrecognized() {
        let mut handler = VerificationHandler::default();
        let mut outbox = Outbox::new();
        let find = Command::request(CommandField::CFindRq, 2, "1.2.840.10008.5.1.4.1.2.1.1");
        handler.on_dimse_message(DimseMessage::new(3, find), &mut outbox);
        // responses are not answered
        let rsp = Command::response_to(&Command::echo_rq(1), status::SUCCESS).unwrap();
        handler.on_dimse_message(DimseMessage::new(3, rsp), &mut outbox);

        let sent: Vec<_> = outbox.drain().collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(handler.echoes(), 0);
    }
}
