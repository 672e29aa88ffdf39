//! Associations between a requester and an acceptor over TCP.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_ulp::association::{
    AcceptCalledAeTitle, AssociationHandler, AssociationParameters, AssociationState,
    ClientAssociationOptions, Error, Outbox, ServerAssociationOptions, TimeoutStage, Timeouts,
};
use dicom_ulp::dimse::{status, Command, CommandField, DimseMessage};
use dicom_ulp::pdu::AbortRQSource;
use dicom_ulp::uids::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN, VERIFICATION};
use matches::assert_matches;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Established,
    Message(DimseMessage),
    ReleaseRequested,
    Abort(AbortRQSource),
    TransportError,
    DimseTimeout,
}

/// Records every event and answers requests with a success status,
/// sending back any data set it receives.
#[derive(Debug, Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl AssociationHandler for Recorder {
    fn on_association_established(&mut self, _parameters: &AssociationParameters) {
        self.push(Event::Established);
    }

    fn on_dimse_message(&mut self, message: DimseMessage, outbox: &mut Outbox) {
        self.push(Event::Message(message.clone()));
        if let Some(response) = Command::response_to(&message.command, status::SUCCESS) {
            let reply = match message.dataset {
                Some(dataset) => DimseMessage::with_dataset(
                    message.presentation_context_id,
                    response,
                    dataset,
                ),
                None => DimseMessage::new(message.presentation_context_id, response),
            };
            outbox.send(reply);
        }
    }

    fn on_release_requested(&mut self) {
        self.push(Event::ReleaseRequested);
    }

    fn on_abort(&mut self, source: &AbortRQSource) {
        self.push(Event::Abort(*source));
    }

    fn on_transport_error(&mut self, _error: &Error) {
        self.push(Event::TransportError);
    }

    fn on_dimse_timeout(&mut self) {
        self.push(Event::DimseTimeout);
    }
}

fn scp_options() -> ServerAssociationOptions<'static, AcceptCalledAeTitle> {
    ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        // acceptor preference differs from the requestor's
        .with_transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .with_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN)
        .max_pdu_length(8192)
}

/// Accept a single association and run it to completion.
async fn spawn_scp(
    options: ServerAssociationOptions<'static, AcceptCalledAeTitle>,
    handler: Recorder,
) -> Result<(JoinHandle<dicom_ulp::association::Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let mut handler = handler;
        let (socket, peer) = listener.accept().await.unwrap();
        let association = options.establish(socket, Some(peer), &mut handler).await?;
        association.run(&mut handler).await
    });
    Ok((task, addr))
}

fn scu_options() -> ClientAssociationOptions<'static> {
    ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(
            VERIFICATION,
            vec![IMPLICIT_VR_LITTLE_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN],
        )
}

#[tokio::test]
async fn echo_round_trip() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options(), recorder.clone()).await?;

    let mut association = scu_options().establish(addr).await?;
    assert_eq!(association.state(), AssociationState::Established);

    // the first proposed transfer syntax wins
    let pc = association
        .parameters()
        .accepted_context_for(VERIFICATION)
        .ok_or("verification not accepted")?;
    assert_eq!(pc.id, 1);
    assert_eq!(pc.transfer_syntax.as_deref(), Some(IMPLICIT_VR_LITTLE_ENDIAN));
    assert_eq!(association.parameters().acceptor_max_pdu_length(), 8192);
    assert_eq!(association.parameters().called_ae_title(), SCP_AE_TITLE);

    let message_id = association.next_message_id();
    let request = DimseMessage::new(1, Command::echo_rq(message_id));
    let response = association.request(&request).await?;

    assert_eq!(response.presentation_context_id, 1);
    assert_eq!(response.dataset, None);
    let command = &response.command;
    assert_eq!(command.command_field, CommandField::CEchoRsp);
    assert_eq!(command.message_id_being_responded_to, Some(message_id));
    assert_eq!(command.affected_sop_class_uid.as_deref(), Some(VERIFICATION));
    assert_eq!(command.status, Some(status::SUCCESS));
    assert_eq!(command.message_id, None);

    association.release().await?;
    scp.await??;

    let events = recorder.events();
    assert_eq!(events.len(), 3, "{:?}", events);
    assert_eq!(events[0], Event::Established);
    assert_eq!(events[1], Event::Message(request));
    assert_eq!(events[2], Event::ReleaseRequested);
    Ok(())
}

#[tokio::test]
async fn large_data_set_is_fragmented_both_ways() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options(), recorder.clone()).await?;

    let mut association = scu_options()
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .max_pdu_length(4096)
        .establish(addr)
        .await?;
    let pc_id = association
        .parameters()
        .accepted_context_for(CT_IMAGE_STORAGE)
        .map(|pc| pc.id)
        .ok_or("storage not accepted")?;
    assert_eq!(pc_id, 3);

    let dataset: Vec<u8> = (0..50_000_u32).map(|i| (i % 251) as u8).collect();
    let mut command = Command::request(
        CommandField::CStoreRq,
        association.next_message_id(),
        CT_IMAGE_STORAGE,
    );
    command.affected_sop_instance_uid = Some("1.2.3.4.5.6.7".to_string());
    let request = DimseMessage::with_dataset(pc_id, command, dataset.clone());
    let response = association.request(&request).await?;

    assert_eq!(response.command.command_field, CommandField::CStoreRsp);
    assert_eq!(
        response.command.affected_sop_instance_uid.as_deref(),
        Some("1.2.3.4.5.6.7")
    );
    assert_eq!(response.dataset.as_deref(), Some(&dataset[..]));
    // fragmented according to each side's maximum PDU length
    assert!(association.statistics().pdus_received > 50_000 / 4096);
    assert!(association.statistics().pdus_sent > 50_000 / 8192);

    association.release().await?;
    scp.await??;
    assert_eq!(recorder.events()[1], Event::Message(request));
    Ok(())
}

#[tokio::test]
async fn zero_max_pdu_length_admits_large_pdus() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options().max_pdu_length(0), recorder.clone()).await?;

    let mut association = scu_options()
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .max_pdu_length(0)
        .establish(addr)
        .await?;
    assert_eq!(association.parameters().acceptor_max_pdu_length(), 0);
    let pc_id = association
        .parameters()
        .accepted_context_for(CT_IMAGE_STORAGE)
        .map(|pc| pc.id)
        .ok_or("storage not accepted")?;

    // well beyond the default maximum PDU length
    let dataset: Vec<u8> = (0..40_000_u32).map(|i| (i % 13) as u8).collect();
    let mut command = Command::request(
        CommandField::CStoreRq,
        association.next_message_id(),
        CT_IMAGE_STORAGE,
    );
    command.affected_sop_instance_uid = Some("1.2.3.4.5.6.8".to_string());
    let request = DimseMessage::with_dataset(pc_id, command, dataset.clone());
    let response = association.request(&request).await?;

    assert_eq!(response.command.status, Some(status::SUCCESS));
    assert_eq!(response.dataset.as_deref(), Some(&dataset[..]));

    association.release().await?;
    scp.await??;
    assert_eq!(recorder.events()[1], Event::Message(request));
    Ok(())
}

#[tokio::test]
async fn requester_abort_reaches_the_handler_once() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options(), recorder.clone()).await?;

    let association = scu_options().establish(addr).await?;
    association.abort().await;

    let outcome = scp.await?;
    assert_matches!(
        outcome,
        Err(Error::Aborted {
            abort_source: AbortRQSource::ServiceUser,
            ..
        })
    );
    assert_eq!(
        recorder.events(),
        vec![Event::Established, Event::Abort(AbortRQSource::ServiceUser)]
    );
    Ok(())
}

#[tokio::test]
async fn idle_association_times_out() -> Result {
    let recorder = Recorder::default();
    let options = scp_options().timeouts(Timeouts {
        dimse: Some(Duration::from_millis(100)),
        ..Timeouts::default()
    });
    let (scp, addr) = spawn_scp(options, recorder.clone()).await?;

    let mut association = scu_options().establish(addr).await?;
    let outcome = scp.await?;
    assert_matches!(
        outcome,
        Err(Error::Timeout {
            stage: TimeoutStage::Dimse,
            ..
        })
    );
    assert_eq!(
        recorder.events(),
        vec![Event::Established, Event::DimseTimeout]
    );

    // the acceptor aborted the association
    assert_matches!(
        association.receive_message().await,
        Err(Error::Aborted {
            abort_source: AbortRQSource::ServiceProvider(_),
            ..
        })
    );
    assert_eq!(association.state(), AssociationState::Closed);
    Ok(())
}

#[tokio::test]
async fn silent_acceptor_times_out() -> Result {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // hold the connection without answering
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let outcome = scu_options()
        .timeouts(Timeouts {
            accept: Some(Duration::from_millis(100)),
            ..Timeouts::default()
        })
        .establish(addr)
        .await;
    assert_matches!(
        outcome,
        Err(Error::Timeout {
            stage: TimeoutStage::Accept,
            ..
        })
    );
    silent.abort();
    Ok(())
}

#[tokio::test]
async fn wrong_called_ae_title_is_rejected() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options(), recorder.clone()).await?;

    let outcome = scu_options()
        .called_ae_title("SOMEONE-ELSE")
        .establish(addr)
        .await;
    assert_matches!(outcome, Err(Error::Rejected { .. }));
    assert_matches!(scp.await?, Err(Error::Rejected { .. }));
    // rejections on negotiation grounds are not reported to the handler
    assert_eq!(recorder.events(), vec![]);
    Ok(())
}

#[tokio::test]
async fn unsupported_abstract_syntax_only() -> Result {
    let recorder = Recorder::default();
    let (scp, addr) = spawn_scp(scp_options(), recorder.clone()).await?;

    let outcome = ClientAssociationOptions::new()
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax("1.2.840.10008.5.1.4.1.2.1.1")
        .establish(addr)
        .await;
    assert_matches!(outcome, Err(Error::Rejected { .. }));
    assert_matches!(
        scp.await?,
        Err(Error::NoAcceptedPresentationContexts { .. })
    );
    Ok(())
}
