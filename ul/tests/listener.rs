//! Concurrent associations served by a listener.
use std::time::Duration;

use dicom_ulp::association::{
    AcceptAny, ClientAssociationOptions, Error, ServerAssociationOptions,
};
use dicom_ulp::listener::{ListenerHandle, ListenerOptions, OverflowPolicy};
use dicom_ulp::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource,
};
use dicom_ulp::uids::VERIFICATION;
use dicom_ulp::verification::{verify, VerificationHandler, VerificationResult};
use matches::assert_matches;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn echo_scp(ae_title: &'static str) -> ServerAssociationOptions<'static, AcceptAny> {
    ServerAssociationOptions::new()
        .ae_title(ae_title)
        .with_abstract_syntax(VERIFICATION)
}

async fn spawn_listener(options: ListenerOptions) -> Result<ListenerHandle> {
    Ok(options.bind("localhost:0").await?.spawn())
}

fn echo_scu(called_ae_title: &'static str) -> ClientAssociationOptions<'static> {
    ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title(called_ae_title)
        .with_abstract_syntax(VERIFICATION)
}

async fn wait_until_idle(handle: &ListenerHandle) {
    for _ in 0..100 {
        if handle.active_associations() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("associations did not end");
}

fn local_limit_exceeded() -> AssociationRJ {
    AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    }
}

#[tokio::test]
async fn verification_through_listener() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new().application(echo_scp("ECHO-SCP"), VerificationHandler::default),
    )
    .await?;
    let address = format!("ECHO-SCP@{}", handle.local_addr());

    let result = verify(ClientAssociationOptions::new(), &address).await;
    assert_eq!(result, VerificationResult::Success);

    wait_until_idle(&handle).await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn association_beyond_capacity_is_rejected() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new()
            .max_associations(1)
            .overflow(OverflowPolicy::Reject)
            .application(echo_scp("ECHO-SCP"), VerificationHandler::default),
    )
    .await?;
    let addr = handle.local_addr();

    let first = echo_scu("ECHO-SCP").establish(addr).await?;
    assert_eq!(handle.active_associations(), 1);

    let second = echo_scu("ECHO-SCP").establish(addr).await;
    assert_matches!(
        second,
        Err(Error::Rejected { association_rj, .. }) if association_rj == local_limit_exceeded()
    );

    first.release().await?;
    wait_until_idle(&handle).await;

    let third = echo_scu("ECHO-SCP").establish(addr).await?;
    third.release().await?;

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn queued_association_waits_for_a_slot() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new()
            .max_associations(1)
            .overflow(OverflowPolicy::Queue { max_pending: 1 })
            .application(echo_scp("ECHO-SCP"), VerificationHandler::default),
    )
    .await?;
    let addr = handle.local_addr();

    let first = echo_scu("ECHO-SCP").establish(addr).await?;

    let queued = tokio::spawn(async move {
        let association = echo_scu("ECHO-SCP").establish(addr).await?;
        association.release().await
    });
    // let the second connection take the only place in the queue
    tokio::time::sleep(Duration::from_millis(200)).await;

    let third = echo_scu("ECHO-SCP").establish(addr).await;
    assert_matches!(
        third,
        Err(Error::Rejected { association_rj, .. }) if association_rj == local_limit_exceeded()
    );

    first.release().await?;
    queued.await??;

    wait_until_idle(&handle).await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rejections_under_way_are_bounded() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new()
            .max_associations(1)
            .max_rejections(1)
            .application(echo_scp("ECHO-SCP"), VerificationHandler::default),
    )
    .await?;
    let addr = handle.local_addr();

    let first = echo_scu("ECHO-SCP").establish(addr).await?;

    // holds the only rejection slot by never sending a request
    let silent = tokio::net::TcpStream::connect(addr).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dropped = echo_scu("ECHO-SCP").establish(addr).await;
    assert!(dropped.is_err());
    assert!(!matches!(dropped, Err(Error::Rejected { .. })));

    // the slot is given back once the silent peer leaves
    drop(silent);
    let mut rejected = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Err(Error::Rejected { association_rj, .. }) =
            echo_scu("ECHO-SCP").establish(addr).await
        {
            assert_eq!(association_rj, local_limit_exceeded());
            rejected = true;
            break;
        }
    }
    assert!(rejected, "over-capacity association was never rejected");

    first.release().await?;
    wait_until_idle(&handle).await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn called_ae_title_selects_the_application() -> Result {
    let storage = ServerAssociationOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE);
    let handle = spawn_listener(
        ListenerOptions::new()
            .application(echo_scp("ECHO-SCP"), VerificationHandler::default)
            .application(storage, VerificationHandler::default),
    )
    .await?;
    let addr = handle.local_addr();

    let association = ClientAssociationOptions::new()
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(VERIFICATION)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .establish(addr)
        .await?;
    let parameters = association.parameters();
    assert!(parameters.accepted_context_for(CT_IMAGE_STORAGE).is_some());
    assert!(parameters.accepted_context_for(VERIFICATION).is_none());
    association.release().await?;

    let unknown = echo_scu("NOBODY").establish(addr).await;
    assert_matches!(
        unknown,
        Err(Error::Rejected { association_rj, .. })
            if association_rj == AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            }
    );
    let result = verify(ClientAssociationOptions::new(), &format!("NOBODY@{}", addr)).await;
    assert_eq!(result, VerificationResult::AssociationRejected);

    wait_until_idle(&handle).await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn default_application_takes_unknown_ae_titles() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new()
            .default_application(echo_scp("ANY-SCP"), VerificationHandler::default),
    )
    .await?;

    let result = verify(
        ClientAssociationOptions::new(),
        &format!("WHOEVER@{}", handle.local_addr()),
    )
    .await;
    assert_eq!(result, VerificationResult::Success);

    wait_until_idle(&handle).await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stopped_listener_refuses_connections() -> Result {
    let handle = spawn_listener(
        ListenerOptions::new().application(echo_scp("ECHO-SCP"), VerificationHandler::default),
    )
    .await?;
    let addr = handle.local_addr();
    handle.shutdown().await?;

    let result = verify(ClientAssociationOptions::new(), &format!("ECHO-SCP@{}", addr)).await;
    assert_eq!(result, VerificationResult::Failed);
    Ok(())
}

#[tokio::test]
async fn listener_needs_an_application() {
    let out = ListenerOptions::new().bind("localhost:0").await;
    assert!(out.is_err());
}
