//! Association state machine.
//!
//! [`StateMachine`] owns the transport stream of one association,
//! frames PDUs in and out of it,
//! and enforces which PDUs are admissible in each [`AssociationState`].
//! Both the requestor and the acceptor drive an association through it.
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{
    effective_max_pdu_length, with_timeout, AbortedSnafu, ClosedSnafu, ConnectionClosedSnafu,
    ReceivePduSnafu, Result, SendPduSnafu, SendTooLongPduSnafu, TimeoutStage, TruncatedPduSnafu,
    UnexpectedPduSnafu, WireReadSnafu, WireSendSnafu,
};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, Pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

/// The state of an association, as seen by the local node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// no association and no transport connection
    Idle,
    /// the requestor is opening the transport connection
    TransportConnecting,
    /// the acceptor received the transport connection
    /// and waits for the association request
    AssociationRequested,
    /// the requestor sent the association request
    /// and waits for the response
    AssociationRequesting,
    /// data transfer may take place
    Established,
    /// the local node sent a release request
    ReleaseRequested,
    /// the local node is answering a release request
    Releasing,
    /// the association was aborted by either side
    Aborted,
    /// the transport connection is closed
    Closed,
}

/// Counters of the traffic on one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pdus_sent: u64,
    pub pdus_received: u64,
    started: Instant,
}

impl TransmissionStatistics {
    fn new() -> Self {
        TransmissionStatistics {
            bytes_sent: 0,
            bytes_received: 0,
            pdus_sent: 0,
            pdus_received: 0,
            started: Instant::now(),
        }
    }

    /// Time elapsed since the transport connection was taken over.
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Drives one association over a transport stream.
///
/// Every PDU leaving or entering the node goes through
/// [`send_pdu`](Self::send_pdu) and [`receive_pdu`](Self::receive_pdu).
/// Once the machine reaches a terminal state,
/// the transport is shut down exactly once
/// and every further operation fails with a `Closed` error.
#[derive(Debug)]
pub struct StateMachine<S> {
    stream: S,
    state: AssociationState,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
    /// the maximum PDU length this node admits
    max_receive_pdu: u32,
    /// the maximum PDU length the peer admits
    max_send_pdu: u32,
    strict: bool,
    statistics: TransmissionStatistics,
    closed: bool,
}

impl<S> StateMachine<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Take over a transport stream in the given initial state.
    ///
    /// A `max_receive_pdu` of 0 admits PDUs up to [`MAXIMUM_PDU_SIZE`].
    pub fn new(stream: S, state: AssociationState, max_receive_pdu: u32, strict: bool) -> Self {
        let max_receive_pdu = effective_max_pdu_length(max_receive_pdu);
        StateMachine {
            stream,
            state,
            read_buffer: BytesMut::with_capacity(
                (max_receive_pdu.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE) as usize,
            ),
            write_buffer: Vec::with_capacity(DEFAULT_MAX_PDU as usize),
            max_receive_pdu,
            max_send_pdu: DEFAULT_MAX_PDU,
            strict,
            statistics: TransmissionStatistics::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn statistics(&self) -> &TransmissionStatistics {
        &self.statistics
    }

    pub(crate) fn transition(&mut self, state: AssociationState) {
        if self.state != state {
            debug!("Association state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Change the maximum PDU length admitted from the peer.
    pub(crate) fn set_max_receive_pdu_length(&mut self, max_pdu_length: u32, strict: bool) {
        self.max_receive_pdu = effective_max_pdu_length(max_pdu_length);
        self.strict = strict;
    }

    /// Record the maximum PDU length announced by the peer,
    /// where 0 stands for no limit.
    pub(crate) fn set_peer_max_pdu_length(&mut self, max_pdu_length: u32) {
        self.max_send_pdu = effective_max_pdu_length(max_pdu_length);
    }

    /// The maximum PDU length that may be sent to the peer.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.max_send_pdu
    }

    /// Encode and send a PDU to the peer.
    ///
    /// P-DATA-TF PDUs exceeding the peer's maximum length are refused.
    pub async fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        ensure!(!self.closed, ClosedSnafu);

        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        if let Pdu::PData { .. } = pdu {
            let length = self.write_buffer.len() - PDU_HEADER_SIZE as usize;
            ensure!(
                length <= self.max_send_pdu as usize,
                SendTooLongPduSnafu {
                    length,
                    max: self.max_send_pdu,
                }
            );
        }

        self.stream
            .write_all(&self.write_buffer)
            .await
            .context(WireSendSnafu)?;
        self.stream.flush().await.context(WireSendSnafu)?;
        self.statistics.bytes_sent += self.write_buffer.len() as u64;
        self.statistics.pdus_sent += 1;
        Ok(())
    }

    /// Wait for the next PDU from the peer.
    ///
    /// This method is cancel safe:
    /// bytes read before the future is dropped
    /// stay buffered for the next call.
    ///
    /// An A-ABORT from the peer moves the machine to the `Aborted` state,
    /// closes the transport and is reported as an `Aborted` error.
    pub async fn receive_pdu(&mut self) -> Result<Pdu> {
        ensure!(!self.closed, ClosedSnafu);

        loop {
            let mut buf = &self.read_buffer[..];
            let available = buf.len();
            let outcome = read_pdu(&mut buf, self.max_receive_pdu, self.strict)
                .context(ReceivePduSnafu)?;
            if let Some(pdu) = outcome {
                let consumed = available - buf.len();
                self.read_buffer.advance(consumed);
                self.statistics.bytes_received += consumed as u64;
                self.statistics.pdus_received += 1;

                if let Pdu::AbortRQ { source } = pdu {
                    debug!("Received abort from peer: {}", source);
                    self.transition(AssociationState::Aborted);
                    self.close().await;
                    return AbortedSnafu {
                        abort_source: source,
                    }
                    .fail();
                }
                return Ok(pdu);
            }

            let read = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .context(WireReadSnafu)?;
            if read == 0 {
                let pending = self.read_buffer.len();
                self.close().await;
                ensure!(pending == 0, TruncatedPduSnafu { pending });
                return ConnectionClosedSnafu.fail();
            }
        }
    }

    /// Send an A-ABORT to the peer and close the transport.
    ///
    /// Failing to deliver the abort is only logged,
    /// since the association is terminated either way.
    pub async fn abort(&mut self, source: AbortRQSource) {
        if self.closed {
            return;
        }
        if let Err(e) = self.send_pdu(&Pdu::AbortRQ { source }).await {
            warn!("Could not send abort to peer: {}", snafu::Report::from_error(e));
        }
        self.transition(AssociationState::Aborted);
        self.close().await;
    }

    /// Shut down the transport.
    ///
    /// The stream is shut down only once,
    /// no matter how many times this is called.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let outcome = if self.state == AssociationState::Aborted {
            "aborted"
        } else {
            "closed"
        };
        if let Err(e) = self.stream.shutdown().await {
            debug!("Transport shutdown failed: {}", e);
        }
        self.transition(AssociationState::Closed);
        let stats = &self.statistics;
        info!(
            "Association {}: {} PDUs ({} bytes) sent, {} PDUs ({} bytes) received in {:?}",
            outcome,
            stats.pdus_sent,
            stats.bytes_sent,
            stats.pdus_received,
            stats.bytes_received,
            stats.duration()
        );
    }

    /// Request a graceful release of the association
    /// and wait for the peer's reply.
    ///
    /// P-DATA-TF PDUs still in flight are discarded.
    /// A release request crossing ours is answered.
    /// If the reply does not arrive in time,
    /// the association is aborted.
    pub async fn release(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.send_pdu(&Pdu::ReleaseRQ).await?;
        self.transition(AssociationState::ReleaseRequested);

        let outcome = with_timeout(timeout, TimeoutStage::Release, async {
            loop {
                match self.receive_pdu().await? {
                    Pdu::ReleaseRP => return Ok::<_, super::Error>(()),
                    Pdu::ReleaseRQ => {
                        debug!("Release collision, answering peer release request");
                        self.send_pdu(&Pdu::ReleaseRP).await?;
                    }
                    pdu @ Pdu::PData { .. } => {
                        warn!(
                            "Discarding {} received while releasing",
                            pdu.short_description()
                        );
                    }
                    pdu => {
                        return UnexpectedPduSnafu {
                            pdu: Box::new(pdu),
                            state: AssociationState::ReleaseRequested,
                        }
                        .fail()
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.close().await;
                Ok(())
            }
            Err(e) if e.kind() == super::ErrorKind::Aborted => Err(e),
            Err(e) => {
                self.abort(AbortRQSource::ServiceProvider(
                    crate::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                ))
                .await;
                Err(e)
            }
        }
    }

    /// Answer a release request from the peer and close the transport.
    pub async fn respond_release(&mut self) -> Result<()> {
        self.transition(AssociationState::Releasing);
        let sent = self.send_pdu(&Pdu::ReleaseRP).await;
        self.close().await;
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Error;
    use matches::assert_matches;
    use rstest::rstest;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// Duplex stream counting how many times it is shut down.
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn machine(state: AssociationState) -> (StateMachine<CountingStream>, DuplexStream, Arc<AtomicUsize>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let stream = CountingStream {
            inner: a,
            shutdowns: shutdowns.clone(),
        };
        (
            StateMachine::new(stream, state, DEFAULT_MAX_PDU, true),
            b,
            shutdowns,
        )
    }

    fn encode(pdu: &Pdu) -> Vec<u8> {
        let mut out = Vec::new();
        write_pdu(&mut out, pdu).unwrap();
        out
    }

    #[rstest]
    #[case(AssociationState::AssociationRequested)]
    #[case(AssociationState::AssociationRequesting)]
    #[case(AssociationState::Established)]
    #[case(AssociationState::ReleaseRequested)]
    #[tokio::test]
    async fn abort_from_peer_terminates(#[case] state: AssociationState) {
        let (mut machine, mut peer, shutdowns) = machine(state);
        peer.write_all(&encode(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }))
        .await
        .unwrap();

        assert_matches!(
            machine.receive_pdu().await,
            Err(Error::Aborted {
                abort_source: AbortRQSource::ServiceUser,
                ..
            })
        );
        // aborted, then closed once the transport is shut down
        assert_eq!(machine.state(), AssociationState::Closed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        // terminal: nothing else goes through
        assert_matches!(machine.receive_pdu().await, Err(Error::Closed { .. }));
        assert_matches!(
            machine.send_pdu(&Pdu::ReleaseRQ).await,
            Err(Error::Closed { .. })
        );
        machine.close().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pdu_split_across_reads() {
        let (mut machine, mut peer, _) = machine(AssociationState::Established);
        let bytes = encode(&Pdu::ReleaseRQ);
        let (head, tail) = bytes.split_at(3);

        let writer = async move {
            peer.write_all(head).await.unwrap();
            tokio::task::yield_now().await;
            peer.write_all(tail).await.unwrap();
            peer
        };
        let (received, _peer) = tokio::join!(machine.receive_pdu(), writer);
        assert_eq!(received.unwrap(), Pdu::ReleaseRQ);
        assert_eq!(machine.statistics().pdus_received, 1);
        assert_eq!(machine.statistics().bytes_received, 10);
    }

    #[tokio::test]
    async fn closed_mid_pdu_is_truncated() {
        let (mut machine, mut peer, _) = machine(AssociationState::Established);
        peer.write_all(&[0x04, 0x00, 0x00, 0x00]).await.unwrap();
        drop(peer);
        assert_matches!(
            machine.receive_pdu().await,
            Err(Error::TruncatedPdu { pending: 4, .. })
        );
        assert_eq!(machine.state(), AssociationState::Closed);
    }

    #[tokio::test]
    async fn closed_between_pdus() {
        let (mut machine, peer, _) = machine(AssociationState::Established);
        drop(peer);
        assert_matches!(
            machine.receive_pdu().await,
            Err(Error::ConnectionClosed { .. })
        );
    }

    #[tokio::test]
    async fn oversized_pdata_is_not_sent() {
        let (mut machine, _peer, _) = machine(AssociationState::Established);
        machine.set_peer_max_pdu_length(4096);
        let pdu = Pdu::PData {
            data: vec![crate::pdu::PDataValue {
                presentation_context_id: 1,
                value_type: crate::pdu::PDataValueType::Data,
                is_last: true,
                data: vec![0; 5000],
            }],
        };
        assert_matches!(
            machine.send_pdu(&pdu).await,
            Err(Error::SendTooLongPdu { max: 4096, .. })
        );
        assert_eq!(machine.statistics().pdus_sent, 0);
    }

    #[tokio::test]
    async fn release_discards_data_and_answers_collision() {
        let (mut machine, mut peer, shutdowns) = machine(AssociationState::Established);

        let peer_side = async move {
            let mut buf = [0_u8; 10];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x05);
            let data = Pdu::PData {
                data: vec![crate::pdu::PDataValue {
                    presentation_context_id: 1,
                    value_type: crate::pdu::PDataValueType::Data,
                    is_last: true,
                    data: vec![1, 2, 3, 4],
                }],
            };
            peer.write_all(&encode(&data)).await.unwrap();
            peer.write_all(&encode(&Pdu::ReleaseRQ)).await.unwrap();
            // our release request is answered
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x06);
            peer.write_all(&encode(&Pdu::ReleaseRP)).await.unwrap();
            peer
        };

        let (released, _peer) = tokio::join!(
            machine.release(Some(Duration::from_secs(5))),
            peer_side
        );
        released.unwrap();
        assert_eq!(machine.state(), AssociationState::Closed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_timeout_aborts() {
        let (mut machine, mut peer, _) = machine(AssociationState::Established);
        let out = machine.release(Some(Duration::from_millis(50))).await;
        assert_matches!(
            out,
            Err(Error::Timeout {
                stage: TimeoutStage::Release,
                ..
            })
        );
        assert_eq!(machine.state(), AssociationState::Closed);

        // release request, then abort
        let mut buf = vec![0_u8; 20];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x05);
        assert_eq!(buf[10], 0x07);
    }
}
