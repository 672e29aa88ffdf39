//! Concurrent association acceptor.
//!
//! A [`Listener`] accepts TCP connections on one port
//! and runs every association in its own task,
//! up to a configurable number of concurrent associations.
//! Associations are routed to an application by their called AE title,
//! so that one port can serve several application entities.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_ulp::association::ServerAssociationOptions;
//! # use dicom_ulp::listener::ListenerOptions;
//! # use dicom_ulp::verification::VerificationHandler;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let echo = ServerAssociationOptions::new()
//!     .ae_title("ECHO-SCP")
//!     .with_abstract_syntax(dicom_ulp::uids::VERIFICATION);
//! let handle = ListenerOptions::new()
//!     .max_associations(16)
//!     .application(echo, VerificationHandler::default)
//!     .bind("0.0.0.0:11112")
//!     .await?
//!     .spawn();
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use snafu::{ensure, ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::association::server::{receive_association_rq, reject_request};
use crate::association::{
    AcceptAny, AccessControl, AssociationHandler, AssociationState, ServerAssociationOptions,
    StateMachine, Timeouts,
};
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, MAXIMUM_PDU_SIZE,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Could not bind the listening socket
    Bind { source: std::io::Error },

    /// Could not retrieve the local address
    LocalAddress { source: std::io::Error },

    /// No application was configured
    NoApplication,

    /// The listener task failed
    Join { source: tokio::task::JoinError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What to do with a connection
/// arriving while all association slots are taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Reject the association request right away,
    /// as a transient local limit.
    #[default]
    Reject,
    /// Let up to `max_pending` connections wait for a free slot.
    /// Further connections are rejected.
    Queue { max_pending: usize },
}

/// Creates one handler per association.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn AssociationHandler> + Send + Sync>;

/// An application entity served by a listener.
struct Application<A> {
    ae_title: String,
    options: ServerAssociationOptions<'static, A>,
    handlers: HandlerFactory,
}

impl<A> std::fmt::Debug for Application<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("ae_title", &self.ae_title)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Listener`].
#[derive(Debug)]
pub struct ListenerOptions<A = AcceptAny> {
    max_associations: usize,
    max_rejections: usize,
    overflow: OverflowPolicy,
    timeouts: Timeouts,
    applications: HashMap<String, Arc<Application<A>>>,
    default_application: Option<Arc<Application<A>>>,
}

impl<A> Default for ListenerOptions<A> {
    fn default() -> Self {
        ListenerOptions {
            max_associations: 64,
            max_rejections: 16,
            overflow: OverflowPolicy::Reject,
            timeouts: Timeouts::default(),
            applications: HashMap::new(),
            default_application: None,
        }
    }
}

impl ListenerOptions<AcceptAny> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> ListenerOptions<A>
where
    A: AccessControl + Send + Sync + 'static,
{
    /// Set the maximum number of concurrent associations.
    ///
    /// The default is 64.
    pub fn max_associations(mut self, max_associations: usize) -> Self {
        self.max_associations = max_associations;
        self
    }

    /// Set how many connections beyond the association limit
    /// may be waiting for their rejection at once.
    /// Connections arriving past this point are closed
    /// without reading their association request.
    ///
    /// The default is 16.
    pub fn max_rejections(mut self, max_rejections: usize) -> Self {
        self.max_rejections = max_rejections;
        self
    }

    /// Define what happens to connections beyond the association limit.
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Override the timers applied before an association
    /// is routed to an application.
    /// Only the accept timeout is relevant here.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Serve the application entity described by these options,
    /// addressed by their AE title.
    ///
    /// A new handler is created with `handlers` for every association.
    pub fn application<F, H>(mut self, options: ServerAssociationOptions<'static, A>, handlers: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: AssociationHandler + 'static,
    {
        let ae_title = options.get_ae_title().trim().to_string();
        let application = Application {
            ae_title: ae_title.clone(),
            options,
            handlers: boxed_factory(handlers),
        };
        self.applications.insert(ae_title, Arc::new(application));
        self
    }

    /// Serve associations whose called AE title
    /// matches no application with these options.
    ///
    /// Without a default application,
    /// such associations are rejected.
    pub fn default_application<F, H>(
        mut self,
        options: ServerAssociationOptions<'static, A>,
        handlers: F,
    ) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: AssociationHandler + 'static,
    {
        self.default_application = Some(Arc::new(Application {
            ae_title: options.get_ae_title().trim().to_string(),
            options,
            handlers: boxed_factory(handlers),
        }));
        self
    }

    /// Bind the listener to the given address.
    pub async fn bind<T: ToSocketAddrs>(self, address: T) -> Result<Listener<A>> {
        ensure!(
            !self.applications.is_empty() || self.default_application.is_some(),
            NoApplicationSnafu
        );
        let listener = TcpListener::bind(address).await.context(BindSnafu)?;
        let local_addr = listener.local_addr().context(LocalAddressSnafu)?;
        info!(
            "Listening on {} for {} application(s)",
            local_addr,
            self.applications.len() + usize::from(self.default_application.is_some())
        );
        Ok(Listener {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(self.max_associations)),
                max_associations: self.max_associations,
                rejecting: Arc::new(Semaphore::new(self.max_rejections)),
                pending: AtomicUsize::new(0),
                overflow: self.overflow,
                timeouts: self.timeouts,
                applications: self.applications,
                default_application: self.default_application,
            }),
            next_id: AtomicU64::new(1),
        })
    }
}

fn boxed_factory<F, H>(handlers: F) -> HandlerFactory
where
    F: Fn() -> H + Send + Sync + 'static,
    H: AssociationHandler + 'static,
{
    Arc::new(move || Box::new(handlers()) as Box<dyn AssociationHandler>)
}

#[derive(Debug)]
struct Shared<A> {
    semaphore: Arc<Semaphore>,
    max_associations: usize,
    rejecting: Arc<Semaphore>,
    pending: AtomicUsize,
    overflow: OverflowPolicy,
    timeouts: Timeouts,
    applications: HashMap<String, Arc<Application<A>>>,
    default_application: Option<Arc<Application<A>>>,
}

impl<A> Shared<A> {
    fn active_associations(&self) -> usize {
        self.max_associations - self.semaphore.available_permits()
    }

    fn route(&self, called_ae_title: &str) -> Option<&Arc<Application<A>>> {
        self.applications
            .get(called_ae_title.trim())
            .or(self.default_application.as_ref())
    }
}

/// A bound listener, ready to accept associations.
#[derive(Debug)]
pub struct Listener<A = AcceptAny> {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared<A>>,
    next_id: AtomicU64,
}

impl<A> Listener<A>
where
    A: AccessControl + Send + Sync + 'static,
{
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The number of associations currently holding a slot.
    pub fn active_associations(&self) -> usize {
        self.shared.active_associations()
    }

    /// Accept associations until the process ends.
    pub async fn run(self) -> Result<()> {
        let (_shutdown, shutdown_rx) = watch::channel(false);
        self.run_until(shutdown_rx).await
    }

    /// Run the listener in a background task.
    pub fn spawn(self) -> ListenerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let shared = Arc::clone(&self.shared) as Arc<dyn ActiveCount>;
        let task = tokio::spawn(self.run_until(shutdown_rx));
        ListenerHandle {
            local_addr,
            shutdown,
            shared,
            task,
        }
    }

    /// Accept associations until the shutdown signal is set.
    ///
    /// Associations already running are not interrupted.
    async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                // the only change ever sent is the stop signal
                _ = shutdown.changed() => break,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept incoming connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle's algorithm: {}", e);
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("association", id, peer = %peer);
            let shared = Arc::clone(&self.shared);

            match Arc::clone(&shared.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(serve(shared, stream, peer, permit).instrument(span));
                }
                Err(_) => match shared.overflow {
                    OverflowPolicy::Queue { max_pending }
                        if shared.pending.fetch_add(1, Ordering::AcqRel) < max_pending =>
                    {
                        debug!("Association {} from {} queued", id, peer);
                        tokio::spawn(
                            async move {
                                let permit = Arc::clone(&shared.semaphore).acquire_owned().await;
                                shared.pending.fetch_sub(1, Ordering::AcqRel);
                                match permit {
                                    Ok(permit) => serve(shared, stream, peer, permit).await,
                                    Err(_) => debug!("Listener closed before the association started"),
                                }
                            }
                            .instrument(span),
                        );
                    }
                    overflow => {
                        if let OverflowPolicy::Queue { .. } = overflow {
                            shared.pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        match Arc::clone(&shared.rejecting).try_acquire_owned() {
                            Ok(permit) => {
                                warn!(
                                    "Rejecting association from {}: {} associations active",
                                    peer,
                                    shared.active_associations()
                                );
                                tokio::spawn(turn_away(shared, stream, permit).instrument(span));
                            }
                            Err(_) => {
                                warn!("Closing connection from {}: too many rejections under way", peer);
                                drop(stream);
                            }
                        }
                    }
                },
            }
        }
        info!("Listener on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Read the association request of a connection
/// beyond the association limit, and reject it.
async fn turn_away<A>(shared: Arc<Shared<A>>, stream: TcpStream, _permit: OwnedSemaphorePermit) {
    let mut machine = StateMachine::new(
        stream,
        AssociationState::TransportConnecting,
        MAXIMUM_PDU_SIZE,
        false,
    );
    if let Err(e) = receive_association_rq(&mut machine, shared.timeouts.accept).await {
        debug!("No association request: {}", e);
        return;
    }
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    };
    if let Err(e) = reject_request(&mut machine, association_rj).await {
        debug!("Could not send rejection: {}", e);
    }
}

/// Drive one association from its request to its end.
/// The slot is given back when this returns.
async fn serve<A>(
    shared: Arc<Shared<A>>,
    stream: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
) where
    A: AccessControl + Send + Sync + 'static,
{
    // the application is not known yet, so admit any valid PDU size
    let mut machine = StateMachine::new(
        stream,
        AssociationState::TransportConnecting,
        MAXIMUM_PDU_SIZE,
        false,
    );
    let rq = match receive_association_rq(&mut machine, shared.timeouts.accept).await {
        Ok(rq) => rq,
        Err(e) => {
            debug!("No association request: {}", e);
            return;
        }
    };

    let Some(application) = shared.route(&rq.called_ae_title) else {
        warn!("Unknown called AE title `{}`", rq.called_ae_title.trim());
        let association_rj = AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        };
        if let Err(e) = reject_request(&mut machine, association_rj).await {
            debug!("Could not send rejection: {}", e);
        }
        return;
    };
    let application = Arc::clone(application);
    let options = &application.options;
    machine.set_max_receive_pdu_length(options.get_max_pdu_length(), options.is_strict());

    let mut handler = (application.handlers)();
    let association = match options
        .accept_request(machine, rq, Some(peer), &mut handler)
        .await
    {
        Ok(association) => association,
        Err(e) => {
            info!("Association not established: {}", e);
            return;
        }
    };
    match association.run(&mut handler).await {
        Ok(()) => debug!("Association ended"),
        Err(e) => debug!("Association ended with error: {}", e),
    }
}

trait ActiveCount: Send + Sync {
    fn active(&self) -> usize;
}

impl<A: Send + Sync> ActiveCount for Shared<A> {
    fn active(&self) -> usize {
        self.active_associations()
    }
}

/// A listener running in a background task.
///
/// Dropping the handle stops the listener
/// as if [`shutdown`](Self::shutdown) was called.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    shared: Arc<dyn ActiveCount>,
    task: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The number of associations currently holding a slot.
    pub fn active_associations(&self) -> usize {
        self.shared.active()
    }

    /// Stop accepting connections and wait for the listener task to finish.
    /// Running associations carry on until they end.
    pub async fn shutdown(self) -> Result<()> {
        // the task may have stopped already
        let _ = self.shutdown.send(true);
        self.task.await.context(JoinSnafu)?
    }
}
