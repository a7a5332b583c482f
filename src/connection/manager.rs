//! Connection manager
//!
//! Setting up a connection is a strictly ordered sequence:
//!
//! 1. reserve the connection slot (`AlreadyExists` if taken)
//! 2. fetch the provider's proposals and select one
//! 3. open a dialog to the selected contact
//! 4. negotiate a session over the dialog
//! 5. build the tunnel for the session, wired to a fresh event channel
//! 6. start the tunnel
//! 7. install the connection and spawn its relay task
//!
//! Nothing is installed before step 7, so a failing step only has to undo
//! what the same attempt acquired: after step 3 that is closing the dialog.
//! The reservation and the open dialog are held in drop guards, so an
//! attempt whose future is dropped mid-setup releases them too.
//!
//! The relay task turns tunnel events into status changes. It is the only
//! place that releases an installed connection, which happens when the
//! tunnel reports `Exiting` or drops its event channel.

use super::{ConnectionError, ConnectionStatus};
use crate::communication::{Dialog, DialogEstablisher};
use crate::discovery::{FirstProposal, ProposalResolver, ProposalSelector, Selection};
use crate::identity::Identity;
use crate::session::request_session_create;
use crate::stats::SessionStatsKeeper;
use crate::tunnel::{Tunnel, TunnelEventSink, TunnelFactory, TunnelState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Builds the dialog establisher acting as the given local identity
pub type DialogEstablisherFactory =
    Arc<dyn Fn(&Identity) -> Box<dyn DialogEstablisher> + Send + Sync>;

const EVENT_BUFFER: usize = 16;

struct Connection {
    id: u64,
    dialog: Arc<dyn Dialog>,
    tunnel: Arc<dyn Tunnel>,
    stop_requested: bool,
}

enum Slot {
    Empty,
    /// A `connect` call is setting up
    Reserved,
    Active(Connection),
}

struct Shared {
    slot: Slot,
    status: ConnectionStatus,
}

impl Shared {
    fn owns(&self, connection_id: u64) -> bool {
        matches!(&self.slot, Slot::Active(connection) if connection.id == connection_id)
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slot reservation of an in-flight `connect`.
///
/// Dropping it while the slot is still reserved frees the slot and
/// publishes `NotConnected`.
struct Reservation<'a> {
    shared: &'a Mutex<Shared>,
}

impl<'a> Reservation<'a> {
    fn acquire(shared: &'a Mutex<Shared>) -> Result<Self, ConnectionError> {
        let mut current = lock(shared);
        if !matches!(current.slot, Slot::Empty) {
            return Err(ConnectionError::AlreadyExists);
        }
        current.slot = Slot::Reserved;
        current.status = ConnectionStatus::connecting();
        Ok(Self { shared })
    }

    fn fulfil(self, connection: Connection) {
        lock(self.shared).slot = Slot::Active(connection);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut current = lock(self.shared);
        if matches!(current.slot, Slot::Reserved) {
            current.slot = Slot::Empty;
            current.status = ConnectionStatus::not_connected();
        }
    }
}

/// Dialog opened by an in-flight `connect`; closed in the background if
/// the attempt is dropped before handing it over
struct PendingDialog {
    dialog: Arc<dyn Dialog>,
    armed: bool,
}

impl PendingDialog {
    fn new(dialog: Box<dyn Dialog>) -> Self {
        Self {
            dialog: Arc::from(dialog),
            armed: true,
        }
    }

    fn get(&self) -> &dyn Dialog {
        self.dialog.as_ref()
    }

    /// Closes the dialog after a failed setup step
    async fn close(mut self) {
        self.armed = false;
        close_after_failure(self.dialog.as_ref()).await;
    }

    fn hand_over(mut self) -> Arc<dyn Dialog> {
        self.armed = false;
        self.dialog.clone()
    }
}

impl Drop for PendingDialog {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let dialog = self.dialog.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Connect abandoned, closing dialog with {}", dialog.peer_id());
                runtime.spawn(async move { close_after_failure(dialog.as_ref()).await });
            }
            Err(_) => warn!("Dialog with {} dropped without closing", dialog.peer_id()),
        }
    }
}

/// Resources acquired by a successful setup, not yet installed
struct Established {
    dialog: Arc<dyn Dialog>,
    tunnel: Box<dyn Tunnel>,
    session_id: String,
    events: mpsc::Receiver<TunnelState>,
}

pub struct ConnectionManager {
    resolver: Arc<dyn ProposalResolver>,
    new_dialog_establisher: DialogEstablisherFactory,
    new_tunnel: TunnelFactory,
    stats_keeper: Arc<dyn SessionStatsKeeper>,
    selector: Box<dyn ProposalSelector>,
    shared: Arc<Mutex<Shared>>,
    next_connection_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        resolver: Arc<dyn ProposalResolver>,
        new_dialog_establisher: DialogEstablisherFactory,
        new_tunnel: TunnelFactory,
        stats_keeper: Arc<dyn SessionStatsKeeper>,
    ) -> Self {
        Self {
            resolver,
            new_dialog_establisher,
            new_tunnel,
            stats_keeper,
            selector: Box::new(FirstProposal),
            shared: Arc::new(Mutex::new(Shared {
                slot: Slot::Empty,
                status: ConnectionStatus::not_connected(),
            })),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Replaces the default pick-first proposal selection
    pub fn with_selector(mut self, selector: impl ProposalSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Last published status; never blocks on I/O
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared).status.clone()
    }

    /// Connects `caller` to the provider `provider`.
    ///
    /// Returns once the tunnel process has started; reaching `Connected` is
    /// reported later through [`status`](Self::status).
    pub async fn connect(&self, caller: &Identity, provider: &Identity) -> Result<(), ConnectionError> {
        let reservation = Reservation::acquire(&self.shared)?;

        info!("Connecting {} to {}", caller, provider);
        match self.establish(caller, provider).await {
            Ok(established) => {
                self.install(reservation, established);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", provider, e);
                drop(reservation);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        caller: &Identity,
        provider: &Identity,
    ) -> Result<Established, ConnectionError> {
        let proposals = self
            .resolver
            .find_proposals(provider)
            .await
            .map_err(ConnectionError::Discovery)?;
        if proposals.is_empty() {
            return Err(ConnectionError::NoProposals);
        }
        let Selection { proposal, contact } = self
            .selector
            .select(&proposals)
            .ok_or(ConnectionError::NoContacts)?;
        debug!("Selected proposal {} with {} contact", proposal.id, contact.kind);

        let establisher = (self.new_dialog_establisher)(caller);
        let dialog = establisher
            .create_dialog(provider, &contact)
            .await
            .map_err(ConnectionError::Dialog)?;
        let dialog = PendingDialog::new(dialog);

        let negotiated = request_session_create(dialog.get(), proposal.id).await;
        let session = match negotiated {
            Ok(session) => session,
            Err(e) => {
                dialog.close().await;
                return Err(ConnectionError::SessionNegotiation(e));
            }
        };

        let (events, receiver) = TunnelEventSink::channel(EVENT_BUFFER);
        let tunnel = match (self.new_tunnel)(&session, caller, events) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                dialog.close().await;
                return Err(ConnectionError::TunnelStart(e));
            }
        };

        let started = tunnel.start().await;
        if let Err(e) = started {
            dialog.close().await;
            return Err(ConnectionError::TunnelStart(e));
        }

        Ok(Established {
            dialog: dialog.hand_over(),
            tunnel,
            session_id: session.id,
            events: receiver,
        })
    }

    fn install(&self, reservation: Reservation<'_>, established: Established) {
        let Established {
            dialog,
            tunnel,
            session_id,
            events,
        } = established;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        reservation.fulfil(Connection {
            id: connection_id,
            dialog,
            tunnel: Arc::from(tunnel),
            stop_requested: false,
        });
        info!("Tunnel started for session {}", session_id);

        tokio::spawn(relay_events(
            self.shared.clone(),
            self.stats_keeper.clone(),
            connection_id,
            session_id,
            events,
        ));
    }

    /// Stops the tunnel and closes the dialog.
    ///
    /// Both steps are attempted even if the first fails; the first error is
    /// returned. The connection is released once the tunnel reports its exit.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (tunnel, dialog) = {
            let mut shared = lock(&self.shared);
            let Slot::Active(connection) = &mut shared.slot else {
                return Err(ConnectionError::NoConnection);
            };
            if connection.stop_requested {
                debug!("Disconnect already requested");
                return Ok(());
            }
            connection.stop_requested = true;
            let handles = (connection.tunnel.clone(), connection.dialog.clone());
            shared.status = ConnectionStatus::disconnecting();
            handles
        };

        info!("Disconnecting from {}", dialog.peer_id());
        let stopped = tunnel.stop().await.map_err(ConnectionError::TunnelStop);
        if let Err(e) = &stopped {
            warn!("{} (closing dialog anyway)", e);
        }
        let closed = dialog.close().await.map_err(ConnectionError::DialogClose);
        if let Err(e) = &closed {
            warn!("{}", e);
        }
        stopped.and(closed)
    }

    /// Waits for the live tunnel process to exit; returns at once if there
    /// is no connection
    pub async fn wait(&self) -> Result<(), ConnectionError> {
        let tunnel = match &lock(&self.shared).slot {
            Slot::Active(connection) => connection.tunnel.clone(),
            _ => return Ok(()),
        };
        tunnel.wait().await.map_err(ConnectionError::TunnelExit)
    }
}

async fn close_after_failure(dialog: &dyn Dialog) {
    if let Err(e) = dialog.close().await {
        warn!("Failed to close dialog with {}: {}", dialog.peer_id(), e);
    }
}

async fn relay_events(
    shared: Arc<Mutex<Shared>>,
    stats_keeper: Arc<dyn SessionStatsKeeper>,
    connection_id: u64,
    session_id: String,
    mut events: mpsc::Receiver<TunnelState>,
) {
    let mut session_started = false;

    while let Some(event) = events.recv().await {
        debug!("Tunnel event {:?} for session {}", event, session_id);

        let status = match event {
            TunnelState::Exiting => break,
            TunnelState::Connecting => ConnectionStatus::connecting(),
            TunnelState::Connected => {
                if !session_started {
                    session_started = true;
                    stats_keeper.mark_session_start();
                }
                ConnectionStatus::connected(&session_id)
            }
            TunnelState::Reconnecting if session_started => {
                ConnectionStatus::reconnecting(&session_id)
            }
            TunnelState::Reconnecting => ConnectionStatus::reconnecting(""),
        };

        lock(&shared).status = status;
    }
    events.close();

    let mut current = lock(&shared);
    if current.owns(connection_id) {
        current.slot = Slot::Empty;
        current.status = ConnectionStatus::not_connected();
        info!("Connection for session {} closed", session_id);
    }
}
