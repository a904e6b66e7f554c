//! The serverlist: single source of truth for backends and tickets
//!
//! All state of one application lives here: the backend map, the FIFO
//! admission queue of clients waiting for a ticket, and the fan-out channels
//! informing the autoscaler and the metrics updater. Every operation is
//! thread-safe behind one mutex; per-backend and per-ticket state has its own
//! lock below it (lock order is always serverlist, then backend, then ticket).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::BackendConfig;
use crate::error::Error;
use crate::ticket::{generate_token, Ticket, TICKET_INTERVAL};

/// Buffer size of informer fan-out channels. Consumers recompute from
/// scratch on every event, so overflow only delays them until the next one.
const INFORMER_BUFFER: usize = 16;

/// Events fanned out to informer channels on serverlist changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerEvent {
    /// A ticket was issued to a waiting client
    NewTicket,
    /// A ticket expired and was removed
    DeleteTicket,
    /// Configuration changed; consumers should re-evaluate headroom
    Update,
}

impl std::fmt::Display for InformerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InformerEvent::NewTicket => write!(f, "new ticket"),
            InformerEvent::DeleteTicket => write!(f, "delete ticket"),
            InformerEvent::Update => write!(f, "update"),
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Arc<Ticket>>,
}

struct ListState {
    servers: HashMap<String, Arc<Backend>>,
    queue: VecDeque<Waiter>,
    informers: Vec<mpsc::Sender<InformerEvent>>,
    next_waiter_id: u64,
}

/// Concurrent registry of backends, tickets, and the admission queue of one
/// application.
///
/// Designed to be shared behind an `Arc`; [`new`](Serverlist::new) returns
/// `Arc<Self>` directly to enforce this pattern.
pub struct Serverlist {
    prefix: String,
    state: Mutex<ListState>,
}

/// Handle held by a client waiting in the admission queue.
///
/// The waiter owns a single-shot reply slot: it is delivered exactly one
/// ticket, or it is cancelled by being dropped, never both. Dropping the
/// waiter removes its slot from the queue under the serverlist lock, so the
/// admission pump never delivers to an abandoned client.
pub struct TicketWaiter {
    id: u64,
    rx: oneshot::Receiver<Arc<Ticket>>,
    list: Arc<Serverlist>,
}

impl TicketWaiter {
    /// Wait for a ticket. Returns `None` when the serverlist shuts down
    /// before one could be issued.
    pub async fn recv(&mut self) -> Option<Arc<Ticket>> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for TicketWaiter {
    fn drop(&mut self) {
        self.list.remove_waiter(self.id);
    }
}

impl Serverlist {
    pub fn new(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            state: Mutex::new(ListState {
                servers: HashMap::new(),
                queue: VecDeque::new(),
                informers: Vec::new(),
                next_waiter_id: 0,
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a new backend. Runs the deletion sweep first (a drained
    /// backend of the same name may be removable by now), then the admission
    /// pump (the new backend may satisfy waiting clients).
    pub fn add_server(
        &self,
        name: impl Into<String>,
        max_tickets: usize,
        config: BackendConfig,
    ) -> Result<(), Error> {
        self.sweep();
        let name = name.into();
        {
            let mut state = self.state.lock();
            if state.servers.contains_key(&name) {
                return Err(Error::AlreadyExists(name));
            }
            info!(name = %name, host = %config.host, path = %config.path, "Adding server");
            let backend = Arc::new(Backend::new(name.clone(), max_tickets, config));
            state.servers.insert(name, backend);
        }
        self.pump();
        Ok(())
    }

    /// Mark a backend for deletion. It stops issuing tickets immediately and
    /// is removed by the deletion sweep once its last ticket is gone.
    /// Idempotent after the first call.
    pub fn set_server_deletion(&self, name: &str) -> Result<(), Error> {
        let backend = {
            let state = self.state.lock();
            state
                .servers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };
        backend.disallow_use();
        self.sweep();
        Ok(())
    }

    /// Update the ticket cap on every backend. Existing tickets above a
    /// lowered cap drain naturally; subsequent admissions see the new cap.
    pub fn change_all_max_tickets(&self, max_tickets: usize) {
        let state = self.state.lock();
        for backend in state.servers.values() {
            backend.set_max_tickets(max_tickets);
        }
    }

    /// Free slots over all backends still accepting tickets.
    pub fn available_tickets(&self) -> usize {
        let state = self.state.lock();
        state.servers.values().map(|b| b.free_slots()).sum()
    }

    /// Total tickets currently outstanding, drained backends included.
    pub fn ticket_count(&self) -> usize {
        let state = self.state.lock();
        state.servers.values().map(|b| b.ticket_count()).sum()
    }

    pub fn server(&self, name: &str) -> Option<Arc<Backend>> {
        self.state.lock().servers.get(name).cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.state.lock().servers.keys().cloned().collect()
    }

    /// Join the admission queue. The returned waiter receives exactly one
    /// ticket; dropping it abandons the spot.
    pub fn enqueue_request(self: &Arc<Self>) -> TicketWaiter {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.queue.push_back(Waiter { id, tx });
            debug!(queued = state.queue.len(), "Client waiting for ticket");
            id
        };
        self.pump();
        TicketWaiter {
            id,
            rx,
            list: Arc::clone(self),
        }
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.state.lock();
        state.queue.retain(|w| w.id != id);
    }

    /// Register a fan-out channel receiving an [`InformerEvent`] for every
    /// ticket issued or expired (and configuration updates).
    pub fn add_informer_channel(&self) -> mpsc::Receiver<InformerEvent> {
        let (tx, rx) = mpsc::channel(INFORMER_BUFFER);
        self.state.lock().informers.push(tx);
        rx
    }

    /// Broadcast a configuration-change event to all informers.
    pub fn notify_update(&self) {
        let mut state = self.state.lock();
        Self::notify_locked(&mut state, InformerEvent::Update);
    }

    /// Drop all informer senders; consumers observe end-of-stream.
    pub fn close_informers(&self) {
        self.state.lock().informers.clear();
    }

    fn notify_locked(state: &mut ListState, event: InformerEvent) {
        state.informers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(event = %event, "Informer channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Allocate a ticket on the first backend that can admit one, with a
    /// serverlist-unique token. Returns `None` when no backend has capacity.
    fn allocate_locked(state: &mut ListState) -> Option<Arc<Ticket>> {
        let target = state
            .servers
            .values()
            .find(|backend| backend.can_admit())?
            .clone();
        let token = loop {
            let candidate = generate_token();
            if !state.servers.values().any(|b| b.has_token(&candidate)) {
                break candidate;
            }
            warn!(token = %candidate, "Token collision, regenerating");
        };
        let ticket = Arc::new(Ticket::new(token, target.name().to_string()));
        if target.insert_ticket(ticket.clone()) {
            Some(ticket)
        } else {
            None
        }
    }

    /// The admission pump: issue tickets to waiting clients for as long as
    /// both a waiter and a free slot exist. A waiter that vanished between
    /// queue removal and delivery is skipped; its ticket goes to the next
    /// waiter, or back to the backend when the queue drained out.
    fn pump(&self) {
        loop {
            let mut state = self.state.lock();
            if state.queue.is_empty() {
                return;
            }
            debug!(queued = state.queue.len(), "Clients waiting for a ticket");
            let Some(ticket) = Self::allocate_locked(&mut state) else {
                debug!("No free slots for waiting clients");
                return;
            };

            let mut delivered = false;
            while let Some(waiter) = state.queue.pop_front() {
                match waiter.tx.send(ticket.clone()) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    // the waiting client went away; try the next one
                    Err(_) => continue,
                }
            }

            if delivered {
                info!(
                    token = %ticket.token(),
                    backend = %ticket.backend_name(),
                    "Ticket issued"
                );
                Self::notify_locked(&mut state, InformerEvent::NewTicket);
            } else {
                if let Some(backend) = state.servers.get(ticket.backend_name()) {
                    backend.remove_ticket(ticket.token());
                }
                return;
            }
        }
    }

    /// Remove every backend that is marked for deletion and holds no
    /// tickets.
    fn sweep(&self) {
        let mut state = self.state.lock();
        state.servers.retain(|name, backend| {
            if backend.use_allowed() {
                return true;
            }
            if backend.has_no_tickets() {
                info!(name = %name, "Deleting server");
                false
            } else {
                debug!(name = %name, "Server marked for deletion, but occupied");
                true
            }
        });
    }

    /// Expire tickets whose lease went stale and fan out one
    /// [`InformerEvent::DeleteTicket`] per removal.
    fn expire_idle_tickets(&self) {
        let mut state = self.state.lock();
        let mut removed = 0;
        for backend in state.servers.values() {
            removed += backend.remove_idle_tickets(TICKET_INTERVAL);
        }
        for _ in 0..removed {
            Self::notify_locked(&mut state, InformerEvent::DeleteTicket);
        }
    }

    /// The ticket watchdog: every [`TICKET_INTERVAL`] it expires stale
    /// tickets, sweeps removable backends, and re-runs the admission pump.
    /// Exits when the stop signal fires.
    pub async fn run_ticket_watchdog(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICKET_INTERVAL) => {
                    self.expire_idle_tickets();
                    self.sweep();
                    self.pump();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(prefix = %self.prefix, "Ticket watchdog exiting");
                        return;
                    }
                }
            }
        }
    }
}
