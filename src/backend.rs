//! Backend records: per-replica slot accounting
//!
//! A backend represents one running replica pod. It holds a bounded set of
//! tickets and a routing configuration frozen at construction time; changing
//! the routing requires destroying and recreating the backend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::config::BackendConfig;
use crate::ticket::Ticket;

/// One replica pod as seen by the serverlist.
pub struct Backend {
    name: String,
    config: BackendConfig,
    inner: Mutex<BackendInner>,
}

struct BackendInner {
    max_tickets: usize,
    use_allowed: bool,
    last_used: Instant,
    tickets: HashMap<String, Arc<Ticket>>,
}

impl Backend {
    pub fn new(name: String, max_tickets: usize, config: BackendConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BackendInner {
                max_tickets,
                use_allowed: true,
                last_used: Instant::now(),
                tickets: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing configuration, immutable for the backend's lifetime.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn max_tickets(&self) -> usize {
        self.inner.lock().max_tickets
    }

    /// Change the ticket cap. Existing tickets above a lowered cap are not
    /// evicted; they drain naturally while admissions see the new cap.
    pub fn set_max_tickets(&self, max_tickets: usize) {
        self.inner.lock().max_tickets = max_tickets;
    }

    pub fn use_allowed(&self) -> bool {
        self.inner.lock().use_allowed
    }

    /// Put the backend into the draining state: existing tickets stay valid,
    /// no new tickets are issued.
    pub fn disallow_use(&self) {
        self.inner.lock().use_allowed = false;
    }

    /// Refresh the backend's activity timestamp.
    pub fn touch(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if now > inner.last_used {
            inner.last_used = now;
        }
    }

    /// Time since the backend last saw client activity.
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_used.elapsed()
    }

    pub fn ticket_count(&self) -> usize {
        self.inner.lock().tickets.len()
    }

    pub fn has_no_tickets(&self) -> bool {
        self.inner.lock().tickets.is_empty()
    }

    /// Free slots this backend contributes to the admission pool. Zero while
    /// draining, and saturating when the cap was lowered below current usage.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock();
        if !inner.use_allowed {
            return 0;
        }
        inner.max_tickets.saturating_sub(inner.tickets.len())
    }

    /// Whether a new ticket may be issued right now.
    pub fn can_admit(&self) -> bool {
        let inner = self.inner.lock();
        inner.use_allowed && inner.tickets.len() < inner.max_tickets
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.inner.lock().tickets.contains_key(token)
    }

    pub fn find_ticket(&self, token: &str) -> Option<Arc<Ticket>> {
        self.inner.lock().tickets.get(token).cloned()
    }

    /// Register a freshly allocated ticket. Returns false when the backend
    /// cannot admit (drained or full); the caller must then discard the
    /// ticket and retry elsewhere.
    pub(crate) fn insert_ticket(&self, ticket: Arc<Ticket>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.use_allowed || inner.tickets.len() >= inner.max_tickets {
            return false;
        }
        inner.tickets.insert(ticket.token().to_string(), ticket);
        true
    }

    pub(crate) fn remove_ticket(&self, token: &str) -> Option<Arc<Ticket>> {
        self.inner.lock().tickets.remove(token)
    }

    /// Drop every ticket whose lease is older than `ttl`; returns how many
    /// were removed.
    pub(crate) fn remove_idle_tickets(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.tickets.len();
        inner.tickets.retain(|token, ticket| {
            let keep = ticket.idle_for() <= ttl;
            if !keep {
                info!(token = %token, "Deleting expired ticket");
            }
            keep
        });
        before - inner.tickets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::generate_token;

    fn test_backend(max_tickets: usize) -> Backend {
        Backend::new(
            "p1".to_string(),
            max_tickets,
            BackendConfig {
                host: "10.0.0.5:80".to_string(),
                path: "/".to_string(),
            },
        )
    }

    fn issue(backend: &Backend) -> Arc<Ticket> {
        let ticket = Arc::new(Ticket::new(generate_token(), backend.name().to_string()));
        assert!(backend.insert_ticket(ticket.clone()));
        ticket
    }

    #[tokio::test]
    async fn test_slot_accounting() {
        let backend = test_backend(2);
        assert_eq!(backend.free_slots(), 2);
        assert!(backend.can_admit());

        let t1 = issue(&backend);
        assert_eq!(backend.free_slots(), 1);

        let _t2 = issue(&backend);
        assert_eq!(backend.free_slots(), 0);
        assert!(!backend.can_admit());

        // over capacity is refused
        let extra = Arc::new(Ticket::new(generate_token(), "p1".to_string()));
        assert!(!backend.insert_ticket(extra));
        assert_eq!(backend.ticket_count(), 2);

        backend.remove_ticket(t1.token());
        assert_eq!(backend.free_slots(), 1);
    }

    #[tokio::test]
    async fn test_draining_backend_admits_nothing() {
        let backend = test_backend(2);
        let t1 = issue(&backend);

        backend.disallow_use();
        assert!(!backend.can_admit());
        assert_eq!(backend.free_slots(), 0);

        let refused = Arc::new(Ticket::new(generate_token(), "p1".to_string()));
        assert!(!backend.insert_ticket(refused));

        // the existing ticket keeps being served
        assert!(backend.find_ticket(t1.token()).is_some());
    }

    #[tokio::test]
    async fn test_lowered_cap_saturates() {
        let backend = test_backend(3);
        issue(&backend);
        issue(&backend);

        backend.set_max_tickets(1);
        // nothing is evicted, but no free slots are reported either
        assert_eq!(backend.ticket_count(), 2);
        assert_eq!(backend.free_slots(), 0);
        assert!(!backend.can_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ticket_removal() {
        let backend = test_backend(2);
        let t1 = issue(&backend);
        let _t2 = issue(&backend);

        tokio::time::advance(Duration::from_secs(4)).await;
        t1.touch();

        let removed = backend.remove_idle_tickets(Duration::from_secs(3));
        assert_eq!(removed, 1);
        assert!(backend.find_ticket(t1.token()).is_some());
    }
}
