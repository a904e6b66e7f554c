//! Ticket records and token generation
//!
//! A ticket is a slot reservation on a specific backend. It stays valid as
//! long as client traffic keeps refreshing its lease; the ticket watchdog
//! removes tickets whose lease has gone stale.

use parking_lot::Mutex;
use tokio::time::Instant;

use std::time::Duration;

/// Lease interval: a ticket not refreshed within this window is expired.
/// Also the tick period of the ticket watchdog.
pub const TICKET_INTERVAL: Duration = Duration::from_secs(3);

/// Generate an opaque 8-hex-character token like `31f4ef3d`.
///
/// Tokens identify tickets within one serverlist; the allocator regenerates
/// on the (entropy-bounded) chance of a collision.
pub fn generate_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// A slot reservation on a backend.
///
/// The backend is referenced by name rather than by pointer so that a dead
/// backend is never kept alive by stale tickets; request dispatch resolves
/// the name through the serverlist.
pub struct Ticket {
    token: String,
    backend_name: String,
    last_used: Mutex<Instant>,
}

impl Ticket {
    pub fn new(token: String, backend_name: String) -> Self {
        Self {
            token,
            backend_name,
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Refresh the lease. `last_used` only ever moves forward.
    pub fn touch(&self) {
        let mut last_used = self.last_used.lock();
        let now = Instant::now();
        if now > *last_used {
            *last_used = now;
        }
    }

    /// Time since the last lease refresh.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_differ() {
        // 32 bits of entropy; 16 draws colliding would mean a broken RNG
        let tokens: std::collections::HashSet<String> =
            (0..16).map(|_| generate_token()).collect();
        assert!(tokens.len() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_advances_lease() {
        let ticket = Ticket::new("deadbeef".to_string(), "p1".to_string());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(ticket.idle_for() >= Duration::from_secs(5));

        ticket.touch();
        assert!(ticket.idle_for() < Duration::from_secs(1));
    }
}
