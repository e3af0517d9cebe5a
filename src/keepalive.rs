//! Keep-alive liveness state.
//!
//! One ping may be outstanding per connection at a time. Replying to a
//! received ping is stateless; only the pinging side tracks anything. The id
//! is scoped to the connection - a v4 UUID minted at creation plus a running
//! counter - so concurrent connections never collide.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::message::Control;

#[derive(Debug)]
pub struct KeepAlive {
    lapse: Duration,
    conn_id: String,
    sent: u64,
    outstanding: bool,
}

impl KeepAlive {
    pub fn new(lapse: Duration) -> Self {
        Self {
            lapse,
            conn_id: Uuid::new_v4().simple().to_string(),
            sent: 0,
            outstanding: false,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.lapse.is_zero()
    }

    pub fn outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// A ping is due when enabled, none is outstanding, and the connection
    /// has been idle for at least the lapse.
    pub fn due(&self, last_action: Instant, now: Instant) -> bool {
        self.enabled() && !self.outstanding && now.duration_since(last_action) >= self.lapse
    }

    /// Build the next ping and mark it outstanding.
    pub fn next_ping(&mut self) -> Control {
        self.sent += 1;
        self.outstanding = true;
        Control::KeepAlive {
            id: format!("{}/{}", self.conn_id, self.sent),
            ping: true,
        }
    }

    /// Stateless reply for a received ping.
    pub fn pong(id: String) -> Control {
        Control::KeepAlive { id, ping: false }
    }

    /// A pong arrived; the ping is no longer outstanding.
    pub fn observe_pong(&mut self) {
        self.outstanding = false;
    }
}
