//! Transport contract required by the routing core.
//!
//! The core never opens sockets itself; it only needs a way to send an
//! envelope, to send one and block for the reply, and to register handlers
//! for incoming tags. Concrete transports (raw sockets, connection pools,
//! in-process emulation) live outside the core; [mem] ships an in-process
//! implementation used by the integration tests.

pub mod mem;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Envelope, Tag};
use crate::Result;

/// Floor for adaptive timeouts so a single fast round trip cannot collapse
/// the budget to nothing.
const MIN_ADAPTIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// Handles one incoming envelope, optionally producing a synchronous reply.
pub trait Handler: Send + Sync {
    fn handle(&self, from: SocketAddr, envelope: Envelope) -> Option<Envelope>;
}

/// The send/send-and-receive abstraction the routing core is built on.
pub trait Transport: Send + Sync {
    /// The address peers can reach this endpoint at.
    fn local_addr(&self) -> SocketAddr;

    /// Fire-and-forget delivery of one envelope.
    fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<()>;

    /// Deliver one envelope and block until the peer's synchronous reply
    /// arrives or the timeout elapses.
    fn send_and_receive(
        &self,
        to: SocketAddr,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope>;

    /// Register the handler invoked for incoming envelopes with this tag.
    fn register_handler(&self, tag: Tag, handler: Arc<dyn Handler>);

    /// Current round-trip-time estimate for a destination, if one has been
    /// measured.
    fn estimated_rtt(&self, to: SocketAddr) -> Option<Duration>;
}

/// Effective request timeout for a destination: a multiple of the measured
/// round trip when one exists, the configured base otherwise.
pub fn adaptive_timeout(transport: &dyn Transport, to: SocketAddr, base: Duration) -> Duration {
    match transport.estimated_rtt(to) {
        Some(rtt) => (rtt * 4).clamp(MIN_ADAPTIVE_TIMEOUT, base),
        None => base,
    }
}
