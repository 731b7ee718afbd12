//! Bidirectional channels carrying operation envelopes.
//!
//! The isolation channel is an abstraction, not a transport: anything that
//! moves length-framed envelopes (plus their fd tables) in both directions
//! satisfies it. Production uses a Unix socketpair to a detached host
//! process; unit tests use an in-memory loopback. Proxy and host code, and
//! the test suite, are written against the [`Channel`] trait only.

mod loopback;
mod unix;

pub use loopback::LoopbackChannel;
pub use unix::UnixChannel;

use crate::envelope::WireFrame;
use crate::error::Result;
use std::os::fd::RawFd;
use std::time::Duration;

/// Most fds one frame may carry.
///
/// The kernel caps `SCM_RIGHTS` at 253 descriptors per message; transports
/// that pass fds out of process reject larger tables with a per-frame error
/// rather than severing the channel.
pub const MAX_FDS_PER_FRAME: usize = 253;

/// A bidirectional, non-blocking envelope transport.
///
/// Error semantics: `PeerUnavailable` means the peer is gone or the channel
/// is broken; `MalformedEnvelope` means inbound bytes failed framing or
/// decode. `Ok(None)` from the receive calls means no complete frame was
/// available (yet).
pub trait Channel: Send {
    /// Queue one framed envelope for delivery.
    ///
    /// Never blocks. If the transport cannot accept the frame immediately
    /// it is buffered up to a bounded limit; overflow fails with
    /// `PeerUnavailable`. Fd-passing transports reject frames with more
    /// than [`MAX_FDS_PER_FRAME`] fds as `MalformedEnvelope`, leaving the
    /// channel intact.
    fn send_frame(&mut self, frame: WireFrame) -> Result<()>;

    /// Take one complete inbound frame without blocking.
    fn try_recv_frame(&mut self) -> Result<Option<WireFrame>>;

    /// Wait up to `timeout` for one complete inbound frame.
    fn recv_frame_timeout(&mut self, timeout: Duration) -> Result<Option<WireFrame>>;

    /// File descriptor to poll for inbound readiness, if the transport has
    /// one.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Sever the channel. Subsequent operations fail with
    /// `PeerUnavailable`; the peer observes the closure.
    fn close(&mut self);
}
