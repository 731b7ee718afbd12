//! In-memory loopback channel using kanal queues.
//!
//! Carries framed envelopes between two ends of the same process. Used by
//! the test suite in place of a real socket, and exercises the same codec:
//! frames cross as bytes plus an fd table, exactly as on a socket.

use super::Channel;
use crate::envelope::WireFrame;
use crate::error::{Error, Result};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// One end of an in-process envelope channel.
pub struct LoopbackChannel {
    tx: Option<kanal::Sender<WireFrame>>,
    rx: Option<kanal::Receiver<WireFrame>>,
}

impl LoopbackChannel {
    /// Create a connected pair of channel ends.
    ///
    /// `capacity` bounds each direction; a full queue fails the send with
    /// `PeerUnavailable`, mirroring the overflow policy of the socket
    /// transport.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = kanal::bounded(capacity);
        let (b_tx, b_rx) = kanal::bounded(capacity);
        (
            Self {
                tx: Some(a_tx),
                rx: Some(b_rx),
            },
            Self {
                tx: Some(b_tx),
                rx: Some(a_rx),
            },
        )
    }
}

impl Channel for LoopbackChannel {
    fn send_frame(&mut self, frame: WireFrame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::PeerUnavailable)?;
        match tx.try_send(frame) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!("loopback channel full, dropping peer");
                Err(Error::PeerUnavailable)
            }
            Err(_) => Err(Error::PeerUnavailable),
        }
    }

    fn try_recv_frame(&mut self) -> Result<Option<WireFrame>> {
        let rx = self.rx.as_ref().ok_or(Error::PeerUnavailable)?;
        match rx.try_recv() {
            Ok(frame) => Ok(frame),
            Err(_) => Err(Error::PeerUnavailable),
        }
    }

    fn recv_frame_timeout(&mut self, timeout: Duration) -> Result<Option<WireFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_recv_frame()? {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_micros(500));
        }
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx = None;
    }
}
