//! The Algorithm Capability Interface.
//!
//! [`IpaInterface`] is the abstract contract a pipeline handler uses to
//! drive an algorithm module, independent of where the module executes. Both
//! execution proxies implement it with identical semantics; the pipeline
//! handler never needs to know whether calls cross a process boundary.

use crate::buffer::BufferHandle;
use crate::controls::{EntityControlMap, StreamConfigMap};
use crate::envelope::OperationData;
use crate::error::Result;
use std::sync::{Arc, Mutex};

/// Frame number carried by outbound frame-action notifications.
pub type FrameNumber = u32;

/// Contract every algorithm variant must implement.
///
/// Lifecycle: `init` → `configure` → {`map_buffers` ⇄ `unmap_buffers`}* →
/// `process_event`* → teardown. Exactly one instance exists per active
/// camera session; no operation is valid before `init` completes
/// successfully.
pub trait IpaInterface: Send {
    /// One-time setup. A second call fails with `AlreadyInitialized`.
    fn init(&mut self) -> Result<()>;

    /// Replace any prior configuration.
    ///
    /// May be called multiple times across the session (mode switch). Any
    /// buffer mappings from the previous configuration are dropped; buffers
    /// must be re-mapped explicitly.
    fn configure(
        &mut self,
        streams: &StreamConfigMap,
        entity_controls: &EntityControlMap,
    ) -> Result<()>;

    /// Grant the algorithm access to the listed buffers.
    ///
    /// Ids must be unique among currently-mapped buffers, else the whole
    /// batch fails with `DuplicateBuffer`.
    fn map_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()>;

    /// Revoke access to the listed buffer ids.
    ///
    /// Unknown ids are skipped without aborting the batch; the first one is
    /// reported as `UnknownBuffer`.
    fn unmap_buffers(&mut self, ids: &[u32]) -> Result<()>;

    /// Deliver one inbound event. Never blocks the calling thread on I/O.
    fn process_event(&mut self, data: &OperationData) -> Result<()>;

    /// The outbound frame-action notification hub for this instance.
    fn frame_actions(&self) -> &FrameActions;
}

/// Fan-out dispatcher for algorithm-initiated frame actions.
///
/// Multiple subscribers may observe the stream; delivery order is
/// non-decreasing in frame number for a given instance. A notification that
/// would regress the frame number is a protocol violation by the algorithm
/// and is dropped with a warning rather than delivered out of order.
#[derive(Clone, Default)]
pub struct FrameActions {
    inner: Arc<Mutex<FrameActionsInner>>,
}

#[derive(Default)]
struct FrameActionsInner {
    subscribers: Vec<kanal::Sender<FrameNumber>>,
    last_frame: Option<FrameNumber>,
}

impl FrameActions {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to frame actions from this instance.
    pub fn subscribe(&self) -> kanal::Receiver<FrameNumber> {
        let (tx, rx) = kanal::unbounded();
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Emit a frame action to all live subscribers.
    ///
    /// Disconnected subscribers are pruned. Frame-number regressions are
    /// dropped.
    pub fn emit(&self, frame: FrameNumber) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(last) = inner.last_frame {
            if frame < last {
                tracing::warn!(frame, last, "dropping frame action that regresses");
                return;
            }
        }
        inner.last_frame = Some(frame);
        inner
            .subscribers
            .retain(|tx| matches!(tx.try_send(frame), Ok(true)));
    }

    /// The highest frame number emitted so far, if any.
    pub fn last_frame(&self) -> Option<FrameNumber> {
        self.inner.lock().ok().and_then(|inner| inner.last_frame)
    }
}
