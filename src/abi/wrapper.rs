//! The ABI adapter: bridges the capability interface to a raw context.
//!
//! [`ContextWrapper`] owns one algorithm context and translates every call
//! into the frozen plain-data layout. The only state shared with the
//! algorithm binary is the context handle and a correlation token; the
//! outbound frame-action path goes through a fixed-signature callback that
//! resolves the token back to the live wrapper via a process-wide registry.
//! An unresolvable token fails closed: logged and ignored, never
//! dereferenced.

use super::layout::{
    IpaBufferDesc, IpaCallbackOps, IpaContext, IpaOperationDesc, buffer_to_desc, controls_to_descs,
    streams_to_descs,
};
use crate::buffer::BufferHandle;
use crate::controls::{EntityControlMap, StreamConfigMap};
use crate::envelope::OperationData;
use crate::error::{Error, Result};
use crate::interface::FrameActions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

/// Correlation-token source. Tokens are process-unique and never reused.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Live wrappers by correlation token.
static CALLBACK_REGISTRY: LazyLock<Mutex<HashMap<u64, FrameActions>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The one callback table handed to every algorithm context.
static CALLBACK_OPS: IpaCallbackOps = IpaCallbackOps { queue_frame_action };

/// Frame-action entry point invoked by algorithm binaries.
///
/// # Safety
///
/// Called across the ABI boundary with a token the algorithm received at
/// registration. The token is looked up, never dereferenced, so a stale or
/// foreign value is harmless.
unsafe extern "C" fn queue_frame_action(token: u64, frame: u32) {
    let Ok(registry) = CALLBACK_REGISTRY.lock() else {
        return;
    };
    match registry.get(&token) {
        Some(actions) => actions.emit(frame),
        None => {
            tracing::warn!(token, frame, "frame action with stale correlation token, ignoring");
        }
    }
}

/// Adapter presenting an algorithm context through safe, typed calls.
///
/// The wrapper owns the context exclusively: it is destroyed on drop and is
/// never shared between two wrappers.
pub struct ContextWrapper {
    ctx: *mut IpaContext,
    token: u64,
    frame_actions: FrameActions,
}

// SAFETY: the wrapper has exclusive ownership of the context and every call
// into it takes `&mut self`, so the context is only ever driven from one
// thread at a time.
unsafe impl Send for ContextWrapper {}

impl ContextWrapper {
    /// Wrap a freshly created algorithm context.
    ///
    /// Registers the outbound callback table and a new correlation token
    /// with the context.
    ///
    /// # Safety
    ///
    /// `ctx` must be a valid context created by an algorithm module's
    /// `create` entry point, with an ops table valid for the context's
    /// lifetime, and must not be driven through any other wrapper.
    pub unsafe fn new(ctx: *mut IpaContext) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let frame_actions = FrameActions::new();
        if let Ok(mut registry) = CALLBACK_REGISTRY.lock() {
            registry.insert(token, frame_actions.clone());
        }

        // SAFETY: caller guarantees ctx and its ops table are valid.
        unsafe {
            ((*(*ctx).ops).register_callbacks)(ctx, &CALLBACK_OPS, token);
        }

        Self {
            ctx,
            token,
            frame_actions,
        }
    }

    /// One-time setup of the algorithm.
    ///
    /// A negative return from the module is mapped to the matching errno.
    pub fn init(&mut self) -> Result<()> {
        // SAFETY: ctx validity is an invariant of the wrapper.
        let ret = unsafe { ((*(*self.ctx).ops).init)(self.ctx) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::from_raw_os_error(-ret)));
        }
        Ok(())
    }

    /// Flatten both mappings and hand them to the algorithm.
    ///
    /// The flattened arrays live on this call's stack frame only; they are
    /// freed when the call returns, on every path.
    pub fn configure(&mut self, streams: &StreamConfigMap, entity_controls: &EntityControlMap) {
        let stream_descs = streams_to_descs(streams);
        let control_descs = controls_to_descs(entity_controls);
        // SAFETY: the descriptor arrays outlive the call; counts match.
        unsafe {
            ((*(*self.ctx).ops).configure)(
                self.ctx,
                stream_descs.as_ptr(),
                stream_descs.len() as u32,
                control_descs.as_ptr(),
                control_descs.len() as u32,
            );
        }
    }

    /// Grant the algorithm access to a batch of buffers.
    pub fn map_buffers(&mut self, buffers: &[BufferHandle]) {
        let descs: Vec<IpaBufferDesc> = buffers.iter().map(buffer_to_desc).collect();
        // SAFETY: descs outlives the call; count matches.
        unsafe {
            ((*(*self.ctx).ops).map_buffers)(self.ctx, descs.as_ptr(), descs.len() as u32);
        }
    }

    /// Revoke the algorithm's access to a batch of buffer ids.
    pub fn unmap_buffers(&mut self, ids: &[u32]) {
        // SAFETY: the slice outlives the call; count matches.
        unsafe {
            ((*(*self.ctx).ops).unmap_buffers)(self.ctx, ids.as_ptr(), ids.len() as u32);
        }
    }

    /// Deliver one event through the fixed-header operation record.
    pub fn process_event(&mut self, data: &OperationData) {
        let buffer_descs: Vec<IpaBufferDesc> = data.buffers.iter().map(buffer_to_desc).collect();
        let op = IpaOperationDesc {
            code: data.code as u32,
            payload_count: data.payload.len() as u32,
            payload: data.payload.as_ptr(),
            buffer_count: buffer_descs.len() as u32,
            buffers: buffer_descs.as_ptr(),
        };
        // SAFETY: op and the arrays it points at outlive the call.
        unsafe {
            ((*(*self.ctx).ops).process_event)(self.ctx, &op);
        }
    }

    /// The outbound frame-action hub fed by this context's callbacks.
    pub fn frame_actions(&self) -> &FrameActions {
        &self.frame_actions
    }

    /// The correlation token registered for this wrapper.
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for ContextWrapper {
    fn drop(&mut self) {
        if let Ok(mut registry) = CALLBACK_REGISTRY.lock() {
            registry.remove(&self.token);
        }
        // SAFETY: ctx validity is an invariant of the wrapper; after this
        // call nothing touches the context again.
        unsafe {
            ((*(*self.ctx).ops).destroy)(self.ctx);
        }
    }
}

impl std::fmt::Debug for ContextWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWrapper")
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::testing::{TestAlgorithm, TestLog};
    use crate::controls::{ControlInfo, ControlInfoMap, PixelFormat, StreamConfig};
    use crate::envelope::OperationCode;

    #[test]
    fn test_stale_token_fails_closed() {
        // A token nothing ever registered: the callback must be a no-op.
        unsafe { queue_frame_action(u64::MAX, 1) };
    }

    #[test]
    fn test_token_deregistered_on_drop() {
        let log = TestLog::default();
        let wrapper = unsafe { ContextWrapper::new(TestAlgorithm::create(log)) };
        let token = wrapper.token();
        drop(wrapper);
        // Late callback after teardown: ignored, not delivered.
        unsafe { queue_frame_action(token, 5) };
    }

    #[test]
    fn test_calls_reach_algorithm() {
        let log = TestLog::default();
        let mut wrapper = unsafe { ContextWrapper::new(TestAlgorithm::create(log.clone())) };

        wrapper.init().unwrap();

        let mut streams = StreamConfigMap::new();
        streams.insert(
            0,
            StreamConfig {
                stream_id: 0,
                pixel_format: PixelFormat::fourcc(*b"NV12"),
                width: 1280,
                height: 720,
            },
        );
        let mut map = ControlInfoMap::new();
        map.insert(
            "Gain".to_string(),
            ControlInfo {
                min: 0,
                max: 16,
                default: 1,
            },
        );
        let mut controls = EntityControlMap::new();
        controls.insert(1, map);
        wrapper.configure(&streams, &controls);

        wrapper.map_buffers(&[BufferHandle::single_plane(1, -1, 4096)]);
        wrapper.process_event(&OperationData::new(OperationCode::ProcessEvent, vec![99]));
        wrapper.unmap_buffers(&[1]);

        let snapshot = log.snapshot();
        assert!(snapshot.initialized);
        assert_eq!(snapshot.streams, streams);
        assert_eq!(snapshot.controls, controls);
        assert_eq!(snapshot.mapped_ids, vec![1]);
        assert_eq!(snapshot.unmapped_ids, vec![1]);
        assert_eq!(snapshot.events, vec![vec![99]]);
    }

    #[test]
    fn test_frame_action_resolves_token() {
        let log = TestLog::default();
        let mut wrapper = unsafe { ContextWrapper::new(TestAlgorithm::create(log)) };
        wrapper.init().unwrap();
        let rx = wrapper.frame_actions().subscribe();

        // The test algorithm queues a frame action when it sees this event.
        wrapper.process_event(&OperationData::new(
            OperationCode::ProcessEvent,
            vec![TestAlgorithm::TRIGGER_FRAME_ACTION, 42],
        ));

        assert_eq!(rx.try_recv().unwrap(), Some(42));
    }
}
