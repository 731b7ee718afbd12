//! A reference algorithm implemented directly against the module ABI.
//!
//! This is what a vendor module looks like from the pipeline's side: a
//! context struct embedding [`IpaContext`] as its first field and a static
//! ops table of `extern "C"` entry points. The test suite drives it through
//! both execution proxies; it records every call into a shared log and can
//! queue frame actions on demand.

use super::layout::{
    IpaBufferDesc, IpaCallbackOps, IpaContext, IpaContextOps, IpaControlDesc, IpaOperationDesc,
    IpaStreamDesc, buffer_from_desc, controls_from_descs, streams_from_descs,
};
use crate::buffer::BufferHandle;
use crate::controls::{EntityControlMap, StreamConfigMap};
use std::sync::{Arc, Mutex};

/// Shared record of every call an algorithm context observed.
#[derive(Clone, Default)]
pub struct TestLog {
    inner: Arc<Mutex<TestLogSnapshot>>,
}

/// Point-in-time copy of a [`TestLog`].
#[derive(Clone, Debug, Default)]
pub struct TestLogSnapshot {
    /// Whether `init` succeeded.
    pub initialized: bool,
    /// Number of `init` calls observed.
    pub init_calls: u32,
    /// Streams from the most recent `configure`.
    pub streams: StreamConfigMap,
    /// Entity controls from the most recent `configure`.
    pub controls: EntityControlMap,
    /// Ids passed to `map_buffers`, in order.
    pub mapped_ids: Vec<u32>,
    /// Full handles passed to `map_buffers`, in order.
    pub mapped_buffers: Vec<BufferHandle>,
    /// Ids passed to `unmap_buffers`, in order.
    pub unmapped_ids: Vec<u32>,
    /// Payloads of every `process_event`, in order.
    pub events: Vec<Vec<u32>>,
}

impl TestLog {
    /// Copy the current state of the log.
    pub fn snapshot(&self) -> TestLogSnapshot {
        self.inner.lock().expect("log lock poisoned").clone()
    }

    fn update(&self, f: impl FnOnce(&mut TestLogSnapshot)) {
        if let Ok(mut inner) = self.inner.lock() {
            f(&mut inner);
        }
    }
}

/// Factory for reference algorithm contexts.
pub struct TestAlgorithm;

impl TestAlgorithm {
    /// `process_event` payload marker asking the algorithm to queue a frame
    /// action; the next payload word is the frame number.
    pub const TRIGGER_FRAME_ACTION: u32 = 0xffff_0001;

    /// Create a context whose calls are recorded into `log`.
    pub fn create(log: TestLog) -> *mut IpaContext {
        Self::create_with_init_result(log, 0)
    }

    /// Create a context whose `init` entry point returns `init_result`.
    pub fn create_with_init_result(log: TestLog, init_result: i32) -> *mut IpaContext {
        let state = Box::into_raw(Box::new(TestState {
            log,
            init_result,
            init_calls: 0,
            frame_action: None,
        }));
        let ctx = Box::new(TestContext {
            base: IpaContext { ops: &TEST_OPS },
            state,
        });
        Box::into_raw(ctx).cast()
    }
}

#[repr(C)]
struct TestContext {
    base: IpaContext,
    state: *mut TestState,
}

struct TestState {
    log: TestLog,
    init_result: i32,
    init_calls: u32,
    frame_action: Option<(unsafe extern "C" fn(u64, u32), u64)>,
}

static TEST_OPS: IpaContextOps = IpaContextOps {
    init: test_init,
    destroy: test_destroy,
    register_callbacks: test_register_callbacks,
    configure: test_configure,
    map_buffers: test_map_buffers,
    unmap_buffers: test_unmap_buffers,
    process_event: test_process_event,
};

/// Recover the algorithm state from the opaque context handle.
///
/// # Safety
///
/// `ctx` must be a live pointer created by [`TestAlgorithm::create`].
unsafe fn state<'a>(ctx: *mut IpaContext) -> &'a mut TestState {
    // SAFETY: TestContext embeds IpaContext as its first field, so the cast
    // recovers the full context; the caller guarantees liveness.
    unsafe { &mut *(*ctx.cast::<TestContext>()).state }
}

unsafe extern "C" fn test_init(ctx: *mut IpaContext) -> i32 {
    // SAFETY: per ABI contract, ctx is a live TestContext.
    let state = unsafe { state(ctx) };
    state.init_calls += 1;
    let calls = state.init_calls;
    let result = state.init_result;
    state.log.update(|log| {
        log.init_calls = calls;
        if result == 0 {
            log.initialized = true;
        }
    });
    result
}

unsafe extern "C" fn test_destroy(ctx: *mut IpaContext) {
    // SAFETY: ctx was created by Box::into_raw in create(); reconstituting
    // the boxes releases both allocations exactly once.
    unsafe {
        let ctx = Box::from_raw(ctx.cast::<TestContext>());
        drop(Box::from_raw(ctx.state));
    }
}

unsafe extern "C" fn test_register_callbacks(
    ctx: *mut IpaContext,
    callbacks: *const IpaCallbackOps,
    token: u64,
) {
    // SAFETY: per ABI contract, ctx is live and callbacks points at a table
    // valid for the context's lifetime.
    let state = unsafe { state(ctx) };
    if callbacks.is_null() {
        return;
    }
    // SAFETY: non-null callbacks table, valid per the contract above.
    let queue = unsafe { (*callbacks).queue_frame_action };
    state.frame_action = Some((queue, token));
}

unsafe extern "C" fn test_configure(
    ctx: *mut IpaContext,
    streams: *const IpaStreamDesc,
    stream_count: u32,
    controls: *const IpaControlDesc,
    control_count: u32,
) {
    // SAFETY: per ABI contract, the arrays are valid for the given counts
    // for the duration of this call.
    let state = unsafe { state(ctx) };
    let stream_descs = if stream_count == 0 {
        &[]
    } else {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(streams, stream_count as usize) }
    };
    let control_descs = if control_count == 0 {
        &[]
    } else {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(controls, control_count as usize) }
    };
    let streams = streams_from_descs(stream_descs);
    let controls = controls_from_descs(control_descs);
    state.log.update(|log| {
        log.streams = streams;
        log.controls = controls;
    });
}

unsafe extern "C" fn test_map_buffers(
    ctx: *mut IpaContext,
    buffers: *const IpaBufferDesc,
    count: u32,
) {
    // SAFETY: per ABI contract, buffers is valid for count entries.
    let state = unsafe { state(ctx) };
    let descs = if count == 0 {
        &[]
    } else {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(buffers, count as usize) }
    };
    let handles: Vec<BufferHandle> = descs.iter().map(buffer_from_desc).collect();
    state.log.update(|log| {
        for handle in &handles {
            log.mapped_ids.push(handle.id);
        }
        log.mapped_buffers.extend(handles);
    });
}

unsafe extern "C" fn test_unmap_buffers(ctx: *mut IpaContext, ids: *const u32, count: u32) {
    // SAFETY: per ABI contract, ids is valid for count entries.
    let state = unsafe { state(ctx) };
    let ids = if count == 0 {
        &[]
    } else {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(ids, count as usize) }
    };
    let ids = ids.to_vec();
    state.log.update(|log| log.unmapped_ids.extend(ids));
}

unsafe extern "C" fn test_process_event(ctx: *mut IpaContext, op: *const IpaOperationDesc) {
    // SAFETY: per ABI contract, op and its transient arrays are valid for
    // the duration of this call.
    let state = unsafe { state(ctx) };
    if op.is_null() {
        return;
    }
    // SAFETY: see above.
    let op = unsafe { &*op };
    let payload = if op.payload_count == 0 {
        Vec::new()
    } else {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(op.payload, op.payload_count as usize) }.to_vec()
    };

    if payload.first() == Some(&TestAlgorithm::TRIGGER_FRAME_ACTION) {
        if let (Some((queue, token)), Some(&frame)) = (state.frame_action, payload.get(1)) {
            // SAFETY: the callback table outlives the context per the
            // registration contract.
            unsafe { queue(token, frame) };
        }
    }

    state.log.update(|log| log.events.push(payload));
}
