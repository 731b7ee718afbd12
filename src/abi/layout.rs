//! Frozen plain-data layout of the algorithm module ABI.
//!
//! Everything in this file crosses a compilation boundary: algorithm
//! binaries are built independently of the pipeline and only agree on these
//! `#[repr(C)]` records and function-pointer tables. Field order and sizes
//! are frozen; adding capability requires a new, separately versioned table,
//! never a reorder of an existing one.
//!
//! The flatten/reconstruct helpers at the bottom are the only code on the
//! pipeline side aware of this layout. Mappings are flattened into
//! count-plus-parallel-array form in insertion order, and that order
//! round-trips exactly.

use crate::buffer::{BufferHandle, BufferPlane};
use crate::controls::{
    ControlInfo, ControlInfoMap, EntityControlMap, PixelFormat, StreamConfig, StreamConfigMap,
};
use smallvec::SmallVec;
use std::ffi::c_char;

/// Current ABI version. Modules must declare this version to be loaded.
pub const IPA_ABI_VERSION: u32 = 1;

/// Maximum planes per buffer descriptor.
pub const IPA_MAX_PLANES: usize = 4;

/// Fixed width of a control name field, terminating NUL included.
pub const IPA_CONTROL_NAME_MAX: usize = 32;

/// One memory plane of a buffer, as seen by the algorithm binary.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpaPlaneDesc {
    /// File descriptor backing the plane.
    pub fd: i32,
    /// Plane length in bytes.
    pub length: u32,
    /// Offset of the plane within the backing memory.
    pub offset: u32,
}

/// A buffer grant. Carries only primitive fields, never a reference into
/// caller-owned containers.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpaBufferDesc {
    /// Buffer id, unique within a session.
    pub id: u32,
    /// Number of valid entries in `planes`.
    pub plane_count: u32,
    /// Plane descriptors; entries beyond `plane_count` are zeroed.
    pub planes: [IpaPlaneDesc; IPA_MAX_PLANES],
}

/// One stream configuration record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpaStreamDesc {
    /// Stream identifier.
    pub stream_id: u32,
    /// Pixel format fourcc.
    pub pixel_format: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// One control record of the flattened entity-controls mapping.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpaControlDesc {
    /// Entity the control belongs to.
    pub entity_id: u32,
    /// NUL-terminated control name, fixed width.
    pub name: [u8; IPA_CONTROL_NAME_MAX],
    /// Minimum accepted value.
    pub min: i32,
    /// Maximum accepted value.
    pub max: i32,
    /// Default value.
    pub default_value: i32,
}

/// Fixed-header record describing one operation.
///
/// The `payload` and `buffers` arrays are transient: they are owned by the
/// caller and valid only for the duration of the call they accompany.
#[repr(C)]
#[derive(Debug)]
pub struct IpaOperationDesc {
    /// Operation code.
    pub code: u32,
    /// Number of entries in `payload`.
    pub payload_count: u32,
    /// Opaque 32-bit control values.
    pub payload: *const u32,
    /// Number of entries in `buffers`.
    pub buffer_count: u32,
    /// Buffer descriptors referenced by this operation.
    pub buffers: *const IpaBufferDesc,
}

/// Callback table the pipeline registers with an algorithm context.
///
/// The `token` argument is the correlation token supplied alongside this
/// table at registration time; the algorithm passes it back verbatim.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpaCallbackOps {
    /// Queue a frame action toward the pipeline handler.
    pub queue_frame_action: unsafe extern "C" fn(token: u64, frame: u32),
}

/// Entry points of an algorithm context.
#[repr(C)]
pub struct IpaContextOps {
    /// One-time setup. Returns 0 on success, a negative errno on failure.
    pub init: unsafe extern "C" fn(ctx: *mut IpaContext) -> i32,
    /// Destroy the context and release all algorithm-side state.
    pub destroy: unsafe extern "C" fn(ctx: *mut IpaContext),
    /// Register the outbound callback table and correlation token.
    pub register_callbacks:
        unsafe extern "C" fn(ctx: *mut IpaContext, callbacks: *const IpaCallbackOps, token: u64),
    /// Replace the stream and control configuration.
    pub configure: unsafe extern "C" fn(
        ctx: *mut IpaContext,
        streams: *const IpaStreamDesc,
        stream_count: u32,
        controls: *const IpaControlDesc,
        control_count: u32,
    ),
    /// Grant access to a batch of buffers.
    pub map_buffers:
        unsafe extern "C" fn(ctx: *mut IpaContext, buffers: *const IpaBufferDesc, count: u32),
    /// Revoke access to a batch of buffer ids.
    pub unmap_buffers: unsafe extern "C" fn(ctx: *mut IpaContext, ids: *const u32, count: u32),
    /// Deliver one event.
    pub process_event: unsafe extern "C" fn(ctx: *mut IpaContext, op: *const IpaOperationDesc),
}

/// An algorithm context: the single opaque handle all calls go through.
///
/// Algorithm binaries embed this as the first field of their own context
/// struct and recover their state by pointer cast.
#[repr(C)]
pub struct IpaContext {
    /// Entry-point table; valid for the lifetime of the context.
    pub ops: *const IpaContextOps,
}

/// Module descriptor returned by a module's `ipa_module_descriptor` entry
/// point.
#[repr(C)]
pub struct IpaModuleDescriptor {
    /// ABI version the module was built against. Must equal
    /// [`IPA_ABI_VERSION`].
    pub abi_version: u32,
    /// Null-terminated module name.
    pub name: *const c_char,
    /// Null-terminated module version string.
    pub version: *const c_char,
    /// Create a fresh algorithm context.
    pub create: unsafe extern "C" fn() -> *mut IpaContext,
}

// SAFETY: the descriptor only points at static data inside the module
// binary and a function pointer, all of which are Send + Sync.
unsafe impl Send for IpaModuleDescriptor {}
unsafe impl Sync for IpaModuleDescriptor {}

/// Pack a control name into its fixed-width NUL-terminated field.
///
/// Names longer than the field are truncated with a warning; they cannot
/// round-trip and should be avoided.
pub fn pack_control_name(name: &str) -> [u8; IPA_CONTROL_NAME_MAX] {
    let mut out = [0u8; IPA_CONTROL_NAME_MAX];
    let bytes = name.as_bytes();
    if bytes.len() >= IPA_CONTROL_NAME_MAX {
        tracing::warn!(name, "control name exceeds {} bytes, truncating", IPA_CONTROL_NAME_MAX - 1);
    }
    let len = bytes.len().min(IPA_CONTROL_NAME_MAX - 1);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Recover a control name from its fixed-width field.
pub fn unpack_control_name(field: &[u8; IPA_CONTROL_NAME_MAX]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}

/// Flatten a buffer handle into its plain-data descriptor.
pub fn buffer_to_desc(buffer: &BufferHandle) -> IpaBufferDesc {
    let mut desc = IpaBufferDesc {
        id: buffer.id,
        plane_count: buffer.planes.len().min(IPA_MAX_PLANES) as u32,
        planes: [IpaPlaneDesc::default(); IPA_MAX_PLANES],
    };
    for (slot, plane) in desc.planes.iter_mut().zip(&buffer.planes) {
        *slot = IpaPlaneDesc {
            fd: plane.fd,
            length: plane.length,
            offset: plane.offset,
        };
    }
    desc
}

/// Reconstruct a buffer handle from its descriptor.
pub fn buffer_from_desc(desc: &IpaBufferDesc) -> BufferHandle {
    let count = (desc.plane_count as usize).min(IPA_MAX_PLANES);
    let planes: SmallVec<[BufferPlane; 4]> = desc.planes[..count]
        .iter()
        .map(|p| BufferPlane {
            fd: p.fd,
            length: p.length,
            offset: p.offset,
        })
        .collect();
    BufferHandle {
        id: desc.id,
        planes,
    }
}

/// Flatten a stream-configuration mapping, preserving insertion order.
pub fn streams_to_descs(streams: &StreamConfigMap) -> Vec<IpaStreamDesc> {
    streams
        .values()
        .map(|config| IpaStreamDesc {
            stream_id: config.stream_id,
            pixel_format: config.pixel_format.as_u32(),
            width: config.width,
            height: config.height,
        })
        .collect()
}

/// Reconstruct a stream-configuration mapping from its flattened form.
pub fn streams_from_descs(descs: &[IpaStreamDesc]) -> StreamConfigMap {
    let mut streams = StreamConfigMap::with_capacity(descs.len());
    for desc in descs {
        streams.insert(
            desc.stream_id,
            StreamConfig {
                stream_id: desc.stream_id,
                pixel_format: PixelFormat(desc.pixel_format),
                width: desc.width,
                height: desc.height,
            },
        );
    }
    streams
}

/// Flatten an entity-controls mapping, preserving insertion order of both
/// the outer and inner maps.
pub fn controls_to_descs(controls: &EntityControlMap) -> Vec<IpaControlDesc> {
    let mut descs = Vec::new();
    for (&entity_id, map) in controls {
        for (name, info) in map {
            descs.push(IpaControlDesc {
                entity_id,
                name: pack_control_name(name),
                min: info.min,
                max: info.max,
                default_value: info.default,
            });
        }
    }
    descs
}

/// Reconstruct an entity-controls mapping from its flattened form.
///
/// Entities with no controls cannot be represented in the flattened form;
/// they reconstruct as absent, which configure-time consumers treat the
/// same as an empty control set.
pub fn controls_from_descs(descs: &[IpaControlDesc]) -> EntityControlMap {
    let mut controls = EntityControlMap::new();
    for desc in descs {
        let map = controls
            .entry(desc.entity_id)
            .or_insert_with(ControlInfoMap::new);
        map.insert(
            unpack_control_name(&desc.name),
            ControlInfo {
                min: desc.min,
                max: desc.max,
                default: desc.default_value,
            },
        );
    }
    controls
}
