//! # Iris
//!
//! Camera pipeline IPA (Image Processing Algorithm) interface and isolation
//! layer.
//!
//! Iris lets a camera pipeline handler drive vendor algorithm modules
//! through one abstract interface, whether the module runs in-process for
//! speed or in a sandboxed worker process for fault containment. The two
//! execution proxies are interchangeable: the pipeline handler codes
//! against [`IpaInterface`] and never learns where the algorithm lives.
//!
//! ## Features
//!
//! - **Frozen C ABI**: algorithm binaries built years apart keep working
//! - **Operation envelopes**: one wire format for every operation, with
//!   out-of-band fd passing for zero-copy buffer access
//! - **Fault containment**: a crashing isolated algorithm degrades its
//!   proxy instead of the pipeline process
//! - **Module discovery**: versioned, name-checked loading of algorithm
//!   binaries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use iris::prelude::*;
//!
//! let mut manager = ModuleManager::new();
//! manager.add_search_path("/usr/lib/iris/modules");
//! let module = unsafe { manager.load("vendor_agc")? };
//!
//! let mut ipa = InProcessProxy::with_library(module.create_context()?, module.library());
//! ipa.init()?;
//! ipa.configure(&streams, &controls)?;
//! ipa.map_buffers(&buffers)?;
//! ```
//!
//! [`IpaInterface`]: interface::IpaInterface

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod buffer;
pub mod controls;
pub mod envelope;
pub mod error;
pub mod interface;
pub mod link;
pub mod module;
pub mod proxy;
pub mod reactor;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{BufferHandle, BufferPlane};
    pub use crate::controls::{ControlInfo, PixelFormat, StreamConfig};
    pub use crate::envelope::{OperationCode, OperationData};
    pub use crate::error::{Error, Result};
    pub use crate::interface::{FrameActions, IpaInterface};
    pub use crate::module::ModuleManager;
    pub use crate::proxy::{InProcessProxy, IpaHost, IsolatedProxy, ProxyKind, ProxyState};
}

pub use error::{Error, Result};
