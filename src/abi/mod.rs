//! The stable binary interface to algorithm modules.
//!
//! Algorithm binaries are compiled independently of the pipeline and must
//! never depend on its internal object model. They agree only on the frozen
//! plain-struct/function-pointer layout in [`layout`]; the
//! [`ContextWrapper`] adapter is the sole piece of pipeline code that
//! flattens to and reconstructs from that layout.

pub mod layout;
pub mod testing;
mod wrapper;

pub use layout::{IPA_ABI_VERSION, IPA_CONTROL_NAME_MAX, IPA_MAX_PLANES};
pub use wrapper::ContextWrapper;
