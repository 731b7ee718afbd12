//! Direct execution of an algorithm context in the caller's address space.

use crate::abi::ContextWrapper;
use crate::buffer::{BufferHandle, BufferTable};
use crate::controls::{EntityControlMap, StreamConfigMap};
use crate::envelope::OperationData;
use crate::error::{Error, Result};
use crate::interface::{FrameActions, IpaInterface};
use std::sync::Arc;

/// Proxy that calls straight into the algorithm context.
///
/// Fastest possible dispatch, no fault containment: the algorithm shares
/// the pipeline's address space and a crash takes the process down.
pub struct InProcessProxy {
    wrapper: ContextWrapper,
    initialized: bool,
    buffers: BufferTable,
    /// Keeps the module binary mapped as long as the context lives.
    _library: Option<Arc<libloading::Library>>,
}

impl InProcessProxy {
    /// Wrap an already-created algorithm context.
    pub fn new(wrapper: ContextWrapper) -> Self {
        Self {
            wrapper,
            initialized: false,
            buffers: BufferTable::new(),
            _library: None,
        }
    }

    /// Wrap a context created from a loaded module binary.
    ///
    /// The library handle is held alive for the proxy's lifetime so the
    /// context's code never unmaps under it.
    pub fn with_library(wrapper: ContextWrapper, library: Arc<libloading::Library>) -> Self {
        Self {
            wrapper,
            initialized: false,
            buffers: BufferTable::new(),
            _library: Some(library),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

impl IpaInterface for InProcessProxy {
    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        self.wrapper.init()?;
        self.initialized = true;
        tracing::debug!(token = self.wrapper.token(), "algorithm initialized");
        Ok(())
    }

    fn configure(
        &mut self,
        streams: &StreamConfigMap,
        entity_controls: &EntityControlMap,
    ) -> Result<()> {
        self.ensure_initialized()?;
        self.wrapper.configure(streams, entity_controls);
        // A new configuration invalidates prior grants; callers re-map.
        self.buffers.clear();
        Ok(())
    }

    fn map_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        self.ensure_initialized()?;
        self.buffers.map(buffers)?;
        self.wrapper.map_buffers(buffers);
        Ok(())
    }

    fn unmap_buffers(&mut self, ids: &[u32]) -> Result<()> {
        self.ensure_initialized()?;
        let (unmapped, first_unknown) = self.buffers.unmap(ids);
        if !unmapped.is_empty() {
            self.wrapper.unmap_buffers(&unmapped);
        }
        match first_unknown {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn process_event(&mut self, data: &OperationData) -> Result<()> {
        self.ensure_initialized()?;
        self.buffers.check_referenced(&data.buffers)?;
        self.wrapper.process_event(data);
        Ok(())
    }

    fn frame_actions(&self) -> &FrameActions {
        self.wrapper.frame_actions()
    }
}
