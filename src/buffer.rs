//! Buffer handles and mapped-buffer accounting.
//!
//! A [`BufferHandle`] is a capability: the pipeline handler owns the backing
//! memory, the handle only grants an algorithm temporary mapping rights for
//! the session. The protocol, not a lock, is the synchronization discipline,
//! so the layer tracks which ids are currently mapped and rejects references
//! to anything else.

use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::os::fd::RawFd;

/// One memory plane of an image buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPlane {
    /// File descriptor backing the plane. Borrowed, never closed by Iris.
    pub fd: RawFd,
    /// Plane length in bytes.
    pub length: u32,
    /// Offset of the plane within the backing memory.
    pub offset: u32,
}

/// A capability granting temporary access to a memory-backed image buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    /// Buffer id, unique within a session.
    pub id: u32,
    /// Memory planes, in plane order. Almost always 1-3, never more than 4.
    pub planes: SmallVec<[BufferPlane; 4]>,
}

impl BufferHandle {
    /// Create a handle for a single-plane buffer.
    pub fn single_plane(id: u32, fd: RawFd, length: u32) -> Self {
        Self {
            id,
            planes: SmallVec::from_slice(&[BufferPlane {
                fd,
                length,
                offset: 0,
            }]),
        }
    }

    /// Create a handle from a plane list.
    pub fn with_planes(id: u32, planes: impl IntoIterator<Item = BufferPlane>) -> Self {
        Self {
            id,
            planes: planes.into_iter().collect(),
        }
    }

    /// Create a planeless handle naming an already-mapped buffer.
    ///
    /// Events reference buffers this way: the planes crossed at map time,
    /// so only the id travels.
    pub fn id_only(id: u32) -> Self {
        Self {
            id,
            planes: SmallVec::new(),
        }
    }
}

/// Accounting of currently-mapped buffers for one interface instance.
///
/// Enforces the mapping discipline: an id must be mapped before it may
/// appear in a `process_event` payload, and unmapping invalidates it
/// immediately. Use-after-unmap is a protocol violation, detected and
/// rejected, never a crash.
#[derive(Debug, Default)]
pub struct BufferTable {
    mapped: HashMap<u32, BufferHandle>,
}

impl BufferTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch of buffers as mapped.
    ///
    /// The batch is validated as a whole before any id is committed: a
    /// collision with an already-mapped id (or a duplicate within the batch)
    /// fails with `DuplicateBuffer` and maps nothing.
    pub fn map(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        for (i, buffer) in buffers.iter().enumerate() {
            if self.mapped.contains_key(&buffer.id)
                || buffers[..i].iter().any(|b| b.id == buffer.id)
            {
                return Err(Error::DuplicateBuffer(buffer.id));
            }
        }
        for buffer in buffers {
            self.mapped.insert(buffer.id, buffer.clone());
        }
        Ok(())
    }

    /// Remove a batch of ids from the table.
    ///
    /// Unknown ids are skipped without aborting the batch. Returns the ids
    /// that were actually unmapped, plus the first `UnknownBuffer` error
    /// encountered, if any.
    pub fn unmap(&mut self, ids: &[u32]) -> (Vec<u32>, Option<Error>) {
        let mut unmapped = Vec::with_capacity(ids.len());
        let mut first_err = None;
        for &id in ids {
            if self.mapped.remove(&id).is_some() {
                unmapped.push(id);
            } else {
                tracing::warn!(buffer = id, "unmap of unknown buffer id, skipping");
                if first_err.is_none() {
                    first_err = Some(Error::UnknownBuffer(id));
                }
            }
        }
        (unmapped, first_err)
    }

    /// Check that every buffer referenced by an event is currently mapped.
    pub fn check_referenced(&self, buffers: &[BufferHandle]) -> Result<()> {
        for buffer in buffers {
            if !self.mapped.contains_key(&buffer.id) {
                return Err(Error::UnknownBuffer(buffer.id));
            }
        }
        Ok(())
    }

    /// Whether an id is currently mapped.
    pub fn contains(&self, id: u32) -> bool {
        self.mapped.contains_key(&id)
    }

    /// The mapped handle for an id, if any.
    pub fn get(&self, id: u32) -> Option<&BufferHandle> {
        self.mapped.get(&id)
    }

    /// Number of currently-mapped buffers.
    pub fn len(&self) -> usize {
        self.mapped.len()
    }

    /// Whether no buffers are mapped.
    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }

    /// Drop all mappings. Called on re-`configure` and on teardown.
    pub fn clear(&mut self) {
        self.mapped.clear();
    }
}
