//! Isolated execution behind a channel to a worker process.

use super::ProxyState;
use crate::buffer::{BufferHandle, BufferTable};
use crate::controls::{EntityControlMap, StreamConfigMap};
use crate::envelope::{self, OperationCode, OperationData};
use crate::error::{Error, Result};
use crate::interface::{FrameActions, IpaInterface};
use crate::link::{Channel, UnixChannel};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// How long `init` waits for the worker's acknowledgment.
const INIT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Proxy that drives an algorithm living in another process.
///
/// Mirrors the full operation set onto envelopes. `init` is the only
/// round-trip; every other operation is fire-and-forget, so a wedged or
/// dead worker can never stall the pipeline thread. Worker failure is
/// absorbed as [`ProxyState::Degraded`]: subsequent operations fail with
/// [`Error::PeerUnavailable`] and the rest of the process is untouched.
pub struct IsolatedProxy {
    channel: Box<dyn Channel>,
    state: ProxyState,
    buffers: BufferTable,
    frame_actions: FrameActions,
    child: Option<Child>,
    init_timeout: Duration,
}

impl IsolatedProxy {
    /// Attach to a worker over an existing channel.
    ///
    /// The worker end is expected to be serving an [`IpaHost`] loop.
    ///
    /// [`IpaHost`]: super::IpaHost
    pub fn attach(channel: Box<dyn Channel>) -> Self {
        let mut proxy = Self {
            channel,
            state: ProxyState::Disconnected,
            buffers: BufferTable::new(),
            frame_actions: FrameActions::new(),
            child: None,
            init_timeout: INIT_ACK_TIMEOUT,
        };
        proxy.set_state(ProxyState::Connecting);
        proxy
    }

    /// Spawn a worker process and attach to it.
    ///
    /// The worker program receives the module path and the inherited socket
    /// fd number as arguments, in that order.
    pub fn spawn(worker: &Path, module: &Path) -> Result<Self> {
        let (parent_end, child_end) = UnixStream::pair()?;
        // The child's end must survive exec.
        rustix::io::fcntl_setfd(&child_end, rustix::io::FdFlags::empty())?;

        let child = Command::new(worker)
            .arg(module)
            .arg(child_end.as_raw_fd().to_string())
            .spawn()?;
        drop(child_end);

        tracing::info!(
            worker = %worker.display(),
            module = %module.display(),
            pid = child.id(),
            "spawned algorithm worker"
        );

        let channel = UnixChannel::from_stream(parent_end)?;
        let mut proxy = Self::attach(Box::new(channel));
        proxy.child = Some(child);
        Ok(proxy)
    }

    /// Override the init acknowledgment deadline.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Pollable fd of the underlying channel, for reactor registration.
    pub fn poll_fd(&self) -> Option<RawFd> {
        self.channel.poll_fd()
    }

    /// Drain inbound traffic from the worker.
    ///
    /// Call when the channel fd signals readable, or periodically for
    /// channels without one. Frame actions are dispatched to subscribers;
    /// anything else inbound is a protocol violation and degrades the
    /// proxy.
    pub fn service(&mut self) -> Result<()> {
        loop {
            match self.channel.try_recv_frame() {
                Ok(Some(frame)) => match envelope::decode(&frame) {
                    Ok(data) => self.dispatch_inbound(&data),
                    Err(e) => {
                        self.degrade("malformed envelope from worker");
                        return Err(e);
                    }
                },
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.degrade("worker channel failed");
                    return Err(e);
                }
            }
        }
    }

    /// Tear down the proxy and reap the worker, if any.
    pub fn close(&mut self) {
        if self.state == ProxyState::Closed {
            return;
        }
        self.channel.close();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.set_state(ProxyState::Closed);
    }

    fn dispatch_inbound(&mut self, data: &OperationData) {
        match data.code {
            OperationCode::FrameAction => match data.payload.first() {
                Some(&frame) => self.frame_actions.emit(frame),
                None => tracing::warn!("frame action without frame number"),
            },
            other => {
                tracing::warn!(code = ?other, "unexpected envelope from worker");
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ProxyState::Ready => Ok(()),
            ProxyState::Disconnected | ProxyState::Connecting => Err(Error::NotInitialized),
            ProxyState::Degraded | ProxyState::Closed => Err(Error::PeerUnavailable),
        }
    }

    fn set_state(&mut self, next: ProxyState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid proxy transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, to = %next, "proxy state change");
        self.state = next;
    }

    fn degrade(&mut self, reason: &str) {
        if matches!(self.state, ProxyState::Connecting | ProxyState::Ready) {
            tracing::warn!(reason, "isolated proxy degraded");
            self.set_state(ProxyState::Degraded);
        }
    }

    fn send_op(&mut self, data: &OperationData) -> Result<()> {
        let frame = envelope::encode(data)?;
        match self.channel.send_frame(frame) {
            Ok(()) => Ok(()),
            // A per-frame rejection leaves the channel usable.
            Err(e @ Error::MalformedEnvelope(_)) => Err(e),
            Err(e) => {
                self.degrade("send to worker failed");
                Err(e)
            }
        }
    }
}

impl IpaInterface for IsolatedProxy {
    fn init(&mut self) -> Result<()> {
        match self.state {
            ProxyState::Connecting => {}
            ProxyState::Ready => return Err(Error::AlreadyInitialized),
            ProxyState::Disconnected | ProxyState::Degraded | ProxyState::Closed => {
                return Err(Error::PeerUnavailable);
            }
        }

        self.send_op(&OperationData::new(OperationCode::Init, vec![]))?;

        let deadline = Instant::now() + self.init_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.degrade("init acknowledgment timed out");
                return Err(Error::Timeout);
            }
            let frame = match self.channel.recv_frame_timeout(deadline - now) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    self.degrade("worker channel failed during init");
                    return Err(e);
                }
            };
            let data = match envelope::decode(&frame) {
                Ok(data) => data,
                Err(e) => {
                    self.degrade("malformed envelope during init");
                    return Err(e);
                }
            };
            match data.code {
                OperationCode::InitAck => {
                    let Some(&status) = data.payload.first() else {
                        self.degrade("init acknowledgment without status");
                        return Err(Error::MalformedEnvelope("missing init status".into()));
                    };
                    if status == 0 {
                        self.set_state(ProxyState::Ready);
                        return Ok(());
                    }
                    self.degrade("worker reported init failure");
                    return Err(Error::Io(std::io::Error::from_raw_os_error(status as i32)));
                }
                _ => self.dispatch_inbound(&data),
            }
        }
    }

    fn configure(
        &mut self,
        streams: &StreamConfigMap,
        entity_controls: &EntityControlMap,
    ) -> Result<()> {
        self.ensure_ready()?;
        let payload = envelope::encode_configure(streams, entity_controls);
        self.send_op(&OperationData::new(OperationCode::Configure, payload))?;
        self.buffers.clear();
        Ok(())
    }

    fn map_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        self.ensure_ready()?;
        self.buffers.map(buffers)?;
        let sent = self.send_op(&OperationData::with_buffers(
            OperationCode::MapBuffers,
            vec![],
            buffers.to_vec(),
        ));
        if sent.is_err() {
            // The worker never saw the batch; it must not stay mapped here.
            let ids: Vec<u32> = buffers.iter().map(|b| b.id).collect();
            self.buffers.unmap(&ids);
        }
        sent
    }

    fn unmap_buffers(&mut self, ids: &[u32]) -> Result<()> {
        self.ensure_ready()?;
        let (unmapped, first_unknown) = self.buffers.unmap(ids);
        if !unmapped.is_empty() {
            self.send_op(&OperationData::new(OperationCode::UnmapBuffers, unmapped))?;
        }
        match first_unknown {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn process_event(&mut self, data: &OperationData) -> Result<()> {
        self.ensure_ready()?;
        self.buffers.check_referenced(&data.buffers)?;
        // Plane fds crossed at map time; on the wire the event names its
        // buffers by id alone.
        let references: Vec<BufferHandle> = data
            .buffers
            .iter()
            .map(|b| BufferHandle::id_only(b.id))
            .collect();
        self.send_op(&OperationData::with_buffers(
            OperationCode::ProcessEvent,
            data.payload.clone(),
            references,
        ))
    }

    fn frame_actions(&self) -> &FrameActions {
        &self.frame_actions
    }
}

impl Drop for IsolatedProxy {
    fn drop(&mut self) {
        self.close();
    }
}
