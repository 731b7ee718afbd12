//! Worker-side service loop for an isolated algorithm.

use crate::abi::ContextWrapper;
use crate::buffer::{BufferHandle, BufferTable};
use crate::envelope::{self, OperationCode, OperationData, WireFrame};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// How long one loop iteration blocks waiting for inbound traffic.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serves one algorithm context over a channel.
///
/// The counterpart of [`IsolatedProxy`]: decodes inbound envelopes into
/// direct context calls and forwards the context's frame actions back as
/// envelopes. The loop exits cleanly when the proxy goes away.
///
/// [`IsolatedProxy`]: super::IsolatedProxy
pub struct IpaHost {
    channel: Box<dyn crate::link::Channel>,
    wrapper: ContextWrapper,
    initialized: bool,
    buffers: BufferTable,
    /// Received plane fds, held open while their buffer stays mapped.
    /// Planes of different buffers may share one fd.
    plane_fds: HashMap<u32, Vec<Arc<OwnedFd>>>,
}

impl IpaHost {
    /// Bind a context to a channel.
    pub fn new(channel: Box<dyn crate::link::Channel>, wrapper: ContextWrapper) -> Self {
        Self {
            channel,
            wrapper,
            initialized: false,
            buffers: BufferTable::new(),
            plane_fds: HashMap::new(),
        }
    }

    /// Run the service loop until the peer disconnects.
    pub fn run(&mut self) -> Result<()> {
        let actions = self.wrapper.frame_actions().subscribe();
        tracing::debug!(token = self.wrapper.token(), "algorithm host serving");
        loop {
            while let Ok(Some(frame)) = actions.try_recv() {
                let notify = OperationData::new(OperationCode::FrameAction, vec![frame]);
                let sent = envelope::encode(&notify).and_then(|f| self.channel.send_frame(f));
                if let Err(e) = sent {
                    return self.finish(e);
                }
            }

            match self.channel.recv_frame_timeout(POLL_INTERVAL) {
                Ok(Some(mut frame)) => {
                    let data = envelope::decode(&frame)?;
                    self.dispatch(&data, &mut frame)?;
                }
                Ok(None) => {}
                Err(e) => return self.finish(e),
            }
        }
    }

    fn finish(&self, err: Error) -> Result<()> {
        match err {
            // Normal teardown: the proxy closed its end.
            Error::PeerUnavailable => {
                tracing::debug!("proxy disconnected, host exiting");
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Match each mapped buffer's planes to the frame fds they reference
    /// and keep those fds open for as long as the mapping lasts.
    fn retain_plane_fds(&mut self, buffers: &[BufferHandle], fds: Vec<OwnedFd>) {
        let fds: Vec<Arc<OwnedFd>> = fds.into_iter().map(Arc::new).collect();
        for buffer in buffers {
            let owned: Vec<Arc<OwnedFd>> = buffer
                .planes
                .iter()
                .filter_map(|plane| fds.iter().find(|fd| fd.as_raw_fd() == plane.fd).cloned())
                .collect();
            self.plane_fds.insert(buffer.id, owned);
        }
    }

    fn dispatch(&mut self, data: &OperationData, frame: &mut WireFrame) -> Result<()> {
        match data.code {
            OperationCode::Init => {
                let status = if self.initialized {
                    tracing::warn!("duplicate init from proxy");
                    rustix::io::Errno::ALREADY.raw_os_error() as u32
                } else {
                    match self.wrapper.init() {
                        Ok(()) => {
                            self.initialized = true;
                            0
                        }
                        Err(Error::Io(e)) => {
                            e.raw_os_error().unwrap_or(libc_eio()) as u32
                        }
                        Err(_) => libc_eio() as u32,
                    }
                };
                let ack = OperationData::new(OperationCode::InitAck, vec![status]);
                self.channel.send_frame(envelope::encode(&ack)?)?;
            }
            OperationCode::Configure => {
                let (streams, controls) = envelope::decode_configure(&data.payload)?;
                self.wrapper.configure(&streams, &controls);
                self.buffers.clear();
                self.plane_fds.clear();
            }
            OperationCode::MapBuffers => {
                self.buffers.map(&data.buffers)?;
                self.wrapper.map_buffers(&data.buffers);
                self.retain_plane_fds(&data.buffers, frame.take_fds());
            }
            OperationCode::UnmapBuffers => {
                let (unmapped, unknown) = self.buffers.unmap(&data.payload);
                if let Some(err) = unknown {
                    // The proxy filters unknown ids; one here means drift.
                    tracing::warn!(error = %err, "unmap of unknown buffer id");
                }
                if !unmapped.is_empty() {
                    self.wrapper.unmap_buffers(&unmapped);
                }
                for id in &unmapped {
                    self.plane_fds.remove(id);
                }
            }
            OperationCode::ProcessEvent => {
                // On the wire an event names its buffers by id; rebuild the
                // plane handles from the map-time grants.
                let mut buffers = Vec::with_capacity(data.buffers.len());
                for reference in &data.buffers {
                    let Some(handle) = self.buffers.get(reference.id) else {
                        // The proxy checks references; an unknown id here
                        // means drift.
                        tracing::warn!(
                            buffer = reference.id,
                            "event references unmapped buffer, dropping event"
                        );
                        return Ok(());
                    };
                    buffers.push(handle.clone());
                }
                let event =
                    OperationData::with_buffers(data.code, data.payload.clone(), buffers);
                self.wrapper.process_event(&event);
            }
            other => {
                tracing::warn!(code = ?other, "unexpected envelope code in host");
            }
        }
        Ok(())
    }
}

fn libc_eio() -> i32 {
    rustix::io::Errno::IO.raw_os_error()
}
