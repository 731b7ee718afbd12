//! Unix domain socket channel with `SCM_RIGHTS` fd passing.
//!
//! Frames cross as a length-prefixed byte stream; the fd table of each frame
//! travels as ancillary data attached to the frame's first chunk. The socket
//! is nonblocking on both ends, with a bounded outbound queue absorbing
//! short stalls. A peer that stops draining long enough to overflow the
//! queue is treated as gone.

use super::{Channel, MAX_FDS_PER_FRAME};
use crate::envelope::{self, MAX_BODY_LEN, WireFrame};
use crate::error::{Error, Result};
use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, send, sendmsg,
};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

/// Frames allowed to pile up before the peer is declared unresponsive.
const OUTBOUND_QUEUE_LIMIT: usize = 64;

/// Ancillary space for a full fd table in either direction.
const ANCILLARY_SPACE: usize = rustix::cmsg_space!(ScmRights(MAX_FDS_PER_FRAME));

struct PartialFrame {
    bytes: Vec<u8>,
    offset: usize,
}

/// One end of a socket-backed envelope channel.
pub struct UnixChannel {
    stream: Option<UnixStream>,
    tx_queue: VecDeque<WireFrame>,
    /// Frame whose fds went out with the first chunk but whose bytes did not
    /// all fit in the socket buffer yet.
    tx_partial: Option<PartialFrame>,
    rx_buf: Vec<u8>,
    rx_fds: VecDeque<OwnedFd>,
}

impl UnixChannel {
    /// Create a connected pair of channel ends over `socketpair`.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: Some(stream),
            tx_queue: VecDeque::new(),
            tx_partial: None,
            rx_buf: Vec::new(),
            rx_fds: VecDeque::new(),
        })
    }

    /// Wrap an inherited socket fd, typically received over `exec`.
    ///
    /// # Safety
    ///
    /// `fd` must be a connected `SOCK_STREAM` Unix socket owned by the
    /// caller and not used elsewhere after this call.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Self::from_stream(unsafe { UnixStream::from_raw_fd(fd) })
    }

    fn sever(&mut self) {
        self.stream = None;
        self.tx_queue.clear();
        self.tx_partial = None;
    }

    fn flush_tx(&mut self) -> Result<()> {
        if let Some(partial) = self.tx_partial.as_mut() {
            let stream = self.stream.as_ref().ok_or(Error::PeerUnavailable)?;
            while partial.offset < partial.bytes.len() {
                match send(stream, &partial.bytes[partial.offset..], SendFlags::NOSIGNAL) {
                    Ok(n) => partial.offset += n,
                    Err(e) if is_would_block(e) => return Ok(()),
                    Err(Errno::INTR) => continue,
                    Err(e) => {
                        self.sever();
                        return Err(map_stream_errno(e));
                    }
                }
            }
            self.tx_partial = None;
        }

        loop {
            let Some(frame) = self.tx_queue.pop_front() else {
                return Ok(());
            };
            let stream = self.stream.as_ref().ok_or(Error::PeerUnavailable)?;
            match send_frame_start(stream, &frame) {
                Ok(n) if n == frame.bytes.len() => {}
                Ok(n) => {
                    self.tx_partial = Some(PartialFrame {
                        bytes: frame.bytes,
                        offset: n,
                    });
                    return Ok(());
                }
                Err(e) if is_would_block(e) => {
                    self.tx_queue.push_front(frame);
                    return Ok(());
                }
                Err(e) => {
                    self.sever();
                    return Err(map_stream_errno(e));
                }
            }
        }
    }

    fn fill_rx(&mut self) -> Result<()> {
        let mut buf = [0u8; 16384];
        loop {
            let Some(stream) = self.stream.as_ref() else {
                return Err(Error::PeerUnavailable);
            };
            let mut ancillary_space = [0u8; ANCILLARY_SPACE];
            let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);
            let mut iov = [IoSliceMut::new(&mut buf)];
            match recvmsg(stream, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC) {
                Ok(result) => {
                    for msg in ancillary.drain() {
                        if let RecvAncillaryMessage::ScmRights(rights) = msg {
                            self.rx_fds.extend(rights);
                        }
                    }
                    if result.bytes == 0 {
                        self.sever();
                        return Err(Error::PeerUnavailable);
                    }
                    self.rx_buf.extend_from_slice(&buf[..result.bytes]);
                }
                Err(e) if is_would_block(e) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(e) => {
                    self.sever();
                    return Err(map_stream_errno(e));
                }
            }
        }
    }

    fn extract_frame(&mut self) -> Result<Option<WireFrame>> {
        if self.rx_buf.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_le_bytes(self.rx_buf[..4].try_into().unwrap()) as usize;
        if body_len > MAX_BODY_LEN {
            self.sever();
            return Err(Error::MalformedEnvelope(format!(
                "inbound body of {body_len} bytes exceeds limit"
            )));
        }
        let total = 4 + body_len;
        if self.rx_buf.len() < total {
            return Ok(None);
        }

        let bytes: Vec<u8> = self.rx_buf.drain(..total).collect();
        let needed = envelope::fd_count(&bytes)?;
        if self.rx_fds.len() < needed {
            self.sever();
            return Err(Error::MalformedEnvelope(format!(
                "frame references {needed} fds, {} received",
                self.rx_fds.len()
            )));
        }
        let fds: Vec<OwnedFd> = self.rx_fds.drain(..needed).collect();
        Ok(Some(WireFrame { bytes, fds }))
    }
}

impl Channel for UnixChannel {
    fn send_frame(&mut self, frame: WireFrame) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::PeerUnavailable);
        }
        if frame.fds.len() > MAX_FDS_PER_FRAME {
            // Per-frame rejection; the channel itself stays up.
            return Err(Error::MalformedEnvelope(format!(
                "frame carries {} fds, limit is {MAX_FDS_PER_FRAME}",
                frame.fds.len()
            )));
        }
        self.tx_queue.push_back(frame);
        self.flush_tx()?;
        if self.tx_queue.len() > OUTBOUND_QUEUE_LIMIT {
            tracing::warn!(
                queued = self.tx_queue.len(),
                "outbound queue overflow, dropping peer"
            );
            self.sever();
            return Err(Error::PeerUnavailable);
        }
        Ok(())
    }

    fn try_recv_frame(&mut self) -> Result<Option<WireFrame>> {
        if self.tx_partial.is_some() || !self.tx_queue.is_empty() {
            self.flush_tx()?;
        }
        let fill = self.fill_rx();
        if let Some(frame) = self.extract_frame()? {
            return Ok(Some(frame));
        }
        fill.map(|()| None)
    }

    fn recv_frame_timeout(&mut self, timeout: Duration) -> Result<Option<WireFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_recv_frame()? {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(stream) = self.stream.as_ref() else {
                return Err(Error::PeerUnavailable);
            };
            let ms = (deadline - now).as_millis().min(i32::MAX as u128) as i32;
            let mut poll_fds = [PollFd::new(stream, PollFlags::IN)];
            match poll(&mut poll_fds, ms.max(1)) {
                Ok(_) | Err(Errno::INTR) => {}
                Err(e) => return Err(Error::System(e)),
            }
        }
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn close(&mut self) {
        self.sever();
        self.rx_buf.clear();
        self.rx_fds.clear();
    }
}

fn send_frame_start(stream: &UnixStream, frame: &WireFrame) -> rustix::io::Result<usize> {
    if frame.fds.is_empty() {
        return send(stream, &frame.bytes, SendFlags::NOSIGNAL);
    }

    let borrowed: Vec<_> = frame.fds.iter().map(AsFd::as_fd).collect();
    let mut ancillary_space = [0u8; ANCILLARY_SPACE];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(Errno::MSGSIZE);
    }

    let iov = [IoSlice::new(&frame.bytes)];
    sendmsg(stream, &iov, &mut ancillary, SendFlags::NOSIGNAL)
}

fn is_would_block(e: Errno) -> bool {
    e == Errno::WOULDBLOCK || e == Errno::AGAIN
}

fn map_stream_errno(e: Errno) -> Error {
    match e {
        Errno::PIPE | Errno::CONNRESET | Errno::NOTCONN => Error::PeerUnavailable,
        other => Error::System(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferHandle, BufferPlane};
    use crate::envelope::{OperationCode, OperationData, decode, encode};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn recv_blocking(ch: &mut UnixChannel) -> WireFrame {
        ch.recv_frame_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("frame within timeout")
    }

    fn memfd(name: &str) -> File {
        File::from(rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC).unwrap())
    }

    /// N distinct descriptors onto one file, for large fd-table frames.
    fn dup_table(file: &File, n: usize) -> Vec<OwnedFd> {
        (0..n)
            .map(|_| rustix::io::fcntl_dupfd_cloexec(file, 0).unwrap())
            .collect()
    }

    fn batch_from(fds: &[OwnedFd]) -> Vec<BufferHandle> {
        fds.chunks(4)
            .enumerate()
            .map(|(i, chunk)| {
                BufferHandle::with_planes(
                    i as u32,
                    chunk.iter().map(|fd| BufferPlane {
                        fd: fd.as_raw_fd(),
                        length: 16,
                        offset: 0,
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn test_roundtrip() {
        let (mut a, mut b) = UnixChannel::pair().unwrap();

        let data = OperationData::new(OperationCode::ProcessEvent, vec![7, 8, 9]);
        a.send_frame(encode(&data).unwrap()).unwrap();

        let frame = recv_blocking(&mut b);
        assert_eq!(decode(&frame).unwrap(), data);
    }

    #[test]
    fn test_fd_passing_delivers_working_descriptor() {
        let (mut a, mut b) = UnixChannel::pair().unwrap();

        let mut file = memfd("iris-test");
        file.write_all(b"plane-data").unwrap();

        let data = OperationData::with_buffers(
            OperationCode::MapBuffers,
            vec![],
            vec![BufferHandle::single_plane(5, file.as_raw_fd(), 10)],
        );
        a.send_frame(encode(&data).unwrap()).unwrap();

        let mut frame = recv_blocking(&mut b);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.buffers.len(), 1);

        // The received fd is a fresh descriptor into the same file.
        assert_ne!(decoded.buffers[0].planes[0].fd, file.as_raw_fd());
        let mut fds = frame.take_fds();
        let mut view = File::from(fds.remove(0));
        view.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        view.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "plane-data");
    }

    #[test]
    fn test_fd_table_at_limit_delivered() {
        let (mut a, mut b) = UnixChannel::pair().unwrap();

        let file = memfd("iris-limit");
        let table = dup_table(&file, MAX_FDS_PER_FRAME);
        let data = OperationData::with_buffers(OperationCode::MapBuffers, vec![], batch_from(&table));
        let frame = encode(&data).unwrap();
        drop(table);

        a.send_frame(frame).unwrap();
        let got = recv_blocking(&mut b);
        assert_eq!(got.fds.len(), MAX_FDS_PER_FRAME);
        let decoded = decode(&got).unwrap();
        assert_eq!(decoded.buffers.len(), MAX_FDS_PER_FRAME.div_ceil(4));
    }

    #[test]
    fn test_fd_table_over_limit_rejected_without_sever() {
        let (mut a, mut b) = UnixChannel::pair().unwrap();

        let file = memfd("iris-over");
        let table = dup_table(&file, MAX_FDS_PER_FRAME + 1);
        let data = OperationData::with_buffers(OperationCode::MapBuffers, vec![], batch_from(&table));
        let frame = encode(&data).unwrap();
        drop(table);

        assert!(matches!(
            a.send_frame(frame),
            Err(Error::MalformedEnvelope(_))
        ));

        // The channel stays usable for well-formed traffic.
        let data = OperationData::new(OperationCode::ProcessEvent, vec![1]);
        a.send_frame(encode(&data).unwrap()).unwrap();
        let got = recv_blocking(&mut b);
        assert_eq!(decode(&got).unwrap(), data);
    }

    #[test]
    fn test_many_frames_reassembled_in_order() {
        let (mut a, mut b) = UnixChannel::pair().unwrap();

        for i in 0..50u32 {
            let data = OperationData::new(OperationCode::ProcessEvent, vec![i; 64]);
            a.send_frame(encode(&data).unwrap()).unwrap();
        }
        for i in 0..50u32 {
            let frame = recv_blocking(&mut b);
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded.payload, vec![i; 64]);
        }
    }

    #[test]
    fn test_peer_drop_detected_on_recv() {
        let (mut a, b) = UnixChannel::pair().unwrap();
        drop(b);

        assert!(matches!(a.try_recv_frame(), Err(Error::PeerUnavailable)));
    }

    #[test]
    fn test_recv_timeout_expires_without_peer_traffic() {
        let (mut a, _b) = UnixChannel::pair().unwrap();
        let start = Instant::now();
        let got = a.recv_frame_timeout(Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_is_fatal_for_further_traffic() {
        let (mut a, _b) = UnixChannel::pair().unwrap();
        a.close();

        let data = OperationData::new(OperationCode::Init, vec![]);
        assert!(matches!(
            a.send_frame(encode(&data).unwrap()),
            Err(Error::PeerUnavailable)
        ));
        assert!(matches!(a.try_recv_frame(), Err(Error::PeerUnavailable)));
        assert!(a.poll_fd().is_none());
    }
}
