//! Operation envelopes: the framed message unit of the IPA protocol.
//!
//! An envelope carries one operation in either direction, as a plain-data
//! record: operation code, a sequence of opaque 32-bit control values, and a
//! list of buffer handles. On the wire every envelope is length-framed so a
//! byte stream can be reassembled:
//!
//! ```text
//! u32 bodyLen | u32 code | u32 payloadCount | payload[u32 * payloadCount]
//!             | u32 bufferCount | bufferDesc[bufferCount]
//! bufferDesc = u32 id | u32 planeCount | plane[planeCount]
//! plane      = u32 handleRef | u32 length | u32 offset
//! ```
//!
//! All integers are little-endian. `handleRef` indexes the frame's
//! out-of-band fd table: Unix transports carry the fds as `SCM_RIGHTS`
//! ancillary data, the loopback transport carries them inline. The frame
//! owns its fd table; whatever a consumer does not [`take`] is closed when
//! the frame drops.
//!
//! [`take`]: WireFrame::take_fds

use crate::abi::layout::{IPA_CONTROL_NAME_MAX, IPA_MAX_PLANES};
use crate::buffer::{BufferHandle, BufferPlane};
use crate::controls::{ControlInfo, EntityControlMap, PixelFormat, StreamConfig, StreamConfigMap};
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Operation codes of the IPA protocol.
///
/// The enumeration is closed and stable across versions: new codes append,
/// existing codes are never renumbered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OperationCode {
    /// No operation.
    #[default]
    None = 0,
    /// One-time interface setup.
    Init = 1,
    /// Replace the stream and control configuration.
    Configure = 2,
    /// Grant access to a batch of buffers.
    MapBuffers = 3,
    /// Revoke access to a batch of buffer ids.
    UnmapBuffers = 4,
    /// Deliver one inbound event to the algorithm.
    ProcessEvent = 5,
    /// Algorithm-initiated frame notification.
    FrameAction = 6,
    /// Acknowledgment of `Init`, carrying a status word.
    InitAck = 7,
}

impl TryFrom<u32> for OperationCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(OperationCode::None),
            1 => Ok(OperationCode::Init),
            2 => Ok(OperationCode::Configure),
            3 => Ok(OperationCode::MapBuffers),
            4 => Ok(OperationCode::UnmapBuffers),
            5 => Ok(OperationCode::ProcessEvent),
            6 => Ok(OperationCode::FrameAction),
            7 => Ok(OperationCode::InitAck),
            _ => Err(Error::MalformedEnvelope(format!(
                "unknown operation code: {value}"
            ))),
        }
    }
}

/// One unit of protocol traffic, immutable once constructed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationData {
    /// What this envelope asks for or reports.
    pub code: OperationCode,
    /// Opaque 32-bit control values, meaning defined by `code`.
    pub payload: Vec<u32>,
    /// Buffer handles referenced by the operation.
    pub buffers: Vec<BufferHandle>,
}

impl OperationData {
    /// Create an envelope with payload words only.
    pub fn new(code: OperationCode, payload: Vec<u32>) -> Self {
        Self {
            code,
            payload,
            buffers: Vec::new(),
        }
    }

    /// Create an envelope carrying buffer handles.
    pub fn with_buffers(code: OperationCode, payload: Vec<u32>, buffers: Vec<BufferHandle>) -> Self {
        Self {
            code,
            payload,
            buffers,
        }
    }
}

/// Maximum accepted envelope body size. Larger frames are malformed.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// A framed envelope plus its out-of-band fd table.
///
/// The frame owns the fds in its table. A consumer that wants to keep them
/// past the frame's lifetime takes them with [`WireFrame::take_fds`]; the
/// rest close when the frame drops.
#[derive(Debug, Default)]
pub struct WireFrame {
    /// Full framed bytes, leading length prefix included.
    pub bytes: Vec<u8>,
    /// File descriptors referenced by `handleRef` indices, in order.
    pub fds: Vec<OwnedFd>,
}

impl WireFrame {
    /// Take ownership of the frame's fd table.
    ///
    /// Handles decoded from this frame keep naming the fds by raw number;
    /// the caller is now responsible for keeping them open while they do.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }
}

/// Encode an envelope into a framed message.
///
/// Plane fds are deduplicated into the frame's fd table in order of first
/// appearance; each plane's `handleRef` is the table index. The table holds
/// duplicates of the source fds, so a queued frame stays valid even if the
/// caller closes its handles. A plane without a real fd cannot cross a
/// process boundary: negative fds are rejected.
pub fn encode(data: &OperationData) -> Result<WireFrame> {
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut sources: Vec<RawFd> = Vec::new();
    let mut body = Vec::with_capacity(16 + data.payload.len() * 4);

    put_u32(&mut body, data.code as u32);
    put_u32(&mut body, data.payload.len() as u32);
    for &word in &data.payload {
        put_u32(&mut body, word);
    }
    put_u32(&mut body, data.buffers.len() as u32);
    for buffer in &data.buffers {
        put_u32(&mut body, buffer.id);
        put_u32(&mut body, buffer.planes.len() as u32);
        for plane in &buffer.planes {
            if plane.fd < 0 {
                return Err(Error::MalformedEnvelope(format!(
                    "buffer {} plane has no file descriptor",
                    buffer.id
                )));
            }
            let handle_ref = match sources.iter().position(|&fd| fd == plane.fd) {
                Some(idx) => idx,
                None => {
                    // SAFETY: the fd is non-negative and the caller's handle
                    // keeps it open for the duration of the call.
                    let source = unsafe { BorrowedFd::borrow_raw(plane.fd) };
                    fds.push(rustix::io::fcntl_dupfd_cloexec(source, 0)?);
                    sources.push(plane.fd);
                    sources.len() - 1
                }
            };
            put_u32(&mut body, handle_ref as u32);
            put_u32(&mut body, plane.length);
            put_u32(&mut body, plane.offset);
        }
    }

    let mut bytes = Vec::with_capacity(4 + body.len());
    put_u32(&mut bytes, body.len() as u32);
    bytes.extend_from_slice(&body);

    Ok(WireFrame { bytes, fds })
}

/// Decode a framed envelope.
///
/// Rejects truncated frames, unknown operation codes, out-of-range counts
/// and dangling `handleRef` indices.
///
/// Decoded planes name fds by raw number out of the frame's table; they are
/// valid only while the frame, or the table taken from it, is alive.
pub fn decode(frame: &WireFrame) -> Result<OperationData> {
    let mut cur = Cursor::new(&frame.bytes);

    let body_len = cur.u32()? as usize;
    if body_len > MAX_BODY_LEN {
        return Err(Error::MalformedEnvelope(format!(
            "body of {body_len} bytes exceeds limit"
        )));
    }
    if frame.bytes.len() != 4 + body_len {
        return Err(Error::MalformedEnvelope(format!(
            "frame is {} bytes, header says {}",
            frame.bytes.len(),
            4 + body_len
        )));
    }

    let code = OperationCode::try_from(cur.u32()?)?;

    let payload_count = cur.u32()? as usize;
    if payload_count > body_len / 4 {
        return Err(Error::MalformedEnvelope("payload count out of range".into()));
    }
    let mut payload = Vec::with_capacity(payload_count);
    for _ in 0..payload_count {
        payload.push(cur.u32()?);
    }

    let buffer_count = cur.u32()? as usize;
    if buffer_count > body_len / 8 {
        return Err(Error::MalformedEnvelope("buffer count out of range".into()));
    }
    let mut buffers = Vec::with_capacity(buffer_count);
    for _ in 0..buffer_count {
        let id = cur.u32()?;
        let plane_count = cur.u32()? as usize;
        if plane_count > IPA_MAX_PLANES {
            return Err(Error::MalformedEnvelope(format!(
                "buffer {id} declares {plane_count} planes"
            )));
        }
        let mut planes: SmallVec<[BufferPlane; 4]> = SmallVec::new();
        for _ in 0..plane_count {
            let handle_ref = cur.u32()? as usize;
            let fd = frame
                .fds
                .get(handle_ref)
                .map(AsRawFd::as_raw_fd)
                .ok_or_else(|| {
                    Error::MalformedEnvelope(format!("dangling handle ref {handle_ref}"))
                })?;
            planes.push(BufferPlane {
                fd,
                length: cur.u32()?,
                offset: cur.u32()?,
            });
        }
        buffers.push(BufferHandle { id, planes });
    }

    if !cur.at_end() {
        return Err(Error::MalformedEnvelope("trailing bytes in body".into()));
    }

    Ok(OperationData {
        code,
        payload,
        buffers,
    })
}

/// Number of fd-table entries a complete framed body references.
///
/// Transports use this to associate received ancillary fds with the frame
/// they belong to, without fully decoding the envelope.
pub fn fd_count(frame_bytes: &[u8]) -> Result<usize> {
    let mut cur = Cursor::new(frame_bytes);
    let _body_len = cur.u32()?;
    let _code = cur.u32()?;
    let payload_count = cur.u32()? as usize;
    cur.skip(payload_count * 4)?;
    let buffer_count = cur.u32()? as usize;
    let mut max_ref: Option<usize> = None;
    for _ in 0..buffer_count {
        let _id = cur.u32()?;
        let plane_count = cur.u32()? as usize;
        for _ in 0..plane_count {
            let handle_ref = cur.u32()? as usize;
            max_ref = Some(max_ref.map_or(handle_ref, |m| m.max(handle_ref)));
            cur.skip(8)?;
        }
    }
    Ok(max_ref.map_or(0, |m| m + 1))
}

/// Pack `configure` mappings into envelope payload words.
///
/// Layout: stream count, then per stream `{id, fourcc, width, height}`,
/// then entity count, then per entity `{entityId, controlCount}` followed by
/// per control a fixed-width name (as words) and `{min, max, default}`.
/// Insertion order of both mappings is preserved exactly.
pub fn encode_configure(streams: &StreamConfigMap, controls: &EntityControlMap) -> Vec<u32> {
    const NAME_WORDS: usize = IPA_CONTROL_NAME_MAX / 4;
    let mut words = Vec::new();

    words.push(streams.len() as u32);
    for (&id, config) in streams {
        words.push(id);
        words.push(config.pixel_format.as_u32());
        words.push(config.width);
        words.push(config.height);
    }

    words.push(controls.len() as u32);
    for (&entity_id, map) in controls {
        words.push(entity_id);
        words.push(map.len() as u32);
        for (name, info) in map {
            let packed = crate::abi::layout::pack_control_name(name);
            for chunk in packed.chunks_exact(4) {
                words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            debug_assert_eq!(packed.len() / 4, NAME_WORDS);
            words.push(info.min as u32);
            words.push(info.max as u32);
            words.push(info.default as u32);
        }
    }

    words
}

/// Reconstruct `configure` mappings from envelope payload words.
pub fn decode_configure(words: &[u32]) -> Result<(StreamConfigMap, EntityControlMap)> {
    const NAME_WORDS: usize = IPA_CONTROL_NAME_MAX / 4;
    let mut it = WordCursor::new(words);

    let stream_count = it.next()? as usize;
    let mut streams = StreamConfigMap::with_capacity(stream_count);
    for _ in 0..stream_count {
        let stream_id = it.next()?;
        let config = StreamConfig {
            stream_id,
            pixel_format: PixelFormat(it.next()?),
            width: it.next()?,
            height: it.next()?,
        };
        streams.insert(stream_id, config);
    }

    let entity_count = it.next()? as usize;
    let mut controls = EntityControlMap::with_capacity(entity_count);
    for _ in 0..entity_count {
        let entity_id = it.next()?;
        let control_count = it.next()? as usize;
        let mut map = crate::controls::ControlInfoMap::with_capacity(control_count);
        for _ in 0..control_count {
            let mut name_bytes = [0u8; IPA_CONTROL_NAME_MAX];
            for w in 0..NAME_WORDS {
                name_bytes[w * 4..w * 4 + 4].copy_from_slice(&it.next()?.to_le_bytes());
            }
            let name = crate::abi::layout::unpack_control_name(&name_bytes);
            let info = ControlInfo {
                min: it.next()? as i32,
                max: it.next()? as i32,
                default: it.next()? as i32,
            };
            map.insert(name, info);
        }
        controls.insert(entity_id, map);
    }

    if !it.at_end() {
        return Err(Error::MalformedEnvelope(
            "trailing configure payload words".into(),
        ));
    }

    Ok((streams, controls))
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::MalformedEnvelope("truncated envelope".into()))?;
        self.pos = end;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(Error::MalformedEnvelope("truncated envelope".into()));
        }
        self.pos = end;
        Ok(())
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

struct WordCursor<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> WordCursor<'a> {
    fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    fn next(&mut self) -> Result<u32> {
        let word = self
            .words
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::MalformedEnvelope("truncated configure payload".into()))?;
        self.pos += 1;
        Ok(word)
    }

    fn at_end(&self) -> bool {
        self.pos == self.words.len()
    }
}
