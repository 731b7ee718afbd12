//! Integration tests for the isolated execution path.
//!
//! These tests run a real host loop on a worker thread and drive it through
//! an `IsolatedProxy`, over both the in-memory channel and the Unix socket
//! channel, verifying that:
//! - The full operation lifecycle crosses the process boundary intact
//! - Operations are delivered in submission order
//! - Frame actions flow back to proxy subscribers
//! - A dead or misbehaving worker degrades the proxy without hanging it

use iris::abi::ContextWrapper;
use iris::abi::testing::{TestAlgorithm, TestLog};
use iris::buffer::{BufferHandle, BufferPlane};
use iris::controls::{ControlInfo, ControlInfoMap, EntityControlMap, PixelFormat, StreamConfig, StreamConfigMap};
use iris::envelope::{self, OperationCode, OperationData};
use iris::error::Error;
use iris::interface::IpaInterface;
use iris::link::{Channel, LoopbackChannel, MAX_FDS_PER_FRAME, UnixChannel};
use iris::proxy::{IpaHost, IsolatedProxy, ProxyState};
use iris::reactor::Reactor;
use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

/// Start a host loop for a fresh test algorithm on a worker thread.
fn start_host(channel: Box<dyn Channel>) -> (TestLog, thread::JoinHandle<()>) {
    let log = TestLog::default();
    // SAFETY: TestAlgorithm::create returns a valid context.
    let wrapper = unsafe { ContextWrapper::new(TestAlgorithm::create(log.clone())) };
    let mut host = IpaHost::new(channel, wrapper);
    let handle = thread::spawn(move || {
        host.run().expect("host loop failed");
    });
    (log, handle)
}

/// Poll `cond` until it holds or two seconds pass.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// A plane backed by real shared memory, so fds survive socket transfer.
fn memfd_buffer(id: u32) -> (BufferHandle, File) {
    let memfd = rustix::fs::memfd_create("iris-it", rustix::fs::MemfdFlags::CLOEXEC)
        .expect("memfd_create");
    let mut file = File::from(memfd);
    file.write_all(&id.to_le_bytes()).unwrap();
    (BufferHandle::single_plane(id, file.as_raw_fd(), 4), file)
}

fn sample_streams() -> StreamConfigMap {
    let mut streams = StreamConfigMap::new();
    for (id, fourcc) in [(2u32, *b"NV12"), (0, *b"BA10")] {
        streams.insert(
            id,
            StreamConfig {
                stream_id: id,
                pixel_format: PixelFormat::fourcc(fourcc),
                width: 1280,
                height: 720,
            },
        );
    }
    streams
}

fn sample_controls() -> EntityControlMap {
    let mut map = ControlInfoMap::new();
    map.insert(
        "ExposureTime".to_string(),
        ControlInfo {
            min: 100,
            max: 33333,
            default: 10000,
        },
    );
    map.insert(
        "AnalogueGain".to_string(),
        ControlInfo {
            min: 1,
            max: 16,
            default: 1,
        },
    );
    let mut controls = EntityControlMap::new();
    controls.insert(4, map);
    controls
}

// ============================================================================
// Full lifecycle
// ============================================================================

fn run_lifecycle(proxy_end: Box<dyn Channel>, host_end: Box<dyn Channel>) {
    let (log, handle) = start_host(host_end);
    let mut proxy = IsolatedProxy::attach(proxy_end);

    proxy.init().unwrap();
    assert_eq!(proxy.state(), ProxyState::Ready);
    assert!(matches!(proxy.init(), Err(Error::AlreadyInitialized)));

    let streams = sample_streams();
    let controls = sample_controls();
    proxy.configure(&streams, &controls).unwrap();
    assert!(wait_for(|| log.snapshot().streams == streams));
    assert_eq!(log.snapshot().controls, controls);

    let (buf1, _f1) = memfd_buffer(1);
    let (buf2, _f2) = memfd_buffer(2);
    proxy.map_buffers(&[buf1.clone(), buf2]).unwrap();
    assert!(wait_for(|| log.snapshot().mapped_ids == vec![1, 2]));

    // Duplicate ids are rejected at the proxy, never reaching the worker.
    let (dup, _f3) = memfd_buffer(2);
    assert!(matches!(
        proxy.map_buffers(&[dup]),
        Err(Error::DuplicateBuffer(2))
    ));

    let event = OperationData::with_buffers(
        OperationCode::ProcessEvent,
        vec![0x51, 0x52],
        vec![buf1],
    );
    proxy.process_event(&event).unwrap();
    assert!(wait_for(|| log.snapshot().events == vec![vec![0x51, 0x52]]));

    proxy.unmap_buffers(&[1]).unwrap();
    assert!(wait_for(|| log.snapshot().unmapped_ids == vec![1]));
    assert!(matches!(
        proxy.unmap_buffers(&[1]),
        Err(Error::UnknownBuffer(1))
    ));

    proxy.close();
    assert_eq!(proxy.state(), ProxyState::Closed);
    handle.join().unwrap();
}

#[test]
fn test_lifecycle_over_loopback() {
    let (proxy_end, host_end) = LoopbackChannel::pair(32);
    run_lifecycle(Box::new(proxy_end), Box::new(host_end));
}

#[test]
fn test_lifecycle_over_unix_socket() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    run_lifecycle(Box::new(proxy_end), Box::new(host_end));
}

// ============================================================================
// Ordering
// ============================================================================

/// Events submitted back-to-back arrive at the algorithm in order.
#[test]
fn test_event_order_preserved_across_socket() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    let (log, handle) = start_host(Box::new(host_end));
    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    proxy.init().unwrap();

    let count = 100u32;
    for i in 0..count {
        let event = OperationData::new(OperationCode::ProcessEvent, vec![i]);
        proxy.process_event(&event).unwrap();
    }

    assert!(wait_for(|| log.snapshot().events.len() == count as usize));
    let events = log.snapshot().events;
    let expected: Vec<Vec<u32>> = (0..count).map(|i| vec![i]).collect();
    assert_eq!(events, expected);

    proxy.close();
    handle.join().unwrap();
}

// ============================================================================
// Frame actions
// ============================================================================

fn run_frame_actions(proxy_end: Box<dyn Channel>, host_end: Box<dyn Channel>) {
    let (_log, handle) = start_host(host_end);
    let mut proxy = IsolatedProxy::attach(proxy_end);
    proxy.init().unwrap();
    let rx = proxy.frame_actions().subscribe();

    for frame in [10u32, 11, 12] {
        let event = OperationData::new(
            OperationCode::ProcessEvent,
            vec![TestAlgorithm::TRIGGER_FRAME_ACTION, frame],
        );
        proxy.process_event(&event).unwrap();
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.len() < 3 && Instant::now() < deadline {
        proxy.service().unwrap();
        while let Ok(Some(frame)) = rx.try_recv() {
            received.push(frame);
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(received, vec![10, 11, 12]);
    assert_eq!(proxy.frame_actions().last_frame(), Some(12));

    proxy.close();
    handle.join().unwrap();
}

#[test]
fn test_frame_actions_over_loopback() {
    let (proxy_end, host_end) = LoopbackChannel::pair(32);
    run_frame_actions(Box::new(proxy_end), Box::new(host_end));
}

#[test]
fn test_frame_actions_over_unix_socket() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    run_frame_actions(Box::new(proxy_end), Box::new(host_end));
}

// ============================================================================
// Buffer fd discipline
// ============================================================================

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").expect("proc fd dir").count()
}

/// Plane fds cross once at map time; a long stream of events referencing a
/// mapped buffer must not grow the process fd table.
#[test]
fn test_event_stream_does_not_accumulate_fds() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    let (log, handle) = start_host(Box::new(host_end));
    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    proxy.init().unwrap();

    let (buf, _f) = memfd_buffer(1);
    proxy.map_buffers(&[buf.clone()]).unwrap();
    assert!(wait_for(|| log.snapshot().mapped_ids == vec![1]));

    let before = open_fd_count();
    let count = 200usize;
    for i in 0..count {
        let event = OperationData::with_buffers(
            OperationCode::ProcessEvent,
            vec![i as u32],
            vec![buf.clone()],
        );
        proxy.process_event(&event).unwrap();
        if i % 32 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    assert!(wait_for(|| log.snapshot().events.len() == count));
    let after = open_fd_count();
    assert!(
        after <= before + 32,
        "fd table grew from {before} to {after} across {count} events"
    );

    proxy.close();
    handle.join().unwrap();
}

/// A map batch whose fd table exceeds what one frame can carry fails with a
/// clean error; the session survives and smaller batches still work.
#[test]
fn test_oversized_map_batch_fails_without_degrading() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    let (log, handle) = start_host(Box::new(host_end));
    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    proxy.init().unwrap();

    let file = File::from(
        rustix::fs::memfd_create("iris-big", rustix::fs::MemfdFlags::CLOEXEC).unwrap(),
    );
    let fds: Vec<_> = (0..MAX_FDS_PER_FRAME + 1)
        .map(|_| rustix::io::fcntl_dupfd_cloexec(&file, 0).unwrap())
        .collect();
    let batch: Vec<BufferHandle> = fds
        .chunks(4)
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
        .collect();

    assert!(matches!(
        proxy.map_buffers(&batch),
        Err(Error::MalformedEnvelope(_))
    ));
    drop(fds);
    assert_eq!(proxy.state(), ProxyState::Ready);

    // The rejected ids are free again and normal batches still flow.
    let (buf, _f) = memfd_buffer(0);
    proxy.map_buffers(&[buf]).unwrap();
    assert!(wait_for(|| log.snapshot().mapped_ids == vec![0]));

    proxy.close();
    handle.join().unwrap();
}

// ============================================================================
// Fault containment
// ============================================================================

/// A worker that dies after the handshake degrades the proxy quickly and
/// quietly; calls fail fast rather than hanging or crashing the caller.
#[test]
fn test_worker_death_degrades_proxy() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();

    let handle = thread::spawn(move || {
        let mut ch: Box<dyn Channel> = Box::new(host_end);
        let frame = ch
            .recv_frame_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("init envelope");
        let data = envelope::decode(&frame).unwrap();
        assert_eq!(data.code, OperationCode::Init);
        ch.send_frame(
            envelope::encode(&OperationData::new(OperationCode::InitAck, vec![0])).unwrap(),
        )
        .unwrap();
        // Channel drops here: the worker "crashes".
    });

    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    proxy.init().unwrap();
    handle.join().unwrap();

    let start = Instant::now();
    assert!(wait_for(|| proxy.service().is_err()));
    assert_eq!(proxy.state(), ProxyState::Degraded);

    let (buf, _f) = memfd_buffer(9);
    assert!(matches!(
        proxy.map_buffers(&[buf]),
        Err(Error::PeerUnavailable)
    ));
    assert!(start.elapsed() < Duration::from_secs(3));
}

/// Init failure in the worker surfaces as an error carrying the status.
#[test]
fn test_worker_init_failure_reported() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();

    let log = TestLog::default();
    let wrapper = unsafe {
        ContextWrapper::new(TestAlgorithm::create_with_init_result(log.clone(), -5))
    };
    let mut host = IpaHost::new(Box::new(host_end), wrapper);
    let handle = thread::spawn(move || {
        host.run().unwrap();
    });

    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    match proxy.init() {
        Err(Error::Io(e)) => assert_eq!(e.raw_os_error(), Some(5)),
        other => panic!("expected io error, got {other:?}"),
    }
    assert_eq!(proxy.state(), ProxyState::Degraded);

    proxy.close();
    handle.join().unwrap();
}

/// A worker that never answers init times out instead of blocking forever.
#[test]
fn test_unresponsive_worker_times_out() {
    let (proxy_end, _host_end) = UnixChannel::pair().unwrap();
    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end))
        .with_init_timeout(Duration::from_millis(50));

    let start = Instant::now();
    assert!(matches!(proxy.init(), Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(proxy.state(), ProxyState::Degraded);
}

// ============================================================================
// Reactor integration
// ============================================================================

/// Frame actions are delivered by servicing the proxy from a reactor
/// registered on the channel's fd, with no dedicated service thread.
#[test]
fn test_reactor_driven_service() {
    let (proxy_end, host_end) = UnixChannel::pair().unwrap();
    let (_log, handle) = start_host(Box::new(host_end));

    let mut proxy = IsolatedProxy::attach(Box::new(proxy_end));
    proxy.init().unwrap();
    let rx = proxy.frame_actions().subscribe();
    let fd = proxy.poll_fd().expect("socket channel has a poll fd");

    let proxy = Rc::new(RefCell::new(proxy));
    let serviced = Rc::clone(&proxy);
    let mut reactor = Reactor::new();
    reactor.register(fd, move || {
        let _ = serviced.borrow_mut().service();
    });

    let event = OperationData::new(
        OperationCode::ProcessEvent,
        vec![TestAlgorithm::TRIGGER_FRAME_ACTION, 77],
    );
    proxy.borrow_mut().process_event(&event).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got = None;
    while got.is_none() && Instant::now() < deadline {
        reactor.poll_once(Duration::from_millis(10)).unwrap();
        got = rx.try_recv().unwrap();
    }
    assert_eq!(got, Some(77));

    proxy.borrow_mut().close();
    handle.join().unwrap();
}
