//! Single-threaded event reactor.
//!
//! Dispatches fd readability and timer expiry to registered callbacks from
//! one `poll` loop. This is the glue that lets a pipeline thread service
//! several isolated proxies without dedicating a thread to each channel.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

/// Identifier of a registered fd source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Identifier of an armed timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback = Box<dyn FnMut()>;

struct Source {
    fd: RawFd,
    callback: Callback,
}

struct Timer {
    deadline: Instant,
    period: Option<Duration>,
    callback: Callback,
}

/// Poll-driven dispatcher for fd readability and timers.
#[derive(Default)]
pub struct Reactor {
    sources: IndexMap<u64, Source>,
    timers: IndexMap<u64, Timer>,
    next_id: u64,
}

impl Reactor {
    /// Create an empty reactor.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a callback for readability of `fd`.
    ///
    /// The fd must stay valid until the source is unregistered.
    pub fn register(&mut self, fd: RawFd, callback: impl FnMut() + 'static) -> SourceId {
        let id = self.next_id();
        self.sources.insert(
            id,
            Source {
                fd,
                callback: Box::new(callback),
            },
        );
        SourceId(id)
    }

    /// Remove an fd source. Returns whether it was registered.
    pub fn unregister(&mut self, id: SourceId) -> bool {
        self.sources.shift_remove(&id.0).is_some()
    }

    /// Arm a one-shot timer.
    pub fn timer_once(&mut self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.arm(delay, None, Box::new(callback))
    }

    /// Arm a periodic timer firing every `period`, first after one period.
    pub fn timer_periodic(
        &mut self,
        period: Duration,
        callback: impl FnMut() + 'static,
    ) -> TimerId {
        self.arm(period, Some(period), Box::new(callback))
    }

    fn arm(&mut self, delay: Duration, period: Option<Duration>, callback: Callback) -> TimerId {
        let id = self.next_id();
        self.timers.insert(
            id,
            Timer {
                deadline: Instant::now() + delay,
                period,
                callback,
            },
        );
        TimerId(id)
    }

    /// Disarm a timer. Returns whether it was armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.shift_remove(&id.0).is_some()
    }

    /// Whether a timer is still armed. One-shot timers disarm on expiry.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id.0)
    }

    /// Wait up to `timeout` for activity and dispatch it.
    ///
    /// Returns the number of callbacks invoked, which may be zero when the
    /// timeout elapses quietly.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize> {
        let now = Instant::now();
        let wait = self
            .timers
            .values()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
            .map_or(timeout, |until_timer| timeout.min(until_timer));
        let wait_ms = wait.as_millis().min(i32::MAX as u128) as i32;

        // SAFETY: sources are required to outlive their registration.
        let mut poll_fds: Vec<PollFd<'_>> = self
            .sources
            .values()
            .map(|s| PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(s.fd) }, PollFlags::IN))
            .collect();

        match poll(&mut poll_fds, wait_ms) {
            Ok(_) | Err(Errno::INTR) => {}
            Err(e) => return Err(Error::System(e)),
        }

        let ready: Vec<u64> = self
            .sources
            .keys()
            .zip(&poll_fds)
            .filter(|(_, pfd)| !pfd.revents().is_empty())
            .map(|(&id, _)| id)
            .collect();
        drop(poll_fds);

        let mut dispatched = 0;
        for id in ready {
            // Take the entry out so the call does not hold a map borrow.
            if let Some(mut source) = self.sources.shift_remove(&id) {
                (source.callback)();
                dispatched += 1;
                self.sources.entry(id).or_insert(source);
            }
        }

        let now = Instant::now();
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            if let Some(mut timer) = self.timers.shift_remove(&id) {
                (timer.callback)();
                dispatched += 1;
                if let Some(period) = timer.period {
                    timer.deadline += period;
                    self.timers.entry(id).or_insert(timer);
                }
            }
        }

        Ok(dispatched)
    }

    /// Poll repeatedly until `done` returns true or `limit` elapses.
    ///
    /// Returns whether `done` was reached within the limit.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut() -> bool) -> Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll_once((deadline - now).min(Duration::from_millis(20)))?;
        }
    }
}
