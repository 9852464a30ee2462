//! A single readiness-polling reactor shared by every connection.
//!
//! The design is a direct descendant of `PollMessageEngine` in the original
//! server: submit a syscall eagerly, and only fall back to `poll(2)` when it
//! would block. Unlike the original's raw `this`-capturing callbacks, every
//! pending operation here owns the buffer it is operating on and hands it
//! back to its completion, so there is nothing for a stale pointer to
//! dangle into.
//!
//! Bookkeeping (the pending-wait list and the ready queue) is serialized by
//! a single [`Mutex`]. Rather than release that lock around the blocking
//! `poll(2)` call -- which would let an unbounded number of threads pile
//! into the syscall at once -- we hold it for the whole of
//! [`Reactor::wait_for_event`], which both satisfies "at most one thread
//! parked inside the polling syscall at a time" and keeps the accounting
//! trivially consistent. The `Server` only ever lets a single dedicated
//! thread call `wait_for_event`, so in practice the lock is never a point
//! of contention (see `pool::Pool` and `server::Server::start`).

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::fd;

/// A unit of work handed back by [`Reactor::wait_for_event`]: either a
/// retried syscall attempt or a user completion, already bound to its
/// arguments.
pub type Task = Box<dyn FnOnce() + Send>;

type ReadCompletion = Box<dyn FnOnce(io::Result<usize>, Vec<u8>) + Send>;
type AcceptCompletion = Box<dyn FnOnce(io::Result<RawFd>) + Send>;

/// Matches bytes already read against a delimiter (or other termination
/// rule). `scanned_from` is the low watermark: the length the buffer had
/// the last time the predicate ran, so a delimiter search only needs to
/// revisit the last `delimiter.len() - 1` bytes plus whatever is new.
pub type Predicate = Arc<dyn Fn(&[u8], usize) -> Option<usize> + Send + Sync>;

/// Builds a [`Predicate`] that matches the end of a fixed byte sequence,
/// e.g. `delimiter(b"\r\n")` for line-oriented protocols.
pub fn delimiter(needle: &'static [u8]) -> Predicate {
    Arc::new(move |buf: &[u8], scanned_from: usize| {
        if buf.len() < needle.len() {
            return None;
        }
        let start = scanned_from.saturating_sub(needle.len() - 1);
        buf[start..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|i| start + i + needle.len())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct Wait {
    fd: RawFd,
    direction: Direction,
    retry: Task,
}

struct State {
    waits: Vec<Wait>,
    ready: VecDeque<Task>,
}

/// The shared readiness-polling reactor. Cheap to clone (it is always
/// handed around as `Arc<Reactor>`); every submission method takes
/// `self: &Arc<Self>` so it can capture an owned handle in the retry
/// closure it stashes away on `EWOULDBLOCK`.
pub struct Reactor {
    state: Mutex<State>,
    interrupted: AtomicBool,
}

const MAX_GROWABLE_BUFFER: usize = 64 * 1024;
const GROWTH_STEP: usize = 1024;

impl Reactor {
    pub fn new() -> Arc<Reactor> {
        Arc::new(Reactor {
            state: Mutex::new(State {
                waits: Vec::new(),
                ready: VecDeque::new(),
            }),
            interrupted: AtomicBool::new(false),
        })
    }

    /// Signals every worker parked in [`Reactor::wait_for_event`] to stop
    /// blocking and return a no-op task. Idempotent, and permanent: once
    /// set there is no way to "un-interrupt" a reactor, matching that a
    /// reactor is torn down along with its server, never paused.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Drops any pending wait registered for `fd`, in either direction,
    /// without ever invoking its retry closure. A pending wait's retry
    /// closure owns whatever the in-flight operation captured (the socket
    /// or file the completion was going to act on), so dropping it in place
    /// is what actually closes the descriptor -- there is no separate
    /// `close(2)` call site here, and there must not be one, since the
    /// closure's own `Drop` impl already owns that responsibility exactly
    /// once.
    ///
    /// Used by a torn-down `Connection`/`Server` to force its descriptors
    /// closed immediately rather than leaving them pinned inside the
    /// reactor's pending-wait set until an event (which may never come,
    /// once the reactor has been interrupted) revisits them.
    pub fn cancel(&self, fd: RawFd) {
        let mut state = self.state.lock().unwrap();
        state.waits.retain(|w| w.fd != fd);
    }

    fn register_wait(&self, fd: RawFd, direction: Direction, retry: Task) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(
            !state
                .waits
                .iter()
                .any(|w| w.fd == fd && w.direction == direction),
            "overlapping wait registered for the same (fd, direction)",
        );
        state.waits.push(Wait {
            fd,
            direction,
            retry,
        });
    }

    /// Blocks until a completion is ready to run, or the reactor has been
    /// interrupted, in which case it returns a no-op task immediately.
    /// Intended to be driven by exactly one thread at a time (see
    /// `server::Server::start`); the reactor itself does not assume that,
    /// it merely serializes correctly if violated.
    pub fn wait_for_event(&self) -> Task {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(task) = state.ready.pop_front() {
                return task;
            }
            if self.interrupted.load(Ordering::Acquire) {
                return Box::new(|| {});
            }

            let mut pollfds: Vec<libc::pollfd> = state
                .waits
                .iter()
                .map(|w| libc::pollfd {
                    fd: w.fd,
                    events: match w.direction {
                        Direction::Read => libc::POLLIN,
                        Direction::Write => libc::POLLOUT,
                    },
                    revents: 0,
                })
                .collect();

            // A 1ms timeout bounds how long we can hold `state` locked
            // without observing a fresh interrupt or a new registration.
            let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 1) };
            if n <= 0 {
                continue;
            }

            let mut i = 0;
            while i < pollfds.len() {
                if pollfds[i].revents != 0 {
                    let wait = state.waits.remove(i);
                    pollfds.remove(i);
                    state.ready.push_back(wait.retry);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Accepts a single connection on `fd`, which must be a listening
    /// socket already in non-blocking mode.
    pub fn accept(self: &Arc<Self>, fd: RawFd, completion: AcceptCompletion) {
        match fd::accept(fd) {
            Ok(newfd) => completion(Ok(newfd)),
            Err(e) if fd::would_block(&e) => {
                let reactor = Arc::clone(self);
                self.register_wait(
                    fd,
                    Direction::Read,
                    Box::new(move || reactor.accept(fd, completion)),
                );
            }
            Err(e) => completion(Err(e)),
        }
    }

    /// A single, possibly-partial read into `buf`. `Ok(0)` means the peer
    /// closed its end of the connection (or a regular file hit EOF).
    pub fn read_some(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, completion: ReadCompletion) {
        self.read_some_at(fd, buf, 0, completion)
    }

    fn read_some_at(
        self: &Arc<Self>,
        fd: RawFd,
        mut buf: Vec<u8>,
        offset: usize,
        completion: ReadCompletion,
    ) {
        match fd::read(fd, &mut buf[offset..]) {
            Ok(n) => completion(Ok(n), buf),
            Err(e) if fd::would_block(&e) => {
                let reactor = Arc::clone(self);
                self.register_wait(
                    fd,
                    Direction::Read,
                    Box::new(move || reactor.read_some_at(fd, buf, offset, completion)),
                );
            }
            Err(e) => completion(Err(e), buf),
        }
    }

    /// A single, possibly-partial write of `buf`.
    pub fn write_some(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, completion: ReadCompletion) {
        self.write_some_at(fd, buf, 0, completion)
    }

    fn write_some_at(
        self: &Arc<Self>,
        fd: RawFd,
        buf: Vec<u8>,
        offset: usize,
        completion: ReadCompletion,
    ) {
        match fd::write(fd, &buf[offset..]) {
            Ok(n) => completion(Ok(n), buf),
            Err(e) if fd::would_block(&e) => {
                let reactor = Arc::clone(self);
                self.register_wait(
                    fd,
                    Direction::Write,
                    Box::new(move || reactor.write_some_at(fd, buf, offset, completion)),
                );
            }
            Err(e) => completion(Err(e), buf),
        }
    }

    /// Reads until `buf` is completely full, the peer reaches EOF, or an
    /// error occurs. On success or EOF, `Ok(n)` is the total number of
    /// bytes filled in (which may be less than `buf.len()` on EOF).
    pub fn read(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, completion: ReadCompletion) {
        self.read_loop(fd, buf, 0, completion)
    }

    fn read_loop(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, done: usize, completion: ReadCompletion) {
        if done == buf.len() {
            completion(Ok(done), buf);
            return;
        }
        let reactor = Arc::clone(self);
        self.read_some_at(
            fd,
            buf,
            done,
            Box::new(move |res, buf| match res {
                Ok(0) => completion(Ok(done), buf),
                Ok(n) => reactor.read_loop(fd, buf, done + n, completion),
                Err(e) => completion(Err(e), buf),
            }),
        );
    }

    /// Writes the whole of `buf`, looping over `write_some` until done or
    /// an error occurs.
    pub fn write(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, completion: ReadCompletion) {
        self.write_loop(fd, buf, 0, completion)
    }

    fn write_loop(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, done: usize, completion: ReadCompletion) {
        let len = buf.len();
        if done == len {
            completion(Ok(done), buf);
            return;
        }
        let reactor = Arc::clone(self);
        self.write_some_at(
            fd,
            buf,
            done,
            Box::new(move |res, buf| match res {
                Ok(0) => completion(Ok(done), buf),
                Ok(n) => reactor.write_loop(fd, buf, done + n, completion),
                Err(e) => completion(Err(e), buf),
            }),
        );
    }

    /// Reads into a growable `buf` until `pred` reports a match, the peer
    /// reaches EOF, or the buffer cannot grow any further (reported as
    /// [`io::ErrorKind::OutOfMemory`]). `Ok(n)` gives the length of the
    /// match as reported by `pred`, not the full buffer length.
    pub fn read_until(
        self: &Arc<Self>,
        fd: RawFd,
        buf: Vec<u8>,
        pred: Predicate,
        completion: ReadCompletion,
    ) {
        self.read_until_scan(fd, buf, pred, completion)
    }

    fn read_until_scan(
        self: &Arc<Self>,
        fd: RawFd,
        buf: Vec<u8>,
        pred: Predicate,
        completion: ReadCompletion,
    ) {
        let scanned_from = 0;
        if let Some(m) = pred(&buf, scanned_from) {
            completion(Ok(m), buf);
            return;
        }
        if buf.len() >= MAX_GROWABLE_BUFFER {
            completion(Err(io::Error::from(io::ErrorKind::OutOfMemory)), buf);
            return;
        }
        let watermark = buf.len();
        let grow = GROWTH_STEP.min(MAX_GROWABLE_BUFFER - watermark);
        let mut buf = buf;
        buf.resize(watermark + grow, 0);
        let reactor = Arc::clone(self);
        self.read_some_at(
            fd,
            buf,
            watermark,
            Box::new(move |res, mut buf| match res {
                Ok(0) => {
                    buf.truncate(watermark);
                    completion(Ok(0), buf)
                }
                Ok(n) => {
                    buf.truncate(watermark + n);
                    if let Some(m) = pred(&buf, watermark) {
                        completion(Ok(m), buf);
                    } else {
                        reactor.read_until_scan(fd, buf, pred, completion);
                    }
                }
                Err(e) => {
                    buf.truncate(watermark);
                    completion(Err(e), buf)
                }
            }),
        );
    }
}
