//! Per-socket read/transmit queues and the input/output stream pair that
//! drives bytes across a non-blocking socket.
//!
//! `InputStream`/`OutputStream` are never shared outside the `Channel` that
//! owns them; like the teacher's `net::tcp` streams they're `Rc<RefCell<_>>`
//! cells rather than `Arc<Mutex<_>>`, since a `Channel` never leaves the CPU
//! it was constructed on.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::buffer::Buffer;
use crate::cpu;
use crate::error::Error;
use crate::future::Future;

/// Outcome of a `read(consumer)` probe over the current read buffer.
pub enum ConsumerStatus<R> {
    Continue,
    StopWith(R),
}

struct PendingReader {
    /// Returns `true` once satisfied (and has already resolved its future).
    poll: Box<dyn FnMut(&mut Buffer) -> bool>,
    fail: Box<dyn FnOnce(Error)>,
}

pub(crate) struct InputStreamState {
    buffer: Buffer,
    reader: Option<PendingReader>,
    closed: bool,
}

/// Read side of a [`Channel`]: a growable buffer plus at most one pending
/// reader.
pub struct InputStream {
    inner: Rc<RefCell<InputStreamState>>,
}

impl InputStream {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(InputStreamState {
                buffer: Buffer::new(),
                reader: None,
                closed: false,
            })),
        }
    }

    /// Installs `consumer` as the stream's pending reader. Only one may be
    /// outstanding at a time; installing a second is a programming error.
    pub fn read<R, F>(&self, mut consumer: F) -> Result<Future<R>, Error>
    where
        R: 'static,
        F: FnMut(&mut Buffer) -> ConsumerStatus<R> + 'static,
    {
        let mut state = self.inner.borrow_mut();
        if state.reader.is_some() {
            return Err(Error::Invariant("InputStream already has a pending reader"));
        }
        let future = Future::new();
        let future2 = future.clone();
        let future3 = future.clone();
        state.reader = Some(PendingReader {
            poll: Box::new(move |buf: &mut Buffer| match consumer(buf) {
                ConsumerStatus::Continue => {
                    buf.reset_reader_index();
                    false
                }
                ConsumerStatus::StopWith(r) => {
                    let _ = future2.set_value(r);
                    true
                }
            }),
            fail: Box::new(move |e| {
                let _ = future3.set_failure(e);
            }),
        });
        drop(state);
        self.try_satisfy();
        Ok(future)
    }

    /// Requests exactly `n` readable bytes.
    pub fn read_exact(&self, n: usize) -> Result<Future<Buffer>, Error> {
        self.read(move |buf: &mut Buffer| {
            buf.mark_reader_index();
            if buf.readable_bytes() >= n {
                ConsumerStatus::StopWith(Buffer::from_bytes(buf.read_bytes(n)))
            } else {
                ConsumerStatus::Continue
            }
        })
    }

    pub fn read_short(&self) -> Result<Future<u16>, Error> {
        Ok(self.read_exact(2)?.map(|mut b| b.read_u16()))
    }

    pub fn read_int(&self) -> Result<Future<i32>, Error> {
        Ok(self.read_exact(4)?.map(|mut b| b.read_i32()))
    }

    pub fn read_long(&self) -> Result<Future<i64>, Error> {
        Ok(self.read_exact(8)?.map(|mut b| b.read_i64()))
    }

    pub fn read_float(&self) -> Result<Future<f32>, Error> {
        Ok(self.read_exact(4)?.map(|mut b| b.read_f32()))
    }

    pub fn read_double(&self) -> Result<Future<f64>, Error> {
        Ok(self.read_exact(8)?.map(|mut b| b.read_f64()))
    }

    fn try_satisfy(&self) {
        let mut state = self.inner.borrow_mut();
        let satisfied = match state.reader.as_mut() {
            Some(reader) => (reader.poll)(&mut state.buffer),
            None => false,
        };
        if satisfied {
            state.reader = None;
        }
        // Bytes before the reader cursor are either already copied out to a
        // satisfied reader or dead (no installed reader rewinds past them),
        // so they're safe to drop on every pass rather than only on close.
        state.buffer.compact();
    }

    fn fail_pending(&self, error: Error) {
        let mut state = self.inner.borrow_mut();
        state.closed = true;
        let reader = state.reader.take();
        drop(state);
        if let Some(reader) = reader {
            (reader.fail)(error);
        }
    }
}

impl Clone for InputStream {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// A unit of queued transmit work with its attached future.
enum TransferTask {
    Bytes {
        buf: Buffer,
        written: i64,
        future: Option<Future<i64>>,
    },
    File {
        file: std::fs::File,
        offset: u64,
        remaining: u64,
        transferred: i64,
        future: Option<Future<i64>>,
    },
}

impl TransferTask {
    /// Drives as much of this task as the socket accepts without blocking.
    /// Returns `true` when the task is fully done (success or failure).
    fn compute(&mut self, socket: &mut TcpStream) -> bool {
        match self {
            TransferTask::Bytes {
                buf,
                written,
                future,
            } => loop {
                if buf.readable_bytes() == 0 {
                    if let Some(f) = future.take() {
                        let _ = f.set_value(*written);
                    }
                    return true;
                }
                match socket.write(&buf[..]) {
                    Ok(0) => return true,
                    Ok(n) => {
                        let _ = buf.read_bytes(n);
                        *written += n as i64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(e) => {
                        if let Some(f) = future.take() {
                            let _ = f.set_failure(Error::Io(e));
                        }
                        return true;
                    }
                }
            },
            TransferTask::File {
                file,
                offset,
                remaining,
                transferred,
                future,
            } => loop {
                if *remaining == 0 {
                    if let Some(f) = future.take() {
                        let _ = f.set_value(*transferred);
                    }
                    return true;
                }
                match send_file_chunk(file, socket, *offset, *remaining) {
                    Ok(0) => return true,
                    Ok(n) => {
                        *offset += n as u64;
                        *remaining -= n as u64;
                        *transferred += n as i64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(e) => {
                        if let Some(f) = future.take() {
                            let _ = f.set_failure(Error::Io(e));
                        }
                        return true;
                    }
                }
            },
        }
    }
}

#[cfg(target_os = "linux")]
fn send_file_chunk(file: &std::fs::File, socket: &mut TcpStream, offset: u64, remaining: u64) -> io::Result<usize> {
    let count = remaining.min(1 << 20) as usize;
    let mut off = offset as libc::off_t;
    let n = unsafe { libc::sendfile(socket.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn send_file_chunk(file: &std::fs::File, socket: &mut TcpStream, offset: u64, remaining: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut chunk = vec![0u8; remaining.min(64 * 1024) as usize];
    let n = file.read_at(&mut chunk, offset)?;
    if n == 0 {
        return Ok(0);
    }
    socket.write(&chunk[..n])
}

pub(crate) struct OutputStreamState {
    queue: VecDeque<TransferTask>,
    write_interest: bool,
}

/// Write side of a [`Channel`]: an ordered queue of transmit tasks, at most
/// one active at a time.
pub struct OutputStream {
    inner: Rc<RefCell<OutputStreamState>>,
    socket: Rc<RefCell<TcpStream>>,
    token: Token,
}

impl OutputStream {
    fn new(socket: Rc<RefCell<TcpStream>>, token: Token) -> Self {
        Self {
            inner: Rc::new(RefCell::new(OutputStreamState {
                queue: VecDeque::new(),
                write_interest: false,
            })),
            socket,
            token,
        }
    }

    fn enqueue(&self, mut task: TransferTask) {
        let mut state = self.inner.borrow_mut();
        if state.queue.is_empty() {
            // Fast path: try to finish synchronously without ever touching
            // the queue or toggling interest.
            if task.compute(&mut self.socket.borrow_mut()) {
                return;
            }
            state.queue.push_back(task);
            self.set_write_interest(&mut state, true);
            return;
        }
        state.queue.push_back(task);
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut buf = Buffer::new();
        buf.write_bytes(bytes);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    pub fn write_short(&self, v: u16) {
        let mut buf = Buffer::new();
        buf.write_u16(v);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    pub fn write_int(&self, v: i32) {
        let mut buf = Buffer::new();
        buf.write_i32(v);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    pub fn write_long(&self, v: i64) {
        let mut buf = Buffer::new();
        buf.write_i64(v);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    pub fn write_float(&self, v: f32) {
        let mut buf = Buffer::new();
        buf.write_f32(v);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    pub fn write_double(&self, v: f64) {
        let mut buf = Buffer::new();
        buf.write_f64(v);
        self.enqueue(TransferTask::Bytes {
            buf,
            written: 0,
            future: None,
        });
    }

    /// Completes once every task enqueued before this call has drained.
    pub fn flush(&self) -> Future<()> {
        let future = Future::new();
        let inner_future = Future::new();
        let future_for_success = future.clone();
        let future_for_failure = future.clone();
        let _ = inner_future.on_success(move |_: i64| {
            let _ = future_for_success.set_value(());
        });
        let _ = inner_future.on_failure(move |e| {
            let _ = future_for_failure.set_failure(e);
        });
        self.enqueue(TransferTask::Bytes {
            buf: Buffer::new(),
            written: 0,
            future: Some(inner_future),
        });
        future
    }

    pub fn write_and_flush(&self, buffer: Buffer) -> Future<i64> {
        let future = Future::new();
        self.enqueue(TransferTask::Bytes {
            buf: buffer,
            written: 0,
            future: Some(future.clone()),
        });
        future
    }

    pub fn transfer_from(&self, file: std::fs::File, offset: u64, length: u64) -> Future<i64> {
        let future = Future::new();
        self.enqueue(TransferTask::File {
            file,
            offset,
            remaining: length,
            transferred: 0,
            future: Some(future.clone()),
        });
        future
    }

    fn set_write_interest(&self, state: &mut OutputStreamState, writable: bool) {
        if state.write_interest == writable {
            return;
        }
        state.write_interest = writable;
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        cpu::with_selector(|sel| {
            let _ = sel.set_interest(&mut *self.socket.borrow_mut(), self.token, interest);
        });
    }

    pub(crate) fn trigger_tx(&self) {
        let mut state = self.inner.borrow_mut();
        loop {
            let done = match state.queue.front_mut() {
                Some(task) => task.compute(&mut self.socket.borrow_mut()),
                None => break,
            };
            if done {
                state.queue.pop_front();
            } else {
                break;
            }
        }
        let writable = !state.queue.is_empty();
        self.set_write_interest(&mut state, writable);
    }

    fn fail_all(&self, error_factory: impl Fn() -> Error) {
        let mut state = self.inner.borrow_mut();
        for task in state.queue.drain(..) {
            let future = match task {
                TransferTask::Bytes { future, .. } => future,
                TransferTask::File { future, .. } => future,
            };
            if let Some(f) = future {
                let _ = f.set_failure(error_factory());
            }
        }
    }
}

impl Clone for OutputStream {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            socket: Rc::clone(&self.socket),
            token: self.token,
        }
    }
}

/// Pairs an [`InputStream`] and [`OutputStream`] on a single selector key.
/// Constructed on the CPU that will own it forever; never migrates.
pub struct Channel {
    pub input: InputStream,
    pub output: OutputStream,
    socket: Rc<RefCell<TcpStream>>,
    token: Token,
    closed: Rc<RefCell<bool>>,
}

impl Channel {
    pub(crate) fn new(mut socket: TcpStream) -> io::Result<Self> {
        let token = cpu::next_token();
        cpu::with_selector(|sel| sel.register(&mut socket, token, Interest::READABLE))?;
        let socket = Rc::new(RefCell::new(socket));
        let input = InputStream::new();
        let output = OutputStream::new(Rc::clone(&socket), token);
        let channel = Self {
            input,
            output,
            socket,
            token,
            closed: Rc::new(RefCell::new(false)),
        };
        cpu::register_readiness(token, Registration::Channel(channel.dispatch_handle()));
        Ok(channel)
    }

    fn dispatch_handle(&self) -> Rc<ChannelDispatch> {
        Rc::new(ChannelDispatch {
            input: self.input.clone(),
            output: self.output.clone(),
            socket: Rc::clone(&self.socket),
        })
    }

    pub fn close(&self) {
        if *self.closed.borrow() {
            return;
        }
        *self.closed.borrow_mut() = true;
        cpu::unregister_readiness(self.token);
        cpu::with_selector(|sel| {
            let _ = sel.deregister(&mut *self.socket.borrow_mut());
        });
        self.input.fail_pending(Error::Closed);
        self.output.fail_all(|| Error::Closed);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Type-erased handle the CPU's readiness registry dispatches into; kept
/// separate from `Channel` so closing/dropping the `Channel` handle itself
/// doesn't require unregistering (the registry entry is what the selector
/// actually dispatches to on each tick).
pub(crate) struct ChannelDispatch {
    input: InputStream,
    output: OutputStream,
    socket: Rc<RefCell<TcpStream>>,
}

impl ChannelDispatch {
    pub(crate) fn on_readable(&self) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = self.socket.borrow_mut().read(&mut buf);
            match read {
                Ok(0) => {
                    self.input.fail_pending(Error::Closed);
                    break;
                }
                Ok(n) => {
                    {
                        let mut state = self.input.inner.borrow_mut();
                        state.buffer.write_bytes(&buf[..n]);
                    }
                    self.input.try_satisfy();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.input.fail_pending(Error::Io(e));
                    break;
                }
            }
        }
    }

    pub(crate) fn on_writable(&self) {
        self.output.trigger_tx();
    }

    /// Fails the pending reader (if any) and every queued transmit task;
    /// used when the owning CPU is halting with sockets still registered.
    pub(crate) fn fail_all_pending(&self, error_factory: impl Fn() -> Error) {
        self.input.fail_pending(error_factory());
        self.output.fail_all(error_factory);
    }
}

pub(crate) enum Registration {
    Channel(Rc<ChannelDispatch>),
    Listener(Rc<ListenerDispatch>),
}

impl Clone for Registration {
    fn clone(&self) -> Self {
        match self {
            Registration::Channel(c) => Registration::Channel(Rc::clone(c)),
            Registration::Listener(l) => Registration::Listener(Rc::clone(l)),
        }
    }
}

/// Acceptable-ready dispatch target for a listening socket; see
/// [`crate::cpu::Cpu::listen`].
pub(crate) struct ListenerDispatch {
    pub(crate) listener: RefCell<mio::net::TcpListener>,
    pub(crate) on_connect: Arc<dyn Fn(Channel) + Send + Sync>,
    pub(crate) on_failure: Arc<dyn Fn(Error) + Send + Sync>,
    pub(crate) pack: crate::cpu::Pack,
}

impl ListenerDispatch {
    pub(crate) fn accept_loop(&self) {
        loop {
            match self.listener.borrow_mut().accept() {
                Ok((socket, _addr)) => {
                    self.pack
                        .register(socket, Arc::clone(&self.on_connect), Arc::clone(&self.on_failure));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    (self.on_failure)(Error::Io(e));
                    break;
                }
            }
        }
    }
}
