//! The event loop: task queue, timer wheel and selector, all confined to
//! the single OS thread a `Cpu` owns for its whole lifetime.
//!
//! Mirrors the teacher's `thread_local! LOCAL_RUNTIME` + free-function
//! idiom (`runtime::spawn`, `runtime::park`) rather than threading an
//! explicit `&Cpu` through every task: since exactly one `Cpu` ever runs on
//! a given OS thread, its mutable state lives in thread-local cells and
//! free functions reach into them. `CpuHandle` is the one type that
//! actually crosses threads — a cheap, `Send + Sync` address used to hand
//! work to a CPU from anywhere.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use slab::Slab;

use crate::config::Config;
use crate::error::Error;
use crate::future::Future;
use crate::selector::Selector;
use crate::stream::{Channel, ListenerDispatch, Registration};
use crate::timer::TimerWheel;

type LocalTask = Box<dyn FnOnce()>;
type CrossTask = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_ID: Cell<Option<usize>> = Cell::new(None);
    static CURRENT_HANDLE: RefCell<Option<CpuHandle>> = RefCell::new(None);
    static LOCAL_QUEUE: RefCell<VecDeque<LocalTask>> = RefCell::new(VecDeque::new());
    static TIMERS: RefCell<TimerWheel> = RefCell::new(TimerWheel::new());
    static SELECTOR: RefCell<Option<Selector>> = RefCell::new(None);
    static REGISTRY: RefCell<HashMap<mio::Token, Registration>> = RefCell::new(HashMap::new());
    static NEXT_TOKEN: Cell<usize> = Cell::new(0);
    static RELAYS: RefCell<Slab<Box<dyn FnOnce(Box<dyn std::any::Any>)>>> = RefCell::new(Slab::new());
    /// Every still-pending future's fail closure, keyed by a slab token the
    /// future stores in `Inner::pending_token`. Registered in
    /// `Future::new`, deregistered the moment a future leaves `Pending`
    /// (successfully or not); whatever is left here when a CPU halts is, by
    /// definition, still pending, and gets failed with `Error::Shutdown`.
    static PENDING: RefCell<Slab<Box<dyn FnOnce(Error)>>> = RefCell::new(Slab::new());
}

/// The CPU the currently running code is executing on, if any.
pub fn current_id() -> Option<usize> {
    CURRENT_ID.with(|c| c.get())
}

pub(crate) fn schedule_local(task: LocalTask) {
    LOCAL_QUEUE.with(|q| q.borrow_mut().push_back(task));
}

pub(crate) fn with_selector<R>(f: impl FnOnce(&mut Selector) -> R) -> R {
    SELECTOR.with(|s| f(s.borrow_mut().as_mut().expect("no selector bound to this thread")))
}

pub(crate) fn next_token() -> mio::Token {
    NEXT_TOKEN.with(|c| {
        let v = c.get();
        c.set(v + 1);
        mio::Token(v)
    })
}

pub(crate) fn register_readiness(token: mio::Token, registration: Registration) {
    REGISTRY.with(|r| {
        r.borrow_mut().insert(token, registration);
    });
}

pub(crate) fn unregister_readiness(token: mio::Token) {
    REGISTRY.with(|r| {
        r.borrow_mut().remove(&token);
    });
}

fn register_relay<R: 'static>(future: Future<R>) -> usize {
    RELAYS.with(|r| {
        r.borrow_mut().insert(Box::new(move |boxed: Box<dyn std::any::Any>| {
            match boxed.downcast::<std::thread::Result<R>>() {
                Ok(result) => match *result {
                    Ok(v) => {
                        let _ = future.set_value(v);
                    }
                    Err(_) => {
                        let _ = future.set_failure(Error::Invariant("task panicked"));
                    }
                },
                Err(_) => {}
            }
        }))
    })
}

fn complete_relay(id: usize, boxed: Box<dyn std::any::Any>) {
    let cb = RELAYS.with(|r| r.borrow_mut().try_remove(id));
    if let Some(cb) = cb {
        cb(boxed);
    }
}

/// Registers a future's fail closure while it's pending; returns the token
/// to deregister with once it resolves.
pub(crate) fn register_pending(fail: Box<dyn FnOnce(Error)>) -> usize {
    PENDING.with(|p| p.borrow_mut().insert(fail))
}

pub(crate) fn unregister_pending(token: usize) {
    PENDING.with(|p| {
        p.borrow_mut().try_remove(token);
    });
}

/// Fails every future still pending on this CPU with `Error::Shutdown`.
/// Called once, from `Cpu::shutdown`, after the loop has stopped ticking.
fn fail_all_pending_futures() {
    let callbacks: Vec<_> = PENDING.with(|p| p.borrow_mut().drain().collect());
    for callback in callbacks {
        callback(Error::Shutdown);
    }
}

/// A cheap, cloneable, `Send + Sync` address for a CPU. This is the only
/// type in the crate meant to cross thread boundaries.
#[derive(Clone)]
pub struct CpuHandle {
    id: usize,
    sender: crossbeam_channel::Sender<CrossTask>,
    running: Arc<AtomicBool>,
}

impl CpuHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The CPU the currently running task is on, if any.
    pub fn current() -> Option<CpuHandle> {
        CURRENT_HANDLE.with(|h| h.borrow().clone())
    }

    /// Enqueues `task`, returning a future resolved with its result.
    ///
    /// If called on this CPU's own thread, `task` is pushed straight to the
    /// local queue. Otherwise the caller must itself be running on some
    /// CPU: the returned future is owned by *that* CPU, `task` runs on the
    /// target, and its result is relayed back across the cross-CPU channel
    /// — the future's `Rc` cell never leaves the thread it was built on,
    /// only the plain `Send` result value does.
    pub fn schedule<F, R>(&self, task: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if current_id() == Some(self.id) {
            let future = Future::new();
            let future2 = future.clone();
            schedule_local(Box::new(move || resolve_with(task, future2)));
            return future;
        }

        let origin = CURRENT_HANDLE.with(|h| h.borrow().clone()).unwrap_or_else(|| {
            panic!("CpuHandle::schedule called off any CPU thread; use CpuHandle::spawn to bootstrap")
        });
        let future = Future::new();
        let relay_id = register_relay(future.clone());
        let origin_sender = origin.sender.clone();
        let _ = self.sender.send(Box::new(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
            let _ = origin_sender.send(Box::new(move || {
                complete_relay(relay_id, Box::new(result));
            }));
        }));
        future
    }

    /// Fire-and-forget submission with no returned future; used to bootstrap
    /// the first tasks from outside any CPU thread (see `CpuSet::start`).
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if current_id() == Some(self.id) {
            schedule_local(Box::new(task));
        } else {
            let _ = self.sender.send(Box::new(task));
        }
    }

    pub fn halt(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn resolve_with<F, R>(task: F, future: Future<R>)
where
    F: FnOnce() -> R,
    R: 'static,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        Ok(v) => {
            let _ = future.set_value(v);
        }
        Err(_) => {
            let _ = future.set_failure(Error::Invariant("task panicked"));
        }
    }
}

/// Status returned by a [`repeat`] step.
pub enum Status<R> {
    Continue,
    Stop,
    StopWith(R),
}

/// Runs `step` repeatedly (re-enqueuing via the task queue, never by direct
/// recursion) until it reports `Stop`/`StopWith`, or its future fails.
pub fn repeat<R, F>(step: F) -> Future<Option<R>>
where
    R: 'static,
    F: FnMut() -> Future<Status<R>> + 'static,
{
    let outer = Future::new();
    drive_repeat(step, outer.clone());
    outer
}

fn drive_repeat<R, F>(mut step: F, outer: Future<Option<R>>)
where
    R: 'static,
    F: FnMut() -> Future<Status<R>> + 'static,
{
    let inner = step();
    let outer_ok = outer.clone();
    let _ = inner.on_success(move |status| match status {
        Status::Stop => {
            let _ = outer_ok.set_value(None);
        }
        Status::StopWith(r) => {
            let _ = outer_ok.set_value(Some(r));
        }
        Status::Continue => {
            schedule_local(Box::new(move || drive_repeat(step, outer_ok)));
        }
    });
    let _ = inner.on_failure(move |e| {
        let _ = outer.set_failure(e);
    });
}

/// `loop_`'s internal cousin used by channels: re-invokes `step` as long as
/// its future keeps succeeding, terminating (and propagating failure to
/// `on_failure`) the moment it fails.
pub fn loop_while<F>(mut step: F, on_failure: Rc<dyn Fn(Error)>)
where
    F: FnMut() -> Future<()> + 'static,
{
    let inner = step();
    let on_failure2 = on_failure.clone();
    let _ = inner.on_success(move |_| {
        schedule_local(Box::new(move || loop_while(step, on_failure2)));
    });
    let _ = inner.on_failure(move |e| on_failure(e));
}

/// Registers `task` in the timer heap; runs strictly at or after `now + delay`.
pub fn sleep<R, F>(delay: Duration, task: F) -> Future<R>
where
    R: 'static,
    F: FnOnce() -> R + 'static,
{
    let future = Future::new();
    let future2 = future.clone();
    let deadline = Instant::now() + delay;
    TIMERS.with(|t| {
        t.borrow_mut().schedule(
            deadline,
            Box::new(move || resolve_with(task, future2)),
        )
    });
    future
}

enum Outcome<T> {
    Pending,
    Value(T),
    Failure(Error),
}

/// Collects results of `futures` in their input order; the first input
/// (by index, not completion order) to fail terminates the aggregate with
/// that failure.
pub fn sequence<T: 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    let n = futures.len();
    let outer = Future::<Vec<T>>::new();
    if n == 0 {
        let _ = outer.set_value(Vec::new());
        return outer;
    }

    let outcomes: Rc<RefCell<Vec<Outcome<T>>>> =
        Rc::new(RefCell::new((0..n).map(|_| Outcome::Pending).collect()));
    let settled = Rc::new(Cell::new(0usize));

    for (i, fut) in futures.iter().enumerate() {
        let outcomes_ok = outcomes.clone();
        let settled_ok = settled.clone();
        let outer_ok = outer.clone();
        let _ = fut.on_success(move |v| {
            outcomes_ok.borrow_mut()[i] = Outcome::Value(v);
            settled_ok.set(settled_ok.get() + 1);
            if settled_ok.get() == n {
                finish_sequence(&outcomes_ok, &outer_ok);
            }
        });

        let outcomes_err = outcomes.clone();
        let settled_err = settled.clone();
        let outer_err = outer.clone();
        let _ = fut.on_failure(move |e| {
            outcomes_err.borrow_mut()[i] = Outcome::Failure(e);
            settled_err.set(settled_err.get() + 1);
            if settled_err.get() == n {
                finish_sequence(&outcomes_err, &outer_err);
            }
        });
    }
    outer
}

fn finish_sequence<T: 'static>(outcomes: &Rc<RefCell<Vec<Outcome<T>>>>, outer: &Future<Vec<T>>) {
    let items = std::mem::replace(&mut *outcomes.borrow_mut(), Vec::new());
    let first_failure_index = items.iter().position(|o| matches!(o, Outcome::Failure(_)));
    match first_failure_index {
        Some(idx) => {
            let mut items = items;
            if let Outcome::Failure(e) = std::mem::replace(&mut items[idx], Outcome::Pending) {
                let _ = outer.set_failure(e);
            }
        }
        None => {
            let values = items
                .into_iter()
                .map(|o| match o {
                    Outcome::Value(v) => v,
                    _ => unreachable!("settled without a value or failure"),
                })
                .collect();
            let _ = outer.set_value(values);
        }
    }
}

/// A group of CPUs presumed to share a NUMA node. Immutable after
/// construction.
#[derive(Clone)]
pub struct Pack {
    handles: Vec<CpuHandle>,
}

impl Pack {
    /// Uniform placement across the pack's CPUs. Earlier releases used
    /// `nextInt(0, size - 1)`, silently excluding the last CPU for
    /// size >= 2; this picks uniformly over the full `0..size` range.
    pub fn get_cpu(&self) -> CpuHandle {
        let idx = rand::thread_rng().gen_range(0..self.handles.len());
        self.handles[idx].clone()
    }

    /// Picks a CPU in the pack and schedules the `Channel`'s construction
    /// (and selector registration) on it, so both happen on the CPU that
    /// will own them for the socket's whole lifetime.
    pub(crate) fn register(
        &self,
        socket: mio::net::TcpStream,
        on_connect: Arc<dyn Fn(Channel) + Send + Sync>,
        on_failure: Arc<dyn Fn(Error) + Send + Sync>,
    ) {
        let target = self.get_cpu();
        target.spawn(move || match Channel::new(socket) {
            Ok(channel) => on_connect(channel),
            Err(e) => on_failure(Error::Io(e)),
        });
    }
}

/// Immutable mapping from pack id to [`Pack`], plus the flat list of every
/// CPU for id lookup. The static topology an application builds once.
pub struct CpuSet {
    packs: Vec<Pack>,
    all: Vec<CpuHandle>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

pub struct CpuSetBuilder {
    config: Config,
    pack_cpu_ids: Vec<Vec<usize>>,
}

impl CpuSet {
    pub fn builder() -> CpuSetBuilder {
        CpuSetBuilder {
            config: Config::default(),
            pack_cpu_ids: Vec::new(),
        }
    }

    pub fn pack(&self, index: usize) -> &Pack {
        &self.packs[index]
    }

    pub fn cpu(&self, id: usize) -> &CpuHandle {
        &self.all[id]
    }

    /// Fails every pending future with a shutdown error and stops each
    /// CPU's loop after its current tick.
    pub fn halt(&mut self) {
        for handle in &self.all {
            handle.halt();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl CpuSetBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Adds a pack spanning the given CPU ids (0-indexed, assigned in
    /// construction order across all packs).
    pub fn add_pack(mut self, cpu_count: usize) -> Self {
        let start = self.pack_cpu_ids.iter().map(|p| p.len()).sum();
        self.pack_cpu_ids.push((start..start + cpu_count).collect());
        self
    }

    /// Spawns one OS thread per CPU and starts each one's event loop.
    pub fn build(self) -> io::Result<CpuSet> {
        let total: usize = self.pack_cpu_ids.iter().map(|p| p.len()).sum();
        let mut handles = Vec::with_capacity(total);
        let mut cpus = Vec::with_capacity(total);
        for id in 0..total {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let running = Arc::new(AtomicBool::new(true));
            let handle = CpuHandle {
                id,
                sender,
                running: running.clone(),
            };
            handles.push(handle.clone());
            cpus.push(Cpu {
                id,
                handle,
                inbox: receiver,
                running,
                config: self.config.clone(),
                failure_sink: Box::new(|e| tracing::error!(error = %e, "uncaught fire-and-forget failure")),
            });
        }

        let packs = self
            .pack_cpu_ids
            .iter()
            .map(|ids| Pack {
                handles: ids.iter().map(|&id| handles[id].clone()).collect(),
            })
            .collect();

        let mut threads = Vec::with_capacity(total);
        for cpu in cpus {
            let id = cpu.id;
            threads.push(
                std::thread::Builder::new()
                    .name(format!("cpu-{id}"))
                    .spawn(move || cpu.run())?,
            );
        }

        Ok(CpuSet {
            packs,
            all: handles,
            threads,
        })
    }
}

/// The event loop proper. Runs entirely on the OS thread `run` is called
/// from; all other mutable state (queue, timers, selector, registry) lives
/// in that thread's TLS, installed at the top of `run`.
pub(crate) struct Cpu {
    id: usize,
    handle: CpuHandle,
    inbox: crossbeam_channel::Receiver<CrossTask>,
    running: Arc<AtomicBool>,
    config: Config,
    failure_sink: Box<dyn Fn(Error) + Send + Sync>,
}

impl Cpu {
    pub fn run(self) {
        CURRENT_ID.with(|c| c.set(Some(self.id)));
        CURRENT_HANDLE.with(|h| *h.borrow_mut() = Some(self.handle.clone()));
        SELECTOR.with(|s| {
            *s.borrow_mut() = Some(
                Selector::new(self.config.selector_capacity).expect("selector initialization"),
            )
        });

        while self.running.load(Ordering::Relaxed) {
            self.tick();
        }
        self.shutdown();
    }

    fn tick(&self) {
        while let Ok(task) = self.inbox.try_recv() {
            schedule_local(task);
        }

        for _ in 0..self.config.task_batch {
            let task = LOCAL_QUEUE.with(|q| q.borrow_mut().pop_front());
            match task {
                Some(t) => {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(t)).is_err() {
                        (self.failure_sink)(Error::Invariant("task panicked"));
                    }
                }
                None => break,
            }
        }

        let now = Instant::now();
        let expired = TIMERS.with(|t| t.borrow_mut().expire(now));
        for cb in expired {
            schedule_local(cb);
        }

        let queue_empty = LOCAL_QUEUE.with(|q| q.borrow().is_empty());
        let timeout = if queue_empty {
            let wait = TIMERS.with(|t| t.borrow().next_deadline()).map_or(
                self.config.max_poll_wait,
                |deadline| deadline.saturating_duration_since(now).min(self.config.max_poll_wait),
            );
            Some(wait)
        } else {
            Some(Duration::ZERO)
        };

        let events = with_selector(|sel| sel.poll(timeout));
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                (self.failure_sink)(Error::Io(e));
                Vec::new()
            }
        };

        for (token, ready) in events {
            let registration = REGISTRY.with(|r| r.borrow().get(&token).cloned());
            if let Some(registration) = registration {
                match registration {
                    Registration::Channel(ch) => {
                        if ready.readable {
                            ch.on_readable();
                        }
                        if ready.writable {
                            ch.on_writable();
                        }
                    }
                    Registration::Listener(listener) => {
                        if ready.readable {
                            listener.accept_loop();
                        }
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        let registrations = REGISTRY.with(|r| r.borrow_mut().drain().map(|(_, v)| v).collect::<Vec<_>>());
        for registration in registrations {
            if let Registration::Channel(ch) = registration {
                ch.fail_all_pending(|| Error::Shutdown);
            }
        }
        // Fails every future still pending anywhere on this CPU — queued
        // locally, waiting on a timer, or relayed from another CPU — before
        // the queue and timer wheel are dropped with the thread. Order
        // matters: once this has run, nothing left in `LOCAL_QUEUE`/`TIMERS`
        // still owns a future anyone is watching, so dropping them unread is
        // safe.
        fail_all_pending_futures();
        LOCAL_QUEUE.with(|q| q.borrow_mut().clear());
    }
}

/// Binds and listens on `addr` on the calling CPU; accepted sockets are
/// handed to `pack` via [`Pack::register`], which may route them to any CPU
/// in that pack. Returns the bound address, so callers that pass port 0 can
/// read back the OS-assigned port.
pub fn listen(
    addr: SocketAddr,
    pack: Pack,
    on_connect: impl Fn(Channel) + Send + Sync + 'static,
    on_failure: impl Fn(Error) + Send + Sync + 'static,
) -> io::Result<SocketAddr> {
    let mut listener = mio::net::TcpListener::bind(addr)?;
    let bound = listener.local_addr()?;
    let token = next_token();
    with_selector(|sel| sel.register(&mut listener, token, mio::Interest::READABLE))?;
    let dispatch = Rc::new(ListenerDispatch {
        listener: RefCell::new(listener),
        on_connect: Arc::new(on_connect),
        on_failure: Arc::new(on_failure),
        pack,
    });
    register_readiness(token, Registration::Listener(dispatch));
    Ok(bound)
}

#[cfg(test)]
impl Cpu {
    /// Sets up just the thread-local CPU identity (no selector, no timer
    /// wheel) for unit tests that only need `current_id`/`schedule_local`.
    pub(crate) fn run_bare<F: FnOnce()>(id: usize, f: F) {
        let (sender, _receiver) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let handle = CpuHandle { id, sender, running };
        CURRENT_ID.with(|c| c.set(Some(id)));
        CURRENT_HANDLE.with(|h| *h.borrow_mut() = Some(handle));
        f();
        CURRENT_ID.with(|c| c.set(None));
        CURRENT_HANDLE.with(|h| *h.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    #[test]
    fn pack_get_cpu_covers_every_index_including_the_last() {
        // Regression test for the off-by-one in the source's
        // `nextInt(0, size - 1)`: with size = 2, index 1 must be reachable.
        let (s0, _r0) = crossbeam_channel::unbounded();
        let (s1, _r1) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let pack = Pack {
            handles: vec![
                CpuHandle { id: 0, sender: s0, running: running.clone() },
                CpuHandle { id: 1, sender: s1, running },
            ],
        };
        let mut saw_one = false;
        for _ in 0..500 {
            if pack.get_cpu().id() == 1 {
                saw_one = true;
                break;
            }
        }
        assert!(saw_one, "index 1 of a 2-cpu pack was never selected in 500 draws");
    }

    #[test]
    fn repeat_runs_step_until_stop() {
        Cpu::run_bare(0, || {
            let counter = Rc::new(StdCell::new(10));
            let runs = Rc::new(StdCell::new(0));
            let counter2 = counter.clone();
            let runs2 = runs.clone();
            let outer = repeat(move || {
                runs2.set(runs2.get() + 1);
                let fut = Future::new();
                let c = counter2.get();
                if c == 0 {
                    let _ = fut.set_value(Status::<()>::Stop);
                } else {
                    counter2.set(c - 1);
                    let _ = fut.set_value(Status::Continue);
                }
                fut
            });
            let done = Rc::new(StdCell::new(false));
            let done2 = done.clone();
            let _ = outer.on_success(move |_| done2.set(true));

            // Drain the local queue the way a real tick would, since
            // `repeat` re-enqueues on CONTINUE rather than recursing.
            loop {
                let task = LOCAL_QUEUE.with(|q| q.borrow_mut().pop_front());
                match task {
                    Some(t) => t(),
                    None => break,
                }
            }
            assert_eq!(runs.get(), 11);
            assert!(done.get());
        });
    }
}
