//! Single-consumer, single-producer continuation cell bound to an owning CPU.
//!
//! Mirrors the ownership discipline of the teacher's `sync::oneshot_channel`:
//! a ref-counted, `RefCell`-guarded cell that is never touched from more than
//! one thread. Here the single thread is the CPU the future was constructed
//! on; methods check that invariant at runtime via [`crate::cpu::current_id`]
//! rather than leaning on `Send`/`Sync` bounds, since the cell's owner can
//! only be known once the runtime is wired up.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cpu;
use crate::error::Error;

enum State<T> {
    Pending,
    Value(T),
    Failure(Error),
    /// Terminal value already handed to its matching continuation.
    Done,
}

struct Inner<T> {
    owner: usize,
    state: State<T>,
    on_success: Option<Box<dyn FnOnce(T)>>,
    on_failure: Option<Box<dyn FnOnce(Error)>>,
    /// Token into the owning CPU's pending-future registry; present exactly
    /// while `state` is `Pending`, so a CPU halting mid-flight can fail this
    /// future instead of silently dropping it with the thread.
    pending_token: Option<usize>,
}

/// A future bound to the CPU that produced it.
///
/// Cloning shares the same underlying cell; the clone is cheap (an `Rc`
/// bump) and is how `schedule`/`map`/`flatMap` hand the same cell to both
/// the task that resolves it and the caller that observes it.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Future<T> {
    /// Constructs a pending future owned by the current CPU.
    ///
    /// Panics if called off a CPU thread; only the runtime itself (CPU,
    /// `map`, `flatMap`, ...) should ever call this.
    pub(crate) fn new() -> Self {
        let owner = cpu::current_id().expect("Future::new called off a CPU thread");
        let future = Self {
            inner: Rc::new(RefCell::new(Inner {
                owner,
                state: State::Pending,
                on_success: None,
                on_failure: None,
                pending_token: None,
            })),
        };
        let for_shutdown = future.clone();
        let token = cpu::register_pending(Box::new(move |e| {
            let _ = for_shutdown.set_failure(e);
        }));
        future.inner.borrow_mut().pending_token = Some(token);
        future
    }

    pub fn owner(&self) -> usize {
        self.inner.borrow().owner
    }

    fn check_affinity(&self) -> Result<(), Error> {
        let owner = self.inner.borrow().owner;
        if cpu::current_id() != Some(owner) {
            return Err(Error::Invariant(
                "future touched from a CPU other than its owner",
            ));
        }
        Ok(())
    }

    /// Resolves the future with a value. Must be called on the owning CPU.
    pub fn set_value(&self, value: T) -> Result<(), Error> {
        self.check_affinity()?;
        let continuation = {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Pending => {}
                _ => return Err(Error::Invariant("future already resolved")),
            }
            if let Some(token) = inner.pending_token.take() {
                cpu::unregister_pending(token);
            }
            inner.on_success.take()
        };
        match continuation {
            Some(k) => {
                self.inner.borrow_mut().state = State::Done;
                k(value);
            }
            None => {
                self.inner.borrow_mut().state = State::Value(value);
            }
        }
        Ok(())
    }

    /// Fails the future. Must be called on the owning CPU.
    pub fn set_failure(&self, error: Error) -> Result<(), Error> {
        self.check_affinity()?;
        let continuation = {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Pending => {}
                _ => return Err(Error::Invariant("future already resolved")),
            }
            if let Some(token) = inner.pending_token.take() {
                cpu::unregister_pending(token);
            }
            inner.on_failure.take().map(|k| {
                inner.state = State::Done;
                k
            })
        };
        match continuation {
            Some(k) => {
                k(error);
                Ok(())
            }
            None => {
                let mut inner = self.inner.borrow_mut();
                inner.state = State::Failure(error);
                Ok(())
            }
        }
    }

    /// Installs a success continuation. Runs synchronously inline if the
    /// future is already resolved with a value *before* this call (per the
    /// monotonic-state invariant, that only happens via a prior `set_value`
    /// in the same call stack); if the future resolved earlier and is now
    /// sitting in `State::Value`, the continuation is scheduled on the
    /// owning CPU's task queue instead of run inline.
    pub fn on_success<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(T) + 'static,
    {
        self.check_affinity()?;
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                if inner.on_success.is_some() {
                    return Err(Error::Invariant("success continuation already installed"));
                }
                inner.on_success = Some(Box::new(f));
                Ok(())
            }
            State::Value(_) => {
                let value = match std::mem::replace(&mut inner.state, State::Done) {
                    State::Value(v) => v,
                    _ => unreachable!(),
                };
                drop(inner);
                cpu::schedule_local(Box::new(move || f(value)));
                Ok(())
            }
            State::Failure(_) => Ok(()), // not the matching terminal state; nothing to deliver
            State::Done => Err(Error::Invariant("future already consumed")),
        }
    }

    /// Installs a failure continuation. See [`Future::on_success`] for the
    /// inline-vs-scheduled rule.
    pub fn on_failure<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(Error) + 'static,
    {
        self.check_affinity()?;
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                if inner.on_failure.is_some() {
                    return Err(Error::Invariant("failure continuation already installed"));
                }
                inner.on_failure = Some(Box::new(f));
                Ok(())
            }
            State::Failure(_) => {
                let error = match std::mem::replace(&mut inner.state, State::Done) {
                    State::Failure(e) => e,
                    _ => unreachable!(),
                };
                drop(inner);
                cpu::schedule_local(Box::new(move || f(error)));
                Ok(())
            }
            State::Value(_) => Ok(()),
            State::Done => Err(Error::Invariant("future already consumed")),
        }
    }

    /// Returns a new future on the same CPU that carries `f(value)` on
    /// success, propagating failure unchanged.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let out = Future::<U>::new();
        let out_ok = out.clone();
        let out_err = out.clone();
        let _ = self.on_success(move |v| {
            let _ = out_ok.set_value(f(v));
        });
        let _ = self.on_failure(move |e| {
            let _ = out_err.set_failure(e);
        });
        out
    }

    /// Returns a new future on the same CPU that runs `f` on success and
    /// adopts whatever future it returns, preserving `Future<U>`'s affinity
    /// to this CPU even when `f` hands back a future owned elsewhere (the
    /// cross-CPU case is relayed through [`crate::cpu::CpuHandle::schedule`]
    /// by the caller, never by `flat_map` itself reaching across threads).
    pub fn flat_map<U, F>(&self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        let out = Future::<U>::new();
        let out_success_arm = out.clone();
        let out_err = out.clone();
        let _ = self.on_success(move |v| {
            let inner_future = f(v);
            let out_ok2 = out_success_arm.clone();
            let out_err2 = out_success_arm.clone();
            let _ = inner_future.on_success(move |iv| {
                let _ = out_ok2.set_value(iv);
            });
            let _ = inner_future.on_failure(move |ie| {
                let _ = out_err2.set_failure(ie);
            });
        });
        let _ = self.on_failure(move |e| {
            let _ = out_err.set_failure(e);
        });
        out
    }

    /// Installs `f` as a success continuation and returns `self` for
    /// chaining; failures propagate untouched.
    pub fn and_then<F>(self, f: F) -> Self
    where
        F: FnOnce(&T) + 'static,
    {
        let _ = self.check(f);
        self
    }

    /// Peeks at a resolved value without consuming it, returning `self`.
    pub fn check<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&T) + 'static,
    {
        self.on_success(move |v| f(&v))
    }
}

/// `Future<T>` is inherently single-threaded (the whole point of CPU
/// affinity); this assertion documents that in the same spirit as the
/// teacher's `impls!` checks on its channel types.
#[cfg(test)]
mod affinity_assertions {
    use super::Future;

    #[test]
    fn future_is_not_send_or_sync() {
        assert!(impls::impls!(Future<i32>: !Send & !Sync));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn set_value_then_on_success_runs_inline() {
        Cpu::run_bare(0, || {
            let fut = Future::<i32>::new();
            let seen = Rc::new(RefCell::new(0));
            let seen2 = seen.clone();
            fut.on_success(move |v| *seen2.borrow_mut() = v).unwrap();
            fut.set_value(41).unwrap();
            assert_eq!(*seen.borrow(), 41);
        });
    }

    #[test]
    fn double_set_value_is_an_invariant_error() {
        Cpu::run_bare(0, || {
            let fut = Future::<i32>::new();
            fut.set_value(1).unwrap();
            assert!(fut.set_value(2).is_err());
        });
    }

    #[test]
    fn double_on_success_install_is_an_invariant_error() {
        Cpu::run_bare(0, || {
            let fut = Future::<i32>::new();
            fut.on_success(|_| {}).unwrap();
            assert!(fut.on_success(|_| {}).is_err());
        });
    }

    #[test]
    fn map_propagates_failure_without_calling_f() {
        Cpu::run_bare(0, || {
            let fut = Future::<i32>::new();
            let mapped = fut.map(|_: i32| panic!("must not run"));
            let failed = Rc::new(RefCell::new(false));
            let failed2 = failed.clone();
            mapped.on_failure(move |_| *failed2.borrow_mut() = true).unwrap();
            fut.set_failure(Error::Closed).unwrap();
            assert!(*failed.borrow());
        });
    }
}
