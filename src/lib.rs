//! A shared-nothing, thread-per-core runtime with non-blocking network I/O.
//!
//! An application builds a [`CpuSet`](crate::cpu::CpuSet) of logical CPUs, each owning one
//! OS thread, a task queue, a timer wheel and a selector. Work is expressed as
//! [`Future`](crate::future::Future) values that always resume on the CPU that
//! produced them; concurrency between CPUs happens exclusively through
//! message passing.

mod config;
mod error;
mod selector;
mod timer;

pub mod buffer;
pub mod cpu;
pub mod future;
pub mod stream;

pub use buffer::Buffer;
pub use config::Config;
pub use cpu::{CpuHandle, CpuSet, Pack};
pub use error::{Error, Result};
pub use future::Future;
pub use stream::Channel;
