/// The runtime's closed failure taxonomy.
///
/// Unlike the teacher's `Error<E>`, this is not generic over an application
/// error type: the set of ways a future can fail is fixed by the runtime
/// itself (I/O, a closed channel, a broken invariant, or shutdown).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    Closed,

    #[error("invariant violation: {0}")]
    Invariant(&'static str),

    #[error("runtime is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
