use thiserror::Error;

/// Everything that can go wrong at the allocator surface.
///
/// Only [`AllocError::OutOfCapacity`] is ordinary: it means the pool cannot
/// serve *this* request right now, and a smaller request may well succeed.
/// The other two variants are caller mistakes or the operating system
/// refusing to hand us more address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// A request the allocator refuses to even look at: zero bytes, a
    /// released pointer that no arena owns, or an unusable pool
    /// configuration. Raised before any state changes.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operating system refused to map this many bytes while
    /// provisioning an arena. The pool is left exactly as it was.
    #[error("operating system refused to map {0} bytes")]
    OutOfMemory(usize),

    /// No provisioned arena can fit the request and the arena limit has been
    /// reached, or the request can never fit inside a single arena. Non
    /// fatal; the caller may retry with a smaller request.
    #[error("no arena can fit a request for {0} bytes")]
    OutOfCapacity(usize),
}
