use std::ptr::NonNull;

use crate::{
    align::align,
    arena::Arena,
    error::AllocError,
    header::{Header, HEADER_SIZE},
};

/// Routes allocation requests across up to a fixed number of arenas.
///
/// The first arena is mapped eagerly at construction; further arenas are
/// provisioned lazily, one at a time, and only when no existing arena can
/// satisfy a request. Every allocation asks every provisioned arena for its
/// best candidate and takes the globally smallest one, so the best-fit
/// policy holds across the whole pool, not just within one arena. Ties go to
/// the lower arena index.
///
/// Arenas are never shrunk, merged, or reclaimed while the pool is alive;
/// dropping the pool destroys them in index order, which unmaps everything
/// this pool ever handed out.
pub struct ArenaPool {
    /// Provisioned arenas; the vector length is the provisioning watermark.
    arenas: Vec<Arena>,
    /// Mapping size of every arena in bytes.
    arena_capacity: usize,
    /// Hard limit on the number of arenas.
    max_arenas: usize,
}

impl ArenaPool {
    /// Builds a pool of up to `max_arenas` arenas of `arena_capacity` bytes
    /// each, mapping the first arena right away.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidArgument`] for a configuration that could never
    /// serve an allocation, [`AllocError::OutOfMemory`] if the OS refuses
    /// the first mapping.
    pub fn new(arena_capacity: usize, max_arenas: usize) -> Result<Self, AllocError> {
        if max_arenas == 0 {
            return Err(AllocError::InvalidArgument(
                "pool needs at least one arena slot",
            ));
        }
        if arena_capacity <= HEADER_SIZE {
            return Err(AllocError::InvalidArgument(
                "arena capacity must exceed the region header size",
            ));
        }

        let mut arenas = Vec::with_capacity(max_arenas);
        arenas.push(Arena::new(arena_capacity)?);

        Ok(Self {
            arenas,
            arena_capacity,
            max_arenas,
        })
    }

    /// Hands out a pointer to at least `bytes` writable bytes.
    ///
    /// The request is rounded up to a word multiple, then served by the
    /// smallest sufficient free region across all provisioned arenas. When
    /// nothing fits and the watermark allows it, one new arena is
    /// provisioned and serves the request.
    ///
    /// A failed allocation leaves the pool observably unchanged.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        if bytes == 0 {
            return Err(AllocError::InvalidArgument("cannot allocate zero bytes"));
        }

        // A request that doesn't fit a fresh arena will never be
        // satisfiable, don't provision one just to find out. The first
        // comparison also keeps the rounding below from overflowing on
        // absurd requests.
        let available = self.arena_capacity - HEADER_SIZE;
        if bytes > available || align(bytes) > available {
            return Err(AllocError::OutOfCapacity(bytes));
        }

        let size = align(bytes);

        let mut winner: Option<(usize, NonNull<Header>)> = None;
        for (index, arena) in self.arenas.iter().enumerate() {
            let Some(region) = (unsafe { arena.find_best_fit(size) }) else {
                continue;
            };

            // Strict comparison: on equal sizes the lower arena index wins.
            let improves = winner.map_or(true, |(_, best)| unsafe {
                region.as_ref().size() < best.as_ref().size()
            });
            if improves {
                winner = Some((index, region));
            }
        }

        if let Some((index, region)) = winner {
            return Ok(unsafe { self.arenas[index].allocate(region, size) });
        }

        if self.arenas.len() == self.max_arenas {
            tracing::trace!(bytes, max_arenas = self.max_arenas, "pool exhausted");
            return Err(AllocError::OutOfCapacity(bytes));
        }

        tracing::debug!(
            index = self.arenas.len(),
            capacity = self.arena_capacity,
            "no arena fits, provisioning a new one"
        );

        self.arenas.push(Arena::new(self.arena_capacity)?);

        let arena = self.arenas.last_mut().unwrap();
        unsafe {
            // The oversize check above guarantees a fresh arena fits.
            let region = arena.find_best_fit(size).unwrap();
            Ok(arena.allocate(region, size))
        }
    }

    /// Releases a pointer previously returned by [`ArenaPool::allocate`].
    ///
    /// The owning arena is found by scanning address ranges; the region
    /// header it keeps in front of the payload is authoritative for the
    /// size, so `bytes` is accepted purely as an interface hint and never
    /// consulted.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidArgument`] when no arena of this pool owns the
    /// pointer. No state changes in that case.
    ///
    /// # Safety
    ///
    /// If an arena owns `address`, it must be a payload pointer obtained
    /// from this pool that has not been released since. Releasing a pointer
    /// twice or releasing an address that merely lies inside an arena is
    /// undefined behavior.
    pub unsafe fn release(&mut self, address: NonNull<u8>, _bytes: usize) -> Result<(), AllocError> {
        let Some(arena) = self.arenas.iter_mut().find(|arena| arena.contains(address)) else {
            return Err(AllocError::InvalidArgument(
                "pointer is not owned by this pool",
            ));
        };

        arena.release(address);
        Ok(())
    }
}

#[cfg(test)]
impl ArenaPool {
    /// Provisioning watermark.
    pub(crate) fn provisioned(&self) -> usize {
        self.arenas.len()
    }

    pub(crate) fn arena(&self, index: usize) -> &Arena {
        &self.arenas[index]
    }
}
