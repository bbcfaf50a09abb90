use std::{cell::RefCell, fmt, marker::PhantomData, mem, ptr::NonNull, rc::Rc};

use crate::{error::AllocError, pool::ArenaPool};

/// Default arena mapping size: 256 MiB.
pub const DEFAULT_ARENA_CAPACITY: usize = 256 * 1024 * 1024;

/// Default arena limit, bounding a pool at 1 GiB with the default capacity.
pub const DEFAULT_MAX_ARENAS: usize = 4;

/// Typed surface over an [`ArenaPool`]: requests are counted in elements of
/// `T` instead of bytes, nothing else. The façade multiplies by
/// `size_of::<T>()`, delegates, and casts; it never constructs or drops `T`
/// values, that's the caller's business.
///
/// Clones share the pool. That's the one deliberate aliasing in the whole
/// crate: a structure that owns a `Fitloc` by value can be handed copies and
/// all of them allocate from, and release into, the same arenas. Two clones
/// compare equal; independently created allocators never do.
///
/// ```
/// use fitloc::Fitloc;
///
/// let alloc = Fitloc::<u64, { 1024 * 1024 }, 2>::new().unwrap();
/// let other = alloc.clone();
/// assert_eq!(alloc, other);
///
/// let numbers = alloc.allocate(128).unwrap();
/// unsafe {
///     numbers.as_ptr().write(42);
///     assert_eq!(numbers.as_ptr().read(), 42);
///     // A clone may release what its sibling allocated.
///     other.release(numbers, 128).unwrap();
/// }
/// ```
///
/// Everything is single threaded by design, hence [`Rc`] over [`RefCell`]:
/// the façade does not implement [`Send`] or [`Sync`] and never will.
pub struct Fitloc<
    T,
    const ARENA_CAPACITY: usize = DEFAULT_ARENA_CAPACITY,
    const MAX_ARENAS: usize = DEFAULT_MAX_ARENAS,
> {
    pool: Rc<RefCell<ArenaPool>>,
    marker: PhantomData<T>,
}

impl<T, const ARENA_CAPACITY: usize, const MAX_ARENAS: usize>
    Fitloc<T, ARENA_CAPACITY, MAX_ARENAS>
{
    /// Builds a façade over a fresh pool, eagerly mapping the first arena.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidArgument`] when the compile-time configuration
    /// can never serve an allocation, [`AllocError::OutOfMemory`] when the
    /// OS refuses the first mapping.
    pub fn new() -> Result<Self, AllocError> {
        let pool = ArenaPool::new(ARENA_CAPACITY, MAX_ARENAS)?;

        Ok(Self {
            pool: Rc::new(RefCell::new(pool)),
            marker: PhantomData,
        })
    }

    /// Hands out storage for `count` elements of `T`, uninitialized.
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::InvalidArgument("element count overflows"))?;

        Ok(self.pool.borrow_mut().allocate(bytes)?.cast())
    }

    /// Releases storage previously obtained through [`Fitloc::allocate`] on
    /// this allocator or any of its clones. Any `T` values inside must have
    /// been dropped already if they needed dropping.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an equal allocator and not have been released
    /// since. `count` is forwarded as the byte hint; the region header is
    /// authoritative, so it need not match the allocation.
    pub unsafe fn release(&self, ptr: NonNull<T>, count: usize) -> Result<(), AllocError> {
        let bytes = count.saturating_mul(mem::size_of::<T>());

        self.pool.borrow_mut().release(ptr.cast(), bytes)
    }
}

impl<T, const ARENA_CAPACITY: usize, const MAX_ARENAS: usize> Clone
    for Fitloc<T, ARENA_CAPACITY, MAX_ARENAS>
{
    fn clone(&self) -> Self {
        Self {
            pool: Rc::clone(&self.pool),
            marker: PhantomData,
        }
    }
}

impl<T, const ARENA_CAPACITY: usize, const MAX_ARENAS: usize> fmt::Debug
    for Fitloc<T, ARENA_CAPACITY, MAX_ARENAS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fitloc")
            .field("pool", &Rc::as_ptr(&self.pool))
            .field("arena_capacity", &ARENA_CAPACITY)
            .field("max_arenas", &MAX_ARENAS)
            .finish()
    }
}

impl<T, const ARENA_CAPACITY: usize, const MAX_ARENAS: usize> PartialEq
    for Fitloc<T, ARENA_CAPACITY, MAX_ARENAS>
{
    /// Two façades are equal when they view the same pool, which is exactly
    /// when they may release each other's allocations.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.pool, &other.pool)
    }
}

impl<T, const ARENA_CAPACITY: usize, const MAX_ARENAS: usize> Eq
    for Fitloc<T, ARENA_CAPACITY, MAX_ARENAS>
{
}
