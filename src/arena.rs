use std::ptr::NonNull;

use crate::{
    error::AllocError,
    header::{Header, HEADER_SIZE},
    platform,
    tree::FreeTree,
    Pointer,
};

/// One contiguous OS mapping partitioned into regions.
///
/// The first region header sits at the very base of the mapping, so the base
/// pointer doubles as the head of the spatial list. A freshly constructed
/// arena is one single free region spanning everything behind that header:
///
/// ```text
/// +----------+------------------------------------------------+
/// |  Header  |                    Payload                     |
/// +----------+------------------------------------------------+
/// ^
/// base                    <- capacity ->
/// ```
///
/// Allocation splits regions off the front of a free region, release melts
/// regions back into their free neighbors, and at any point in between the
/// arena looks like this:
///
/// ```text
/// +---+---------+---+-------+---+-----+---+-----------------+
/// | H |  Used   | H | Free  | H | Use | H |      Free       |
/// +---+---------+---+-------+---+-----+---+-----------------+
///       <- spatial list in address order; frees also in tree ->
/// ```
///
/// The arena owns its mapping and every header inside it. Destruction hands
/// the whole mapping back to the OS in one call; nothing inside is
/// dismantled individually.
pub(crate) struct Arena {
    /// Mapping base, which is also the first region header.
    base: NonNull<Header>,
    /// Mapping length in bytes.
    capacity: usize,
    /// All free regions of this arena, keyed by payload size.
    free: FreeTree,
}

impl Arena {
    /// Maps `capacity` bytes and installs the initial all-spanning free
    /// region. Fails with [`AllocError::OutOfMemory`] when the OS refuses
    /// the mapping, in which case nothing was constructed.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        debug_assert!(capacity > HEADER_SIZE);

        let Some(address) = (unsafe { platform::request_memory(capacity) }) else {
            return Err(AllocError::OutOfMemory(capacity));
        };

        let base = address.cast::<Header>();
        let mut free = FreeTree::new();

        unsafe {
            base.as_ptr()
                .write(Header::with_payload_size(capacity - HEADER_SIZE));
            free.insert(base);
        }

        Ok(Self {
            base,
            capacity,
            free,
        })
    }

    /// Whether `address` falls inside this arena's mapping. This is how the
    /// pool finds the owner of a released pointer.
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let base = self.base.as_ptr() as usize;
        let address = address.as_ptr() as usize;

        base <= address && address < base + self.capacity
    }

    /// Smallest free region with payload size of at least `bytes`, or `None`
    /// if this arena cannot satisfy the request.
    ///
    /// # Safety
    ///
    /// The returned header belongs to this arena and is only meaningful
    /// until the next mutation of the arena.
    pub unsafe fn find_best_fit(&self, bytes: usize) -> Pointer<Header> {
        self.free.lower_bound(bytes)
    }

    /// Turns the chosen free `region` into an allocation of exactly `bytes`
    /// payload bytes and returns the payload address.
    ///
    /// If the region is large enough to also hold a tail region with at
    /// least one payload byte behind a header of its own, the tail is split
    /// off, threaded into the spatial list and put back into the tree.
    /// Otherwise the region is used whole and the caller gets the slack,
    /// which is bounded by `HEADER_SIZE`.
    ///
    /// # Safety
    ///
    /// `region` must come from [`Arena::find_best_fit`] on this arena with a
    /// request of at least `bytes`, with no mutation in between. `bytes`
    /// must be a word multiple (see [`crate::align::align`]): the carved
    /// tail header starts `bytes` past the payload, so an unrounded count
    /// would write a misaligned [`Header`].
    pub unsafe fn allocate(&mut self, mut region: NonNull<Header>, bytes: usize) -> NonNull<u8> {
        debug_assert_eq!(bytes, crate::align::align(bytes));
        debug_assert!(region.as_ref().size() >= bytes);
        debug_assert!(self.contains(region.cast()));

        self.free.remove(region);

        if region.as_ref().size() >= bytes + HEADER_SIZE + 1 {
            let tail_size = region.as_ref().size() - bytes - HEADER_SIZE;
            let address = Header::payload_address_of(region).as_ptr().add(bytes);

            let tail = address.cast::<Header>();
            tail.write(Header::with_payload_size(tail_size));
            let tail = NonNull::new_unchecked(tail);

            Header::link_after(region, tail);
            self.free.insert(tail);

            region.as_mut().set_size(bytes);
        }

        region.as_mut().mark_used();

        Header::payload_address_of(region)
    }

    /// Releases a previously allocated payload pointer, merging the region
    /// with its free spatial neighbors.
    ///
    /// Forward first, backward second, but the two merges are independent in
    /// effect: either order produces the same spatial list and the same
    /// surviving region. Absorbing a neighbor removes it from the tree and
    /// grows the survivor by the neighbor's header plus payload; only the
    /// survivor is inserted back.
    ///
    /// # Safety
    ///
    /// `address` must be a payload pointer previously returned by
    /// [`Arena::allocate`] on this arena and not released since.
    pub unsafe fn release(&mut self, address: NonNull<u8>) {
        let mut region = Header::from_payload_address(address);
        region.as_mut().mark_free();

        if let Some(successor) = region.as_ref().next.filter(|s| s.as_ref().is_free()) {
            self.free.remove(successor);
            let grown = region.as_ref().size() + HEADER_SIZE + successor.as_ref().size();
            region.as_mut().set_size(grown);
            Header::unlink_next(region);
        }

        if let Some(mut predecessor) = region.as_ref().prev.filter(|p| p.as_ref().is_free()) {
            self.free.remove(predecessor);
            let grown = predecessor.as_ref().size() + HEADER_SIZE + region.as_ref().size();
            predecessor.as_mut().set_size(grown);
            Header::unlink_next(predecessor);
            region = predecessor;
        }

        self.free.insert(region);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // The whole mapping goes back in one call, invalidating every
        // pointer this arena ever issued.
        unsafe { platform::return_memory(self.base.cast(), self.capacity) };
    }
}

#[cfg(test)]
impl Arena {
    /// Payload sizes of all free regions, smallest first.
    pub(crate) unsafe fn free_region_sizes(&self) -> Vec<usize> {
        self.free.in_order().iter().map(|n| n.as_ref().size()).collect()
    }

    /// Walks the spatial list from the base and panics unless every
    /// structural invariant holds: regions are contiguous and cover the
    /// whole mapping, no two adjacent regions are both free, and the tree
    /// contains exactly the free regions (and is a valid red-black tree).
    pub(crate) unsafe fn assert_invariants(&self) {
        self.free.assert_valid();

        let mut free_in_list = Vec::new();
        let mut covered = 0;
        let mut previous: Pointer<Header> = None;
        let mut current = Some(self.base);

        while let Some(region) = current {
            assert_eq!(region.as_ref().prev, previous, "broken prev link");

            if let Some(prev) = previous {
                let expected = prev.as_ptr() as usize + prev.as_ref().total_size();
                assert_eq!(region.as_ptr() as usize, expected, "regions not contiguous");
                assert!(
                    !(prev.as_ref().is_free() && region.as_ref().is_free()),
                    "two adjacent free regions"
                );
            }

            if region.as_ref().is_free() {
                free_in_list.push(region.as_ptr() as usize);
            }

            covered += region.as_ref().total_size();
            previous = current;
            current = region.as_ref().next;
        }

        assert_eq!(covered, self.capacity, "regions must cover the whole arena");

        let mut in_tree: Vec<usize> = self
            .free
            .in_order()
            .iter()
            .map(|n| n.as_ptr() as usize)
            .collect();
        in_tree.sort_unstable();
        free_in_list.sort_unstable();
        assert_eq!(in_tree, free_in_list, "tree and spatial list disagree");
    }
}
