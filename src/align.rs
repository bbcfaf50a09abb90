use std::mem;

/// Rounds `size` up to the next multiple of the machine word size.
///
/// Every requested byte count goes through this before any size comparison.
/// The arena base is page aligned and [`crate::header::HEADER_SIZE`] is a
/// word multiple, so as long as payloads are word multiples too, every header
/// carved out of an arena by splitting lands on a word boundary.
#[inline]
pub(crate) fn align(size: usize) -> usize {
    let word = mem::size_of::<usize>();
    (size + word - 1) & !(word - 1)
}
