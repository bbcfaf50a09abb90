use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The allocator only
/// needs to obtain whole arena mappings and hand them back when an arena is
/// destroyed; it doesn't care about the APIs offered by the underlying kernel
/// or libraries.
trait PlatformSpecificMemory {
    /// Requests a contiguous read-write mapping where `length` bytes can be
    /// written safely. The returned address is page aligned, which is more
    /// than enough for a region header.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the underlying
    /// kernel. Only ever called with a full arena mapping.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write memory, private to our process and not backed by
            // any file or device. For all the options that `mmap` accepts
            // see https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // Nothing sensible to do from a destructor; the mapping stays
                // valid, we just never use it again.
                tracing::error!(?address, length, "munmap failed, leaking arena mapping");
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory has to be reserved first and then committed in order to
            // become usable, both can happen in one single call. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // Specifying length 0 with MEM_RELEASE decommits and releases
            // the whole mapping at once. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address.cast().as_ptr(), 0, flags).as_bool() {
                tracing::error!(?address, length, "VirtualFree failed, leaking arena mapping");
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we mock low level memory management
    //! with the global allocator. This also makes Miri detect arenas that we
    //! forget to return.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    /// Real mappings are page aligned; 16 bytes is plenty for mocked ones,
    /// the region header only needs word alignment.
    const MOCKED_ALIGNMENT: usize = 16;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, MOCKED_ALIGNMENT).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
