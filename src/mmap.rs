use std::{io, marker::PhantomData, mem::size_of, ops::Deref};

use memmap2::{MmapMut, MmapOptions};

#[cfg(unix)]
pub mod _unix {
    use std::io;

    use crate::globals::BLOCK_SIZE;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NORESERVE: libc::c_int = 0;

    /// Address space reserved for the heap. Pages are committed lazily by the
    /// kernel on first touch.
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Reserves `size` bytes plus one block of slack so that a block
        /// aligned start always exists.
        pub fn new(size: usize) -> io::Result<Self> {
            let size = size + BLOCK_SIZE;
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }

        /// Return a `BLOCK_SIZE` aligned pointer to the mmap'ed region.
        pub fn aligned(&self) -> *mut u8 {
            let offset = (BLOCK_SIZE - (self.start as usize) % BLOCK_SIZE) % BLOCK_SIZE;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }

    pub fn physical_memory() -> usize {
        unsafe {
            let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
            let page_size = libc::sysconf(libc::_SC_PAGESIZE);
            if pages <= 0 || page_size <= 0 {
                return super::FALLBACK_PHYSICAL_MEMORY;
            }
            (pages as usize).saturating_mul(page_size as usize)
        }
    }
}

#[cfg(not(unix))]
pub mod _portable {
    use std::io;

    use memmap2::{MmapMut, MmapOptions};

    use crate::globals::BLOCK_SIZE;

    pub struct Mmap {
        map: MmapMut,
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn new(size: usize) -> io::Result<Self> {
            let size = size + BLOCK_SIZE;
            let mut map = MmapOptions::new().len(size).map_anon()?;
            let start = map.as_mut_ptr();
            Ok(Self {
                start,
                end: unsafe { start.add(size) },
                size,
                map,
            })
        }

        pub fn aligned(&self) -> *mut u8 {
            let offset = (BLOCK_SIZE - (self.start as usize) % BLOCK_SIZE) % BLOCK_SIZE;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }
    }

    pub fn physical_memory() -> usize {
        super::FALLBACK_PHYSICAL_MEMORY
    }
}

#[cfg(not(unix))]
pub use _portable::*;
#[cfg(unix)]
pub use _unix::*;

// The reservation is only ever written through raw pointers handed out by the
// allocators, each region owned by one thread at a time.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

const FALLBACK_PHYSICAL_MEMORY: usize = 4 * 1024 * 1024 * 1024;

/// Types for which the all-zero byte pattern is a valid value.
///
/// # Safety
///
/// Implementors must be plain atomics/integers (or aggregates of them) whose
/// zero representation is a meaningful initial state.
pub unsafe trait ZeroInit: Sync {}

unsafe impl ZeroInit for std::sync::atomic::AtomicU8 {}
unsafe impl ZeroInit for std::sync::atomic::AtomicU32 {}

/// Fixed size side table backed by an anonymous mapping. Entries start
/// zeroed and pages are only committed when first written, so arenas are
/// sized for the maximum heap up front.
pub struct MetaArena<T: ZeroInit> {
    map: MmapMut,
    len: usize,
    marker: PhantomData<T>,
}

impl<T: ZeroInit> MetaArena<T> {
    pub fn new(name: &'static str, len: usize) -> io::Result<Self> {
        let bytes = (len * size_of::<T>()).max(1);
        let map = MmapOptions::new().len(bytes).map_anon()?;
        debug_assert_eq!(map.as_ptr() as usize % core::mem::align_of::<T>(), 0);
        log::trace!("{}: {} entries in {} bytes", name, len, bytes);
        Ok(Self {
            map,
            len,
            marker: PhantomData,
        })
    }

    pub fn as_slice(&self) -> &[T] {
        // The mapping is zero filled and `T: ZeroInit`, every entry is a
        // valid `T`. All mutation goes through the entries' atomics.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const T, self.len) }
    }
}

impl<T: ZeroInit> Deref for MetaArena<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::BLOCK_SIZE;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn reservation_has_aligned_start() {
        let map = Mmap::new(16 * BLOCK_SIZE).unwrap();
        let aligned = map.aligned() as usize;
        assert_eq!(aligned % BLOCK_SIZE, 0);
        assert!(aligned + 16 * BLOCK_SIZE <= map.end() as usize);
        unsafe {
            let p = map.aligned();
            assert_eq!(*p, 0);
            *p.add(16 * BLOCK_SIZE - 1) = 7;
        }
    }

    #[test]
    fn arena_entries_start_zeroed() {
        let arena = MetaArena::<AtomicU32>::new("test", 1 << 16).unwrap();
        assert_eq!(arena.len(), 1 << 16);
        assert!(arena.iter().all(|x| x.load(Ordering::Relaxed) == 0));
        arena[42].store(9, Ordering::Relaxed);
        assert_eq!(arena[42].load(Ordering::Relaxed), 9);
    }
}
