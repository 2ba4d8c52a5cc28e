use super::stats;
use std::fmt;
use std::ptr::NonNull;

/// Compile-time page geometry.  The zone header embeds a fixed per-page
/// free-list table, so the page size is baked in rather than probed; first
/// use asserts it against the OS in debug builds (see `api::ensure_init`).
pub(crate) const PAGE_SIZE: usize = 4096;
pub(crate) const PAGE_SHIFT: usize = 12;
pub(crate) const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Round up to the next page boundary.  Returns 0 on overflow, which every
/// caller treats as an impossible request.
#[inline]
pub(crate) fn round_to_pages(size: usize) -> usize {
    size.wrapping_add(PAGE_MASK) & !PAGE_MASK
}

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM map failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for the virtual-memory provider.
///
/// `map` returns zero-filled, `align`-aligned memory; `align` must be a
/// power-of-two multiple of the page size and `size` a non-zero page
/// multiple.  `unmap` releases exactly `[ptr, ptr + size)` — partial ranges
/// of an earlier mapping are allowed (the big-allocation sweep trims tails).
pub(crate) trait VmOps {
    unsafe fn map(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Best-effort adjacent growth of `[base, base + old_bytes)` to
    /// `new_bytes` total.  Returns false without side effects when the
    /// adjacent range is unavailable.
    unsafe fn try_grow(base: NonNull<u8>, old_bytes: usize, new_bytes: usize) -> bool;

    /// Advise the kernel that `[ptr, ptr + size)` contents are disposable.
    /// Purely advisory; failures are ignored.
    unsafe fn advise_unused(ptr: NonNull<u8>, size: usize);

    fn page_size() -> usize {
        PAGE_SIZE
    }
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PAGE_MASK, PlatformVmOps, VmError, VmOps, stats};
    use std::io;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    // Address hint for the next mapping.  A mapping that lands aligned needs
    // no trimming, so we remember where the last one ended.  Races on these
    // are harmless: a stale hint only costs an extra mmap round.
    static ADDR_HINT: AtomicUsize = AtomicUsize::new(0);
    static HINT_RESET: AtomicI32 = AtomicI32::new(16);

    unsafe fn raw_map(hint: usize, size: usize) -> *mut u8 {
        // Safety: FFI call to mmap; anonymous private mapping.
        let p = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p.cast::<u8>()
        }
    }

    unsafe fn raw_unmap(ptr: *mut u8, size: usize) -> bool {
        // Safety: FFI call to munmap.
        unsafe { libc::munmap(ptr.cast::<libc::c_void>(), size) == 0 }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(size > 0 && size & PAGE_MASK == 0, "size {size} not page-sized");
            debug_assert!(
                align.is_power_of_two() && align & PAGE_MASK == 0,
                "align {align} not a page-multiple power of two"
            );

            stats::VM_MAP_CALLS.add(1);

            // Periodically drop the hint so a long-lived process does not
            // march its mappings across the address space forever.
            if HINT_RESET.fetch_sub(1, Ordering::Relaxed) <= 0 {
                HINT_RESET.store(16, Ordering::Relaxed);
                ADDR_HINT.store(0, Ordering::Relaxed);
            }

            // First try: plain mapping at the hint.  Kernels tend to place
            // successive anonymous mappings adjacently, so this is usually
            // already aligned.
            let hint = ADDR_HINT.load(Ordering::Relaxed);
            // Safety: size validated above.
            let save = unsafe { raw_map(hint, size) };
            if !save.is_null() {
                if (save as usize) & (align - 1) == 0 {
                    // Safety: mmap success implies non-null here.
                    return Ok(unsafe { NonNull::new_unchecked(save) });
                }
                // Second try: re-map at the aligned address just past what we
                // got.  Still a plain hint — the kernel may refuse.
                let aligned = ((save as usize) + (align - 1)) & !(align - 1);
                ADDR_HINT.store(aligned, Ordering::Relaxed);
                // Safety: save came from mmap with this size.
                unsafe { raw_unmap(save, size) };
                // Safety: size validated above.
                let save = unsafe { raw_map(aligned, size) };
                if !save.is_null() {
                    if (save as usize) & (align - 1) == 0 {
                        // Safety: non-null checked.
                        return Ok(unsafe { NonNull::new_unchecked(save) });
                    }
                    // Safety: save came from mmap with this size.
                    unsafe { raw_unmap(save, size) };
                }
            }

            // Worst case: over-map by `align` and trim both ends.
            // Safety: size + align is a page multiple.
            let save = unsafe { raw_map(0, size + align) };
            if save.is_null() {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }
            let addr = ((save as usize) + (align - 1)) & !(align - 1);
            // Safety: trimming sub-ranges of the mapping we just created.
            unsafe {
                if addr != save as usize {
                    raw_unmap(save, addr - save as usize);
                }
                let tail = addr + size;
                let end = save as usize + size + align;
                if tail != end {
                    raw_unmap(tail as *mut u8, end - tail);
                }
            }
            ADDR_HINT.store(addr + size, Ordering::Relaxed);

            // Safety: addr lies within the surviving mapping.
            Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            stats::VM_UNMAP_CALLS.add(1);
            // Safety: FFI call to munmap; caller owns the range.
            if unsafe { raw_unmap(ptr.as_ptr(), size) } {
                Ok(())
            } else {
                Err(VmError::UnmapFailed(io::Error::last_os_error()))
            }
        }

        unsafe fn try_grow(base: NonNull<u8>, old_bytes: usize, new_bytes: usize) -> bool {
            debug_assert!(new_bytes > old_bytes);
            debug_assert!((old_bytes | new_bytes) & PAGE_MASK == 0);

            let want = base.as_ptr() as usize + old_bytes;
            let grow = new_bytes - old_bytes;

            stats::VM_MAP_CALLS.add(1);

            // Linux can refuse-without-clobber directly.
            #[cfg(target_os = "linux")]
            {
                // Safety: FFI call to mmap; MAP_FIXED_NOREPLACE fails rather
                // than replacing an existing mapping.
                let p = unsafe {
                    libc::mmap(
                        want as *mut libc::c_void,
                        grow,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED_NOREPLACE,
                        -1,
                        0,
                    )
                };
                if p == libc::MAP_FAILED {
                    return false;
                }
                // Pre-4.17 kernels ignore the flag and treat it as a hint.
                if p as usize != want {
                    // Safety: p came from the mmap above.
                    unsafe { raw_unmap(p.cast::<u8>(), grow) };
                    return false;
                }
                true
            }

            // Elsewhere: map with a hint and verify the kernel honoured it.
            #[cfg(not(target_os = "linux"))]
            {
                // Safety: grow is a page multiple.
                let p = unsafe { raw_map(want, grow) };
                if p.is_null() {
                    return false;
                }
                if p as usize != want {
                    // Safety: p came from raw_map with this size.
                    unsafe { raw_unmap(p, grow) };
                    return false;
                }
                true
            }
        }

        unsafe fn advise_unused(ptr: NonNull<u8>, size: usize) {
            // Safety: FFI call to madvise; advisory only, errors ignored.
            unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/munmap)
//
// Under `cfg(loom)` or Miri we cannot issue real VM syscalls.  Every mapping
// is backed by `std::alloc::alloc_zeroed` with the requested alignment and
// tracked in a registry keyed by base address.
//
// `unmap` frees the backing block only when called with a region's base
// address; tail trims (the excess sweep, over-map trimming) are counted but
// not released — the block goes back to the system when its base is unmapped
// or the process exits.  `try_grow` always fails.  This is sufficient for
// testing the synchronization logic (loom) and pointer discipline (Miri);
// real mapping behaviour is covered by the platform implementation.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
mod mock {
    use super::{NonNull, PAGE_MASK, PlatformVmOps, VmError, VmOps, stats};
    use std::collections::HashMap;
    use std::io;

    struct Region {
        layout: std::alloc::Layout,
    }

    fn registry() -> &'static std::sync::Mutex<HashMap<usize, Region>> {
        static REGISTRY: std::sync::OnceLock<std::sync::Mutex<HashMap<usize, Region>>> =
            std::sync::OnceLock::new();
        REGISTRY.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(size > 0 && size & PAGE_MASK == 0);
            stats::VM_MAP_CALLS.add(1);
            let layout = std::alloc::Layout::from_size_align(size, align)
                .map_err(|e| VmError::MapFailed(io::Error::other(e)))?;
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).ok_or_else(|| {
                VmError::MapFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "alloc returned null",
                ))
            })?;
            registry()
                .lock()
                .unwrap()
                .insert(ptr.as_ptr() as usize, Region { layout });
            Ok(ptr)
        }

        unsafe fn unmap(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            stats::VM_UNMAP_CALLS.add(1);
            let region = registry().lock().unwrap().remove(&(ptr.as_ptr() as usize));
            if let Some(region) = region {
                // Safety: ptr was allocated with region.layout via `map`.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), region.layout) };
            }
            // Interior/tail unmaps: accounted, block released with its base.
            Ok(())
        }

        unsafe fn try_grow(_base: NonNull<u8>, _old: usize, _new: usize) -> bool {
            false
        }

        unsafe fn advise_unused(_ptr: NonNull<u8>, _size: usize) {}
    }
}
