//! The malloc-family surface: C-compatible entry points over the slab and
//! big engines, option parsing, the trace hook, fork plumbing, and the
//! signal-block counter.
//!
//! No error value crosses this boundary: callers see pointer-or-null with
//! `errno` set (`posix_memalign` returns its code directly, per POSIX).

use super::slab::{self, AF_ZERO};
use super::vm::{PAGE_SIZE, PlatformVmOps, VmOps};
use crate::sync::OnceLock;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::cell::Cell;
use std::ptr::null_mut;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tuning knobs from the `MALLOC_OPTIONS` environment string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Config {
    /// `Z`: zero every byte of every allocation (and re-zero on free).
    pub zero: bool,
    /// `H`: advise the kernel that recycled zones are reclaimable.
    pub madvise: bool,
    /// `U`: feed the trace hook.
    pub trace: bool,
}

/// Parse an options string.  Lowercase disables, uppercase enables, unknown
/// characters are ignored.
pub(crate) fn parse_options(s: &str) -> Config {
    let mut cfg = Config::default();
    for c in s.chars() {
        match c {
            'u' => cfg.trace = false,
            'U' => cfg.trace = true,
            'h' => cfg.madvise = false,
            'H' => cfg.madvise = true,
            'z' => cfg.zero = false,
            'Z' => cfg.zero = true,
            _ => {}
        }
    }
    cfg
}

/// True when the process gained privilege it did not start with; tuning via
/// the environment is ignored for those.
fn issetugid() -> bool {
    #[cfg(target_os = "linux")]
    {
        // Safety: FFI call to getauxval; AT_SECURE is always available.
        unsafe { libc::getauxval(libc::AT_SECURE) != 0 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Safety: FFI call to issetugid.
        unsafe { libc::issetugid() != 0 }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

pub(crate) fn config() -> Config {
    *CONFIG.get_or_init(|| {
        debug_assert_eq!(
            // Safety: FFI call to sysconf.
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) },
            PlatformVmOps::page_size() as libc::c_long,
            "zone page table is sized for {PAGE_SIZE}-byte pages"
        );
        if issetugid() {
            return Config::default();
        }
        match std::env::var("MALLOC_OPTIONS") {
            Ok(s) => parse_options(&s),
            Err(_) => Config::default(),
        }
    })
}

/// Allocation flags implied by the global options.
pub(crate) fn opt_flags() -> u32 {
    if config().zero { AF_ZERO } else { 0 }
}

pub(crate) fn opt_madvise() -> bool {
    config().madvise
}

// ---------------------------------------------------------------------------
// Trace hook
// ---------------------------------------------------------------------------

/// One malloc/realloc/free event for the external trace hook.
#[derive(Clone, Copy, Debug)]
pub struct TraceEvent {
    /// Input pointer (null for malloc/calloc).
    pub ptr: *const u8,
    /// Requested size (0 for free).
    pub size: usize,
    /// Resulting pointer (null for free or failure).
    pub result: *const u8,
}

crate::sync::static_atomic! {
    static TRACE_HOOK: AtomicUsize = AtomicUsize::new(0);
}

/// Install (or clear) the trace hook.  Events flow only while the `U`
/// option is active.
pub fn set_trace_hook(hook: Option<fn(TraceEvent)>) {
    let raw = match hook {
        Some(f) => f as usize,
        None => 0,
    };
    TRACE_HOOK.store(raw, Ordering::Relaxed);
}

#[inline]
fn trace(ptr: *const u8, size: usize, result: *const u8) {
    if !config().trace {
        return;
    }
    let raw = TRACE_HOOK.load(Ordering::Relaxed);
    if raw == 0 {
        return;
    }
    // Safety: the only writers store a valid fn pointer or 0, checked above.
    let hook: fn(TraceEvent) = unsafe { std::mem::transmute::<usize, fn(TraceEvent)>(raw) };
    hook(TraceEvent { ptr, size, result });
}

// ---------------------------------------------------------------------------
// Signal-block counter
// ---------------------------------------------------------------------------

thread_local! {
    // Runtime init: the shimmed Cell is not const-constructible under loom.
    static SIG_DEPTH: Cell<u32> = Cell::new(0);
}

/// RAII depth counter around every public entry point.  A handler (or late
/// TLS destructor) that allocates re-enters with a nonzero depth; the
/// counter is TLS-only and costs no syscalls.
struct SigBlock;

impl SigBlock {
    #[inline]
    fn enter() -> Self {
        let _ = SIG_DEPTH.try_with(|d| d.set(d.get() + 1));
        SigBlock
    }
}

impl Drop for SigBlock {
    #[inline]
    fn drop(&mut self) {
        let _ = SIG_DEPTH.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Current re-entry depth for this thread (0 outside allocator calls).
#[allow(dead_code)]
pub(crate) fn signal_block_depth() -> u32 {
    SIG_DEPTH.try_with(Cell::get).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// errno
// ---------------------------------------------------------------------------

fn set_errno(code: i32) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // Safety: FFI; __errno_location returns this thread's errno slot.
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    // Safety: FFI; __error returns this thread's errno slot.
    unsafe {
        *libc::__error() = code;
    }
    #[cfg(any(target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
    // Safety: FFI; __errno returns this thread's errno slot.
    unsafe {
        *libc::__errno() = code;
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Allocate `size` bytes.  `malloc(0)` returns a distinct non-null pointer.
/// Returns null with `errno = ENOMEM` on exhaustion.
pub fn malloc(size: usize) -> *mut u8 {
    let _sig = SigBlock::enter();
    match slab::slab_alloc(size, 0) {
        Some(p) => {
            trace(null_mut(), size, p.as_ptr());
            p.as_ptr()
        }
        None => {
            set_errno(libc::ENOMEM);
            null_mut()
        }
    }
}

// Factors below this cannot overflow when multiplied.
const MUL_NO_OVERFLOW: usize = 1 << (usize::BITS / 2);

/// Allocate zeroed space for `number` items of `size` bytes.  Product
/// overflow fails with `ENOMEM` before touching the engine.
pub fn calloc(number: usize, size: usize) -> *mut u8 {
    if (number >= MUL_NO_OVERFLOW || size >= MUL_NO_OVERFLOW)
        && number > 0
        && usize::MAX / number < size
    {
        set_errno(libc::ENOMEM);
        return null_mut();
    }

    let _sig = SigBlock::enter();
    match slab::slab_alloc(number * size, AF_ZERO) {
        Some(p) => {
            trace(null_mut(), number * size, p.as_ptr());
            p.as_ptr()
        }
        None => {
            set_errno(libc::ENOMEM);
            null_mut()
        }
    }
}

/// Resize an allocation.  Within one size class the pointer is returned
/// unchanged; otherwise the prefix is copied.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator; it is invalid
/// after a successful move.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let _sig = SigBlock::enter();
    // Safety: forwarded caller contract.
    match unsafe { slab::slab_realloc(ptr, size) } {
        Some(p) => {
            trace(ptr, size, p.as_ptr());
            p.as_ptr()
        }
        None => {
            set_errno(libc::ENOMEM);
            null_mut()
        }
    }
}

/// Release an allocation.  `free(null)` is a no-op.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator, not yet freed.
pub unsafe fn free(ptr: *mut u8) {
    trace(ptr, 0, null_mut());
    let _sig = SigBlock::enter();
    // Safety: forwarded caller contract.
    unsafe { slab::slab_free(ptr) };
}

/// Allocate `size` bytes aligned to `alignment` (a power of two).  Returns
/// null with `errno` set on failure.
pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    let _sig = SigBlock::enter();
    match slab::slab_memalign_entry(alignment, size) {
        Ok(p) => {
            trace(null_mut(), size, p.as_ptr());
            p.as_ptr()
        }
        Err(code) => {
            set_errno(code);
            null_mut()
        }
    }
}

/// POSIX aligned allocation.  `alignment` must be a power of two at least
/// the size of a pointer; violations return `EINVAL`, exhaustion `ENOMEM`,
/// success 0 with `*out` set.
pub fn posix_memalign(out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    if alignment < std::mem::size_of::<*mut u8>() {
        *out = null_mut();
        return libc::EINVAL;
    }

    let _sig = SigBlock::enter();
    match slab::slab_memalign_entry(alignment, size) {
        Ok(p) => {
            trace(null_mut(), size, p.as_ptr());
            *out = p.as_ptr();
            0
        }
        Err(code) => {
            *out = null_mut();
            code
        }
    }
}

/// Usable bytes of the allocation containing `ptr` (0 for null).
///
/// # Safety
/// `ptr` must be null or point into a live allocation from this allocator.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    let _sig = SigBlock::enter();
    // Safety: forwarded caller contract.
    unsafe { slab::slab_usable_size(ptr) }
}

// ---------------------------------------------------------------------------
// Fork plumbing
// ---------------------------------------------------------------------------

/// Acquire the engine-wide locks before `fork()`: depot first, then the
/// zone magazine.  Per-class and shard locks stay free — their hold times
/// are bounded and a mid-operation fork cannot observe them half-written
/// through this pair.
pub fn prefork() {
    slab::fork_prepare();
}

/// Release the pre-fork locks in the parent.
pub fn postfork_parent() {
    slab::fork_release();
}

/// Release the pre-fork locks in the child.
pub fn postfork_child() {
    slab::fork_release();
}

extern "C" fn atfork_prepare() {
    prefork();
}

extern "C" fn atfork_parent() {
    postfork_parent();
}

extern "C" fn atfork_child() {
    postfork_child();
}

static FORK_HOOKS: OnceLock<()> = OnceLock::new();

/// Register the fork hooks with the host libc (idempotent).
pub fn install_fork_hooks() {
    FORK_HOOKS.get_or_init(|| {
        // Safety: FFI; the handlers are static extern "C" functions.
        unsafe {
            libc::pthread_atfork(
                Some(atfork_prepare),
                Some(atfork_parent),
                Some(atfork_child),
            );
        }
    });
}

// ---------------------------------------------------------------------------
// GlobalAlloc adapter
// ---------------------------------------------------------------------------

/// Adapter for `#[global_allocator]` use.
pub struct MagAlloc;

// Safety: implementation follows the GlobalAlloc contract; alignment is
// honoured through the chunking rule or the memalign ladder.
unsafe impl std::alloc::GlobalAlloc for MagAlloc {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() <= super::size_class::MIN_CHUNK_SIZE {
            malloc(layout.size())
        } else {
            aligned_alloc(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        // Safety: forwarded GlobalAlloc contract.
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() <= super::size_class::MIN_CHUNK_SIZE {
            calloc(layout.size(), 1)
        } else {
            let p = aligned_alloc(layout.align(), layout.size());
            if !p.is_null() {
                // Safety: p spans at least layout.size() writable bytes.
                unsafe { std::ptr::write_bytes(p, 0, layout.size()) };
            }
            p
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: std::alloc::Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= super::size_class::MIN_CHUNK_SIZE {
            // Safety: forwarded GlobalAlloc contract.
            return unsafe { realloc(ptr, new_size) };
        }
        // Stronger alignment must be re-established by hand.
        let n = aligned_alloc(layout.align(), new_size);
        if !n.is_null() {
            // Safety: both blocks are live; copy the surviving prefix.
            unsafe {
                let old = usable_size(ptr).min(new_size);
                std::ptr::copy_nonoverlapping(ptr, n, old);
                free(ptr);
            }
        }
        n
    }
}
