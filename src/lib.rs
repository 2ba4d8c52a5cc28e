#[cfg(not(target_pointer_width = "64"))]
compile_error!("magalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// malloc-family entry points
pub use memory::api::{
    MagAlloc, TraceEvent, aligned_alloc, calloc, free, install_fork_hooks, malloc,
    posix_memalign, postfork_child, postfork_parent, prefork, realloc, set_trace_hook,
    usable_size,
};

// diagnostics
pub use memory::stats::{MemoryStats, snapshot};

// errors
pub use memory::vm::VmError;
