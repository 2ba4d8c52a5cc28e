pub(crate) mod api;
pub(crate) mod big;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod size_class;
pub(crate) mod slab;
pub(crate) mod spin;
pub(crate) mod stats;
pub(crate) mod vm;

use crate::sync::atomic::{AtomicU32, Ordering};

crate::sync::static_atomic! {
    static DIED: AtomicU32 = AtomicU32::new(0);
}

/// Fatal heap-corruption diagnostic: one line on stderr, then abort.
///
/// Callers holding a spinlock must release it first; an abort handler in the
/// host program may itself allocate, and a held lock would deadlock it.
/// The `DIED` latch keeps a second corruption detected while reporting the
/// first from recursing into the printer.
pub(crate) fn die(args: std::fmt::Arguments<'_>) -> ! {
    if DIED.swap(1, Ordering::Relaxed) == 0 {
        eprintln!("magalloc: {args}");
    }
    std::process::abort();
}

/// Formatting front-end for [`die`].
macro_rules! mpanic {
    ($($t:tt)*) => {
        crate::memory::die(format_args!($($t)*))
    };
}
pub(crate) use mpanic;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
