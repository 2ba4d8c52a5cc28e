//! Oversized-allocation path: page-granular mappings tracked by bookkeeping
//! records in a sharded hash table, with a small lock-free reuse cache and
//! excess-byte reclamation.
//!
//! Records are allocated through the slab engine (they are 32 bytes), so the
//! two layers are mutually recursive one level deep; the magazine cache's
//! `newmag` staging keeps that bounded.

use super::mpanic;
use super::slab::{AF_ZERO, ThrMags, slab_alloc_inner, slab_free_inner};
use super::spin::SpinLock;
use super::stats;
use super::vm::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PlatformVmOps, VmOps, round_to_pages};
use crate::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::ptr::{self, NonNull, null_mut};

const BIGHSHIFT: usize = 10;
pub(crate) const BIGHSIZE: usize = 1 << BIGHSHIFT;
const BIGHMASK: usize = BIGHSIZE - 1;
pub(crate) const BIGXSIZE: usize = BIGHSIZE / 16;
const BIGXMASK: usize = BIGXSIZE - 1;

/// Reuse-cache geometry.  The cache is probed linearly, so it stays small;
/// only blocks up to `BIGCACHE_LIMIT` are retained.
pub(crate) const BIGCACHE: usize = 16;
const BIGCACHE_MASK: usize = BIGCACHE - 1;
pub(crate) const BIGCACHE_LIMIT: usize = 1024 * 1024;

/// Reclamation threshold for mapped-beyond-active bytes.  Sweeping is
/// expensive, so the trigger is generous.
pub(crate) const BIGCACHE_EXCESS: usize = 16 * 1024 * 1024;

/// Bookkeeping for one oversized allocation.  `bytes` is the mapped length
/// (possibly larger than requested, for growth headroom); `active` is the
/// caller-visible length.
#[repr(C)]
pub(crate) struct BigRecord {
    next: *mut BigRecord,
    base: *mut u8,
    active: usize,
    bytes: usize,
}

// ---------------------------------------------------------------------------
// Hash table of records, sharded locks
// ---------------------------------------------------------------------------

struct BigTable {
    /// Chain heads are atomics so the empty-chain fast path can test them
    /// without taking the shard lock; all mutation happens under it.
    chains: [AtomicPtr<BigRecord>; BIGHSIZE],
    shards: [SpinLock<()>; BIGXSIZE],
}

impl BigTable {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            chains: [const { AtomicPtr::new(null_mut()) }; BIGHSIZE],
            shards: [const { SpinLock::new(()) }; BIGXSIZE],
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            chains: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
            shards: std::array::from_fn(|_| SpinLock::new(())),
        }
    }
}

crate::sync::static_atomic! {
    static BIG_TABLE: BigTable = BigTable::new();
}

crate::sync::static_atomic! {
    static EXCESS: AtomicIsize = AtomicIsize::new(0);
}

/// Unmasked hash of a base pointer; callers mask with `BIGHMASK` for the
/// chain and `BIGXMASK` for the lock shard.
#[inline]
fn big_hash(ptr: *const u8) -> usize {
    let a = ptr as usize;
    (a >> PAGE_SHIFT) ^ (a >> (PAGE_SHIFT + BIGHSHIFT))
}

/// Current mapped-beyond-active total, clamped at zero for display.
pub(crate) fn excess_bytes() -> usize {
    EXCESS.load(Ordering::Relaxed).max(0).cast_unsigned()
}

#[inline]
fn excess_add(delta: isize) {
    EXCESS.fetch_add(delta, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Bigcache: lock-free reuse of recently freed blocks
// ---------------------------------------------------------------------------

/// Slot pointers are swapped atomically; the size fields are advisory and
/// may race.  A stale size only costs an extra miss (the swapped record is
/// re-validated against its own `bytes`), never memory unsafety.
pub(crate) struct BigCache {
    slots: [AtomicPtr<BigRecord>; BIGCACHE],
    sizes: [AtomicUsize; BIGCACHE],
    index: AtomicU32,
}

impl BigCache {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { AtomicPtr::new(null_mut()) }; BIGCACHE],
            sizes: [const { AtomicUsize::new(0) }; BIGCACHE],
            index: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
            sizes: std::array::from_fn(|_| AtomicUsize::new(0)),
            index: AtomicU32::new(0),
        }
    }

    /// Take the first cached record whose advertised size covers `bytes`.
    /// The caller re-validates `record.bytes` — the advertised size may be
    /// stale.
    pub(crate) fn find_alloc(&self, bytes: usize) -> *mut BigRecord {
        for i in 0..BIGCACHE {
            if bytes <= self.sizes[i].load(Ordering::Relaxed) {
                self.sizes[i].store(0, Ordering::Relaxed);
                return self.slots[i].swap(null_mut(), Ordering::AcqRel);
            }
        }
        null_mut()
    }

    /// Try to retain `big`, preferring to displace a smaller entry.  Returns
    /// the displaced record (or `big` itself when nothing smaller was
    /// found); the caller must genuinely release whatever comes back.
    ///
    /// # Safety
    /// `big` must point to a live, unlinked record owned by the caller.
    pub(crate) unsafe fn stash(&self, big: *mut BigRecord) -> *mut BigRecord {
        // Safety: caller owns the record.
        let bytes = unsafe { (*big).bytes };
        let b = self.index.fetch_add(1, Ordering::Relaxed) as usize + 1;
        for i in 0..BIGCACHE {
            let j = (b + i) & BIGCACHE_MASK;
            if self.sizes[j].load(Ordering::Relaxed) < bytes {
                self.sizes[j].store(bytes, Ordering::Relaxed);
                return self.slots[j].swap(big, Ordering::AcqRel);
            }
        }
        big
    }
}

#[cfg(loom)]
impl BigCache {
    /// Leak a standalone record for the loom cache-protocol models.
    pub(crate) fn make_test_record(&self, bytes: usize) -> *mut BigRecord {
        Box::into_raw(Box::new(BigRecord {
            next: null_mut(),
            base: null_mut(),
            active: bytes,
            bytes,
        }))
    }
}

crate::sync::static_atomic! {
    static BIG_CACHE: BigCache = BigCache::new();
}

// ---------------------------------------------------------------------------
// Record insertion / release helpers
// ---------------------------------------------------------------------------

/// Link a record at the head of its hash chain, crediting any mapped excess.
///
/// # Safety
/// `big` must be a live unlinked record whose `base`/`active`/`bytes` are
/// final for this insertion.
unsafe fn insert_record(big: *mut BigRecord) {
    // Safety: caller owns the record until it is linked.
    unsafe {
        let hv = big_hash((*big).base);
        if (*big).active < (*big).bytes {
            excess_add(((*big).bytes - (*big).active).cast_signed());
        }
        let _shard = BIG_TABLE.shards[hv & BIGXMASK].lock();
        let chain = &BIG_TABLE.chains[hv & BIGHMASK];
        (*big).next = chain.load(Ordering::Relaxed);
        chain.store(big, Ordering::Release);
    }
}

/// Dispose of an unlinked record: stash small blocks in the bigcache,
/// genuinely unmap whatever cannot be (or was displaced).
///
/// # Safety
/// `big` must be live, unlinked, and exclusively owned by the caller.
unsafe fn release_record(big: *mut BigRecord, tp: &mut ThrMags) {
    let mut big = big;
    // Safety: caller owns the record.
    unsafe {
        if (*big).bytes <= BIGCACHE_LIMIT {
            big = BIG_CACHE.stash(big);
            if big.is_null() {
                return;
            }
        }
        let base = (*big).base;
        let bytes = (*big).bytes;
        slab_free_inner(big.cast::<u8>(), tp);
        stats::TOTAL_MAPPED.sub(bytes);
        stats::BIG_MAPPED.sub(bytes);
        drop(PlatformVmOps::unmap(NonNull::new_unchecked(base), bytes));
    }
}

/// Sweep every chain once the excess pool crosses its threshold, truncating
/// each record's mapped tail back to its active size.  Shards are taken in
/// index order, one at a time.
fn handle_excess() {
    if EXCESS.load(Ordering::Relaxed) <= BIGCACHE_EXCESS.cast_signed() {
        return;
    }

    for i in 0..BIGHSIZE {
        let chain = &BIG_TABLE.chains[i];
        if chain.load(Ordering::Relaxed).is_null() {
            continue;
        }
        let shard = &BIG_TABLE.shards[i & BIGXMASK];
        let guard = shard.lock();
        let mut big = chain.load(Ordering::Relaxed);
        while !big.is_null() {
            // Safety: chain membership is stable under the shard lock.
            unsafe {
                let active = (*big).active;
                let bytes = (*big).bytes;
                if active < bytes {
                    if (active & PAGE_MASK) != 0 || (bytes & PAGE_MASK) != 0 {
                        drop(guard);
                        mpanic!("big record {big:p} has unaligned span {active}/{bytes}");
                    }
                    let tail = (*big).base.add(active);
                    drop(PlatformVmOps::unmap(
                        NonNull::new_unchecked(tail),
                        bytes - active,
                    ));
                    stats::TOTAL_MAPPED.sub(bytes - active);
                    stats::BIG_MAPPED.sub(bytes - active);
                    excess_add(active.cast_signed() - bytes.cast_signed());
                    (*big).bytes = active;
                }
                big = (*big).next;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation / free / realloc
// ---------------------------------------------------------------------------

/// Allocate an oversized block.  `size` is the raw request; rounding and
/// cache-coloring happen here.
pub(crate) fn big_alloc_inner(size: usize, flags: u32, tp: &mut ThrMags) -> Option<NonNull<u8>> {
    let mut size = round_to_pages(size);
    // Overflow in rounding means someone asked for (usize::MAX - small).
    if size == 0 {
        return None;
    }

    // Exact multiples of two pages stride L1 sets identically on virtually
    // indexed caches; burn one page to spread them.
    if (size & (2 * PAGE_SIZE - 1)) == 0 {
        size += PAGE_SIZE;
    }

    let mut big: *mut BigRecord = null_mut();
    if size <= BIGCACHE_LIMIT {
        big = BIG_CACHE.find_alloc(size);
        // Safety: a record from the cache is unlinked and ours.
        unsafe {
            if !big.is_null() && (*big).bytes < size {
                // Advertised size raced; toss it and map fresh.
                release_record(big, tp);
                big = null_mut();
            }
        }
    }

    let base: *mut u8;
    if !big.is_null() {
        // Safety: record is ours; the block it describes is unused.
        unsafe {
            base = (*big).base;
            if (flags & AF_ZERO) != 0 {
                ptr::write_bytes(base, 0, size);
            }
        }
    } else {
        // Safety: page-multiple size, page alignment.
        base = match unsafe { PlatformVmOps::map(size, PAGE_SIZE) } {
            Ok(p) => p.as_ptr(),
            Err(_) => return None,
        };
        let rec = match slab_alloc_inner(std::mem::size_of::<BigRecord>(), 0, tp) {
            Some(r) => r.as_ptr().cast::<BigRecord>(),
            None => {
                // Safety: base was just mapped and never published.
                unsafe {
                    drop(PlatformVmOps::unmap(NonNull::new_unchecked(base), size));
                }
                return None;
            }
        };
        stats::TOTAL_MAPPED.add(size);
        stats::BIG_MAPPED.add(size);
        // Fresh mappings arrive zeroed; no AF_ZERO work needed.
        // Safety: rec is a fresh slab chunk big enough for a record.
        unsafe {
            rec.write(BigRecord {
                next: null_mut(),
                base,
                active: size,
                bytes: size,
            });
        }
        big = rec;
    }

    // Safety: record is ours until linked.
    unsafe {
        (*big).active = size;
        insert_record(big);
    }
    handle_excess();
    NonNull::new(base)
}

/// Aligned big allocation for the memalign ladder: `size` is already
/// page-rounded, `align >= PAGE_SIZE`.  No cache-coloring — the caller asked
/// for an exact alignment, not a spread.
pub(crate) fn big_alloc_aligned(size: usize, align: usize, tp: &mut ThrMags) -> Option<NonNull<u8>> {
    debug_assert!((size & PAGE_MASK) == 0 && align >= PAGE_SIZE);

    if align == PAGE_SIZE && size <= BIGCACHE_LIMIT {
        let big = BIG_CACHE.find_alloc(size);
        if !big.is_null() {
            // Safety: cached record is unlinked and ours.
            unsafe {
                if (*big).bytes < size {
                    release_record(big, tp);
                } else {
                    let base = (*big).base;
                    (*big).active = size;
                    insert_record(big);
                    handle_excess();
                    return NonNull::new(base);
                }
            }
        }
    }

    // Safety: page-multiple size, power-of-two page-multiple alignment.
    let base = match unsafe { PlatformVmOps::map(size, align) } {
        Ok(p) => p.as_ptr(),
        Err(_) => return None,
    };
    let rec = match slab_alloc_inner(std::mem::size_of::<BigRecord>(), 0, tp) {
        Some(r) => r.as_ptr().cast::<BigRecord>(),
        None => {
            // Safety: base was just mapped and never published.
            unsafe {
                drop(PlatformVmOps::unmap(NonNull::new_unchecked(base), size));
            }
            return None;
        }
    };
    stats::TOTAL_MAPPED.add(size);
    stats::BIG_MAPPED.add(size);
    // Safety: rec is a fresh slab chunk; base is exclusively ours.
    unsafe {
        rec.write(BigRecord {
            next: null_mut(),
            base,
            active: size,
            bytes: size,
        });
        insert_record(rec);
    }
    NonNull::new(base)
}

/// Free-path probe: true when `ptr` was an oversized base and has been
/// fully handled here.
///
/// # Safety
/// `ptr` must be a pointer previously returned by this allocator.
pub(crate) unsafe fn big_free_check(ptr: *mut u8, tp: &mut ThrMags) -> bool {
    let hv = big_hash(ptr);
    let chain = &BIG_TABLE.chains[hv & BIGHMASK];
    // Cheap unlocked test: most frees are slab chunks whose hash chain is
    // empty.
    if chain.load(Ordering::Acquire).is_null() {
        return false;
    }

    let shard = &BIG_TABLE.shards[hv & BIGXMASK];
    let guard = shard.lock();
    // Only the chain head needs atomicity (for the unlocked test above);
    // interior links are plain fields mutated under the shard lock.
    let mut prev: *mut BigRecord = null_mut();
    let mut cur = chain.load(Ordering::Relaxed);
    // Safety: chain membership is stable under the shard lock.
    unsafe {
        while !cur.is_null() {
            if (*cur).base == ptr {
                if prev.is_null() {
                    chain.store((*cur).next, Ordering::Release);
                } else {
                    (*prev).next = (*cur).next;
                }
                excess_add((*cur).active.cast_signed() - (*cur).bytes.cast_signed());
                drop(guard);
                release_record(cur, tp);
                return true;
            }
            prev = cur;
            cur = (*cur).next;
        }
    }
    drop(guard);
    handle_excess();
    false
}

pub(crate) enum BigRealloc {
    /// `ptr` is not an oversized base; the slab path owns it.
    NotBig,
    /// Handled: the result (null = out of memory).
    Done(Option<NonNull<u8>>),
}

/// # Safety
/// `ptr` must be a live pointer from this allocator.
pub(crate) unsafe fn big_realloc(ptr: *mut u8, size: usize, tp: &mut ThrMags) -> BigRealloc {
    let hv = big_hash(ptr);
    let chain = &BIG_TABLE.chains[hv & BIGHMASK];
    if chain.load(Ordering::Acquire).is_null() {
        return BigRealloc::NotBig;
    }

    let shard = &BIG_TABLE.shards[hv & BIGXMASK];
    let guard = shard.lock();
    let mut prev: *mut BigRecord = null_mut();
    let mut cur = chain.load(Ordering::Relaxed);
    // Safety: chain membership is stable under the shard lock; the record
    // stays ours after unlinking.
    unsafe {
        while !cur.is_null() {
            if (*cur).base != ptr {
                prev = cur;
                cur = (*cur).next;
                continue;
            }

            let size = round_to_pages(size);
            if size == 0 {
                drop(guard);
                return BigRealloc::Done(None);
            }
            let bigbytes = (*cur).bytes;

            // Fits the existing mapping (and is not wasteful): adjust the
            // active span in place.
            if size >= bigbytes / 2 && size <= bigbytes {
                if (*cur).active != size {
                    excess_add((*cur).active.cast_signed() - size.cast_signed());
                }
                (*cur).active = size;
                drop(guard);
                return BigRealloc::Done(NonNull::new(ptr));
            }

            // Growing: keep 1/8 headroom so a realloc-in-a-loop caller does
            // not come back immediately.
            let target = round_to_pages(size + size / 8);
            if target > bigbytes && target != 0 {
                // Safety: growing our own mapping; try_grow is side-effect
                // free on failure.
                if PlatformVmOps::try_grow(
                    NonNull::new_unchecked(ptr),
                    bigbytes,
                    target,
                ) {
                    excess_add(
                        (*cur).active.cast_signed() - bigbytes.cast_signed()
                            + target.cast_signed()
                            - size.cast_signed(),
                    );
                    stats::TOTAL_MAPPED.add(target - bigbytes);
                    stats::BIG_MAPPED.add(target - bigbytes);
                    (*cur).bytes = target;
                    (*cur).active = size;
                    drop(guard);
                    return BigRealloc::Done(NonNull::new(ptr));
                }
            }

            // Move: allocate fresh with the same headroom, copy, release the
            // old block.  Unlink first but keep the record intact so a
            // failed allocation can relink it.
            let old_active = (*cur).active;
            if prev.is_null() {
                chain.store((*cur).next, Ordering::Release);
            } else {
                (*prev).next = (*cur).next;
            }
            (*cur).next = null_mut();
            drop(guard);

            // A request small enough for the zone alignment rule rejoins the
            // slab engine; headroom only pays off for blocks that stay big.
            let fresh = if size <= super::size_class::MAX_SLAB_PAGEALIGN {
                slab_alloc_inner(size, 0, tp)
            } else {
                big_alloc_reserve(size, target.max(size), tp)
            };
            let nptr = match fresh {
                Some(p) => p,
                None => {
                    // Relink the untouched record and report failure.
                    insert_record_preserving_excess(cur);
                    return BigRealloc::Done(None);
                }
            };
            ptr::copy_nonoverlapping(ptr, nptr.as_ptr(), old_active.min(size));
            excess_add(old_active.cast_signed() - bigbytes.cast_signed());
            release_record(cur, tp);
            handle_excess();
            return BigRealloc::Done(Some(nptr));
        }
    }
    drop(guard);
    handle_excess();
    BigRealloc::NotBig
}

/// Map `reserve` bytes but expose only `active`; the difference is excess,
/// pre-paid headroom for the next growth.
fn big_alloc_reserve(active: usize, reserve: usize, tp: &mut ThrMags) -> Option<NonNull<u8>> {
    debug_assert!(active <= reserve && (reserve & PAGE_MASK) == 0);
    // Safety: page-multiple size, page alignment.
    let base = match unsafe { PlatformVmOps::map(reserve, PAGE_SIZE) } {
        Ok(p) => p.as_ptr(),
        Err(_) => return None,
    };
    let rec = match slab_alloc_inner(std::mem::size_of::<BigRecord>(), 0, tp) {
        Some(r) => r.as_ptr().cast::<BigRecord>(),
        None => {
            // Safety: base was just mapped and never published.
            unsafe {
                drop(PlatformVmOps::unmap(NonNull::new_unchecked(base), reserve));
            }
            return None;
        }
    };
    stats::TOTAL_MAPPED.add(reserve);
    stats::BIG_MAPPED.add(reserve);
    // Safety: rec is a fresh slab chunk; base is exclusively ours.
    unsafe {
        rec.write(BigRecord {
            next: null_mut(),
            base,
            active,
            bytes: reserve,
        });
        insert_record(rec);
    }
    NonNull::new(base)
}

/// Relink a record whose excess is already accounted (used on realloc
/// failure: the record was unlinked but its spans never changed).
fn insert_record_preserving_excess(big: *mut BigRecord) {
    // Safety: record is ours until linked; spans unchanged, so no excess
    // delta.
    unsafe {
        let hv = big_hash((*big).base);
        let _shard = BIG_TABLE.shards[hv & BIGXMASK].lock();
        let chain = &BIG_TABLE.chains[hv & BIGHMASK];
        (*big).next = chain.load(Ordering::Relaxed);
        chain.store(big, Ordering::Release);
    }
}

/// # Safety
/// `ptr` must be null or point into a live allocation from this allocator.
pub(crate) unsafe fn big_usable_size(ptr: *const u8) -> Option<usize> {
    let hv = big_hash(ptr);
    let chain = &BIG_TABLE.chains[hv & BIGHMASK];
    if chain.load(Ordering::Acquire).is_null() {
        return None;
    }

    let shard = &BIG_TABLE.shards[hv & BIGXMASK];
    let _guard = shard.lock();
    let mut cur = chain.load(Ordering::Relaxed);
    // Safety: chain membership is stable under the shard lock.
    unsafe {
        while !cur.is_null() {
            let base = (*cur).base as usize;
            let p = ptr as usize;
            // Interior pointers are valid queries.
            if p >= base && p < base + (*cur).bytes {
                return Some(base + (*cur).bytes - p);
            }
            cur = (*cur).next;
        }
    }
    None
}
