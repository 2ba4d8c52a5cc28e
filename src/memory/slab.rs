//! Two-level slab engine: zones carved into size-classed chunks, fronted by
//! per-thread magazine pairs that cycle through a shared depot.
//!
//! Layering, fast path first:
//!
//! 1. per-thread `loaded`/`prev` magazines — no locks at all;
//! 2. the depot (full/empty magazine reservoirs, one spinlock for all
//!    classes — the fast path never touches it);
//! 3. per-class zone lists under per-class spinlocks;
//! 4. the zone magazine recycling whole 64 KiB zones between classes;
//! 5. the VM adapter.
//!
//! Requests at or above [`ZONE_LIMIT`], and page-multiple requests above
//! [`MAX_SLAB_PAGEALIGN`], bypass all of this — see [`super::big`].

use super::mpanic;
use super::size_class::{
    CACHE_CHUNKS, M_MAX_ROUNDS, M_ZONE_HYSTERESIS, M_ZONE_INIT_ROUNDS, MAX_SLAB_PAGEALIGN, NZONES,
    SLAB_MAGIC, ZONE_LIMIT, ZONE_MASK, ZONE_PAGE_COUNT, ZONE_SIZE, classify, magazine_capacity,
};
use super::spin::SpinLock;
use super::vm::{PAGE_SHIFT, PAGE_SIZE, PlatformVmOps, VmOps, round_to_pages};
use super::{big, stats};
use crate::sync::cell::UnsafeCell;
use std::ptr::{self, NonNull, null_mut};

// Allocation flags.
pub(crate) const AF_ZERO: u32 = 0x01;
/// Provenance marker: the memory handed out was never dirtied since the OS
/// zeroed it.  Tracked but not branched on; reserved for a skip-zeroing
/// optimization.
pub(crate) const AF_PASSIVE: u32 = 0x02;
/// Set while allocating a magazine itself; suppresses `newmag` staging so
/// the magazine cache cannot recurse into its own refill.
pub(crate) const AF_MAGS_INTERNAL: u32 = 0x04;

/// Zone flag: contents are not known to be zero (zone was recycled through
/// the zone magazine rather than freshly mapped).
pub(crate) const ZF_UNOTZEROD: u32 = 0x0001;

// ---------------------------------------------------------------------------
// Zone: in-band header at offset 0 of a ZONE_SIZE-aligned region
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct Zone {
    magic: u32,
    flags: u32,
    class_index: u32,
    _pad: u32,
    chunk_size: usize,
    n_max: usize,
    n_free: usize,
    /// Offset of chunk 0 from the zone base.
    base_off: usize,
    /// Cursor into the never-yet-carved tail, wrapping at `n_max`.
    u_index: usize,
    u_end_index: usize,
    /// Smallest page index with a non-empty free list; `ZONE_PAGE_COUNT`
    /// when every per-page list is empty.
    first_free_pg: usize,
    next: *mut Zone,
    /// Per-page singly linked lists of freed chunks.  The link word lives in
    /// the first pointer-sized bytes of each free chunk.
    page_free: [*mut u8; ZONE_PAGE_COUNT],
}

const _: () = assert!(std::mem::size_of::<Zone>() <= 256);
const _: () = assert!(ZONE_PAGE_COUNT == 16);

#[inline]
pub(crate) fn zone_of(ptr: *const u8) -> *mut Zone {
    ((ptr as usize) & !ZONE_MASK) as *mut Zone
}

#[inline]
unsafe fn chunk_next(chunk: *mut u8) -> *mut u8 {
    // Safety: caller guarantees chunk is a live free chunk with the link
    // word in its first bytes.
    unsafe { *chunk.cast::<*mut u8>() }
}

#[inline]
unsafe fn set_chunk_next(chunk: *mut u8, next: *mut u8) {
    // Safety: caller owns the free chunk.
    unsafe { *chunk.cast::<*mut u8>() = next }
}

#[inline]
unsafe fn zone_chunk(z: *mut Zone, idx: usize) -> *mut u8 {
    // Safety: caller guarantees idx < n_max.
    unsafe { (z as *mut u8).add((*z).base_off + idx * (*z).chunk_size) }
}

/// Lay a header over a fresh or recycled ZONE_SIZE region.
///
/// Chunk storage starts at the header size rounded up to the chunk size when
/// that is a power of two (power-of-two chunks then self-align because the
/// zone base is ZONE_SIZE-aligned), otherwise to the band chunking — the two
/// must not be conflated or non-power-of-two chunks waste their alignment.
unsafe fn format_zone(
    mem: *mut u8,
    zi: usize,
    chunk_size: usize,
    chunking: usize,
    unotzerod: bool,
) -> *mut Zone {
    debug_assert_eq!(mem as usize & ZONE_MASK, 0, "zone base not aligned");
    let header = std::mem::size_of::<Zone>();
    let step = if chunk_size.is_power_of_two() {
        chunk_size
    } else {
        chunking
    };
    let off = (header + step - 1) & !(step - 1);
    let z = mem.cast::<Zone>();
    // Safety: mem is a ZONE_SIZE region owned by the caller; the header fits
    // (compile-time size assert above, off >= header).
    unsafe {
        z.write(Zone {
            magic: SLAB_MAGIC,
            flags: if unotzerod { ZF_UNOTZEROD } else { 0 },
            class_index: zi as u32,
            _pad: 0,
            chunk_size,
            n_max: (ZONE_SIZE - off) / chunk_size,
            n_free: (ZONE_SIZE - off) / chunk_size,
            base_off: off,
            u_index: 0,
            u_end_index: 0,
            first_free_pg: ZONE_PAGE_COUNT,
            next: null_mut(),
            page_free: [null_mut(); ZONE_PAGE_COUNT],
        });
    }
    z
}

// ---------------------------------------------------------------------------
// Per-class zone lists.  Only zones with free chunks are linked.
// ---------------------------------------------------------------------------

pub(crate) struct ZoneList {
    head: *mut Zone,
}

// Safety: the zones hang off process-wide state; the list spinlock
// serialises all mutation.
unsafe impl Send for ZoneList {}

struct ZoneLists([SpinLock<ZoneList>; NZONES]);

impl ZoneLists {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self([const { SpinLock::new(ZoneList { head: null_mut() }) }; NZONES])
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self(std::array::from_fn(|_| {
            SpinLock::new(ZoneList { head: null_mut() })
        }))
    }
}

crate::sync::static_atomic! {
    static ZONE_LISTS: ZoneLists = ZoneLists::new();
}

// ---------------------------------------------------------------------------
// Zone magazine: recycles whole zones between size classes
// ---------------------------------------------------------------------------

pub(crate) struct ZoneMagazine {
    rounds: usize,
    objects: [*mut u8; M_ZONE_INIT_ROUNDS],
}

// Safety: zone pointers are owned by whoever pops them; the magazine's
// spinlock serialises access.
unsafe impl Send for ZoneMagazine {}

impl ZoneMagazine {
    pub(crate) const fn new() -> Self {
        Self {
            rounds: 0,
            objects: [null_mut(); M_ZONE_INIT_ROUNDS],
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.rounds == M_ZONE_INIT_ROUNDS
    }

    pub(crate) fn push(&mut self, z: *mut u8) {
        debug_assert!(self.rounds < M_ZONE_INIT_ROUNDS);
        self.objects[self.rounds] = z;
        self.rounds += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<*mut u8> {
        if self.rounds == 0 {
            None
        } else {
            self.rounds -= 1;
            Some(self.objects[self.rounds])
        }
    }
}

crate::sync::static_atomic! {
    static ZONE_MAG: SpinLock<ZoneMagazine> = SpinLock::new(ZoneMagazine::new());
}

/// Get a zero-or-dirty ZONE_SIZE region.  Returns the base and whether the
/// region is of unknown content (recycled: caller must not assume zero).
fn zone_acquire() -> Option<(*mut u8, bool)> {
    {
        let mut mag = ZONE_MAG.lock();
        if let Some(z) = mag.pop() {
            return Some((z, true));
        }
    }
    // Safety: requesting a page-multiple size with power-of-two alignment.
    let ptr = unsafe { PlatformVmOps::map(ZONE_SIZE, ZONE_SIZE) }.ok()?;
    stats::TOTAL_MAPPED.add(ZONE_SIZE);
    stats::SLAB_MAPPED.add(ZONE_SIZE);
    Some((ptr.as_ptr(), false))
}

/// Return a fully-free zone to the zone magazine.  When the magazine is
/// full, [`M_ZONE_HYSTERESIS`] zones are drained to the VM adapter in one
/// batch before the incoming zone is pushed.
unsafe fn zone_release(z: *mut Zone) {
    let mem = z.cast::<u8>();
    // Safety: the zone is fully free and unlinked; nothing references it.
    unsafe {
        ptr::write_bytes(mem, 0, std::mem::size_of::<Zone>());
    }
    if super::api::opt_madvise() {
        // Safety: advisory call over a region we own.
        unsafe {
            PlatformVmOps::advise_unused(NonNull::new_unchecked(mem), ZONE_SIZE);
        }
    }

    let mut overflow: [*mut u8; M_ZONE_HYSTERESIS] = [null_mut(); M_ZONE_HYSTERESIS];
    let mut n_over = 0;
    {
        let mut mag = ZONE_MAG.lock();
        if mag.is_full() {
            while n_over < M_ZONE_HYSTERESIS {
                match mag.pop() {
                    Some(p) => {
                        overflow[n_over] = p;
                        n_over += 1;
                    }
                    None => break,
                }
            }
        }
        mag.push(mem);
    }
    for &p in &overflow[..n_over] {
        // Safety: p is an unused ZONE_SIZE region we own.
        unsafe {
            drop(PlatformVmOps::unmap(NonNull::new_unchecked(p), ZONE_SIZE));
        }
        stats::TOTAL_MAPPED.sub(ZONE_SIZE);
        stats::SLAB_MAPPED.sub(ZONE_SIZE);
    }
}

// ---------------------------------------------------------------------------
// Magazines and depots
// ---------------------------------------------------------------------------

/// Fixed-capacity stack of free chunks.  The struct is exactly 4 KiB and is
/// itself allocated through the slab engine.
#[repr(C)]
pub(crate) struct Magazine {
    next: *mut Magazine,
    capacity: usize,
    rounds: usize,
    objects: [*mut u8; M_MAX_ROUNDS],
}

const _: () = assert!(std::mem::size_of::<Magazine>() == 4096);

impl Magazine {
    #[inline]
    fn is_full(&self) -> bool {
        self.rounds == self.capacity
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    #[inline]
    fn pop(&mut self) -> Option<*mut u8> {
        if self.rounds == 0 {
            None
        } else {
            self.rounds -= 1;
            Some(self.objects[self.rounds])
        }
    }

    #[inline]
    fn push(&mut self, p: *mut u8) {
        debug_assert!(self.rounds < self.capacity);
        self.objects[self.rounds] = p;
        self.rounds += 1;
    }

    #[inline]
    fn try_push(&mut self, p: *mut u8) -> bool {
        if self.rounds < self.capacity {
            self.objects[self.rounds] = p;
            self.rounds += 1;
            true
        } else {
            false
        }
    }
}

#[inline]
unsafe fn maglist_push(head: &mut *mut Magazine, m: *mut Magazine) {
    // Safety: m is exclusively owned by the caller.
    unsafe {
        (*m).next = *head;
    }
    *head = m;
}

#[inline]
unsafe fn maglist_pop(head: &mut *mut Magazine) -> *mut Magazine {
    let m = *head;
    if !m.is_null() {
        // Safety: m came off the list the caller locks.
        unsafe {
            *head = (*m).next;
            (*m).next = null_mut();
        }
    }
    m
}

struct Depot {
    full: *mut Magazine,
    empty: *mut Magazine,
}

struct DepotSet([Depot; NZONES]);

// Safety: all depots are guarded by the single depot spinlock.
unsafe impl Send for DepotSet {}

impl DepotSet {
    const fn new() -> Self {
        Self(
            [const {
                Depot {
                    full: null_mut(),
                    empty: null_mut(),
                }
            }; NZONES],
        )
    }
}

// One spinlock covers every class's depot: the per-thread pair absorbs the
// traffic, so the depot is contended only on pair exhaustion.
crate::sync::static_atomic! {
    static DEPOTS: SpinLock<DepotSet> = SpinLock::new(DepotSet::new());
}

// ---------------------------------------------------------------------------
// Per-thread state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct MagazinePair {
    loaded: *mut Magazine,
    prev: *mut Magazine,
}

pub(crate) struct ThrMags {
    pairs: [MagazinePair; NZONES],
    /// Pre-staged empty magazine.  Installing a fresh magazine inside the
    /// cycle loops would otherwise recurse into `slab_alloc` for the
    /// magazine's own size class with no bound.
    newmag: *mut Magazine,
    /// -1 during construction and teardown (magazine layer disabled so
    /// re-entrant destructors fall through to the slow path), 1 when alive.
    init: i8,
}

impl ThrMags {
    const fn new() -> Self {
        Self {
            pairs: [const {
                MagazinePair {
                    loaded: null_mut(),
                    prev: null_mut(),
                }
            }; NZONES],
            newmag: null_mut(),
            init: 1,
        }
    }

    const fn disabled() -> Self {
        Self {
            pairs: [const {
                MagazinePair {
                    loaded: null_mut(),
                    prev: null_mut(),
                }
            }; NZONES],
            newmag: null_mut(),
            init: -1,
        }
    }
}

/// Per-thread handle owning the magazine pairs.
///
/// # Safety
///
/// `mags` is wrapped in `UnsafeCell` because it is only ever accessed by the
/// owning thread (via TLS).  No callee re-enters the TLS access point: every
/// internal function threads the same `&mut ThrMags` down the call chain,
/// including the recursive magazine-allocates-a-magazine case.
struct ThrMagsHandle {
    mags: UnsafeCell<ThrMags>,
}

// Safety: ThrMagsHandle is confined to a single thread via thread_local!.
unsafe impl Sync for ThrMagsHandle {}

thread_local! {
    static THREAD_MAGS: ThrMagsHandle = ThrMagsHandle {
        mags: UnsafeCell::new(ThrMags::new()),
    };
}

impl Drop for ThrMagsHandle {
    fn drop(&mut self) {
        // Thread exit: drain every owned magazine back to the engine, then
        // free the magazines themselves.  Magazine operations stay disabled
        // for any destructor that allocates after us.
        let tp: &mut ThrMags = crate::sync::unsafe_cell_get_mut!(self.mags);
        tp.init = -1;
        for zi in 0..NZONES {
            let mp = tp.pairs[zi].loaded;
            tp.pairs[zi].loaded = null_mut();
            // Safety: magazines in the pair are exclusively ours.
            unsafe { drain_and_free(mp, tp) };

            let mp = tp.pairs[zi].prev;
            tp.pairs[zi].prev = null_mut();
            // Safety: as above.
            unsafe { drain_and_free(mp, tp) };
        }
        if !tp.newmag.is_null() {
            let m = tp.newmag;
            tp.newmag = null_mut();
            // Safety: the staged magazine is empty and exclusively ours.
            unsafe { slab_free_inner(m.cast::<u8>(), tp) };
        }
    }
}

unsafe fn drain_and_free(mp: *mut Magazine, tp: &mut ThrMags) {
    if mp.is_null() {
        return;
    }
    // Safety: mp is exclusively owned; objects in it are live allocations.
    unsafe {
        while let Some(obj) = (*mp).pop() {
            slab_free_inner(obj, tp);
        }
        slab_free_inner(mp.cast::<u8>(), tp);
    }
}

/// Run `f` with this thread's magazine state.  After TLS teardown (a late
/// destructor allocating), a disabled stack-local state is substituted and
/// the engine services the call through the slow path.
pub(crate) fn with_thread_state<R>(f: impl FnOnce(&mut ThrMags) -> R) -> R {
    let mut f = Some(f);
    let attempt = THREAD_MAGS.try_with(|h| {
        // Safety: single-threaded TLS access; callees never re-enter TLS
        // (see ThrMagsHandle safety comment).
        let tp: &mut ThrMags = crate::sync::unsafe_cell_get_mut!(h.mags);
        let Some(g) = f.take() else {
            // try_with runs its closure at most once.
            // Safety: unreachable.
            unsafe { std::hint::unreachable_unchecked() }
        };
        g(tp)
    });
    match attempt {
        Ok(r) => r,
        Err(_) => {
            let Some(g) = f.take() else {
                // The closure never ran, so `f` is still present.
                // Safety: unreachable.
                unsafe { std::hint::unreachable_unchecked() }
            };
            let mut tp = ThrMags::disabled();
            g(&mut tp)
        }
    }
}

// ---------------------------------------------------------------------------
// Magazine cache (per-thread fast path)
// ---------------------------------------------------------------------------

#[inline]
fn swap_mags(pair: &mut MagazinePair) {
    std::mem::swap(&mut pair.loaded, &mut pair.prev);
}

/// Ensure `tp.newmag` is staged.  Returns false when the backing allocation
/// failed.  No-op while allocating a magazine itself (`AF_MAGS_INTERNAL`).
fn stage_newmag(tp: &mut ThrMags) -> bool {
    if !tp.newmag.is_null() {
        return true;
    }
    match slab_alloc_inner(std::mem::size_of::<Magazine>(), AF_ZERO | AF_MAGS_INTERNAL, tp) {
        Some(m) => {
            let m = m.as_ptr().cast::<Magazine>();
            if tp.newmag.is_null() {
                tp.newmag = m;
            } else {
                // The nested allocation staged one already; keep that one.
                // Safety: m is a fresh allocation nothing references.
                unsafe { slab_free_inner(m.cast::<u8>(), tp) };
            }
            true
        }
        None => false,
    }
}

/// Install `tp.newmag` as an empty magazine sized for class `zi`.
fn install_newmag(tp: &mut ThrMags, zi: usize) -> *mut Magazine {
    let m = tp.newmag;
    tp.newmag = null_mut();
    // Safety: the staged magazine is exclusively ours and zero-initialized.
    unsafe {
        (*m).capacity = magazine_capacity(zi);
        (*m).rounds = 0;
        (*m).next = null_mut();
    }
    m
}

fn mtmagazine_alloc(zi: usize, flags: u32, tp: &mut ThrMags) -> Option<*mut u8> {
    if tp.init < 0 {
        return None;
    }

    loop {
        if flags & AF_MAGS_INTERNAL == 0 && !stage_newmag(tp) {
            return None;
        }

        // Loaded magazine has rounds: pop and go.
        let mp = tp.pairs[zi].loaded;
        if !mp.is_null() {
            // Safety: loaded magazine is exclusively ours.
            if let Some(obj) = unsafe { (*mp).pop() } {
                return Some(obj);
            }
        }

        // The prev magazine is always completely empty or completely full.
        // Full: swap it in and retry.
        let pv = tp.pairs[zi].prev;
        // Safety: prev magazine is exclusively ours.
        if !pv.is_null() && unsafe { (*pv).is_full() } {
            swap_mags(&mut tp.pairs[zi]);
            continue;
        }

        // Cycle with the depot: depot(full) -> loaded -> prev -> depot(empty).
        let mut depots = DEPOTS.lock();
        let d = &mut depots.0[zi];
        if d.full.is_null() {
            // Nothing to cycle in.  Leave an empty loaded magazine behind so
            // the zone path can bulk-fill it, and fall through.
            if tp.pairs[zi].loaded.is_null() && !tp.newmag.is_null() {
                drop(depots);
                let m = install_newmag(tp, zi);
                tp.pairs[zi].loaded = m;
            }
            return None;
        }
        // Safety: list heads are guarded by the depot lock.
        unsafe {
            let m = maglist_pop(&mut d.full);
            let emptymag = tp.pairs[zi].prev;
            if !emptymag.is_null() {
                maglist_push(&mut d.empty, emptymag);
            }
            tp.pairs[zi].prev = tp.pairs[zi].loaded;
            tp.pairs[zi].loaded = m;
            debug_assert!(!(*m).is_empty(), "depot full-list held an empty magazine");
        }
    }
}

/// Returns true when the chunk was absorbed by the magazine layer.
fn mtmagazine_free(zi: usize, obj: *mut u8, tp: &mut ThrMags) -> bool {
    if tp.init < 0 {
        return false;
    }

    loop {
        // Staging must happen first: installing a fresh magazine below
        // cannot be allowed to allocate.
        if !stage_newmag(tp) {
            return false;
        }

        let mp = tp.pairs[zi].loaded;
        // Safety: loaded magazine is exclusively ours.
        if !mp.is_null() && unsafe { (*mp).try_push(obj) } {
            return true;
        }

        // Empty prev: swap it in and retry.
        let pv = tp.pairs[zi].prev;
        // Safety: prev magazine is exclusively ours.
        if !pv.is_null() && unsafe { (*pv).is_empty() } {
            swap_mags(&mut tp.pairs[zi]);
            continue;
        }

        // Cycle: depot(empty) -> loaded -> prev -> depot(full).
        let mut depots = DEPOTS.lock();
        let d = &mut depots.0[zi];
        // Safety: list heads are guarded by the depot lock; pair magazines
        // are exclusively ours.
        unsafe {
            let fullmag = tp.pairs[zi].prev;
            if !fullmag.is_null() {
                maglist_push(&mut d.full, fullmag);
            }
            tp.pairs[zi].prev = tp.pairs[zi].loaded;
            let m = maglist_pop(&mut d.empty);
            if !m.is_null() {
                debug_assert!(!(*m).is_full(), "depot empty-list held a full magazine");
                tp.pairs[zi].loaded = m;
                drop(depots);
            } else {
                drop(depots);
                let m = install_newmag(tp, zi);
                tp.pairs[zi].loaded = m;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Slab allocation / free
// ---------------------------------------------------------------------------

pub(crate) fn slab_alloc_inner(
    mut size: usize,
    mut flags: u32,
    tp: &mut ThrMags,
) -> Option<NonNull<u8>> {
    // Zero-size requests still get a distinct pointer; callers realloc and
    // free them like any other.
    if size == 0 {
        size = 1;
    }

    flags |= super::api::opt_flags();

    // Oversized, or page-multiple beyond what the zone alignment rule can
    // serve: the big path owns it.
    if size >= ZONE_LIMIT || (size & (PAGE_SIZE - 1) == 0 && size > MAX_SLAB_PAGEALIGN) {
        return big::big_alloc_inner(size, flags, tp);
    }

    let sc = classify(size);
    let zi = sc.index;
    let rounded = sc.rounded;

    if let Some(obj) = mtmagazine_alloc(zi, flags, tp) {
        if flags & AF_ZERO != 0 {
            // Safety: obj is a live chunk of at least `rounded` bytes.
            unsafe { ptr::write_bytes(obj, 0, rounded) };
        }
        return NonNull::new(obj);
    }

    let list = &ZONE_LISTS.0[zi];
    let z: *mut Zone;
    let mut guard = list.lock();
    if guard.head.is_null() {
        drop(guard);
        let (mem, unotzerod) = zone_acquire()?;
        // Safety: mem is a ZONE_SIZE region we exclusively own.
        let znew = unsafe { format_zone(mem, zi, rounded, sc.chunking, unotzerod) };
        if !unotzerod {
            // Fresh mapping: already zero.
            flags &= !AF_ZERO;
            flags |= AF_PASSIVE;
        }
        guard = list.lock();
        // Safety: znew is not yet shared; the list head is lock-protected.
        unsafe {
            (*znew).next = guard.head;
        }
        guard.head = znew;
        z = znew;
    } else {
        z = guard.head;
    }

    // Safety: z is linked, so n_free > 0 by the list invariant; all header
    // access below is under the class lock.
    unsafe {
        if (*z).n_free == 0 {
            drop(guard);
            mpanic!("zone {z:p} linked with no free chunks");
        }

        // Opportunistic bulk refill: amortize this lock hold over up to
        // CACHE_CHUNKS extra chunks pushed straight into the loaded magazine.
        let mut count = 0usize;
        let mp = tp.pairs[zi].loaded;
        if !mp.is_null() && tp.init >= 0 {
            count = ((*mp).capacity - (*mp).rounds)
                .min((*z).n_free - 1)
                .min(CACHE_CHUNKS);
        }

        let chunk: *mut u8;
        'carved: {
            // Prefer chunks from per-page free lists, lowest page first,
            // to concentrate reuse in earlier pages.
            while (*z).first_free_pg < ZONE_PAGE_COUNT {
                let pg = (*z).first_free_pg;
                let head = (*z).page_free[pg];
                if !head.is_null() {
                    if head as usize & ZONE_MASK == 0 {
                        drop(guard);
                        mpanic!("corrupt zone free list in {z:p} page {pg}");
                    }
                    (*z).page_free[pg] = chunk_next(head);
                    (*z).n_free -= 1;
                    if count == 0 {
                        chunk = head;
                        // Recycled chunk: keep any ZERO request intact.
                        break 'carved;
                    }
                    (*mp).push(head);
                    count -= 1;
                    continue;
                }
                (*z).first_free_pg += 1;
            }

            // Page lists empty but n_free says otherwise: the remainder
            // lives in the never-carved tail.
            loop {
                let c = zone_chunk(z, (*z).u_index);
                (*z).n_free -= 1;
                (*z).u_index += 1;
                if (*z).u_index == (*z).n_max {
                    (*z).u_index = 0;
                }
                if (*z).u_index == (*z).u_end_index && (*z).n_free != 0 {
                    drop(guard);
                    mpanic!("zone {z:p} tail cursor wrapped with {} free", (*z).n_free);
                }
                if count == 0 {
                    chunk = c;
                    break;
                }
                (*mp).push(c);
                count -= 1;
            }

            if (*z).flags & ZF_UNOTZEROD == 0 {
                // Tail memory in a fresh zone is still OS-zero.
                flags &= !AF_ZERO;
                flags |= AF_PASSIVE;
            }
        }

        if (*z).n_free == 0 {
            guard.head = (*z).next;
            (*z).next = null_mut();
        }
        drop(guard);

        if flags & AF_ZERO != 0 {
            ptr::write_bytes(chunk, 0, rounded);
        }
        NonNull::new(chunk)
    }
}

/// # Safety
/// `ptr` must be a pointer previously returned by this allocator and not
/// yet freed.
pub(crate) unsafe fn slab_free_inner(ptr: *mut u8, tp: &mut ThrMags) {
    if ptr.is_null() {
        return;
    }

    // Safety: forwarded caller contract.
    if unsafe { big::big_free_check(ptr, tp) } {
        return;
    }

    let z = zone_of(ptr);
    // Safety: a valid slab pointer's zone header lives at the masked base;
    // the magic check rejects everything else before further use.
    unsafe {
        if (*z).magic != SLAB_MAGIC {
            mpanic!("free: bad pointer {ptr:p} (zone magic mismatch)");
        }
        let size = (*z).chunk_size;
        let zi = (*z).class_index as usize;

        // A freed chunk must lie inside the zone's chunk array.
        match (ptr as usize).checked_sub(z as usize + (*z).base_off) {
            Some(off) if off < (*z).n_max * size => {}
            _ => mpanic!("free: pointer {ptr:p} outside chunk array of zone {z:p}"),
        }

        if super::api::opt_flags() & AF_ZERO != 0 {
            ptr::write_bytes(ptr, 0, size);
        }

        if mtmagazine_free(zi, ptr, tp) {
            return;
        }

        let pg = (ptr as usize - z as usize) >> PAGE_SHIFT;
        let list = &ZONE_LISTS.0[zi];
        let mut guard = list.lock();

        set_chunk_next(ptr, (*z).page_free[pg]);
        (*z).page_free[pg] = ptr;
        if (*z).first_free_pg > pg {
            (*z).first_free_pg = pg;
        }

        // First free chunk relinks the zone.
        (*z).n_free += 1;
        if (*z).n_free == 1 {
            (*z).next = guard.head;
            guard.head = z;
        }

        // Entirely free: unlink and recycle the whole zone.
        if (*z).n_free == (*z).n_max {
            let mut pz: *mut *mut Zone = &mut guard.head;
            while *pz != z {
                pz = &mut (**pz).next;
            }
            *pz = (*z).next;
            (*z).magic = 0;
            (*z).next = null_mut();
            drop(guard);
            zone_release(z);
        }
    }
}

/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
pub(crate) unsafe fn slab_realloc_inner(
    ptr: *mut u8,
    mut size: usize,
    tp: &mut ThrMags,
) -> Option<NonNull<u8>> {
    if ptr.is_null() {
        return slab_alloc_inner(size, 0, tp);
    }
    if size == 0 {
        size = 1;
    }

    // Safety: forwarded caller contract.
    match unsafe { big::big_realloc(ptr, size, tp) } {
        big::BigRealloc::Done(res) => return res,
        big::BigRealloc::NotBig => {}
    }

    let z = zone_of(ptr);
    // Safety: magic-checked zone header access; ptr stays live until the
    // copy below completes.
    unsafe {
        if (*z).magic != SLAB_MAGIC {
            mpanic!("realloc: bad pointer {ptr:p} (zone magic mismatch)");
        }

        // Same chunk size: nothing to move.
        if size < ZONE_LIMIT && (*z).chunk_size == classify(size).rounded {
            return NonNull::new(ptr);
        }

        let nptr = slab_alloc_inner(size, 0, tp)?;
        let copy = size.min((*z).chunk_size);
        ptr::copy_nonoverlapping(ptr, nptr.as_ptr(), copy);
        slab_free_inner(ptr, tp);
        Some(nptr)
    }
}

/// Usable bytes of the chunk or big allocation containing `ptr`.
///
/// # Safety
/// `ptr` must be null or point into a live allocation from this allocator.
pub(crate) unsafe fn slab_usable_size(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    // Safety: forwarded caller contract.
    if let Some(size) = unsafe { big::big_usable_size(ptr) } {
        return size;
    }

    let z = zone_of(ptr);
    // Safety: magic-checked zone header access.
    unsafe {
        if (*z).magic != SLAB_MAGIC {
            mpanic!("usable_size: bad pointer {ptr:p} (zone magic mismatch)");
        }
        let off = (ptr as usize) - (z as usize + (*z).base_off);
        (*z).chunk_size - off % (*z).chunk_size
    }
}

// ---------------------------------------------------------------------------
// Aligned allocation
// ---------------------------------------------------------------------------

/// Aligned allocation ladder.  Errors are libc codes for the API layer.
pub(crate) fn slab_memalign(
    mut alignment: usize,
    mut size: usize,
    tp: &mut ThrMags,
) -> Result<NonNull<u8>, i32> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(libc::EINVAL);
    }

    // Rounding size up to an alignment boundary improves the odds it is a
    // power of two and can ride the zone alignment rule directly.
    if size <= alignment {
        size = alignment;
    } else {
        size = (size + alignment - 1) & !(alignment - 1);
        if size == 0 {
            return Err(libc::ENOMEM);
        }
    }

    // Power-of-two chunks align to their own size.
    if size <= MAX_SLAB_PAGEALIGN && size.is_power_of_two() {
        return slab_alloc_inner(size, 0, tp).ok_or(libc::ENOMEM);
    }

    if size < PAGE_SIZE {
        let sc = classify(size);
        if sc.chunking >= alignment {
            return slab_alloc_inner(size, 0, tp).ok_or(libc::ENOMEM);
        }
        // Band chunking too weak (e.g. 513 bytes on a 256-byte alignment):
        // bump to the next power of two and let self-alignment do it.
        if size >= 1024 {
            alignment = 1024;
        }
        while alignment < size {
            alignment <<= 1;
        }
        return slab_alloc_inner(alignment, 0, tp).ok_or(libc::ENOMEM);
    }

    // Big path with page-or-stronger alignment.
    if alignment < PAGE_SIZE {
        alignment = PAGE_SIZE;
    }
    if size < alignment {
        size = alignment;
    }
    let size = round_to_pages(size);
    if size == 0 {
        return Err(libc::ENOMEM);
    }
    big::big_alloc_aligned(size, alignment, tp).ok_or(libc::ENOMEM)
}

// ---------------------------------------------------------------------------
// Entry points and fork plumbing
// ---------------------------------------------------------------------------

pub(crate) fn slab_alloc(size: usize, flags: u32) -> Option<NonNull<u8>> {
    with_thread_state(|tp| slab_alloc_inner(size, flags, tp))
}

/// # Safety
/// See [`slab_free_inner`].
pub(crate) unsafe fn slab_free(ptr: *mut u8) {
    with_thread_state(|tp| {
        // Safety: forwarded caller contract.
        unsafe { slab_free_inner(ptr, tp) }
    })
}

/// # Safety
/// See [`slab_realloc_inner`].
pub(crate) unsafe fn slab_realloc(ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    with_thread_state(|tp| {
        // Safety: forwarded caller contract.
        unsafe { slab_realloc_inner(ptr, size, tp) }
    })
}

pub(crate) fn slab_memalign_entry(alignment: usize, size: usize) -> Result<NonNull<u8>, i32> {
    with_thread_state(|tp| slab_memalign(alignment, size, tp))
}

/// Fork preparation: depot lock first, then the zone-magazine lock.  The two
/// are never nested during normal operation, so this order is the protocol.
pub(crate) fn fork_prepare() {
    DEPOTS.raw_lock();
    ZONE_MAG.raw_lock();
}

/// Release the locks taken by [`fork_prepare`], in reverse order.  Called in
/// both the parent and the child.
pub(crate) fn fork_release() {
    // Safety: fork_prepare acquired both locks.
    unsafe {
        ZONE_MAG.raw_unlock();
        DEPOTS.raw_unlock();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    #[test]
    fn test_roundtrip_basic() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = slab_alloc(24, 0).unwrap();
        // Safety: test code.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xAB, 24);
            assert_eq!(*p.as_ptr(), 0xAB);
            slab_free(p.as_ptr());
        }
    }

    #[test]
    fn test_magazine_lifo_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p1 = slab_alloc(24, 0).unwrap();
        let p2 = slab_alloc(24, 0).unwrap();
        assert_ne!(p1, p2);
        // Safety: test code.
        unsafe {
            slab_free(p1.as_ptr());
        }
        let p3 = slab_alloc(24, 0).unwrap();
        assert_eq!(p3, p1, "free chunk must be recycled LIFO via the magazine");
        // Safety: test code.
        unsafe {
            slab_free(p2.as_ptr());
            slab_free(p3.as_ptr());
        }
    }

    #[test]
    fn test_power_of_two_self_alignment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut held = Vec::new();
        let mut s = 1usize;
        while s <= MAX_SLAB_PAGEALIGN {
            let p = slab_alloc(s, 0).unwrap();
            assert_eq!(
                p.as_ptr() as usize % s,
                0,
                "allocation of {s} not aligned to {s}"
            );
            held.push(p);
            s <<= 1;
        }
        for p in held {
            // Safety: test code.
            unsafe { slab_free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_chunking_alignment_non_power_of_two() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut held = Vec::new();
        for s in [24usize, 100, 200, 300, 700, 1500, 3000, 5000, 10_000] {
            let sc = classify(s);
            let p = slab_alloc(s, 0).unwrap();
            assert_eq!(
                p.as_ptr() as usize % sc.chunking,
                0,
                "allocation of {s} not aligned to chunking {}",
                sc.chunking
            );
            held.push(p);
        }
        for p in held {
            // Safety: test code.
            unsafe { slab_free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_zero_flag_clears_recycled_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = slab_alloc(128, 0).unwrap();
        // Safety: test code.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xFF, 128);
            slab_free(p.as_ptr());
        }
        // Same class: the magazine hands the dirty chunk back; ZERO must
        // scrub it.
        let q = slab_alloc(128, AF_ZERO).unwrap();
        assert_eq!(q, p);
        // Safety: test code.
        unsafe {
            let bytes = std::slice::from_raw_parts(q.as_ptr(), 128);
            assert!(bytes.iter().all(|&b| b == 0), "ZERO allocation was dirty");
            slab_free(q.as_ptr());
        }
    }

    #[test]
    fn test_usable_size_within_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        for s in [1usize, 8, 24, 100, 513, 2049, 10_000] {
            let sc = classify(s);
            let p = slab_alloc(s, 0).unwrap();
            // Safety: test code.
            let usable = unsafe { slab_usable_size(p.as_ptr()) };
            assert!(usable >= s, "usable {usable} below request {s}");
            assert_eq!(usable, sc.rounded, "usable size must be the chunk size");
            if sc.rounded > 4 {
                // Interior pointers report the remainder of their chunk.
                // Safety: test code.
                let inner = unsafe { slab_usable_size(p.as_ptr().add(3)) };
                assert_eq!(inner, sc.rounded - 3);
            }
            // Safety: test code.
            unsafe { slab_free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_realloc_same_class_in_place() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = slab_alloc(33, 0).unwrap();
        // Safety: test code.
        unsafe {
            for i in 0..33 {
                *p.as_ptr().add(i) = i as u8;
            }
            // 33 and 48 share the class of rounded size 48.
            let q = slab_realloc(p.as_ptr(), 48).unwrap();
            assert_eq!(q, p, "same-class realloc must keep the pointer");
            for i in 0..33 {
                assert_eq!(*q.as_ptr().add(i), i as u8);
            }
            slab_free(q.as_ptr());
        }
    }

    #[test]
    fn test_realloc_cross_class_preserves_prefix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = slab_alloc(64, 0).unwrap();
        // Safety: test code.
        unsafe {
            for i in 0..64 {
                *p.as_ptr().add(i) = (i * 3) as u8;
            }
            let q = slab_realloc(p.as_ptr(), 4000).unwrap();
            for i in 0..64 {
                assert_eq!(*q.as_ptr().add(i), (i * 3) as u8, "byte {i} lost");
            }
            // Shrink back down; prefix again preserved.
            let r = slab_realloc(q.as_ptr(), 16).unwrap();
            for i in 0..16 {
                assert_eq!(*r.as_ptr().add(i), (i * 3) as u8);
            }
            slab_free(r.as_ptr());
        }
    }

    #[test]
    fn test_deep_churn_exercises_depot() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // More rounds than one magazine holds for class 0, forcing
        // loaded/prev swaps and depot cycling.
        let n = magazine_capacity(0) * 3;
        let mut ptrs = Vec::with_capacity(n);
        for _ in 0..n {
            ptrs.push(slab_alloc(8, 0).unwrap());
        }
        for p in &ptrs {
            // Safety: test code.
            unsafe { slab_free(p.as_ptr()) };
        }
        // And again: the depot now has magazines to cycle back in.
        for _ in 0..n {
            ptrs.push(slab_alloc(8, 0).unwrap());
        }
        for p in &ptrs[n..] {
            // Safety: test code.
            unsafe { slab_free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_memalign_ladder() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // (alignment, size) pairs covering each rung.
        for (align, size) in [
            (16usize, 100usize), // chunking already satisfies it
            (64, 33),            // size <= align promotion
            (256, 513),          // chunking too weak -> power-of-two bump
            (4096, 100),         // page-aligned slab chunk
            (4096, 100_000),     // big path
            (65536, 70_000),     // big path, stronger than page alignment
        ] {
            let p = slab_memalign_entry(align, size).unwrap();
            assert_eq!(
                p.as_ptr() as usize % align,
                0,
                "memalign({align}, {size}) misaligned"
            );
            // Safety: test code.
            unsafe {
                assert!(slab_usable_size(p.as_ptr()) >= size);
                slab_free(p.as_ptr());
            }
        }
    }

    #[test]
    fn test_memalign_rejects_non_power_of_two() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        assert_eq!(slab_memalign_entry(24, 100).unwrap_err(), libc::EINVAL);
        assert_eq!(slab_memalign_entry(0, 100).unwrap_err(), libc::EINVAL);
    }

    #[test]
    fn test_cross_thread_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Chunks allocated here, freed on another thread: they land in that
        // thread's magazines and drain through the depot on its exit.
        let ptrs: Vec<usize> = (0..256)
            .map(|_| slab_alloc(96, 0).unwrap().as_ptr() as usize)
            .collect();
        let h = thread::spawn(move || {
            for p in ptrs {
                // Safety: test code; pointers are live and owned by the test.
                unsafe { slab_free(p as *mut u8) };
            }
        });
        h.join().unwrap();
        // The engine stays coherent afterwards.
        let p = slab_alloc(96, 0).unwrap();
        // Safety: test code.
        unsafe { slab_free(p.as_ptr()) };
    }

    #[test]
    fn test_threaded_stress_disjoint_sets() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let n_threads = 4;
        let barrier = Arc::new(Barrier::new(n_threads));
        let mut handles = vec![];
        for t in 0..n_threads {
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let sizes = [8usize, 16, 96, 256, 1024, 4000, 8192, 16000];
                let mut held: Vec<(NonNull<u8>, usize)> = Vec::new();
                for i in 0..2000 {
                    let size = sizes[(i + t) % sizes.len()];
                    let p = slab_alloc(size, 0).unwrap();
                    // Safety: test code.
                    unsafe {
                        ptr::write_bytes(p.as_ptr(), t as u8 + 1, size);
                    }
                    held.push((p, size));
                    if i % 3 == 0 {
                        let (p, size) = held.swap_remove(i % held.len());
                        // Safety: test code.
                        unsafe {
                            let b = std::slice::from_raw_parts(p.as_ptr(), size);
                            assert!(
                                b.iter().all(|&x| x == t as u8 + 1),
                                "thread {t} saw foreign bytes"
                            );
                            slab_free(p.as_ptr());
                        }
                    }
                }
                for (p, _) in held {
                    // Safety: test code.
                    unsafe { slab_free(p.as_ptr()) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_thread_churn_recycles_zones() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // A worker fills and fully frees zones, then exits; its teardown
        // drains the magazines, the zones become fully free and return to
        // the zone magazine.  A second identical round must not map more
        // slab memory than the first left behind.
        let churn = || {
            thread::spawn(|| {
                let mut ptrs = Vec::new();
                for _ in 0..64 {
                    ptrs.push(slab_alloc(16_000, 0).unwrap());
                }
                for p in ptrs {
                    // Safety: test code.
                    unsafe { slab_free(p.as_ptr()) };
                }
            })
            .join()
            .unwrap();
        };
        churn();
        let mapped_after_first = stats::SLAB_MAPPED.get();
        churn();
        let mapped_after_second = stats::SLAB_MAPPED.get();
        assert!(
            mapped_after_second <= mapped_after_first,
            "second churn mapped new zones instead of recycling \
             ({mapped_after_first} -> {mapped_after_second})"
        );
    }

    #[test]
    fn test_zone_magazine_push_pop() {
        let mut mag = ZoneMagazine::new();
        assert!(mag.pop().is_none());
        let a = 0x10000 as *mut u8;
        let b = 0x20000 as *mut u8;
        mag.push(a);
        mag.push(b);
        assert_eq!(mag.pop(), Some(b));
        assert_eq!(mag.pop(), Some(a));
        assert_eq!(mag.pop(), None);
    }

    #[test]
    fn test_zone_magazine_capacity() {
        let mut mag = ZoneMagazine::new();
        for i in 0..M_ZONE_INIT_ROUNDS {
            assert!(!mag.is_full());
            mag.push(((i + 1) * ZONE_SIZE) as *mut u8);
        }
        assert!(mag.is_full());
    }

    #[test]
    fn test_fork_locks_roundtrip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        fork_prepare();
        fork_release();
        // The engine must be fully usable again.
        let p = slab_alloc(64, 0).unwrap();
        // Safety: test code.
        unsafe { slab_free(p.as_ptr()) };
    }
}
