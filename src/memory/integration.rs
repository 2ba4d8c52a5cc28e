#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::api::{calloc, free, malloc, posix_memalign, realloc, usable_size};
    use crate::memory::{big, stats};
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use std::ptr::null_mut;

    fn errno() -> i32 {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        // Safety: FFI; reads this thread's errno.
        unsafe {
            *libc::__errno_location()
        }
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        // Safety: FFI; reads this thread's errno.
        unsafe {
            *libc::__error()
        }
        #[cfg(any(target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
        // Safety: FFI; reads this thread's errno.
        unsafe {
            *libc::__errno()
        }
    }

    #[test]
    fn test_scenario_small_alloc_reuse_and_alignment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // malloc(24) rounds to 32 within a 16-byte-chunked class.
        let p1 = malloc(24);
        let p2 = malloc(24);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(p1 as usize % 16, 0);
        assert_eq!(p2 as usize % 16, 0);
        // Safety: test code.
        unsafe {
            free(p1);
        }
        let p3 = malloc(24);
        assert_eq!(p3, p1, "freed chunk must be the next served");
        // Safety: test code.
        unsafe {
            free(p2);
            free(p3);
        }
    }

    #[test]
    fn test_scenario_posix_memalign_4096() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut p: *mut u8 = null_mut();
        assert_eq!(posix_memalign(&mut p, 4096, 100), 0);
        assert_eq!(p as usize % 4096, 0);
        // Safety: test code.
        unsafe {
            assert!(usable_size(p) >= 100);
            free(p);
        }
    }

    #[test]
    fn test_scenario_big_realloc_preserves_megabyte() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = malloc(1_000_000);
        assert!(!p.is_null());
        // Safety: test code.
        unsafe {
            for i in (0..1_000_000).step_by(4099) {
                *p.add(i) = (i % 255) as u8;
            }
            let q = realloc(p, 1_100_000);
            assert!(!q.is_null());
            // Either grown in place or moved with the prefix intact.
            for i in (0..1_000_000).step_by(4099) {
                assert_eq!(*q.add(i), (i % 255) as u8, "byte {i} lost across realloc");
            }
            free(q);
        }
    }

    #[test]
    fn test_scenario_calloc_overflow_sets_enomem() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        assert!(calloc(1 << 40, 1 << 40).is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }

    #[test]
    fn test_scenario_malloc_zero_then_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = malloc(0);
        assert!(!p.is_null());
        // Safety: test code.
        unsafe { free(p) };
    }

    #[test]
    fn test_scenario_two_thread_mix_quiesces() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let excess_before = big::excess_bytes();
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for tid in 1u8..=2 {
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                // Deterministic pseudo-random sizes, disjoint per thread.
                let mut state = tid as usize * 0x9E37_79B9;
                for _ in 0..10_000 {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let size = 1 + (state >> 33) % 8192;
                    let p = malloc(size);
                    assert!(!p.is_null());
                    // Safety: test code.
                    unsafe {
                        std::ptr::write_bytes(p, tid, size);
                        let b = std::slice::from_raw_parts(p, size);
                        assert!(b.iter().all(|&x| x == tid), "thread {tid} saw torn memory");
                        free(p);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Sub-16KiB traffic never creates big records, so the excess pool is
        // exactly where it started.
        assert_eq!(
            big::excess_bytes(),
            excess_before,
            "small-allocation churn leaked into the big path"
        );
    }

    #[test]
    fn test_mixed_path_stress() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Interleave slab, page-aligned, and big traffic on one thread.
        let mut held: Vec<(*mut u8, usize)> = Vec::new();
        for i in 0..300usize {
            match i % 3 {
                0 => {
                    let s = 16 + (i * 7) % 2048;
                    let p = malloc(s);
                    assert!(!p.is_null());
                    held.push((p, s));
                }
                1 => {
                    let mut p = null_mut();
                    assert_eq!(posix_memalign(&mut p, 4096, 4096 * (1 + i % 3)), 0);
                    held.push((p, 4096));
                }
                _ => {
                    let s = 20_000 + i * 111;
                    let p = malloc(s);
                    assert!(!p.is_null());
                    held.push((p, s));
                }
            }
            // Safety: test code.
            unsafe {
                let (p, s) = held[held.len() / 2];
                std::ptr::write_bytes(p, 0xC3, s.min(64));
            }
            if i % 5 == 0 {
                let (p, _) = held.swap_remove(i % held.len());
                // Safety: test code.
                unsafe { free(p) };
            }
        }
        for (p, _) in held {
            // Safety: test code.
            unsafe { free(p) };
        }
    }

    #[test]
    fn test_stats_track_mapping_growth() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::snapshot();
        let p = malloc(3_000_000); // beyond the bigcache limit
        let after = stats::snapshot();
        assert!(
            after.big_mapped >= before.big_mapped + 3_000_000,
            "big mapping not reflected in gauges"
        );
        // Safety: test code.
        unsafe { free(p) };
        let end = stats::snapshot();
        assert!(
            end.big_mapped <= before.big_mapped + big::BIGCACHE_LIMIT,
            "big mapping not released after free"
        );
    }
}
