mod common;

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::*;
use test_support::mock::vm::{GRANULE_PAGES, MockObject, PAGE};
use vm::{FaultFlags, MAX_LOOKUP_PAGES, MmuFlags, PageRequest, Vaddr, VmError};

fn fault(m: &vm::Mapping, at: Vaddr, flags: FaultFlags) -> Result<(), VmError> {
    m.page_fault(at, flags, &mut PageRequest::new())
}

#[test]
fn test_read_fault_maps_lookahead() {
    let (arch, aspace) = space();
    let object = MockObject::new(32);
    let m = map(&aspace, &object, 0, 32, 0, R);

    fault(&m, va(0), FaultFlags::empty()).unwrap();
    assert_eq!(arch.map_calls(), 1);
    assert_eq!(arch.mapped_pages(), MAX_LOOKUP_PAGES);
    assert_eq!(arch.entry(va(0)), Some((object.page(0).unwrap(), R)));
    assert_eq!(object.lookups(), 1);
}

#[test]
fn test_fault_address_is_page_aligned() {
    let (arch, aspace) = space();
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, R);

    fault(&m, Vaddr(va(3).0 + 0x123), FaultFlags::empty()).unwrap();
    assert_eq!(arch.mapped_pages(), 1);
    assert!(arch.entry(va(3)).is_some());
}

#[test]
fn test_lookahead_stops_at_region_end() {
    let (arch, aspace) = space();
    let object = MockObject::new(8);
    let m = map(&aspace, &object, 0, 8, 0, R);
    m.protect(va(3), 5 * PAGE, RW).unwrap();

    fault(&m, va(0), FaultFlags::empty()).unwrap();
    assert_eq!(arch.mapped_pages(), 3);
    assert!(arch.entry(va(3)).is_none());
}

#[test]
fn test_lookahead_stops_at_page_table_boundary() {
    let (arch, aspace) = space();
    let object = MockObject::new(8);
    let m = map(&aspace, &object, GRANULE_PAGES - 2, 8, 0, R);

    fault(&m, va(GRANULE_PAGES - 2), FaultFlags::empty()).unwrap();
    assert_eq!(arch.mapped_pages(), 2);
    assert!(arch.entry(va(GRANULE_PAGES)).is_none());
}

#[test]
fn test_denied_fault_never_reaches_object() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);

    assert_eq!(fault(&m, va(0), FaultFlags::WRITE), Err(VmError::AccessDenied));
    assert_eq!(fault(&m, va(0), FaultFlags::INSTRUCTION), Err(VmError::AccessDenied));
    assert_eq!(fault(&m, va(0), FaultFlags::USER), Err(VmError::AccessDenied));
    assert_eq!(object.lookups(), 0);
    assert_eq!(arch.mapped_pages(), 0);

    let user = map(&aspace, &object, 4, 1, 0, R | MmuFlags::USER);
    fault(&user, va(4), FaultFlags::USER).unwrap();
    assert_eq!(object.lookups(), 1);
}

#[test]
fn test_fault_outside_or_after_destroy() {
    let (_arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);

    assert_eq!(fault(&m, va(2), FaultFlags::empty()), Err(VmError::OutOfRange));
    m.destroy().unwrap();
    assert_eq!(fault(&m, va(0), FaultFlags::empty()), Err(VmError::BadState));
}

#[test]
fn test_concurrent_faults_map_once() {
    let (arch, aspace) = space();
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, R);

    let barrier = Barrier::new(4);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                barrier.wait();
                fault(&m, va(0), FaultFlags::empty()).unwrap();
            });
        }
    });
    assert_eq!(arch.map_calls(), 1);
    assert_eq!(arch.mapped_pages(), 4);
    assert_eq!(arch.entry(va(0)), Some((object.page(0).unwrap(), R)));
}

#[test]
fn test_write_fault_breaks_copy_on_write() {
    let (arch, aspace) = space();
    let object = MockObject::new(1);
    let shared = object.insert_shared_page(0);
    let m = map(&aspace, &object, 0, 1, 0, RW);
    let other = map(&aspace, &object, 4, 1, 0, R);

    fault(&other, va(4), FaultFlags::empty()).unwrap();
    fault(&m, va(0), FaultFlags::empty()).unwrap();
    // 共享页只读映射
    assert_eq!(arch.entry(va(0)), Some((shared, R)));
    assert_eq!(arch.entry(va(4)), Some((shared, R)));

    fault(&m, va(0), FaultFlags::WRITE).unwrap();
    let private = object.page(0).unwrap();
    assert_ne!(private, shared);
    assert_eq!(arch.entry(va(0)), Some((private, RW)));
    // 其他映射中的旧页被解除
    assert!(arch.entry(va(4)).is_none());

    fault(&other, va(4), FaultFlags::empty()).unwrap();
    assert_eq!(arch.entry(va(4)), Some((private, R)));
}

#[test]
fn test_write_fault_replaces_every_stale_lookahead_entry() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let shared0 = object.insert_shared_page(0);
    let shared1 = object.insert_shared_page(1);
    let m = map(&aspace, &object, 0, 2, 0, RW);

    fault(&m, va(0), FaultFlags::empty()).unwrap();
    assert_eq!(arch.entry(va(0)), Some((shared0, R)));
    assert_eq!(arch.entry(va(1)), Some((shared1, R)));

    fault(&m, va(0), FaultFlags::WRITE).unwrap();
    let private0 = object.page(0).unwrap();
    let private1 = object.page(1).unwrap();
    assert_ne!(private1, shared1);
    assert_eq!(arch.entry(va(0)), Some((private0, RW)));
    assert_eq!(arch.entry(va(1)), Some((private1, RW)));
}

#[test]
fn test_stale_entry_behind_unmapped_first_page_is_replaced() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    object.insert_shared_page(0);
    let shared1 = object.insert_shared_page(1);
    let m = map(&aspace, &object, 0, 2, 0, RW);

    fault(&m, va(0), FaultFlags::empty()).unwrap();
    object.evict(0);
    assert!(arch.entry(va(0)).is_none());
    assert_eq!(arch.entry(va(1)), Some((shared1, R)));

    fault(&m, va(0), FaultFlags::WRITE).unwrap();
    assert_eq!(arch.entry(va(0)).unwrap().0, object.page(0).unwrap());
    assert_eq!(arch.entry(va(1)).unwrap().0, object.page(1).unwrap());
    assert_ne!(object.page(1).unwrap(), shared1);
}

#[test]
fn test_dirty_tracked_write_fault() {
    let (arch, aspace) = space();
    let object = MockObject::dirty_tracked(4);
    let m = map(&aspace, &object, 0, 4, 0, RW);

    fault(&m, va(2), FaultFlags::WRITE).unwrap();
    assert_eq!(arch.mapped_pages(), 1);
    assert_eq!(arch.entry(va(2)).unwrap().1, RW);
    assert!(object.is_dirty(2));

    // 干净页以只读映射，首次写时再次缺页
    fault(&m, va(0), FaultFlags::empty()).unwrap();
    assert_eq!(arch.entry(va(0)).unwrap().1, R);
    assert_eq!(arch.entry(va(1)).unwrap().1, R);

    fault(&m, va(1), FaultFlags::WRITE).unwrap();
    assert_eq!(arch.entry(va(1)).unwrap().1, RW);
    assert!(object.is_dirty(1));
    assert!(!object.is_dirty(0));

    object.clean(1);
    assert_eq!(arch.entry(va(1)).unwrap().1, R);
    assert!(!object.is_dirty(1));
}

#[test]
fn test_clean_and_write_fault_keep_dirty_in_step() {
    let (arch, aspace) = space();
    let object = MockObject::dirty_tracked(1);
    let m = map(&aspace, &object, 0, 1, 0, RW);
    fault(&m, va(0), FaultFlags::WRITE).unwrap();

    // 交替执行时每一步后都一致
    for _ in 0..16 {
        object.clean(0);
        assert_eq!(object.dirty_and_writable(0, &arch, va(0)), (false, false));
        fault(&m, va(0), FaultFlags::WRITE).unwrap();
        assert_eq!(object.dirty_and_writable(0, &arch, va(0)), (true, true));
    }

    const ROUNDS: usize = 8;
    const ITERATIONS: usize = 200;
    for _ in 0..ROUNDS {
        let barrier = Barrier::new(3);
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..ITERATIONS {
                    object.clean(0);
                }
            });
            let writer = s.spawn(|| {
                barrier.wait();
                for _ in 0..ITERATIONS {
                    fault(&m, va(0), FaultFlags::WRITE).unwrap();
                }
            });
            s.spawn(|| {
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    let (dirty, writable) = object.dirty_and_writable(0, &arch, va(0));
                    assert_eq!(dirty, writable);
                }
            });
            writer.join().unwrap();
            done.store(true, Ordering::Release);
        });
        let (dirty, writable) = object.dirty_and_writable(0, &arch, va(0));
        assert_eq!(dirty, writable);
        assert!(arch.entry(va(0)).is_some());
    }
}

#[test]
fn test_evicted_page_is_refaulted() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, RW);
    fault(&m, va(0), FaultFlags::empty()).unwrap();
    let before = object.page(0).unwrap();

    object.evict(0);
    assert!(arch.entry(va(0)).is_none());
    assert!(arch.entry(va(1)).is_some());

    fault(&m, va(0), FaultFlags::empty()).unwrap();
    let after = object.page(0).unwrap();
    assert_ne!(before, after);
    assert_eq!(arch.entry(va(0)).unwrap().0, after);
}

#[test]
fn test_fault_waits_for_page() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);
    let waiter = object.defer_next_lookup();

    let mut request = PageRequest::new();
    m.page_fault(va(0), FaultFlags::empty(), &mut request).unwrap();
    assert_eq!(waiter.waits(), 1);
    assert_eq!(object.lookups(), 2);
    assert!(!request.is_armed());
    assert!(arch.entry(va(0)).is_some());
}

#[test]
fn test_failed_wait_is_returned() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);
    let waiter = object.defer_next_lookup();
    waiter.fail();

    assert_eq!(fault(&m, va(0), FaultFlags::empty()), Err(VmError::NotFound));
    assert_eq!(waiter.waits(), 1);
    assert_eq!(arch.mapped_pages(), 0);
}

#[test]
fn test_guest_fault_syncs_cache() {
    let (arch, aspace) = space();
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, RX);

    fault(&m, va(0), FaultFlags::GUEST).unwrap();
    assert_eq!(arch.synced(), 4);

    fault(&m, va(1), FaultFlags::INSTRUCTION).unwrap();
    assert_eq!(arch.synced(), 4);
}

#[test]
fn test_address_space_fault_dispatch() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    map(&aspace, &object, 4, 2, 0, R);

    assert_eq!(aspace.page_fault(va(0), FaultFlags::empty()), Err(VmError::NotFound));
    aspace.page_fault(va(5), FaultFlags::empty()).unwrap();
    assert!(arch.entry(va(5)).is_some());
}

#[test]
fn test_fault_map_error_is_returned() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);

    arch.fail_next_map(VmError::BadState);
    assert_eq!(fault(&m, va(0), FaultFlags::empty()), Err(VmError::BadState));
    fault(&m, va(0), FaultFlags::empty()).unwrap();
    assert_eq!(arch.mapped_pages(), 2);
}

#[test]
#[should_panic(expected = "unrecoverable map failure")]
fn test_fault_without_page_table_memory_is_fatal() {
    let (arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);

    arch.fail_next_map(VmError::NoMemory);
    let _ = fault(&m, va(0), FaultFlags::empty());
}
