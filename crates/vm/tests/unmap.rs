mod common;

use std::sync::Arc;

use common::*;
use test_support::mock::vm::{ArchCall, FailingNodes, MockArch, MockObject, PAGE};
use vm::{AddressSpace, FaultFlags, MappingFlags, MappingState, PageRequest, Vaddr, VmError};

#[test]
fn test_unmap_whole_mapping_destroys_it() {
    let (arch, aspace) = space();
    let object = MockObject::new(3);
    let m = map(&aspace, &object, 0, 3, 0, RW);
    m.page_fault(va(0), FaultFlags::empty(), &mut PageRequest::new())
        .unwrap();
    assert_eq!(object.mapping_ids(), vec![m.id()]);

    m.unmap(va(0), 3 * PAGE).unwrap();
    assert_eq!(m.state(), MappingState::Dead);
    assert!(m.object().is_none());
    assert!(object.mapping_ids().is_empty());
    assert_eq!(aspace.mapping_count(), 0);
    assert_eq!(arch.mapped_pages(), 0);
    assert_eq!(m.unmap(va(0), PAGE), Err(VmError::BadState));
}

#[test]
fn test_unmap_front() {
    let (arch, aspace) = space();
    let object = MockObject::new(3);
    let m = map(&aspace, &object, 0, 3, 0, RW);
    m.page_fault(va(0), FaultFlags::empty(), &mut PageRequest::new())
        .unwrap();

    m.unmap(va(0), PAGE).unwrap();
    assert_eq!(m.base(), va(1));
    assert_eq!(m.size(), 2 * PAGE);
    assert_eq!(m.object_offset(), Some(PAGE));
    assert!(aspace.find(va(0)).is_none());
    assert!(Arc::ptr_eq(&aspace.find(va(1)).unwrap(), &m));
    assert!(arch.entry(va(0)).is_none());
    assert!(arch.entry(va(1)).is_some());
}

#[test]
fn test_unmap_back() {
    let (arch, aspace) = space();
    let object = MockObject::new(3);
    let m = map(&aspace, &object, 0, 3, 0, RW);
    m.page_fault(va(0), FaultFlags::empty(), &mut PageRequest::new())
        .unwrap();

    m.unmap(va(2), PAGE).unwrap();
    assert_eq!(m.base(), va(0));
    assert_eq!(m.size(), 2 * PAGE);
    assert_eq!(m.object_offset(), Some(0));
    assert!(aspace.find(va(2)).is_none());
    assert!(arch.entry(va(1)).is_some());
    assert!(arch.entry(va(2)).is_none());
}

#[test]
fn test_unmap_front_keeps_protection() {
    let (_arch, aspace) = space();
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, R);
    m.protect(va(1), PAGE, RW).unwrap();
    m.protect(va(2), PAGE, RX).unwrap();

    m.unmap(va(0), 2 * PAGE).unwrap();
    assert_eq!(regions(&m), vec![(2, 1, RX), (3, 1, R)]);
}

#[test]
fn test_unmap_interior_splits() {
    let (arch, aspace) = space();
    let object = MockObject::new(3);
    let m = map(&aspace, &object, 0, 3, 0, RW);
    m.page_fault(va(0), FaultFlags::empty(), &mut PageRequest::new())
        .unwrap();
    assert_eq!(arch.mapped_pages(), 3);

    arch.clear_calls();
    m.unmap(va(1), PAGE).unwrap();
    assert_eq!(arch.calls(), vec![ArchCall::Unmap(va(1), 1)]);

    assert_eq!((m.base(), m.size()), (va(0), PAGE));
    let right = aspace.find(va(2)).unwrap();
    assert!(!Arc::ptr_eq(&right, &m));
    assert_eq!((right.base(), right.size()), (va(2), PAGE));
    assert_eq!(right.object_offset(), Some(2 * PAGE));
    assert_eq!(right.state(), MappingState::Alive);
    assert_eq!(right.flags(), m.flags());
    assert!(right.is_mergeable());

    assert_eq!(aspace.mapping_count(), 2);
    assert_eq!(object.mapping_ids().len(), 2);
    assert!(arch.entry(va(0)).is_some());
    assert!(arch.entry(va(1)).is_none());
    assert!(arch.entry(va(2)).is_some());
}

#[test]
fn test_split_right_part_merges_with_next_mapping() {
    let (_arch, aspace) = space();
    let object = MockObject::new(6);
    let m = map(&aspace, &object, 0, 4, 0, RW);
    let next = map(&aspace, &object, 4, 2, 4, RW);
    next.mark_mergeable();
    assert_eq!(aspace.mapping_count(), 2);

    m.unmap(va(1), PAGE).unwrap();
    assert_eq!(aspace.mapping_count(), 2);
    assert_eq!((m.base(), m.size()), (va(0), PAGE));
    let right = aspace.find(va(2)).unwrap();
    assert_eq!((right.base(), right.size()), (va(2), 4 * PAGE));
    assert_eq!(right.object_offset(), Some(2 * PAGE));
    assert!(Arc::ptr_eq(&aspace.find(va(5)).unwrap(), &right));
    assert_eq!(next.state(), MappingState::Dead);
    assert_eq!(object.mapping_ids().len(), 2);
}

#[test]
fn test_split_preserves_per_page_protection() {
    let (_arch, aspace) = space();
    let object = MockObject::new(5);
    let m = map(&aspace, &object, 0, 5, 0, R);
    m.protect(va(1), PAGE, RW).unwrap();
    m.protect(va(3), PAGE, RX).unwrap();

    m.unmap(va(2), PAGE).unwrap();
    let right = aspace.find(va(3)).unwrap();
    assert_eq!(regions(&m), vec![(0, 1, R), (1, 1, RW)]);
    assert_eq!(regions(&right), vec![(3, 1, RX), (4, 1, R)]);
}

#[test]
fn test_split_then_merge_restores_mapping() {
    let (_arch, aspace) = space();
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, RW);
    m.protect(va(1), PAGE, R).unwrap();
    m.mark_mergeable();
    let original = regions(&m);

    m.unmap(va(2), PAGE).unwrap();
    let right = aspace.find(va(3)).unwrap();
    assert_eq!(aspace.mapping_count(), 2);

    let middle = map(&aspace, &object, 2, 1, 2, RW);
    middle.mark_mergeable();

    assert_eq!(aspace.mapping_count(), 1);
    assert_eq!((m.base(), m.size()), (va(0), 4 * PAGE));
    assert_eq!(m.object_offset(), Some(0));
    assert_eq!(regions(&m), original);
    assert_eq!(middle.state(), MappingState::Dead);
    assert_eq!(right.state(), MappingState::Dead);
    assert_eq!(object.mapping_ids(), vec![m.id()]);
}

#[test]
fn test_merge_requires_matching_mappings() {
    let (_arch, aspace) = space();
    let object = MockObject::new(8);
    let other = MockObject::new(8);

    // 对象偏移不连续
    let a = map(&aspace, &object, 0, 1, 0, RW);
    let b = map(&aspace, &object, 1, 1, 5, RW);
    // 不同的对象
    let c = map(&aspace, &other, 2, 1, 2, RW);
    // 不同的映射标志
    let d = map_with(&aspace, &object, 3, 1, 3, RW, MappingFlags::CAN_READ | MappingFlags::CAN_WRITE);
    for m in [&a, &b, &c, &d] {
        m.mark_mergeable();
    }
    assert_eq!(aspace.mapping_count(), 4);

    // 未标记可合并的映射不参与
    let e = map(&aspace, &object, 4, 1, 4, RW);
    let f = map(&aspace, &object, 5, 1, 5, RW);
    f.mark_mergeable();
    assert_eq!(e.state(), MappingState::Alive);
    assert_eq!(aspace.mapping_count(), 6);
}

#[test]
fn test_merge_without_memory_keeps_both() {
    test_support::setup();
    let arch = MockArch::new();
    let nodes = FailingNodes::new(1);
    let aspace = AddressSpace::with_node_allocator(arch.clone(), Vaddr(BASE), SPACE_SIZE, nodes.clone());
    let object = MockObject::new(2);
    let left = map(&aspace, &object, 0, 1, 0, RW);
    let right = map(&aspace, &object, 1, 1, 1, R);
    left.mark_mergeable();
    right.mark_mergeable();

    assert_eq!(nodes.calls(), 1);
    assert_eq!(aspace.mapping_count(), 2);
    assert_eq!(regions(&left), vec![(0, 1, RW)]);
    assert_eq!(regions(&right), vec![(1, 1, R)]);

    // 再次尝试时成功
    right.mark_mergeable();
    assert_eq!(aspace.mapping_count(), 1);
    assert_eq!(regions(&left), vec![(0, 1, RW), (1, 1, R)]);
}

#[test]
fn test_split_without_memory_changes_nothing() {
    test_support::setup();
    let arch = MockArch::new();
    let nodes = FailingNodes::new(0);
    let aspace = AddressSpace::with_node_allocator(arch.clone(), Vaddr(BASE), SPACE_SIZE, nodes.clone());
    let object = MockObject::new(4);
    let m = map(&aspace, &object, 0, 4, 0, RW);
    m.protect(va(3), PAGE, RX).unwrap();
    m.page_fault(va(0), FaultFlags::empty(), &mut PageRequest::new())
        .unwrap();

    arch.clear_calls();
    nodes.fail_after(1);
    assert_eq!(m.unmap(va(1), PAGE), Err(VmError::NoMemory));
    assert!(arch.calls().is_empty());
    assert_eq!((m.base(), m.size()), (va(0), 4 * PAGE));
    assert_eq!(regions(&m), vec![(0, 3, RW), (3, 1, RX)]);
    assert_eq!(aspace.mapping_count(), 1);
    assert!(arch.entry(va(1)).is_some());
}

#[test]
fn test_unmap_guarded_mapping() {
    let (_arch, aspace) = space();
    let object = MockObject::new(3);
    let m = map_with(&aspace, &object, 0, 3, 0, R, MappingFlags::RWX | MappingFlags::GUARDED);

    assert_eq!(m.unmap(va(0), 3 * PAGE), Err(VmError::AccessDenied));
    assert_eq!(m.unmap(va(1), PAGE), Err(VmError::AccessDenied));
    assert_eq!(m.unmap(va(0), PAGE), Err(VmError::AccessDenied));
    assert_eq!(m.destroy(), Err(VmError::AccessDenied));
    assert_eq!(m.state(), MappingState::Alive);
    assert_eq!(m.size(), 3 * PAGE);
}

#[test]
fn test_unmap_rejects_bad_window() {
    let (_arch, aspace) = space();
    let object = MockObject::new(2);
    let m = map(&aspace, &object, 0, 2, 0, R);

    assert_eq!(m.unmap(Vaddr(va(0).0 + 8), PAGE), Err(VmError::InvalidArgs));
    assert_eq!(m.unmap(va(0), 0), Err(VmError::InvalidArgs));
    assert_eq!(m.unmap(va(1), 2 * PAGE), Err(VmError::OutOfRange));
    assert_eq!(m.size(), 2 * PAGE);
}
