//! 集成测试共用的地址空间与映射构造
#![allow(dead_code)]

use std::sync::Arc;

use test_support::mock::vm::{MockArch, MockObject, PAGE};
use vm::{AddressSpace, Mapping, MappingFlags, MmuFlags, Vaddr, Walk};

pub const BASE: usize = 0x4000_0000;
pub const SPACE_SIZE: usize = 0x1000_0000;

pub const R: MmuFlags = MmuFlags::READ;
pub const RW: MmuFlags = MmuFlags::READ.union(MmuFlags::WRITE);
pub const RX: MmuFlags = MmuFlags::READ.union(MmuFlags::EXECUTE);

/// 地址空间中第 `page` 页的地址
pub fn va(page: usize) -> Vaddr {
    Vaddr(BASE + page * PAGE)
}

pub fn space() -> (Arc<MockArch>, Arc<AddressSpace>) {
    test_support::setup();
    let arch = MockArch::new();
    let aspace = AddressSpace::new(arch.clone(), Vaddr(BASE), SPACE_SIZE);
    (arch, aspace)
}

/// 在第 `page` 页处映射对象从第 `offset_page` 页开始的 `pages` 页
pub fn map(
    aspace: &Arc<AddressSpace>,
    object: &Arc<MockObject>,
    page: usize,
    pages: usize,
    offset_page: usize,
    flags: MmuFlags,
) -> Arc<Mapping> {
    map_with(aspace, object, page, pages, offset_page, flags, MappingFlags::RWX)
}

pub fn map_with(
    aspace: &Arc<AddressSpace>,
    object: &Arc<MockObject>,
    page: usize,
    pages: usize,
    offset_page: usize,
    flags: MmuFlags,
    mapping_flags: MappingFlags,
) -> Arc<Mapping> {
    aspace
        .create_mapping(
            va(page),
            pages * PAGE,
            object.clone(),
            offset_page * PAGE,
            flags,
            mapping_flags,
        )
        .unwrap()
}

/// 以 (起始页, 页数, 权限) 列出映射的权限子区间
pub fn regions(mapping: &Mapping) -> Vec<(usize, usize, MmuFlags)> {
    let mut out = Vec::new();
    mapping
        .enumerate_protection(mapping.base(), mapping.size(), |base, len, flags| {
            out.push(((base - Vaddr(BASE)) / PAGE, len / PAGE, flags));
            Ok(Walk::Continue)
        })
        .unwrap();
    out
}
