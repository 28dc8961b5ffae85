//! 地址空间
//!
//! [`AddressSpace`] 持有架构页表、映射树和地址空间锁。映射的位置由调用者决定，
//! 这里只检查边界与重叠。

mod region_tree;

pub use region_tree::RegionTree;

use alloc::sync::Arc;
use alloc::vec::Vec;

use sync::{SpinLock, SpinLockGuard};

use crate::address::{AlignOps, Vaddr, is_page_aligned};
use crate::arch::ArchAddressSpace;
use crate::error::{VmError, VmResult};
use crate::flags::{FaultFlags, MappingFlags, MmuFlags};
use crate::mapping::{Mapping, MappingState};
use crate::object::{BackingObject, MappingRef, ObjectGuard, PageRequest};
use crate::protection::{HeapNodes, NodeAllocator, ProtectionRangeSet};

/// 地址空间锁的保护器
///
/// 获取对象锁（[`ObjectGuard::lock`]）时需要出示它。
pub type AspaceGuard<'a> = SpinLockGuard<'a, RegionTree>;

/// 地址空间
pub struct AddressSpace {
    arch: Arc<dyn ArchAddressSpace>,
    base: Vaddr,
    size: usize,
    nodes: Arc<dyn NodeAllocator>,
    regions: SpinLock<RegionTree>,
}

impl AddressSpace {
    /// 创建覆盖 `[base, base + size)` 的地址空间
    pub fn new(arch: Arc<dyn ArchAddressSpace>, base: Vaddr, size: usize) -> Arc<Self> {
        Self::with_node_allocator(arch, base, size, Arc::new(HeapNodes))
    }

    /// 使用指定的断点分配器创建地址空间
    pub fn with_node_allocator(
        arch: Arc<dyn ArchAddressSpace>,
        base: Vaddr,
        size: usize,
        nodes: Arc<dyn NodeAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            arch,
            base,
            size,
            nodes,
            regions: SpinLock::new(RegionTree::new()),
        })
    }

    /// 获取地址空间锁
    pub fn lock(&self) -> AspaceGuard<'_> {
        self.regions.lock()
    }

    /// 架构页表
    pub fn arch(&self) -> &dyn ArchAddressSpace {
        &*self.arch
    }

    pub(crate) fn node_allocator(&self) -> &dyn NodeAllocator {
        &*self.nodes
    }

    /// 起始地址
    pub fn base(&self) -> Vaddr {
        self.base
    }

    /// 长度
    pub fn size(&self) -> usize {
        self.size
    }

    /// 在 `base` 处创建映射 `object` 的 `[object_offset, object_offset + size)` 的映射
    ///
    /// 新映射处于 Alive 但不可合并，需要时由调用者 [`Mapping::mark_mergeable`]。
    ///
    /// # Errors
    /// - [`VmError::InvalidArgs`]：未对齐、长度为零，或缓存属性与对象不一致
    /// - [`VmError::AccessDenied`]：权限组合无效或超出 `flags` 的上限
    /// - [`VmError::OutOfRange`]：超出地址空间或对象大小
    /// - [`VmError::AlreadyExists`]：与已有映射重叠
    pub fn create_mapping(
        self: &Arc<Self>,
        base: Vaddr,
        size: usize,
        object: Arc<dyn BackingObject>,
        object_offset: usize,
        mmu_flags: MmuFlags,
        flags: MappingFlags,
    ) -> VmResult<Arc<Mapping>> {
        if size == 0 || !base.is_page_aligned() || !is_page_aligned(size) || !is_page_aligned(object_offset) {
            return Err(VmError::InvalidArgs);
        }
        if mmu_flags.cache_policy() != object.cache_policy() {
            return Err(VmError::InvalidArgs);
        }
        if !mmu_flags.is_valid_combination() || !flags.permits(mmu_flags) {
            return Err(VmError::AccessDenied);
        }
        let end = base.0.checked_add(size).ok_or(VmError::OutOfRange)?;
        if base < self.base || end > (self.base + self.size).0 {
            return Err(VmError::OutOfRange);
        }
        if object_offset.checked_add(size).is_none_or(|e| e > object.size()) {
            return Err(VmError::OutOfRange);
        }

        let mut tree = self.lock();
        if tree.overlaps(base, size) {
            return Err(VmError::AlreadyExists);
        }
        let mapping = Arc::new(Mapping::new(
            Arc::downgrade(self),
            object.clone(),
            base,
            size,
            object_offset,
            ProtectionRangeSet::new(mmu_flags),
            flags,
        ));
        {
            let mut guard = ObjectGuard::lock(&*object, &tree);
            object.add_mapping(&mut guard, MappingRef::new(&mapping));
            tree.insert(mapping.clone());
            mapping.mark_alive();
        }
        log::debug!(
            "vm: created mapping {:?} at {:#x}+{:#x} offset {:#x} {:?}",
            mapping.id(),
            base,
            size,
            object_offset,
            mmu_flags
        );
        Ok(mapping)
    }

    /// 包含 `va` 的映射
    pub fn find(&self, va: Vaddr) -> Option<Arc<Mapping>> {
        self.lock().find(va).cloned()
    }

    /// 映射数量
    pub fn mapping_count(&self) -> usize {
        self.lock().len()
    }

    /// 处理 `va` 处的缺页
    ///
    /// # Errors
    /// `va` 不在任何映射内时返回 [`VmError::NotFound`]，其余同 [`Mapping::page_fault`]
    pub fn page_fault(&self, va: Vaddr, flags: FaultFlags) -> VmResult<()> {
        let mapping = self.find(va).ok_or(VmError::NotFound)?;
        let mut request = PageRequest::new();
        mapping.page_fault(va, flags, &mut request)
    }

    /// 销毁所有映射（包括常驻映射）
    pub fn destroy(&self) {
        let mut tree = self.lock();
        let all: Vec<Arc<Mapping>> = tree.iter().cloned().collect();
        for mapping in all {
            if mapping.state() != MappingState::Alive {
                continue;
            }
            if let Err(err) = mapping.destroy_locked(self, &mut tree) {
                log::warn!("vm: destroying {:?} failed: {}", mapping.id(), err);
            }
        }
        debug_assert!(tree.is_empty());
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
