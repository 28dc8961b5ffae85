//! 映射
//!
//! [`Mapping`] 把一段页对齐的虚拟地址区间绑定到后备对象的某个偏移处，
//! 维护区间内各子区间的权限（[`ProtectionRangeSet`]），处理缺页，
//! 并保证硬件页表与逻辑状态一致。
//!
//! # 生命周期
//!
//! `NotReady`（已构造、未插入地址空间）→ `Alive`（已插入，唯一允许修改的状态）
//! → `Dead`（已移出、硬件映射已拆除、后备引用已释放，终态）。
//!
//! # 锁
//!
//! - 地址空间锁保护区域树以及映射的 `base`/`size`/`state`
//! - 对象锁保护 `object_offset`、保护区间集合与缓存的驻留页数
//!
//! `base`/`size`/`state` 只在同时持有两把锁时写入，因此持有任一把锁即可读到一致的值。

mod fault;
mod protect;

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use sync::{LockedBy, SpinLock};

use crate::address::{AlignOps, Vaddr, bytes_to_pages};
use crate::address_space::{AddressSpace, AspaceGuard};
use crate::arch::EnlargePolicy;
use crate::error::{VmError, VmResult};
use crate::flags::{MappingFlags, MmuFlags};
use crate::object::{BackingObject, CallOrigin, ObjectGuard};
use crate::protection::{ProtectionRangeSet, Walk};

/// 映射的唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(u64);

impl MappingId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        MappingId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// 映射状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// 已构造，尚未插入地址空间
    NotReady = 0,
    /// 已插入地址空间
    Alive = 1,
    /// 已销毁
    Dead = 2,
}

impl MappingState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MappingState::NotReady,
            1 => MappingState::Alive,
            _ => MappingState::Dead,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attribution {
    object_gen: u64,
    mapping_gen: u64,
    pages: usize,
}

/// 由对象锁保护的字段
#[derive(Debug)]
struct ObjectState {
    object_offset: usize,
    ranges: ProtectionRangeSet,
    /// 结构代数，`object_offset` 或 `size` 变化时递增
    generation: u64,
    attribution: Option<Attribution>,
}

/// 映射
pub struct Mapping {
    id: MappingId,
    aspace: Weak<AddressSpace>,
    flags: MappingFlags,
    base: AtomicUsize,
    size: AtomicUsize,
    state: AtomicU8,
    mergeable: AtomicBool,
    object: SpinLock<Option<Arc<dyn BackingObject>>>,
    locked: LockedBy<ObjectState>,
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.id)
            .field("base", &self.base())
            .field("size", &self.size())
            .field("state", &self.state())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Mapping {
    pub(crate) fn new(
        aspace: Weak<AddressSpace>,
        object: Arc<dyn BackingObject>,
        base: Vaddr,
        size: usize,
        object_offset: usize,
        ranges: ProtectionRangeSet,
        flags: MappingFlags,
    ) -> Self {
        let locked = LockedBy::new(
            object.object_lock(),
            ObjectState {
                object_offset,
                ranges,
                generation: 0,
                attribution: None,
            },
        );
        Self {
            id: MappingId::next(),
            aspace,
            flags,
            base: AtomicUsize::new(base.0),
            size: AtomicUsize::new(size),
            state: AtomicU8::new(MappingState::NotReady as u8),
            mergeable: AtomicBool::new(false),
            object: SpinLock::new(Some(object)),
            locked,
        }
    }

    /// 映射 id
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// 起始地址
    pub fn base(&self) -> Vaddr {
        Vaddr(self.base.load(Ordering::Acquire))
    }

    /// 长度（字节），销毁后为 0
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// 结束地址（不含）
    pub fn end(&self) -> Vaddr {
        self.base() + self.size()
    }

    /// 是否包含 `va`
    pub fn contains(&self, va: Vaddr) -> bool {
        va >= self.base() && va < self.end()
    }

    /// 生命周期状态
    pub fn state(&self) -> MappingState {
        MappingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 顶层标志
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    /// 是否可以与相邻映射合并
    pub fn is_mergeable(&self) -> bool {
        self.mergeable.load(Ordering::Acquire)
    }

    /// 后备对象；销毁后为 None
    pub fn object(&self) -> Option<Arc<dyn BackingObject>> {
        self.object.lock().clone()
    }

    fn set_state(&self, state: MappingState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 插入地址空间后调用
    pub(crate) fn mark_alive(&self) {
        debug_assert_eq!(self.state(), MappingState::NotReady);
        self.set_state(MappingState::Alive);
    }

    fn is_alive(&self) -> bool {
        self.state() == MappingState::Alive
    }

    fn set_range(&self, base: Vaddr, size: usize) {
        self.base.store(base.0, Ordering::Release);
        self.size.store(size, Ordering::Release);
    }

    fn aspace(&self) -> VmResult<Arc<AddressSpace>> {
        self.aspace.upgrade().ok_or(VmError::BadState)
    }

    fn live_object(&self) -> VmResult<Arc<dyn BackingObject>> {
        self.object().ok_or(VmError::BadState)
    }

    fn state_ref<'g>(&'g self, guard: &'g ObjectGuard<'_>) -> &'g ObjectState {
        self.locked.access(guard.raw())
    }

    fn state_mut<'g>(&'g self, guard: &'g mut ObjectGuard<'_>) -> &'g mut ObjectState {
        self.locked.access_mut(guard.raw_mut())
    }

    /// 检查 `[base, base + size)` 页对齐、非空且位于映射内，且映射处于 Alive
    fn check_window(&self, base: Vaddr, size: usize) -> VmResult<()> {
        if size == 0 || !base.is_page_aligned() || !Vaddr(size).is_page_aligned() {
            return Err(VmError::InvalidArgs);
        }
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        let end = base.0.checked_add(size).ok_or(VmError::OutOfRange)?;
        if base < self.base() || end > self.end().0 {
            return Err(VmError::OutOfRange);
        }
        Ok(())
    }

    /// 后备对象偏移；映射销毁后为 None
    pub fn object_offset(&self) -> Option<usize> {
        let aspace = self.aspace().ok()?;
        let tree = aspace.lock();
        let object = self.object()?;
        let guard = ObjectGuard::lock(&*object, &tree);
        Some(self.state_ref(&guard).object_offset)
    }

    /// `va` 处的权限；不在映射内或映射已销毁时为 None
    pub fn protection_at(&self, va: Vaddr) -> Option<MmuFlags> {
        let aspace = self.aspace().ok()?;
        let tree = aspace.lock();
        if !self.is_alive() || !self.contains(va) {
            return None;
        }
        let object = self.object()?;
        let guard = ObjectGuard::lock(&*object, &tree);
        Some(self.state_ref(&guard).ranges.flags_at(va))
    }

    /// 按地址顺序遍历 `[base, base + size)` 内的权限子区间
    pub fn enumerate_protection<F>(&self, base: Vaddr, size: usize, f: F) -> VmResult<()>
    where
        F: FnMut(Vaddr, usize, MmuFlags) -> VmResult<Walk>,
    {
        let aspace = self.aspace()?;
        let tree = aspace.lock();
        self.check_window(base, size)?;
        let object = self.live_object()?;
        let guard = ObjectGuard::lock(&*object, &tree);
        self.state_ref(&guard)
            .ranges
            .enumerate(self.base(), self.size(), base, size, f)
    }

    /// 映射范围内归属于后备对象的驻留页数
    ///
    /// 对象内容代数与映射结构代数都未变化时直接返回缓存值。
    pub fn allocated_pages(&self) -> usize {
        let Ok(aspace) = self.aspace() else {
            return 0;
        };
        let tree = aspace.lock();
        if !self.is_alive() {
            return 0;
        }
        let Some(object) = self.object() else {
            return 0;
        };
        let mut guard = ObjectGuard::lock(&*object, &tree);
        let object_gen = object.content_generation(&guard);

        let st = self.state_ref(&guard);
        if let Some(cached) = st.attribution
            && cached.object_gen == object_gen
            && cached.mapping_gen == st.generation
        {
            return cached.pages;
        }
        let (offset, mapping_gen) = (st.object_offset, st.generation);
        let pages = object.attributed_pages_in_range(&guard, offset, self.size());
        self.state_mut(&mut guard).attribution = Some(Attribution {
            object_gen,
            mapping_gen,
            pages,
        });
        pages
    }

    /// 允许与相邻映射合并，并立即尝试合并
    pub fn mark_mergeable(&self) {
        let Ok(aspace) = self.aspace() else {
            return;
        };
        let mut tree = aspace.lock();
        if !self.is_alive() {
            return;
        }
        self.mergeable.store(true, Ordering::Release);
        self.try_merge_neighbors(&aspace, &mut tree);
    }

    /// 销毁映射
    ///
    /// 常驻映射（[`MappingFlags::GUARDED`]）拒绝销毁。
    pub fn destroy(&self) -> VmResult<()> {
        let aspace = self.aspace()?;
        let mut tree = aspace.lock();
        if self.flags.contains(MappingFlags::GUARDED) {
            return Err(VmError::AccessDenied);
        }
        self.destroy_locked(&aspace, &mut tree)
    }

    /// 在持有地址空间锁时销毁，不检查 GUARDED
    pub(crate) fn destroy_locked(&self, aspace: &AddressSpace, tree: &mut AspaceGuard<'_>) -> VmResult<()> {
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        let object = self.live_object()?;
        let base = self.base();
        {
            let mut guard = ObjectGuard::lock(&*object, tree);
            let pages = bytes_to_pages(self.size());
            if let Err(err) = aspace.arch().unmap(base, pages, EnlargePolicy::Yes) {
                fatal("unmap", base, err);
            }
            let st = self.state_mut(&mut guard);
            st.ranges.clear();
            st.generation += 1;
            st.attribution = None;
            self.size.store(0, Ordering::Release);
            object.remove_mapping(&mut guard, self.id);
        }
        tree.remove(base);
        self.set_state(MappingState::Dead);
        *self.object.lock() = None;
        log::debug!("vm: destroyed mapping {:?} at {:#x}", self.id, base);
        Ok(())
    }

    /// 先把右邻并入自身，再把自身并入左邻
    pub(crate) fn try_merge_neighbors(&self, aspace: &AddressSpace, tree: &mut AspaceGuard<'_>) {
        if let Some(right) = tree.right_neighbor(self.base()).cloned() {
            merge_pair(self, &right, aspace, tree);
        }
        if let Some(left) = tree.left_neighbor(self.base()).cloned() {
            merge_pair(&left, self, aspace, tree);
        }
    }

    /// 对象回调：解除 `[offset, offset + len)`（对象偏移）在此映射中的硬件映射
    ///
    /// 只持有对象锁时调用。`origin` 是此映射自身的缺页时跳过，
    /// 由缺页路径在安装新页前处理旧的页表项。
    pub fn unmap_object_range(
        &self,
        guard: &ObjectGuard<'_>,
        offset: usize,
        len: usize,
        origin: CallOrigin,
    ) {
        if origin.is_fault_of(self.id) || !self.is_alive() {
            return;
        }
        let Some((va, size)) = self.object_window(guard, offset, len) else {
            return;
        };
        let Some(aspace) = self.aspace.upgrade() else {
            return;
        };
        if let Err(err) = aspace
            .arch()
            .unmap(va, bytes_to_pages(size), EnlargePolicy::Yes)
        {
            fatal("unmap", va, err);
        }
        log::trace!("vm: {:?} unmapped object range {:#x}+{:#x}", self.id, offset, len);
    }

    /// 对象回调：撤销 `[offset, offset + len)`（对象偏移）在此映射中的写权限
    ///
    /// 只持有对象锁时调用，用于脏页跟踪在写回后重新捕获写访问。
    pub fn remove_write_object_range(&self, guard: &ObjectGuard<'_>, offset: usize, len: usize) {
        if !self.is_alive() {
            return;
        }
        let Some((va, size)) = self.object_window(guard, offset, len) else {
            return;
        };
        let Some(aspace) = self.aspace.upgrade() else {
            return;
        };
        let arch = aspace.arch();
        for (region_base, region_len, flags) in self.state_ref(guard).ranges.regions(va, size) {
            if !flags.contains(MmuFlags::WRITE) {
                continue;
            }
            if let Err(err) = arch.protect(region_base, bytes_to_pages(region_len), flags.without_write()) {
                fatal("protect", region_base, err);
            }
        }
    }

    /// 对象偏移窗口与映射的交集，换算为虚拟地址区间
    fn object_window(&self, guard: &ObjectGuard<'_>, offset: usize, len: usize) -> Option<(Vaddr, usize)> {
        let st = self.state_ref(guard);
        let map_start = st.object_offset;
        let map_end = map_start + self.size();
        let start = Vaddr(offset.max(map_start)).align_down_to_page().0;
        let end = Vaddr(offset.saturating_add(len).min(map_end)).align_up_to_page().0;
        if start >= end {
            return None;
        }
        Some((self.base() + (start - map_start), end - start))
    }
}

/// 把 `right` 并入 `left`；条件不满足或预留失败时什么都不做
fn merge_pair(left: &Mapping, right: &Mapping, aspace: &AddressSpace, tree: &mut AspaceGuard<'_>) {
    if !left.is_alive() || !right.is_alive() || !left.is_mergeable() || !right.is_mergeable() {
        return;
    }
    if left.flags != right.flags || left.end() != right.base() {
        return;
    }
    let (Some(object), Some(other)) = (left.object(), right.object()) else {
        return;
    };
    if !core::ptr::addr_eq(Arc::as_ptr(&object), Arc::as_ptr(&other)) {
        return;
    }

    let seam = right.base();
    let right_size = right.size();
    {
        let mut guard = ObjectGuard::lock(&*object, tree);
        let left_st = left.state_ref(&guard);
        let right_st = right.state_ref(&guard);
        if left_st.object_offset + left.size() != right_st.object_offset {
            return;
        }
        if left_st.ranges.first_region_flags().cache_policy()
            != right_st.ranges.first_region_flags().cache_policy()
        {
            return;
        }

        let mut incoming = core::mem::take(&mut right.state_mut(&mut guard).ranges);
        if let Err(err) = left
            .state_mut(&mut guard)
            .ranges
            .merge_right(&mut incoming, seam, aspace.node_allocator())
        {
            log::debug!("vm: merge at {:#x} skipped: {}", seam, err);
            right.state_mut(&mut guard).ranges = incoming;
            return;
        }

        let left_st = left.state_mut(&mut guard);
        left.size.store(left.size() + right_size, Ordering::Release);
        left_st.generation += 1;

        let right_st = right.state_mut(&mut guard);
        right_st.generation += 1;
        right_st.attribution = None;
        right.size.store(0, Ordering::Release);
        object.remove_mapping(&mut guard, right.id);
    }
    tree.remove(seam);
    right.set_state(MappingState::Dead);
    *right.object.lock() = None;
    log::debug!(
        "vm: merged mapping {:?} into {:?} at {:#x}",
        right.id,
        left.id,
        seam
    );
}

/// 提交阶段的硬件操作失败：页表已部分修改，无法回滚
fn fatal(op: &str, va: Vaddr, err: VmError) -> ! {
    log::error!("vm: {} at {:#x} failed after commit: {}", op, va, err);
    panic!("vm: unrecoverable {} failure at {:#x}: {}", op, va.0, err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_ids_are_unique() {
        let a = MappingId::next();
        let b = MappingId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(MappingState::from_u8(0), MappingState::NotReady);
        assert_eq!(MappingState::from_u8(1), MappingState::Alive);
        assert_eq!(MappingState::from_u8(2), MappingState::Dead);
    }
}
