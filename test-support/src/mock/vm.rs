//! 虚拟内存相关的 Mock 实现
//!
//! - [`MockArch`]：软件页表，记录每次硬件调用，可注入一次性失败
//! - [`MockObject`]：内存中的后备对象，支持写时复制页、脏页跟踪、延迟供页
//! - [`FailingNodes`]：第 N 次预留时失败的断点分配器

use alloc::boxed::Box;
use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sync::{LockedBy, RawSpinLock, SpinLock};
use vm::{
    ArchAddressSpace, BackingObject, Breakpoint, CachePolicy, CallOrigin, DirtyAction, EnlargePolicy,
    ExistingEntryAction, FaultFlags, HeapNodes, LookupInfo, MAX_LOOKUP_PAGES, MappingId, MappingRef, MmuFlags,
    NodeAllocator, ObjectGuard, Paddr, PageRequest, PageWaiter, Vaddr, VmError, VmResult,
};

/// 测试使用的页大小
pub const PAGE: usize = 4096;

/// 末级页表覆盖的页数
pub const GRANULE_PAGES: usize = 512;

/// 一次硬件调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchCall {
    /// map(base, count, flags)
    Map(Vaddr, usize, MmuFlags),
    /// protect(base, count, flags)
    Protect(Vaddr, usize, MmuFlags),
    /// unmap(base, count)
    Unmap(Vaddr, usize),
}

/// 软件页表
pub struct MockArch {
    entries: SpinLock<BTreeMap<usize, (Paddr, MmuFlags)>>,
    calls: SpinLock<Vec<ArchCall>>,
    fail_next_map: SpinLock<Option<VmError>>,
    synced: AtomicUsize,
}

impl MockArch {
    /// 创建空页表
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: SpinLock::new(BTreeMap::new()),
            calls: SpinLock::new(Vec::new()),
            fail_next_map: SpinLock::new(None),
            synced: AtomicUsize::new(0),
        })
    }

    /// `va` 处的页表项
    pub fn entry(&self, va: Vaddr) -> Option<(Paddr, MmuFlags)> {
        self.entries.lock().get(&va.0).copied()
    }

    /// 已映射的页数
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    /// 调用记录
    pub fn calls(&self) -> Vec<ArchCall> {
        self.calls.lock().clone()
    }

    /// map 调用次数
    pub fn map_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ArchCall::Map(..)))
            .count()
    }

    /// 清空调用记录
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// 下一次 map 返回 `err`
    pub fn fail_next_map(&self, err: VmError) {
        *self.fail_next_map.lock() = Some(err);
    }

    /// sync_cache 调用次数
    pub fn synced(&self) -> usize {
        self.synced.load(Ordering::SeqCst)
    }
}

impl ArchAddressSpace for MockArch {
    fn map(
        &self,
        base: Vaddr,
        pages: &[Paddr],
        flags: MmuFlags,
        existing: ExistingEntryAction,
    ) -> VmResult<usize> {
        self.calls.lock().push(ArchCall::Map(base, pages.len(), flags));
        if let Some(err) = self.fail_next_map.lock().take() {
            return Err(err);
        }
        let mut entries = self.entries.lock();
        if existing == ExistingEntryAction::Error
            && (0..pages.len()).any(|i| entries.contains_key(&(base.0 + i * PAGE)))
        {
            return Err(VmError::AlreadyExists);
        }
        let mut mapped = 0;
        for (i, &pa) in pages.iter().enumerate() {
            let va = base.0 + i * PAGE;
            if existing == ExistingEntryAction::Skip && entries.contains_key(&va) {
                continue;
            }
            entries.insert(va, (pa, flags));
            mapped += 1;
        }
        Ok(mapped)
    }

    fn protect(&self, base: Vaddr, count: usize, flags: MmuFlags) -> VmResult<()> {
        self.calls.lock().push(ArchCall::Protect(base, count, flags));
        let mut entries = self.entries.lock();
        for (_, entry) in entries.range_mut(base.0..base.0 + count * PAGE) {
            entry.1 = flags;
        }
        Ok(())
    }

    fn unmap(&self, base: Vaddr, count: usize, _enlarge: EnlargePolicy) -> VmResult<usize> {
        self.calls.lock().push(ArchCall::Unmap(base, count));
        let mut entries = self.entries.lock();
        let doomed: Vec<usize> = entries
            .range(base.0..base.0 + count * PAGE)
            .map(|(va, _)| *va)
            .collect();
        for va in &doomed {
            entries.remove(va);
        }
        Ok(doomed.len())
    }

    fn query(&self, va: Vaddr) -> VmResult<(Paddr, MmuFlags)> {
        self.entry(va).ok_or(VmError::NotFound)
    }

    fn next_page_table_boundary(&self, va: Vaddr) -> Vaddr {
        let granule = GRANULE_PAGES * PAGE;
        Vaddr((va.0 / granule + 1) * granule)
    }

    fn sync_cache(&self, _pa: Paddr, _len: usize) {
        self.synced.fetch_add(1, Ordering::SeqCst);
    }
}

static NEXT_FRAME: AtomicUsize = AtomicUsize::new(0x8000_0000);

fn alloc_frame() -> Paddr {
    Paddr(NEXT_FRAME.fetch_add(PAGE, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy)]
struct Page {
    pa: Paddr,
    /// 与其他对象共享的写时复制页
    shared: bool,
    dirty: bool,
}

struct ObjectInner {
    pages: BTreeMap<usize, Page>,
    mappings: Vec<MappingRef>,
    generation: u64,
    deferred: Option<Arc<MockWaiter>>,
}

/// 延迟供页的等待者
#[derive(Default)]
pub struct MockWaiter {
    waits: AtomicUsize,
    fail: AtomicBool,
}

impl MockWaiter {
    /// 被等待的次数
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    /// 让等待失败
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl PageWaiter for MockWaiter {
    fn wait(&self) -> VmResult<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(VmError::NotFound)
        } else {
            Ok(())
        }
    }
}

/// 内存中的后备对象
pub struct MockObject {
    lock: Box<RawSpinLock>,
    size: usize,
    dirty_tracked: bool,
    cache: CachePolicy,
    inner: LockedBy<ObjectInner>,
    lookups: AtomicUsize,
    attributions: AtomicUsize,
}

impl MockObject {
    fn build(pages: usize, dirty_tracked: bool, cache: CachePolicy) -> Arc<Self> {
        // 锁放在堆上，LockedBy 记录的地址在对象移动后仍然有效
        let lock = Box::new(RawSpinLock::new());
        let inner = LockedBy::new(
            &lock,
            ObjectInner {
                pages: BTreeMap::new(),
                mappings: Vec::new(),
                generation: 0,
                deferred: None,
            },
        );
        Arc::new(Self {
            lock,
            size: pages * PAGE,
            dirty_tracked,
            cache,
            inner,
            lookups: AtomicUsize::new(0),
            attributions: AtomicUsize::new(0),
        })
    }

    /// 普通匿名对象
    pub fn new(pages: usize) -> Arc<Self> {
        Self::build(pages, false, CachePolicy::Cached)
    }

    /// 需要脏页跟踪的对象
    pub fn dirty_tracked(pages: usize) -> Arc<Self> {
        Self::build(pages, true, CachePolicy::Cached)
    }

    /// 指定缓存策略的对象
    pub fn with_cache_policy(pages: usize, cache: CachePolicy) -> Arc<Self> {
        Self::build(pages, false, cache)
    }

    fn inner<'a>(&'a self, guard: &'a mut ObjectGuard<'_>) -> &'a mut ObjectInner {
        self.inner.access_mut(guard.raw_mut())
    }

    /// 查找次数
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// 驻留页统计被计算的次数
    pub fn attribution_queries(&self) -> usize {
        self.attributions.load(Ordering::SeqCst)
    }

    /// 提交第 `idx` 页，返回其物理地址
    pub fn commit_page(&self, idx: usize) -> Paddr {
        let mut guard = ObjectGuard::lock_detached(self);
        let inner = self.inner(&mut guard);
        inner.generation += 1;
        inner
            .pages
            .entry(idx)
            .or_insert(Page {
                pa: alloc_frame(),
                shared: false,
                dirty: false,
            })
            .pa
    }

    /// 把第 `idx` 页设为共享的写时复制页，返回其物理地址
    pub fn insert_shared_page(&self, idx: usize) -> Paddr {
        let mut guard = ObjectGuard::lock_detached(self);
        let inner = self.inner(&mut guard);
        let pa = alloc_frame();
        inner.pages.insert(
            idx,
            Page {
                pa,
                shared: true,
                dirty: false,
            },
        );
        inner.generation += 1;
        pa
    }

    /// 第 `idx` 页的物理地址
    pub fn page(&self, idx: usize) -> Option<Paddr> {
        let mut guard = ObjectGuard::lock_detached(self);
        self.inner(&mut guard).pages.get(&idx).map(|p| p.pa)
    }

    /// 第 `idx` 页是否为脏
    pub fn is_dirty(&self, idx: usize) -> bool {
        let mut guard = ObjectGuard::lock_detached(self);
        self.inner(&mut guard).pages.get(&idx).is_some_and(|p| p.dirty)
    }

    /// 在对象锁内同时读取第 `idx` 页的脏标记与 `va` 处页表项是否可写
    pub fn dirty_and_writable(&self, idx: usize, arch: &MockArch, va: Vaddr) -> (bool, bool) {
        let mut guard = ObjectGuard::lock_detached(self);
        let dirty = self.inner(&mut guard).pages.get(&idx).is_some_and(|p| p.dirty);
        let writable = arch.entry(va).is_some_and(|(_, flags)| flags.contains(MmuFlags::WRITE));
        (dirty, writable)
    }

    /// 登记的映射 id
    pub fn mapping_ids(&self) -> Vec<MappingId> {
        let mut guard = ObjectGuard::lock_detached(self);
        self.inner(&mut guard).mappings.iter().map(|m| m.id()).collect()
    }

    /// 下一次查找返回 ShouldWait，并返回需要等待的对象
    pub fn defer_next_lookup(&self) -> Arc<MockWaiter> {
        let waiter = Arc::new(MockWaiter::default());
        let mut guard = ObjectGuard::lock_detached(self);
        self.inner(&mut guard).deferred = Some(waiter.clone());
        waiter
    }

    /// 换出第 `idx` 页：先让所有映射解除该页，再释放
    pub fn evict(&self, idx: usize) {
        let mut guard = ObjectGuard::lock_detached(self);
        let mappings = self.inner(&mut guard).mappings.clone();
        for m in mappings.iter().filter_map(MappingRef::upgrade) {
            m.unmap_object_range(&guard, idx * PAGE, PAGE, CallOrigin::External);
        }
        let inner = self.inner(&mut guard);
        inner.pages.remove(&idx);
        inner.generation += 1;
    }

    /// 写回第 `idx` 页：清除脏标记并撤销各映射的写权限
    pub fn clean(&self, idx: usize) {
        let mut guard = ObjectGuard::lock_detached(self);
        let mappings = self.inner(&mut guard).mappings.clone();
        for m in mappings.iter().filter_map(MappingRef::upgrade) {
            m.remove_write_object_range(&guard, idx * PAGE, PAGE);
        }
        if let Some(page) = self.inner(&mut guard).pages.get_mut(&idx) {
            page.dirty = false;
        }
    }
}

impl BackingObject for MockObject {
    fn object_lock(&self) -> &RawSpinLock {
        &self.lock
    }

    fn size(&self) -> usize {
        self.size
    }

    fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    fn is_dirty_tracked(&self) -> bool {
        self.dirty_tracked
    }

    fn lookup_pages(
        &self,
        guard: &mut ObjectGuard<'_>,
        offset: usize,
        fault: FaultFlags,
        dirty: DirtyAction,
        max_pages: usize,
        request: &mut PageRequest,
        origin: CallOrigin,
    ) -> VmResult<LookupInfo> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let dirty_tracked = self.dirty_tracked;
        let inner = self.inner(guard);
        if let Some(waiter) = inner.deferred.take() {
            request.arm(waiter);
            return Err(VmError::ShouldWait);
        }

        let first = offset / PAGE;
        let count = max_pages.min(MAX_LOOKUP_PAGES);
        let mut info = LookupInfo::new(true);
        let mut broken = Vec::new();
        for idx in first..first + count {
            if idx * PAGE >= self.size {
                break;
            }
            if !inner.pages.contains_key(&idx) {
                if fault.contains(FaultFlags::NO_ALLOC) {
                    if idx == first {
                        return Err(VmError::NotFound);
                    }
                    break;
                }
                inner.generation += 1;
                inner.pages.insert(
                    idx,
                    Page {
                        pa: alloc_frame(),
                        shared: false,
                        dirty: false,
                    },
                );
            }
            let Some(page) = inner.pages.get_mut(&idx) else {
                break;
            };
            if fault.is_write() && page.shared {
                page.pa = alloc_frame();
                page.shared = false;
                broken.push(idx);
            }
            if dirty == DirtyAction::MarkDirty {
                page.dirty = true;
            }
            if page.shared || (dirty_tracked && !page.dirty) {
                info.writable = false;
            }
            info.push(page.pa);
        }
        if !broken.is_empty() {
            inner.generation += 1;
            let mappings = inner.mappings.clone();
            for m in mappings.iter().filter_map(MappingRef::upgrade) {
                for &idx in &broken {
                    m.unmap_object_range(guard, idx * PAGE, PAGE, origin);
                }
            }
        }
        Ok(info)
    }

    fn attributed_pages_in_range(&self, guard: &ObjectGuard<'_>, offset: usize, len: usize) -> usize {
        self.attributions.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.access(guard.raw());
        inner
            .pages
            .range(offset / PAGE..(offset + len).div_ceil(PAGE))
            .filter(|(_, p)| !p.shared)
            .count()
    }

    fn content_generation(&self, guard: &ObjectGuard<'_>) -> u64 {
        self.inner.access(guard.raw()).generation
    }

    fn add_mapping(&self, guard: &mut ObjectGuard<'_>, mapping: MappingRef) {
        self.inner(guard).mappings.push(mapping);
    }

    fn remove_mapping(&self, guard: &mut ObjectGuard<'_>, id: MappingId) {
        self.inner(guard).mappings.retain(|m| m.id() != id);
    }

    fn decommit_range(&self, guard: &mut ObjectGuard<'_>, offset: usize, len: usize) -> VmResult<()> {
        if offset + len > self.size {
            return Err(VmError::OutOfRange);
        }
        let mappings = self.inner(guard).mappings.clone();
        for m in mappings.iter().filter_map(MappingRef::upgrade) {
            m.unmap_object_range(guard, offset, len, CallOrigin::External);
        }
        let inner = self.inner(guard);
        let doomed: Vec<usize> = inner
            .pages
            .range(offset / PAGE..(offset + len) / PAGE)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in doomed {
            inner.pages.remove(&idx);
        }
        inner.generation += 1;
        Ok(())
    }
}

/// 第 `fail_on` 次（从 1 开始）预留失败的断点分配器
pub struct FailingNodes {
    calls: AtomicUsize,
    fail_on: AtomicUsize,
}

impl FailingNodes {
    /// 创建在第 `fail_on` 次调用时失败的分配器；0 表示从不失败
    pub fn new(fail_on: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(fail_on),
        })
    }

    /// 已调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 重新设定失败的调用序号（相对已调用次数）
    pub fn fail_after(&self, n: usize) {
        self.fail_on.store(self.calls() + n, Ordering::SeqCst);
    }
}

impl NodeAllocator for FailingNodes {
    fn reserve(&self, nodes: &mut Vec<Breakpoint>, additional: usize) -> VmResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on.load(Ordering::SeqCst) {
            return Err(VmError::NoMemory);
        }
        HeapNodes.reserve(nodes, additional)
    }
}
