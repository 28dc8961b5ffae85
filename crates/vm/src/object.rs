//! 后备内存对象接口
//!
//! 后备对象（VMO）向映射提供物理页。它的分页、换出、写时复制与脏页跟踪
//! 都在外部实现，映射管理只依赖 [`BackingObject`]。
//!
//! ## 锁
//!
//! 每个后备对象有一把对象锁（[`BackingObject::object_lock`]），保护对象内容、
//! 它的映射列表，以及映射中由 [`sync::LockedBy`] 包裹的字段。
//! 同时需要地址空间锁与对象锁时，必须先取地址空间锁：
//! [`ObjectGuard::lock`] 要求出示 [`AspaceGuard`]。
//! 对象自身发起的回调（例如换出前解除映射）只持有对象锁，
//! 通过 [`ObjectGuard::lock_detached`] 获取，回调中不得再获取地址空间锁。

use alloc::sync::{Arc, Weak};

use sync::{RawGuard, RawSpinLock};

use crate::address::Paddr;
use crate::address_space::AspaceGuard;
use crate::config::MAX_LOOKUP_PAGES;
use crate::error::{VmError, VmResult};
use crate::flags::{CachePolicy, FaultFlags};
use crate::mapping::{Mapping, MappingId};

/// 查找页时对脏页状态的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyAction {
    /// 不改变脏页状态
    None,
    /// 把返回的页标记为脏（写缺页）
    MarkDirty,
}

/// 调用来源
///
/// 对象在一次查找期间回调映射时，必须原样转发查找时收到的来源，
/// 映射据此跳过由它自己的缺页引起的递归解除映射。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    /// 与任何映射的缺页无关
    External,
    /// 由该映射的缺页处理引起
    Fault(MappingId),
}

impl CallOrigin {
    /// 是否由 `id` 的缺页处理引起
    pub fn is_fault_of(self, id: MappingId) -> bool {
        self == CallOrigin::Fault(id)
    }
}

/// 一次页查找的结果：从请求偏移开始的连续若干页
#[derive(Debug, Clone)]
pub struct LookupInfo {
    pages: [Paddr; MAX_LOOKUP_PAGES],
    count: usize,
    /// 这些页能否直接以可写方式映射（写时复制共享页、零页为 false）
    pub writable: bool,
}

impl LookupInfo {
    /// 创建空结果
    pub fn new(writable: bool) -> Self {
        Self {
            pages: [Paddr(0); MAX_LOOKUP_PAGES],
            count: 0,
            writable,
        }
    }

    /// 追加下一页；已满时返回 false
    pub fn push(&mut self, pa: Paddr) -> bool {
        if self.count == MAX_LOOKUP_PAGES {
            return false;
        }
        self.pages[self.count] = pa;
        self.count += 1;
        true
    }

    /// 查找到的物理页
    pub fn pages(&self) -> &[Paddr] {
        &self.pages[..self.count]
    }

    /// 页数
    pub fn len(&self) -> usize {
        self.count
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// 等待外部供页者的句柄
pub trait PageWaiter: Send + Sync {
    /// 阻塞直到页可用或等待失败
    fn wait(&self) -> VmResult<()>;
}

/// 页请求令牌
///
/// 对象在无法立即提供页时 [`PageRequest::arm`] 并返回
/// [`VmError::ShouldWait`]；映射释放全部锁后等待，然后重试。
#[derive(Default)]
pub struct PageRequest {
    waiter: Option<Arc<dyn PageWaiter>>,
}

impl PageRequest {
    /// 创建空的请求
    pub fn new() -> Self {
        Self { waiter: None }
    }

    /// 登记需要等待的供页者
    pub fn arm(&mut self, waiter: Arc<dyn PageWaiter>) {
        self.waiter = Some(waiter);
    }

    /// 是否已登记
    pub fn is_armed(&self) -> bool {
        self.waiter.is_some()
    }

    /// 等待并清空请求；调用时不得持有任何锁
    pub(crate) fn wait(&mut self) -> VmResult<()> {
        match self.waiter.take() {
            Some(waiter) => waiter.wait(),
            None => {
                log::warn!("vm: object returned ShouldWait without arming the page request");
                Err(VmError::BadState)
            }
        }
    }
}

impl core::fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRequest")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// 对象持有的、指向映射的非拥有引用
#[derive(Debug, Clone)]
pub struct MappingRef {
    id: MappingId,
    mapping: Weak<Mapping>,
}

impl MappingRef {
    pub(crate) fn new(mapping: &Arc<Mapping>) -> Self {
        Self {
            id: mapping.id(),
            mapping: Arc::downgrade(mapping),
        }
    }

    /// 映射 id
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// 获取映射；映射已被释放时返回 None
    pub fn upgrade(&self) -> Option<Arc<Mapping>> {
        self.mapping.upgrade()
    }
}

/// 后备内存对象
pub trait BackingObject: Send + Sync {
    /// 对象锁
    fn object_lock(&self) -> &RawSpinLock;

    /// 对象大小（字节）
    fn size(&self) -> usize;

    /// 对象的缓存策略，映射的硬件标志必须与之一致
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Cached
    }

    /// 写权限是否需要经由缺页授予（以记录脏页）
    fn is_dirty_tracked(&self) -> bool;

    /// 查找从 `offset` 开始的至多 `max_pages` 个连续页
    ///
    /// 成功时至少返回一页。`fault` 带 [`FaultFlags::NO_ALLOC`] 时只返回已驻留的页，
    /// 首页不驻留则返回 [`VmError::NotFound`]。需要等待外部供页时登记 `request`
    /// 并返回 [`VmError::ShouldWait`]。期间对映射的回调必须携带 `origin`。
    #[allow(clippy::too_many_arguments)]
    fn lookup_pages(
        &self,
        guard: &mut ObjectGuard<'_>,
        offset: usize,
        fault: FaultFlags,
        dirty: DirtyAction,
        max_pages: usize,
        request: &mut PageRequest,
        origin: CallOrigin,
    ) -> VmResult<LookupInfo>;

    /// `[offset, offset + len)` 中归属此对象的驻留页数
    fn attributed_pages_in_range(&self, guard: &ObjectGuard<'_>, offset: usize, len: usize)
    -> usize;

    /// 内容代数，内容变化时单调递增
    fn content_generation(&self, guard: &ObjectGuard<'_>) -> u64;

    /// 登记一个映射此对象的映射
    fn add_mapping(&self, guard: &mut ObjectGuard<'_>, mapping: MappingRef);

    /// 移除映射登记
    fn remove_mapping(&self, guard: &mut ObjectGuard<'_>, id: MappingId);

    /// 释放 `[offset, offset + len)` 的页，并通过回调解除各映射中的硬件映射
    fn decommit_range(&self, guard: &mut ObjectGuard<'_>, offset: usize, len: usize)
    -> VmResult<()>;
}

/// 对象锁的 RAII 保护器
pub struct ObjectGuard<'a> {
    raw: RawGuard<'a>,
}

impl<'a> ObjectGuard<'a> {
    /// 在已持有地址空间锁的前提下获取对象锁
    pub fn lock(object: &'a dyn BackingObject, _aspace: &AspaceGuard<'_>) -> Self {
        Self {
            raw: object.object_lock().guard(),
        }
    }

    /// 由对象自身发起的路径获取对象锁
    ///
    /// 持有期间不得获取任何地址空间锁。
    pub fn lock_detached(object: &'a dyn BackingObject) -> Self {
        Self {
            raw: object.object_lock().guard(),
        }
    }

    /// 原始锁保护器（共享）
    pub fn raw(&self) -> &RawGuard<'a> {
        &self.raw
    }

    /// 原始锁保护器（独占）
    pub fn raw_mut(&mut self) -> &mut RawGuard<'a> {
        &mut self.raw
    }
}
