//! 架构页表接口
//!
//! [`ArchAddressSpace`] 由各架构实现（不同 MMU、不同页表格式），
//! 映射管理只依赖该 trait，从而把"映射的逻辑状态"与"页表硬件细节"解耦。
//! 实现者自行保证内部同步，因此所有方法都只需要 `&self`。

use crate::address::{Paddr, Vaddr};
use crate::error::VmResult;
use crate::flags::MmuFlags;

/// 映射目标处已有页表项时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingEntryAction {
    /// 跳过已有的项，只映射空位
    Skip,
    /// 已有项时返回 [`crate::VmError::AlreadyExists`]
    Error,
}

/// 解除映射时能否扩大到整个大页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlargePolicy {
    /// 精确解除；需要拆分大页时可能返回 NoMemory
    No,
    /// 允许扩大解除范围以避免分配
    Yes,
}

/// 架构地址空间（硬件页表）接口
pub trait ArchAddressSpace: Send + Sync {
    /// 从 `base` 开始依次映射 `pages` 中的物理页，返回实际新建的项数
    fn map(
        &self,
        base: Vaddr,
        pages: &[Paddr],
        flags: MmuFlags,
        existing: ExistingEntryAction,
    ) -> VmResult<usize>;

    /// 修改 `[base, base + count 页)` 中已存在项的权限；不存在的项被忽略
    fn protect(&self, base: Vaddr, count: usize, flags: MmuFlags) -> VmResult<()>;

    /// 解除 `[base, base + count 页)` 的映射，返回实际解除的项数
    fn unmap(&self, base: Vaddr, count: usize, enlarge: EnlargePolicy) -> VmResult<usize>;

    /// 查询 `va` 处的映射；未映射时返回 [`crate::VmError::NotFound`]
    fn query(&self, va: Vaddr) -> VmResult<(Paddr, MmuFlags)>;

    /// `va` 所在页表粒度（末级页表覆盖范围）之后的第一个地址
    fn next_page_table_boundary(&self, va: Vaddr) -> Vaddr;

    /// 在暴露给客户机之前清理并同步 `[pa, pa + len)` 的 CPU 缓存
    fn sync_cache(&self, pa: Paddr, len: usize);
}
