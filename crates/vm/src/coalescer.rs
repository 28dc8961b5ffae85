//! 页映射合并器
//!
//! 把一串虚拟地址连续的"虚拟页 → 物理页"对应关系缓冲起来，
//! 一次 [`ArchAddressSpace::map`] 调用提交，减少页表操作次数。

use crate::address::{Paddr, Vaddr};
use crate::arch::{ArchAddressSpace, ExistingEntryAction};
use crate::config::MAX_LOOKUP_PAGES;
use crate::error::VmResult;
use crate::flags::MmuFlags;

/// 页映射合并器
///
/// 销毁前必须 [`flush`](Self::flush) 或 [`abort`](Self::abort)。
pub struct MappingCoalescer<'a> {
    arch: &'a dyn ArchAddressSpace,
    base: Vaddr,
    pages: [Paddr; MAX_LOOKUP_PAGES],
    count: usize,
    flags: MmuFlags,
    existing: ExistingEntryAction,
    aborted: bool,
}

impl<'a> MappingCoalescer<'a> {
    /// 创建以 `flags` 映射、遇到已有项时按 `existing` 处理的合并器
    pub fn new(
        arch: &'a dyn ArchAddressSpace,
        flags: MmuFlags,
        existing: ExistingEntryAction,
    ) -> Self {
        Self {
            arch,
            base: Vaddr(0),
            pages: [Paddr(0); MAX_LOOKUP_PAGES],
            count: 0,
            flags,
            existing,
            aborted: false,
        }
    }

    /// 当前使用的权限
    pub fn flags(&self) -> MmuFlags {
        self.flags
    }

    /// 缓冲中的页数
    pub fn pending(&self) -> usize {
        self.count
    }

    /// 追加一页
    ///
    /// `va` 不紧接缓冲区末尾或缓冲区已满时，先提交当前缓冲。
    pub fn append(&mut self, va: Vaddr, pa: Paddr) -> VmResult<()> {
        debug_assert!(!self.aborted);
        if self.count > 0 && (va != self.base.add_pages(self.count) || self.count == MAX_LOOKUP_PAGES)
        {
            self.flush()?;
        }
        if self.count == 0 {
            self.base = va;
        }
        self.pages[self.count] = pa;
        self.count += 1;
        Ok(())
    }

    /// 修改后续页使用的权限；权限变化时先提交当前缓冲
    pub fn set_flags(&mut self, flags: MmuFlags) -> VmResult<()> {
        if flags != self.flags {
            self.flush()?;
            self.flags = flags;
        }
        Ok(())
    }

    /// 提交缓冲
    ///
    /// 权限不授予任何访问时只丢弃缓冲，不建立映射。
    pub fn flush(&mut self) -> VmResult<()> {
        if self.count == 0 {
            return Ok(());
        }
        let count = core::mem::take(&mut self.count);
        if !self.flags.has_permissions() {
            return Ok(());
        }
        let mapped = self
            .arch
            .map(self.base, &self.pages[..count], self.flags, self.existing)?;
        log::trace!(
            "vm: coalesced map {:#x} pages={} mapped={} flags={:?}",
            self.base,
            count,
            mapped,
            self.flags
        );
        Ok(())
    }

    /// 丢弃缓冲而不提交
    pub fn abort(&mut self) {
        self.aborted = true;
        self.count = 0;
    }
}

impl Drop for MappingCoalescer<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.count == 0 || self.aborted,
            "MappingCoalescer dropped with {} unflushed pages",
            self.count
        );
    }
}
