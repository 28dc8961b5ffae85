//! 映射内的保护区间集合
//!
//! 一个映射内部可以有多段不同权限的子区间。[`ProtectionRangeSet`] 用
//! "首区间标志 + 有序断点"表示：从映射起点到第一个断点使用
//! `first_region_flags`，每个断点标记前一段结束、新一段开始的位置。
//! 单一权限的映射不需要任何断点。
//!
//! 集合本身不记录映射边界，每个操作都由调用者传入 `map_base`/`map_size`。
//!
//! ## 两阶段更新
//!
//! [`ProtectionRangeSet::plan_update`] 计算需要新增的断点并预先分配，
//! 失败时集合保持不变；返回的 [`UpdatePlan`] 的 [`UpdatePlan::commit`]
//! 不再分配内存，也不会失败。拆分与合并同样先预留后修改。

use alloc::vec::Vec;
use core::cmp::min;

use crate::address::Vaddr;
use crate::error::{VmError, VmResult};
use crate::flags::MmuFlags;

/// 断点：从 `addr` 开始使用 `flags`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    /// 新子区间的起始地址
    pub addr: Vaddr,
    /// 新子区间的权限
    pub flags: MmuFlags,
}

/// 断点存储的分配器
///
/// 所有断点内存都经由此 trait 预留，测试可以注入在第 N 次调用时失败的实现。
pub trait NodeAllocator: Send + Sync {
    /// 保证 `nodes` 还能容纳至少 `additional` 个断点而无需再分配
    fn reserve(&self, nodes: &mut Vec<Breakpoint>, additional: usize) -> VmResult<()>;
}

/// 使用全局堆的默认分配器
#[derive(Debug, Default)]
pub struct HeapNodes;

impl NodeAllocator for HeapNodes {
    fn reserve(&self, nodes: &mut Vec<Breakpoint>, additional: usize) -> VmResult<()> {
        nodes.try_reserve(additional).map_err(|_| VmError::NoMemory)
    }
}

/// 遍历回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// 继续下一个子区间
    Continue,
    /// 提前结束（视为成功）
    Stop,
}

/// 映射内的保护区间集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionRangeSet {
    first_region_flags: MmuFlags,
    breakpoints: Vec<Breakpoint>,
}

/// 按地址递增顺序产出 `(起始地址, 长度, 权限)` 的子区间迭代器
pub struct Regions<'a> {
    breakpoints: &'a [Breakpoint],
    idx: usize,
    cur: Vaddr,
    end: Vaddr,
    flags: MmuFlags,
}

impl Iterator for Regions<'_> {
    type Item = (Vaddr, usize, MmuFlags);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur >= self.end {
            return None;
        }
        let next = self
            .breakpoints
            .get(self.idx)
            .map_or(self.end, |bp| min(bp.addr, self.end));
        let item = (self.cur, next - self.cur, self.flags);
        if let Some(bp) = self.breakpoints.get(self.idx) {
            self.flags = bp.flags;
        }
        self.idx += 1;
        self.cur = next;
        Some(item)
    }
}

impl ProtectionRangeSet {
    /// 创建整段使用 `flags` 的集合
    pub fn new(flags: MmuFlags) -> Self {
        Self {
            first_region_flags: flags,
            breakpoints: Vec::new(),
        }
    }

    /// 首区间权限
    pub fn first_region_flags(&self) -> MmuFlags {
        self.first_region_flags
    }

    /// 断点列表
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// 是否只有一段权限
    pub fn is_uniform(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// 第一个地址大于 `va` 的断点下标
    fn index_after(&self, va: Vaddr) -> usize {
        self.breakpoints.partition_point(|bp| bp.addr <= va)
    }

    /// 第一个地址不小于 `va` 的断点下标
    fn index_from(&self, va: Vaddr) -> usize {
        self.breakpoints.partition_point(|bp| bp.addr < va)
    }

    /// 下标 `idx` 之前生效的权限
    fn flags_before(&self, idx: usize) -> MmuFlags {
        match idx {
            0 => self.first_region_flags,
            _ => self.breakpoints[idx - 1].flags,
        }
    }

    /// `va` 处的权限
    pub fn flags_at(&self, va: Vaddr) -> MmuFlags {
        self.flags_before(self.index_after(va))
    }

    /// `va` 所在子区间的结束地址与权限
    pub fn region_at(&self, map_base: Vaddr, map_size: usize, va: Vaddr) -> (Vaddr, MmuFlags) {
        let idx = self.index_after(va);
        let end = self
            .breakpoints
            .get(idx)
            .map_or(map_base + map_size, |bp| bp.addr);
        (end, self.flags_before(idx))
    }

    /// 与 `[base, base + size)` 相交的子区间，首尾截断到窗口内
    pub fn regions(&self, base: Vaddr, size: usize) -> Regions<'_> {
        let idx = self.index_after(base);
        Regions {
            breakpoints: &self.breakpoints,
            idx,
            cur: base,
            end: base + size,
            flags: self.flags_before(idx),
        }
    }

    /// 按地址顺序对 `[base, base + size)` 内的每个子区间调用 `f`
    ///
    /// `f` 返回 [`Walk::Stop`] 时提前成功返回，返回错误时原样传播。
    pub fn enumerate<F>(
        &self,
        map_base: Vaddr,
        map_size: usize,
        base: Vaddr,
        size: usize,
        mut f: F,
    ) -> VmResult<()>
    where
        F: FnMut(Vaddr, usize, MmuFlags) -> VmResult<Walk>,
    {
        debug_assert!(base >= map_base && base + size <= map_base + map_size);
        for (region_base, region_len, flags) in self.regions(base, size) {
            if f(region_base, region_len, flags)? == Walk::Stop {
                break;
            }
        }
        Ok(())
    }

    /// 规划把 `[base, base + size)` 的权限改为 `flags`
    ///
    /// 预留需要的断点内存；失败时返回 [`VmError::NoMemory`] 且集合不变。
    #[allow(clippy::too_many_arguments)]
    pub fn plan_update<'a>(
        &'a mut self,
        map_base: Vaddr,
        map_size: usize,
        base: Vaddr,
        size: usize,
        flags: MmuFlags,
        alloc: &dyn NodeAllocator,
    ) -> VmResult<UpdatePlan<'a>> {
        let map_end = map_base + map_size;
        let end = base + size;
        debug_assert!(size > 0 && base >= map_base && end <= map_end);

        if base == map_base && end == map_end {
            return Ok(UpdatePlan {
                set: self,
                base,
                size,
                flags,
                edit: Edit::Whole,
            });
        }

        let lo = self.index_from(base);
        let hi = self.index_from(end);

        let start = (base != map_base && self.flags_before(lo) != flags)
            .then_some(Breakpoint { addr: base, flags });

        let mut drop_end = false;
        let mut end_bp = None;
        if end != map_end {
            match self.breakpoints.get(hi) {
                Some(bp) if bp.addr == end => drop_end = bp.flags == flags,
                _ => {
                    let right = self.flags_before(hi);
                    if right != flags {
                        end_bp = Some(Breakpoint {
                            addr: end,
                            flags: right,
                        });
                    }
                }
            }
        }

        let needed = start.is_some() as usize + end_bp.is_some() as usize;
        let freed = (hi - lo) + drop_end as usize;
        let shortfall = needed.saturating_sub(freed);
        if shortfall > 0 {
            alloc.reserve(&mut self.breakpoints, shortfall)?;
        }

        Ok(UpdatePlan {
            set: self,
            base,
            size,
            flags,
            edit: Edit::Partial {
                lo,
                hi: hi + drop_end as usize,
                start,
                end: end_bp,
                from_map_base: base == map_base,
            },
        })
    }

    /// 为 [`Self::split_at`] 预留右半部分的断点存储
    pub fn prepare_split(&self, at: Vaddr, alloc: &dyn NodeAllocator) -> VmResult<SplitReserve> {
        let moved = self.breakpoints.len() - self.index_after(at);
        let mut nodes = Vec::new();
        if moved > 0 {
            alloc.reserve(&mut nodes, moved)?;
        }
        Ok(SplitReserve { at, nodes })
    }

    /// 在 `at` 处拆分，返回覆盖 `[at, 映射末尾)` 的集合
    ///
    /// 新集合的首区间权限为 `at` 处原有的权限；`at` 上的断点不再保留。
    pub fn split_at(&mut self, reserve: SplitReserve) -> ProtectionRangeSet {
        let SplitReserve { at, mut nodes } = reserve;
        let first = self.flags_at(at);
        let keep = self.index_from(at);
        let moved_from = self.index_after(at);
        debug_assert!(nodes.capacity() >= self.breakpoints.len() - moved_from);
        nodes.extend(self.breakpoints.drain(moved_from..));
        self.breakpoints.truncate(keep);
        ProtectionRangeSet {
            first_region_flags: first,
            breakpoints: nodes,
        }
    }

    /// 把紧邻右侧（从 `seam` 开始）的集合并入自身
    ///
    /// 只有接缝两侧权限不同时才在 `seam` 插入断点。预留失败时两个集合都不变。
    pub fn merge_right(
        &mut self,
        right: &mut ProtectionRangeSet,
        seam: Vaddr,
        alloc: &dyn NodeAllocator,
    ) -> VmResult<()> {
        debug_assert!(self.breakpoints.last().is_none_or(|bp| bp.addr < seam));
        let left_flags = self.flags_before(self.breakpoints.len());
        let boundary = (left_flags != right.first_region_flags).then_some(Breakpoint {
            addr: seam,
            flags: right.first_region_flags,
        });
        let incoming = boundary.is_some() as usize + right.breakpoints.len();
        if incoming > 0 {
            alloc.reserve(&mut self.breakpoints, incoming)?;
        }
        if let Some(bp) = boundary {
            self.breakpoints.push(bp);
        }
        self.breakpoints.append(&mut right.breakpoints);
        Ok(())
    }

    /// 映射从左侧收缩到 `at`：丢弃 `at` 及以前的断点
    pub fn discard_below(&mut self, at: Vaddr) {
        let idx = self.index_after(at);
        self.first_region_flags = self.flags_before(idx);
        self.breakpoints.drain(..idx);
    }

    /// 映射从右侧收缩到 `at`：丢弃 `at` 及以后的断点
    pub fn discard_above(&mut self, at: Vaddr) {
        let idx = self.index_from(at);
        self.breakpoints.truncate(idx);
    }

    /// 清空所有断点
    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }

    /// 检查断点都严格位于映射内部、有序且相邻权限不同
    pub fn is_consistent(&self, map_base: Vaddr, map_size: usize) -> bool {
        let map_end = map_base + map_size;
        let mut prev_addr = map_base;
        let mut prev_flags = self.first_region_flags;
        for bp in &self.breakpoints {
            if bp.addr <= prev_addr || bp.addr >= map_end || bp.flags == prev_flags {
                return false;
            }
            prev_addr = bp.addr;
            prev_flags = bp.flags;
        }
        true
    }
}

enum Edit {
    Whole,
    Partial {
        lo: usize,
        hi: usize,
        start: Option<Breakpoint>,
        end: Option<Breakpoint>,
        from_map_base: bool,
    },
}

/// 已完成内存预留的权限更新
///
/// 持有集合的独占借用，期间集合不能被其他路径修改。
#[must_use = "an update plan does nothing until committed"]
pub struct UpdatePlan<'a> {
    set: &'a mut ProtectionRangeSet,
    base: Vaddr,
    size: usize,
    flags: MmuFlags,
    edit: Edit,
}

impl UpdatePlan<'_> {
    /// 执行更新
    ///
    /// 修改之前，对窗口内每个旧子区间调用一次 `f(起始, 长度, 旧权限)`。
    pub fn commit<F>(self, mut f: F)
    where
        F: FnMut(Vaddr, usize, MmuFlags),
    {
        for (region_base, region_len, old) in self.set.regions(self.base, self.size) {
            f(region_base, region_len, old);
        }

        let set = self.set;
        match self.edit {
            Edit::Whole => {
                set.breakpoints.clear();
                set.first_region_flags = self.flags;
            }
            Edit::Partial {
                lo,
                hi,
                start,
                end,
                from_map_base,
            } => {
                set.breakpoints.drain(lo..hi);
                let mut at = lo;
                if let Some(bp) = start {
                    set.breakpoints.insert(at, bp);
                    at += 1;
                }
                if let Some(bp) = end {
                    set.breakpoints.insert(at, bp);
                }
                if from_map_base {
                    set.first_region_flags = self.flags;
                }
            }
        }
    }
}

/// [`ProtectionRangeSet::prepare_split`] 预留的存储
#[derive(Debug)]
pub struct SplitReserve {
    at: Vaddr,
    nodes: Vec<Breakpoint>,
}
