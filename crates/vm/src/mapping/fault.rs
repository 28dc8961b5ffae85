//! 缺页处理与预先映射

use core::cmp::min;

use super::{Mapping, fatal};
use crate::address::{AlignOps, Paddr, Vaddr, bytes_to_pages, page_size};
use crate::address_space::{AddressSpace, AspaceGuard};
use crate::arch::{EnlargePolicy, ExistingEntryAction};
use crate::coalescer::MappingCoalescer;
use crate::config::{fault_lookahead_pages, map_range_batch_pages};
use crate::error::{VmError, VmResult};
use crate::flags::{FaultFlags, MmuFlags};
use crate::object::{CallOrigin, DirtyAction, ObjectGuard, PageRequest};

/// 缺页路径中的硬件操作结果：内存不足不可恢复，其他错误照常返回
fn hw<T>(op: &str, va: Vaddr, result: VmResult<T>) -> VmResult<T> {
    match result {
        Err(VmError::NoMemory) => fatal(op, va, VmError::NoMemory),
        other => other,
    }
}

impl Mapping {
    /// 处理 `va` 处的缺页
    ///
    /// 后备对象需要等待外部供页时，释放所有锁后在 `request` 上等待并重试。
    ///
    /// # Errors
    /// - [`VmError::AccessDenied`]：`va` 所在子区间的权限不满足此次访问
    /// - [`VmError::BadState`] / [`VmError::OutOfRange`]：映射已销毁或不包含 `va`
    /// - 后备对象查找失败时原样返回
    pub fn page_fault(&self, va: Vaddr, flags: FaultFlags, request: &mut PageRequest) -> VmResult<()> {
        loop {
            let aspace = self.aspace()?;
            let tree = aspace.lock();
            match self.page_fault_locked(&aspace, &tree, va, flags, request) {
                Err(VmError::ShouldWait) => {
                    drop(tree);
                    log::trace!("vm: {:?} fault at {:#x} waiting for page", self.id, va);
                    request.wait()?;
                }
                result => return result,
            }
        }
    }

    fn page_fault_locked(
        &self,
        aspace: &AddressSpace,
        tree: &AspaceGuard<'_>,
        va: Vaddr,
        flags: FaultFlags,
        request: &mut PageRequest,
    ) -> VmResult<()> {
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        if !self.contains(va) {
            return Err(VmError::OutOfRange);
        }
        let va = va.align_down_to_page();
        let object = self.live_object()?;
        let mut guard = ObjectGuard::lock(&*object, tree);

        let map_base = self.base();
        let st = self.state_ref(&guard);
        let (region_end, range_flags) = st.ranges.region_at(map_base, self.size(), va);
        if !range_flags.contains(flags.required_access()) {
            log::trace!(
                "vm: {:?} fault at {:#x} denied: {:?} not in {:?}",
                self.id,
                va,
                flags,
                range_flags
            );
            return Err(VmError::AccessDenied);
        }
        let offset = st.object_offset + (va - map_base);

        let arch = aspace.arch();
        let dirty_tracked = object.is_dirty_tracked();
        let max_pages = if flags.is_write() && dirty_tracked {
            1
        } else {
            let end = min(arch.next_page_table_boundary(va), region_end);
            let end = min(end, va.add_pages(fault_lookahead_pages()));
            bytes_to_pages(end - va)
        };
        let dirty = if flags.is_write() {
            DirtyAction::MarkDirty
        } else {
            DirtyAction::None
        };

        let info = match object.lookup_pages(
            &mut guard,
            offset,
            flags,
            dirty,
            max_pages,
            request,
            CallOrigin::Fault(self.id),
        ) {
            Ok(info) => info,
            Err(VmError::ShouldWait) => return Err(VmError::ShouldWait),
            Err(err) => {
                log::warn!("vm: {:?} fault at {:#x} lookup failed: {}", self.id, va, err);
                return Err(err);
            }
        };
        let pages = info.pages();
        if pages.is_empty() {
            return Err(VmError::NotFound);
        }

        let mut mmu = range_flags;
        if !flags.is_write() && !info.writable {
            mmu = mmu.without_write();
        }
        let sync_guest = |pa: Paddr| {
            if flags.contains(FaultFlags::GUEST) {
                arch.sync_cache(pa, page_size());
            }
        };

        // 逐页核对硬件：同一物理页保留，指向旧页的表项先拆除再重新映射
        let mut coalescer = MappingCoalescer::new(arch, mmu, ExistingEntryAction::Skip);
        for (i, &pa) in pages.iter().enumerate() {
            let page_va = va.add_pages(i);
            let step = match arch.query(page_va) {
                Err(VmError::NotFound) => Ok(true),
                Ok((existing, _)) if existing == pa => {
                    if i == 0 {
                        // 另一线程已映射同一页，只更新权限
                        hw("protect", page_va, arch.protect(page_va, 1, mmu)).map(|()| false)
                    } else {
                        Ok(false)
                    }
                }
                Ok(_) => hw("unmap", page_va, arch.unmap(page_va, 1, EnlargePolicy::No)).map(|_| true),
                Err(err) => Err(err),
            };
            let install = match step {
                Ok(install) => install,
                Err(err) => {
                    coalescer.abort();
                    return Err(err);
                }
            };
            if install {
                sync_guest(pa);
                if let Err(err) = coalescer.append(page_va, pa) {
                    coalescer.abort();
                    return hw("map", page_va, Err(err));
                }
            }
        }
        if let Err(err) = coalescer.flush() {
            return hw("map", va, Err(err));
        }
        log::trace!(
            "vm: {:?} fault at {:#x} {:?} served {} page(s) as {:?}",
            self.id,
            va,
            flags,
            pages.len(),
            mmu
        );
        Ok(())
    }

    /// 预先为 `[base + offset, base + offset + len)` 建立硬件映射
    ///
    /// 按权限子区间分段向后备对象批量查找。`commit` 为 true 时让对象分配缺失的页，
    /// 否则跳过不驻留的页。`ignore_existing` 为 false 时遇到已有页表项返回错误。
    /// 对脏页跟踪的对象不授予写权限。
    ///
    /// 失败时已经提交到页表的部分保持映射，缓冲中的页被丢弃。
    pub fn map_range(&self, offset: usize, len: usize, commit: bool, ignore_existing: bool) -> VmResult<()> {
        let mut request = PageRequest::new();
        let mut done = 0;
        loop {
            let aspace = self.aspace()?;
            let tree = aspace.lock();
            match self.map_range_locked(&aspace, &tree, offset, len, commit, ignore_existing, &mut done, &mut request)
            {
                Err(VmError::ShouldWait) => {
                    drop(tree);
                    request.wait()?;
                }
                result => return result,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_range_locked(
        &self,
        aspace: &AddressSpace,
        tree: &AspaceGuard<'_>,
        offset: usize,
        len: usize,
        commit: bool,
        ignore_existing: bool,
        done: &mut usize,
        request: &mut PageRequest,
    ) -> VmResult<()> {
        let map_base = self.base();
        let start = Vaddr(map_base.0.checked_add(offset).ok_or(VmError::OutOfRange)?);
        self.check_window(start, len)?;
        let object = self.live_object()?;
        let mut guard = ObjectGuard::lock(&*object, tree);

        let map_size = self.size();
        let end = start + len;
        let dirty_tracked = object.is_dirty_tracked();
        let existing = if ignore_existing {
            ExistingEntryAction::Skip
        } else {
            ExistingEntryAction::Error
        };
        let mut coalescer = MappingCoalescer::new(aspace.arch(), MmuFlags::empty(), existing);

        let mut va = start + *done;
        while va < end {
            let st = self.state_ref(&guard);
            let (region_end, region_flags) = st.ranges.region_at(map_base, map_size, va);
            let object_base = st.object_offset;
            let run_end = min(region_end, end);
            if !region_flags.has_permissions() {
                va = run_end;
                continue;
            }

            let mut mmu = region_flags;
            if dirty_tracked {
                mmu = mmu.without_write();
            }
            let fault = if !commit {
                FaultFlags::NO_ALLOC
            } else if region_flags.contains(MmuFlags::WRITE) && !dirty_tracked {
                FaultFlags::SOFTWARE | FaultFlags::WRITE
            } else {
                FaultFlags::SOFTWARE
            };
            let dirty = if fault.is_write() {
                DirtyAction::MarkDirty
            } else {
                DirtyAction::None
            };

            while va < run_end {
                let batch = min(bytes_to_pages(run_end - va), map_range_batch_pages());
                let lookup = object.lookup_pages(
                    &mut guard,
                    object_base + (va - map_base),
                    fault,
                    dirty,
                    batch,
                    request,
                    CallOrigin::External,
                );
                let info = match lookup {
                    Ok(info) => info,
                    Err(VmError::NotFound) if !commit => {
                        va = va.add_pages(1);
                        continue;
                    }
                    Err(VmError::ShouldWait) => {
                        if let Err(err) = coalescer.flush() {
                            coalescer.abort();
                            return Err(err);
                        }
                        *done = va - start;
                        return Err(VmError::ShouldWait);
                    }
                    Err(err) => {
                        coalescer.abort();
                        return Err(err);
                    }
                };

                let run_flags = if info.writable { mmu } else { mmu.without_write() };
                let mut step = coalescer.set_flags(run_flags);
                for (i, &pa) in info.pages().iter().enumerate() {
                    if step.is_err() {
                        break;
                    }
                    step = coalescer.append(va.add_pages(i), pa);
                }
                if let Err(err) = step {
                    coalescer.abort();
                    return Err(err);
                }
                va = va.add_pages(info.len().max(1));
            }
        }

        if let Err(err) = coalescer.flush() {
            coalescer.abort();
            return Err(err);
        }
        *done = len;
        log::trace!(
            "vm: {:?} map_range {:#x}+{:#x} commit={} done",
            self.id,
            offset,
            len,
            commit
        );
        Ok(())
    }

    /// 释放 `[offset, offset + len)`（相对映射起点）处的后备页
    ///
    /// 后备对象通过 [`Mapping::unmap_object_range`] 回调解除所有映射中的对应页表项。
    pub fn decommit_range(&self, offset: usize, len: usize) -> VmResult<()> {
        let aspace = self.aspace()?;
        let tree = aspace.lock();
        let map_base = self.base();
        self.check_window(Vaddr(map_base.0.checked_add(offset).ok_or(VmError::OutOfRange)?), len)?;
        let object = self.live_object()?;
        let mut guard = ObjectGuard::lock(&*object, &tree);
        let object_offset = self.state_ref(&guard).object_offset + offset;
        object.decommit_range(&mut guard, object_offset, len)?;
        log::debug!("vm: {:?} decommit {:#x}+{:#x}", self.id, offset, len);
        Ok(())
    }
}
