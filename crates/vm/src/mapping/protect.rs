//! 修改权限与解除映射

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::{Mapping, fatal};
use crate::address::{Vaddr, bytes_to_pages};
use crate::address_space::{AddressSpace, AspaceGuard};
use crate::arch::EnlargePolicy;
use crate::error::{VmError, VmResult};
use crate::flags::{MappingFlags, MmuFlags};
use crate::object::{MappingRef, ObjectGuard};

impl Mapping {
    /// 把 `[base, base + size)` 的权限改为 `new_flags`
    ///
    /// 只对权限实际变化、且原先存在硬件映射的子区间修改页表：新权限不授予任何访问时
    /// 解除映射，否则去掉写权限后重新保护。写权限留待写缺页时授予。
    ///
    /// # Errors
    /// - [`VmError::InvalidArgs`]：未对齐、长度为零，或试图修改缓存属性
    /// - [`VmError::BadState`]：映射不处于 Alive
    /// - [`VmError::OutOfRange`]：窗口不在映射内
    /// - [`VmError::AccessDenied`]：无法识别的权限组合、超出映射的权限上限，或修改常驻映射
    /// - [`VmError::NoMemory`]：断点预留失败（此时没有任何修改）
    ///
    /// # Panics
    /// 开始修改页表后硬件操作失败
    pub fn protect(&self, base: Vaddr, size: usize, new_flags: MmuFlags) -> VmResult<()> {
        let aspace = self.aspace()?;
        let mut tree = aspace.lock();
        self.check_window(base, size)?;
        let object = self.live_object()?;

        {
            let mut guard = ObjectGuard::lock(&*object, &tree);
            let map_base = self.base();
            let map_size = self.size();
            let st = self.state_mut(&mut guard);

            if new_flags.cache_policy() != st.ranges.first_region_flags().cache_policy() {
                return Err(VmError::InvalidArgs);
            }
            if !new_flags.is_valid_combination() || !self.flags.permits(new_flags) {
                return Err(VmError::AccessDenied);
            }
            if self.flags.contains(MappingFlags::GUARDED)
                && st.ranges.regions(base, size).any(|(_, _, f)| f != new_flags)
            {
                return Err(VmError::AccessDenied);
            }

            let arch = aspace.arch();
            st.ranges
                .plan_update(map_base, map_size, base, size, new_flags, aspace.node_allocator())?
                .commit(|region_base, region_len, old| {
                    if old == new_flags || !old.has_permissions() {
                        return;
                    }
                    let pages = bytes_to_pages(region_len);
                    if new_flags.has_permissions() {
                        if let Err(err) = arch.protect(region_base, pages, new_flags.without_write()) {
                            fatal("protect", region_base, err);
                        }
                    } else if let Err(err) = arch.unmap(region_base, pages, EnlargePolicy::No) {
                        fatal("unmap", region_base, err);
                    }
                });
            debug_assert!(st.ranges.is_consistent(map_base, map_size));
        }

        log::trace!(
            "vm: {:?} protect {:#x}+{:#x} -> {:?}",
            self.id,
            base,
            size,
            new_flags
        );
        self.try_merge_neighbors(&aspace, &mut tree);
        Ok(())
    }

    /// 解除 `[base, base + size)` 的映射
    ///
    /// 覆盖整个映射时销毁映射；触及一端时收缩映射；位于内部时把右侧剩余部分
    /// 拆分为新的映射并插入地址空间。
    ///
    /// # Errors
    /// - [`VmError::InvalidArgs`] / [`VmError::BadState`] / [`VmError::OutOfRange`]：同 [`Self::protect`]
    /// - [`VmError::AccessDenied`]：部分解除常驻映射
    /// - [`VmError::NoMemory`]：拆分的断点预留失败（此时没有任何修改）
    pub fn unmap(&self, base: Vaddr, size: usize) -> VmResult<()> {
        let aspace = self.aspace()?;
        let mut tree = aspace.lock();
        self.check_window(base, size)?;

        let map_base = self.base();
        let map_end = self.end();
        let end = base + size;
        if base == map_base && end == map_end {
            if self.flags.contains(MappingFlags::GUARDED) {
                return Err(VmError::AccessDenied);
            }
            return self.destroy_locked(&aspace, &mut tree);
        }
        if self.flags.contains(MappingFlags::GUARDED) {
            return Err(VmError::AccessDenied);
        }

        if base == map_base {
            self.trim_front(&aspace, &mut tree, end)
        } else if end == map_end {
            self.trim_back(&aspace, &mut tree, base)
        } else {
            self.split(&aspace, &mut tree, base, end)
        }
    }

    /// 解除 `[base, new_base)`，映射从 `new_base` 开始
    fn trim_front(&self, aspace: &AddressSpace, tree: &mut AspaceGuard<'_>, new_base: Vaddr) -> VmResult<()> {
        let object = self.live_object()?;
        let old_base = self.base();
        let delta = new_base - old_base;
        {
            let mut guard = ObjectGuard::lock(&*object, tree);
            if let Err(err) = aspace
                .arch()
                .unmap(old_base, bytes_to_pages(delta), EnlargePolicy::No)
            {
                fatal("unmap", old_base, err);
            }
            let st = self.state_mut(&mut guard);
            st.object_offset += delta;
            st.ranges.discard_below(new_base);
            st.generation += 1;
            self.set_range(new_base, self.size() - delta);
        }
        tree.rekey(old_base, new_base);
        log::debug!("vm: {:?} trimmed front to {:#x}", self.id, new_base);
        Ok(())
    }

    /// 解除 `[new_end, end)`，映射在 `new_end` 结束
    fn trim_back(&self, aspace: &AddressSpace, tree: &mut AspaceGuard<'_>, new_end: Vaddr) -> VmResult<()> {
        let object = self.live_object()?;
        let map_base = self.base();
        let removed = self.end() - new_end;
        let mut guard = ObjectGuard::lock(&*object, tree);
        if let Err(err) = aspace
            .arch()
            .unmap(new_end, bytes_to_pages(removed), EnlargePolicy::No)
        {
            fatal("unmap", new_end, err);
        }
        let st = self.state_mut(&mut guard);
        st.ranges.discard_above(new_end);
        st.generation += 1;
        self.size.store(new_end - map_base, Ordering::Release);
        log::debug!("vm: {:?} trimmed back to {:#x}", self.id, new_end);
        Ok(())
    }

    /// 解除内部的 `[hole_base, hole_end)`，右侧剩余部分成为新的映射
    fn split(
        &self,
        aspace: &AddressSpace,
        tree: &mut AspaceGuard<'_>,
        hole_base: Vaddr,
        hole_end: Vaddr,
    ) -> VmResult<()> {
        let object = self.live_object()?;
        let map_base = self.base();
        let map_end = self.end();

        let right = {
            let mut guard = ObjectGuard::lock(&*object, tree);
            let reserve = self
                .state_ref(&guard)
                .ranges
                .prepare_split(hole_end, aspace.node_allocator())?;

            if let Err(err) = aspace.arch().unmap(
                hole_base,
                bytes_to_pages(hole_end - hole_base),
                EnlargePolicy::No,
            ) {
                fatal("unmap", hole_base, err);
            }

            let st = self.state_mut(&mut guard);
            let right_ranges = st.ranges.split_at(reserve);
            st.ranges.discard_above(hole_base);
            st.generation += 1;
            let right_offset = st.object_offset + (hole_end - map_base);
            self.size.store(hole_base - map_base, Ordering::Release);

            let right = Arc::new(Mapping::new(
                self.aspace.clone(),
                object.clone(),
                hole_end,
                map_end - hole_end,
                right_offset,
                right_ranges,
                self.flags,
            ));
            object.add_mapping(&mut guard, MappingRef::new(&right));
            tree.insert(right.clone());
            right.mark_alive();
            right
        };
        right.mergeable.store(true, Ordering::Release);

        log::debug!(
            "vm: {:?} split at {:#x}, right part {:?} at {:#x}",
            self.id,
            hole_base,
            right.id,
            hole_end
        );
        right.try_merge_neighbors(aspace, tree);
        Ok(())
    }
}
