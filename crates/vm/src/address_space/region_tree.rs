//! 按起始地址排序的映射集合

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;

use crate::address::Vaddr;
use crate::mapping::Mapping;

/// 地址空间中的映射树，以映射起始地址为键
///
/// 只在持有地址空间锁时访问。
#[derive(Debug, Default)]
pub struct RegionTree {
    mappings: BTreeMap<usize, Arc<Mapping>>,
}

impl RegionTree {
    /// 创建空树
    pub fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// 映射数量
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// 按地址顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mapping>> {
        self.mappings.values()
    }

    pub(crate) fn insert(&mut self, mapping: Arc<Mapping>) {
        let prev = self.mappings.insert(mapping.base().0, mapping);
        debug_assert!(prev.is_none());
    }

    pub(crate) fn remove(&mut self, base: Vaddr) -> Option<Arc<Mapping>> {
        self.mappings.remove(&base.0)
    }

    /// 映射起点从 `old` 移到 `new`
    pub(crate) fn rekey(&mut self, old: Vaddr, new: Vaddr) {
        if let Some(mapping) = self.mappings.remove(&old.0) {
            self.mappings.insert(new.0, mapping);
        }
    }

    /// 包含 `va` 的映射
    pub fn find(&self, va: Vaddr) -> Option<&Arc<Mapping>> {
        self.mappings
            .range(..=va.0)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(va))
    }

    /// `[base, base + size)` 是否与已有映射重叠
    pub fn overlaps(&self, base: Vaddr, size: usize) -> bool {
        let end = base + size;
        if let Some((_, m)) = self.mappings.range(..end.0).next_back() {
            return m.end() > base;
        }
        false
    }

    /// 起始地址在 `base` 之前的最近映射
    pub fn left_neighbor(&self, base: Vaddr) -> Option<&Arc<Mapping>> {
        self.mappings.range(..base.0).next_back().map(|(_, m)| m)
    }

    /// 起始地址在 `base` 之后的最近映射
    pub fn right_neighbor(&self, base: Vaddr) -> Option<&Arc<Mapping>> {
        self.mappings
            .range(base.0.saturating_add(1)..)
            .next()
            .map(|(_, m)| m)
    }
}
