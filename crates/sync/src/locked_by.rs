//! 由外部锁保护的数据
//!
//! 某些数据在逻辑上属于 A，却由 B 的锁保护（例如映射的保护区间由
//! 后备对象的锁保护）。[`LockedBy`] 记录保护它的那把 [`RawSpinLock`]，
//! 只有出示持有该锁的 [`RawGuard`] 才能访问内部数据。

use core::cell::UnsafeCell;

use crate::raw_spin_lock::{RawGuard, RawSpinLock};

/// 由另一把锁保护的数据
///
/// 共享访问需要 `&RawGuard`，独占访问需要 `&mut RawGuard`，
/// 因此同一保护器下不会同时存在可变借用与其他借用。
pub struct LockedBy<T> {
    owner: usize,
    data: UnsafeCell<T>,
}

// SAFETY: 所有访问都要求持有 owner 锁
unsafe impl<T: Send> Send for LockedBy<T> {}
unsafe impl<T: Send> Sync for LockedBy<T> {}

impl<T> LockedBy<T> {
    /// 创建由 `owner` 保护的数据
    pub fn new(owner: &RawSpinLock, data: T) -> Self {
        Self {
            owner: owner as *const RawSpinLock as usize,
            data: UnsafeCell::new(data),
        }
    }

    /// 持有 owner 锁时共享访问数据
    ///
    /// # Panics
    /// 如果 `guard` 持有的不是 owner 锁，则 panic
    pub fn access<'a>(&'a self, guard: &'a RawGuard<'_>) -> &'a T {
        assert_eq!(
            guard.lock_addr(),
            self.owner,
            "LockedBy: guard does not hold the owning lock"
        );
        // SAFETY: 持有 owner 锁，且 guard 被共享借用，期间不可能有独占访问
        unsafe { &*self.data.get() }
    }

    /// 持有 owner 锁时独占访问数据
    ///
    /// # Panics
    /// 如果 `guard` 持有的不是 owner 锁，则 panic
    pub fn access_mut<'a>(&'a self, guard: &'a mut RawGuard<'_>) -> &'a mut T {
        assert_eq!(
            guard.lock_addr(),
            self.owner,
            "LockedBy: guard does not hold the owning lock"
        );
        // SAFETY: 持有 owner 锁，且 guard 被独占借用
        unsafe { &mut *self.data.get() }
    }
}

impl<T> core::fmt::Debug for LockedBy<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockedBy")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
