//! 原始自旋锁
//!
//! [`RawSpinLock`] 实现 [`lock_api::RawMutex`]，获取时禁用本地中断，
//! 释放时恢复获取前的中断状态。嵌套持有多把锁时必须按获取的逆序释放。

use core::{
    hint,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use lock_api::{GuardNoSend, RawMutex};

use crate::intr_guard::IntrGuard;

/// 自旋锁结构体，提供互斥访问临界区的能力。
///
/// 不可重入 (即同一上下文中不能嵌套获取同一把锁)。
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
    /// 获取锁之前的中断状态，仅在持有锁期间有效
    saved_intr: AtomicUsize,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
            saved_intr: AtomicUsize::new(0),
        }
    }

    /// 获取锁并返回 RAII 保护器。
    pub fn guard(&self) -> RawGuard<'_> {
        RawMutex::lock(self);
        RawGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// 尝试获取锁，失败时立即返回 None。
    pub fn try_guard(&self) -> Option<RawGuard<'_>> {
        if RawMutex::try_lock(self) {
            Some(RawGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: lock 标志通过 Acquire/Release 的 CAS 保证互斥
unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let guard = IntrGuard::new();
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        self.saved_intr.store(guard.into_flags(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let guard = IntrGuard::new();
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_intr.store(guard.into_flags(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_intr.load(Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
        // SAFETY: flags 由 lock/try_lock 保存，每次持有只恢复一次
        unsafe { IntrGuard::restore(flags) };
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

/// 直接持有一把 [`RawSpinLock`] 的 RAII 保护器
///
/// 不保护任何数据本身；配合 [`crate::LockedBy`] 证明"当前持有某把锁"。
pub struct RawGuard<'a> {
    lock: &'a RawSpinLock,
    _not_send: PhantomData<*const ()>,
}

impl RawGuard<'_> {
    /// 检查此保护器是否持有给定的锁
    pub fn owns(&self, lock: &RawSpinLock) -> bool {
        core::ptr::eq(self.lock, lock)
    }

    pub(crate) fn lock_addr(&self) -> usize {
        self.lock as *const RawSpinLock as usize
    }
}

impl Drop for RawGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: RawGuard 只在成功获取锁后构造
        unsafe { self.lock.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_arch;

    #[test]
    fn test_guard_releases_on_drop() {
        test_arch::setup();
        let lock = RawSpinLock::new();
        {
            let guard = lock.guard();
            assert!(lock.is_locked());
            assert!(guard.owns(&lock));
            assert!(lock.try_guard().is_none());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_guard_identity() {
        test_arch::setup();
        let a = RawSpinLock::new();
        let b = RawSpinLock::new();
        let ga = a.guard();
        assert!(ga.owns(&a));
        assert!(!ga.owns(&b));
        let gb = b.try_guard();
        assert!(gb.is_some());
    }
}
