//! 自旋锁封装
//!
//! 以 [`RawSpinLock`] 作为 `lock_api` 的原始锁，提供对数据的互斥访问。
//!
//! # 示例
//! ```ignore
//! let lock = SpinLock::new(0);
//! {
//!     let mut guard = lock.lock(); // 获取锁
//!     *guard += 1; // 访问和修改数据
//! } // 离开作用域，自动释放锁
//! ```
//!
//! # 注意
//! SpinLock 不是可重入的。当持有锁时，尝试再次获取锁将导致死锁。
//! SpinLock 通过禁用中断来保护临界区，因此在持有锁时应避免长时间运行的操作。

use crate::raw_spin_lock::RawSpinLock;

/// 提供对数据的互斥访问的自旋锁
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// SpinLock 的 RAII 保护器，离开作用域时自动释放锁
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_arch;

    #[test]
    fn test_spin_lock_mutates_data() {
        test_arch::setup();
        let lock = SpinLock::new(1usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_nested_locks_release_in_reverse_order() {
        test_arch::setup();
        let outer = SpinLock::new(1u32);
        let inner = SpinLock::new(2u32);
        let g1 = outer.lock();
        let g2 = inner.lock();
        assert_eq!(*g1 + *g2, 3);
        drop(g2);
        assert!(inner.try_lock().is_some());
        assert!(outer.is_locked());
        drop(g1);
        assert!(!outer.is_locked());
    }
}
