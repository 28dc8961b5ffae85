//! 地址模块
//!
//! 提供虚拟地址 [`Vaddr`]、物理地址 [`Paddr`] 两种新类型，
//! 以及与 usize 的转换 ([`UsizeConvert`]) 和页对齐操作 ([`AlignOps`])。
//!
//! 页大小来自 [`crate::vm_config`]。

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// 获取页大小
#[inline]
pub fn page_size() -> usize {
    crate::vm_config().page_size()
}

/// 检查字节数或地址是否按页对齐
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

/// 字节数转换为页数（要求已对齐）
#[inline]
pub fn bytes_to_pages(bytes: usize) -> usize {
    debug_assert!(is_page_aligned(bytes));
    bytes / page_size()
}

/// 页数转换为字节数
#[inline]
pub fn pages_to_bytes(pages: usize) -> usize {
    pages * page_size()
}

/// 与 usize 之间的转换
pub trait UsizeConvert: Copy {
    /// 转换为 usize
    fn as_usize(&self) -> usize;
    /// 从 usize 构造
    fn from_usize(value: usize) -> Self;
}

/// 页对齐操作
pub trait AlignOps: UsizeConvert {
    /// 是否按页对齐
    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.as_usize())
    }

    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        Self::from_usize(self.as_usize() & !(page_size() - 1))
    }

    /// 向上对齐到页边界
    fn align_up_to_page(self) -> Self {
        let mask = page_size() - 1;
        Self::from_usize((self.as_usize() + mask) & !mask)
    }
}

/// `impl_address!` 宏
/// ---------------------
/// 为地址新类型实现转换、对齐以及与 usize 的加减运算。
///
/// `addr - addr` 得到字节差（usize），`addr + usize` 得到新地址。
macro_rules! impl_address {
    ($type:ident) => {
        impl UsizeConvert for $type {
            fn as_usize(&self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl AlignOps for $type {}

        impl Add<usize> for $type {
            type Output = $type;

            fn add(self, rhs: usize) -> Self::Output {
                $type(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $type {
            fn add_assign(&mut self, rhs: usize) {
                self.0 += rhs;
            }
        }

        impl Sub<usize> for $type {
            type Output = $type;

            fn sub(self, rhs: usize) -> Self::Output {
                $type(self.0 - rhs)
            }
        }

        impl Sub<$type> for $type {
            type Output = usize;

            fn sub(self, rhs: $type) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($type), "({:#x})"), self.0)
            }
        }

        impl fmt::LowerHex for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// 虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vaddr(pub usize);
impl_address!(Vaddr);

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Paddr(pub usize);
impl_address!(Paddr);

impl Vaddr {
    /// 加上若干页
    pub fn add_pages(self, pages: usize) -> Self {
        self + pages_to_bytes(pages)
    }
}

impl Paddr {
    /// 加上若干页
    pub fn add_pages(self, pages: usize) -> Self {
        self + pages_to_bytes(pages)
    }
}
