//! 架构相关操作的 Mock 实现

use core::sync::atomic::{AtomicBool, Ordering};

use sync::ArchOps;

const SIE: usize = 0x2;

/// Mock 架构操作
pub struct MockArchOps {
    /// 模拟的中断使能状态
    pub interrupt_state: AtomicBool,
}

impl MockArchOps {
    /// 创建中断使能的实例
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
        }
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchOps for MockArchOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        if self.interrupt_state.swap(false, Ordering::SeqCst) {
            SIE
        } else {
            0
        }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state.store(flags & SIE != 0, Ordering::SeqCst);
    }

    fn interrupt_enable_bit(&self) -> usize {
        SIE
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();

/// 注册 [`MOCK_ARCH_OPS`]；重复调用注册的是同一实例
pub fn setup() {
    // SAFETY: 总是注册同一个静态实例
    unsafe { sync::register_arch_ops(&MOCK_ARCH_OPS) };
}
