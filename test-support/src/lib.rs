//! 测试支持 crate
//!
//! 提供 Mock 实现和测试工具

#![no_std]

extern crate alloc;

pub mod mock;

/// 注册测试用的架构操作，使用任何锁之前调用
pub fn setup() {
    mock::arch::setup();
}
