//! Mock 实现模块
//!
//! 提供架构和虚拟内存子系统的 Mock 实现，用于测试

pub mod arch;
pub mod vm;
