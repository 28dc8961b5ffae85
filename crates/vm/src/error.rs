//! 映射管理错误类型
//!
//! 可通过 [`VmError::to_errno()`] 转换为系统调用错误码。

use core::fmt;

/// 映射管理错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 参数无效：未对齐、长度为零、非法或试图修改缓存属性的标志 (-EINVAL)
    InvalidArgs,
    /// 映射不处于 Alive 状态 (-EBADF)
    BadState,
    /// 请求的窗口不在映射范围内 (-ERANGE)
    OutOfRange,
    /// 权限检查失败，或受保护映射拒绝操作 (-EACCES)
    AccessDenied,
    /// 断点节点或页表分配失败 (-ENOMEM)
    NoMemory,
    /// 地址处没有映射或页 (-ENOENT)
    NotFound,
    /// 地址范围已被占用 (-EEXIST)
    AlreadyExists,
    /// 后备对象需要等待页请求完成后重试 (-EAGAIN)
    ///
    /// 只在后备对象与映射之间传递，不会从 `page_fault`/`map_range` 返回。
    ShouldWait,
}

impl VmError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        match self {
            VmError::NotFound => -2,
            VmError::BadState => -9,
            VmError::ShouldWait => -11,
            VmError::NoMemory => -12,
            VmError::AccessDenied => -13,
            VmError::AlreadyExists => -17,
            VmError::InvalidArgs => -22,
            VmError::OutOfRange => -34,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::InvalidArgs => "invalid arguments",
            VmError::BadState => "mapping is not alive",
            VmError::OutOfRange => "range outside mapping",
            VmError::AccessDenied => "access denied",
            VmError::NoMemory => "out of memory",
            VmError::NotFound => "not found",
            VmError::AlreadyExists => "already exists",
            VmError::ShouldWait => "should wait",
        };
        f.write_str(msg)
    }
}

/// 映射管理操作的结果类型
pub type VmResult<T> = Result<T, VmError>;
