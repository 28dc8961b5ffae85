//! 权限、缺页与映射标志

use bitflags::bitflags;

bitflags! {
    /// 硬件页表权限与缓存属性
    ///
    /// 低三位是访问权限，`CACHE_MASK` 覆盖的两位编码 [`CachePolicy`]。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MmuFlags: u32 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXECUTE = 1 << 2;
        /// 用户态可访问
        const USER = 1 << 3;
        /// 不可缓存
        const UNCACHED = 1 << 4;
        /// 设备内存（不可缓存、强序）
        const UNCACHED_DEVICE = 2 << 4;
        /// 写合并
        const WRITE_COMBINING = 3 << 4;
        /// 缓存属性字段
        const CACHE_MASK = 3 << 4;
    }
}

/// 缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// 普通可缓存内存
    #[default]
    Cached,
    /// 不可缓存
    Uncached,
    /// 设备内存
    UncachedDevice,
    /// 写合并
    WriteCombining,
}

impl MmuFlags {
    /// 全部访问权限位
    pub const PERMS: MmuFlags = MmuFlags::READ.union(MmuFlags::WRITE).union(MmuFlags::EXECUTE);

    /// 仅保留访问权限位
    pub fn perms(self) -> MmuFlags {
        self & Self::PERMS
    }

    /// 是否授予任何访问权限；不授予时该区间不应存在硬件映射
    pub fn has_permissions(self) -> bool {
        self.intersects(Self::PERMS)
    }

    /// 缓存策略
    pub fn cache_policy(self) -> CachePolicy {
        match (self & Self::CACHE_MASK).bits() >> 4 {
            0 => CachePolicy::Cached,
            1 => CachePolicy::Uncached,
            2 => CachePolicy::UncachedDevice,
            _ => CachePolicy::WriteCombining,
        }
    }

    /// 替换缓存策略
    pub fn with_cache_policy(self, policy: CachePolicy) -> MmuFlags {
        let cache = match policy {
            CachePolicy::Cached => MmuFlags::empty(),
            CachePolicy::Uncached => MmuFlags::UNCACHED,
            CachePolicy::UncachedDevice => MmuFlags::UNCACHED_DEVICE,
            CachePolicy::WriteCombining => MmuFlags::WRITE_COMBINING,
        };
        (self - Self::CACHE_MASK) | cache
    }

    /// 是否是可识别的权限组合（可写必须可读）
    pub fn is_valid_combination(self) -> bool {
        !self.contains(MmuFlags::WRITE) || self.contains(MmuFlags::READ)
    }

    /// 去掉写权限
    pub fn without_write(self) -> MmuFlags {
        self - MmuFlags::WRITE
    }
}

bitflags! {
    /// 缺页原因
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultFlags: u32 {
        /// 写访问
        const WRITE = 1 << 0;
        /// 取指
        const INSTRUCTION = 1 << 1;
        /// 来自用户态
        const USER = 1 << 2;
        /// 软件发起（map_range 提交），而非硬件缺页
        const SOFTWARE = 1 << 4;
        /// 客户机物理地址映射，暴露前需要同步缓存
        const GUEST = 1 << 5;
        /// 只返回已驻留的页，不分配
        const NO_ALLOC = 1 << 6;
    }
}

impl FaultFlags {
    /// 此次访问需要的权限
    pub fn required_access(self) -> MmuFlags {
        let mut need = if self.contains(FaultFlags::INSTRUCTION) {
            MmuFlags::EXECUTE
        } else if self.contains(FaultFlags::WRITE) {
            MmuFlags::WRITE
        } else {
            MmuFlags::READ
        };
        if self.contains(FaultFlags::USER) {
            need |= MmuFlags::USER;
        }
        need
    }

    /// 是否写缺页
    pub fn is_write(self) -> bool {
        self.contains(FaultFlags::WRITE)
    }
}

bitflags! {
    /// 映射的顶层标志
    ///
    /// `CAN_*` 是 protect 能授予的权限上限；`GUARDED` 标记常驻映射，
    /// 拒绝销毁、部分解除映射和修改权限。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MappingFlags: u32 {
        /// 允许可读
        const CAN_READ = 1 << 0;
        /// 允许可写
        const CAN_WRITE = 1 << 1;
        /// 允许可执行
        const CAN_EXECUTE = 1 << 2;
        /// 常驻映射（如 vDSO）
        const GUARDED = 1 << 3;
    }
}

impl MappingFlags {
    /// 允许全部权限的普通映射
    pub const RWX: MappingFlags = MappingFlags::CAN_READ
        .union(MappingFlags::CAN_WRITE)
        .union(MappingFlags::CAN_EXECUTE);

    /// 检查 `flags` 的权限是否在上限之内
    pub fn permits(self, flags: MmuFlags) -> bool {
        (!flags.contains(MmuFlags::READ) || self.contains(MappingFlags::CAN_READ))
            && (!flags.contains(MmuFlags::WRITE) || self.contains(MappingFlags::CAN_WRITE))
            && (!flags.contains(MmuFlags::EXECUTE) || self.contains(MappingFlags::CAN_EXECUTE))
    }
}
