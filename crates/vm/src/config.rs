//! 映射管理配置 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

/// 单次页查找、页合并缓冲的上限（页数）
pub const MAX_LOOKUP_PAGES: usize = 16;

/// 映射管理配置常量
///
/// 内核可以实现此 trait 并通过 [`register_config`] 注册；
/// 未注册时使用 [`DefaultVmConfig`]。
pub trait VmConfig: Send + Sync {
    /// 页大小（必须是 2 的幂，通常为 4096）
    fn page_size(&self) -> usize {
        4096
    }

    /// 缺页时最多预取的页数（含触发缺页的页）
    fn fault_lookahead_pages(&self) -> usize {
        MAX_LOOKUP_PAGES
    }

    /// `map_range` 每次向后备对象查询的页数
    fn map_range_batch_pages(&self) -> usize {
        MAX_LOOKUP_PAGES
    }
}

/// 默认配置
#[derive(Debug, Default)]
pub struct DefaultVmConfig;

impl VmConfig for DefaultVmConfig {}

static DEFAULT_CONFIG: DefaultVmConfig = DefaultVmConfig;

static CONFIG_DATA: AtomicUsize = AtomicUsize::new(0);
static CONFIG_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册配置实现
///
/// # Safety
/// 必须在单线程环境下、任何映射创建之前调用，且只能调用一次
pub unsafe fn register_config(config: &'static dyn VmConfig) {
    debug_assert!(config.page_size().is_power_of_two());
    let ptr = config as *const dyn VmConfig;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn VmConfig, (usize, usize)>(ptr) };
    CONFIG_VTABLE.store(vtable, Ordering::Release);
    CONFIG_DATA.store(data, Ordering::Release);
}

/// 获取当前配置；未注册时返回默认配置
#[inline]
pub fn vm_config() -> &'static dyn VmConfig {
    let data = CONFIG_DATA.load(Ordering::Acquire);
    if data == 0 {
        return &DEFAULT_CONFIG;
    }
    let vtable = CONFIG_VTABLE.load(Ordering::Acquire);
    // SAFETY: 重组 register_config 存入的 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn VmConfig>((data, vtable)) }
}

/// 缺页预取上限，截断到 [`MAX_LOOKUP_PAGES`]
pub(crate) fn fault_lookahead_pages() -> usize {
    vm_config().fault_lookahead_pages().clamp(1, MAX_LOOKUP_PAGES)
}

/// `map_range` 批量上限，截断到 [`MAX_LOOKUP_PAGES`]
pub(crate) fn map_range_batch_pages() -> usize {
    vm_config().map_range_batch_pages().clamp(1, MAX_LOOKUP_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = vm_config();
        assert_eq!(cfg.page_size(), 4096);
        assert!(fault_lookahead_pages() <= MAX_LOOKUP_PAGES);
        assert!(map_range_batch_pages() >= 1);
    }
}
