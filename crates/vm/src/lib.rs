//! 虚拟内存映射管理
//!
//! 管理地址空间中由后备内存对象支撑的连续映射：记录映射内各子区间的权限，
//! 处理缺页，并让硬件页表与映射的逻辑状态保持一致。
//!
//! # 架构解耦
//!
//! 通过 trait 与外部组件解耦：
//! - [`ArchAddressSpace`]: 架构页表的映射、保护、解除与查询
//! - [`BackingObject`]: 提供物理页的后备内存对象
//! - [`VmConfig`]: 页大小与批量上限
//!
//! 锁原语来自 `sync` crate，使用前内核必须注册 `sync::ArchOps`。
//!
//! # 锁顺序
//!
//! 先取地址空间锁（[`AddressSpace::lock`]），再取对象锁（[`ObjectGuard::lock`]）。
//! 后备对象发起的回调只持有对象锁，不得再获取地址空间锁。

#![no_std]

extern crate alloc;

mod config;
mod error;

pub mod address;
pub mod address_space;
pub mod arch;
pub mod coalescer;
pub mod flags;
pub mod mapping;
pub mod object;
pub mod protection;

pub use address::{Paddr, Vaddr};
pub use address_space::{AddressSpace, AspaceGuard, RegionTree};
pub use arch::{ArchAddressSpace, EnlargePolicy, ExistingEntryAction};
pub use coalescer::MappingCoalescer;
pub use config::{DefaultVmConfig, MAX_LOOKUP_PAGES, VmConfig, register_config, vm_config};
pub use error::{VmError, VmResult};
pub use flags::{CachePolicy, FaultFlags, MappingFlags, MmuFlags};
pub use mapping::{Mapping, MappingId, MappingState};
pub use object::{
    BackingObject, CallOrigin, DirtyAction, LookupInfo, MappingRef, ObjectGuard, PageRequest, PageWaiter,
};
pub use protection::{Breakpoint, HeapNodes, NodeAllocator, ProtectionRangeSet, Walk};
