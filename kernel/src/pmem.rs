use kestrel_abi::SpaceHandle;
use kestrel_boot::limine_protocol::{init_limine_protocol, usable_regions};
use kestrel_lib::{fatal, klog_info};
use x86_64::registers::control::Cr3;

const FRAME_SIZE: u64 = 4096;

pub fn pmem_init() {
    let info = init_limine_protocol();
    let frames: u64 = usable_regions().map(|entry| entry.length / FRAME_SIZE).sum();
    if frames == 0 {
        fatal!("pmem: no usable physical memory");
    }
    klog_info!(
        "pmem: {} frames usable ({} MB of {} MB), hhdm {:#x}",
        frames,
        info.usable_memory / (1024 * 1024),
        info.total_memory / (1024 * 1024),
        info.hhdm_offset
    );
}

/// Root page table the boot CPU is running on.
pub fn current_space() -> SpaceHandle {
    let (root, _) = Cr3::read();
    SpaceHandle(root.start_address().as_u64())
}
