use limine::BaseRevision;
use limine::memory_map::{Entry, EntryType};
use limine::request::{
    ExecutableFileRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
};
use spin::Once;

use kestrel_lib::{fatal, klog_debug, klog_info, klog_warn};

#[used]
#[unsafe(link_section = ".limine_requests_start_marker")]
static LIMINE_REQUESTS_START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static KERNEL_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests_end_marker")]
static LIMINE_REQUESTS_END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// What the loader told us, captured once during early boot.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootInfo {
    pub hhdm_offset: u64,
    pub total_memory: u64,
    pub usable_memory: u64,
    pub memmap_entries: usize,
    pub cmdline: Option<&'static str>,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

pub fn ensure_base_revision() {
    if !BASE_REVISION.is_supported() {
        fatal!("Limine base revision not supported");
    }
}

/// Read the loader responses. Later calls return the first capture.
pub fn init_limine_protocol() -> &'static BootInfo {
    BOOT_INFO.call_once(|| {
        let mut info = BootInfo::default();

        if let Some(hhdm) = HHDM_REQUEST.get_response() {
            info.hhdm_offset = hhdm.offset();
            klog_debug!("HHDM offset: {:#x}", hhdm.offset());
        }

        if let Some(memmap) = MEMMAP_REQUEST.get_response() {
            let entries = memmap.entries();
            for entry in entries {
                info.total_memory = info.total_memory.saturating_add(entry.length);
                if entry.entry_type == EntryType::USABLE {
                    info.usable_memory = info.usable_memory.saturating_add(entry.length);
                }
            }
            info.memmap_entries = entries.len();
            klog_debug!(
                "Memory map: {} entries, total {} MB, usable {} MB",
                entries.len(),
                info.total_memory / (1024 * 1024),
                info.usable_memory / (1024 * 1024)
            );
        } else {
            klog_warn!("No memory map available from Limine");
        }

        if let Some(kf_resp) = KERNEL_FILE_REQUEST.get_response() {
            let cmdline = kf_resp.file().string();
            if !cmdline.to_bytes().is_empty() {
                info.cmdline = cmdline.to_str().ok();
            }
            klog_debug!("Kernel cmdline: {}", info.cmdline.unwrap_or("<empty>"));
        }

        klog_info!("boot: loader info captured");
        info
    })
}

pub fn boot_info() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

/// Usable physical memory ranges reported by the loader.
pub fn usable_regions() -> impl Iterator<Item = &'static Entry> {
    MEMMAP_REQUEST
        .get_response()
        .map(|memmap| memmap.entries())
        .unwrap_or(&[])
        .iter()
        .copied()
        .filter(|entry| entry.entry_type == EntryType::USABLE)
}

/// Value of `key=value` on a whitespace separated command line. A bare
/// `key` yields an empty value; the last occurrence wins.
pub fn cmdline_value<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline
        .split_ascii_whitespace()
        .filter_map(|word| match word.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if word == key => Some(""),
            _ => None,
        })
        .last()
}
