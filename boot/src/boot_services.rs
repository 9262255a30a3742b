//! Collaborators the boot sequence calls out to.
//!
//! Memory management, the system timer and the set of startup threads live
//! above this crate. The kernel binary fills in a [`BootServices`] table and
//! hands it to [`crate::boot`], which registers it before the first step.

use kestrel_abi::SpaceHandle;
use kestrel_core::task::ThreadEntry;

kestrel_lib::define_service! {
    boot => BootServices {
        /// Bring up physical memory. Runs before the CPU-init phase.
        pmem_init();
        /// Address space active on the boot CPU; seeds the core process.
        current_space() -> SpaceHandle;
        /// Start the system timer. Runs after platform-init.
        systime_init();
        /// Bodies of the threads queued before the scheduler starts.
        startup_threads() -> &'static [ThreadEntry];
    }
}
