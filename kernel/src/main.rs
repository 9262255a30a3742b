#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod extensions;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod pmem;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod startup;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod systime;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod entry {
    use core::panic::PanicInfo;

    use kestrel_boot::BootServices;
    use kestrel_core::extp;
    use kestrel_lib::fatal;

    use crate::{extensions, pmem, startup, systime};

    static SERVICES: BootServices = BootServices {
        pmem_init: pmem::pmem_init,
        current_space: pmem::current_space,
        systime_init: systime::systime_init,
        startup_threads: startup::startup_threads,
    };

    /// Limine jumps here on the boot CPU with delivery disabled.
    #[unsafe(no_mangle)]
    extern "C" fn kmain() -> ! {
        kestrel_boot::ensure_base_revision();

        let registry = match extensions::build_registry() {
            Ok(registry) => registry,
            Err(err) => fatal!("kernel: extension registry: {}", err),
        };
        if let Err(err) = extp::install(registry) {
            fatal!("kernel: {}", err);
        }

        kestrel_boot::boot(&SERVICES)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        kestrel_boot::panic_halt(info)
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    eprintln!("kernel: build for a bare-metal x86_64 target (target_os = \"none\")");
    std::process::exit(1);
}
