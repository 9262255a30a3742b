//! Every subsystem's boot-time registrations, in run order per phase.

use kestrel_boot::idt;
use kestrel_boot::limine_protocol::{cmdline_value, init_limine_protocol};
use kestrel_core::extp::{ExtensionRegistry, ExtpError, Phase, RegistryBuilder};
use kestrel_lib::{KlogLevel, klog_info, klog_set_level, klog_warn, ports};

use crate::systime;

pub fn build_registry() -> Result<ExtensionRegistry, ExtpError> {
    let mut builder = RegistryBuilder::new();
    builder
        .register(Phase::EarlyKernelInit, "serial", serial_init, "serial console")?
        .register(Phase::EarlyKernelInit, "bootcfg", boot_config, "boot config")?
        .register(Phase::CpuInit, "idt", idt::idt_init, "interrupt descriptor table")?
        .register(Phase::PlatformInit, "pic", systime::pic_init, "legacy interrupt controllers")?
        .register(Phase::TimerInit, "systime", systime::systime_report, "system time")?
        .register(
            Phase::TimerDependent,
            "delay",
            systime::calibrate_delay,
            "delay loop calibration",
        )?;
    Ok(builder.build())
}

fn serial_init() {
    // SAFETY: COM1 is only programmed here, before any other CPU runs.
    unsafe { ports::serial_init_com1() };
}

/// Apply `klog=<level>` from the kernel command line.
fn boot_config() {
    let info = init_limine_protocol();
    let Some(value) = info.cmdline.and_then(|c| cmdline_value(c, "klog")) else {
        return;
    };
    match KlogLevel::parse(value) {
        Some(level) => {
            klog_set_level(level);
            klog_info!("bootcfg: log level {}", level.as_str());
        }
        None => klog_warn!("bootcfg: unknown log level '{}'", value),
    }
}
