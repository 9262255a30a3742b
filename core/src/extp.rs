//! Extension point registry.
//!
//! Subsystems contribute initialization callbacks to one of five ordered
//! boot phases. Registrations are collected into a [`RegistryBuilder`]
//! before boot, frozen into an [`ExtensionRegistry`], and installed once as
//! the process-wide table. After that the table is read-only.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use kestrel_abi::MAX_EXTENSIONS_PER_PHASE;
use kestrel_lib::klog::{self, KlogLevel};
use kestrel_lib::{klog_debug, klog_info};
use spin::Once;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Before memory is available. Callbacks must not allocate.
    EarlyKernelInit = 0,
    CpuInit = 1,
    PlatformInit = 2,
    TimerInit = 3,
    /// Subsystems that need a running system timer.
    TimerDependent = 4,
}

impl Phase {
    pub const COUNT: usize = 5;

    /// Every phase, in boot order.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::EarlyKernelInit,
        Phase::CpuInit,
        Phase::PlatformInit,
        Phase::TimerInit,
        Phase::TimerDependent,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Phase::EarlyKernelInit => "early_kernel_init",
            Phase::CpuInit => "cpu_init",
            Phase::PlatformInit => "platform_init",
            Phase::TimerInit => "timer_init",
            Phase::TimerDependent => "timer_dependent",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One registration: a tag, a callback and a human-readable description.
#[derive(Clone, Copy)]
pub struct Extension {
    pub tag: &'static str,
    pub callback: fn(),
    pub description: &'static str,
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("tag", &self.tag)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtpError {
    /// The phase already holds `MAX_EXTENSIONS_PER_PHASE` registrations.
    PhaseFull(Phase),
    /// The process-wide registry was installed before.
    AlreadyInstalled,
    /// No process-wide registry has been installed.
    NotInstalled,
}

impl fmt::Display for ExtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtpError::PhaseFull(phase) => write!(f, "extension phase {} is full", phase),
            ExtpError::AlreadyInstalled => f.write_str("extension registry already installed"),
            ExtpError::NotInstalled => f.write_str("extension registry not installed"),
        }
    }
}

#[derive(Clone, Copy)]
struct PhaseList {
    entries: [Option<Extension>; MAX_EXTENSIONS_PER_PHASE],
    len: usize,
}

impl PhaseList {
    const EMPTY: Self = Self {
        entries: [None; MAX_EXTENSIONS_PER_PHASE],
        len: 0,
    };

    fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.entries[..self.len].iter().flatten()
    }
}

/// Collects registrations before boot.
pub struct RegistryBuilder {
    phases: [PhaseList; Phase::COUNT],
}

impl RegistryBuilder {
    pub const fn new() -> Self {
        Self {
            phases: [PhaseList::EMPTY; Phase::COUNT],
        }
    }

    /// Append a registration to `phase`. Registration order is run order.
    pub fn register(
        &mut self,
        phase: Phase,
        tag: &'static str,
        callback: fn(),
        description: &'static str,
    ) -> Result<&mut Self, ExtpError> {
        let list = &mut self.phases[phase.index()];
        if list.len >= MAX_EXTENSIONS_PER_PHASE {
            return Err(ExtpError::PhaseFull(phase));
        }
        list.entries[list.len] = Some(Extension {
            tag,
            callback,
            description,
        });
        list.len += 1;
        Ok(self)
    }

    pub fn build(self) -> ExtensionRegistry {
        ExtensionRegistry {
            phases: self.phases,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen registrations, one ordered list per phase.
pub struct ExtensionRegistry {
    phases: [PhaseList; Phase::COUNT],
}

impl ExtensionRegistry {
    /// Call `invoker` for every registration of `phase`, in registration
    /// order. Re-iterating a phase is allowed.
    pub fn iterate(&self, phase: Phase, mut invoker: impl FnMut(&Extension)) {
        for ext in self.phases[phase.index()].iter() {
            invoker(ext);
        }
    }

    pub fn len(&self, phase: Phase) -> usize {
        self.phases[phase.index()].len
    }

    pub fn is_empty(&self, phase: Phase) -> bool {
        self.len(phase) == 0
    }

    pub fn total(&self) -> usize {
        self.phases.iter().map(|p| p.len).sum()
    }
}

/// Log the description, then run the callback.
pub fn standard_invoker(ext: &Extension) {
    klog_info!("initializing {}", ext.description);
    klog_debug!("    {}: {}", ext.tag, ext.description);
    (ext.callback)();
}

// -- Process-wide registry ----------------------------------------------------

static REGISTRY: Once<ExtensionRegistry> = Once::new();
static DONE_STEPS: AtomicUsize = AtomicUsize::new(0);

/// Install the process-wide registry. Only the first call succeeds.
pub fn install(registry: ExtensionRegistry) -> Result<(), ExtpError> {
    let mut installed = false;
    REGISTRY.call_once(|| {
        installed = true;
        registry
    });
    if !installed {
        return Err(ExtpError::AlreadyInstalled);
    }
    Ok(())
}

/// Iterate `phase` of the process-wide registry.
pub fn iterate(phase: Phase, invoker: impl FnMut(&Extension)) -> Result<(), ExtpError> {
    let registry = REGISTRY.get().ok_or(ExtpError::NotInstalled)?;
    registry.iterate(phase, invoker);
    Ok(())
}

/// Run every registration of `phase` with the standard invoker and report
/// progress.
pub fn run_phase(phase: Phase) -> Result<(), ExtpError> {
    let registry = REGISTRY.get().ok_or(ExtpError::NotInstalled)?;
    if klog::is_enabled_level(KlogLevel::Debug) {
        klog::log_args(
            KlogLevel::Debug,
            format_args!("[boot:init] phase start -> {}", phase),
        );
    }
    let total = registry.total().max(1);
    registry.iterate(phase, |ext| {
        standard_invoker(ext);
        let done = DONE_STEPS.fetch_add(1, Ordering::Relaxed) + 1;
        klog_debug!("[boot:init] progress {}%", (done * 100 / total).min(100));
    });
    klog_info!("[boot:init] phase complete -> {}", phase);
    Ok(())
}
