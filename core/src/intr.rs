//! Interrupt controller: delivery nesting and gate dispatch.
//!
//! Delivery is controlled through a per-CPU nesting counter. `disable()`
//! increments it and turns delivery off on the 0 -> 1 edge, `enable()`
//! decrements it and turns delivery back on on the 1 -> 0 edge. Delivery is
//! physically on iff the counter is zero. Every CPU starts at depth 1: the
//! boot path runs with delivery off and releases that scope explicitly.
//!
//! Each gate carries an ordered chain of handlers. Dispatch walks the chain
//! in registration order and stops at the first handler that claims the
//! interrupt. The chain is copied out under the table lock and run outside
//! it, so a handler may add or remove handlers (including itself) without
//! deadlocking and without tearing the walk in progress.
//!
//! Misuse and unhandled-gate policy:
//! - `enable()` at depth zero is logged at error level, counted per CPU and
//!   otherwise ignored. The counter saturates at zero.
//! - An unhandled fault gate (CPU exceptions other than #DB, NMI and #BP)
//!   halts the kernel. Unhandled trap gates are logged every time, unhandled
//!   device gates only the first time until a handler is registered again.
//! - Trap gates can arrive while this CPU holds the table lock (an NMI is not
//!   masked by a disable scope). Their dispatch only tries the lock; a
//!   contended attempt is counted and treated as unhandled.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kestrel_abi::{Gate, GateClass, MAX_CPUS, MAX_HANDLERS_PER_GATE, NUM_GATES, exception_name};
use kestrel_lib::{cpu, fatal, klog_debug, klog_error, klog_warn, pcr};
use spin::{Mutex, MutexGuard};

/// Depth every CPU starts at.
pub const BOOT_DEPTH: u32 = 1;

/// Snapshot of the interrupted context handed to handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapContext {
    pub gate: Gate,
    pub error_code: Option<u64>,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapContext {
    pub const fn new(gate: Gate) -> Self {
        Self {
            gate,
            error_code: None,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }
}

/// Interrupt handler. Returns `true` if it handled the interrupt and the
/// chain should stop, `false` to pass it on to the next handler.
pub type IntrHandler = fn(&mut TrapContext) -> bool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrError {
    /// Gate number outside `0..NUM_GATES`.
    InvalidGate(Gate),
    /// The gate already carries `MAX_HANDLERS_PER_GATE` handlers.
    GateFull(Gate),
}

impl fmt::Display for IntrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntrError::InvalidGate(gate) => write!(f, "invalid interrupt gate {}", gate),
            IntrError::GateFull(gate) => write!(f, "handler chain of gate {} is full", gate),
        }
    }
}

/// Result of dispatching one interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Handled by the handler at this chain position.
    Handled(usize),
    /// No handler claimed it.
    Unhandled,
}

/// Physical interrupt delivery on the executing CPU.
pub trait IrqBackend: Sync {
    fn current_cpu(&self) -> usize;
    fn hw_enable(&self);
    fn hw_disable(&self);
    fn hw_enabled(&self) -> bool;
    /// Turn delivery on and wait for the next interrupt, with no window
    /// between the two.
    fn hw_enable_and_halt(&self);
}

/// The CPU the kernel is running on.
pub struct NativeIrq;

impl IrqBackend for NativeIrq {
    #[inline]
    fn current_cpu(&self) -> usize {
        pcr::get_current_cpu()
    }

    #[inline]
    fn hw_enable(&self) {
        cpu::enable_interrupts();
    }

    #[inline]
    fn hw_disable(&self) {
        cpu::disable_interrupts();
    }

    #[inline]
    fn hw_enabled(&self) -> bool {
        cpu::are_interrupts_enabled()
    }

    #[inline]
    fn hw_enable_and_halt(&self) {
        cpu::enable_and_halt();
    }
}

#[repr(C, align(64))]
struct CpuIntrState {
    depth: AtomicU32,
    misuse: AtomicU64,
}

impl CpuIntrState {
    const fn new() -> Self {
        Self {
            depth: AtomicU32::new(BOOT_DEPTH),
            misuse: AtomicU64::new(0),
        }
    }
}

#[derive(Clone, Copy)]
struct HandlerChain {
    handlers: [Option<IntrHandler>; MAX_HANDLERS_PER_GATE],
    len: usize,
}

impl HandlerChain {
    const EMPTY: Self = Self {
        handlers: [None; MAX_HANDLERS_PER_GATE],
        len: 0,
    };

    fn push(&mut self, handler: IntrHandler) -> bool {
        if self.len >= MAX_HANDLERS_PER_GATE {
            return false;
        }
        self.handlers[self.len] = Some(handler);
        self.len += 1;
        true
    }

    /// Remove the first instance of `handler`, shifting later handlers down.
    fn remove(&mut self, handler: IntrHandler) -> bool {
        let Some(pos) = self
            .iter()
            .position(|h| core::ptr::fn_addr_eq(h, handler))
        else {
            return false;
        };
        self.handlers.copy_within(pos + 1..self.len, pos);
        self.len -= 1;
        self.handlers[self.len] = None;
        true
    }

    fn iter(&self) -> impl Iterator<Item = IntrHandler> + '_ {
        self.handlers[..self.len].iter().flatten().copied()
    }
}

#[derive(Clone, Copy)]
struct GateEntry {
    chain: HandlerChain,
    dispatched: u64,
    unhandled: u64,
    reported_unhandled: bool,
}

impl GateEntry {
    const EMPTY: Self = Self {
        chain: HandlerChain::EMPTY,
        dispatched: 0,
        unhandled: 0,
        reported_unhandled: false,
    };
}

/// Per-gate counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub handlers: usize,
    pub dispatched: u64,
    pub unhandled: u64,
}

type GateTable = [GateEntry; NUM_GATES];

pub struct InterruptController<B: IrqBackend> {
    backend: B,
    cpus: [CpuIntrState; MAX_CPUS],
    gates: Mutex<GateTable>,
    contended: AtomicU64,
}

impl<B: IrqBackend> InterruptController<B> {
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            cpus: [const { CpuIntrState::new() }; MAX_CPUS],
            gates: Mutex::new([GateEntry::EMPTY; NUM_GATES]),
            contended: AtomicU64::new(0),
        }
    }

    #[inline]
    fn local(&self) -> (usize, &CpuIntrState) {
        let cpu = self.backend.current_cpu().min(MAX_CPUS - 1);
        (cpu, &self.cpus[cpu])
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Leave one disable scope; delivery comes back on when the last closes.
    pub fn enable(&self) {
        let (cpu, local) = self.local();
        match local
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
        {
            Ok(1) => self.backend.hw_enable(),
            Ok(_) => {}
            Err(_) => {
                local.misuse.fetch_add(1, Ordering::Relaxed);
                klog_error!("intr: unbalanced enable on cpu {} ignored", cpu);
            }
        }
    }

    /// Enter a disable scope. Always safe to call.
    pub fn disable(&self) {
        let (_, local) = self.local();
        if local.depth.load(Ordering::Acquire) == 0 {
            self.backend.hw_disable();
        }
        local.depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether delivery is physically enabled on this CPU.
    #[inline]
    pub fn state(&self) -> bool {
        self.backend.hw_enabled()
    }

    /// Current nesting depth on this CPU.
    pub fn depth(&self) -> u32 {
        self.local().1.depth.load(Ordering::Acquire)
    }

    /// Close the last disable scope and halt until the next interrupt.
    /// Delivery comes back on atomically with the halt, so an interrupt that
    /// arrives after the caller's final check still wakes the CPU.
    ///
    /// Outside of exactly one open scope this is a plain `enable()`.
    pub fn enable_and_halt(&self) {
        let (cpu, local) = self.local();
        match local
            .depth
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.backend.hw_enable_and_halt(),
            Err(depth) => {
                klog_error!("intr: halt at depth {} on cpu {} refused", depth, cpu);
                self.enable();
            }
        }
    }

    /// Number of unbalanced `enable()` calls seen on `cpu`.
    pub fn misuse_count(&self, cpu: usize) -> u64 {
        self.cpus
            .get(cpu)
            .map(|c| c.misuse.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Disable scope released on drop.
    pub fn guard(&self) -> IrqGuard<'_, B> {
        self.disable();
        IrqGuard {
            controller: self,
            _not_send: PhantomData,
        }
    }

    /// Run `f` inside a scope opened by the trap path. The hardware already
    /// masked delivery on entry and `iretq` restores it, so only the counter
    /// moves.
    pub fn with_trap_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let (_, local) = self.local();
        local.depth.fetch_add(1, Ordering::AcqRel);
        let result = f();
        local.depth.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn with_gates<R>(&self, f: impl FnOnce(&mut GateTable) -> R) -> R {
        let _scope = self.guard();
        let mut gates = self.gates.lock();
        f(&mut gates)
    }

    /// Append `handler` to the chain of `gate`.
    pub fn add(&self, gate: Gate, handler: IntrHandler) -> Result<(), IntrError> {
        let idx = gate_index(gate)?;
        let pushed = self.with_gates(|gates| {
            let entry = &mut gates[idx];
            entry.reported_unhandled = false;
            entry.chain.push(handler)
        });
        if !pushed {
            return Err(IntrError::GateFull(gate));
        }
        klog_debug!("intr: handler added to gate {}", gate);
        Ok(())
    }

    /// Remove the first instance of `handler` from `gate`. Returns whether a
    /// handler was removed; removing an absent handler is a no-op.
    pub fn remove(&self, gate: Gate, handler: IntrHandler) -> bool {
        let Ok(idx) = gate_index(gate) else {
            return false;
        };
        let removed = self.with_gates(|gates| gates[idx].chain.remove(handler));
        if removed {
            klog_debug!("intr: handler removed from gate {}", gate);
        }
        removed
    }

    pub fn handler_count(&self, gate: Gate) -> usize {
        match gate_index(gate) {
            Ok(idx) => self.with_gates(|gates| gates[idx].chain.len),
            Err(_) => 0,
        }
    }

    pub fn stats(&self, gate: Gate) -> Option<GateStats> {
        let idx = gate_index(gate).ok()?;
        Some(self.with_gates(|gates| GateStats {
            handlers: gates[idx].chain.len,
            dispatched: gates[idx].dispatched,
            unhandled: gates[idx].unhandled,
        }))
    }

    /// Trap dispatches that found the gate table locked and were dropped.
    pub fn contended_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Lock the table from the trap path. Trap gates may have interrupted
    /// the lock holder on this very CPU, so they never spin.
    fn trap_lock(&self, class: GateClass) -> Option<MutexGuard<'_, GateTable>> {
        if class != GateClass::Trap {
            return Some(self.gates.lock());
        }
        let gates = self.gates.try_lock();
        if gates.is_none() {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
        gates
    }

    /// Deliver one interrupt to the handler chain of `ctx.gate`.
    ///
    /// Called from the trap entry path with delivery masked by hardware.
    pub fn dispatch(&self, ctx: &mut TrapContext) -> Dispatch {
        self.with_trap_scope(|| {
            let Ok(idx) = gate_index(ctx.gate) else {
                klog_warn!("intr: trap on out-of-range gate {}", ctx.gate);
                return Dispatch::Unhandled;
            };

            let class = GateClass::of(ctx.gate);
            let Some(mut gates) = self.trap_lock(class) else {
                klog_warn!(
                    "intr: {} (gate {}) hit a locked gate table, dropped",
                    exception_name(ctx.gate),
                    ctx.gate
                );
                return Dispatch::Unhandled;
            };
            gates[idx].dispatched = gates[idx].dispatched.wrapping_add(1);
            let chain = gates[idx].chain;
            drop(gates);

            for (pos, handler) in chain.iter().enumerate() {
                if handler(ctx) {
                    return Dispatch::Handled(pos);
                }
            }

            self.unhandled(idx, class, ctx);
            Dispatch::Unhandled
        })
    }

    fn unhandled(&self, idx: usize, class: GateClass, ctx: &TrapContext) {
        let first_report = match self.trap_lock(class) {
            Some(mut gates) => {
                let entry = &mut gates[idx];
                entry.unhandled = entry.unhandled.wrapping_add(1);
                !core::mem::replace(&mut entry.reported_unhandled, true)
            }
            None => true,
        };

        if class.is_fatal_when_unhandled() {
            fatal!(
                "unhandled {} (gate {}) at rip {:#x}, error code {:?}",
                exception_name(ctx.gate),
                ctx.gate,
                ctx.rip,
                ctx.error_code
            );
        }
        match class {
            GateClass::Device if first_report => {
                klog_warn!("intr: unhandled interrupt on gate {}", ctx.gate);
            }
            GateClass::Device => {}
            _ => klog_warn!(
                "intr: unhandled {} (gate {}) at rip {:#x}",
                exception_name(ctx.gate),
                ctx.gate,
                ctx.rip
            ),
        }
    }
}

#[inline]
fn gate_index(gate: Gate) -> Result<usize, IntrError> {
    let idx = gate as usize;
    if idx >= NUM_GATES {
        return Err(IntrError::InvalidGate(gate));
    }
    Ok(idx)
}

/// RAII disable scope. Must be dropped on the CPU that created it.
#[must_use = "if unused, delivery is immediately re-enabled"]
pub struct IrqGuard<'a, B: IrqBackend> {
    controller: &'a InterruptController<B>,
    _not_send: PhantomData<*mut ()>,
}

impl<B: IrqBackend> Drop for IrqGuard<'_, B> {
    #[inline]
    fn drop(&mut self) {
        self.controller.enable();
    }
}

// -- Kernel instance ----------------------------------------------------------

static INTR: InterruptController<NativeIrq> = InterruptController::new(NativeIrq);

#[inline]
pub fn controller() -> &'static InterruptController<NativeIrq> {
    &INTR
}

#[inline]
pub fn enable() {
    INTR.enable();
}

#[inline]
pub fn disable() {
    INTR.disable();
}

#[inline]
pub fn state() -> bool {
    INTR.state()
}

#[inline]
pub fn depth() -> u32 {
    INTR.depth()
}

#[inline]
pub fn guard() -> IrqGuard<'static, NativeIrq> {
    INTR.guard()
}

pub fn add(gate: Gate, handler: IntrHandler) -> Result<(), IntrError> {
    INTR.add(gate, handler)
}

pub fn remove(gate: Gate, handler: IntrHandler) -> bool {
    INTR.remove(gate, handler)
}

pub fn stats(gate: Gate) -> Option<GateStats> {
    INTR.stats(gate)
}

pub fn dispatch(ctx: &mut TrapContext) -> Dispatch {
    INTR.dispatch(ctx)
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, AtomicUsize};

    use kestrel_abi::{EXCEPTION_BREAKPOINT, EXCEPTION_NMI, EXCEPTION_PAGE_FAULT, TIMER_GATE};

    use super::*;
    use crate::test_log::{capture, count};

    const SIM_CPUS: usize = 4;

    /// Simulated CPUs: a software IF flag per CPU and a selectable current CPU.
    struct SimCpu {
        current: AtomicUsize,
        flags: [AtomicBool; SIM_CPUS],
        halts: AtomicUsize,
    }

    impl SimCpu {
        const fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                flags: [const { AtomicBool::new(false) }; SIM_CPUS],
                halts: AtomicUsize::new(0),
            }
        }

        fn switch_to(&self, cpu: usize) {
            self.current.store(cpu, Ordering::SeqCst);
        }
    }

    impl IrqBackend for SimCpu {
        fn current_cpu(&self) -> usize {
            self.current.load(Ordering::SeqCst)
        }

        fn hw_enable(&self) {
            self.flags[self.current_cpu()].store(true, Ordering::SeqCst);
        }

        fn hw_disable(&self) {
            self.flags[self.current_cpu()].store(false, Ordering::SeqCst);
        }

        fn hw_enabled(&self) -> bool {
            self.flags[self.current_cpu()].load(Ordering::SeqCst)
        }

        fn hw_enable_and_halt(&self) {
            self.hw_enable();
            self.halts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Controller past the boot scope: depth 0, delivery on.
    fn running_controller() -> InterruptController<SimCpu> {
        let ctrl = InterruptController::new(SimCpu::new());
        ctrl.enable();
        ctrl
    }

    #[test]
    fn test_boot_depth_masks_delivery() {
        let ctrl = InterruptController::new(SimCpu::new());
        assert_eq!(ctrl.depth(), BOOT_DEPTH);
        assert!(!ctrl.state());
        ctrl.enable();
        assert_eq!(ctrl.depth(), 0);
        assert!(ctrl.state());
    }

    #[test]
    fn test_nesting_behaves_like_stack_depth() {
        let ctrl = running_controller();
        ctrl.disable();
        ctrl.disable();
        ctrl.enable();
        assert!(!ctrl.state());
        assert_eq!(ctrl.depth(), 1);
        ctrl.enable();
        assert!(ctrl.state());
        assert_eq!(ctrl.depth(), 0);
    }

    #[test]
    fn test_balanced_sequences_restore_state() {
        // Every disable/enable word of length <= 10 whose prefixes never
        // close more scopes than they opened.
        for len in (2..=10).step_by(2) {
            for word in 0u32..(1 << len) {
                let ops: std::vec::Vec<bool> = (0..len).map(|i| word & (1 << i) != 0).collect();
                let opens = ops.iter().filter(|&&d| d).count();
                if opens * 2 != len {
                    continue;
                }
                let mut depth = 0i32;
                if ops.iter().any(|&d| {
                    depth += if d { 1 } else { -1 };
                    depth < 0
                }) {
                    continue;
                }

                let ctrl = running_controller();
                let before = ctrl.state();
                let mut depth = 0u32;
                for &is_disable in &ops {
                    if is_disable {
                        ctrl.disable();
                        depth += 1;
                    } else {
                        ctrl.enable();
                        depth -= 1;
                    }
                    assert_eq!(ctrl.depth(), depth);
                    if depth > 0 {
                        assert!(!ctrl.state(), "delivery on inside a disable scope");
                    }
                }
                assert_eq!(ctrl.state(), before);
                assert_eq!(ctrl.misuse_count(0), 0);
            }
        }
    }

    #[test]
    fn test_unbalanced_enable_saturates_and_counts() {
        let ctrl = running_controller();
        let ((), lines) = capture(|| ctrl.enable());
        assert_eq!(count(&lines, "unbalanced enable on cpu 0 ignored"), 1);
        assert_eq!(lines.len(), 1);
        assert_eq!(ctrl.depth(), 0);
        assert_eq!(ctrl.misuse_count(0), 1);
        assert!(ctrl.state());

        // The counter did not wrap: one disable is enough to mask again.
        ctrl.disable();
        assert!(!ctrl.state());
        assert_eq!(ctrl.depth(), 1);
    }

    #[test]
    fn test_depth_is_per_cpu() {
        let ctrl = running_controller();
        ctrl.disable();
        assert!(!ctrl.state());

        ctrl.backend().switch_to(1);
        assert_eq!(ctrl.depth(), BOOT_DEPTH);
        ctrl.enable();
        assert!(ctrl.state());

        ctrl.backend().switch_to(0);
        assert_eq!(ctrl.depth(), 1);
        assert!(!ctrl.state());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let ctrl = running_controller();
        {
            let _outer = ctrl.guard();
            {
                let _inner = ctrl.guard();
                assert_eq!(ctrl.depth(), 2);
            }
            assert!(!ctrl.state());
        }
        assert!(ctrl.state());
        assert_eq!(ctrl.depth(), 0);
    }

    #[test]
    fn test_add_and_remove_preserve_caller_state() {
        fn handler(_: &mut TrapContext) -> bool {
            true
        }

        let ctrl = running_controller();
        ctrl.add(40, handler).unwrap();
        assert!(ctrl.state());
        assert_eq!(ctrl.depth(), 0);

        ctrl.disable();
        assert!(ctrl.remove(40, handler));
        assert!(!ctrl.state());
        assert_eq!(ctrl.depth(), 1);
    }

    #[test]
    fn test_empty_device_gate_is_unhandled() {
        let ctrl = running_controller();
        let mut ctx = TrapContext::new(TIMER_GATE);
        assert_eq!(ctrl.dispatch(&mut ctx), Dispatch::Unhandled);
        assert_eq!(ctrl.dispatch(&mut ctx), Dispatch::Unhandled);
        let stats = ctrl.stats(TIMER_GATE).unwrap();
        assert_eq!(stats.handlers, 0);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.unhandled, 2);
        // Dispatch leaves the depth where the trap found it.
        assert_eq!(ctrl.depth(), 0);
    }

    #[test]
    fn test_device_gate_reported_once_until_handler_added() {
        fn not_mine(_: &mut TrapContext) -> bool {
            false
        }

        let ctrl = running_controller();
        let ((), lines) = capture(|| {
            for _ in 0..3 {
                ctrl.dispatch(&mut TrapContext::new(100));
            }
        });
        assert_eq!(count(&lines, "unhandled interrupt on gate 100"), 1);

        // A new handler that declines re-arms the report once.
        let ((), lines) = capture(|| {
            ctrl.add(100, not_mine).unwrap();
            ctrl.dispatch(&mut TrapContext::new(100));
            ctrl.dispatch(&mut TrapContext::new(100));
        });
        assert_eq!(count(&lines, "unhandled interrupt on gate 100"), 1);
        assert_eq!(ctrl.stats(100).unwrap().unhandled, 5);
    }

    #[test]
    fn test_empty_trap_gate_logs_and_continues() {
        let ctrl = running_controller();
        let mut ctx = TrapContext::new(EXCEPTION_BREAKPOINT);
        let (dispatched, lines) = capture(|| {
            ctrl.dispatch(&mut ctx);
            ctrl.dispatch(&mut ctx)
        });
        assert_eq!(dispatched, Dispatch::Unhandled);
        assert_eq!(count(&lines, "unhandled breakpoint (gate 3)"), 2);
    }

    #[test]
    fn test_nmi_with_table_locked_on_same_cpu_is_dropped() {
        fn nmi(_: &mut TrapContext) -> bool {
            true
        }

        let ctrl = running_controller();
        ctrl.add(EXCEPTION_NMI, nmi).unwrap();

        // The NMI lands while this CPU is inside add/remove/stats.
        let held = ctrl.gates.lock();
        let (dispatched, lines) = capture(|| ctrl.dispatch(&mut TrapContext::new(EXCEPTION_NMI)));
        drop(held);

        assert_eq!(dispatched, Dispatch::Unhandled);
        assert_eq!(ctrl.contended_count(), 1);
        assert_eq!(count(&lines, "hit a locked gate table"), 1);
        assert_eq!(ctrl.depth(), 0);

        assert_eq!(
            ctrl.dispatch(&mut TrapContext::new(EXCEPTION_NMI)),
            Dispatch::Handled(0)
        );
        assert_eq!(ctrl.contended_count(), 1);
    }

    #[test]
    fn test_enable_and_halt_closes_last_scope_atomically() {
        let ctrl = running_controller();
        ctrl.disable();
        ctrl.enable_and_halt();
        assert_eq!(ctrl.depth(), 0);
        assert!(ctrl.state());
        assert_eq!(ctrl.backend().halts.load(Ordering::SeqCst), 1);

        // Nested: only one scope closes and the CPU does not halt.
        ctrl.disable();
        ctrl.disable();
        let ((), lines) = capture(|| ctrl.enable_and_halt());
        assert_eq!(count(&lines, "halt at depth 2"), 1);
        assert_eq!(ctrl.depth(), 1);
        assert!(!ctrl.state());
        assert_eq!(ctrl.backend().halts.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "unhandled page fault")]
    fn test_unhandled_fault_gate_is_fatal() {
        let ctrl = running_controller();
        let mut ctx = TrapContext::new(EXCEPTION_PAGE_FAULT);
        ctx.error_code = Some(2);
        ctrl.dispatch(&mut ctx);
    }

    #[test]
    fn test_chain_runs_in_order_until_handled() {
        static TRACE: AtomicU32 = AtomicU32::new(0);

        fn record(id: u32) {
            let _ = TRACE.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + id));
        }
        fn not_mine(_: &mut TrapContext) -> bool {
            record(1);
            false
        }
        fn mine(_: &mut TrapContext) -> bool {
            record(2);
            true
        }
        fn never(_: &mut TrapContext) -> bool {
            record(3);
            true
        }

        let ctrl = running_controller();
        ctrl.add(50, not_mine).unwrap();
        ctrl.add(50, mine).unwrap();
        ctrl.add(50, never).unwrap();

        let mut ctx = TrapContext::new(50);
        assert_eq!(ctrl.dispatch(&mut ctx), Dispatch::Handled(1));
        assert_eq!(TRACE.load(Ordering::SeqCst), 12);

        TRACE.store(0, Ordering::SeqCst);
        ctrl.add(51, mine).unwrap();
        ctrl.add(51, not_mine).unwrap();
        assert_eq!(ctrl.dispatch(&mut TrapContext::new(51)), Dispatch::Handled(0));
        assert_eq!(TRACE.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_middle_keeps_relative_order() {
        static TRACE: AtomicU32 = AtomicU32::new(0);

        fn record(id: u32) {
            let _ = TRACE.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + id));
        }
        fn first(_: &mut TrapContext) -> bool {
            record(1);
            false
        }
        fn middle(_: &mut TrapContext) -> bool {
            record(2);
            false
        }
        fn last(_: &mut TrapContext) -> bool {
            record(3);
            false
        }

        let ctrl = running_controller();
        for h in [first, middle, last] {
            ctrl.add(60, h).unwrap();
        }
        assert!(ctrl.remove(60, middle));
        assert_eq!(ctrl.handler_count(60), 2);

        assert_eq!(ctrl.dispatch(&mut TrapContext::new(60)), Dispatch::Unhandled);
        assert_eq!(TRACE.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn test_remove_only_first_instance() {
        fn dup(_: &mut TrapContext) -> bool {
            false
        }
        fn other(_: &mut TrapContext) -> bool {
            false
        }

        let ctrl = running_controller();
        ctrl.add(70, dup).unwrap();
        ctrl.add(70, dup).unwrap();
        assert!(!ctrl.remove(70, other));
        assert!(ctrl.remove(70, dup));
        assert_eq!(ctrl.handler_count(70), 1);
        assert!(ctrl.remove(70, dup));
        assert!(!ctrl.remove(70, dup));
    }

    #[test]
    fn test_add_rejects_bad_gate_and_full_chain() {
        fn h(_: &mut TrapContext) -> bool {
            false
        }

        let ctrl = running_controller();
        assert_eq!(ctrl.add(NUM_GATES as Gate, h), Err(IntrError::InvalidGate(256)));
        for _ in 0..MAX_HANDLERS_PER_GATE {
            ctrl.add(80, h).unwrap();
        }
        assert_eq!(ctrl.add(80, h), Err(IntrError::GateFull(80)));
        assert!(!ctrl.remove(NUM_GATES as Gate, h));
    }

    #[test]
    fn test_handler_may_remove_itself_during_dispatch() {
        static CTRL: InterruptController<SimCpu> = InterruptController::new(SimCpu::new());
        static CALLS: AtomicU32 = AtomicU32::new(0);

        fn one_shot(_: &mut TrapContext) -> bool {
            CALLS.fetch_add(1, Ordering::SeqCst);
            CTRL.remove(90, one_shot);
            true
        }

        CTRL.enable();
        CTRL.add(90, one_shot).unwrap();
        assert_eq!(CTRL.dispatch(&mut TrapContext::new(90)), Dispatch::Handled(0));
        assert_eq!(CTRL.dispatch(&mut TrapContext::new(90)), Dispatch::Unhandled);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
