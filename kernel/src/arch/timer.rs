//! Kernel timer capability
//!
//! HPET, the LAPIC timer, and the RISC-V CLINT all present the same small
//! surface to the scheduler: a tick counter, the tick period, one-shot
//! deadlines, and end-of-interrupt acknowledgement. The device programming
//! lives outside the core; the platform registers its timer here once, and
//! the kernel reaches it through the free functions below. Before
//! registration (early boot, the unit harness) the defaults apply.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SpinLock;

/// The capability set every platform timer implements.
pub trait KernelTimer: Send + Sync {
    /// Ticks elapsed since the timer was armed.
    fn current_ticks(&self) -> u64;

    /// Nanoseconds per tick at the programmed rate.
    fn nanos_per_tick(&self) -> u64;

    /// Busy-wait for at least `nanos` nanoseconds.
    fn delay_nanos(&self, nanos: u64);

    /// Arm a one-shot interrupt at the given absolute tick, if supported.
    fn deadline_oneshot(&self, deadline_ticks: u64);

    /// Acknowledge the current timer interrupt (end-of-interrupt).
    fn ack(&self);
}

/// Tick period before a platform timer has been registered: 1 ms,
/// matching the boot-time LAPIC/CLINT programming.
pub const DEFAULT_NANOS_PER_TICK: u64 = 1_000_000;

/// Global monotonic tick counter, maintained by the BSP timer interrupt.
static UPTICKS: AtomicU64 = AtomicU64::new(0);

/// The registered platform timer.
static SYSTEM_TIMER: SpinLock<Option<&'static dyn KernelTimer>> = SpinLock::new(None);

/// Current value of the global uptick counter.
pub fn upticks() -> u64 {
    UPTICKS.load(Ordering::Relaxed)
}

/// Install the platform timer. Later registrations replace earlier ones
/// (the boot path upgrades from the early tick source to the calibrated
/// device).
pub fn register_timer(timer: &'static dyn KernelTimer) {
    *SYSTEM_TIMER.lock() = Some(timer);
}

/// Tick period of the registered timer, or the boot default.
pub fn nanos_per_tick() -> u64 {
    SYSTEM_TIMER
        .lock()
        .map(|timer| timer.nanos_per_tick())
        .unwrap_or(DEFAULT_NANOS_PER_TICK)
}

/// Tick count of the registered timer, or the raw uptick counter.
pub fn current_ticks() -> u64 {
    SYSTEM_TIMER
        .lock()
        .map(|timer| timer.current_ticks())
        .unwrap_or_else(upticks)
}

/// Timer interrupt body, shared by BSP and AP vectors: advance the uptick
/// counter (BSP only), acknowledge the device, run the scheduler's tick.
pub fn timer_interrupt(is_bsp: bool) {
    if is_bsp {
        UPTICKS.fetch_add(1, Ordering::Relaxed);
    }

    if let Some(timer) = *SYSTEM_TIMER.lock() {
        timer.ack();
    }

    crate::sched::timer_tick();
}

/// Baseline platform timer: a periodic source at a fixed rate whose
/// interrupts drive the shared uptick stream. The LAPIC/HPET/CLINT
/// drivers wrap their own registers in richer implementations; this one
/// is what the boot path registers until they come up.
pub struct PeriodicTimer {
    period_nanos: u64,
}

impl PeriodicTimer {
    pub const fn new(period_nanos: u64) -> Self {
        Self { period_nanos }
    }
}

impl KernelTimer for PeriodicTimer {
    fn current_ticks(&self) -> u64 {
        upticks()
    }

    fn nanos_per_tick(&self) -> u64 {
        self.period_nanos
    }

    fn delay_nanos(&self, nanos: u64) {
        if nanos == 0 {
            return;
        }

        let end = upticks() + nanos.div_ceil(self.period_nanos).max(1);
        while upticks() < end {
            core::hint::spin_loop();
        }
    }

    fn deadline_oneshot(&self, _deadline_ticks: u64) {
        // A purely periodic source has nothing to arm; the next tick
        // covers any deadline within one period.
    }

    fn ack(&self) {
        // End-of-interrupt belongs to the interrupt controller glue, not
        // the periodic source itself.
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn bsp_tick_advances_upticks() {
        let before = upticks();
        timer_interrupt(true);
        assert!(upticks() > before, "BSP tick must advance the counter");
    }

    #[test]
    fn registered_timer_answers_the_capability_queries() {
        // This test is the only registrar in the suite, so the default
        // period is observable before registration.
        assert_eq!(nanos_per_tick(), DEFAULT_NANOS_PER_TICK);

        static TIMER: PeriodicTimer = PeriodicTimer::new(DEFAULT_NANOS_PER_TICK);
        register_timer(&TIMER);

        assert_eq!(nanos_per_tick(), DEFAULT_NANOS_PER_TICK);

        // The registered timer reports the shared uptick stream (which
        // other tests may advance concurrently).
        let ticks = current_ticks();
        assert!(upticks() >= ticks);

        // The interrupt path acknowledges through the registered timer.
        timer_interrupt(false);

        // Zero-length delays return without waiting on a tick.
        TIMER.delay_nanos(0);
        TIMER.deadline_oneshot(current_ticks() + 1);
    }
}
