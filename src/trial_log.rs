//! Sync cycle aware logging.
//!
//! The cycle number is kept per thread, the `sync_*` macros prefix every message with
//! `cycle-N: ` of the calling thread.

use std::cell::Cell;

thread_local! {
    static CYCLE: Cell<u64> = Cell::new(0);
}

#[inline]
pub fn set_cycle(cycle: u64) {
    CYCLE.with(|r| r.set(cycle));
}

#[inline]
pub fn cycle() -> u64 {
    CYCLE.with(|r| r.get())
}

// Each macro takes a format literal and its arguments, or a bare literal.

#[macro_export]
macro_rules! sync_debug {
    ($t: tt, $($arg:tt)*) => (
        log::debug!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle(), $($arg)*)
    );
    ($t: tt) => (
        log::debug!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle())
    );
}

#[macro_export]
macro_rules! sync_info {
    ($t: tt, $($arg:tt)*) => (
        log::info!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle(), $($arg)*)
    );
    ($t: tt) => (
        log::info!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle())
    );
}

#[macro_export]
macro_rules! sync_warn {
    ($t: tt, $($arg:tt)*) => (
        log::warn!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle(), $($arg)*)
    );
    ($t: tt) => (
        log::warn!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle())
    );
}

#[macro_export]
macro_rules! sync_error {
    ($t: tt, $($arg:tt)*) => (
        log::error!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle(), $($arg)*)
    );
    ($t: tt) => (
        log::error!(std::concat!("cycle-{}: ", $t), crate::trial_log::cycle())
    );
}
