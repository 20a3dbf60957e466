//! Fault injection for the simulated stage.
//!
//! Lets tests (and demos) turn the simulator into an unreliable control
//! surface: refuse connections, fail moves, or stop answering probes.
//! All counters are atomic so a shared plan can be flipped at runtime while
//! the stage is in use.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const ALWAYS: u32 = u32::MAX;

/// Injectable failure scenarios.
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// Remaining connection attempts to refuse (`u32::MAX` = forever)
    connect_failures: AtomicU32,
    /// Moves allowed before every further move fails (`None` = no limit)
    moves_before_fault: Option<AtomicU32>,
    /// Whether probes currently fail
    probe_failing: AtomicBool,
    /// Connection attempts seen so far
    connect_attempts: AtomicU32,
}

impl FaultPlan {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Refuse the first `n` connection attempts.
    pub fn fail_first_connects(mut self, n: u32) -> Self {
        self.connect_failures = AtomicU32::new(n);
        self
    }

    /// Refuse every connection attempt.
    pub fn always_fail_connect(self) -> Self {
        self.fail_first_connects(ALWAYS)
    }

    /// Allow `n` moves, then fail every move with a simulated stall.
    pub fn fail_moves_after(mut self, n: u32) -> Self {
        self.moves_before_fault = Some(AtomicU32::new(n));
        self
    }

    /// Make probes fail (or recover) from now on.
    pub fn set_probe_failing(&self, failing: bool) {
        self.probe_failing.store(failing, Ordering::SeqCst);
    }

    /// Refuse every further connection attempt (or stop refusing).
    pub fn set_connect_failing(&self, failing: bool) {
        let value = if failing { ALWAYS } else { 0 };
        self.connect_failures.store(value, Ordering::SeqCst);
    }

    /// Number of connection attempts observed.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn check_connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                ALWAYS => Some(ALWAYS),
                n => Some(n - 1),
            })
            .is_ok();
        if refused {
            bail!("control surface not found");
        }
        Ok(())
    }

    pub(crate) fn check_move(&self) -> Result<()> {
        let Some(remaining) = &self.moves_before_fault else {
            return Ok(());
        };
        let allowed = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !allowed {
            bail!("mechanical stall detected");
        }
        Ok(())
    }

    pub(crate) fn check_probe(&self) -> Result<()> {
        if self.probe_failing.load(Ordering::SeqCst) {
            bail!("control surface stopped responding");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_first_n_connects() {
        let plan = FaultPlan::none().fail_first_connects(2);
        assert!(plan.check_connect().is_err());
        assert!(plan.check_connect().is_err());
        assert!(plan.check_connect().is_ok());
        assert!(plan.check_connect().is_ok());
        assert_eq!(plan.connect_attempts(), 4);
    }

    #[test]
    fn always_refuses_until_cleared() {
        let plan = FaultPlan::none().always_fail_connect();
        for _ in 0..10 {
            assert!(plan.check_connect().is_err());
        }
        plan.set_connect_failing(false);
        assert!(plan.check_connect().is_ok());
    }

    #[test]
    fn move_faults_after_budget() {
        let plan = FaultPlan::none().fail_moves_after(2);
        assert!(plan.check_move().is_ok());
        assert!(plan.check_move().is_ok());
        let err = plan.check_move().unwrap_err();
        assert!(err.to_string().contains("stall"));
    }

    #[test]
    fn probe_toggle() {
        let plan = FaultPlan::none();
        assert!(plan.check_probe().is_ok());
        plan.set_probe_failing(true);
        assert!(plan.check_probe().is_err());
        plan.set_probe_failing(false);
        assert!(plan.check_probe().is_ok());
    }
}
