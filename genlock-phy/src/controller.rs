//! Stepped convergence towards a target PLL frequency, with timed rollback.
//!
//! A session captures the PLL registers, walks the frequency to the target in
//! steps no larger than the configured shift and, when asked to, arms a timer
//! that walks it back and restores the captured registers bit for bit.
//!
//! Locks are always taken in the order phy, then status.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use genlock_if::timer::{Scheduler, TimerId};

use crate::{
    config::{ProgramFlags, SyncConfig},
    err::{PllError, Result, check_frequency},
    phy::{Phy, PhyOps},
    shutdown::ShutdownSignal,
};

const DONE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Captured,
    TargetComputed,
    Stepping,
    ArmedForRollback,
    RollingBack,
    Done,
}

/// How a stepping run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Shutdown was requested before the target was reached.
    Interrupted,
}

/// Number of steps and the per-step change to move from `current` to `target`.
///
/// `shift` is the largest change per step in percent of `current`. A shift of
/// zero, or a change within one shift, is a single direct step.
pub fn plan_steps(current: f64, target: f64, shift: f64) -> (u64, f64) {
    let total = target - current;
    let percent_diff = ((total.abs() / current * 100.0) * 10000.0).round() / 10000.0;

    if shift == 0.0 || percent_diff <= shift {
        return (1, total);
    }

    let direction = if target > current { 1.0 } else { -1.0 };
    let step = current * shift / 100.0 * direction;
    let steps = (total / step).abs().ceil() as u64;
    if steps > 1 {
        (steps, total / steps as f64)
    } else {
        (1, total)
    }
}

/// Rollback delay in milliseconds for a drift of `time_diff_ms` corrected at
/// `shift` percent.
pub fn calc_steps_to_sync(time_diff_ms: f64, shift: f64) -> u64 {
    if shift == 0.0 {
        return 0;
    }
    (time_diff_ms.abs() * 100.0 / shift).floor() as u64
}

/// Moves `phy` from `current` to `target` in bounded steps.
///
/// The final step lands exactly on `target`. A failure aborts the remaining
/// steps and leaves the last committed intermediate value in hardware.
pub fn step_pll_clock<P: PhyOps + ?Sized>(
    phy: &mut P,
    current: f64,
    target: f64,
    shift: f64,
    wait_ms: u64,
    commit: bool,
    shutdown: &ShutdownSignal,
) -> Result<StepOutcome> {
    check_frequency(current, "current PLL clock")?;
    check_frequency(target, "target PLL clock")?;
    if shift.is_nan() || shift < 0.0 {
        error!("Invalid shift: {shift}");
        return Err(PllError::InvalidArgument("shift"));
    }

    let (steps, step_size) = plan_steps(current, target, shift);
    if steps > 1 {
        info!("Large PLL clock change detected. Applying in {steps} steps.");
    }
    debug!(
        "Adjusting PLL clock {current:.4} -> {target:.4} in {steps} steps, {wait_ms} ms apart"
    );

    let mut intermediate = current;
    for i in 1..=steps {
        if shutdown.is_requested() {
            warn!("Shutdown requested, stopping at step {i} of {steps}");
            return Ok(StepOutcome::Interrupted);
        }

        intermediate = if i == steps {
            target
        } else {
            intermediate + step_size
        };
        debug!("Step {i} of {steps}: {intermediate:.4}");

        phy.calculate_feedback_dividers(intermediate).inspect_err(|e| {
            error!("Failed to calculate feedback dividers for {intermediate:.4}: {e}")
        })?;

        if commit {
            phy.program_mmio(true)
                .inspect_err(|e| error!("Failed to program PLL at step {i}: {e}"))?;
        }

        if steps > 1 && i < steps {
            thread::sleep(Duration::from_millis(wait_ms));
        }
    }

    Ok(StepOutcome::Completed)
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    done: bool,
    timer: Option<TimerId>,
    /// Bumped every time a rollback timer is armed.
    generation: u64,
    pll_freq_orig: f64,
    pll_freq_mod: f64,
    used_shift: f64,
    wait_ms: u64,
}

struct Session {
    phy: Mutex<Phy>,
    status: Mutex<Status>,
    done_cv: Condvar,
}

/// Drives one [`Phy`] through adjustment sessions.
///
/// Clones share the session; the rollback timer holds one.
#[derive(Clone)]
pub struct PhyController {
    session: Arc<Session>,
    scheduler: Arc<dyn Scheduler>,
    shutdown: ShutdownSignal,
}

impl PhyController {
    /// Controller observing the process-wide shutdown flag.
    pub fn new(phy: Phy, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_shutdown(phy, scheduler, ShutdownSignal::global())
    }

    pub fn with_shutdown(phy: Phy, scheduler: Arc<dyn Scheduler>, shutdown: ShutdownSignal) -> Self {
        Self {
            session: Arc::new(Session {
                phy: Mutex::new(phy),
                status: Mutex::new(Status {
                    state: SessionState::Idle,
                    done: true,
                    timer: None,
                    generation: 0,
                    pll_freq_orig: 0.0,
                    pll_freq_mod: 0.0,
                    used_shift: 0.0,
                    wait_ms: 0,
                }),
                done_cv: Condvar::new(),
            }),
            scheduler,
            shutdown,
        }
    }

    fn lock_phy(&self) -> MutexGuard<'_, Phy> {
        self.session
            .phy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.session
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.lock_status().state = state;
    }

    fn finish(&self, state: SessionState) {
        let mut status = self.lock_status();
        status.state = state;
        status.done = true;
        self.session.done_cv.notify_all();
    }

    pub fn state(&self) -> SessionState {
        self.lock_status().state
    }

    pub fn is_done(&self) -> bool {
        self.lock_status().done
    }

    pub fn pll_freq_orig(&self) -> f64 {
        self.lock_status().pll_freq_orig
    }

    pub fn pll_freq_mod(&self) -> f64 {
        self.lock_status().pll_freq_mod
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Runs `f` with exclusive access to the PHY.
    pub fn with_phy<R>(&self, f: impl FnOnce(&mut Phy) -> R) -> R {
        f(&mut self.lock_phy())
    }

    /// Shifts the PLL by one correction for a measured drift of `time_diff_ms`.
    ///
    /// A positive drift means the reference is ahead, so the clock is slowed
    /// down. With `auto_reset`, a timer restores the captured registers after
    /// `calc_steps_to_sync` milliseconds.
    #[allow(clippy::too_many_arguments)]
    pub fn program_phy(
        &self,
        time_diff_ms: f64,
        shift: f64,
        fast_shift: f64,
        step_threshold_us: u64,
        wait_ms: u64,
        auto_reset: bool,
        commit: bool,
    ) -> Result {
        if !time_diff_ms.is_finite() || !shift.is_finite() || !fast_shift.is_finite() {
            error!("Invalid drift {time_diff_ms} or shift {shift}/{fast_shift}");
            return Err(PllError::InvalidArgument("non-finite drift or shift"));
        }

        let shift = shift.abs();
        let fast_shift = fast_shift.abs();
        let effective_shift =
            if fast_shift != 0.0 && time_diff_ms.abs() * 1000.0 >= step_threshold_us as f64 {
                fast_shift
            } else {
                shift
            };
        let steps = calc_steps_to_sync(time_diff_ms, effective_shift);
        debug!("Rollback after {steps} ms (step threshold {step_threshold_us} us)");

        let mut phy = self.lock_phy();

        if self.claim_rollback(None) {
            warn!("Previous adjustment still armed, restoring it first");
            self.rollback_locked(&mut phy);
        }

        phy.read_registers().inspect_err(|e| {
            error!("Failed to read PLL registers: {e}");
            self.finish(SessionState::Done);
        })?;
        self.set_state(SessionState::Captured);

        let current = phy.calculate_pll_clock();
        let direction = if time_diff_ms > 0.0 { -1.0 } else { 1.0 };
        let target = current + effective_shift * current / 100.0 * direction;
        {
            let mut status = self.lock_status();
            status.pll_freq_orig = current;
            status.pll_freq_mod = target;
            status.used_shift = shift;
            status.wait_ms = wait_ms;
            status.state = SessionState::TargetComputed;
        }
        info!("PLL clock: {current:.4} -> {target:.4}");

        if !commit || steps == 0 {
            warn!("Registers not updated");
            self.finish(SessionState::Done);
            return Ok(());
        }

        self.set_state(SessionState::Stepping);
        match step_pll_clock(&mut *phy, current, target, shift, wait_ms, true, &self.shutdown) {
            Ok(StepOutcome::Completed) => {
                if log_enabled!(log::Level::Debug) {
                    phy.print_registers();
                }
            }
            Ok(StepOutcome::Interrupted) => {
                let restored = phy.program_mmio(false);
                self.finish(SessionState::Done);
                return restored;
            }
            Err(e) => {
                error!("Failed to set PLL clock: {e}");
                self.finish(SessionState::Done);
                return Err(e);
            }
        }

        if !auto_reset {
            self.finish(SessionState::Done);
            return Ok(());
        }

        let mut status = self.lock_status();
        status.generation += 1;
        status.done = false;
        status.state = SessionState::ArmedForRollback;
        let generation = status.generation;
        let session = self.clone();
        let id = self.scheduler.arm_timer(
            steps,
            Box::new(move || {
                session.rollback_generation(generation);
            }),
        );
        status.timer = Some(id);
        Ok(())
    }

    /// [`PhyController::program_phy`] with tunables from `config`.
    pub fn program_with(&self, time_diff_ms: f64, config: &SyncConfig) -> Result {
        self.program_phy(
            time_diff_ms,
            config.shift,
            config.fast_shift,
            config.step_threshold_us,
            config.wait_between_steps_ms,
            config.flags.contains(ProgramFlags::AUTO_RESET),
            config.flags.contains(ProgramFlags::COMMIT),
        )
    }

    /// Stepping primitive on this controller's PHY.
    pub fn step_pll_clock(
        &self,
        current: f64,
        target: f64,
        shift: f64,
        wait_ms: u64,
        commit: bool,
    ) -> Result<StepOutcome> {
        let mut phy = self.lock_phy();
        step_pll_clock(&mut *phy, current, target, shift, wait_ms, commit, &self.shutdown)
    }

    /// Walks the PLL from the frequency currently programmed to `target`,
    /// committing every step.
    ///
    /// While a rollback is armed the captured registers stay the restore
    /// baseline and stepping starts from the last proposal instead.
    pub fn set_pll_clock(&self, target: f64, shift: f64, wait_ms: u64) -> Result<StepOutcome> {
        check_frequency(target, "target PLL clock")?;
        if shift.is_nan() || shift < 0.0 {
            error!("Invalid shift: {shift}");
            return Err(PllError::InvalidArgument("shift"));
        }

        let mut phy = self.lock_phy();
        let armed = self.state() == SessionState::ArmedForRollback;
        let current = if armed {
            phy.calculate_modified_pll_clock()
        } else {
            phy.read_registers()?;
            phy.calculate_pll_clock()
        };

        let outcome =
            step_pll_clock(&mut *phy, current, target, shift, wait_ms, true, &self.shutdown)?;
        if armed {
            self.lock_status().pll_freq_mod = phy.calculate_modified_pll_clock();
        }
        Ok(outcome)
    }

    /// Frequency currently programmed in hardware.
    pub fn get_pll_clock(&self) -> Result<f64> {
        let mut phy = self.lock_phy();
        if self.state() == SessionState::ArmedForRollback {
            return Ok(phy.calculate_modified_pll_clock());
        }
        phy.read_registers()?;
        Ok(phy.calculate_pll_clock())
    }

    /// Restores the captured registers now if a rollback is armed.
    ///
    /// Returns `false` when nothing was armed, including when the timer got
    /// there first.
    pub fn cancel(&self) -> bool {
        let mut phy = self.lock_phy();
        if !self.claim_rollback(None) {
            return false;
        }
        self.rollback_locked(&mut phy);
        true
    }

    fn rollback_generation(&self, generation: u64) {
        let mut phy = self.lock_phy();
        if self.claim_rollback(Some(generation)) {
            debug!("Rollback timer expired");
            self.rollback_locked(&mut phy);
        }
    }

    /// Moves an armed session to rolling back and disarms its timer.
    /// Caller holds the phy lock.
    fn claim_rollback(&self, generation: Option<u64>) -> bool {
        let timer = {
            let mut status = self.lock_status();
            if status.state != SessionState::ArmedForRollback
                || generation.is_some_and(|g| g != status.generation)
            {
                return false;
            }
            status.state = SessionState::RollingBack;
            status.timer.take()
        };

        if let Some(id) = timer {
            self.scheduler.cancel_timer(id);
        }
        true
    }

    fn rollback_locked(&self, phy: &mut Phy) {
        let (from, to, shift, wait_ms) = {
            let status = self.lock_status();
            (status.pll_freq_mod, status.pll_freq_orig, status.used_shift, status.wait_ms)
        };

        match step_pll_clock(phy, from, to, shift, wait_ms, true, &self.shutdown) {
            Ok(StepOutcome::Completed) => {}
            Ok(StepOutcome::Interrupted) => debug!("Rollback stepping interrupted"),
            Err(e) => warn!("Stepping back to {to:.4} failed: {e}"),
        }

        if let Err(e) = phy.program_mmio(false) {
            error!("Failed to restore PLL registers: {e}");
        }

        info!("PLL clock restored to {to:.4}");
        self.finish(SessionState::Done);
    }

    /// Blocks until the session is done. A shutdown request restores the
    /// captured registers immediately.
    pub fn wait_until_done(&self) {
        let mut status = self.lock_status();
        while !status.done && !self.shutdown.is_requested() {
            (status, _) = self
                .session
                .done_cv
                .wait_timeout(status, DONE_POLL)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(status);

        if self.shutdown.is_requested() {
            self.cancel();
        }
    }

    /// Like [`PhyController::wait_until_done`] but gives up after `timeout`.
    /// Returns whether the session is done.
    pub fn wait_until_done_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock_status();
        while !status.done && !self.shutdown.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            (status, _) = self
                .session
                .done_cv
                .wait_timeout(status, (deadline - now).min(DONE_POLL))
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(status);

        if self.shutdown.is_requested() {
            self.cancel();
        }
        self.is_done()
    }
}
