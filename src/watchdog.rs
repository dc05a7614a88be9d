//! Auto-trigger watchdog.
//!
//! With auto-trigger enabled, a capture whose trigger condition never occurs
//! would block in the refill forever and the display would stay blank. The
//! watchdog supervises the `Refilling`/`Captured` event stream: if a refill
//! outlives one acquisition window plus the transfer margin, it forces a
//! capture by disabling every channel trigger so the device free-runs, then
//! restores the user's selections once real data flows again.
//!
//! The decision logic lives in [`WatchdogCore`], a pure state machine over
//! two bits (`armed`, `timer_active`) that emits [`WatchdogAction`]s. The
//! async runner in [`AutoTriggerWatchdog`] owns the one-shot timer and
//! applies actions to the driver through the shared
//! [`TriggerMap`](crate::driver::TriggerMap). Keeping the timer out of the
//! core makes every transition testable without a clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::acquisition::{CaptureEvent, TriggerState};
use crate::driver::{SharedDriver, TriggerMap};

/// Side effect requested by a [`WatchdogCore`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Start the one-shot timer.
    StartTimer,
    /// Restart the one-shot timer at the same interval.
    RestartTimer,
    /// Stop the timer without firing.
    StopTimer,
    /// Disable every channel trigger so the device free-runs.
    ForceCapture,
    /// Re-arm the user's per-channel trigger selections.
    RestoreTriggers,
}

/// The watchdog decision logic, free of timers and I/O.
///
/// `armed` distinguishes a genuine capture from one the watchdog forced:
/// a capture that lands while the timer is pending merely stops the timer,
/// while a capture after a force re-arms the watchdog and restores the
/// triggers. The two states oscillate under a permanently absent trigger
/// condition, so the display neither starves nor double-fires.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogCore {
    armed: bool,
    timer_active: bool,
}

impl WatchdogCore {
    /// Core state at run start: armed, timer idle.
    pub fn new() -> Self {
        Self {
            armed: true,
            timer_active: false,
        }
    }

    /// Whether the next expiry will force a capture.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Whether the one-shot timer is pending.
    pub fn is_timer_active(&self) -> bool {
        self.timer_active
    }

    /// A refill began. Starts the timer unless one is already pending.
    pub fn on_refilling(&mut self) -> Option<WatchdogAction> {
        if self.timer_active {
            None
        } else {
            self.timer_active = true;
            Some(WatchdogAction::StartTimer)
        }
    }

    /// The timer expired: the refill outlived its acquisition window.
    ///
    /// Forces a capture and restarts the timer so a driver that stays
    /// silent keeps being forced at a steady cadence. The disarm makes the
    /// next capture restore the triggers instead of counting as genuine.
    pub fn on_expiry(&mut self) -> Vec<WatchdogAction> {
        self.armed = false;
        self.timer_active = true;
        vec![WatchdogAction::ForceCapture, WatchdogAction::RestartTimer]
    }

    /// A non-empty packet arrived.
    pub fn on_captured(&mut self) -> Vec<WatchdogAction> {
        if self.timer_active {
            // Genuine (or first forced) data: the pending deadline is moot.
            self.timer_active = false;
            vec![WatchdogAction::StopTimer]
        } else {
            // Data after a force: back to normal triggering.
            self.armed = true;
            vec![WatchdogAction::RestoreTriggers]
        }
    }

    /// The run stopped. Leaves the hardware with the user's triggers armed.
    pub fn on_stop(&mut self) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();
        if self.timer_active {
            self.timer_active = false;
            actions.push(WatchdogAction::StopTimer);
        }
        if !self.armed {
            self.armed = true;
            actions.push(WatchdogAction::RestoreTriggers);
        }
        actions
    }
}

impl Default for WatchdogCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Async runner driving a [`WatchdogCore`] from the capture event stream.
///
/// Spawned per run with auto-trigger enabled; exits on the `Stopped`
/// transition or when the event channel closes. Aborted on drop so an
/// orphaned watchdog can never fire into a later run.
pub struct AutoTriggerWatchdog {
    task: JoinHandle<()>,
}

impl AutoTriggerWatchdog {
    /// Spawn the watchdog onto the current tokio runtime.
    ///
    /// `interval_ms` holds one acquisition window plus the transfer margin
    /// in milliseconds, from
    /// [`acquisition_window`](crate::geometry::acquisition_window). It is
    /// shared so a time-base change mid-run retimes the watchdog: every
    /// timer arm reads the current value.
    pub fn spawn(
        interval_ms: Arc<AtomicU64>,
        events: broadcast::Receiver<CaptureEvent>,
        driver: SharedDriver,
        triggers: Arc<TriggerMap>,
    ) -> Self {
        let task = tokio::spawn(watchdog_task(interval_ms, events, driver, triggers));
        Self { task }
    }

    /// Stop supervising immediately.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AutoTriggerWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watchdog_task(
    interval_ms: Arc<AtomicU64>,
    mut events: broadcast::Receiver<CaptureEvent>,
    driver: SharedDriver,
    triggers: Arc<TriggerMap>,
) {
    let mut core = WatchdogCore::new();
    let mut deadline: Option<Instant> = None;
    debug!(
        interval_ms = interval_ms.load(Ordering::SeqCst),
        "Watchdog started"
    );

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = timer => {
                trace!("Watchdog expired, forcing capture");
                for action in core.on_expiry() {
                    apply(action, &interval_ms, &mut deadline, &*driver, &triggers);
                }
            }
            event = events.recv() => match event {
                Ok(CaptureEvent::Refilling) => {
                    if let Some(action) = core.on_refilling() {
                        apply(action, &interval_ms, &mut deadline, &*driver, &triggers);
                    }
                }
                Ok(CaptureEvent::Captured) => {
                    for action in core.on_captured() {
                        apply(action, &interval_ms, &mut deadline, &*driver, &triggers);
                    }
                }
                Ok(CaptureEvent::TriggerStateChanged(TriggerState::Stopped)) => {
                    for action in core.on_stop() {
                        apply(action, &interval_ms, &mut deadline, &*driver, &triggers);
                    }
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Watchdog lagged behind capture events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    for action in core.on_stop() {
                        apply(action, &interval_ms, &mut deadline, &*driver, &triggers);
                    }
                    break;
                }
            }
        }
    }
    debug!("Watchdog exiting");
}

fn apply(
    action: WatchdogAction,
    interval_ms: &AtomicU64,
    deadline: &mut Option<Instant>,
    driver: &dyn crate::driver::CaptureDriver,
    triggers: &TriggerMap,
) {
    match action {
        WatchdogAction::StartTimer | WatchdogAction::RestartTimer => {
            let interval = Duration::from_millis(interval_ms.load(Ordering::SeqCst).max(1));
            *deadline = Some(Instant::now() + interval);
        }
        WatchdogAction::StopTimer => {
            *deadline = None;
        }
        WatchdogAction::ForceCapture => {
            if let Err(err) = triggers.disable_all(driver) {
                warn!(%err, "Failed to disable triggers for forced capture");
            }
        }
        WatchdogAction::RestoreTriggers => {
            if let Err(err) = triggers.restore_all(driver) {
                warn!(%err, "Failed to restore triggers");
            }
        }
    }
}
