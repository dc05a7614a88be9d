//! Top-level capture session.
//!
//! [`AcquisitionSession`] wires the geometry planner, the acquisition loop,
//! the segment store, the trigger map, and the auto-trigger watchdog into
//! one owner with a small control surface: set time base/position, select
//! triggers, run/stop. The UI and persistence layers talk only to this
//! type; everything below it is reachable for tests and advanced consumers
//! through accessors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::acquisition::{
    AcquisitionLoop, AcquisitionStats, CaptureEvent, CaptureMode, TriggerState,
};
use crate::driver::{SharedDriver, TriggerCondition, TriggerLogic, TriggerMap};
use crate::error::{CaptureError, Result};
use crate::geometry::{acquisition_window, plan, CaptureGeometry, HardwareLimits, PlannerConfig};
use crate::segment::SegmentStore;
use crate::watchdog::AutoTriggerWatchdog;

/// Full capture configuration, deserializable from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Hard device ceilings.
    #[serde(default)]
    pub limits: HardwareLimits,

    /// Geometry planner tunables.
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Trigger-capable channels, including external trigger inputs.
    #[serde(default = "default_channel_count")]
    pub channel_count: u32,

    /// Initial time base in seconds per division.
    #[serde(default = "default_time_base_secs")]
    pub time_base_secs: f64,

    /// Initial time position in seconds.
    #[serde(default)]
    pub time_position_secs: f64,

    /// Start with auto-trigger supervision enabled.
    #[serde(default)]
    pub auto_trigger: bool,
}

fn default_channel_count() -> u32 {
    16
}
fn default_time_base_secs() -> f64 {
    1e-3
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            limits: HardwareLimits::default(),
            planner: PlannerConfig::default(),
            channel_count: default_channel_count(),
            time_base_secs: default_time_base_secs(),
            time_position_secs: 0.0,
            auto_trigger: false,
        }
    }
}

impl CaptureConfig {
    /// Parse a configuration from a TOML document. Missing fields take
    /// their defaults; the result is validated.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| CaptureError::invalid_config(format!("invalid capture config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all sections together.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.planner.validate()?;
        if self.channel_count == 0 {
            return Err(CaptureError::invalid_config(
                "channel_count must be greater than 0",
            ));
        }
        if !(self.time_base_secs > 0.0) || !self.time_base_secs.is_finite() {
            return Err(CaptureError::invalid_config(format!(
                "time_base_secs must be positive and finite, got {}",
                self.time_base_secs
            )));
        }
        if !self.time_position_secs.is_finite() {
            return Err(CaptureError::invalid_config(
                "time_position_secs must be finite",
            ));
        }
        Ok(())
    }
}

struct SessionState {
    time_base_secs: f64,
    time_position_secs: f64,
    auto_trigger: bool,
    geometry: CaptureGeometry,
    watchdog: Option<AutoTriggerWatchdog>,
}

/// Owner and control surface of the capture core.
pub struct AcquisitionSession {
    driver: SharedDriver,
    store: Arc<SegmentStore>,
    triggers: Arc<TriggerMap>,
    acquisition: AcquisitionLoop,
    limits: HardwareLimits,
    planner: PlannerConfig,
    // Watchdog interval in milliseconds, shared with a running watchdog so
    // time-base changes retime it without a respawn.
    watchdog_interval_ms: Arc<AtomicU64>,
    state: Mutex<SessionState>,
}

impl AcquisitionSession {
    /// Build a session over `driver` from a validated configuration.
    ///
    /// Plans the initial geometry and programs the trigger delay for it.
    pub fn new(driver: SharedDriver, config: CaptureConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SegmentStore::new(config.channel_count));
        let triggers = Arc::new(TriggerMap::new(config.channel_count));
        let acquisition = AcquisitionLoop::new(Arc::clone(&driver), store.clone());
        acquisition.set_auto_trigger(config.auto_trigger);

        let geometry = plan(
            config.time_base_secs,
            config.time_position_secs,
            &config.limits,
            &config.planner,
        );

        let interval = acquisition_window(config.time_base_secs, config.limits.division_count);
        let session = Self {
            driver,
            store,
            triggers,
            acquisition,
            limits: config.limits,
            planner: config.planner,
            watchdog_interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            state: Mutex::new(SessionState {
                time_base_secs: config.time_base_secs,
                time_position_secs: config.time_position_secs,
                auto_trigger: config.auto_trigger,
                geometry,
                watchdog: None,
            }),
        };
        session.apply_geometry(&geometry)?;
        info!(
            channels = config.channel_count,
            sample_rate = geometry.sample_rate,
            total_samples = geometry.total_samples,
            "Capture session created"
        );
        Ok(session)
    }

    /// Current time base in seconds per division.
    pub fn time_base_secs(&self) -> f64 {
        self.state.lock().time_base_secs
    }

    /// Current time position in seconds.
    pub fn time_position_secs(&self) -> f64 {
        self.state.lock().time_position_secs
    }

    /// Geometry currently in effect.
    pub fn geometry(&self) -> CaptureGeometry {
        self.state.lock().geometry
    }

    /// Change the time base and replan.
    ///
    /// The new buffer size takes effect on the next run; the trigger delay
    /// is reprogrammed immediately.
    pub fn set_time_base(&self, secs: f64) -> Result<()> {
        if !(secs > 0.0) || !secs.is_finite() {
            return Err(CaptureError::invalid_config(format!(
                "time base must be positive and finite, got {secs}"
            )));
        }
        let geometry = {
            let mut state = self.state.lock();
            state.time_base_secs = secs;
            state.geometry = plan(secs, state.time_position_secs, &self.limits, &self.planner);
            state.geometry
        };
        let interval = acquisition_window(secs, self.limits.division_count);
        self.watchdog_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
        self.apply_geometry(&geometry)
    }

    /// Change the time position and replan.
    pub fn set_time_position(&self, secs: f64) -> Result<()> {
        if !secs.is_finite() {
            return Err(CaptureError::invalid_config(
                "time position must be finite",
            ));
        }
        let geometry = {
            let mut state = self.state.lock();
            state.time_position_secs = secs;
            state.geometry = plan(state.time_base_secs, secs, &self.limits, &self.planner);
            state.geometry
        };
        self.apply_geometry(&geometry)
    }

    /// Push a freshly planned geometry into the loop, the store, and the
    /// trigger hardware.
    ///
    /// Rolling capture has no single trigger point, so the hardware trigger
    /// is disabled entirely and no delay is written; leaving streaming mode
    /// restores the user's selections first.
    fn apply_geometry(&self, geometry: &CaptureGeometry) -> Result<()> {
        self.store.set_sample_rate(geometry.sample_rate);
        self.acquisition.set_buffer_size(geometry.total_samples);
        if geometry.streaming {
            self.triggers.disable_all(&*self.driver)?;
        } else {
            self.triggers.restore_all(&*self.driver)?;
            self.driver.set_trigger_delay(geometry.trigger_samples)?;
        }
        debug!(
            sample_rate = geometry.sample_rate,
            total_samples = geometry.total_samples,
            trigger_samples = geometry.trigger_samples,
            streaming = geometry.streaming,
            "Geometry applied"
        );
        Ok(())
    }

    /// Last selected trigger condition for `channel`.
    pub fn trigger_condition(&self, channel: u32) -> TriggerCondition {
        self.triggers.condition(channel)
    }

    /// Select and program a per-channel trigger condition.
    pub fn set_trigger_condition(&self, channel: u32, condition: TriggerCondition) -> Result<()> {
        self.triggers.set(&*self.driver, channel, condition)
    }

    /// Program how channel conditions combine.
    pub fn set_trigger_logic(&self, logic: TriggerLogic) -> Result<()> {
        self.driver.set_trigger_logic(logic)
    }

    /// Enable or disable auto-trigger supervision for subsequent runs.
    pub fn set_auto_trigger(&self, enabled: bool) {
        self.state.lock().auto_trigger = enabled;
        self.acquisition.set_auto_trigger(enabled);
    }

    /// Whether auto-trigger supervision is enabled.
    pub fn auto_trigger(&self) -> bool {
        self.state.lock().auto_trigger
    }

    /// Start a continuous run.
    ///
    /// With auto-trigger enabled (and a non-rolling geometry) this also
    /// spawns the watchdog, which needs an ambient tokio runtime; without
    /// one the run is refused before any buffer is allocated.
    pub fn run(&self) -> Result<()> {
        let (geometry, auto) = {
            let state = self.state.lock();
            (state.geometry, state.auto_trigger)
        };
        let supervise = auto && !geometry.streaming;
        if supervise && tokio::runtime::Handle::try_current().is_err() {
            return Err(CaptureError::invalid_config(
                "auto-trigger supervision requires a tokio runtime",
            ));
        }

        // Subscribe before starting so the first Refilling is not missed.
        let events = self.acquisition.subscribe();
        self.state.lock().watchdog.take();
        self.acquisition.set_single_shot(false);
        self.acquisition.start(&geometry)?;

        if supervise {
            let watchdog = AutoTriggerWatchdog::spawn(
                Arc::clone(&self.watchdog_interval_ms),
                events,
                Arc::clone(&self.driver),
                Arc::clone(&self.triggers),
            );
            self.state.lock().watchdog = Some(watchdog);
        }
        Ok(())
    }

    /// Start a single-shot run: the loop stops itself after one packet.
    ///
    /// Single-shot captures are never watchdog-supervised.
    pub fn run_single(&self) -> Result<()> {
        let geometry = self.state.lock().geometry;
        self.state.lock().watchdog.take();
        self.acquisition.set_single_shot(true);
        self.acquisition.start(&geometry)
    }

    /// Stop the current run, if any. Idempotent.
    ///
    /// Restores the user's trigger selections in case the watchdog was
    /// mid-way through a force-capture cycle.
    pub fn stop(&self) {
        self.acquisition.stop();
        self.state.lock().watchdog.take();
        if let Err(err) = self.triggers.restore_all(&*self.driver) {
            warn!(%err, "Failed to restore triggers on stop");
        }
    }

    /// Reconfigure for a different device.
    ///
    /// Stops any run, drops all segments, resets the trigger map, and
    /// clears the hardware trigger state.
    pub fn reset_device(&self, channel_count: u32) -> Result<()> {
        self.stop();
        self.store.set_channel_count(channel_count);
        self.store.clear();
        self.triggers.reset(channel_count);
        for channel in 0..channel_count {
            self.driver
                .set_trigger_condition(channel, TriggerCondition::None)?;
        }
        self.driver.set_trigger_delay(0)?;
        info!(channels = channel_count, "Device reset");
        Ok(())
    }

    /// Whether an acquisition thread is live.
    pub fn is_running(&self) -> bool {
        self.acquisition.is_running()
    }

    /// Current trigger state for the UI label.
    pub fn trigger_state(&self) -> TriggerState {
        self.acquisition.trigger_state()
    }

    /// Current capture mode.
    pub fn capture_mode(&self) -> CaptureMode {
        self.acquisition.capture_mode()
    }

    /// Acquisition counters.
    pub fn stats(&self) -> AcquisitionStats {
        self.acquisition.stats()
    }

    /// Subscribe to capture events.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.acquisition.subscribe()
    }

    /// The segment store, for plotting and decoding consumers.
    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// The error that fatally stopped the stream, if any.
    pub fn fatal(&self) -> Option<CaptureError> {
        self.store.fatal()
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        self.acquisition.stop();
    }
}
