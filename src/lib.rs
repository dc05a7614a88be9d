//! Capture core for a buffered logic analyzer.
//!
//! This crate turns user-facing capture parameters (time base, time
//! position, per-channel triggers) into device buffer geometry, runs the
//! blocking acquisition loop on a dedicated thread, supervises auto-trigger
//! liveness, and assembles the captured packets into ordered, queryable
//! data segments. Rendering, protocol decoding, and device discovery sit
//! above or below this crate and are out of scope.
//!
//! # Architecture
//!
//! ## Geometry planning
//! - [`plan`] / [`pick_sample_rate`] - Pure math from time base/position to
//!   [`CaptureGeometry`] under [`HardwareLimits`], with a rolling-buffer
//!   fallback for long spans
//! - [`PlannerConfig`] - Target fill, streaming threshold, refresh rate
//!
//! ## Acquisition
//! - [`CaptureDriver`] - The device seam: buffer allocation, blocking
//!   refill with guaranteed cancellation, trigger programming
//! - [`AcquisitionLoop`] - Dedicated-thread refill loop with join-on-stop
//!   semantics and a typed [`CaptureEvent`] broadcast
//! - [`MockCaptureDriver`] - Scripted, cancellable driver for tests and
//!   offline development
//!
//! ## Auto-trigger supervision
//! - [`WatchdogCore`] - Pure armed/timer state machine
//! - [`AutoTriggerWatchdog`] - Tokio task forcing a capture whenever a
//!   refill outlives one acquisition window plus the transfer margin
//!
//! ## Data assembly
//! - [`SegmentStore`] / [`Segment`] - Packets become append-only,
//!   rate-stamped segments; readers share them while the loop appends
//!
//! ## Session
//! - [`AcquisitionSession`] - Top-level owner wiring all of the above,
//!   configured by a [`CaptureConfig`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use logic_capture::{AcquisitionSession, CaptureConfig, MockCaptureDriver, TriggerCondition};
//!
//! # fn example() -> logic_capture::Result<()> {
//! let driver = Arc::new(MockCaptureDriver::new());
//! let session = AcquisitionSession::new(driver.clone(), CaptureConfig::default())?;
//!
//! session.set_time_base(1e-3)?; // 1 ms/div: plans 40 MS/s, 400k samples
//! session.set_trigger_condition(0, TriggerCondition::RisingEdge)?;
//!
//! session.run_single()?;
//! // ... the loop stops itself after one captured packet ...
//! for segment in session.store().segments(0) {
//!     println!("{} samples at {} S/s", segment.sample_count(), segment.sample_rate());
//! }
//! session.stop();
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod mock;
pub mod segment;
pub mod session;
pub mod watchdog;

pub use acquisition::{
    AcquisitionLoop, AcquisitionStats, CaptureEvent, CaptureMode, PacketSink, TriggerState,
    LOGIC_GROUP,
};
pub use driver::{
    BufferHandle, CaptureDriver, RawPacket, SharedDriver, TriggerCondition, TriggerLogic,
    TriggerMap, LOGIC_UNIT_SIZE,
};
pub use error::{CaptureError, Result};
pub use geometry::{
    acquisition_window, pick_sample_rate, plan, CaptureGeometry, HardwareLimits, PlannerConfig,
    TRANSFER_MARGIN,
};
pub use mock::{MockCaptureDriver, MockRefill};
pub use segment::{Segment, SegmentStore, StoreEvent};
pub use session::{AcquisitionSession, CaptureConfig};
pub use watchdog::{AutoTriggerWatchdog, WatchdogAction, WatchdogCore};
