//! Blocking sample-acquisition loop.
//!
//! [`AcquisitionLoop`] owns the device capture buffer for the lifetime of
//! one start/stop pair and runs a blocking refill/forward loop on a
//! dedicated thread. Packets are handed to a [`PacketSink`] in production
//! order; trigger-state transitions and liveness events fan out to
//! observers (UI, watchdog, tests) over a broadcast channel.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──▶ Awaiting ⇄ Running ──stop()/single-shot──▶ Stopped
//! ```
//!
//! `stop()` cancels the in-flight refill through the driver's cancel
//! primitive and joins the acquisition thread; when it returns, no further
//! packets will be emitted. A polling flag alone would not bound the wait,
//! since the thread blocks inside driver I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::driver::{BufferHandle, RawPacket, SharedDriver};
use crate::error::Result;
use crate::geometry::CaptureGeometry;

/// Capacity of the capture event channel.
const CAPTURE_EVENT_CAPACITY: usize = 64;

/// Channel group carrying the logic capture data.
pub const LOGIC_GROUP: usize = 0;

/// Trigger state as observed by the UI and the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerState {
    /// Not acquiring.
    #[default]
    Stopped,
    /// Blocked in a refill, waiting for the trigger condition.
    Awaiting,
    /// Data arrived for the current capture.
    Running,
}

/// Capture mode, mutated only by explicit start/stop/single-shot requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Continuous,
    SingleShot,
}

/// Typed events emitted by the acquisition loop.
///
/// This replaces UI-toolkit signal wiring with an explicit message channel
/// any observer can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A refill is about to begin while auto-trigger supervision is active.
    Refilling,
    /// A non-empty packet arrived while auto-trigger supervision is active.
    Captured,
    /// The trigger state changed.
    TriggerStateChanged(TriggerState),
    /// A terminal error stopped the loop.
    Error(String),
}

/// Downstream consumer of raw packets, called from the acquisition thread.
pub trait PacketSink: Send + Sync {
    /// A new frame boundary was signalled.
    fn on_frame_begin(&self);

    /// A packet arrived for `group`. Returning an error stops the stream.
    fn on_packet(&self, group: usize, packet: RawPacket) -> Result<()>;

    /// The stream ended; open segments must be closed.
    fn on_stream_end(&self);
}

/// Counters for the current and past runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquisitionStats {
    /// Non-empty packets forwarded downstream.
    pub packets: u64,
    /// Samples forwarded downstream.
    pub samples: u64,
    /// Tolerated refill failures.
    pub transient_errors: u64,
}

/// State shared between the control thread and the acquisition thread.
struct SharedState {
    interrupt: AtomicBool,
    running: AtomicBool,
    single: AtomicBool,
    auto_trigger: AtomicBool,
    trigger_state: Mutex<TriggerState>,
    packets: AtomicU64,
    samples: AtomicU64,
    transient_errors: AtomicU64,
}

struct Worker {
    handle: JoinHandle<()>,
    buffer: BufferHandle,
}

/// The acquisition loop and its control surface.
///
/// All lifecycle mutation happens on the control thread; the acquisition
/// thread snapshots its inputs at `start()` and only writes packets and
/// events outward.
pub struct AcquisitionLoop {
    driver: SharedDriver,
    sink: Arc<dyn PacketSink>,
    events: broadcast::Sender<CaptureEvent>,
    shared: Arc<SharedState>,
    next_buffer_samples: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl AcquisitionLoop {
    /// Create a loop that forwards packets from `driver` into `sink`.
    pub fn new(driver: SharedDriver, sink: Arc<dyn PacketSink>) -> Self {
        let (events, _) = broadcast::channel(CAPTURE_EVENT_CAPACITY);
        Self {
            driver,
            sink,
            events,
            shared: Arc::new(SharedState {
                interrupt: AtomicBool::new(false),
                running: AtomicBool::new(false),
                single: AtomicBool::new(false),
                auto_trigger: AtomicBool::new(false),
                trigger_state: Mutex::new(TriggerState::Stopped),
                packets: AtomicU64::new(0),
                samples: AtomicU64::new(0),
                transient_errors: AtomicU64::new(0),
            }),
            next_buffer_samples: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to capture events.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    /// Allocate the capture buffer and start the loop.
    ///
    /// The buffer is sized from `geometry`, unless a pending
    /// [`set_buffer_size`](Self::set_buffer_size) override exists; the
    /// override is consumed by this start. An already-running loop is
    /// stopped first. Allocation failures are fatal to this attempt and
    /// propagate to the caller unretried.
    pub fn start(&self, geometry: &CaptureGeometry) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            self.stop();
        }

        let samples = match self.next_buffer_samples.swap(0, Ordering::SeqCst) {
            0 => geometry.total_samples.max(1),
            n => n,
        };
        let buffer = self.driver.allocate_buffer(samples)?;

        info!(
            samples,
            sample_rate = geometry.sample_rate,
            single = self.shared.single.load(Ordering::SeqCst),
            "Starting acquisition"
        );

        self.shared.interrupt.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let driver = Arc::clone(&self.driver);
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || run_loop(&*driver, &*sink, &events, &shared, buffer));

        *self.worker.lock() = Some(Worker { handle, buffer });
        Ok(())
    }

    /// Stop the loop and wait for the acquisition thread to park.
    ///
    /// Idempotent. Cancels the in-flight refill before joining, so the
    /// wait is bounded; the capture buffer is released exactly once, by
    /// the acquisition thread on its way out. When this returns, no
    /// further packets will be emitted.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(Worker { handle, buffer }) = worker {
            self.shared.interrupt.store(true, Ordering::SeqCst);
            self.driver.cancel(&buffer);
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
            }
            debug!("Acquisition stopped");
        }
        set_trigger_state(&self.shared, &self.events, TriggerState::Stopped);
    }

    /// Select single-shot or continuous mode for the next run.
    ///
    /// A running acquisition is stopped first.
    pub fn set_single_shot(&self, single: bool) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.stop();
        }
        self.shared.single.store(single, Ordering::SeqCst);
    }

    /// Enable or disable the auto-trigger liveness events
    /// (`Refilling`/`Captured`) the watchdog consumes.
    pub fn set_auto_trigger(&self, enabled: bool) {
        self.shared.auto_trigger.store(enabled, Ordering::SeqCst);
    }

    /// Override the buffer size used on the next `start()`, in place of the
    /// size its geometry carries. Consumed by that start; has no effect on
    /// an already-allocated buffer.
    pub fn set_buffer_size(&self, samples: u64) {
        self.next_buffer_samples
            .store(samples.max(1), Ordering::SeqCst);
    }

    /// Current trigger state.
    pub fn trigger_state(&self) -> TriggerState {
        *self.shared.trigger_state.lock()
    }

    /// Current capture mode.
    pub fn capture_mode(&self) -> CaptureMode {
        if self.shared.single.load(Ordering::SeqCst) {
            CaptureMode::SingleShot
        } else {
            CaptureMode::Continuous
        }
    }

    /// Whether the acquisition thread is live.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Counters for this loop.
    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            packets: self.shared.packets.load(Ordering::SeqCst),
            samples: self.shared.samples.load(Ordering::SeqCst),
            transient_errors: self.shared.transient_errors.load(Ordering::SeqCst),
        }
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn set_trigger_state(
    shared: &SharedState,
    events: &broadcast::Sender<CaptureEvent>,
    state: TriggerState,
) {
    let mut current = shared.trigger_state.lock();
    if *current != state {
        *current = state;
        let _ = events.send(CaptureEvent::TriggerStateChanged(state));
    }
}

/// Body of the acquisition thread.
fn run_loop(
    driver: &dyn crate::driver::CaptureDriver,
    sink: &dyn PacketSink,
    events: &broadcast::Sender<CaptureEvent>,
    shared: &SharedState,
    buffer: BufferHandle,
) {
    while !shared.interrupt.load(Ordering::SeqCst) {
        set_trigger_state(shared, events, TriggerState::Awaiting);
        if shared.auto_trigger.load(Ordering::SeqCst) {
            // Lets the UI show progress before any data exists.
            let _ = events.send(CaptureEvent::Refilling);
        }

        match driver.refill(&buffer) {
            Ok(packet) => {
                if packet.is_empty() {
                    // Cancelled, or nothing captured this round.
                    continue;
                }
                set_trigger_state(shared, events, TriggerState::Running);
                shared.packets.fetch_add(1, Ordering::SeqCst);
                shared
                    .samples
                    .fetch_add(packet.sample_count() as u64, Ordering::SeqCst);

                if let Err(err) = sink.on_packet(LOGIC_GROUP, packet) {
                    error!(%err, "Packet sink rejected data, stopping");
                    let _ = events.send(CaptureEvent::Error(err.to_string()));
                    shared.interrupt.store(true, Ordering::SeqCst);
                    continue;
                }

                if shared.auto_trigger.load(Ordering::SeqCst) {
                    let _ = events.send(CaptureEvent::Captured);
                }
                if shared.single.load(Ordering::SeqCst) {
                    // One packet is the whole point of single-shot mode.
                    shared.interrupt.store(true, Ordering::SeqCst);
                }
            }
            Err(err) if err.is_transient() => {
                shared.transient_errors.fetch_add(1, Ordering::SeqCst);
                warn!(%err, "Refill failed, continuing");
            }
            Err(err) => {
                error!(%err, "Capture device lost, stopping");
                let _ = events.send(CaptureEvent::Error(err.to_string()));
                shared.interrupt.store(true, Ordering::SeqCst);
            }
        }
    }

    sink.on_stream_end();
    driver.release_buffer(&buffer);
    set_trigger_state(shared, events, TriggerState::Stopped);
    shared.running.store(false, Ordering::SeqCst);
    debug!("Acquisition thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{plan, HardwareLimits, PlannerConfig};
    use crate::mock::MockCaptureDriver;
    use crate::segment::SegmentStore;
    use std::time::{Duration, Instant};

    fn geometry() -> CaptureGeometry {
        plan(
            1e-3,
            0.0,
            &HardwareLimits::default(),
            &PlannerConfig::default(),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn pipeline() -> (Arc<MockCaptureDriver>, Arc<SegmentStore>, AcquisitionLoop) {
        let driver = Arc::new(MockCaptureDriver::new());
        let store = Arc::new(SegmentStore::new(16));
        store.set_sample_rate(40_000_000.0);
        let acq = AcquisitionLoop::new(driver.clone(), store.clone());
        (driver, store, acq)
    }

    #[test]
    fn test_allocation_failure_surfaces_from_start() {
        let (driver, _store, acq) = pipeline();
        driver.fail_next_allocation("out of kernel buffers");
        let err = acq.start(&geometry()).unwrap_err();
        assert!(err.to_string().contains("out of kernel buffers"));
        assert!(!acq.is_running());
    }

    #[test]
    fn test_buffer_sized_from_geometry() {
        let (driver, _store, acq) = pipeline();
        acq.start(&geometry()).unwrap();
        assert_eq!(driver.last_allocated_samples(), 400_000);
        acq.stop();
    }

    #[test]
    fn test_set_buffer_size_overrides_next_start() {
        let (driver, _store, acq) = pipeline();
        acq.set_buffer_size(123);
        acq.start(&geometry()).unwrap();
        assert_eq!(driver.last_allocated_samples(), 123);
        acq.stop();

        // The override is consumed; the next start sizes from its geometry.
        acq.start(&geometry()).unwrap();
        assert_eq!(driver.last_allocated_samples(), 400_000);
        acq.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (driver, _store, acq) = pipeline();
        acq.start(&geometry()).unwrap();
        acq.stop();
        acq.stop();
        assert_eq!(driver.release_count(), 1);
        assert_eq!(acq.trigger_state(), TriggerState::Stopped);
    }

    #[test]
    fn test_transient_errors_are_tolerated() {
        let (driver, store, acq) = pipeline();
        driver.push_transient("bus glitch");
        driver.push_packet(vec![0xAA; 64]);

        acq.start(&geometry()).unwrap();
        wait_until(|| store.has_data());
        acq.stop();

        assert_eq!(acq.stats().transient_errors, 1);
        assert_eq!(acq.stats().packets, 1);
        assert_eq!(store.segments(LOGIC_GROUP).len(), 1);
    }

    #[test]
    fn test_driver_unavailable_stops_loop() {
        let (driver, _store, acq) = pipeline();
        let mut rx = acq.subscribe();
        driver.push_unavailable("usb unplugged");

        acq.start(&geometry()).unwrap();
        wait_until(|| !acq.is_running());

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CaptureEvent::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert_eq!(acq.trigger_state(), TriggerState::Stopped);
        acq.stop();
        assert_eq!(driver.release_count(), 1);
    }

    #[test]
    fn test_single_shot_stops_after_one_packet() {
        let (driver, store, acq) = pipeline();
        driver.push_packet(vec![0u8; 128]);
        driver.push_packet(vec![0u8; 128]);

        acq.set_single_shot(true);
        acq.start(&geometry()).unwrap();
        wait_until(|| !acq.is_running());

        // The second packet stayed in the device even though it was there.
        assert_eq!(driver.pending_refills(), 1);
        let segments = store.segments(LOGIC_GROUP);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_complete());
        assert_eq!(acq.trigger_state(), TriggerState::Stopped);
        // The mode only changes on explicit request, never from the
        // acquisition thread.
        assert_eq!(acq.capture_mode(), CaptureMode::SingleShot);
        acq.set_single_shot(false);
        assert_eq!(acq.capture_mode(), CaptureMode::Continuous);
    }
}
