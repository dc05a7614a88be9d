//! Streaming segment assembly.
//!
//! Packets emitted by the acquisition loop are appended to the current data
//! segment of their channel group; a new segment opens on the first
//! non-empty packet after a stream boundary and closes at end-of-stream.
//! Consumers (plotting, decoding) read segments concurrently with the
//! acquisition thread appending to them.
//!
//! Locking: segment creation and append happen under one store mutex, the
//! same lock readers take for point-in-time length queries. Sample data
//! itself sits behind a per-segment read-write lock; since segments are
//! append-only while open and immutable once closed, data a reader has
//! already seen never changes under it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::acquisition::PacketSink;
use crate::driver::RawPacket;
use crate::error::{CaptureError, Result};

/// Capacity of the store event channel.
const STORE_EVENT_CAPACITY: usize = 64;

/// Boundary notifications for decode/redraw consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A new frame is starting while data already exists.
    FrameBegan,
    /// Samples were appended to an open segment.
    DataReceived,
    /// All open segments were closed.
    FrameEnded,
}

/// One contiguous, time-ordered run of captured samples.
///
/// Stamped with the sample rate and logical start time in effect when it was
/// opened. Append-only while open; immutable once closed.
#[derive(Debug)]
pub struct Segment {
    sample_rate: f64,
    start_time_secs: f64,
    complete: AtomicBool,
    samples: RwLock<Vec<u16>>,
}

impl Segment {
    fn new(sample_rate: f64, start_time_secs: f64) -> Self {
        Self {
            sample_rate,
            start_time_secs,
            complete: AtomicBool::new(false),
            samples: RwLock::new(Vec::new()),
        }
    }

    /// Sample rate in effect when the segment was opened.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Logical start time of the segment within its run, in seconds.
    pub fn start_time_secs(&self) -> f64 {
        self.start_time_secs
    }

    /// Current number of samples.
    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    /// True once the segment has been closed and will not grow further.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Copy out up to `count` samples starting at `start`, clamped to the
    /// samples appended so far.
    pub fn samples(&self, start: usize, count: usize) -> Vec<u16> {
        let data = self.samples.read();
        let start = start.min(data.len());
        let end = start.saturating_add(count).min(data.len());
        data[start..end].to_vec()
    }

    /// Append the packet's complete samples.
    ///
    /// Growth uses a fallible reservation so an out-of-memory condition
    /// surfaces as an error instead of aborting the process; the samples
    /// already appended stay readable.
    fn append_payload(&self, packet: &RawPacket) -> std::result::Result<(), usize> {
        let mut data = self.samples.write();
        let incoming = packet.sample_count();
        if data.try_reserve(incoming).is_err() {
            return Err(data.len());
        }
        data.extend(
            packet
                .bytes()
                .chunks_exact(packet.unit_size())
                .map(|chunk| u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)])),
        );
        Ok(())
    }

    fn close(&self) {
        self.complete.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct GroupState {
    segments: Vec<Arc<Segment>>,
    open: Option<Arc<Segment>>,
    total_samples: u64,
}

struct StoreInner {
    sample_rate: f64,
    channel_count: u32,
    groups: HashMap<usize, GroupState>,
    fatal: Option<CaptureError>,
}

/// Assembles raw packets into ordered, queryable data segments.
///
/// Implements [`PacketSink`] so the acquisition loop can feed it directly
/// from the acquisition thread while consumers read from others.
pub struct SegmentStore {
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<StoreEvent>,
}

impl SegmentStore {
    /// Create a store for a device with `channel_count` channels.
    pub fn new(channel_count: u32) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(StoreInner {
                sample_rate: 0.0,
                channel_count,
                groups: HashMap::new(),
                fatal: None,
            }),
            events,
        }
    }

    /// Subscribe to frame/data boundary notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Record the sample rate to stamp onto newly opened segments.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.inner.lock().sample_rate = sample_rate;
    }

    /// Reconfigure for a device with a different channel count.
    ///
    /// A changed channel count is incompatible with the shape of any
    /// in-progress segment, so all segments are dropped immediately.
    pub fn set_channel_count(&self, channel_count: u32) {
        let mut inner = self.inner.lock();
        if inner.channel_count != channel_count {
            info!(
                old = inner.channel_count,
                new = channel_count,
                "Channel count changed, dropping all segments"
            );
            inner.groups.clear();
            inner.fatal = None;
            inner.channel_count = channel_count;
        }
    }

    /// Channel count the store is currently shaped for.
    pub fn channel_count(&self) -> u32 {
        self.inner.lock().channel_count
    }

    /// Drop every segment (device switch, explicit clear).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.groups.clear();
        inner.fatal = None;
        debug!("Segment store cleared");
    }

    /// Snapshot of all segments for `group`, in arrival order.
    pub fn segments(&self, group: usize) -> Vec<Arc<Segment>> {
        self.inner
            .lock()
            .groups
            .get(&group)
            .map(|g| g.segments.clone())
            .unwrap_or_default()
    }

    /// True once any group holds at least one segment.
    pub fn has_data(&self) -> bool {
        self.inner.lock().groups.values().any(|g| !g.segments.is_empty())
    }

    /// The error that stopped the stream, if the store hit one.
    pub fn fatal(&self) -> Option<CaptureError> {
        self.inner.lock().fatal.clone()
    }
}

impl PacketSink for SegmentStore {
    fn on_frame_begin(&self) {
        let inner = self.inner.lock();
        // Only meaningful once a sweep is in progress.
        if inner.groups.values().any(|g| g.open.is_some()) {
            let _ = self.events.send(StoreEvent::FrameBegan);
        }
    }

    fn on_packet(&self, group: usize, packet: RawPacket) -> Result<()> {
        if packet.is_empty() {
            // An empty segment is never created; wait for real data.
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if let Some(fatal) = &inner.fatal {
            return Err(fatal.clone());
        }
        let sample_rate = inner.sample_rate;
        let state = inner.groups.entry(group).or_default();

        let (segment, opened) = match &state.open {
            Some(segment) => (Arc::clone(segment), false),
            None => {
                // First packet after a boundary: open a fresh segment
                // stamped with the rate and start time now in effect.
                let start_time = if sample_rate > 0.0 {
                    state.total_samples as f64 / sample_rate
                } else {
                    0.0
                };
                let segment = Arc::new(Segment::new(sample_rate, start_time));
                state.segments.push(Arc::clone(&segment));
                state.open = Some(Arc::clone(&segment));
                (segment, true)
            }
        };

        if let Err(appended_samples) = segment.append_payload(&packet) {
            segment.close();
            state.open = None;
            let fatal = CaptureError::OutOfMemory {
                group,
                appended_samples,
            };
            error!(group, appended_samples, "Segment append failed, stopping stream");
            inner.fatal = Some(fatal.clone());
            return Err(fatal);
        }
        state.total_samples += packet.sample_count() as u64;

        drop(inner);
        if opened {
            let _ = self.events.send(StoreEvent::FrameBegan);
        }
        let _ = self.events.send(StoreEvent::DataReceived);
        Ok(())
    }

    fn on_stream_end(&self) {
        let mut inner = self.inner.lock();
        let mut closed_any = false;
        for state in inner.groups.values_mut() {
            if let Some(segment) = state.open.take() {
                segment.close();
                closed_any = true;
            }
        }
        drop(inner);
        if closed_any {
            let _ = self.events.send(StoreEvent::FrameEnded);
        }
    }
}
