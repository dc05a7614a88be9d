//! Capture device driver seam.
//!
//! The core drives the acquisition hardware exclusively through the
//! [`CaptureDriver`] trait: buffer allocation, the blocking refill call and
//! its cancellation primitive, and the per-channel trigger programming.
//! Vendor-specific register work lives behind this trait and is out of
//! scope here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Bytes per sample for the 16-bit logic capture path.
pub const LOGIC_UNIT_SIZE: usize = 2;

/// Opaque handle to a device-side capture buffer.
///
/// Created by [`CaptureDriver::allocate_buffer`] and valid until passed to
/// [`CaptureDriver::release_buffer`]. The handle is shared between the
/// control thread (for `cancel`/`release`) and the acquisition thread (for
/// `refill`); the driver is responsible for making those calls safe to
/// overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    /// Driver-assigned buffer identifier.
    pub id: u64,
    /// Capacity of the buffer in samples.
    pub capacity_samples: u64,
}

/// One time-ordered byte range produced by a refill call.
///
/// Ownership passes from the driver to the packet sink for the duration of
/// one append call; the packet is never retained past that call.
#[derive(Debug, Clone, Default)]
pub struct RawPacket {
    data: Vec<u8>,
    unit_size: usize,
}

impl RawPacket {
    /// Create a packet from raw bytes with the given bytes-per-sample.
    pub fn new(data: Vec<u8>, unit_size: usize) -> Self {
        Self {
            data,
            unit_size: unit_size.max(1),
        }
    }

    /// An empty packet, the canonical result of a cancelled refill.
    pub fn empty() -> Self {
        Self::new(Vec::new(), LOGIC_UNIT_SIZE)
    }

    /// Raw byte payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Byte count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the refill produced no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes per sample.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Number of complete samples in the packet.
    pub fn sample_count(&self) -> usize {
        self.data.len() / self.unit_size
    }
}

/// Per-channel trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerCondition {
    /// No condition; the channel never gates the capture.
    #[default]
    None,
    RisingEdge,
    FallingEdge,
    AnyEdge,
    High,
    Low,
}

/// How per-channel trigger conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerLogic {
    #[default]
    Or,
    And,
}

/// Driver contract for the buffered capture device.
///
/// `refill` blocks until data arrives or the in-flight call is cancelled;
/// `cancel` must make a blocked `refill` return promptly with an empty
/// packet. That guarantee is what lets `stop()` bound its wait: a polling
/// flag alone would leave the acquisition thread stuck inside blocking I/O.
pub trait CaptureDriver: Send + Sync {
    /// Allocate a device-side capture buffer of `samples` samples.
    fn allocate_buffer(&self, samples: u64) -> Result<BufferHandle>;

    /// Block until the buffer refills, returning the captured byte range.
    ///
    /// Returns an empty packet when the call was cancelled. A transient
    /// failure is reported as [`CaptureError::TransientRefill`]
    /// (crate::error::CaptureError::TransientRefill); a vanished device as
    /// [`CaptureError::DriverUnavailable`](crate::error::CaptureError::DriverUnavailable).
    fn refill(&self, buffer: &BufferHandle) -> Result<RawPacket>;

    /// Cancel an in-flight refill on `buffer`. Non-blocking, idempotent.
    fn cancel(&self, buffer: &BufferHandle);

    /// Release a buffer previously returned by `allocate_buffer`.
    fn release_buffer(&self, buffer: &BufferHandle);

    /// Program the trigger condition for one channel.
    fn set_trigger_condition(&self, channel: u32, condition: TriggerCondition) -> Result<()>;

    /// Program the trigger delay in samples (signed, relative to buffer start).
    fn set_trigger_delay(&self, samples: i64) -> Result<()>;

    /// Program how channel conditions combine.
    fn set_trigger_logic(&self, logic: TriggerLogic) -> Result<()>;
}

/// Explicit per-channel map of the last selected trigger condition.
///
/// Owned by the session and shared with the auto-trigger watchdog. The
/// force-capture cycle writes `None` to every channel so the device
/// free-runs, then restores the user's selections once a real packet
/// arrives. `disabled` makes the two halves of the cycle idempotent.
pub struct TriggerMap {
    inner: Mutex<TriggerMapInner>,
}

struct TriggerMapInner {
    conditions: HashMap<u32, TriggerCondition>,
    channel_count: u32,
    disabled: bool,
}

impl TriggerMap {
    /// Create a map for `channel_count` trigger-capable channels.
    ///
    /// The count includes any external trigger inputs the device exposes
    /// beyond its data channels.
    pub fn new(channel_count: u32) -> Self {
        Self {
            inner: Mutex::new(TriggerMapInner {
                conditions: HashMap::new(),
                channel_count,
                disabled: false,
            }),
        }
    }

    /// Number of trigger channels tracked.
    pub fn channel_count(&self) -> u32 {
        self.inner.lock().channel_count
    }

    /// Last selected condition for `channel`.
    pub fn condition(&self, channel: u32) -> TriggerCondition {
        self.inner
            .lock()
            .conditions
            .get(&channel)
            .copied()
            .unwrap_or_default()
    }

    /// Record the user's selection and program the hardware.
    ///
    /// While the map is in the disabled half of a force-capture cycle only
    /// the recorded selection changes; the hardware keeps free-running until
    /// the cycle restores.
    pub fn set(&self, driver: &dyn CaptureDriver, channel: u32, condition: TriggerCondition) -> Result<()> {
        let disabled = {
            let mut inner = self.inner.lock();
            inner.conditions.insert(channel, condition);
            inner.disabled
        };
        if !disabled {
            driver.set_trigger_condition(channel, condition)?;
        }
        Ok(())
    }

    /// Force-capture: write `None` to every channel so the device free-runs.
    ///
    /// The recorded selections are kept so [`restore_all`](Self::restore_all)
    /// can re-arm them. No-op if already disabled.
    pub fn disable_all(&self, driver: &dyn CaptureDriver) -> Result<()> {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.disabled {
                return Ok(());
            }
            inner.disabled = true;
            inner.channel_count
        };
        debug!(channels, "Disabling all channel triggers (force capture)");
        for channel in 0..channels {
            driver.set_trigger_condition(channel, TriggerCondition::None)?;
        }
        Ok(())
    }

    /// Re-arm the recorded per-channel selections. No-op if not disabled.
    pub fn restore_all(&self, driver: &dyn CaptureDriver) -> Result<()> {
        let (channels, conditions) = {
            let mut inner = self.inner.lock();
            if !inner.disabled {
                return Ok(());
            }
            inner.disabled = false;
            (inner.channel_count, inner.conditions.clone())
        };
        debug!(channels, "Restoring channel triggers");
        for channel in 0..channels {
            let condition = conditions.get(&channel).copied().unwrap_or_default();
            driver.set_trigger_condition(channel, condition)?;
        }
        Ok(())
    }

    /// True while the force-capture cycle has the hardware free-running.
    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    /// Reset for a device with a different channel count.
    ///
    /// All recorded selections are dropped; an in-progress force-capture
    /// cycle is abandoned.
    pub fn reset(&self, channel_count: u32) {
        let mut inner = self.inner.lock();
        inner.conditions.clear();
        inner.channel_count = channel_count;
        inner.disabled = false;
    }
}

/// Shared driver handle used across the capture core.
pub type SharedDriver = Arc<dyn CaptureDriver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCaptureDriver;

    #[test]
    fn test_packet_sample_count() {
        let packet = RawPacket::new(vec![0u8; 4096], LOGIC_UNIT_SIZE);
        assert_eq!(packet.sample_count(), 2048);
        assert!(RawPacket::empty().is_empty());
    }

    #[test]
    fn test_trigger_map_roundtrip() {
        let driver = MockCaptureDriver::new();
        let map = TriggerMap::new(4);

        map.set(&driver, 1, TriggerCondition::RisingEdge).unwrap();
        map.set(&driver, 3, TriggerCondition::Low).unwrap();
        assert_eq!(driver.trigger_condition(1), TriggerCondition::RisingEdge);

        map.disable_all(&driver).unwrap();
        assert!(map.is_disabled());
        for ch in 0..4 {
            assert_eq!(driver.trigger_condition(ch), TriggerCondition::None);
        }
        // Selections survive the disabled half of the cycle.
        assert_eq!(map.condition(1), TriggerCondition::RisingEdge);

        // Double disable is a no-op.
        map.disable_all(&driver).unwrap();

        map.restore_all(&driver).unwrap();
        assert!(!map.is_disabled());
        assert_eq!(driver.trigger_condition(1), TriggerCondition::RisingEdge);
        assert_eq!(driver.trigger_condition(3), TriggerCondition::Low);
        assert_eq!(driver.trigger_condition(0), TriggerCondition::None);

        // Double restore is a no-op.
        map.restore_all(&driver).unwrap();
    }

    #[test]
    fn test_trigger_map_set_while_disabled_defers_hardware_write() {
        let driver = MockCaptureDriver::new();
        let map = TriggerMap::new(2);
        map.disable_all(&driver).unwrap();

        map.set(&driver, 0, TriggerCondition::AnyEdge).unwrap();
        assert_eq!(driver.trigger_condition(0), TriggerCondition::None);

        map.restore_all(&driver).unwrap();
        assert_eq!(driver.trigger_condition(0), TriggerCondition::AnyEdge);
    }

    #[test]
    fn test_trigger_map_reset() {
        let driver = MockCaptureDriver::new();
        let map = TriggerMap::new(2);
        map.set(&driver, 0, TriggerCondition::High).unwrap();
        map.reset(8);
        assert_eq!(map.channel_count(), 8);
        assert_eq!(map.condition(0), TriggerCondition::None);
        assert!(!map.is_disabled());
    }
}
