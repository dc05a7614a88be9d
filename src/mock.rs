//! Scripted capture driver for tests and offline development.
//!
//! [`MockCaptureDriver`] plays back a script of refill outcomes and records
//! every trigger write, which makes the acquisition loop, watchdog, and
//! session testable without hardware. The blocking/cancellation contract is
//! real: an exhausted script blocks the caller inside `refill` until more
//! data is pushed or the buffer is cancelled, exactly like a device waiting
//! for its trigger condition.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::driver::{
    BufferHandle, CaptureDriver, RawPacket, TriggerCondition, TriggerLogic, LOGIC_UNIT_SIZE,
};
use crate::error::{CaptureError, Result};

/// One scripted refill outcome.
#[derive(Debug, Clone)]
pub enum MockRefill {
    /// A successful refill delivering these bytes.
    Packet(Vec<u8>),
    /// A tolerated single-call failure.
    Transient(String),
    /// The device vanished.
    Unavailable(String),
}

#[derive(Default)]
struct MockInner {
    script: VecDeque<MockRefill>,
    cancelled: bool,
    fail_allocation: Option<String>,
    next_buffer_id: u64,
    allocations: u64,
    releases: u64,
    last_allocated_samples: u64,
    refill_calls: u64,
    conditions: HashMap<u32, TriggerCondition>,
    condition_writes: Vec<(u32, TriggerCondition)>,
    delay_writes: Vec<i64>,
    logic: TriggerLogic,
}

/// Scripted, cancellable capture driver.
#[derive(Default)]
pub struct MockCaptureDriver {
    inner: Mutex<MockInner>,
    refill_cv: Condvar,
}

impl MockCaptureDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful refill of `bytes`, waking a blocked refill call.
    pub fn push_packet(&self, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.script.push_back(MockRefill::Packet(bytes));
        self.refill_cv.notify_all();
    }

    /// Queue a transient refill failure.
    pub fn push_transient(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.script.push_back(MockRefill::Transient(message.into()));
        self.refill_cv.notify_all();
    }

    /// Queue a terminal device-vanished failure.
    pub fn push_unavailable(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner
            .script
            .push_back(MockRefill::Unavailable(message.into()));
        self.refill_cv.notify_all();
    }

    /// Make the next `allocate_buffer` fail with this message.
    pub fn fail_next_allocation(&self, message: impl Into<String>) {
        self.inner.lock().fail_allocation = Some(message.into());
    }

    /// Current hardware condition for `channel` as last written.
    pub fn trigger_condition(&self, channel: u32) -> TriggerCondition {
        self.inner
            .lock()
            .conditions
            .get(&channel)
            .copied()
            .unwrap_or_default()
    }

    /// Every condition write in order, for asserting force-capture cycles.
    pub fn condition_writes(&self) -> Vec<(u32, TriggerCondition)> {
        self.inner.lock().condition_writes.clone()
    }

    /// Every trigger-delay write in order.
    pub fn delay_writes(&self) -> Vec<i64> {
        self.inner.lock().delay_writes.clone()
    }

    /// Last programmed trigger logic.
    pub fn trigger_logic(&self) -> TriggerLogic {
        self.inner.lock().logic
    }

    pub fn allocation_count(&self) -> u64 {
        self.inner.lock().allocations
    }

    pub fn release_count(&self) -> u64 {
        self.inner.lock().releases
    }

    pub fn last_allocated_samples(&self) -> u64 {
        self.inner.lock().last_allocated_samples
    }

    pub fn refill_calls(&self) -> u64 {
        self.inner.lock().refill_calls
    }

    /// Number of scripted refills not yet consumed.
    pub fn pending_refills(&self) -> usize {
        self.inner.lock().script.len()
    }
}

impl CaptureDriver for MockCaptureDriver {
    fn allocate_buffer(&self, samples: u64) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.fail_allocation.take() {
            return Err(CaptureError::Allocation { samples, message });
        }
        inner.next_buffer_id += 1;
        inner.allocations += 1;
        inner.last_allocated_samples = samples;
        // A fresh buffer starts un-cancelled even after a previous stop.
        inner.cancelled = false;
        trace!(id = inner.next_buffer_id, samples, "Mock buffer allocated");
        Ok(BufferHandle {
            id: inner.next_buffer_id,
            capacity_samples: samples,
        })
    }

    fn refill(&self, _buffer: &BufferHandle) -> Result<RawPacket> {
        let mut inner = self.inner.lock();
        inner.refill_calls += 1;
        loop {
            if inner.cancelled {
                return Ok(RawPacket::empty());
            }
            if let Some(entry) = inner.script.pop_front() {
                return match entry {
                    MockRefill::Packet(bytes) => Ok(RawPacket::new(bytes, LOGIC_UNIT_SIZE)),
                    MockRefill::Transient(message) => {
                        Err(CaptureError::TransientRefill { message })
                    }
                    MockRefill::Unavailable(message) => {
                        Err(CaptureError::DriverUnavailable { message })
                    }
                };
            }
            // Script exhausted: block like hardware awaiting its trigger.
            self.refill_cv.wait(&mut inner);
        }
    }

    fn cancel(&self, buffer: &BufferHandle) {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        trace!(id = buffer.id, "Mock refill cancelled");
        self.refill_cv.notify_all();
    }

    fn release_buffer(&self, buffer: &BufferHandle) {
        let mut inner = self.inner.lock();
        inner.releases += 1;
        trace!(id = buffer.id, "Mock buffer released");
    }

    fn set_trigger_condition(&self, channel: u32, condition: TriggerCondition) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.conditions.insert(channel, condition);
        inner.condition_writes.push((channel, condition));
        Ok(())
    }

    fn set_trigger_delay(&self, samples: i64) -> Result<()> {
        self.inner.lock().delay_writes.push(samples);
        Ok(())
    }

    fn set_trigger_logic(&self, logic: TriggerLogic) -> Result<()> {
        self.inner.lock().logic = logic;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_scripted_refill_order() {
        let driver = MockCaptureDriver::new();
        driver.push_packet(vec![1, 2, 3, 4]);
        driver.push_transient("glitch");

        let buffer = driver.allocate_buffer(1024).unwrap();
        let packet = driver.refill(&buffer).unwrap();
        assert_eq!(packet.bytes(), &[1, 2, 3, 4]);
        assert!(driver.refill(&buffer).is_err());
    }

    #[test]
    fn test_cancel_unblocks_refill() {
        let driver = Arc::new(MockCaptureDriver::new());
        let buffer = driver.allocate_buffer(1024).unwrap();

        let worker = {
            let driver = Arc::clone(&driver);
            std::thread::spawn(move || driver.refill(&buffer))
        };
        std::thread::sleep(Duration::from_millis(20));
        driver.cancel(&buffer);

        let packet = worker.join().unwrap().unwrap();
        assert!(packet.is_empty());
    }

    #[test]
    fn test_allocation_failure_is_one_shot() {
        let driver = MockCaptureDriver::new();
        driver.fail_next_allocation("no memory");
        assert!(driver.allocate_buffer(500_000).is_err());
        assert!(driver.allocate_buffer(500_000).is_ok());
    }
}
