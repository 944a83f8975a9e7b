//! Output scheduling: filled buffers → device, completions → pool.
//!
//! The scheduler is the only owner of the device handle and of the slots
//! currently in flight to it. Completion messages arrive on the device's own
//! context; they are folded into the same locked state the control and
//! decode contexts use, so slot ownership transfers are never observed
//! half-done.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::accumulator::FilledBuffer;
use crate::device::OutputDevice;
use crate::error::PlayerError;
use crate::pool::BufferPool;

/// Upper bound on waiting for outstanding completions during teardown.
/// A device that stopped cleanly delivers them almost immediately; anything
/// still missing after this is reclaimed directly.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

struct SchedulerInner {
    device: Option<Box<dyn OutputDevice>>,
    in_flight: HashMap<u64, crate::pool::Slot>,
    started: bool,
    flushed: u64,
}

/// Hands filled buffers to the output device and returns completed slots to
/// the pool.
pub struct OutputScheduler {
    pool: Arc<BufferPool>,
    inner: Mutex<SchedulerInner>,
    cv: Condvar,
}

impl OutputScheduler {
    pub fn new(device: Box<dyn OutputDevice>, pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            inner: Mutex::new(SchedulerInner {
                device: Some(device),
                in_flight: HashMap::new(),
                started: false,
                flushed: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Transfer a filled buffer to the device.
    ///
    /// Issues the device's start command on the first flush with
    /// `want_playing` set (and on any later flush that finds playback
    /// requested but not yet started). Returns whether the device has been
    /// started. On enqueue failure the slot goes straight back to the pool
    /// before the error is surfaced.
    pub fn flush(&self, filled: FilledBuffer, want_playing: bool) -> Result<bool, PlayerError> {
        let mut g = self.inner.lock().unwrap();
        let Some(device) = g.device.as_mut() else {
            self.pool.release(filled.slot);
            return Err(PlayerError::Closed);
        };

        let slot_id = filled.slot.index() as u64;
        if let Err(e) = device.enqueue(
            slot_id,
            &filled.slot.data()[..filled.byte_count],
            &filled.descriptors,
        ) {
            drop(g);
            self.pool.release(filled.slot);
            return Err(PlayerError::DeviceEnqueue(format!("{e:#}")));
        }
        g.in_flight.insert(slot_id, filled.slot);
        g.flushed += 1;

        if want_playing && !g.started {
            if let Some(device) = g.device.as_mut() {
                if let Err(e) = device.start() {
                    return Err(PlayerError::DeviceEnqueue(format!("start failed: {e:#}")));
                }
                g.started = true;
                tracing::debug!("output device started");
            }
        }
        Ok(g.started)
    }

    /// Start or resume the device (explicit play after a pause).
    pub fn start(&self) -> Result<(), PlayerError> {
        let mut g = self.inner.lock().unwrap();
        if let Some(device) = g.device.as_mut() {
            device
                .start()
                .map_err(|e| PlayerError::DeviceEnqueue(format!("start failed: {e:#}")))?;
            g.started = true;
        }
        Ok(())
    }

    /// Hold playback.
    pub fn pause(&self) -> Result<(), PlayerError> {
        let mut g = self.inner.lock().unwrap();
        if let Some(device) = g.device.as_mut() {
            device
                .pause()
                .map_err(|e| PlayerError::DeviceEnqueue(format!("pause failed: {e:#}")))?;
        }
        Ok(())
    }

    /// Forward a volume change to the device.
    pub fn set_volume(&self, volume: f32) {
        let mut g = self.inner.lock().unwrap();
        if let Some(device) = g.device.as_mut() {
            if let Err(e) = device.set_volume(volume) {
                tracing::warn!("set_volume failed: {e:#}");
            }
        }
    }

    /// Device completion for `slot_id`: release the slot back to the pool.
    ///
    /// Unknown ids are ignored (teardown may already have reclaimed the
    /// slot); a slot can only be moved out of the in-flight map once, so a
    /// duplicate completion cannot double-release.
    pub fn on_completion(&self, slot_id: u64) {
        let mut g = self.inner.lock().unwrap();
        match g.in_flight.remove(&slot_id) {
            Some(slot) => {
                self.pool.release(slot);
                self.cv.notify_all();
            }
            None => {
                tracing::debug!(slot_id, "ignoring completion for unknown slot");
            }
        }
    }

    /// Buffers flushed to the device so far.
    pub fn flushed(&self) -> u64 {
        self.inner.lock().unwrap().flushed
    }

    /// Whether the device start command has been issued.
    pub fn started(&self) -> bool {
        self.inner.lock().unwrap().started
    }

    /// Slots currently owned by the device.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// Stop the device and reclaim every in-flight slot.
    ///
    /// With `immediate` false the device drains queued audio first. After
    /// the stop returns, outstanding completions get a bounded grace period;
    /// whatever is still missing is reclaimed directly (each slot is moved
    /// out exactly once either way). Idempotent, and safe when the device
    /// was never started.
    pub fn finish(&self, immediate: bool) {
        let mut g = self.inner.lock().unwrap();
        let Some(mut device) = g.device.take() else {
            return;
        };
        if let Err(e) = device.stop(immediate) {
            tracing::warn!("device stop failed: {e:#}");
        }

        let deadline = Instant::now() + DRAIN_WAIT;
        while !g.in_flight.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (ng, _timeout) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }

        let leftover = g.in_flight.len();
        if leftover > 0 {
            tracing::warn!(leftover, "reclaiming slots the device never completed");
        }
        for (_, slot) in g.in_flight.drain() {
            self.pool.release(slot);
        }
        drop(g);
        // Device handle (and its completion sender) drops here.
        drop(device);
    }
}
