//! Player lifecycle: state machine, caller surface, and context wiring.
//!
//! Three execution contexts meet here:
//! - the decode thread delivering format/packet callbacks
//! - the device-completion forwarding thread
//! - the caller's control thread (play/pause/feed/close)
//!
//! One mutex guards the state machine, the playback-intent flag, and the
//! accumulator. The only blocking point is `BufferPool::acquire`; the lock
//! is dropped around it and the lifecycle re-checked afterwards. The same
//! lock doubles as the quiesce barrier: once `Closed` is observed no
//! callback can touch a torn-down resource.

use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use packet_player_types::{EndReason, PlaybackState, PlayerStatus, StreamFormat};

use crate::accumulator::PacketAccumulator;
use crate::config::PlayerConfig;
use crate::decode::{PacketSink, PacketSource, SymphoniaSource};
use crate::device::OutputDeviceFactory;
use crate::error::PlayerError;
use crate::playback::CpalOutputFactory;
use crate::pool::BufferPool;
use crate::scheduler::OutputScheduler;

/// Events delivered on the channel returned by the player constructor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The stream reached its terminal state. Sent exactly once.
    Finished { reason: EndReason },
}

struct Session {
    scheduler: Arc<OutputScheduler>,
    completion_thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: PlaybackState,
    /// "Start once possible" — settable before the device exists.
    intent: bool,
    pending_volume: Option<f32>,
    accumulator: PacketAccumulator,
    /// Kept after close so status can still report the stream format.
    format: Option<StreamFormat>,
    /// Kept after close so status can still report slot accounting.
    pool: Option<Arc<BufferPool>>,
    session: Option<Session>,
    bytes_fed: u64,
    packets: u64,
    flushed: u64,
    end_reason: Option<EndReason>,
    finished_sent: bool,
}

/// The synchronized pipeline core. Implements [`PacketSink`] so a packet
/// source can drive it directly; [`StreamPlayer`] is the bundled wiring with
/// the Symphonia source.
pub struct PlayerCore {
    config: PlayerConfig,
    factory: Box<dyn OutputDeviceFactory>,
    events: Sender<PlayerEvent>,
    shared: Mutex<Shared>,
}

impl PlayerCore {
    pub fn new(
        config: PlayerConfig,
        factory: Box<dyn OutputDeviceFactory>,
    ) -> (Arc<Self>, Receiver<PlayerEvent>) {
        let (events, events_rx) = crossbeam_channel::unbounded();
        let max_descriptors = config.max_descriptors;
        let core = Arc::new(Self {
            config,
            factory,
            events,
            shared: Mutex::new(Shared {
                state: PlaybackState::Idle,
                intent: false,
                pending_volume: None,
                accumulator: PacketAccumulator::new(max_descriptors),
                format: None,
                pool: None,
                session: None,
                bytes_fed: 0,
                packets: 0,
                flushed: 0,
                end_reason: None,
                finished_sent: false,
            }),
        });
        (core, events_rx)
    }

    /// Record caller-fed bytes and leave `Idle` on the first feed.
    pub fn on_feed(&self, len: u64) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
            return Err(PlayerError::Closed);
        }
        if g.state == PlaybackState::Idle {
            g.state = PlaybackState::AwaitingFormat;
        }
        g.bytes_fed += len;
        Ok(())
    }

    /// Request playback to start once the device exists.
    pub fn play(&self) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
            return Err(PlayerError::Closed);
        }
        g.intent = true;
        if g.state == PlaybackState::Paused {
            let scheduler = g.session.as_ref().map(|s| s.scheduler.clone());
            if let Some(scheduler) = scheduler {
                if let Err(e) = scheduler.start() {
                    self.close_locked(&mut g, EndReason::Error);
                    return Err(e);
                }
                g.state = PlaybackState::Playing;
            }
        }
        Ok(())
    }

    /// Hold playback, or just clear the intent flag before the device exists.
    pub fn pause(&self) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
            return Err(PlayerError::Closed);
        }
        g.intent = false;
        if g.state == PlaybackState::Playing {
            let scheduler = g.session.as_ref().map(|s| s.scheduler.clone());
            if let Some(scheduler) = scheduler {
                if let Err(e) = scheduler.pause() {
                    self.close_locked(&mut g, EndReason::Error);
                    return Err(e);
                }
                g.state = PlaybackState::Paused;
            }
        }
        Ok(())
    }

    /// Set playback gain; applied on device creation when called early.
    pub fn set_volume(&self, volume: f32) {
        let mut g = self.shared.lock().unwrap();
        match &g.session {
            Some(session) => session.scheduler.set_volume(volume),
            None => g.pending_volume = Some(volume.clamp(0.0, 1.0)),
        }
    }

    /// Whether the caller has asked playback to start once possible.
    pub fn play_requested(&self) -> bool {
        self.shared.lock().unwrap().intent
    }

    /// Unblock a decode thread stuck in slot acquisition ahead of close.
    ///
    /// Called before joining the packet source so `finish` cannot deadlock
    /// against an in-flight packet callback waiting for a free slot.
    pub fn begin_close(&self) {
        let mut g = self.shared.lock().unwrap();
        if g.state == PlaybackState::Closed {
            return;
        }
        g.state = PlaybackState::Draining;
        if let Some(pool) = &g.pool {
            pool.close();
        }
    }

    /// Flush the partial buffer, drain and tear everything down, and emit
    /// the finished event. Idempotent: closing a closed stream is a no-op.
    pub fn finish(&self) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if g.state == PlaybackState::Closed {
            return Ok(());
        }
        self.close_locked(&mut g, EndReason::Eof);
        Ok(())
    }

    /// Point-in-time snapshot for embedding layers.
    pub fn status(&self) -> PlayerStatus {
        let g = self.shared.lock().unwrap();
        let (sample_rate, channels) = match &g.format {
            Some(format) => (Some(format.sample_rate), Some(format.channels)),
            None => (None, None),
        };
        let (busy_slots, free_slots) = match &g.pool {
            Some(pool) => (pool.busy_slots(), pool.free_slots()),
            None => (0, 0),
        };
        PlayerStatus {
            state: g.state,
            play_requested: g.intent,
            sample_rate,
            channels,
            buffer_count: self.config.buffer_count,
            buffer_bytes: self.config.buffer_bytes,
            busy_slots,
            free_slots,
            bytes_fed: g.bytes_fed,
            packets_accumulated: g.packets,
            buffers_flushed: g.flushed,
            end_reason: g.end_reason,
        }
    }

    /// Terminal teardown under the shared lock. Releases every resource in
    /// one path — scheduler (device + in-flight slots), pool, completion
    /// thread — then reports the end exactly once.
    fn close_locked(&self, g: &mut Shared, reason: EndReason) {
        if g.state == PlaybackState::Closed {
            return;
        }
        g.state = PlaybackState::Draining;

        if let Some(mut session) = g.session.take() {
            if let Some(filled) = g.accumulator.take_filled() {
                match session.scheduler.flush(filled, g.intent && reason == EndReason::Eof) {
                    Ok(_) => g.flushed += 1,
                    Err(e) => tracing::warn!("final flush failed: {e}"),
                }
            }
            if let Some(slot) = g.accumulator.take_slot() {
                if let Some(pool) = &g.pool {
                    pool.release(slot);
                }
            }

            // A device that never started (or died) cannot drain.
            let immediate = reason != EndReason::Eof || !session.scheduler.started();
            session.scheduler.finish(immediate);
            if let Some(pool) = &g.pool {
                pool.close();
            }
            if let Some(handle) = session.completion_thread.take() {
                // The device (and its completion sender) dropped in
                // scheduler.finish, so the forwarder exits promptly.
                if handle.join().is_err() {
                    tracing::error!("completion thread panicked");
                }
            }
        }

        g.end_reason.get_or_insert(reason);
        g.state = PlaybackState::Closed;
        if !g.finished_sent {
            g.finished_sent = true;
            let _ = self.events.send(PlayerEvent::Finished {
                reason: g.end_reason.unwrap_or(reason),
            });
        }
        tracing::info!(?reason, "stream closed");
    }
}

impl PacketSink for PlayerCore {
    /// `AwaitingFormat → Buffering`: allocate the pool and open the device.
    fn on_format(&self, format: StreamFormat) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
            return Err(PlayerError::Closed);
        }
        if g.session.is_some() {
            let err = PlayerError::FormatRejected("stream format reported twice".into());
            self.close_locked(&mut g, EndReason::Error);
            return Err(err);
        }

        let pool = Arc::new(BufferPool::new(
            self.config.buffer_count,
            self.config.buffer_bytes,
        ));
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        let device = match self.factory.open(&format, completions_tx) {
            Ok(device) => device,
            Err(e) => {
                let err = PlayerError::FormatRejected(format!("{e:#}"));
                self.close_locked(&mut g, EndReason::Error);
                return Err(err);
            }
        };

        let scheduler = Arc::new(OutputScheduler::new(device, pool.clone()));
        if let Some(volume) = g.pending_volume.take() {
            scheduler.set_volume(volume);
        }

        // Completion messages fold into the scheduler's locked state; the
        // thread exits when the device (sender side) is dropped.
        let scheduler_for_completions = scheduler.clone();
        let completion_thread = thread::spawn(move || {
            while let Ok(slot_id) = completions_rx.recv() {
                scheduler_for_completions.on_completion(slot_id);
            }
        });

        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            slots = self.config.buffer_count,
            slot_bytes = self.config.buffer_bytes,
            "stream format known"
        );
        g.format = Some(format);
        g.pool = Some(pool);
        g.session = Some(Session {
            scheduler,
            completion_thread: Some(completion_thread),
        });
        g.state = PlaybackState::Buffering;
        Ok(())
    }

    /// One decoded packet, in decode order, on the decode thread.
    ///
    /// Flushes the active buffer when the packet would overflow it or the
    /// descriptor table is full, then blocks on slot acquisition — the
    /// backpressure that paces decode against the device.
    fn on_packet(&self, payload: &[u8], _last_in_batch: bool) -> Result<(), PlayerError> {
        let mut g = self.shared.lock().unwrap();
        if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
            return Err(PlayerError::Closed);
        }
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > self.config.buffer_bytes {
            let err = PlayerError::OversizedPacket {
                size: payload.len(),
                capacity: self.config.buffer_bytes,
            };
            self.close_locked(&mut g, EndReason::Error);
            return Err(err);
        }
        let (pool, scheduler) = match (&g.pool, &g.session) {
            (Some(pool), Some(session)) => (pool.clone(), session.scheduler.clone()),
            _ => {
                tracing::warn!(len = payload.len(), "packet before stream format; dropped");
                return Ok(());
            }
        };

        if g.accumulator.has_active() && !g.accumulator.fits(payload.len()) {
            if let Some(filled) = g.accumulator.take_filled() {
                match scheduler.flush(filled, g.intent) {
                    Ok(started) => {
                        g.flushed += 1;
                        if g.state == PlaybackState::Buffering {
                            g.state = if started {
                                PlaybackState::Playing
                            } else {
                                PlaybackState::Paused
                            };
                        }
                    }
                    Err(e) => {
                        self.close_locked(&mut g, EndReason::Error);
                        return Err(e);
                    }
                }
            }
        }

        if !g.accumulator.has_active() {
            // Blocking acquire happens without the shared lock so the
            // completion and control contexts stay live.
            drop(g);
            let Some(slot) = pool.acquire() else {
                return Err(PlayerError::Closed);
            };
            g = self.shared.lock().unwrap();
            if matches!(g.state, PlaybackState::Draining | PlaybackState::Closed) {
                pool.release(slot);
                return Err(PlayerError::Closed);
            }
            g.accumulator.begin(slot);
        }

        g.accumulator.append(payload);
        g.packets += 1;
        Ok(())
    }
}

impl Drop for PlayerCore {
    fn drop(&mut self) {
        let mut g = self.shared.lock().unwrap();
        if g.state != PlaybackState::Closed {
            self.close_locked(&mut g, EndReason::Eof);
        }
    }
}

/// Caller-facing streaming player: Symphonia packet source wired to a
/// [`PlayerCore`].
///
/// ```no_run
/// use packet_player::{PlayerConfig, StreamPlayer};
///
/// let (player, events) = StreamPlayer::with_default_output(PlayerConfig::default());
/// player.play().unwrap();
/// // feed bytes as they arrive from the network...
/// player.feed_bytes(&[0u8; 0], false).ok();
/// player.flush_and_close().unwrap();
/// let _finished = events.recv().unwrap();
/// ```
pub struct StreamPlayer {
    core: Arc<PlayerCore>,
    source: Box<dyn PacketSource>,
}

impl StreamPlayer {
    /// Wire a player to `factory` for device construction.
    pub fn new(
        config: PlayerConfig,
        factory: Box<dyn OutputDeviceFactory>,
    ) -> (Self, Receiver<PlayerEvent>) {
        let spool_bytes = config.spool_bytes;
        let (core, events) = PlayerCore::new(config, factory);
        let sink: Arc<dyn PacketSink> = core.clone();
        let source = Box::new(SymphoniaSource::spawn(sink, spool_bytes));
        (Self { core, source }, events)
    }

    /// Wire a player to the default cpal output device.
    pub fn with_default_output(config: PlayerConfig) -> (Self, Receiver<PlayerEvent>) {
        Self::new(config, Box::new(CpalOutputFactory::default()))
    }

    /// Feed raw stream bytes. Blocks when the pipeline is saturated — the
    /// output device's pace throttles the caller through here.
    pub fn feed_bytes(&self, bytes: &[u8], discontinuity: bool) -> Result<(), PlayerError> {
        self.core.on_feed(bytes.len() as u64)?;
        self.source.feed(bytes, discontinuity);
        Ok(())
    }

    /// Request playback (effective immediately, or once the device exists).
    pub fn play(&self) -> Result<(), PlayerError> {
        self.core.play()
    }

    /// Hold playback (or just record the intent before the device exists).
    pub fn pause(&self) -> Result<(), PlayerError> {
        self.core.pause()
    }

    /// Set playback gain, `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        self.core.set_volume(volume);
    }

    /// End of stream: decode and play out everything fed so far, then tear
    /// down. Idempotent; emits the finished event exactly once.
    ///
    /// When playback was never requested there are no device completions to
    /// drain against, so pending audio is discarded instead of played out.
    pub fn flush_and_close(&self) -> Result<(), PlayerError> {
        if !self.core.play_requested() {
            // A decode callback blocked on a slot must be unblocked, or the
            // source join below would wait on it forever.
            self.core.begin_close();
        }
        self.source.close();
        self.core.finish()
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> PlayerStatus {
        self.core.status()
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        // Close in pipeline order: a decode thread blocked on a slot must
        // be unblocked before the source join below can succeed.
        let _ = self.flush_and_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::PacketDescriptor;
    use crate::device::OutputDevice;
    use anyhow::Result as AnyResult;
    use crossbeam_channel::Sender as CbSender;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Start,
        Pause,
        Stop(bool),
    }

    #[derive(Default)]
    struct FakeShared {
        calls: StdMutex<Vec<Call>>,
        enqueued: StdMutex<Vec<(u64, Vec<u8>, Vec<PacketDescriptor>)>>,
        completion_tx: StdMutex<Option<CbSender<u64>>>,
    }

    impl FakeShared {
        fn starts(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == Call::Start)
                .count()
        }

        fn complete(&self, slot_id: u64) {
            let tx = self.completion_tx.lock().unwrap();
            tx.as_ref().unwrap().send(slot_id).unwrap();
        }

        fn enqueued_count(&self) -> usize {
            self.enqueued.lock().unwrap().len()
        }
    }

    struct FakeDevice {
        shared: Arc<FakeShared>,
        completions: CbSender<u64>,
        auto_complete: bool,
        fail_enqueue: bool,
        pending: Vec<u64>,
    }

    impl OutputDevice for FakeDevice {
        fn enqueue(
            &mut self,
            slot_id: u64,
            bytes: &[u8],
            descriptors: &[PacketDescriptor],
        ) -> AnyResult<()> {
            if self.fail_enqueue {
                anyhow::bail!("synthetic enqueue failure");
            }
            self.shared
                .enqueued
                .lock()
                .unwrap()
                .push((slot_id, bytes.to_vec(), descriptors.to_vec()));
            if self.auto_complete {
                let _ = self.completions.send(slot_id);
            } else {
                self.pending.push(slot_id);
            }
            Ok(())
        }

        fn start(&mut self) -> AnyResult<()> {
            self.shared.calls.lock().unwrap().push(Call::Start);
            Ok(())
        }

        fn pause(&mut self) -> AnyResult<()> {
            self.shared.calls.lock().unwrap().push(Call::Pause);
            Ok(())
        }

        fn stop(&mut self, immediate: bool) -> AnyResult<()> {
            self.shared.calls.lock().unwrap().push(Call::Stop(immediate));
            // Per the device contract, even discarded buffers complete.
            for slot_id in self.pending.drain(..) {
                let _ = self.completions.send(slot_id);
            }
            Ok(())
        }

        fn set_volume(&mut self, _volume: f32) -> AnyResult<()> {
            Ok(())
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            // Drop the test's sender clone too, so the completion channel
            // disconnects and the forwarding thread can exit.
            self.shared.completion_tx.lock().unwrap().take();
        }
    }

    struct FakeFactory {
        shared: Arc<FakeShared>,
        auto_complete: bool,
        fail_enqueue: bool,
        fail_open: bool,
    }

    impl OutputDeviceFactory for FakeFactory {
        fn open(
            &self,
            _format: &StreamFormat,
            completions: CbSender<u64>,
        ) -> AnyResult<Box<dyn OutputDevice>> {
            if self.fail_open {
                anyhow::bail!("synthetic open failure");
            }
            *self.shared.completion_tx.lock().unwrap() = Some(completions.clone());
            Ok(Box::new(FakeDevice {
                shared: self.shared.clone(),
                completions,
                auto_complete: self.auto_complete,
                fail_enqueue: self.fail_enqueue,
                pending: Vec::new(),
            }))
        }
    }

    fn core_with(
        config: PlayerConfig,
        auto_complete: bool,
        fail_enqueue: bool,
        fail_open: bool,
    ) -> (Arc<PlayerCore>, Receiver<PlayerEvent>, Arc<FakeShared>) {
        let shared = Arc::new(FakeShared::default());
        let factory = FakeFactory {
            shared: shared.clone(),
            auto_complete,
            fail_enqueue,
            fail_open,
        };
        let (core, events) = PlayerCore::new(config, Box::new(factory));
        (core, events, shared)
    }

    fn format() -> StreamFormat {
        StreamFormat {
            sample_rate: 44_100,
            channels: 2,
        }
    }

    fn small_config() -> PlayerConfig {
        PlayerConfig {
            buffer_count: 4,
            buffer_bytes: 8192,
            max_descriptors: 512,
            spool_bytes: 4096,
        }
    }

    #[test]
    fn boundary_packet_flushes_before_combining() {
        // Capacity 8192: 4096 fits, 4097 must force a flush of the first
        // packet alone rather than combining.
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.on_format(format()).unwrap();
        core.on_packet(&vec![1u8; 4096], true).unwrap();
        core.on_packet(&vec![2u8; 4097], true).unwrap();

        {
            let enqueued = shared.enqueued.lock().unwrap();
            assert_eq!(enqueued.len(), 1);
            assert_eq!(enqueued[0].1.len(), 4096);
            assert_eq!(enqueued[0].2, vec![PacketDescriptor { offset: 0, len: 4096 }]);
        }

        core.finish().unwrap();
        let enqueued = shared.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 2);
        assert_eq!(enqueued[1].1.len(), 4097);
    }

    #[test]
    fn descriptor_limit_forces_early_flush() {
        let config = PlayerConfig {
            max_descriptors: 3,
            ..small_config()
        };
        let (core, _events, shared) = core_with(config, true, false, false);
        core.on_format(format()).unwrap();
        for i in 0..4u8 {
            core.on_packet(&[i; 10], true).unwrap();
        }

        let enqueued = shared.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].1.len(), 30);
        assert_eq!(enqueued[0].2.len(), 3);
        drop(enqueued);
        core.finish().unwrap();
    }

    #[test]
    fn packets_flush_in_fifo_order_with_monotonic_descriptors() {
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.on_format(format()).unwrap();

        let sizes = [1000usize, 3000, 500, 4000, 2500, 2500, 100, 7000, 64];
        let mut expected = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let payload = vec![i as u8; *size];
            expected.extend_from_slice(&payload);
            core.on_packet(&payload, true).unwrap();
        }
        core.finish().unwrap();

        let enqueued = shared.enqueued.lock().unwrap();
        let mut replayed = Vec::new();
        for (_, bytes, descriptors) in enqueued.iter() {
            let mut last_end = 0usize;
            for d in descriptors {
                assert_eq!(d.offset, last_end, "descriptors must not overlap");
                last_end = d.offset + d.len;
            }
            assert_eq!(last_end, bytes.len());
            replayed.extend_from_slice(bytes);
        }
        assert_eq!(replayed, expected);
    }

    #[test]
    fn busy_slots_never_exceed_pool_size_under_backpressure() {
        let config = PlayerConfig {
            buffer_count: 2,
            ..small_config()
        };
        let (core, _events, shared) = core_with(config, false, false, false);
        core.on_format(format()).unwrap();

        let producer_core = core.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        let producer = thread::spawn(move || {
            // 5000-byte packets: one per buffer, so the third packet needs a
            // completion before it can proceed.
            for i in 0..6u8 {
                if producer_core.on_packet(&vec![i; 5000], true).is_err() {
                    break;
                }
            }
            done_flag.store(true, Ordering::Relaxed);
        });

        let mut completed = 0usize;
        while !done.load(Ordering::Relaxed) {
            assert!(core.status().busy_slots <= 2);
            let next = {
                let enqueued = shared.enqueued.lock().unwrap();
                enqueued.get(completed).map(|(slot_id, _, _)| *slot_id)
            };
            if let Some(slot_id) = next {
                shared.complete(slot_id);
                completed += 1;
            } else {
                thread::sleep(Duration::from_millis(5));
            }
        }
        producer.join().unwrap();

        // Complete the rest so close does not have to reclaim.
        loop {
            let next = {
                let enqueued = shared.enqueued.lock().unwrap();
                enqueued.get(completed).map(|(slot_id, _, _)| *slot_id)
            };
            match next {
                Some(slot_id) => {
                    shared.complete(slot_id);
                    completed += 1;
                }
                None => break,
            }
        }
        core.finish().unwrap();
        let status = core.status();
        assert_eq!(status.busy_slots, 0);
        assert_eq!(status.free_slots, 2);
    }

    #[test]
    fn out_of_order_completions_release_each_slot_once() {
        let config = PlayerConfig {
            buffer_count: 3,
            ..small_config()
        };
        let (core, _events, shared) = core_with(config, false, false, false);
        core.on_format(format()).unwrap();

        // Fill and flush three buffers (the fourth packet forces the third
        // flush), without completing anything yet.
        let producer_core = core.clone();
        let producer = thread::spawn(move || {
            for i in 0..4u8 {
                let _ = producer_core.on_packet(&vec![i; 5000], true);
            }
        });
        while shared.enqueued_count() < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(core.status().busy_slots, 3);

        // Complete in reverse order.
        let ids: Vec<u64> = {
            let enqueued = shared.enqueued.lock().unwrap();
            enqueued.iter().map(|(slot_id, _, _)| *slot_id).collect()
        };
        for slot_id in ids.iter().rev() {
            shared.complete(*slot_id);
        }
        producer.join().unwrap();

        core.finish().unwrap();
        let status = core.status();
        assert_eq!(status.free_slots, 3);
        assert_eq!(status.busy_slots, 0);
    }

    #[test]
    fn zero_packet_close_finishes_once_without_blocking() {
        let (core, events, _shared) = core_with(small_config(), true, false, false);
        core.finish().unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_millis(100)).unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Eof
            }
        );

        // DoubleClose is a no-op and never re-raises the event.
        core.finish().unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(core.status().state, PlaybackState::Closed);
    }

    #[test]
    fn pause_before_device_never_auto_starts() {
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.pause().unwrap();
        core.on_format(format()).unwrap();
        core.on_packet(&[0u8; 5000], true).unwrap();
        core.on_packet(&[1u8; 5000], true).unwrap(); // forces first flush

        assert_eq!(shared.starts(), 0);
        assert_eq!(core.status().state, PlaybackState::Paused);

        // Explicit play once the device exists starts it.
        core.play().unwrap();
        assert_eq!(shared.starts(), 1);
        assert_eq!(core.status().state, PlaybackState::Playing);
        core.finish().unwrap();
    }

    #[test]
    fn intent_before_format_starts_on_first_flush() {
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.play().unwrap();
        core.on_format(format()).unwrap();
        assert_eq!(core.status().state, PlaybackState::Buffering);

        core.on_packet(&[0u8; 5000], true).unwrap();
        assert_eq!(shared.starts(), 0, "no flush yet, no start yet");
        core.on_packet(&[1u8; 5000], true).unwrap();
        assert_eq!(shared.starts(), 1);
        assert_eq!(core.status().state, PlaybackState::Playing);
        core.finish().unwrap();
        assert_eq!(shared.starts(), 1, "start is issued exactly once");
    }

    #[test]
    fn pause_and_resume_toggle_the_device() {
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.play().unwrap();
        core.on_format(format()).unwrap();
        core.on_packet(&[0u8; 5000], true).unwrap();
        core.on_packet(&[1u8; 5000], true).unwrap();
        assert_eq!(core.status().state, PlaybackState::Playing);

        core.pause().unwrap();
        assert_eq!(core.status().state, PlaybackState::Paused);
        assert!(shared.calls.lock().unwrap().contains(&Call::Pause));

        core.play().unwrap();
        assert_eq!(core.status().state, PlaybackState::Playing);
        assert_eq!(shared.starts(), 2);
        core.finish().unwrap();
    }

    #[test]
    fn oversized_packet_is_fatal_and_releases_everything() {
        let (core, events, _shared) = core_with(small_config(), true, false, false);
        core.on_format(format()).unwrap();
        core.on_packet(&[0u8; 100], true).unwrap();

        let err = core.on_packet(&vec![0u8; 9000], true).unwrap_err();
        assert!(matches!(err, PlayerError::OversizedPacket { size: 9000, .. }));

        let status = core.status();
        assert_eq!(status.state, PlaybackState::Closed);
        assert_eq!(status.end_reason, Some(EndReason::Error));
        assert_eq!(status.busy_slots, 0);
        assert_eq!(status.free_slots, 4);
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Error
            }
        );
    }

    #[test]
    fn enqueue_failure_is_terminal_and_releases_everything() {
        let (core, events, _shared) = core_with(small_config(), true, true, false);
        core.play().unwrap();
        core.on_format(format()).unwrap();
        core.on_packet(&[0u8; 5000], true).unwrap();
        let err = core.on_packet(&[1u8; 5000], true).unwrap_err();
        assert!(matches!(err, PlayerError::DeviceEnqueue(_)));

        let status = core.status();
        assert_eq!(status.state, PlaybackState::Closed);
        assert_eq!(status.busy_slots, 0);
        assert_eq!(status.free_slots, 4);
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Error
            }
        );
    }

    #[test]
    fn rejected_format_is_terminal() {
        let (core, events, _shared) = core_with(small_config(), true, false, true);
        let err = core.on_format(format()).unwrap_err();
        assert!(matches!(err, PlayerError::FormatRejected(_)));
        assert_eq!(core.status().state, PlaybackState::Closed);
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Error
            }
        );
    }

    #[test]
    fn second_format_report_is_terminal() {
        let (core, _events, _shared) = core_with(small_config(), true, false, false);
        core.on_format(format()).unwrap();
        let err = core.on_format(format()).unwrap_err();
        assert!(matches!(err, PlayerError::FormatRejected(_)));
        assert_eq!(core.status().state, PlaybackState::Closed);
    }

    #[test]
    fn calls_after_close_fail_with_closed() {
        let (core, _events, _shared) = core_with(small_config(), true, false, false);
        core.finish().unwrap();
        assert!(matches!(core.on_feed(4), Err(PlayerError::Closed)));
        assert!(matches!(core.play(), Err(PlayerError::Closed)));
        assert!(matches!(core.pause(), Err(PlayerError::Closed)));
        assert!(matches!(
            core.on_packet(&[0u8; 4], true),
            Err(PlayerError::Closed)
        ));
    }

    #[test]
    fn feed_transitions_idle_to_awaiting_format() {
        let (core, _events, _shared) = core_with(small_config(), true, false, false);
        assert_eq!(core.status().state, PlaybackState::Idle);
        core.on_feed(128).unwrap();
        let status = core.status();
        assert_eq!(status.state, PlaybackState::AwaitingFormat);
        assert_eq!(status.bytes_fed, 128);
    }

    #[test]
    fn concurrent_close_and_decode_leave_pool_intact() {
        // Race a decode thread against finish; injected sleeps shake the
        // interleaving. Whatever happens, every slot must come back.
        for _ in 0..10 {
            let config = PlayerConfig {
                buffer_count: 2,
                ..small_config()
            };
            let (core, events, _shared) = core_with(config, true, false, false);
            core.play().unwrap();
            core.on_format(format()).unwrap();

            let decode_core = core.clone();
            let decoder = thread::spawn(move || {
                for i in 0..50u8 {
                    if decode_core.on_packet(&vec![i; 3000], true).is_err() {
                        break;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            });

            thread::sleep(Duration::from_millis(2));
            core.begin_close();
            decoder.join().unwrap();
            core.finish().unwrap();

            let status = core.status();
            assert_eq!(status.state, PlaybackState::Closed);
            assert_eq!(status.busy_slots, 0);
            assert_eq!(status.free_slots, 2);

            let mut finished = 0;
            while events.try_recv().is_ok() {
                finished += 1;
            }
            assert_eq!(finished, 1);
        }
    }

    #[test]
    fn volume_before_device_is_applied_on_creation() {
        let (core, _events, _shared) = core_with(small_config(), true, false, false);
        core.set_volume(0.25);
        core.on_format(format()).unwrap();
        core.finish().unwrap();
    }

    /// Minimal mono PCM s16le WAV byte stream.
    fn wav_bytes(sample_rate: u32, frames: usize) -> Vec<u8> {
        let data_len = (frames * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
        out.extend_from_slice(&2u16.to_le_bytes()); // block align
        out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let sample = ((i % 100) as i16 - 50) * 256;
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    #[test]
    fn stream_player_plays_a_wav_stream_end_to_end() {
        let shared = Arc::new(FakeShared::default());
        let factory = FakeFactory {
            shared: shared.clone(),
            auto_complete: true,
            fail_enqueue: false,
            fail_open: false,
        };
        let config = PlayerConfig {
            buffer_count: 4,
            buffer_bytes: 64 * 1024,
            max_descriptors: 512,
            spool_bytes: 8192,
        };
        let (player, events) = StreamPlayer::new(config, Box::new(factory));
        player.play().unwrap();

        let frames = 4096usize;
        for chunk in wav_bytes(44_100, frames).chunks(501) {
            player.feed_bytes(chunk, false).unwrap();
        }
        player.flush_and_close().unwrap();

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Eof
            }
        );
        let status = player.status();
        assert_eq!(status.state, PlaybackState::Closed);
        assert_eq!(status.sample_rate, Some(44_100));
        assert_eq!(status.channels, Some(1));
        assert_eq!(status.end_reason, Some(EndReason::Eof));
        assert!(status.packets_accumulated >= 1);

        // Every decoded f32 sample made it to the device, in order.
        let enqueued = shared.enqueued.lock().unwrap();
        let total: usize = enqueued.iter().map(|(_, bytes, _)| bytes.len()).sum();
        assert_eq!(total, frames * 4);
    }

    #[test]
    fn stream_player_zero_byte_close_is_non_blocking() {
        let shared = Arc::new(FakeShared::default());
        let factory = FakeFactory {
            shared,
            auto_complete: true,
            fail_enqueue: false,
            fail_open: false,
        };
        let (player, events) = StreamPlayer::new(small_config(), Box::new(factory));
        player.flush_and_close().unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            PlayerEvent::Finished {
                reason: EndReason::Eof
            }
        );

        // Idempotent, and the event never repeats.
        player.flush_and_close().unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn partial_buffer_is_flushed_on_close() {
        let (core, _events, shared) = core_with(small_config(), true, false, false);
        core.on_format(format()).unwrap();
        core.on_packet(&[7u8; 123], true).unwrap();
        assert_eq!(shared.enqueued_count(), 0);

        core.finish().unwrap();
        let enqueued = shared.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].1, vec![7u8; 123]);
    }
}
