//! Streaming packet source seam and the bundled Symphonia implementation.
//!
//! The pipeline consumes decoders through two narrow traits:
//! - [`PacketSource`]: fed raw bytes by the caller
//! - [`PacketSink`]: receives the stream format once known, then one decoded
//!   packet at a time, in decode order, on the decode thread
//!
//! [`SymphoniaSource`] bridges the push-style `feed` to Symphonia's
//! pull-style reader with a bounded blocking byte spool: the decode thread
//! blocks reading an empty spool, and `feed` blocks pushing into a full one,
//! so output-device backpressure propagates all the way to the caller.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use packet_player_types::StreamFormat;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::PlayerError;

/// Receives decode output. Implemented by the player core.
///
/// Both callbacks run on the decode thread; `on_packet` may block (that is
/// the backpressure mechanism) and must be invoked in decode order.
pub trait PacketSink: Send + Sync {
    /// Called once, when container probing learns the stream format.
    fn on_format(&self, format: StreamFormat) -> Result<(), PlayerError>;

    /// Called per decoded packet. `last_in_batch` hints that the decoder has
    /// consumed everything fed so far.
    fn on_packet(&self, payload: &[u8], last_in_batch: bool) -> Result<(), PlayerError>;
}

/// A decoder turning raw stream bytes into packets for a [`PacketSink`].
pub trait PacketSource: Send + Sync {
    /// Feed a chunk of raw bytes. May block when the source is saturated.
    /// `discontinuity` signals a gap (e.g. a network seek) after which
    /// packet boundaries restart cleanly.
    fn feed(&self, bytes: &[u8], discontinuity: bool);

    /// Signal end of input and wait for in-flight decode callbacks to
    /// finish. After this returns no further sink callbacks occur.
    /// Idempotent, and callable while another thread is blocked in `feed`
    /// (the blocked feed returns early).
    fn close(&self);
}

struct SpoolInner {
    queue: VecDeque<u8>,
    pushed: u64,
    closed: bool,
}

/// Bounded byte queue between the feeding thread and the decode thread.
pub(crate) struct ByteSpool {
    inner: Mutex<SpoolInner>,
    cv: Condvar,
    max_bytes: usize,
}

impl ByteSpool {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(SpoolInner {
                queue: VecDeque::new(),
                pushed: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            max_bytes,
        }
    }

    /// Push bytes, blocking while the spool is full.
    ///
    /// Returns early (dropping the remainder) once the spool is closed, so a
    /// blocked feeder cannot wedge shutdown.
    pub(crate) fn push_blocking(&self, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let mut g = self.inner.lock().unwrap();
            while g.queue.len() >= self.max_bytes && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return;
            }
            let room = self.max_bytes - g.queue.len();
            let take = room.min(bytes.len() - offset);
            g.queue.extend(&bytes[offset..offset + take]);
            g.pushed += take as u64;
            offset += take;
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Drop bytes the decoder has not consumed yet (stream discontinuity).
    pub(crate) fn discard_pending(&self) {
        let mut g = self.inner.lock().unwrap();
        let dropped = g.queue.len();
        g.queue.clear();
        drop(g);
        if dropped > 0 {
            tracing::debug!(dropped, "spool discarded pending bytes at discontinuity");
        }
        self.cv.notify_all();
    }

    /// Close the spool: readers see EOF once drained, pushers return early.
    /// Idempotent.
    pub(crate) fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub(crate) fn total_pushed(&self) -> u64 {
        self.inner.lock().unwrap().pushed
    }
}

/// Blocking, non-seekable reader over a [`ByteSpool`] for Symphonia.
pub(crate) struct SpoolReader {
    spool: Arc<ByteSpool>,
    pos: u64,
}

impl SpoolReader {
    pub(crate) fn new(spool: Arc<ByteSpool>) -> Self {
        Self { spool, pos: 0 }
    }
}

impl Read for SpoolReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut g = self.spool.inner.lock().unwrap();
        while g.queue.is_empty() && !g.closed {
            g = self.spool.cv.wait(g).unwrap();
        }
        // True EOF only when the writer closed AND everything is drained.
        if g.queue.is_empty() {
            return Ok(0);
        }
        let take = buf.len().min(g.queue.len());
        for byte in buf.iter_mut().take(take) {
            *byte = g.queue.pop_front().unwrap_or(0);
        }
        drop(g);
        self.spool.cv.notify_all();
        self.pos += take as u64;
        Ok(take)
    }
}

impl Seek for SpoolReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "spool reader is not seekable",
            )),
        }
    }
}

impl MediaSource for SpoolReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Symphonia-backed [`PacketSource`].
///
/// A background thread probes the container from the spool, reports the
/// stream format, and then decodes packets into interleaved little-endian
/// `f32` payload bytes for the sink.
pub struct SymphoniaSource {
    spool: Arc<ByteSpool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SymphoniaSource {
    /// Spawn the decode thread. `spool_bytes` bounds how far the caller's
    /// feed can run ahead of the decoder.
    pub fn spawn(sink: Arc<dyn PacketSink>, spool_bytes: usize) -> Self {
        let spool = Arc::new(ByteSpool::new(spool_bytes));
        let spool_for_thread = spool.clone();
        let handle = thread::spawn(move || {
            let reader = SpoolReader::new(spool_for_thread.clone());
            if let Err(e) = decode_loop(reader, sink.as_ref()) {
                if spool_for_thread.total_pushed() == 0 {
                    tracing::debug!("decoder exited on empty stream: {e:#}");
                } else {
                    tracing::error!("decoder thread error: {e:#}");
                }
            }
        });
        Self {
            spool,
            handle: Mutex::new(Some(handle)),
        }
    }
}

impl PacketSource for SymphoniaSource {
    fn feed(&self, bytes: &[u8], discontinuity: bool) {
        if discontinuity {
            // Codecs with self-delimiting frames (MP3, ADTS) resynchronize
            // on the next sync word; the decoder keeps running.
            self.spool.discard_pending();
        }
        self.spool.push_blocking(bytes);
    }

    fn close(&self) {
        self.spool.close();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("decoder thread panicked");
            }
        }
    }
}

impl Drop for SymphoniaSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Probe the container, report the format, then decode packets until EOF.
fn decode_loop(reader: SpoolReader, sink: &dyn PacketSink) -> Result<()> {
    let mss = MediaSourceStream::new(Box::new(reader), Default::default());
    let probed = symphonia::default::get_probe().format(
        &Hint::new(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let codec_params = track.codec_params.clone();

    sink.on_format(StreamFormat {
        sample_rate: rate,
        channels: channels as u16,
    })?;

    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;
    let mut payload = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(_) => break, // EOF
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        payload.clear();
        payload.reserve(sample_buf.samples().len() * 4);
        for sample in sample_buf.samples() {
            payload.extend_from_slice(&sample.to_le_bytes());
        }

        match sink.on_packet(&payload, true) {
            Ok(()) => {}
            Err(PlayerError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
