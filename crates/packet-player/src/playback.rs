//! Bundled cpal output device for interleaved `f32` PCM packet payloads.
//!
//! A worker thread owns the CPAL stream (streams are not `Send`); every
//! other thread talks to the device through shared state:
//! - the real-time callback drains [`PlayQueue`] without blocking, applies
//!   volume, and outputs silence on pause (pause never drains) or underrun
//! - when a slot's chunk is exhausted the callback posts a completion
//!   message, which is how slots find their way back to the pool

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;
use packet_player_types::StreamFormat;

use crate::accumulator::PacketDescriptor;
use crate::device::{self, OutputDevice, OutputDeviceFactory};

struct Chunk {
    slot_id: u64,
    samples: Vec<f32>,
    pos: usize,
}

struct QueueInner {
    chunks: VecDeque<Chunk>,
}

/// Chunk queue between `enqueue` and the real-time callback.
///
/// Exactly one completion is sent per pushed chunk, either when the callback
/// exhausts it or when [`PlayQueue::clear`] discards it.
pub(crate) struct PlayQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    completions: Sender<u64>,
}

impl PlayQueue {
    pub(crate) fn new(completions: Sender<u64>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
            }),
            cv: Condvar::new(),
            completions,
        }
    }

    pub(crate) fn push(&self, slot_id: u64, samples: Vec<f32>) {
        let mut g = self.inner.lock().unwrap();
        g.chunks.push_back(Chunk {
            slot_id,
            samples,
            pos: 0,
        });
    }

    /// Copy up to `out.len()` samples into `out`, in push order.
    ///
    /// Non-blocking. Sends a completion for every chunk it exhausts.
    pub(crate) fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut g = self.inner.lock().unwrap();
        let mut written = 0;
        while written < out.len() {
            let Some(chunk) = g.chunks.front_mut() else {
                break;
            };
            let take = (out.len() - written).min(chunk.samples.len() - chunk.pos);
            out[written..written + take]
                .copy_from_slice(&chunk.samples[chunk.pos..chunk.pos + take]);
            chunk.pos += take;
            written += take;
            if chunk.pos == chunk.samples.len() {
                let slot_id = chunk.slot_id;
                g.chunks.pop_front();
                let _ = self.completions.send(slot_id);
            }
        }
        drop(g);
        if written > 0 {
            self.cv.notify_all();
        }
        written
    }

    /// Discard all queued chunks, sending their completions.
    pub(crate) fn clear(&self) {
        let mut g = self.inner.lock().unwrap();
        while let Some(chunk) = g.chunks.pop_front() {
            let _ = self.completions.send(chunk.slot_id);
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Block until the callback has drained every queued chunk.
    pub(crate) fn wait_empty(&self) {
        let mut g = self.inner.lock().unwrap();
        while !g.chunks.is_empty() {
            g = self.cv.wait(g).unwrap();
        }
    }

    #[cfg(test)]
    fn queued_chunks(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }
}

/// Reinterpret a packet payload as interleaved little-endian `f32` samples.
fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(anyhow!(
            "payload of {} bytes is not a whole number of f32 samples",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Opens [`CpalOutput`] devices, optionally matching a device name substring.
#[derive(Clone, Debug, Default)]
pub struct CpalOutputFactory {
    pub device_name: Option<String>,
}

impl OutputDeviceFactory for CpalOutputFactory {
    fn open(&self, format: &StreamFormat, completions: Sender<u64>) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalOutput::open(
            format,
            completions,
            self.device_name.clone(),
        )?))
    }
}

/// cpal-backed output device. Constructed paused.
pub struct CpalOutput {
    queue: Arc<PlayQueue>,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the device and start its worker thread. Fails when no matching
    /// output device exists or the stream format is unsupported.
    pub fn open(
        format: &StreamFormat,
        completions: Sender<u64>,
        device_name: Option<String>,
    ) -> Result<Self> {
        let queue = Arc::new(PlayQueue::new(completions));
        let paused = Arc::new(AtomicBool::new(true));
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = {
            let format = *format;
            let queue = queue.clone();
            let paused = paused.clone();
            let volume = volume.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                worker_main(
                    format,
                    device_name,
                    queue,
                    paused,
                    volume,
                    shutdown,
                    ready_tx,
                )
            })
        };

        ready_rx
            .recv()
            .map_err(|_| anyhow!("output worker exited before reporting readiness"))??;

        Ok(Self {
            queue,
            paused,
            volume,
            shutdown,
            worker: Some(worker),
        })
    }

    fn signal_shutdown(&self) {
        let (lock, cv) = &*self.shutdown;
        let mut g = lock.lock().unwrap();
        *g = true;
        drop(g);
        cv.notify_all();
    }
}

impl OutputDevice for CpalOutput {
    fn enqueue(&mut self, slot_id: u64, bytes: &[u8], _descriptors: &[PacketDescriptor]) -> Result<()> {
        if self.worker.is_none() {
            return Err(anyhow!("device is stopped"));
        }
        let samples = bytes_to_samples(bytes)?;
        self.queue.push(slot_id, samples);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self, immediate: bool) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if immediate || self.paused.load(Ordering::Relaxed) {
            // A paused callback never drains, so draining would hang.
            self.queue.clear();
        } else {
            self.queue.wait_empty();
        }
        self.signal_shutdown();
        if worker.join().is_err() {
            tracing::error!("output worker thread panicked");
        }
        // Anything enqueued between wait_empty and shutdown still completes.
        self.queue.clear();
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop(true);
    }
}

/// Owns the CPAL stream for the lifetime of the device.
fn worker_main(
    format: StreamFormat,
    device_name: Option<String>,
    queue: Arc<PlayQueue>,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    ready_tx: Sender<Result<()>>,
) {
    let stream = (|| -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, device_name.as_deref())?;
        let (config, sample_format) = device::pick_stream_config(&device, &format)?;
        let stream = build_output_stream(&device, &config, sample_format, queue, paused, volume)?;
        stream.play()?;
        Ok(stream)
    })();

    match stream {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            let (lock, cv) = &*shutdown;
            let mut g = lock.lock().unwrap();
            while !*g {
                g = cv.wait(g).unwrap();
            }
            drop(stream);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: Arc<PlayQueue>,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, paused, volume),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, paused, volume),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, paused, volume),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, paused, volume),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<PlayQueue>,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if paused.load(Ordering::Relaxed) {
                data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                return;
            }

            scratch.resize(data.len(), 0.0);
            let written = queue.pop_into(&mut scratch[..data.len()]);
            let gain = f32::from_bits(volume.load(Ordering::Relaxed));

            for (out, sample) in data.iter_mut().zip(scratch.iter().take(written)) {
                *out = <T as cpal::Sample>::from_sample::<f32>(sample * gain);
            }
            // Underrun: pad the rest with silence.
            for out in data.iter_mut().skip(written) {
                *out = <T as cpal::Sample>::from_sample::<f32>(0.0);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
