//! Output device seam and cpal device selection.
//!
//! The pipeline talks to playback hardware through the narrow
//! [`OutputDevice`] trait; [`crate::playback::CpalOutput`] is the bundled
//! implementation. The selection helpers are thin wrappers around CPAL for
//! choosing an output device by name and a stream config for a stream format.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Sender;
use packet_player_types::StreamFormat;

use crate::accumulator::PacketDescriptor;

/// A playback device consuming filled buffers.
///
/// Contract:
/// - the device is constructed **paused**; it produces no audio until
///   [`OutputDevice::start`] is called (`start` doubles as resume)
/// - for every buffer accepted by `enqueue`, exactly one completion carrying
///   the same `slot_id` is eventually sent on the completion channel handed
///   to the factory — including buffers discarded by `stop(immediate)`
/// - buffers are consumed in enqueue order (no reordering)
pub trait OutputDevice: Send {
    /// Hand a filled buffer to the device. The bytes belong to the device
    /// until it reports completion for `slot_id`.
    fn enqueue(
        &mut self,
        slot_id: u64,
        bytes: &[u8],
        descriptors: &[PacketDescriptor],
    ) -> Result<()>;

    /// Start or resume audible playback.
    fn start(&mut self) -> Result<()>;

    /// Hold playback without draining queued buffers.
    fn pause(&mut self) -> Result<()>;

    /// Stop the device. `immediate` discards queued buffers (their
    /// completions are still delivered); otherwise the device drains queued
    /// audio first and this call blocks until it has.
    fn stop(&mut self, immediate: bool) -> Result<()>;

    /// Set the playback gain, `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32) -> Result<()>;
}

/// Constructs an [`OutputDevice`] once the stream format is known.
pub trait OutputDeviceFactory: Send + Sync {
    /// Open a device for `format`. Completions for enqueued buffers are sent
    /// on `completions`. Failure here means the format cannot be played and
    /// is terminal for the stream instance.
    fn open(
        &self,
        format: &StreamFormat,
        completions: Sender<u64>,
    ) -> Result<Box<dyn OutputDevice>>;
}

/// Pick a CPAL output device by case-insensitive name substring, or the host
/// default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose a stream config for `format` on `device`.
///
/// The pipeline has no resampler or channel mapper, so the device must
/// support the stream's channel count and sample rate exactly; anything else
/// is a format rejection.
pub fn pick_stream_config(
    device: &cpal::Device,
    format: &StreamFormat,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat)> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("No supported output configs")?
        .collect();

    let mut best: Option<(u8, cpal::SampleFormat)> = None;
    for range in &ranges {
        if range.channels() != format.channels {
            continue;
        }
        if format.sample_rate < range.min_sample_rate()
            || format.sample_rate > range.max_sample_rate()
        {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        if best.map(|(b, _)| rank < b).unwrap_or(true) {
            best = Some((rank, range.sample_format()));
        }
    }

    let (_, sample_format) = best.ok_or_else(|| {
        anyhow!(
            "device does not support {} ch @ {} Hz",
            format.channels,
            format.sample_rate
        )
    })?;

    Ok((
        cpal::StreamConfig {
            channels: format.channels,
            sample_rate: format.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        },
        sample_format,
    ))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
