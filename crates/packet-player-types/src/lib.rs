use serde::{Deserialize, Serialize};

/// Immutable stream format reported by the packet source once probing succeeds.
///
/// A player instance handles exactly one format for its lifetime; a format
/// change requires a new stream instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

/// Reason why a stream instance reached its terminal state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The caller closed the stream after feeding all bytes; playback drained.
    Eof,
    /// Decoder, buffer, or output device error interrupted playback.
    Error,
}

/// Lifecycle state of a player instance.
///
/// Transitions: `Idle → AwaitingFormat → Buffering → Playing ↔ Paused`,
/// with `Draining → Closed` reachable from every state via close.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Created; no bytes fed yet.
    #[default]
    Idle,
    /// Bytes are being fed but the source has not reported a format yet.
    AwaitingFormat,
    /// Format known, device constructed, no buffer handed to the device yet.
    Buffering,
    /// The device is consuming buffers audibly.
    Playing,
    /// The device exists but playback is held (explicitly or by intent).
    Paused,
    /// Close in progress: partial buffer flushed, device draining.
    Draining,
    /// Terminal. All further calls are no-ops or fail with "stream closed".
    Closed,
}

/// Point-in-time status snapshot of a player instance.
///
/// Counter fields are best-effort: they can change immediately after the
/// snapshot is taken.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    /// Current lifecycle state.
    pub state: PlaybackState,
    /// `true` when the caller asked playback to start once possible.
    pub play_requested: bool,
    /// Stream sample rate, once known.
    pub sample_rate: Option<u32>,
    /// Stream channel count, once known.
    pub channels: Option<u16>,
    /// Configured slot count (N).
    pub buffer_count: usize,
    /// Configured slot capacity in bytes (C).
    pub buffer_bytes: usize,
    /// Slots currently owned by the accumulator or the device.
    pub busy_slots: usize,
    /// Slots currently free in the pool.
    pub free_slots: usize,
    /// Raw bytes fed by the caller so far.
    pub bytes_fed: u64,
    /// Decoded packets accumulated so far.
    pub packets_accumulated: u64,
    /// Filled buffers handed to the output device so far.
    pub buffers_flushed: u64,
    /// Terminal reason, set once the stream closes.
    pub end_reason: Option<EndReason>,
}
