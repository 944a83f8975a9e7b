use thiserror::Error;

/// Terminal failure kinds surfaced by the player.
///
/// Every variant except [`PlayerError::Closed`] tears the stream instance
/// down before it is reported: all acquired slots are returned to the pool
/// and the device is released. There is no retry inside the pipeline;
/// transient network/decoder failures are the packet source's problem.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The output device could not be constructed for the reported format.
    #[error("output device rejected stream format: {0}")]
    FormatRejected(String),

    /// A decoded packet is larger than a pool slot. This is a configuration
    /// error (slot capacity must cover the codec's maximum packet size), not
    /// a runtime condition the pipeline recovers from.
    #[error("decoded packet of {size} bytes exceeds slot capacity of {capacity} bytes")]
    OversizedPacket { size: usize, capacity: usize },

    /// The output device rejected a filled buffer.
    #[error("output device rejected buffer: {0}")]
    DeviceEnqueue(String),

    /// The stream already reached its terminal state.
    #[error("stream is closed")]
    Closed,
}
