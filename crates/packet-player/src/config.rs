/// Pipeline tuning parameters shared by the pool, accumulator, and source.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Number of pool slots (N). Bounds how far decode can run ahead of the
    /// output device.
    pub buffer_count: usize,
    /// Capacity of each slot in bytes (C). Also the hard upper bound on a
    /// single decoded packet.
    pub buffer_bytes: usize,
    /// Maximum packet descriptors per buffer (M). Reaching it forces a flush
    /// regardless of byte occupancy.
    pub max_descriptors: usize,
    /// Capacity of the raw-byte spool feeding the decoder. A full spool
    /// blocks `feed_bytes`, propagating device backpressure to the caller.
    pub spool_bytes: usize,
}

impl Default for PlayerConfig {
    /// Defaults sized for decoded interleaved f32 audio: a single MP3 frame
    /// at 44.1 kHz stereo decodes to 9216 bytes, so slots need headroom well
    /// past that.
    fn default() -> Self {
        Self {
            buffer_count: 16,
            buffer_bytes: 64 * 1024,
            max_descriptors: 512,
            spool_bytes: 256 * 1024,
        }
    }
}
