pub mod accumulator;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod player;
pub mod playback;
pub mod pool;
pub mod scheduler;

pub use config::PlayerConfig;
pub use error::PlayerError;
pub use player::{PlayerCore, PlayerEvent, StreamPlayer};
pub use packet_player_types::{EndReason, PlaybackState, PlayerStatus, StreamFormat};
