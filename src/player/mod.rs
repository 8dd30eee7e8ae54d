// 流媒体播放核心模块

pub mod loader;
pub mod cache;
pub mod reader;
pub mod codec;
pub mod stream;
pub mod frame_ring;
pub mod audio_sink;
pub mod audio_track;
pub mod video_track;
pub mod file;
pub mod player;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_backend;
#[cfg(feature = "audio-output")]
pub mod audio_output;

#[cfg(test)]
pub(crate) mod testing;

pub use loader::{CacheKey, FileLoader, LoadedPart, Loader, PartSink};
pub use cache::{CacheStore, MemoryCache};
pub use reader::Reader;
pub use codec::{CodecBackend, Container, DecodedFrame, Decoder, MediaIo, MediaKind, Packet, Rational, StreamInfo};
pub use audio_sink::{AudioSessionId, AudioSink, AudioSinkState, AudioSinkStatus, AudioStart};
pub use file::{File, FileDelegate, FileStartOptions};
pub use player::{Player, PlayerCaps};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_backend::FfmpegBackend;
#[cfg(feature = "audio-output")]
pub use audio_output::CpalAudioSink;
