//! myy_streaming - 边下边播流媒体内核
//!
//! 分片加载（Loader / Reader）、解封装线程（File）、音视频轨道与播放状态机（Player）。

pub mod core;
pub mod player;

pub use crate::core::{Error, PlayerError, Result, StreamingConfig};
pub use crate::player::{Player, PlayerCaps};
