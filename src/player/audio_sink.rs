use crate::core::types::{AudioFrame, Time, TimePoint};
use crate::player::codec::{Decoder, Packet};
use std::sync::Arc;

/// 音频会话标识（每次 play() 一个）
pub type AudioSessionId = u64;

/// 音频输出会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSinkStatus {
    Starting,
    Playing,
    Pausing,
    Paused,
    Resuming,
    StoppedAtEnd,
    StoppedAtError,
    StoppedAtStart,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSinkState {
    pub status: AudioSinkStatus,
    /// 当前播放位置（毫秒），循环播放时持续增长
    pub position: Option<Time>,
}

/// 启动一个音频会话所需的数据
pub struct AudioStart {
    pub decoder: Box<dyn Decoder>,
    /// 启动阶段解码出的第一帧（已跳过请求位置之前的帧）
    pub first_frame: AudioFrame,
    pub position: Time,
    pub duration: Option<Time>,
    pub speed: f64,
}

/// 外部音频输出（混音器）
///
/// start() 之后会话处于暂停状态，直到 resume()。
pub trait AudioSink: Send + Sync {
    fn start(&self, id: AudioSessionId, start: AudioStart);

    /// 追加压缩包；空包是结束标记
    fn push_packets(&self, id: AudioSessionId, packets: Vec<Packet>);

    fn pause(&self, id: AudioSessionId, time: Time);

    fn resume(&self, id: AudioSessionId, time: Time);

    fn stop(&self, id: AudioSessionId);

    fn set_speed(&self, id: AudioSessionId, speed: f64);

    fn state(&self, id: AudioSessionId) -> AudioSinkState;

    /// 最近一次确认的（播放位置，世界时间）
    fn sync_time_point(&self, id: AudioSessionId) -> Option<TimePoint>;

    fn supports_speed_control(&self) -> bool {
        true
    }
}

/// 视频用来跟随音频时钟的数据源
#[derive(Clone)]
pub struct AudioSyncSource {
    pub sink: Arc<dyn AudioSink>,
    pub id: AudioSessionId,
}

impl AudioSyncSource {
    pub fn time_point(&self) -> Option<TimePoint> {
        self.sink.sync_time_point(self.id)
    }
}
