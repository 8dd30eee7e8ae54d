use crate::core::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};

/// 时间（毫秒）
pub type Time = i64;

/// 时长不可用（例如只有一帧的视频、无时长信息的流）
pub const DURATION_UNAVAILABLE: Time = Time::MAX;

/// 播放速度范围
pub const SPEED_MIN: f64 = 0.5;
pub const SPEED_MAX: f64 = 2.0;

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

/// 视频帧数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrame {
    pub pts: Option<Time>,  // 显示时间戳（毫秒），未知为 None
    pub duration: Time,     // 帧持续时间（毫秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,      // CPU 内存数据
}

/// 音频帧数据
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pts: Option<Time>,  // 显示时间戳（毫秒），未知为 None
    pub duration: Time,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub data: Vec<f32>,     // 统一使用 f32 交错格式
}

/// 播放模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Audio,
    Video,
    Both,
    /// 只读取开头信息（时长、尺寸、封面），然后停止
    Inspection,
}

impl Mode {
    pub fn wants_audio(self) -> bool {
        !matches!(self, Mode::Video)
    }

    pub fn wants_video(self) -> bool {
        !matches!(self, Mode::Audio)
    }
}

/// 一次 play() 的参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    pub position: Time,
    pub mode: Mode,
    pub speed: f64,
    pub looping: bool,
    pub seekable: bool,
    /// 渲染端需要显式 mark_frame_shown()，此时不丢弃过期帧
    pub wait_for_mark_as_shown: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            position: 0,
            mode: Mode::Both,
            speed: 1.0,
            looping: false,
            seekable: true,
            wait_for_mark_as_shown: false,
        }
    }
}

impl PlaybackOptions {
    /// 在启动任何线程之前检查参数
    pub fn validate(&self) -> Result<()> {
        validate_speed(self.speed)?;
        if self.looping && self.mode == Mode::Both {
            return Err(PlayerError::LoopWithBothTracks);
        }
        Ok(())
    }
}

pub fn validate_speed(speed: f64) -> Result<()> {
    if (SPEED_MIN..=SPEED_MAX).contains(&speed) {
        Ok(())
    } else {
        Err(PlayerError::InvalidSpeed(speed))
    }
}

/// 单条轨道的状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub position: Option<Time>,
    pub received_till: Option<Time>,
    pub duration: Option<Time>,
}

impl TrackState {
    /// 合并新的状态：来源中已知的 duration / position 覆盖当前值，
    /// received_till 只增不减并夹在 [position, duration] 内
    pub fn save_valid(&mut self, from: &TrackState) {
        if from.duration.is_some() {
            self.duration = from.duration;
        }
        if from.position.is_some() {
            self.position = from.position;
        }
        let Some(mut till) = from.received_till else {
            return;
        };
        if let Some(position) = self.position {
            till = till.max(position);
        }
        if let Some(duration) = self.duration {
            if duration != DURATION_UNAVAILABLE {
                till = till.min(duration);
            }
        }
        match self.received_till {
            Some(current) if current >= till => {}
            _ => self.received_till = Some(till),
        }
    }

    /// 整条轨道是否已经接收完毕
    pub fn full_received(&self) -> bool {
        match (self.duration, self.received_till) {
            (Some(duration), Some(till)) => duration != DURATION_UNAVAILABLE && till == duration,
            _ => false,
        }
    }

    /// position 之后至少还有 amount 毫秒数据（或已全部接收）
    pub fn received_enough(&self, amount: Time, looping: bool) -> bool {
        if !looping && self.full_received() {
            return true;
        }
        match (self.position, self.received_till, self.duration) {
            (Some(position), Some(till), Some(duration)) => {
                position.saturating_add(amount.min(duration)) <= till
            }
            _ => false,
        }
    }
}

/// 音频轨道信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioInformation {
    pub state: TrackState,
}

/// 视频轨道信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoInformation {
    pub state: TrackState,
    pub size: (u32, u32),
    pub rotation: i32,
    pub alpha: bool,
    pub cover: Option<VideoFrame>,
}

/// 会话开始时产生的媒体信息，之后逐步完善
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Information {
    pub audio: AudioInformation,
    pub video: VideoInformation,
    pub header_size: usize,
}

impl Information {
    /// 合并轨道 ready 时带来的起始信息，只覆盖未知字段
    pub fn save_valid_start(&mut self, from: Information) {
        self.audio.state.save_valid(&from.audio.state);
        self.video.state.save_valid(&from.video.state);
        if from.video.size != (0, 0) {
            self.video.size = from.video.size;
            self.video.rotation = from.video.rotation;
            self.video.alpha = from.video.alpha;
        }
        if from.video.cover.is_some() {
            self.video.cover = from.video.cover;
        }
        if from.header_size != 0 {
            self.header_size = from.header_size;
        }
    }
}

/// 轨道时间与世界时间（单调时钟）的对应关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePoint {
    pub track_time: Time,
    pub world_time: Time,
}

/// 取帧参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameRequest {
    /// 目标尺寸（最近邻缩放，仅 RGBA）
    pub resize: Option<(u32, u32)>,
}

/// 播放器对外事件
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Information(Information),
    VideoPlayback(Time),
    AudioPlayback(Time),
    VideoPreloaded(Time),
    AudioPreloaded(Time),
    WaitingForData(bool),
    Finished,
}

/// 播放状态（兼容旧接口的快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    StoppedAtStart,
    StoppedAtEnd,
    StoppedAtError,
    Paused,
    Playing,
}

/// 播放器状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub position: Time,   // 当前位置（毫秒）
    pub length: Time,     // 总时长（毫秒）
    pub received_till: Option<Time>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Stopped,
            position: 0,
            length: 0,
            received_till: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn options_reject_speed_out_of_range() {
        for speed in [0.0, 0.49, 2.01, -1.0, f64::NAN] {
            let options = PlaybackOptions { speed, ..Default::default() };
            assert!(matches!(options.validate(), Err(PlayerError::InvalidSpeed(_))));
        }
        for speed in [0.5, 1.0, 1.5, 2.0] {
            let options = PlaybackOptions { speed, ..Default::default() };
            assert!(options.validate().is_ok());
        }
    }

    #[test]
    fn options_reject_loop_with_both_tracks() {
        let options = PlaybackOptions { looping: true, mode: Mode::Both, ..Default::default() };
        assert!(matches!(options.validate(), Err(PlayerError::LoopWithBothTracks)));

        let options = PlaybackOptions { looping: true, mode: Mode::Video, ..Default::default() };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn save_valid_keeps_known_fields() {
        let mut state = TrackState { position: Some(100), received_till: Some(500), duration: Some(1000) };
        state.save_valid(&TrackState::default());
        assert_eq!(state, TrackState { position: Some(100), received_till: Some(500), duration: Some(1000) });
    }

    #[test]
    fn save_valid_overwrites_known_duration_and_position() {
        let mut state = TrackState { position: Some(100), received_till: Some(500), duration: Some(1000) };
        state.save_valid(&TrackState { position: Some(200), received_till: Some(300), duration: Some(2000) });
        assert_eq!(state.position, Some(200));
        assert_eq!(state.duration, Some(2000));
        assert_eq!(state.received_till, Some(500));
    }

    #[test]
    fn save_valid_clamps_received_till() {
        let mut state = TrackState { position: Some(300), received_till: None, duration: Some(1000) };
        state.save_valid(&TrackState { received_till: Some(100), ..Default::default() });
        assert_eq!(state.received_till, Some(300));

        state.save_valid(&TrackState { received_till: Some(5000), ..Default::default() });
        assert_eq!(state.received_till, Some(1000));
        assert!(state.full_received());
    }

    #[test]
    fn received_till_never_regresses() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut state = TrackState { position: Some(0), received_till: None, duration: Some(10_000) };
            let mut last = None;
            for _ in 0..200 {
                let update = TrackState {
                    position: if rng.gen_bool(0.3) { Some(rng.gen_range(0..10_000)) } else { None },
                    received_till: Some(rng.gen_range(0..12_000)),
                    duration: None,
                };
                state.save_valid(&update);
                if let (Some(previous), Some(current)) = (last, state.received_till) {
                    assert!(current >= previous, "{} < {}", current, previous);
                }
                last = state.received_till;
            }
        }
    }

    #[test]
    fn received_enough_respects_duration_and_loop() {
        let state = TrackState { position: Some(1000), received_till: Some(3000), duration: Some(3000) };
        assert!(state.received_enough(5000, false));
        // 循环播放时整条接收完毕不算“足够”，按窗口判断
        assert!(!state.received_enough(2500, true));
        assert!(state.received_enough(2000, true));

        let state = TrackState { position: Some(1000), received_till: Some(2000), duration: Some(10_000) };
        assert!(!state.received_enough(3000, false));
        assert!(state.received_enough(1000, false));
    }

    #[test]
    fn information_start_merge() {
        let mut information = Information::default();
        let mut from = Information::default();
        from.video.size = (640, 360);
        from.video.state = TrackState { position: Some(0), received_till: Some(0), duration: Some(10_000) };
        from.header_size = 128 * 1024;
        information.save_valid_start(from);
        assert_eq!(information.video.size, (640, 360));
        assert_eq!(information.video.state.duration, Some(10_000));
        assert_eq!(information.header_size, 128 * 1024);

        information.save_valid_start(Information::default());
        assert_eq!(information.video.size, (640, 360));
        assert_eq!(information.header_size, 128 * 1024);
    }
}
