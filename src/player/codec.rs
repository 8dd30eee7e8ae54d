use crate::core::error::CodecError;
use crate::core::types::{AudioFrame, Time, VideoFrame};
use std::io::{Read, Seek};

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

/// 时间基
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MILLISECONDS: Rational = Rational { num: 1, den: 1000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// 流时间戳 -> 毫秒（向零取整）
    pub fn to_time(self, pts: i64) -> Time {
        if !self.is_valid() {
            return 0;
        }
        let value = pts as i128 * self.num as i128 * 1000 / self.den as i128;
        value.clamp(i64::MIN as i128, i64::MAX as i128) as Time
    }

    /// 毫秒 -> 流时间戳
    pub fn from_time(self, time: Time) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        let value = time as i128 * self.den as i128 / (self.num as i128 * 1000);
        value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// 容器中一路流的静态信息
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: Rational,
    /// 以 time_base 为单位，未知为 None
    pub duration: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
    pub alpha: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 压缩数据包
///
/// data 为空表示该路流的结束标记（解码器进入 drain）。
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn end_of_stream(stream_index: usize) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            keyframe: false,
            data: Vec::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }
}

/// 解码出的帧（时间戳已换算为毫秒）
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl DecodedFrame {
    pub fn pts(&self) -> Option<Time> {
        match self {
            DecodedFrame::Video(frame) => frame.pts,
            DecodedFrame::Audio(frame) => frame.pts,
        }
    }
}

/// 单路流的解码器
///
/// send_packet / receive_frame 的语义：
/// - Again：需要更多输入（或输出队列满，需要先 receive）
/// - EndOfFile：结束标记之后已经没有帧
pub trait Decoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), CodecError>;

    fn receive_frame(&mut self) -> std::result::Result<DecodedFrame, CodecError>;

    /// 清空内部状态（seek / 循环后）
    fn flush(&mut self);
}

/// 已打开的容器（只在 DemuxWorker 线程中使用）
pub trait Container {
    fn streams(&self) -> Vec<StreamInfo>;

    /// 某类型的最佳流
    fn best_stream(&self, kind: MediaKind) -> Option<usize>;

    /// 容器级时长（毫秒）
    fn duration(&self) -> Option<Time>;

    fn open_decoder(&mut self, index: usize) -> std::result::Result<Box<dyn Decoder>, CodecError>;

    /// 读取下一个包，文件结束返回 EndOfFile
    fn read_packet(&mut self) -> std::result::Result<Packet, CodecError>;

    /// 向后偏置的 seek：落在 position 之前（或等于）最近的关键帧
    fn seek(&mut self, stream_index: usize, position: Time) -> std::result::Result<(), CodecError>;
}

/// 容器读取字节的数据源（绑定到 Reader）
pub trait MediaIo: Read + Seek + Send {
    fn size(&self) -> u64;
}

/// 编解码能力（FFmpeg 或测试用的合成格式）
pub trait CodecBackend: Send + Sync {
    fn open(&self, io: Box<dyn MediaIo>) -> std::result::Result<Box<dyn Container>, CodecError>;
}
