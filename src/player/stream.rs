use crate::core::error::CodecError;
use crate::core::types::{Time, DURATION_UNAVAILABLE};
use crate::player::codec::{DecodedFrame, Decoder, Packet, Rational, StreamInfo};
use log::warn;
use std::collections::VecDeque;
use std::process;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 一路流的解码上下文：由 DemuxWorker 创建，交给对应轨道独占
pub struct Stream {
    pub index: Option<usize>,
    pub info: Option<StreamInfo>,
    pub time_base: Rational,
    /// None = 未知；DURATION_UNAVAILABLE = 不可用
    pub duration: Option<Time>,
    pub decoder: Option<Box<dyn Decoder>>,
    pub queue: VecDeque<Packet>,
    /// 连续无效包计数
    pub invalid_data_packets: u32,
}

impl Stream {
    pub fn empty() -> Self {
        Self {
            index: None,
            info: None,
            time_base: Rational::MILLISECONDS,
            duration: None,
            decoder: None,
            queue: VecDeque::new(),
            invalid_data_packets: 0,
        }
    }

    /// 有可用的解码器
    pub fn is_active(&self) -> bool {
        self.decoder.is_some()
    }

    /// 包的位置（毫秒），优先用 pts
    pub fn packet_position(&self, packet: &Packet) -> Option<Time> {
        packet.pts.or(packet.dts).map(|pts| self.time_base.to_time(pts))
    }

    /// 包的结束位置（毫秒）
    pub fn packet_end(&self, packet: &Packet) -> Option<Time> {
        let pts = packet.pts.or(packet.dts)?;
        Some(self.time_base.to_time(pts.saturating_add(packet.duration.max(0))))
    }
}

/// 计算流时长
///
/// 先用流自身时长，否则用容器时长；都未知时为“不可用”。
/// 返回 None 表示时长不合法，这路流应当被禁用。
pub fn compute_stream_duration(
    info: &StreamInfo,
    container_duration: Option<Time>,
    duration_max: Time,
) -> Option<Time> {
    let duration = match (info.duration, container_duration) {
        (Some(duration), _) => Some(info.time_base.to_time(duration)),
        (None, Some(duration)) => Some(duration),
        (None, None) => None,
    };
    match duration {
        None => Some(DURATION_UNAVAILABLE),
        Some(duration) if duration <= 0 => None,
        Some(duration) => {
            let duration = duration.saturating_add(1);
            (duration <= duration_max).then_some(duration)
        }
    }
}

/// 把一个包送进解码器，连续无效包在阈值以内时跳过
pub fn process_packet(
    stream: &mut Stream,
    packet: &Packet,
    skip_invalid: u32,
) -> std::result::Result<(), CodecError> {
    let Some(decoder) = stream.decoder.as_mut() else {
        return Err(CodecError::Fatal("流没有解码器".into()));
    };
    match decoder.send_packet(packet) {
        Ok(()) => Ok(()),
        Err(CodecError::InvalidData) => skip_invalid_packet(stream, skip_invalid),
        Err(CodecError::Again) => Err(CodecError::Fatal("解码器拒绝输入".into())),
        Err(error) => Err(error),
    }
}

fn skip_invalid_packet(stream: &mut Stream, skip_invalid: u32) -> std::result::Result<(), CodecError> {
    stream.invalid_data_packets += 1;
    if stream.invalid_data_packets <= skip_invalid {
        warn!(
            "{} ⚠️ 跳过无效数据包 ({}/{})",
            log_ctx(),
            stream.invalid_data_packets,
            skip_invalid
        );
        Ok(())
    } else {
        Err(CodecError::InvalidData)
    }
}

/// 解码下一帧：没有输出时从队列取包送入解码器
///
/// 队列为空时返回 Again，结束标记之后返回 EndOfFile。
pub fn read_next_frame(
    stream: &mut Stream,
    skip_invalid: u32,
) -> std::result::Result<DecodedFrame, CodecError> {
    loop {
        let Some(decoder) = stream.decoder.as_mut() else {
            return Err(CodecError::Fatal("流没有解码器".into()));
        };
        match decoder.receive_frame() {
            Ok(frame) => {
                stream.invalid_data_packets = 0;
                return Ok(frame);
            }
            Err(CodecError::Again) => {
                let Some(packet) = stream.queue.pop_front() else {
                    return Err(CodecError::Again);
                };
                process_packet(stream, &packet, skip_invalid)?;
            }
            Err(CodecError::InvalidData) => skip_invalid_packet(stream, skip_invalid)?,
            Err(error) => return Err(error),
        }
    }
}
