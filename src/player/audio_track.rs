use crate::core::error::{CodecError, Error};
use crate::core::types::{AudioFrame, AudioInformation, PlaybackOptions, Time, TrackState};
use crate::player::audio_sink::{AudioSessionId, AudioSink, AudioSinkStatus, AudioStart, AudioSyncSource};
use crate::player::codec::{DecodedFrame, Packet};
use crate::player::stream::{read_next_frame, Stream};
use log::{debug, error, info};
use std::process;
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 音频轨道（DemuxWorker 线程）
///
/// 自己只解码到第一帧，之后把解码器和后续的包都交给外部音频输出。
pub struct AudioTrack {
    options: PlaybackOptions,
    stream: Stream,
    sink: Arc<dyn AudioSink>,
    id: AudioSessionId,
    skip_invalid: u32,
    ready: Option<Box<dyn FnOnce(AudioInformation) + Send>>,
    error: Box<dyn Fn(Error) + Send>,
    started: bool,
    failed: bool,
    read_till_end: bool,
    initial_skipping_frame: Option<AudioFrame>,
}

impl AudioTrack {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: PlaybackOptions,
        stream: Stream,
        sink: Arc<dyn AudioSink>,
        id: AudioSessionId,
        skip_invalid: u32,
        ready: Box<dyn FnOnce(AudioInformation) + Send>,
        error: Box<dyn Fn(Error) + Send>,
    ) -> Self {
        Self {
            options,
            stream,
            sink,
            id,
            skip_invalid,
            ready: Some(ready),
            error,
            started: false,
            failed: false,
            read_till_end: false,
            initial_skipping_frame: None,
        }
    }

    pub fn stream_index(&self) -> Option<usize> {
        self.stream.index
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// 启动阶段完成，解码器已交给音频输出
    pub fn initialized(&self) -> bool {
        self.started
    }

    pub fn process(&mut self, packets: Vec<Packet>) {
        if self.failed || packets.is_empty() {
            return;
        }
        if self.started {
            self.forward(packets);
            return;
        }
        for packet in packets {
            if packet.is_end_of_stream() {
                self.read_till_end = true;
            }
            self.stream.queue.push_back(packet);
        }
        self.try_bootstrap();
    }

    /// 循环播放时结束标记不交给音频输出，新一轮的包直接接在后面
    fn forward(&self, packets: Vec<Packet>) {
        let packets: Vec<Packet> = if self.options.looping {
            packets.into_iter().filter(|packet| !packet.is_end_of_stream()).collect()
        } else {
            packets
        };
        if !packets.is_empty() {
            self.sink.push_packets(self.id, packets);
        }
    }

    fn try_bootstrap(&mut self) {
        loop {
            match read_next_frame(&mut self.stream, self.skip_invalid) {
                Ok(DecodedFrame::Audio(frame)) => {
                    let Some(position) = frame.pts else {
                        error!("{} ❌ 音频帧没有时间戳", log_ctx());
                        return self.fail(Error::InvalidData);
                    };
                    if position < self.options.position {
                        // 向后 seek 落在请求位置之前，继续丢帧
                        self.initial_skipping_frame = Some(frame);
                        continue;
                    }
                    return self.start_output(frame, position);
                }
                Ok(DecodedFrame::Video(_)) => return self.fail(Error::InvalidData),
                Err(CodecError::EndOfFile) => {
                    // seek 越过了最后一帧：退回到最后一个有效帧
                    let fallback = self.initial_skipping_frame.take();
                    match fallback.and_then(|frame| frame.pts.map(|pts| (frame, pts))) {
                        Some((frame, position)) => return self.start_output(frame, position),
                        None => return self.fail(Error::InvalidData),
                    }
                }
                Err(CodecError::Again) => return,
                Err(error) => {
                    error!("{} ❌ 音频启动解码失败: {}", log_ctx(), error);
                    return self.fail(Error::InvalidData);
                }
            }
        }
    }

    fn start_output(&mut self, frame: AudioFrame, position: Time) {
        let Some(decoder) = self.stream.decoder.take() else {
            return self.fail(Error::InvalidData);
        };
        let remaining: Vec<Packet> = self.stream.queue.drain(..).collect();
        let duration = self.stream.duration;
        let received_till = if self.read_till_end { duration } else { Some(position) };

        info!("{} 🔊 音频轨道就绪: 起始位置 {}ms, 时长 {:?}", log_ctx(), position, duration);
        self.sink.start(
            self.id,
            AudioStart {
                decoder,
                first_frame: frame,
                position,
                duration,
                speed: self.options.speed,
            },
        );
        self.started = true;
        self.forward(remaining);

        if let Some(ready) = self.ready.take() {
            ready(AudioInformation {
                state: TrackState { position: Some(position), received_till, duration },
            });
        }
    }

    fn fail(&mut self, error: Error) {
        if self.failed {
            return;
        }
        self.failed = true;
        (self.error)(error);
    }
}

/// 音频输出状态的轮询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPoll {
    Pending,
    Position(Time),
    Finished,
    Failed,
}

/// 音频轨道的控制端（Player 线程）
#[derive(Clone)]
pub struct AudioTrackHandle {
    sink: Arc<dyn AudioSink>,
    id: AudioSessionId,
}

impl AudioTrackHandle {
    pub fn new(sink: Arc<dyn AudioSink>, id: AudioSessionId) -> Self {
        Self { sink, id }
    }

    pub fn id(&self) -> AudioSessionId {
        self.id
    }

    pub fn pause(&self, time: Time) {
        self.sink.pause(self.id, time);
    }

    pub fn resume(&self, time: Time) {
        self.sink.resume(self.id, time);
    }

    pub fn set_speed(&self, speed: f64) {
        self.sink.set_speed(self.id, speed);
    }

    pub fn stop(&self) {
        debug!("{} 停止音频会话 {}", log_ctx(), self.id);
        self.sink.stop(self.id);
    }

    pub fn poll(&self) -> AudioPoll {
        let state = self.sink.state(self.id);
        match state.status {
            AudioSinkStatus::StoppedAtError | AudioSinkStatus::StoppedAtStart => AudioPoll::Failed,
            AudioSinkStatus::StoppedAtEnd => AudioPoll::Finished,
            AudioSinkStatus::Stopped => AudioPoll::Pending,
            _ => state.position.map_or(AudioPoll::Pending, AudioPoll::Position),
        }
    }

    pub fn sync_source(&self) -> AudioSyncSource {
        AudioSyncSource { sink: self.sink.clone(), id: self.id }
    }
}
