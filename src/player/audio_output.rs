use crate::core::clock::TimeSource;
use crate::core::error::{CodecError, PlayerError, Result};
use crate::core::types::{AudioFrame, Time, TimePoint};
use crate::player::audio_sink::{AudioSessionId, AudioSink, AudioSinkState, AudioSinkStatus, AudioStart};
use crate::player::codec::{DecodedFrame, Decoder, Packet};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::{process, thread};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 设备不支持首选配置时依次尝试
const FALLBACK_CONFIGS: [(u32, u16); 4] = [
    (48000, 2), // 最常见
    (44100, 2), // CD 音质
    (48000, 1),
    (44100, 1),
];

/// 单个音频会话（每次播放一个）
struct Session {
    status: AudioSinkStatus,
    speed: f64,
    start_position: Time,
    /// 已整帧播完的时长（毫秒）
    played: Time,
    /// 解码线程写入，设备回调读取
    frames: Arc<SegQueue<AudioFrame>>,
    current: Option<AudioFrame>,
    /// 当前帧内的读取位置（源采样帧，带小数）
    cursor: f64,
    /// 结束标记已解码完
    decoded_all: bool,
    last_point: Option<TimePoint>,
}

impl Session {
    fn position(&self) -> Time {
        let partial = match &self.current {
            Some(frame) if frame.sample_rate > 0 => (self.cursor * 1000.0 / frame.sample_rate as f64) as Time,
            _ => 0,
        };
        self.start_position + self.played + partial
    }

    /// 以设备格式混入 output；返回是否已经播放到结尾
    fn mix_into(&mut self, output: &mut [f32], device_rate: u32, device_channels: usize) -> bool {
        for out in output.chunks_exact_mut(device_channels) {
            loop {
                let frame = match self.current.take().or_else(|| self.frames.pop()) {
                    Some(frame) => frame,
                    None => return self.decoded_all,
                };
                let channels = frame.channels.max(1) as usize;
                let total = frame.data.len() / channels;
                let index = self.cursor as usize;
                if index >= total {
                    self.played += frame.duration;
                    self.cursor = (self.cursor - total as f64).max(0.0);
                    continue;
                }
                for (channel, sample) in out.iter_mut().enumerate() {
                    *sample += frame.data[index * channels + channel.min(channels - 1)];
                }
                self.cursor += self.speed * frame.sample_rate as f64 / device_rate as f64;
                self.current = Some(frame);
                break;
            }
        }
        false
    }
}

/// 所有会话，设备回调与控制线程共享
#[derive(Default)]
struct Mixer {
    sessions: HashMap<AudioSessionId, Session>,
}

impl Mixer {
    fn render(&mut self, output: &mut [f32], device_rate: u32, device_channels: usize, now: Time) {
        output.iter_mut().for_each(|sample| *sample = 0.0);
        for (id, session) in self.sessions.iter_mut() {
            if session.status != AudioSinkStatus::Playing {
                continue;
            }
            if session.mix_into(output, device_rate, device_channels) {
                info!("{} 🏁 音频会话 {} 播放到结尾", log_ctx(), id);
                session.status = AudioSinkStatus::StoppedAtEnd;
            }
            session.last_point = Some(TimePoint { track_time: session.position(), world_time: now });
        }
    }
}

/// cpal 音频输出
///
/// 每个会话持有自己的解码器，push_packets 在调用线程解码，
/// 解出的帧通过无锁队列交给设备回调混音。
/// cpal::Stream 不能跨线程，所以设备流在专用线程上创建并持有。
pub struct CpalAudioSink {
    mixer: Arc<Mutex<Mixer>>,
    decoders: Mutex<HashMap<AudioSessionId, Box<dyn Decoder>>>,
    stop_tx: Option<Sender<()>>,
    device_thread: Option<thread::JoinHandle<()>>,
    config: (u32, u16),
}

impl CpalAudioSink {
    pub fn new(time: Arc<dyn TimeSource>) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);

        let thread_mixer = mixer.clone();
        let device_thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match open_stream(thread_mixer, time) {
                    Ok((stream, config)) => {
                        let _ = ready_tx.send(Ok(config));
                        stream
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                info!("{} 音频输出已停止", log_ctx());
            })?;

        let config = ready_rx
            .recv()
            .map_err(|_| PlayerError::Audio("音频线程意外退出".to_string()))??;
        info!("{} 🔊 音频输出已启动: {} Hz, {} 声道", log_ctx(), config.0, config.1);
        Ok(Self {
            mixer,
            decoders: Mutex::new(HashMap::new()),
            stop_tx: Some(stop_tx),
            device_thread: Some(device_thread),
            config,
        })
    }

    /// 实际使用的设备配置（采样率, 声道数）
    pub fn config(&self) -> (u32, u16) {
        self.config
    }

    fn set_status(&self, id: AudioSessionId, status: AudioSinkStatus) {
        if let Some(session) = self.mixer.lock().sessions.get_mut(&id) {
            session.status = status;
        }
    }
}

fn open_stream(mixer: Arc<Mutex<Mixer>>, time: Arc<dyn TimeSource>) -> Result<(cpal::Stream, (u32, u16))> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::Audio("无法找到音频输出设备".to_string()))?;
    debug!("{} 使用音频设备: {}", log_ctx(), device.name().unwrap_or_default());

    let config = choose_config(&device)?;
    let rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.lock().render(data, rate, channels, time.now());
            },
            move |err| {
                error!("{} 音频流错误: {}", log_ctx(), err);
            },
            None,
        )
        .map_err(|e| PlayerError::Audio(format!("创建音频流失败: {}", e)))?;
    stream
        .play()
        .map_err(|e| PlayerError::Audio(format!("启动音频流失败: {}", e)))?;
    Ok((stream, (rate, config.channels)))
}

fn choose_config(device: &Device) -> Result<StreamConfig> {
    for (rate, channels) in FALLBACK_CONFIGS {
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::Audio(format!("无法获取支持的音频配置: {}", e)))?;
        for range in supported {
            if is_config_compatible(&config, &range) {
                return Ok(config);
            }
        }
        warn!("{} ⚠️ 音频设备不支持 {} Hz, {} 声道", log_ctx(), rate, channels);
    }
    Err(PlayerError::Audio("音频设备不支持任何标准配置".to_string()))
}

fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
    config.sample_rate.0 >= supported.min_sample_rate().0
        && config.sample_rate.0 <= supported.max_sample_rate().0
        && config.channels == supported.channels()
}

/// 送入一个包并取出所有可用帧；返回 Ok(true) 表示结束标记之后已经没有帧
fn decode_packet(decoder: &mut dyn Decoder, packet: &Packet, frames: &SegQueue<AudioFrame>) -> std::result::Result<bool, CodecError> {
    loop {
        match decoder.send_packet(packet) {
            Ok(()) => break,
            Err(CodecError::Again) => {
                if drain(decoder, frames)? {
                    return Ok(true);
                }
            }
            Err(error) => return Err(error),
        }
    }
    drain(decoder, frames)
}

fn drain(decoder: &mut dyn Decoder, frames: &SegQueue<AudioFrame>) -> std::result::Result<bool, CodecError> {
    loop {
        match decoder.receive_frame() {
            Ok(DecodedFrame::Audio(frame)) => frames.push(frame),
            Ok(DecodedFrame::Video(_)) => return Err(CodecError::InvalidData),
            Err(CodecError::Again) => return Ok(false),
            Err(CodecError::EndOfFile) => return Ok(true),
            Err(error) => return Err(error),
        }
    }
}

impl AudioSink for CpalAudioSink {
    fn start(&self, id: AudioSessionId, start: AudioStart) {
        let frames = Arc::new(SegQueue::new());
        let start_position = start.first_frame.pts.unwrap_or(start.position);
        frames.push(start.first_frame);
        self.decoders.lock().insert(id, start.decoder);
        self.mixer.lock().sessions.insert(
            id,
            Session {
                status: AudioSinkStatus::Paused,
                speed: start.speed,
                start_position,
                played: 0,
                frames,
                current: None,
                cursor: 0.0,
                decoded_all: false,
                last_point: None,
            },
        );
        debug!("{} 音频会话 {} 已创建，起始 {}ms", log_ctx(), id, start_position);
    }

    fn push_packets(&self, id: AudioSessionId, packets: Vec<Packet>) {
        let Some(frames) = self.mixer.lock().sessions.get(&id).map(|session| session.frames.clone()) else {
            return;
        };
        let mut decoders = self.decoders.lock();
        let Some(decoder) = decoders.get_mut(&id) else {
            return;
        };
        for packet in &packets {
            match decode_packet(decoder.as_mut(), packet, &frames) {
                Ok(true) => {
                    if let Some(session) = self.mixer.lock().sessions.get_mut(&id) {
                        session.decoded_all = true;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    error!("{} ❌ 音频会话 {} 解码失败: {}", log_ctx(), id, error);
                    self.set_status(id, AudioSinkStatus::StoppedAtError);
                    return;
                }
            }
        }
    }

    fn pause(&self, id: AudioSessionId, _time: Time) {
        if let Some(session) = self.mixer.lock().sessions.get_mut(&id) {
            if session.status == AudioSinkStatus::Playing {
                session.status = AudioSinkStatus::Paused;
            }
        }
    }

    fn resume(&self, id: AudioSessionId, time: Time) {
        if let Some(session) = self.mixer.lock().sessions.get_mut(&id) {
            if session.status == AudioSinkStatus::Paused {
                session.status = AudioSinkStatus::Playing;
                session.last_point = Some(TimePoint { track_time: session.position(), world_time: time });
            }
        }
    }

    fn stop(&self, id: AudioSessionId) {
        self.decoders.lock().remove(&id);
        if self.mixer.lock().sessions.remove(&id).is_some() {
            debug!("{} 音频会话 {} 已停止", log_ctx(), id);
        }
    }

    fn set_speed(&self, id: AudioSessionId, speed: f64) {
        if let Some(session) = self.mixer.lock().sessions.get_mut(&id) {
            session.speed = speed;
        }
    }

    fn state(&self, id: AudioSessionId) -> AudioSinkState {
        match self.mixer.lock().sessions.get(&id) {
            Some(session) => AudioSinkState { status: session.status, position: Some(session.position()) },
            None => AudioSinkState { status: AudioSinkStatus::Stopped, position: None },
        }
    }

    fn sync_time_point(&self, id: AudioSessionId) -> Option<TimePoint> {
        let mixer = self.mixer.lock();
        let session = mixer.sessions.get(&id)?;
        (session.status == AudioSinkStatus::Playing).then_some(session.last_point).flatten()
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.device_thread.take() {
            let _ = handle.join();
        }
        debug!("{} CpalAudioSink 已释放", log_ctx());
    }
}
