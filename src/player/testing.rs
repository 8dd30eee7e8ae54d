//! 测试用的合成媒体格式、加载器和音频输出

use crate::core::clock::TimeSource;
use crate::core::error::CodecError;
use crate::core::types::{AudioFrame, PixelFormat, SampleFormat, Time, TimePoint, VideoFrame};
use crate::player::audio_sink::{AudioSessionId, AudioSink, AudioSinkState, AudioSinkStatus, AudioStart};
use crate::player::codec::{
    CodecBackend, Container, DecodedFrame, Decoder, MediaIo, MediaKind, Packet, Rational, StreamInfo,
};
use crate::player::loader::{CacheKey, LoadedPart, Loader, PartSink, PART_SIZE};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAGIC: &[u8; 4] = b"MYYS";
const RECORD_HEADER: u64 = 22;
const FLAG_INVALID: u8 = 1;
const FLAG_KEYFRAME: u8 = 2;
const INVALID_BYTE: u8 = 0xFF;

pub fn sample_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8).collect()
}

/// 合成文件中的一路流
#[derive(Debug, Clone, Copy)]
pub struct TrackLayout {
    pub kind: MediaKind,
    /// 写进流头的时长，None 表示未知
    pub duration: Option<Time>,
    /// 实际内容长度
    pub length: Time,
    pub frame: Time,
    pub payload: usize,
    /// 从第几个包开始全部是无效数据
    pub invalid_from: Option<usize>,
}

impl TrackLayout {
    pub fn video(length: Time) -> Self {
        Self { kind: MediaKind::Video, duration: Some(length), length, frame: 40, payload: 64, invalid_from: None }
    }

    pub fn audio(length: Time) -> Self {
        Self { kind: MediaKind::Audio, duration: Some(length), length, frame: 20, payload: 32, invalid_from: None }
    }
}

/// 生成合成容器：流表之后是按时间交错的包记录
pub fn media_file(video: Option<TrackLayout>, audio: Option<TrackLayout>) -> Vec<u8> {
    let tracks: Vec<TrackLayout> = video.into_iter().chain(audio).collect();
    let mut data = MAGIC.to_vec();
    data.push(tracks.len() as u8);
    for track in &tracks {
        data.push(match track.kind {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
            MediaKind::Other => 2,
        });
        data.extend_from_slice(&track.duration.unwrap_or(-1).to_le_bytes());
    }

    let mut records: Vec<(Time, usize, usize)> = Vec::new();
    for (index, track) in tracks.iter().enumerate() {
        let count = (track.length / track.frame) as usize;
        records.extend((0..count).map(|number| (number as Time * track.frame, index, number)));
    }
    records.sort_unstable();

    for (pts, index, number) in records {
        let track = &tracks[index];
        let invalid = track.invalid_from.map_or(false, |from| number >= from);
        data.push(index as u8);
        data.extend_from_slice(&pts.to_le_bytes());
        data.extend_from_slice(&track.frame.to_le_bytes());
        data.push(FLAG_KEYFRAME | if invalid { FLAG_INVALID } else { 0 });
        data.extend_from_slice(&(track.payload as u32).to_le_bytes());
        let first = if invalid { INVALID_BYTE } else { 1 };
        data.push(first);
        data.extend((1..track.payload).map(|i| (i as u8) ^ (pts as u8)));
    }
    data
}

pub fn synthetic_packet(stream_index: usize, pts: Time, duration: Time, invalid: bool) -> Packet {
    Packet {
        stream_index,
        pts: Some(pts),
        dts: Some(pts),
        duration,
        keyframe: true,
        data: if invalid { vec![INVALID_BYTE] } else { vec![1, 2, 3, 4] },
    }
}

/// 无状态解码器：每个有效包解出一帧
pub struct SyntheticDecoder {
    kind: MediaKind,
    time_base: Rational,
    pending: VecDeque<DecodedFrame>,
    draining: bool,
}

impl SyntheticDecoder {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind, time_base: Rational::MILLISECONDS, pending: VecDeque::new(), draining: false }
    }

    fn frame(&self, packet: &Packet) -> DecodedFrame {
        let pts = packet.pts.map(|pts| self.time_base.to_time(pts));
        let duration = self.time_base.to_time(packet.duration);
        match self.kind {
            MediaKind::Audio => DecodedFrame::Audio(AudioFrame {
                pts,
                duration,
                sample_rate: 48000,
                channels: 2,
                format: SampleFormat::F32,
                data: vec![0.0; (duration.max(0) * 96) as usize],
            }),
            _ => DecodedFrame::Video(VideoFrame {
                pts,
                duration,
                width: 4,
                height: 4,
                format: PixelFormat::RGBA,
                data: vec![(pts.unwrap_or(0) % 251) as u8; 64],
            }),
        }
    }
}

impl Decoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        if packet.is_end_of_stream() {
            self.draining = true;
            return Ok(());
        }
        if self.draining {
            return Err(CodecError::Fatal("结束标记之后送入数据".into()));
        }
        if packet.data.first() == Some(&INVALID_BYTE) {
            return Err(CodecError::InvalidData);
        }
        let frame = self.frame(packet);
        self.pending.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodedFrame, CodecError> {
        match self.pending.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(CodecError::EndOfFile),
            None => Err(CodecError::Again),
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

pub struct SyntheticBackend;

impl CodecBackend for SyntheticBackend {
    fn open(&self, io: Box<dyn MediaIo>) -> Result<Box<dyn Container>, CodecError> {
        Ok(Box::new(SyntheticContainer::parse(io)?))
    }
}

struct RecordHeader {
    stream_index: usize,
    pts: i64,
    duration: i64,
    flags: u8,
    len: u64,
}

struct SyntheticContainer {
    io: Box<dyn MediaIo>,
    streams: Vec<StreamInfo>,
    data_start: u64,
    position: u64,
}

fn io_error(error: std::io::Error) -> CodecError {
    CodecError::Fatal(error.to_string())
}

impl SyntheticContainer {
    fn parse(mut io: Box<dyn MediaIo>) -> Result<Self, CodecError> {
        let mut magic = [0u8; 4];
        io.read_exact(&mut magic).map_err(io_error)?;
        if &magic != MAGIC {
            return Err(CodecError::InvalidData);
        }
        let mut count = [0u8; 1];
        io.read_exact(&mut count).map_err(io_error)?;
        let mut streams = Vec::new();
        for index in 0..count[0] as usize {
            let mut entry = [0u8; 9];
            io.read_exact(&mut entry).map_err(io_error)?;
            let kind = match entry[0] {
                0 => MediaKind::Video,
                1 => MediaKind::Audio,
                _ => MediaKind::Other,
            };
            let mut duration = [0u8; 8];
            duration.copy_from_slice(&entry[1..9]);
            let duration = i64::from_le_bytes(duration);
            streams.push(StreamInfo {
                index,
                kind,
                time_base: Rational::MILLISECONDS,
                duration: (duration >= 0).then_some(duration),
                width: 4,
                height: 4,
                rotation: 0,
                alpha: false,
                sample_rate: 48000,
                channels: 2,
            });
        }
        let data_start = 5 + 9 * count[0] as u64;
        Ok(Self { io, streams, data_start, position: data_start })
    }

    fn read_header(&mut self) -> Result<RecordHeader, CodecError> {
        let mut header = [0u8; RECORD_HEADER as usize];
        self.io.read_exact(&mut header).map_err(io_error)?;
        let int = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&header[range]);
            i64::from_le_bytes(bytes)
        };
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[18..22]);
        Ok(RecordHeader {
            stream_index: header[0] as usize,
            pts: int(1..9),
            duration: int(9..17),
            flags: header[17],
            len: u32::from_le_bytes(len) as u64,
        })
    }
}

impl Container for SyntheticContainer {
    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        self.streams.iter().find(|info| info.kind == kind).map(|info| info.index)
    }

    fn duration(&self) -> Option<Time> {
        None
    }

    fn open_decoder(&mut self, index: usize) -> Result<Box<dyn Decoder>, CodecError> {
        let info = self.streams.get(index).ok_or(CodecError::InvalidData)?;
        Ok(Box::new(SyntheticDecoder::new(info.kind)))
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        if self.position >= self.io.size() {
            return Err(CodecError::EndOfFile);
        }
        let header = self.read_header()?;
        let mut data = vec![0u8; header.len as usize];
        self.io.read_exact(&mut data).map_err(io_error)?;
        self.position += RECORD_HEADER + header.len;
        Ok(Packet {
            stream_index: header.stream_index,
            pts: Some(header.pts),
            dts: Some(header.pts),
            duration: header.duration,
            keyframe: header.flags & FLAG_KEYFRAME != 0,
            data,
        })
    }

    fn seek(&mut self, stream_index: usize, position: Time) -> Result<(), CodecError> {
        let size = self.io.size();
        let mut offset = self.data_start;
        let mut target = self.data_start;
        self.io.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        while offset < size {
            let header = self.read_header()?;
            if header.stream_index == stream_index && header.flags & FLAG_KEYFRAME != 0 {
                if header.pts > position {
                    break;
                }
                target = offset;
            }
            offset += RECORD_HEADER + header.len;
            self.io.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        }
        self.io.seek(SeekFrom::Start(target)).map_err(io_error)?;
        self.position = target;
        Ok(())
    }
}

/// 同步的手动加载器：记录请求，由测试决定何时交付
pub struct ManualLoader {
    data: Vec<u8>,
    remote: bool,
    sink: Mutex<Option<PartSink>>,
    loads: Mutex<Vec<u64>>,
    cancels: Mutex<Vec<u64>>,
    priority: AtomicI32,
}

impl ManualLoader {
    pub fn new(data: Vec<u8>, remote: bool) -> Self {
        Self {
            data,
            remote,
            sink: Mutex::new(None),
            loads: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            priority: AtomicI32::new(0),
        }
    }

    pub fn loads(&self) -> Vec<u64> {
        self.loads.lock().clone()
    }

    pub fn cancels(&self) -> Vec<u64> {
        self.cancels.lock().clone()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn deliver(&self, offset: u64) {
        let start = offset as usize;
        let end = (start + PART_SIZE).min(self.data.len());
        self.deliver_raw(LoadedPart { offset, bytes: self.data[start..end].to_vec() });
    }

    pub fn deliver_raw(&self, part: LoadedPart) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.deliver(part);
        }
    }
}

impl Loader for ManualLoader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn cache_key(&self) -> Option<CacheKey> {
        self.remote.then_some(CacheKey { high: 7, low: 42 })
    }

    fn attach(&self, sink: PartSink) {
        *self.sink.lock() = Some(sink);
    }

    fn load(&self, offset: u64) {
        self.loads.lock().push(offset);
    }

    fn cancel(&self, offset: u64) {
        self.cancels.lock().push(offset);
    }

    fn reset_priorities(&self) {}

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    fn stop(&self) {}
}

enum MemoryCommand {
    Attach(PartSink),
    Load(u64),
    Stop,
}

/// 在后台线程异步交付内存数据；可以限制只交付 limit 以内的块
pub struct MemoryLoader {
    size: u64,
    remote: bool,
    commands: Sender<MemoryCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryLoader {
    /// 带缓存键，Reader 会把它当作远程加载器
    pub fn remote(data: Vec<u8>) -> Self {
        let mut loader = Self::new(data, None);
        loader.remote = true;
        loader
    }

    pub fn new(data: Vec<u8>, limit: Option<u64>) -> Self {
        Self::spawn(data, limit, None)
    }

    /// 远程加载器，攒下的请求打乱顺序并带随机延迟交付
    pub fn shuffled(data: Vec<u8>, seed: u64) -> Self {
        let mut loader = Self::spawn(data, None, Some(seed));
        loader.remote = true;
        loader
    }

    fn spawn(data: Vec<u8>, limit: Option<u64>, seed: Option<u64>) -> Self {
        let size = data.len() as u64;
        let (commands, rx) = unbounded::<MemoryCommand>();
        let handle = thread::spawn(move || {
            let mut rng = seed.map(StdRng::seed_from_u64);
            let mut sink: Option<PartSink> = None;
            let mut pending: Vec<u64> = Vec::new();
            while let Ok(command) = rx.recv() {
                let mut stop = false;
                for command in std::iter::once(command).chain(rx.try_iter()) {
                    match command {
                        MemoryCommand::Attach(attached) => sink = Some(attached),
                        MemoryCommand::Load(offset) => pending.push(offset - offset % PART_SIZE as u64),
                        MemoryCommand::Stop => stop = true,
                    }
                }
                if stop {
                    break;
                }
                if let Some(rng) = rng.as_mut() {
                    pending.shuffle(rng);
                }
                for start in pending.drain(..) {
                    let end = (start + PART_SIZE as u64).min(size);
                    if limit.map_or(false, |limit| end > limit) {
                        continue;
                    }
                    if let Some(rng) = rng.as_mut() {
                        thread::sleep(Duration::from_micros(rng.gen_range(0..2000)));
                    }
                    if let Some(sink) = &sink {
                        let bytes = data[start as usize..end as usize].to_vec();
                        sink.deliver(LoadedPart { offset: start, bytes });
                    }
                }
            }
        });
        Self { size, remote: false, commands, handle: Mutex::new(Some(handle)) }
    }
}

impl Loader for MemoryLoader {
    fn size(&self) -> u64 {
        self.size
    }

    fn cache_key(&self) -> Option<CacheKey> {
        self.remote.then_some(CacheKey { high: 9, low: 1 })
    }

    fn attach(&self, sink: PartSink) {
        let _ = self.commands.send(MemoryCommand::Attach(sink));
    }

    fn load(&self, offset: u64) {
        let _ = self.commands.send(MemoryCommand::Load(offset));
    }

    fn cancel(&self, _offset: u64) {}

    fn reset_priorities(&self) {}

    fn set_priority(&self, _priority: i32) {}

    fn stop(&self) {
        let _ = self.commands.send(MemoryCommand::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 会话的可观察记录
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionRecord {
    pub start_position: Time,
    /// 收到的非结束标记包数
    pub packets: usize,
    pub end_received: bool,
    pub status: AudioSinkStatus,
}

struct SinkSession {
    record: SessionRecord,
    speed: f64,
    /// 已经可以播放到的位置
    available: Time,
    anchor_position: Time,
    anchor_world: Time,
}

impl SinkSession {
    fn position(&self, now: Time) -> Time {
        let position = match self.record.status {
            AudioSinkStatus::Playing => {
                self.anchor_position + ((now - self.anchor_world) as f64 * self.speed).round() as Time
            }
            _ => self.anchor_position,
        };
        position.min(self.available)
    }

    fn refresh(&mut self, now: Time) {
        if self.record.status == AudioSinkStatus::Playing
            && self.record.end_received
            && self.position(now) >= self.available
        {
            self.anchor_position = self.available;
            self.record.status = AudioSinkStatus::StoppedAtEnd;
        }
    }
}

/// 按时钟“播放”的音频输出，不产生声音
pub struct RecordingAudioSink {
    time: Arc<dyn TimeSource>,
    sessions: Mutex<HashMap<AudioSessionId, SinkSession>>,
}

impl RecordingAudioSink {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self { time, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn session(&self, id: AudioSessionId) -> Option<SessionRecord> {
        self.sessions.lock().get(&id).map(|session| session.record)
    }

    pub fn force_status(&self, id: AudioSessionId, status: AudioSinkStatus) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(id).or_insert_with(|| SinkSession {
            record: SessionRecord { start_position: 0, packets: 0, end_received: false, status },
            speed: 1.0,
            available: 0,
            anchor_position: 0,
            anchor_world: 0,
        });
        session.record.status = status;
    }
}

impl AudioSink for RecordingAudioSink {
    fn start(&self, id: AudioSessionId, start: AudioStart) {
        let session = SinkSession {
            record: SessionRecord {
                start_position: start.position,
                packets: 0,
                end_received: false,
                status: AudioSinkStatus::Paused,
            },
            speed: start.speed,
            available: start.position + start.first_frame.duration,
            anchor_position: start.position,
            anchor_world: self.time.now(),
        };
        self.sessions.lock().insert(id, session);
    }

    fn push_packets(&self, id: AudioSessionId, packets: Vec<Packet>) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        for packet in packets {
            if packet.is_end_of_stream() {
                session.record.end_received = true;
            } else {
                session.record.packets += 1;
                session.available += packet.duration;
            }
        }
    }

    fn pause(&self, id: AudioSessionId, time: Time) {
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            if session.record.status == AudioSinkStatus::Playing {
                session.anchor_position = session.position(time);
                session.record.status = AudioSinkStatus::Paused;
            }
        }
    }

    fn resume(&self, id: AudioSessionId, time: Time) {
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            if session.record.status == AudioSinkStatus::Paused {
                session.anchor_world = time;
                session.record.status = AudioSinkStatus::Playing;
            }
        }
    }

    fn stop(&self, id: AudioSessionId) {
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            session.record.status = AudioSinkStatus::Stopped;
        }
    }

    fn set_speed(&self, id: AudioSessionId, speed: f64) {
        let now = self.time.now();
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            session.anchor_position = session.position(now);
            session.anchor_world = now;
            session.speed = speed;
        }
    }

    fn state(&self, id: AudioSessionId) -> AudioSinkState {
        let now = self.time.now();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(session) => {
                session.refresh(now);
                AudioSinkState { status: session.record.status, position: Some(session.position(now)) }
            }
            None => AudioSinkState { status: AudioSinkStatus::Stopped, position: None },
        }
    }

    fn sync_time_point(&self, id: AudioSessionId) -> Option<TimePoint> {
        let now = self.time.now();
        let sessions = self.sessions.lock();
        let session = sessions.get(&id)?;
        (session.record.status == AudioSinkStatus::Playing)
            .then(|| TimePoint { track_time: session.position(now), world_time: now })
    }
}
