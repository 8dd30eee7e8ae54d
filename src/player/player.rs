use crate::core::clock::TimeSource;
use crate::core::config::StreamingConfig;
use crate::core::error::{Error, PlayerError, Result};
use crate::core::types::{
    validate_speed, AudioInformation, FrameRequest, Information, Mode, PlaybackOptions, PlaybackState,
    PlayerState, Time, TrackState, Update, VideoFrame, VideoInformation, DURATION_UNAVAILABLE,
};
use crate::player::audio_sink::{AudioSessionId, AudioSink, AudioSyncSource};
use crate::player::audio_track::{AudioPoll, AudioTrack, AudioTrackHandle};
use crate::player::cache::CacheStore;
use crate::player::codec::{CodecBackend, Packet};
use crate::player::file::{File, FileDelegate, FileStartOptions};
use crate::player::frame_ring::NextFrame;
use crate::player::loader::Loader;
use crate::player::reader::Reader;
use crate::player::stream::Stream;
use crate::player::video_track::{VideoEvent, VideoShared, VideoTrack, VideoTrackHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

static NEXT_AUDIO_SESSION: AtomicU64 = AtomicU64::new(1);

/// 播放器依赖的外部能力
#[derive(Clone)]
pub struct PlayerCaps {
    pub backend: Arc<dyn CodecBackend>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub time: Arc<dyn TimeSource>,
    pub config: StreamingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Uninitialized,
    Initializing,
    Ready,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    Audio,
    Video,
}

/// worker 线程发给控制线程的事件
enum SessionEvent {
    Opened {
        header_size: usize,
        audio: bool,
        video: Option<Arc<VideoShared>>,
        total_duration: Time,
    },
    AudioReady(AudioInformation),
    VideoReady(VideoInformation),
    AudioReceivedTill(Time),
    VideoReceivedTill(Time),
    Video(VideoEvent),
    WaitingForData,
    FullInCache(bool),
    DurationByPackets(Time),
    Failed(Error),
}

/// 带会话代数的事件发送端，旧会话的事件在控制线程被丢弃
#[derive(Clone)]
struct EventSender {
    generation: u64,
    tx: Sender<(u64, SessionEvent)>,
}

impl EventSender {
    fn send(&self, event: SessionEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// 控制线程与 worker 共享的读取开关
struct SessionShared {
    pause_reading: AtomicBool,
    /// 已播放到的位置（含循环偏移），worker 据此限制循环读取的提前量
    played_till: AtomicI64,
    /// worker 因循环提前量过大而停止读取
    loop_parked: AtomicBool,
    load_in_advance: Time,
}

impl SessionShared {
    fn new(position: Time, load_in_advance: Time) -> Self {
        Self {
            pause_reading: AtomicBool::new(false),
            played_till: AtomicI64::new(position),
            loop_parked: AtomicBool::new(false),
            load_in_advance,
        }
    }
}

/// 流媒体播放器（控制线程）
///
/// 所有事件都在 update() 中处理，对外通过 updates() / errors() 两个通道发布。
pub struct Player {
    caps: PlayerCaps,
    file: File,
    remote: bool,
    options: PlaybackOptions,
    stage: Stage,
    generation: u64,
    events_tx: Sender<(u64, SessionEvent)>,
    events_rx: Receiver<(u64, SessionEvent)>,
    updates_tx: Sender<Update>,
    updates_rx: Receiver<Update>,
    errors_tx: Sender<Error>,
    errors_rx: Receiver<Error>,
    session: Option<Arc<SessionShared>>,
    audio_id: AudioSessionId,
    audio: Option<AudioTrackHandle>,
    video: Option<VideoTrackHandle>,
    information: Information,
    total_duration: Time,
    duration_by_packets: Time,
    full_in_cache_since_start: Option<bool>,
    previous_received_till: Option<Time>,
    last_failure: Option<Error>,
    paused: bool,
    paused_by_user: bool,
    paused_by_waiting_for_data: bool,
    audio_finished: bool,
    video_finished: bool,
    last_audio_position: Option<Time>,
    next_frame_time: NextFrame,
    current_frame_time: Time,
}

impl Player {
    pub fn new(loader: Arc<dyn Loader>, cache: Option<Arc<dyn CacheStore>>, caps: PlayerCaps) -> Self {
        let reader = Arc::new(Reader::new(loader, cache, caps.config.clone()));
        let remote = reader.is_remote_loader();
        let file = File::new(reader, caps.backend.clone(), caps.config.clone());
        let (events_tx, events_rx) = unbounded();
        let (updates_tx, updates_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();
        info!("{} 🎮 创建播放器（远程加载器: {}）", log_ctx(), remote);
        Self {
            caps,
            file,
            remote,
            options: PlaybackOptions::default(),
            stage: Stage::Uninitialized,
            generation: 0,
            events_tx,
            events_rx,
            updates_tx,
            updates_rx,
            errors_tx,
            errors_rx,
            session: None,
            audio_id: 0,
            audio: None,
            video: None,
            information: Information::default(),
            total_duration: DURATION_UNAVAILABLE,
            duration_by_packets: 0,
            full_in_cache_since_start: None,
            previous_received_till: None,
            last_failure: None,
            paused: false,
            paused_by_user: false,
            paused_by_waiting_for_data: false,
            audio_finished: false,
            video_finished: false,
            last_audio_position: None,
            next_frame_time: NextFrame::Unknown,
            current_frame_time: 0,
        }
    }

    /// 播放事件（Information、位置、缓冲、结束）
    pub fn updates(&self) -> Receiver<Update> {
        self.updates_rx.clone()
    }

    /// 会话失败
    pub fn errors(&self) -> Receiver<Error> {
        self.errors_rx.clone()
    }

    /// 开始新的会话（旧会话先停止）
    pub fn play(&mut self, options: PlaybackOptions) -> Result<()> {
        options.validate()?;

        let previous = self.current_received_till(self.compute_total_duration());
        self.stop_session(true);
        self.save_previous_received_till(&options, previous);
        self.last_failure = None;

        let mut options = options;
        if !self.caps.audio_sink.supports_speed_control() {
            options.speed = 1.0;
        }
        if !options.seekable {
            options.position = 0;
        }
        self.options = options;
        self.audio_id = NEXT_AUDIO_SESSION.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new(SessionShared::new(options.position, self.load_in_advance()));
        let delegate = SessionDelegate::new(
            EventSender { generation: self.generation, tx: self.events_tx.clone() },
            options,
            self.caps.clone(),
            self.audio_id,
            shared.clone(),
        );
        self.stage = Stage::Initializing;
        self.session = Some(shared);
        let start = FileStartOptions { position: options.position, seekable: options.seekable, mode: options.mode };
        if let Err(error) = self.file.start(Box::new(delegate), start) {
            error!("{} ❌ 启动 DemuxWorker 失败: {}", log_ctx(), error);
            self.stage = Stage::Uninitialized;
            self.session = None;
            return Err(error);
        }
        info!(
            "{} ▶️ 播放: 位置 {}ms, 模式 {:?}, 速度 {}, 循环 {}",
            log_ctx(),
            options.position,
            options.mode,
            options.speed,
            options.looping
        );
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.active() {
            return Err(PlayerError::NotActive);
        }
        self.paused_by_user = true;
        self.update_paused_state();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.active() {
            return Err(PlayerError::NotActive);
        }
        self.paused_by_user = false;
        self.update_paused_state();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop_session(false);
    }

    /// 只停止音频；没有视频时等于 stop()
    pub fn stop_audio(&mut self) {
        if self.video.is_none() {
            self.stop();
            return;
        }
        if let Some(audio) = &self.audio {
            self.audio_finished = true;
            if self.information.audio.state.duration.is_some() {
                audio.stop();
            }
        }
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        validate_speed(speed)?;
        let speed = if self.caps.audio_sink.supports_speed_control() { speed } else { 1.0 };
        if self.options.speed == speed {
            return Ok(());
        }
        self.options.speed = speed;
        if self.active() {
            if let Some(audio) = &self.audio {
                audio.set_speed(speed);
            }
            if let Some(video) = &self.video {
                video.set_speed(speed);
            }
        }
        info!("{} ⏩ 播放速度: {}", log_ctx(), speed);
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.options.speed
    }

    pub fn set_wait_for_mark_as_shown(&mut self, wait: bool) {
        self.options.wait_for_mark_as_shown = wait;
        if let Some(video) = &self.video {
            video.set_wait_for_mark_as_shown(wait);
        }
    }

    pub fn set_loader_priority(&self, priority: i32) {
        self.file.reader().set_loader_priority(priority);
    }

    /// 当前显示的视频帧
    pub fn frame(&self, request: &FrameRequest) -> Option<VideoFrame> {
        self.video.as_ref()?.frame(request)
    }

    /// 渲染端确认帧已经上屏（wait_for_mark_as_shown 模式）
    pub fn mark_frame_shown(&mut self) -> bool {
        let Some(video) = self.video.clone() else {
            return false;
        };
        if self.next_frame_time == NextFrame::AlreadyDone {
            self.next_frame_time = NextFrame::Unknown;
            video.add_timeline_delay(self.caps.time.now() - self.current_frame_time);
        }
        video.mark_frame_shown()
    }

    /// 下一帧应当显示的世界时间
    pub fn next_frame_time(&self) -> Option<Time> {
        match self.next_frame_time {
            NextFrame::At(time) => Some(time),
            NextFrame::AlreadyDone => None,
            NextFrame::Unknown => match self.video.as_ref()?.next_frame_display_time() {
                NextFrame::At(time) => Some(time),
                _ => None,
            },
        }
    }

    /// 处理 worker 事件，推进音频位置和视频帧；由 UI 循环定期调用
    pub fn update(&mut self) {
        while let Ok((generation, event)) = self.events_rx.try_recv() {
            if generation == self.generation {
                self.handle_event(event);
            }
        }
        if self.stage != Stage::Started {
            return;
        }
        self.poll_audio();
        self.check_video_step();
    }

    pub fn information(&self) -> &Information {
        &self.information
    }

    pub fn last_failure(&self) -> Option<Error> {
        self.last_failure
    }

    pub fn playing(&self) -> bool {
        self.stage == Stage::Started && !self.paused && !self.finished() && !self.failed()
    }

    pub fn buffering(&self) -> bool {
        self.paused_by_waiting_for_data
    }

    pub fn paused(&self) -> bool {
        self.paused_by_user && self.active()
    }

    pub fn finished(&self) -> bool {
        self.stage == Stage::Started
            && (self.audio.is_none() || self.audio_finished)
            && (self.video.is_none() || self.video_finished)
    }

    pub fn failed(&self) -> bool {
        self.last_failure.is_some()
    }

    pub fn ready(&self) -> bool {
        !matches!(self.stage, Stage::Uninitialized | Stage::Initializing)
    }

    pub fn active(&self) -> bool {
        self.stage != Stage::Uninitialized && !self.finished() && !self.failed()
    }

    /// 旧接口的状态快照
    pub fn legacy_state(&self) -> PlayerState {
        let state = match self.last_failure {
            Some(Error::OpenFailed | Error::NotStreamable) => PlaybackState::StoppedAtStart,
            Some(_) => PlaybackState::StoppedAtError,
            None if self.finished() => PlaybackState::StoppedAtEnd,
            None if self.stage == Stage::Uninitialized => PlaybackState::Stopped,
            None if self.paused() => PlaybackState::Paused,
            None => PlaybackState::Playing,
        };

        let mut length = self.compute_total_duration();
        let position = [self.information.audio.state.position, self.information.video.state.position]
            .into_iter()
            .flatten()
            .max();
        let position = match position {
            Some(position) if self.options.looping && length > 0 && length != DURATION_UNAVAILABLE => {
                position % length
            }
            Some(position) => position,
            None => self.options.position,
        };
        if length == DURATION_UNAVAILABLE {
            length = position.max(0);
        }
        let received_till = (self.remote && self.full_in_cache_since_start != Some(true))
            .then(|| self.current_received_till(length))
            .flatten();

        PlayerState { state, position, length, received_till }
    }

    // ---- 会话 ----

    fn stop_session(&mut self, still_active: bool) {
        self.file.stop(still_active);
        if let Some(audio) = self.audio.take() {
            audio.stop();
        }
        if self.stage != Stage::Uninitialized {
            info!("{} ⏹ 会话结束", log_ctx());
        }
        self.generation += 1;
        self.video = None;
        self.session = None;
        self.stage = Stage::Uninitialized;
        let header_size = self.information.header_size;
        self.information = Information { header_size, ..Information::default() };
        self.total_duration = DURATION_UNAVAILABLE;
        self.duration_by_packets = 0;
        self.full_in_cache_since_start = None;
        self.paused = false;
        self.paused_by_user = false;
        self.paused_by_waiting_for_data = false;
        self.audio_finished = false;
        self.video_finished = false;
        self.last_audio_position = None;
        self.next_frame_time = NextFrame::Unknown;
        self.current_frame_time = 0;
    }

    fn save_previous_received_till(&mut self, options: &PlaybackOptions, previous: Option<Time>) {
        self.previous_received_till = match previous {
            Some(previous)
                if options.position >= self.options.position
                    && options.mode == self.options.mode
                    && options.position < previous =>
            {
                Some(previous)
            }
            _ => None,
        };
    }

    fn fail(&mut self, error: Error) {
        error!("{} ❌ 播放失败: {}", log_ctx(), error);
        self.last_failure = Some(error);
        let _ = self.errors_tx.send(error);
        self.stop_session(false);
    }

    fn fire(&self, update: Update) {
        let _ = self.updates_tx.send(update);
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened { header_size, audio, video, total_duration } => {
                self.information.header_size = header_size;
                self.total_duration = total_duration;
                if audio {
                    self.audio = Some(AudioTrackHandle::new(self.caps.audio_sink.clone(), self.audio_id));
                }
                if let (Some(shared), Some(waker)) = (video, self.file.waker()) {
                    let sync = self.audio.as_ref().map(AudioTrackHandle::sync_source);
                    self.video = Some(VideoTrackHandle::new(shared, self.caps.time.clone(), sync, waker));
                }
            }
            SessionEvent::AudioReady(audio) => {
                self.information.save_valid_start(Information { audio, ..Information::default() });
                self.provide_start_information();
            }
            SessionEvent::VideoReady(video) => {
                self.information.save_valid_start(Information { video, ..Information::default() });
                self.provide_start_information();
            }
            SessionEvent::AudioReceivedTill(position) => {
                if self.audio.is_some() {
                    self.track_received_till(TrackKind::Audio, position);
                    self.check_resume_from_waiting_for_data();
                }
            }
            SessionEvent::VideoReceivedTill(position) => {
                if self.video.is_some() {
                    self.track_received_till(TrackKind::Video, position);
                    self.check_resume_from_waiting_for_data();
                }
            }
            SessionEvent::Video(VideoEvent::FrameAvailable) => {
                if self.stage == Stage::Started {
                    self.check_video_step();
                }
            }
            SessionEvent::Video(VideoEvent::Finished) => self.on_video_finished(),
            SessionEvent::Video(VideoEvent::WaitingForData) | SessionEvent::WaitingForData => {
                self.waiting_for_data();
            }
            SessionEvent::Video(VideoEvent::Failed(error)) | SessionEvent::Failed(error) => self.fail(error),
            SessionEvent::FullInCache(full) => {
                if self.full_in_cache_since_start.is_none() {
                    self.full_in_cache_since_start = Some(full);
                }
            }
            SessionEvent::DurationByPackets(duration) => self.duration_by_packets = duration,
        }
    }

    /// 所有轨道都知道时长后进入 Ready，发布 Information
    fn provide_start_information(&mut self) {
        if self.stage != Stage::Initializing {
            return;
        }
        if (self.audio.is_some() && self.information.audio.state.duration.is_none())
            || (self.video.is_some() && self.information.video.state.duration.is_none())
        {
            return;
        }
        let mode = self.options.mode;
        if (self.audio.is_none() && self.video.is_none())
            || (self.audio.is_none() && mode == Mode::Audio)
            || (self.video.is_none() && mode == Mode::Video)
        {
            return self.fail(Error::OpenFailed);
        }

        self.stage = Stage::Ready;
        if self.audio_finished {
            if let Some(audio) = &self.audio {
                audio.stop();
            }
        }
        info!(
            "{} ✅ 媒体就绪: 音频 {:?}, 视频 {:?}",
            log_ctx(),
            self.information.audio.state.duration,
            self.information.video.state.duration
        );
        self.fire(Update::Information(self.information.clone()));
        self.information.video.cover = None;

        if mode == Mode::Inspection {
            self.stop_session(false);
            return;
        }
        if self.stage == Stage::Ready && !self.paused {
            // paused 取反后 update_paused_state 一定会进入 start()
            self.paused = true;
            self.update_paused_state();
        }
    }

    fn start(&mut self) {
        self.stage = Stage::Started;
        info!("{} ▶️ 开始播放", log_ctx());
        if self.audio.is_some() {
            if self.audio_finished {
                if self.video.is_none() || self.video_finished {
                    self.finish();
                }
            } else {
                self.send_received_till(TrackKind::Audio);
            }
        }
        if self.video.is_some() {
            self.send_received_till(TrackKind::Video);
        }
    }

    /// 用户暂停或等待数据，两者合并后只在翻转时通知轨道
    fn update_paused_state(&mut self) {
        let paused = self.paused_by_user || self.paused_by_waiting_for_data;
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if !paused && self.stage == Stage::Ready {
            self.start();
        }
        if self.stage != Stage::Started {
            return;
        }
        let now = self.caps.time.now();
        debug!("{} 轨道{}: {}ms", log_ctx(), if paused { "暂停" } else { "恢复" }, now);
        if let Some(audio) = &self.audio {
            if paused {
                audio.pause(now);
            } else {
                audio.resume(now);
            }
        }
        if let Some(video) = &self.video {
            if paused {
                video.pause(now);
            } else {
                video.resume(now);
            }
        }
    }

    fn finish(&self) {
        info!("{} 🏁 播放结束", log_ctx());
        self.fire(Update::Finished);
    }

    fn on_video_finished(&mut self) {
        if self.video_finished {
            return;
        }
        self.video_finished = true;
        if self.stage == Stage::Started && (self.audio.is_none() || self.audio_finished) {
            self.finish();
        }
    }

    // ---- 缓冲 ----

    fn waiting_for_data(&mut self) {
        self.check_resume_reading();
        if self.stage != Stage::Started
            || self.paused_by_waiting_for_data
            || self.both_received_enough(self.caps.config.buffer_for_ms)
        {
            return;
        }
        info!("{} ⏳ 数据不足，暂停等待", log_ctx());
        self.paused_by_waiting_for_data = true;
        self.update_paused_state();
        self.fire(Update::WaitingForData(true));
    }

    fn check_resume_from_waiting_for_data(&mut self) {
        if !self.paused_by_waiting_for_data || !self.both_received_enough(self.caps.config.buffer_for_ms) {
            return;
        }
        info!("{} ✅ 缓冲完成，继续播放", log_ctx());
        self.paused_by_waiting_for_data = false;
        self.update_paused_state();
        self.fire(Update::WaitingForData(false));
    }

    fn both_received_enough(&self, amount: Time) -> bool {
        let looping = self.options.looping;
        (self.audio.is_none() || self.information.audio.state.received_enough(amount, looping))
            && (self.video.is_none() || self.information.video.state.received_enough(amount, looping))
    }

    fn received_till_end(&self) -> bool {
        !self.options.looping
            && (self.audio.is_none() || self.information.audio.state.full_received())
            && (self.video.is_none() || self.information.video.state.full_received())
    }

    fn load_in_advance(&self) -> Time {
        self.caps.config.load_in_advance(self.remote)
    }

    fn set_pause_reading(&self, pause: bool) {
        if let Some(session) = &self.session {
            session.pause_reading.store(pause, Ordering::Release);
        }
    }

    fn pause_reading(&self) -> bool {
        self.session.as_ref().map_or(false, |session| session.pause_reading.load(Ordering::Acquire))
    }

    /// 读取暂停中且提前量不足时恢复读取
    fn check_resume_reading(&self) {
        if self.pause_reading() && (!self.both_received_enough(self.load_in_advance()) || self.received_till_end()) {
            debug!("{} 提前量不足，恢复读取", log_ctx());
            self.set_pause_reading(false);
            self.file.wake();
        }
    }

    // ---- 位置 ----

    fn track_state(&self, kind: TrackKind) -> &TrackState {
        match kind {
            TrackKind::Audio => &self.information.audio.state,
            TrackKind::Video => &self.information.video.state,
        }
    }

    fn track_state_mut(&mut self, kind: TrackKind) -> &mut TrackState {
        match kind {
            TrackKind::Audio => &mut self.information.audio.state,
            TrackKind::Video => &mut self.information.video.state,
        }
    }

    fn track_received_till(&mut self, kind: TrackKind, position: Time) {
        let state = self.track_state_mut(kind);
        let raise = state.received_till.map_or(true, |till| till < position);
        if raise {
            state.received_till = Some(position);
            if state.duration.is_some() {
                self.send_received_till(kind);
            }
        }
        if !self.pause_reading()
            && self.both_received_enough(self.load_in_advance())
            && !self.received_till_end()
        {
            debug!("{} 提前量足够，暂停读取", log_ctx());
            self.set_pause_reading(true);
        }
    }

    fn track_played_till(&mut self, kind: TrackKind, position: Time) {
        if let Some(session) = &self.session {
            session.played_till.fetch_max(position, Ordering::AcqRel);
            if session.loop_parked.load(Ordering::Acquire) {
                self.file.wake();
            }
        }
        self.track_received_till(kind, position);
        self.track_state_mut(kind).position = Some(position);
        let value = self.loop_position(position);
        self.fire(match kind {
            TrackKind::Audio => Update::AudioPlayback(value),
            TrackKind::Video => Update::VideoPlayback(value),
        });
        self.check_resume_reading();
    }

    /// 远程加载器的预加载进度
    fn send_received_till(&self, kind: TrackKind) {
        if !self.remote || self.full_in_cache_since_start == Some(true) {
            return;
        }
        let Some(till) = self.track_state(kind).received_till else {
            return;
        };
        let received = till.max(self.previous_received_till.unwrap_or(till));
        let value = self.loop_position(received);
        self.fire(match kind {
            TrackKind::Audio => Update::AudioPreloaded(value),
            TrackKind::Video => Update::VideoPreloaded(value),
        });
    }

    fn loop_position(&self, position: Time) -> Time {
        let total = self.compute_total_duration();
        if self.options.looping && total > 0 && total != DURATION_UNAVAILABLE {
            position % total
        } else {
            position
        }
    }

    fn compute_total_duration(&self) -> Time {
        if self.total_duration != DURATION_UNAVAILABLE {
            self.total_duration
        } else if self.duration_by_packets > 0 {
            self.duration_by_packets
        } else {
            DURATION_UNAVAILABLE
        }
    }

    /// 所有存在的轨道都已接收到的位置（不低于上一次会话留下的值）
    fn current_received_till(&self, duration: Time) -> Option<Time> {
        let previous = self.previous_received_till.unwrap_or(0).max(0);
        let for_track = |state: &TrackState| {
            state.received_till.map(|till| {
                let till = if state.full_received() { till.max(duration) } else { till };
                till.max(previous)
            })
        };
        let tracks = [
            self.audio.as_ref().map(|_| for_track(&self.information.audio.state)),
            self.video.as_ref().map(|_| for_track(&self.information.video.state)),
        ];
        let mut result: Option<Time> = None;
        for till in tracks.into_iter().flatten() {
            let till = till.unwrap_or(previous);
            result = Some(result.map_or(till, |current| current.min(till)));
        }
        let result = result.unwrap_or(previous);
        Some(if self.options.looping && duration > 0 && duration != DURATION_UNAVAILABLE {
            result % duration
        } else {
            result
        })
    }

    fn poll_audio(&mut self) {
        let Some(audio) = self.audio.clone() else {
            return;
        };
        if self.audio_finished {
            return;
        }
        match audio.poll() {
            AudioPoll::Position(position) => {
                if self.last_audio_position != Some(position) {
                    self.last_audio_position = Some(position);
                    self.track_played_till(TrackKind::Audio, position);
                }
            }
            AudioPoll::Finished => {
                info!("{} 🔊 音频播放完毕", log_ctx());
                self.audio_finished = true;
                if self.video.is_none() || self.video_finished {
                    self.finish();
                }
            }
            AudioPoll::Failed => self.fail(Error::InvalidData),
            AudioPoll::Pending => {}
        }
    }

    fn check_video_step(&mut self) {
        let Some(video) = self.video.clone() else {
            return;
        };
        if self.video_finished || self.stage != Stage::Started {
            return;
        }
        let time = match self.next_frame_time {
            NextFrame::AlreadyDone => return,
            NextFrame::At(time) => time,
            NextFrame::Unknown => match video.next_frame_display_time() {
                NextFrame::At(time) => {
                    self.next_frame_time = NextFrame::At(time);
                    time
                }
                NextFrame::AlreadyDone => {
                    self.next_frame_time = NextFrame::AlreadyDone;
                    return;
                }
                NextFrame::Unknown => return,
            },
        };
        let now = self.caps.time.now();
        if now < time {
            return;
        }

        let position = video.mark_frame_displayed(now);
        if self.options.wait_for_mark_as_shown {
            self.current_frame_time = time;
            self.next_frame_time = NextFrame::AlreadyDone;
        } else {
            video.mark_frame_shown();
            self.next_frame_time = NextFrame::Unknown;
        }
        if let Some(position) = position {
            self.track_played_till(TrackKind::Video, position);
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop_session(false);
    }
}

/// Player 在 worker 线程里的一半：持有轨道，计算接收进度和循环偏移
struct SessionDelegate {
    events: EventSender,
    options: PlaybackOptions,
    caps: PlayerCaps,
    audio_id: AudioSessionId,
    shared: Arc<SessionShared>,
    audio: Option<AudioTrack>,
    video: Option<VideoTrack>,
    audio_stream_duration: Time,
    video_stream_duration: Time,
    total_duration: Time,
    looping_shift: Time,
    read_till_end: bool,
    waiting_for_data: bool,
    duration_by_last_audio_packet: Time,
    duration_by_last_video_packet: Time,
    duration_by_packets: Time,
}

impl SessionDelegate {
    fn new(
        events: EventSender,
        options: PlaybackOptions,
        caps: PlayerCaps,
        audio_id: AudioSessionId,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            events,
            options,
            caps,
            audio_id,
            shared,
            audio: None,
            video: None,
            audio_stream_duration: DURATION_UNAVAILABLE,
            video_stream_duration: DURATION_UNAVAILABLE,
            total_duration: DURATION_UNAVAILABLE,
            looping_shift: 0,
            read_till_end: false,
            waiting_for_data: false,
            duration_by_last_audio_packet: 0,
            duration_by_last_video_packet: 0,
            duration_by_packets: 0,
        }
    }

    /// 循环读取领先播放位置超过提前量时停止读取，不依赖控制线程的 update()
    fn looped_too_far(&self) -> bool {
        if self.looping_shift == 0 {
            return false;
        }
        let played = self.shared.played_till.load(Ordering::Acquire);
        let parked = self.looping_shift - played > self.shared.load_in_advance;
        if parked != self.shared.loop_parked.swap(parked, Ordering::AcqRel) && parked {
            debug!("{} 💤 循环读取已领先 {}ms，等待播放", log_ctx(), self.looping_shift - played);
        }
        parked
    }

    fn create_audio(&mut self, stream: Stream) {
        self.audio_stream_duration = stream.duration.unwrap_or(DURATION_UNAVAILABLE);
        let ready = self.events.clone();
        let failed = self.events.clone();
        self.audio = Some(AudioTrack::new(
            self.options,
            stream,
            self.caps.audio_sink.clone(),
            self.audio_id,
            self.caps.config.skip_invalid_data_packets,
            Box::new(move |information| ready.send(SessionEvent::AudioReady(information))),
            Box::new(move |error| failed.send(SessionEvent::Failed(error))),
        ));
    }

    fn create_video(&mut self, stream: Stream) -> Arc<VideoShared> {
        self.video_stream_duration = stream.duration.unwrap_or(DURATION_UNAVAILABLE);
        let shared = VideoShared::new(&self.options);
        let sync = self
            .audio
            .as_ref()
            .map(|_| AudioSyncSource { sink: self.caps.audio_sink.clone(), id: self.audio_id });
        let ready = self.events.clone();
        let events = self.events.clone();
        self.video = Some(VideoTrack::new(
            self.options,
            stream,
            shared.clone(),
            self.caps.time.clone(),
            sync,
            self.caps.config.skip_invalid_data_packets,
            Box::new(move |information| ready.send(SessionEvent::VideoReady(information))),
            Box::new(move |event| events.send(SessionEvent::Video(event))),
        ));
        shared
    }

    fn compute_total_duration(&self) -> Time {
        if self.total_duration != DURATION_UNAVAILABLE {
            self.total_duration
        } else if self.duration_by_packets > 0 {
            self.duration_by_packets
        } else {
            DURATION_UNAVAILABLE
        }
    }

    /// 流时长未知时，读完一轮后用最后一个包的结束位置代替
    fn track_duration(&self, stream_duration: Time, by_last_packet: Time) -> Time {
        if stream_duration != DURATION_UNAVAILABLE {
            stream_duration
        } else if (self.looping_shift != 0 || self.read_till_end) && by_last_packet > 0 {
            by_last_packet
        } else {
            DURATION_UNAVAILABLE
        }
    }

    fn audio_duration(&self) -> Time {
        self.track_duration(self.audio_stream_duration, self.duration_by_last_audio_packet)
    }

    fn video_duration(&self) -> Time {
        self.track_duration(self.video_stream_duration, self.duration_by_last_video_packet)
    }

    fn counting_duration_by_packets(&self) -> bool {
        self.looping_shift == 0 && self.total_duration == DURATION_UNAVAILABLE
    }

    fn set_duration_by_packets(&mut self) {
        if !self.counting_duration_by_packets() {
            return;
        }
        let duration = self.duration_by_last_audio_packet.max(self.duration_by_last_video_packet);
        if duration > 1 {
            info!("{} 📏 按数据包计算时长: {}ms", log_ctx(), duration);
            self.duration_by_packets = duration;
            self.events.send(SessionEvent::DurationByPackets(duration));
        } else {
            error!("{} ❌ 按数据包计算的时长无效: {}", log_ctx(), duration);
            self.events.send(SessionEvent::Failed(Error::InvalidData));
        }
    }

    /// 交给轨道之前先报告接收进度
    fn process(&mut self, kind: TrackKind, packets: Vec<Packet>) {
        let stream = match kind {
            TrackKind::Audio => self.audio.as_ref().map(AudioTrack::stream),
            TrackKind::Video => self.video.as_ref().map(VideoTrack::stream),
        };
        let last = stream.and_then(|stream| {
            let packet = packets.iter().rev().find(|packet| !packet.is_end_of_stream())?;
            Some((stream.packet_position(packet)?, stream.packet_end(packet)?))
        });

        if let Some((position, end)) = last {
            if self.counting_duration_by_packets() {
                if end < 0 {
                    error!("{} ❌ 数据包结束位置无效: {}", log_ctx(), end);
                    self.events.send(SessionEvent::Failed(Error::InvalidData));
                    return;
                }
                let by_last = match kind {
                    TrackKind::Audio => &mut self.duration_by_last_audio_packet,
                    TrackKind::Video => &mut self.duration_by_last_video_packet,
                };
                *by_last = (*by_last).max(end);
            }
            let duration = match kind {
                TrackKind::Audio => self.audio_duration(),
                TrackKind::Video => self.video_duration(),
            };
            let till = self.looping_shift.saturating_add(position.clamp(0, (duration - 1).max(0)));
            self.events.send(match kind {
                TrackKind::Audio => SessionEvent::AudioReceivedTill(till),
                TrackKind::Video => SessionEvent::VideoReceivedTill(till),
            });
        }

        match kind {
            TrackKind::Audio => {
                if let Some(audio) = self.audio.as_mut() {
                    audio.process(packets);
                }
            }
            TrackKind::Video => {
                if let Some(video) = self.video.as_mut() {
                    video.process(packets);
                }
            }
        }
    }
}

impl FileDelegate for SessionDelegate {
    fn file_ready(&mut self, header_size: usize, video: Stream, audio: Stream) -> bool {
        self.waiting_for_data = false;
        let mode = self.options.mode;
        let audio = if !mode.wants_audio() {
            Stream::empty()
        } else if audio.duration == Some(DURATION_UNAVAILABLE) {
            warn!("{} ⚠️ 音频流时长未知，忽略音频", log_ctx());
            Stream::empty()
        } else {
            audio
        };
        let video = if mode.wants_video() { video } else { Stream::empty() };

        if audio.is_active() {
            self.create_audio(audio);
        }
        let video_shared = video.is_active().then(|| self.create_video(video));

        let has_audio = self.audio.is_some();
        let has_video = video_shared.is_some();
        if (!has_audio && !has_video) || (mode == Mode::Audio && !has_audio) || (mode == Mode::Video && !has_video) {
            error!("{} ❌ 没有符合模式 {:?} 的轨道", log_ctx(), mode);
            return false;
        }
        if has_audio && has_video && self.video_stream_duration == DURATION_UNAVAILABLE {
            error!("{} ❌ 音视频同时播放时视频时长未知", log_ctx());
            return false;
        }

        let audio_duration = if has_audio { self.audio_stream_duration } else { 0 };
        let video_duration = if has_video { self.video_stream_duration } else { 0 };
        self.total_duration = audio_duration.max(video_duration);
        self.events.send(SessionEvent::Opened {
            header_size,
            audio: has_audio,
            video: video_shared,
            total_duration: self.total_duration,
        });
        true
    }

    fn file_full_in_cache(&mut self, full: bool) {
        self.events.send(SessionEvent::FullInCache(full));
    }

    fn file_error(&mut self, error: Error) {
        self.events.send(SessionEvent::Failed(error));
    }

    fn file_waiting_for_data(&mut self) {
        if self.waiting_for_data {
            return;
        }
        self.waiting_for_data = true;
        self.events.send(SessionEvent::WaitingForData);
    }

    fn file_process_packets(&mut self, packets: &mut BTreeMap<usize, Vec<Packet>>) -> bool {
        self.waiting_for_data = false;
        let audio_index = self.audio.as_ref().and_then(AudioTrack::stream_index);
        let video_index = self.video.as_ref().and_then(VideoTrack::stream_index);
        for (index, list) in packets.iter_mut() {
            if list.is_empty() {
                continue;
            }
            let list = std::mem::take(list);
            if Some(*index) == audio_index {
                self.process(TrackKind::Audio, list);
            } else if Some(*index) == video_index {
                self.process(TrackKind::Video, list);
            }
        }
        self.file_read_more()
    }

    fn file_process_end_of_file(&mut self) -> bool {
        self.waiting_for_data = false;
        self.read_till_end = true;
        self.set_duration_by_packets();
        if self.audio.is_some() {
            let till = self.looping_shift.saturating_add(self.audio_duration());
            self.events.send(SessionEvent::AudioReceivedTill(till));
        }
        if self.video.is_some() {
            let till = self.looping_shift.saturating_add(self.video_duration());
            self.events.send(SessionEvent::VideoReceivedTill(till));
        }
        if !self.options.looping {
            return false;
        }

        let duration = self.compute_total_duration();
        if duration == DURATION_UNAVAILABLE || duration <= 0 {
            error!("{} ❌ 时长未知，无法循环", log_ctx());
            self.events.send(SessionEvent::Failed(Error::InvalidData));
            return false;
        }
        self.looping_shift += duration;
        self.read_till_end = false;
        info!("{} 🔁 循环偏移: {}ms", log_ctx(), self.looping_shift);
        true
    }

    fn file_read_more(&mut self) -> bool {
        !self.read_till_end && !self.shared.pause_reading.load(Ordering::Acquire) && !self.looped_too_far()
    }

    fn file_process_tracks(&mut self) -> Option<Time> {
        self.video.as_mut().and_then(VideoTrack::read_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::MonotonicTime;
    use crate::player::testing::{media_file, MemoryLoader, RecordingAudioSink, SyntheticBackend, TrackLayout};
    use std::time::{Duration, Instant};

    fn caps() -> PlayerCaps {
        caps_with_sink().0
    }

    fn caps_with_sink() -> (PlayerCaps, Arc<RecordingAudioSink>) {
        let time: Arc<dyn TimeSource> = Arc::new(MonotonicTime::new());
        let sink = Arc::new(RecordingAudioSink::new(time.clone()));
        let caps = PlayerCaps {
            backend: Arc::new(SyntheticBackend),
            audio_sink: sink.clone(),
            time,
            config: StreamingConfig::default(),
        };
        (caps, sink)
    }

    fn pushed_packets(sink: &RecordingAudioSink, player: &Player) -> usize {
        sink.session(player.audio_id).map_or(0, |record| record.packets)
    }

    fn player_with(loader: MemoryLoader) -> Player {
        Player::new(Arc::new(loader), None, caps())
    }

    fn options(mode: Mode) -> PlaybackOptions {
        PlaybackOptions { mode, ..Default::default() }
    }

    /// 驱动 update() 直到 stop 返回 true 或超时，返回收到的所有事件
    fn drive(player: &mut Player, timeout: Duration, mut stop: impl FnMut(&Player, &Update) -> bool) -> Vec<Update> {
        let updates = player.updates();
        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        while Instant::now() < deadline {
            player.update();
            for update in updates.try_iter() {
                let done = stop(player, &update);
                received.push(update);
                if done {
                    return received;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
        received
    }

    #[test]
    fn information_precedes_playback_updates() {
        let data = media_file(Some(TrackLayout::video(10_000)), Some(TrackLayout::audio(10_000)));
        let mut player = player_with(MemoryLoader::new(data, None));
        player.play(options(Mode::Both)).unwrap();

        let mut audio = false;
        let mut video = false;
        let updates = drive(&mut player, Duration::from_secs(10), |_, update| {
            match update {
                Update::AudioPlayback(_) => audio = true,
                Update::VideoPlayback(_) => video = true,
                _ => {}
            }
            audio && video
        });
        assert!(audio && video);

        let Update::Information(information) = &updates[0] else {
            panic!("第一个事件应该是 Information: {:?}", updates[0]);
        };
        assert_eq!(information.video.state.duration, Some(10_001));
        assert_eq!(information.audio.state.duration, Some(10_001));
        assert_eq!(information.video.size, (4, 4));
        assert_eq!(updates.iter().filter(|update| matches!(update, Update::Information(_))).count(), 1);

        assert!(player.playing());
        assert!(player.frame(&FrameRequest::default()).is_some());
        let resized = player.frame(&FrameRequest { resize: Some((2, 2)) }).unwrap();
        assert_eq!((resized.width, resized.height), (2, 2));

        player.stop();
        assert!(!player.active());
        assert_eq!(player.legacy_state().state, PlaybackState::Stopped);
    }

    #[test]
    fn invalid_options_rejected_before_start() {
        let data = media_file(Some(TrackLayout::video(400)), None);
        let mut player = player_with(MemoryLoader::new(data, None));

        let looping_both = PlaybackOptions { looping: true, mode: Mode::Both, ..Default::default() };
        assert!(matches!(player.play(looping_both), Err(PlayerError::LoopWithBothTracks)));
        let fast = PlaybackOptions { speed: 3.0, ..Default::default() };
        assert!(matches!(player.play(fast), Err(PlayerError::InvalidSpeed(_))));
        assert!(!player.active());
        assert!(matches!(player.pause(), Err(PlayerError::NotActive)));
        assert!(matches!(player.set_speed(0.1), Err(PlayerError::InvalidSpeed(_))));
    }

    #[test]
    fn user_pause_before_ready_holds_start() {
        let data = media_file(Some(TrackLayout::video(2000)), Some(TrackLayout::audio(2000)));
        let mut player = player_with(MemoryLoader::new(data, None));
        player.play(options(Mode::Both)).unwrap();
        player.pause().unwrap();

        drive(&mut player, Duration::from_secs(5), |_, update| matches!(update, Update::Information(_)));
        assert!(player.ready());
        assert!(player.paused());
        assert!(!player.playing());
        let state = player.legacy_state();
        assert_eq!(state.state, PlaybackState::Paused);
        assert_eq!(state.length, 2001);
        assert_eq!(state.position, 0);
        assert_eq!(state.received_till, None);

        player.resume().unwrap();
        assert!(player.playing());
        let updates = drive(&mut player, Duration::from_secs(5), |_, update| {
            matches!(update, Update::VideoPlayback(_))
        });
        assert!(matches!(updates.last(), Some(Update::VideoPlayback(_))));
    }

    #[test]
    fn audio_only_finishes() {
        let data = media_file(Some(TrackLayout::video(400)), Some(TrackLayout::audio(400)));
        let mut player = player_with(MemoryLoader::new(data, None));
        player.play(options(Mode::Audio)).unwrap();

        let updates = drive(&mut player, Duration::from_secs(5), |_, update| *update == Update::Finished);
        assert_eq!(updates.last(), Some(&Update::Finished));
        assert!(!updates.iter().any(|update| matches!(update, Update::VideoPlayback(_))));
        assert!(player.finished());
        assert!(!player.active());
        assert_eq!(player.legacy_state().state, PlaybackState::StoppedAtEnd);
    }

    #[test]
    fn looping_video_wraps_positions() {
        let data = media_file(Some(TrackLayout::video(400)), None);
        let mut player = player_with(MemoryLoader::new(data, None));
        let looping = PlaybackOptions { looping: true, mode: Mode::Video, ..Default::default() };
        player.play(looping).unwrap();

        let mut last_till = 0;
        let mut previous: Option<Time> = None;
        let mut wrapped = false;
        drive(&mut player, Duration::from_secs(3), |player, update| {
            let till = player.information().video.state.received_till.unwrap_or(0);
            assert!(till >= last_till);
            last_till = till;
            if let Update::VideoPlayback(position) = update {
                assert!(*position < 401);
                if previous.map_or(false, |previous| *position < previous) {
                    wrapped = true;
                }
                previous = Some(*position);
            }
            wrapped && last_till > 802
        });
        assert!(wrapped);
        assert!(last_till > 802);
        assert!(player.legacy_state().position < 401);
        assert!(!player.finished());
    }

    #[test]
    fn looping_reads_ahead_boundedly_without_update() {
        let data = media_file(None, Some(TrackLayout::audio(400)));
        let (caps, sink) = caps_with_sink();
        let mut player = Player::new(Arc::new(MemoryLoader::new(data, None)), None, caps);
        player.play(PlaybackOptions { looping: true, mode: Mode::Audio, ..Default::default() }).unwrap();

        thread::sleep(Duration::from_millis(300));
        let early = pushed_packets(&sink, &player);
        thread::sleep(Duration::from_millis(700));
        let late = pushed_packets(&sink, &player);

        // 本地提前量 5000ms，每轮 400ms / 20 个包，至多再多读一轮加一个队列
        let limit = (5000 / 400 + 3) * 20 + StreamingConfig::default().max_queued_packets;
        assert!(early > 0);
        assert!(late <= limit, "读取了 {} 个包", late);
        assert_eq!(early, late);
    }

    #[test]
    fn looping_audio_wraps_positions() {
        let data = media_file(None, Some(TrackLayout::audio(400)));
        let (caps, sink) = caps_with_sink();
        let mut player = Player::new(Arc::new(MemoryLoader::new(data, None)), None, caps);
        player.play(PlaybackOptions { looping: true, mode: Mode::Audio, ..Default::default() }).unwrap();

        let mut previous: Option<Time> = None;
        let mut wraps = 0;
        let updates = drive(&mut player, Duration::from_millis(2000), |_, update| {
            if let Update::AudioPlayback(position) = update {
                assert!(*position < 401);
                if previous.map_or(false, |previous| *position < previous) {
                    wraps += 1;
                }
                previous = Some(*position);
            }
            false
        });
        assert!(wraps >= 2, "只循环了 {} 次", wraps);
        assert!(!updates.contains(&Update::Finished));
        assert!(!player.finished());
        assert!(player.active());

        // 已播放不到 2000ms，读取提前量不超过本地 5000ms 加一轮
        let limit = ((2000 + 5000) / 400 + 3) * 20 + StreamingConfig::default().max_queued_packets;
        assert!(pushed_packets(&sink, &player) <= limit);
    }

    #[test]
    fn received_till_never_decreases_with_shuffled_delivery() {
        for seed in [1u64, 7, 42] {
            let data = media_file(Some(TrackLayout { payload: 8192, ..TrackLayout::video(10_000) }), None);
            let mut player = player_with(MemoryLoader::shuffled(data, seed));
            player.play(options(Mode::Video)).unwrap();

            let mut last_public: Option<Time> = None;
            let mut last_track: Option<Time> = None;
            drive(&mut player, Duration::from_secs(3), |player, _| {
                let public = player.legacy_state().received_till;
                assert!(public >= last_public, "seed {}: {:?} -> {:?}", seed, last_public, public);
                last_public = public;
                let track = player.information().video.state.received_till;
                assert!(track >= last_track, "seed {}: {:?} -> {:?}", seed, last_track, track);
                last_track = track;
                false
            });
            assert!(last_track.map_or(false, |till| till > 0), "seed {}", seed);
        }
    }

    #[test]
    fn invalid_packets_fail_session() {
        let data = media_file(Some(TrackLayout { invalid_from: Some(3), ..TrackLayout::video(1000) }), None);
        let mut player = player_with(MemoryLoader::new(data, None));
        let errors = player.errors();
        player.play(options(Mode::Video)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !player.failed() && Instant::now() < deadline {
            player.update();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(errors.try_recv().ok(), Some(Error::InvalidData));
        assert_eq!(player.last_failure(), Some(Error::InvalidData));
        assert!(!player.active());
        assert_eq!(player.legacy_state().state, PlaybackState::StoppedAtError);
    }

    #[test]
    fn missing_track_for_mode_fails_open() {
        let data = media_file(None, Some(TrackLayout::audio(400)));
        let mut player = player_with(MemoryLoader::new(data, None));
        let errors = player.errors();
        player.play(options(Mode::Video)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !player.failed() && Instant::now() < deadline {
            player.update();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(errors.try_recv().ok(), Some(Error::OpenFailed));
        assert_eq!(player.legacy_state().state, PlaybackState::StoppedAtStart);
    }

    #[test]
    fn inspection_reports_information_then_stops() {
        let data = media_file(Some(TrackLayout::video(1000)), Some(TrackLayout::audio(1000)));
        let mut player = player_with(MemoryLoader::new(data, None));
        player.play(options(Mode::Inspection)).unwrap();

        let updates = drive(&mut player, Duration::from_secs(5), |_, update| {
            matches!(update, Update::Information(_))
        });
        let Some(Update::Information(information)) = updates.last() else {
            panic!("没有收到 Information");
        };
        assert_eq!(information.audio.state.duration, Some(1001));
        assert!(information.video.cover.is_some());
        assert!(!player.active());
        assert!(!player.ready());

        let later = drive(&mut player, Duration::from_millis(200), |_, _| false);
        assert!(later.is_empty());
    }

    #[test]
    fn capped_loader_stop_unblocks() {
        let data = media_file(Some(TrackLayout { payload: 8192, ..TrackLayout::video(10_000) }), None);
        let mut player = player_with(MemoryLoader::new(data, Some(1_000_000)));
        let errors = player.errors();
        player.play(options(Mode::Video)).unwrap();
        drive(&mut player, Duration::from_secs(5), |_, update| matches!(update, Update::Information(_)));
        drive(&mut player, Duration::from_millis(300), |_, _| false);

        let started = Instant::now();
        player.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!player.active());
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn remote_loader_reports_preloaded() {
        let data = media_file(Some(TrackLayout { payload: 8192, ..TrackLayout::video(10_000) }), None);
        let mut player = player_with(MemoryLoader::remote(data));
        player.play(options(Mode::Video)).unwrap();

        let updates = drive(&mut player, Duration::from_secs(5), |_, update| {
            matches!(update, Update::VideoPreloaded(till) if *till > 0)
        });
        assert!(matches!(updates.last(), Some(Update::VideoPreloaded(_))));
        assert!(player.legacy_state().received_till.is_some());
    }

    #[test]
    fn previous_received_till_kept_on_forward_seek() {
        let mut player = player_with(MemoryLoader::new(Vec::new(), None));
        player.options = options(Mode::Video);
        player.save_previous_received_till(&PlaybackOptions { position: 500, ..options(Mode::Video) }, Some(2000));
        assert_eq!(player.previous_received_till, Some(2000));

        player.save_previous_received_till(&PlaybackOptions { position: 2500, ..options(Mode::Video) }, Some(2000));
        assert_eq!(player.previous_received_till, None);

        player.save_previous_received_till(&PlaybackOptions { position: 500, ..options(Mode::Both) }, Some(2000));
        assert_eq!(player.previous_received_till, None);
    }
}
