use crate::core::clock::{PlaybackClock, TimeSource};
use crate::core::error::{CodecError, Error};
use crate::core::sync::Notify;
use crate::core::types::{
    FrameRequest, PixelFormat, PlaybackOptions, Time, TimePoint, TrackState, VideoFrame, VideoInformation,
    DURATION_UNAVAILABLE,
};
use crate::player::audio_sink::AudioSyncSource;
use crate::player::codec::{DecodedFrame, Packet};
use crate::player::frame_ring::{FramePosition, FrameRing, NextFrame, PrepareState};
use crate::player::stream::{read_next_frame, Stream};
use log::{debug, error, info};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 解码线程与渲染线程共享的视频状态
pub struct VideoShared {
    ring: FrameRing,
    clock: PlaybackClock,
    /// 渲染端累计的显示延迟，呈现下一帧时并入时间轴
    delay: AtomicI64,
    wait_for_mark_as_shown: AtomicBool,
}

impl VideoShared {
    pub fn new(options: &PlaybackOptions) -> Arc<Self> {
        Arc::new(Self {
            ring: FrameRing::new(),
            clock: PlaybackClock::new(options.position, options.speed),
            delay: AtomicI64::new(0),
            wait_for_mark_as_shown: AtomicBool::new(options.wait_for_mark_as_shown),
        })
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }
}

/// 视频轨道发给 Player 的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    /// 有新的帧呈现出来
    FrameAvailable,
    Finished,
    WaitingForData,
    Failed(Error),
}

enum Decoded {
    Frame,
    Waiting,
    Failed,
}

/// 视频轨道（DemuxWorker 线程）
pub struct VideoTrack {
    options: PlaybackOptions,
    stream: Stream,
    shared: Arc<VideoShared>,
    time: Arc<dyn TimeSource>,
    audio: Option<AudioSyncSource>,
    skip_invalid: u32,
    ready: Option<Box<dyn FnOnce(VideoInformation) + Send>>,
    events: Box<dyn Fn(VideoEvent) + Send>,
    initialized: bool,
    failed: bool,
    read_till_end: bool,
    waiting_reported: bool,
    finished_reported: bool,
    initial_skipping_frame: Option<VideoFrame>,
    looping_shift: Time,
    /// 本轮最后一帧的结束位置（不含循环偏移）
    last_frame_end: Time,
}

impl VideoTrack {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: PlaybackOptions,
        stream: Stream,
        shared: Arc<VideoShared>,
        time: Arc<dyn TimeSource>,
        audio: Option<AudioSyncSource>,
        skip_invalid: u32,
        ready: Box<dyn FnOnce(VideoInformation) + Send>,
        events: Box<dyn Fn(VideoEvent) + Send>,
    ) -> Self {
        Self {
            options,
            stream,
            shared,
            time,
            audio,
            skip_invalid,
            ready: Some(ready),
            events,
            initialized: false,
            failed: false,
            read_till_end: false,
            waiting_reported: false,
            finished_reported: false,
            initial_skipping_frame: None,
            looping_shift: 0,
            last_frame_end: 0,
        }
    }

    pub fn stream_index(&self) -> Option<usize> {
        self.stream.index
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn process(&mut self, packets: Vec<Packet>) {
        if self.failed || packets.is_empty() {
            return;
        }
        for packet in packets {
            if packet.is_end_of_stream() {
                self.read_till_end = true;
            }
            self.stream.queue.push_back(packet);
        }
        self.waiting_reported = false;
        if self.initialized {
            self.read_frames();
        } else {
            self.try_bootstrap();
        }
    }

    fn try_bootstrap(&mut self) {
        loop {
            match read_next_frame(&mut self.stream, self.skip_invalid) {
                Ok(DecodedFrame::Video(frame)) => {
                    let Some(position) = frame.pts else {
                        error!("{} ❌ 视频帧没有时间戳", log_ctx());
                        return self.fail(Error::InvalidData);
                    };
                    self.last_frame_end = self.last_frame_end.max(position + frame.duration.max(0));
                    if position < self.options.position {
                        self.initial_skipping_frame = Some(frame);
                        continue;
                    }
                    return self.finish_bootstrap(frame, position);
                }
                Ok(DecodedFrame::Audio(_)) => return self.fail(Error::InvalidData),
                Err(CodecError::EndOfFile) => {
                    let fallback = self.initial_skipping_frame.take();
                    match fallback.and_then(|frame| frame.pts.map(|pts| (frame, pts))) {
                        Some((frame, position)) => return self.finish_bootstrap(frame, position),
                        None => return self.fail(Error::InvalidData),
                    }
                }
                Err(CodecError::Again) => return,
                Err(error) => {
                    error!("{} ❌ 视频启动解码失败: {}", log_ctx(), error);
                    return self.fail(Error::InvalidData);
                }
            }
        }
    }

    fn finish_bootstrap(&mut self, frame: VideoFrame, position: Time) {
        self.initialized = true;
        self.initial_skipping_frame = None;
        self.shared.clock.set_start(position);

        let duration = self.stream.duration;
        let received_till = if self.read_till_end { duration } else { Some(position) };
        let (rotation, alpha) = self
            .stream
            .info
            .as_ref()
            .map_or((0, false), |info| (info.rotation, info.alpha));
        let information = VideoInformation {
            state: TrackState { position: Some(position), received_till, duration },
            size: (frame.width, frame.height),
            rotation,
            alpha,
            cover: Some(frame.clone()),
        };
        info!(
            "{} 🎬 视频轨道就绪: 起始位置 {}ms, {}x{}, 时长 {:?}",
            log_ctx(),
            position,
            frame.width,
            frame.height,
            duration
        );

        self.shared.ring.init(frame, position);
        if let Some(ready) = self.ready.take() {
            ready(information);
        }
        self.read_frames();
    }

    /// 解码到帧环满、呈现到期的帧
    ///
    /// 返回下一次需要检查的延迟（毫秒，世界时间），None 表示等待外部唤醒。
    pub fn read_frames(&mut self) -> Option<Time> {
        if !self.initialized || self.failed {
            return None;
        }
        loop {
            let point = self.shared.clock.track_time(self.time.now(), self.audio_time_point());
            let drop_stale = !self.shared.wait_for_mark_as_shown.load(Ordering::Acquire);
            match self.shared.ring.prepare_state(point.track_time, drop_stale) {
                PrepareState::Prepare(index) => match self.decode_into(index) {
                    Decoded::Frame => continue,
                    Decoded::Waiting | Decoded::Failed => return None,
                },
                PrepareState::Present(index) => {
                    if !self.shared.clock.is_running() {
                        return None;
                    }
                    if !self.present(index) {
                        return None;
                    }
                }
                PrepareState::NextCheck(delay) => {
                    let speed = self.shared.clock.rate();
                    return delay.map(|delay| ((delay as f64) / speed).ceil() as Time);
                }
                PrepareState::Finished => return None,
            }
        }
    }

    fn decode_into(&mut self, index: usize) -> Decoded {
        loop {
            match read_next_frame(&mut self.stream, self.skip_invalid) {
                Ok(DecodedFrame::Video(frame)) => {
                    let Some(pts) = frame.pts else {
                        error!("{} ❌ 视频帧没有时间戳", log_ctx());
                        self.fail(Error::InvalidData);
                        return Decoded::Failed;
                    };
                    self.last_frame_end = self.last_frame_end.max(pts + frame.duration.max(0));
                    self.shared.ring.fill(index, frame, FramePosition::At(pts + self.looping_shift));
                    return Decoded::Frame;
                }
                Ok(DecodedFrame::Audio(_)) => {
                    self.fail(Error::InvalidData);
                    return Decoded::Failed;
                }
                Err(CodecError::EndOfFile) if self.options.looping => self.loop_around(),
                Err(CodecError::EndOfFile) => {
                    debug!("{} 视频解码结束", log_ctx());
                    self.shared.ring.fill_finished(index);
                    return Decoded::Frame;
                }
                Err(CodecError::Again) => {
                    if !self.read_till_end && !self.waiting_reported {
                        self.waiting_reported = true;
                        (self.events)(VideoEvent::WaitingForData);
                    }
                    return Decoded::Waiting;
                }
                Err(error) => {
                    error!("{} ❌ 视频解码失败: {}", log_ctx(), error);
                    self.fail(Error::InvalidData);
                    return Decoded::Failed;
                }
            }
        }
    }

    fn loop_around(&mut self) {
        let duration = match self.stream.duration {
            Some(duration) if duration != DURATION_UNAVAILABLE => duration,
            _ => self.last_frame_end,
        };
        if let Some(decoder) = self.stream.decoder.as_mut() {
            decoder.flush();
        }
        self.looping_shift += duration.max(1);
        self.last_frame_end = 0;
        self.read_till_end = false;
        info!("{} 🔁 视频循环，偏移 {}ms", log_ctx(), self.looping_shift);
    }

    /// 返回 false 表示结束标记（不再有帧）
    fn present(&mut self, index: usize) -> bool {
        let delay = self.shared.delay.swap(0, Ordering::AcqRel);
        self.shared.clock.add_delay(delay);
        let point = self.shared.clock.track_time(self.time.now(), self.audio_time_point());
        let clock = &self.shared.clock;
        match self.shared.ring.present(index, |position| clock.display_time(position, point)) {
            FramePosition::Finished => {
                if !self.finished_reported {
                    self.finished_reported = true;
                    info!("{} 🏁 视频播放结束", log_ctx());
                    (self.events)(VideoEvent::Finished);
                }
                false
            }
            _ => {
                (self.events)(VideoEvent::FrameAvailable);
                true
            }
        }
    }

    fn audio_time_point(&self) -> Option<TimePoint> {
        self.audio.as_ref().and_then(AudioSyncSource::time_point)
    }

    fn fail(&mut self, error: Error) {
        if self.failed {
            return;
        }
        self.failed = true;
        (self.events)(VideoEvent::Failed(error));
    }
}

/// 视频轨道的控制端（Player 线程）
#[derive(Clone)]
pub struct VideoTrackHandle {
    shared: Arc<VideoShared>,
    time: Arc<dyn TimeSource>,
    audio: Option<AudioSyncSource>,
    waker: Notify,
}

impl VideoTrackHandle {
    pub fn new(
        shared: Arc<VideoShared>,
        time: Arc<dyn TimeSource>,
        audio: Option<AudioSyncSource>,
        waker: Notify,
    ) -> Self {
        Self { shared, time, audio, waker }
    }

    pub fn next_frame_display_time(&self) -> NextFrame {
        self.shared.ring.next_frame_display_time()
    }

    /// 渲染端显示了呈现帧，返回它的位置
    pub fn mark_frame_displayed(&self, now: Time) -> Option<Time> {
        self.shared.ring.mark_frame_displayed(now)
    }

    /// 交还已显示的帧，并唤醒解码线程
    pub fn mark_frame_shown(&self) -> bool {
        let shown = self.shared.ring.mark_frame_shown();
        if shown {
            self.waker.notify();
        }
        shown
    }

    pub fn add_timeline_delay(&self, delay: Time) {
        if delay > 0 {
            self.shared.delay.fetch_add(delay, Ordering::AcqRel);
        }
    }

    pub fn set_wait_for_mark_as_shown(&self, wait: bool) {
        self.shared.wait_for_mark_as_shown.store(wait, Ordering::Release);
        self.waker.notify();
    }

    pub fn pause(&self, time: Time) {
        self.shared.clock.pause(time);
    }

    pub fn resume(&self, time: Time) {
        self.shared.clock.resume(time);
        self.waker.notify();
    }

    pub fn set_speed(&self, speed: f64) {
        let audio = self.audio.as_ref().and_then(AudioSyncSource::time_point);
        self.shared.clock.set_rate(speed, self.time.now(), audio);
        self.waker.notify();
    }

    /// 当前显示的帧（可选缩放）
    pub fn frame(&self, request: &FrameRequest) -> Option<VideoFrame> {
        let frame = self.shared.ring.current_frame()?;
        match request.resize {
            Some((width, height)) if (width, height) != (frame.width, frame.height) => {
                resize_nearest(&frame, width, height)
            }
            _ => Some(frame),
        }
    }
}

/// 最近邻缩放（仅 RGBA）
fn resize_nearest(frame: &VideoFrame, width: u32, height: u32) -> Option<VideoFrame> {
    if frame.format != PixelFormat::RGBA || width == 0 || height == 0 || frame.width == 0 || frame.height == 0 {
        return None;
    }
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.data.len() < expected {
        return None;
    }
    let mut data = vec![0u8; width as usize * height as usize * 4];
    for y in 0..height as usize {
        let source_y = y * frame.height as usize / height as usize;
        for x in 0..width as usize {
            let source_x = x * frame.width as usize / width as usize;
            let from = (source_y * frame.width as usize + source_x) * 4;
            let to = (y * width as usize + x) * 4;
            data[to..to + 4].copy_from_slice(&frame.data[from..from + 4]);
        }
    }
    Some(VideoFrame {
        width,
        height,
        data,
        ..frame.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualTime;
    use crate::player::codec::{MediaKind, Rational};
    use crate::player::testing::{synthetic_packet, SyntheticDecoder};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Fixture {
        time: Arc<ManualTime>,
        shared: Arc<VideoShared>,
        handle: VideoTrackHandle,
        ready: Arc<Mutex<Option<VideoInformation>>>,
        events: Arc<Mutex<Vec<VideoEvent>>>,
    }

    fn track(options: PlaybackOptions, duration: Option<Time>) -> (VideoTrack, Fixture) {
        let time = Arc::new(ManualTime::new(1000));
        let shared = VideoShared::new(&options);
        let ready = Arc::new(Mutex::new(None));
        let events = Arc::new(Mutex::new(Vec::new()));
        let stream = Stream {
            index: Some(0),
            info: None,
            time_base: Rational::MILLISECONDS,
            duration,
            decoder: Some(Box::new(SyntheticDecoder::new(MediaKind::Video))),
            queue: VecDeque::new(),
            invalid_data_packets: 0,
        };
        let ready_slot = ready.clone();
        let event_list = events.clone();
        let track = VideoTrack::new(
            options,
            stream,
            shared.clone(),
            time.clone(),
            None,
            10,
            Box::new(move |information| *ready_slot.lock() = Some(information)),
            Box::new(move |event| event_list.lock().push(event)),
        );
        let handle = VideoTrackHandle::new(shared.clone(), time.clone(), None, Notify::new());
        (track, Fixture { time, shared, handle, ready, events })
    }

    fn packets(range: std::ops::Range<i64>) -> Vec<Packet> {
        range.map(|i| synthetic_packet(0, i * 40, 40, false)).collect()
    }

    /// 渲染一帧：返回它的位置
    fn render(track: &mut VideoTrack, fixture: &Fixture) -> Option<Time> {
        track.read_frames();
        match fixture.handle.next_frame_display_time() {
            NextFrame::At(display) => {
                if display > fixture.time.now() {
                    fixture.time.set(display);
                }
                let position = fixture.handle.mark_frame_displayed(fixture.time.now());
                assert!(fixture.handle.mark_frame_shown());
                position
            }
            _ => None,
        }
    }

    #[test]
    fn bootstrap_reports_cover_and_state() {
        let (mut track, fixture) = track(PlaybackOptions::default(), Some(401));
        track.process(packets(0..10));
        let information = fixture.ready.lock().clone().unwrap();
        assert_eq!(information.state.position, Some(0));
        assert_eq!(information.state.duration, Some(401));
        assert_eq!(information.size, (4, 4));
        assert!(information.cover.is_some());
        assert!(fixture.handle.frame(&FrameRequest::default()).is_some());
        // 未开始播放时不呈现
        assert_eq!(fixture.handle.next_frame_display_time(), NextFrame::Unknown);
    }

    #[test]
    fn frames_presented_in_order_after_resume() {
        let (mut track, fixture) = track(PlaybackOptions::default(), Some(401));
        track.process(packets(0..10));
        fixture.handle.resume(fixture.time.now());

        let mut positions = Vec::new();
        for _ in 0..9 {
            if let Some(position) = render(&mut track, &fixture) {
                positions.push(position);
            }
        }
        assert_eq!(positions, (1..10).map(|i| i * 40).collect::<Vec<_>>());
        assert!(fixture.events.lock().contains(&VideoEvent::FrameAvailable));
    }

    #[test]
    fn display_time_follows_clock_and_speed() {
        let options = PlaybackOptions { speed: 2.0, ..Default::default() };
        let (mut track, fixture) = track(options, Some(401));
        track.process(packets(0..10));
        fixture.handle.resume(1000);
        track.read_frames();
        // 40ms 的帧在 2 倍速下 20ms 后显示
        assert_eq!(fixture.handle.next_frame_display_time(), NextFrame::At(1020));
    }

    #[test]
    fn finished_after_end_marker() {
        let (mut track, fixture) = track(PlaybackOptions::default(), Some(121));
        let mut list = packets(0..3);
        list.push(Packet::end_of_stream(0));
        track.process(list);
        fixture.handle.resume(fixture.time.now());

        for _ in 0..4 {
            render(&mut track, &fixture);
        }
        track.read_frames();
        assert!(fixture.events.lock().contains(&VideoEvent::Finished));
        assert_eq!(fixture.ready.lock().clone().unwrap().state.received_till, Some(121));
    }

    #[test]
    fn waiting_for_data_reported_once() {
        let (mut track, fixture) = track(PlaybackOptions::default(), Some(401));
        track.process(packets(0..1));
        track.read_frames();
        track.read_frames();
        let waiting = fixture
            .events
            .lock()
            .iter()
            .filter(|event| **event == VideoEvent::WaitingForData)
            .count();
        assert_eq!(waiting, 1);
    }

    #[test]
    fn looping_shifts_positions() {
        let options = PlaybackOptions { looping: true, mode: crate::core::types::Mode::Video, ..Default::default() };
        let (mut track, fixture) = track(options, Some(120));
        let mut list = packets(0..3);
        list.push(Packet::end_of_stream(0));
        list.extend(packets(0..3));
        track.process(list);
        fixture.handle.resume(fixture.time.now());

        let mut positions = Vec::new();
        for _ in 0..5 {
            if let Some(position) = render(&mut track, &fixture) {
                positions.push(position);
            }
        }
        assert_eq!(positions, vec![40, 80, 120, 160, 200]);
    }

    #[test]
    fn stale_frames_skipped_when_late() {
        let (mut track, fixture) = track(PlaybackOptions::default(), Some(401));
        track.process(packets(0..10));
        fixture.handle.resume(1000);
        fixture.time.set(1200);
        let position = render(&mut track, &fixture).unwrap();
        assert!(position >= 200, "position {}", position);
    }

    #[test]
    fn skips_to_requested_position() {
        let options = PlaybackOptions { position: 100, ..Default::default() };
        let (mut track, fixture) = track(options, Some(401));
        track.process(packets(0..10));
        assert_eq!(fixture.ready.lock().clone().unwrap().state.position, Some(120));
        assert!(fixture.shared.ring.is_initialized());
    }

    #[test]
    fn resize_request() {
        let frame = VideoFrame {
            pts: Some(0),
            duration: 40,
            width: 2,
            height: 1,
            format: PixelFormat::RGBA,
            data: vec![1, 1, 1, 1, 2, 2, 2, 2],
        };
        let resized = resize_nearest(&frame, 4, 2).unwrap();
        assert_eq!(resized.data.len(), 32);
        assert_eq!(&resized.data[0..4], &[1, 1, 1, 1]);
        assert_eq!(&resized.data[12..16], &[2, 2, 2, 2]);
        assert!(resize_nearest(&VideoFrame { format: PixelFormat::NV12, ..frame }, 4, 2).is_none());
    }
}
