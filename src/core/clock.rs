use crate::core::types::{Time, TimePoint};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 世界时间来源（毫秒，单调）
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Time;
}

/// 基于 Instant 的单调时钟
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> Time {
        self.origin.elapsed().as_millis() as Time
    }
}

/// 手动推进的时钟，用于确定性驱动（测试、离线渲染）
#[derive(Default)]
pub struct ManualTime {
    now: AtomicI64,
}

impl ManualTime {
    pub fn new(start: Time) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn set(&self, time: Time) {
        self.now.store(time, Ordering::Release);
    }

    pub fn advance(&self, delta: Time) {
        self.now.fetch_add(delta, Ordering::AcqRel);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> Time {
        self.now.load(Ordering::Acquire)
    }
}

/// 播放时钟 - 轨道时间与世界时间的换算（视频轨道用它计算帧显示时刻）
///
/// - 未 resume 之前时间停在起始位置
/// - 暂停期间世界时间冻结在暂停时刻，恢复时把同步点整体后移
/// - 有音频时，用音频输出报告的时间点校正（视频跟随音频，而不是墙钟）
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    sync_track: Time,           // 同步点：轨道时间
    sync_world: Option<Time>,   // 同步点：世界时间（None = 还未开始）
    paused_at: Option<Time>,
    resumed_at: Option<Time>,
    playback_rate: f64,         // 播放速率（1.0 = 正常）
}

impl PlaybackClock {
    pub fn new(started_position: Time, rate: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                sync_track: started_position,
                sync_world: None,
                paused_at: None,
                resumed_at: None,
                playback_rate: rate,
            })),
        }
    }

    /// 启动阶段确定了实际起始位置（可能在请求位置之后）
    pub fn set_start(&self, position: Time) {
        let mut inner = self.inner.lock();
        if inner.sync_world.is_none() {
            inner.sync_track = position;
        }
    }

    /// 当前轨道时间（world_time 为计算所用的世界时间）
    pub fn track_time(&self, now: Time, audio: Option<TimePoint>) -> TimePoint {
        let mut inner = self.inner.lock();
        Self::track_time_locked(&mut inner, now, audio)
    }

    fn track_time_locked(inner: &mut ClockInner, now: Time, audio: Option<TimePoint>) -> TimePoint {
        let world_time = inner.paused_at.unwrap_or(now);
        let Some(mut sync_world) = inner.sync_world else {
            return TimePoint { track_time: inner.sync_track, world_time };
        };
        if let (Some(point), Some(resumed)) = (audio, inner.resumed_at) {
            if point.world_time > resumed {
                inner.sync_track = point.track_time;
                inner.sync_world = Some(point.world_time);
                sync_world = point.world_time;
            }
        }
        let elapsed = (world_time - sync_world) as f64 * inner.playback_rate;
        TimePoint {
            track_time: inner.sync_track + elapsed.round() as Time,
            world_time,
        }
    }

    /// 轨道位置 position 应当在什么世界时间显示
    pub fn display_time(&self, position: Time, at: TimePoint) -> Time {
        let rate = self.inner.lock().playback_rate;
        at.world_time + ((position - at.track_time) as f64 / rate).round() as Time
    }

    /// 已开始且未暂停
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.sync_world.is_some() && inner.paused_at.is_none()
    }

    pub fn pause(&self, time: Time) {
        let mut inner = self.inner.lock();
        if inner.paused_at.is_none() {
            inner.paused_at = Some(time);
        }
    }

    pub fn resume(&self, time: Time) {
        let mut inner = self.inner.lock();
        inner.resumed_at = Some(time);
        match (inner.paused_at.take(), inner.sync_world) {
            (Some(paused_at), Some(sync_world)) => {
                inner.sync_world = Some(sync_world + (time - paused_at).max(0));
            }
            _ => inner.sync_world = Some(time),
        }
    }

    /// 改变速率前先把同步点挪到“现在”，避免已经走过的时间被重新换算
    pub fn set_rate(&self, rate: f64, now: Time, audio: Option<TimePoint>) {
        let mut inner = self.inner.lock();
        if inner.sync_world.is_some() {
            let point = Self::track_time_locked(&mut inner, now, audio);
            inner.sync_track = point.track_time;
            inner.sync_world = Some(point.world_time);
        }
        inner.playback_rate = rate;
    }

    /// 渲染端晚显示了 delay 毫秒，把时间轴整体后移
    pub fn add_delay(&self, delay: Time) {
        if delay <= 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(world) = inner.sync_world.as_mut() {
            *world += delay;
        }
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }
}
