//! 视频帧环：解码线程与渲染线程之间无锁交换 4 个帧槽
//!
//! 共享状态只有一个取值 0..8 的原子计数器 c：
//! - `c / 2` 是当前正在显示（shown）的槽
//! - 偶数 c：解码端拥有 `(c/2 + 1) % 4`、`(c/2 + 2) % 4`，把前者准备好后“呈现”（present），计数器 +1
//! - 奇数 c：`(c/2 + 1) % 4` 已呈现给渲染端；解码端继续预解码 `(c/2 + 2) % 4`、`(c/2 + 3) % 4`；
//!   渲染端显示完后把计数器推进到 `(c + 1) % 8`
//!
//! 每个状态下两端访问的槽互不相交，所以任何一端都不需要等待另一端。

use crate::core::types::{Time, VideoFrame};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub const FRAMES_COUNT: usize = 4;
const COUNTER_VALUES: u8 = 2 * FRAMES_COUNT as u8;

/// 帧位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FramePosition {
    Unknown,
    At(Time),
    /// 解码结束标记，排在任何真实位置之后
    Finished,
}

/// 帧的显示状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Displayed {
    No,
    At(Time),
    /// 未显示就被丢弃（过期或初始帧）
    Skipped,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Option<VideoFrame>,
    pub position: FramePosition,
    /// 计划显示的世界时间
    pub display: Option<Time>,
    pub displayed: Displayed,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            image: None,
            position: FramePosition::Unknown,
            display: None,
            displayed: Displayed::No,
        }
    }
}

impl Frame {
    /// 已解码且尚未显示
    pub fn is_decoded(&self) -> bool {
        self.position != FramePosition::Unknown && self.displayed == Displayed::No
    }

    /// 已经落后于轨道时间
    pub fn is_stale(&self, track_time: Time) -> bool {
        matches!(self.position, FramePosition::At(position) if position < track_time)
    }

    /// 清空，等待重新解码
    pub fn reset(&mut self) {
        self.position = FramePosition::Unknown;
        self.display = None;
        self.displayed = Displayed::No;
    }
}

/// 计数器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingState(u8);

/// 状态转换事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// 解码端呈现了一帧（偶数 -> 奇数）
    Presented,
    /// 渲染端显示完了呈现的帧（奇数 -> 偶数）
    Shown,
}

/// 当前由哪一端推进计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Decoder,
    Renderer,
}

impl RingState {
    pub const ALL: [RingState; COUNTER_VALUES as usize] = [
        RingState(0),
        RingState(1),
        RingState(2),
        RingState(3),
        RingState(4),
        RingState(5),
        RingState(6),
        RingState(7),
    ];

    pub fn from_counter(counter: u8) -> Option<Self> {
        (counter < COUNTER_VALUES).then_some(Self(counter))
    }

    pub fn counter(self) -> u8 {
        self.0
    }

    pub fn turn(self) -> Turn {
        if self.0 % 2 == 0 {
            Turn::Decoder
        } else {
            Turn::Renderer
        }
    }

    /// 渲染端正在显示的槽
    pub fn shown(self) -> usize {
        (self.0 / 2) as usize
    }

    /// 已呈现、等待渲染端显示的槽（仅奇数状态）
    pub fn presented(self) -> Option<usize> {
        match self.turn() {
            Turn::Renderer => Some((self.shown() + 1) % FRAMES_COUNT),
            Turn::Decoder => None,
        }
    }

    /// 解码端可以写的槽
    pub fn decoder_slots(self) -> [usize; 2] {
        let shown = self.shown();
        match self.turn() {
            Turn::Decoder => [(shown + 1) % FRAMES_COUNT, (shown + 2) % FRAMES_COUNT],
            Turn::Renderer => [(shown + 2) % FRAMES_COUNT, (shown + 3) % FRAMES_COUNT],
        }
    }

    /// 渲染端可以读的槽
    pub fn renderer_slots(self) -> Vec<usize> {
        let mut slots = vec![self.shown()];
        slots.extend(self.presented());
        slots
    }

    /// 下一个准备（解码）的槽
    pub fn prepare(self) -> usize {
        self.decoder_slots()[0]
    }

    pub fn apply(self, event: RingEvent) -> Option<RingState> {
        match (self.turn(), event) {
            (Turn::Decoder, RingEvent::Presented) => Some(Self(self.0 + 1)),
            (Turn::Renderer, RingEvent::Shown) => Some(Self((self.0 + 1) % COUNTER_VALUES)),
            _ => None,
        }
    }
}

/// 解码端 prepare_state() 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// 需要解码一帧放进这个槽
    Prepare(usize),
    /// 呈现下一帧（只在偶数状态）
    Present(usize),
    /// 已经全部准备好，可以在这么多毫秒后再检查过期帧
    NextCheck(Option<Time>),
    /// 结束标记已经呈现出来，不用再做任何事
    Finished,
}

/// 渲染端看到的下一帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFrame {
    /// 还没有呈现的帧
    Unknown,
    /// 应该在这个世界时间显示
    At(Time),
    /// 已经显示，等待 mark_frame_shown
    AlreadyDone,
}

/// 4 槽帧环
///
/// 解码端方法只能在单个解码线程调用，渲染端方法只能在单个渲染线程调用。
pub struct FrameRing {
    counter: AtomicU8,
    initialized: AtomicBool,
    frames: [UnsafeCell<Frame>; FRAMES_COUNT],
}

// 计数器保证两端在任何状态下访问的槽互不相交，Acquire/Release 保证槽内容的可见性
unsafe impl Sync for FrameRing {}
unsafe impl Send for FrameRing {}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            counter: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            frames: Default::default(),
        }
    }

    fn state(&self) -> RingState {
        RingState(self.counter.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// # Safety
    /// 只能访问当前状态下属于调用方的槽
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, index: usize) -> &mut Frame {
        &mut *self.frames[index].get()
    }

    // ---- 解码端 ----

    /// 放入第一帧（封面），状态归零
    pub fn init(&self, image: VideoFrame, position: Time) {
        debug_assert!(!self.is_initialized());
        for index in 0..FRAMES_COUNT {
            // 渲染端在 initialized 之前不会访问任何槽
            let frame = unsafe { self.slot(index) };
            *frame = Frame::default();
        }
        let first = unsafe { self.slot(0) };
        first.image = Some(image);
        first.position = FramePosition::At(position);
        first.displayed = Displayed::Skipped;
        self.counter.store(0, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
    }

    /// 解码端下一步要做什么
    ///
    /// drop_stale 时会丢弃已经落后于 track_time 的预解码帧。
    pub fn prepare_state(&self, track_time: Time, drop_stale: bool) -> PrepareState {
        let state = self.state();
        let [first, second] = state.decoder_slots();
        match state.turn() {
            Turn::Decoder => {
                let frame = unsafe { self.slot(first) };
                if !frame.is_decoded() {
                    return PrepareState::Prepare(first);
                }
                if frame.position == FramePosition::Finished {
                    return PrepareState::Present(first);
                }
                if drop_stale && frame.is_stale(track_time) {
                    let next = unsafe { self.slot(second) };
                    if !next.is_decoded() {
                        return PrepareState::Prepare(second);
                    }
                    if next.position != FramePosition::Finished && next.is_stale(track_time) {
                        // 两帧都过期：丢掉旧的，把新的挪到前面
                        std::mem::swap(frame, next);
                        next.reset();
                        next.displayed = Displayed::Skipped;
                        return PrepareState::Prepare(second);
                    }
                    if next.position != FramePosition::Finished {
                        std::mem::swap(frame, next);
                        next.reset();
                        next.displayed = Displayed::Skipped;
                    }
                }
                PrepareState::Present(first)
            }
            Turn::Renderer => {
                let frame = unsafe { self.slot(first) };
                if frame.position == FramePosition::Finished && frame.is_decoded() {
                    return PrepareState::Finished;
                }
                if !frame.is_decoded() {
                    return PrepareState::Prepare(first);
                }
                let next = unsafe { self.slot(second) };
                if frame.position != FramePosition::Finished && !next.is_decoded() {
                    return PrepareState::Prepare(second);
                }
                if drop_stale && next.is_decoded() && next.position != FramePosition::Finished {
                    if frame.is_stale(track_time) && next.is_stale(track_time) {
                        std::mem::swap(frame, next);
                        next.reset();
                        next.displayed = Displayed::Skipped;
                        return PrepareState::Prepare(second);
                    }
                    if let FramePosition::At(position) = frame.position {
                        return PrepareState::NextCheck(Some((position - track_time).max(0) + 1));
                    }
                }
                PrepareState::NextCheck(None)
            }
        }
    }

    /// 写入准备槽
    ///
    /// 只能对 prepare_state() 刚返回的 Prepare 槽调用。
    pub fn fill(&self, index: usize, image: VideoFrame, position: FramePosition) {
        debug_assert!(self.state().decoder_slots().contains(&index));
        let frame = unsafe { self.slot(index) };
        frame.image = Some(image);
        frame.position = position;
        frame.display = None;
        frame.displayed = Displayed::No;
    }

    /// 在准备槽写入结束标记
    pub fn fill_finished(&self, index: usize) {
        debug_assert!(self.state().decoder_slots().contains(&index));
        let frame = unsafe { self.slot(index) };
        frame.position = FramePosition::Finished;
        frame.display = None;
        frame.displayed = Displayed::No;
    }

    /// 呈现 index 槽（偶数 -> 奇数）
    ///
    /// 返回帧位置；结束标记不会推进计数器。
    pub fn present(&self, index: usize, display: impl FnOnce(Time) -> Time) -> FramePosition {
        let state = self.state();
        debug_assert_eq!(state.turn(), Turn::Decoder);
        debug_assert_eq!(state.prepare(), index);
        let frame = unsafe { self.slot(index) };
        let FramePosition::At(position) = frame.position else {
            return frame.position;
        };
        frame.display = Some(display(position));
        if let Some(next) = state.apply(RingEvent::Presented) {
            self.counter.store(next.counter(), Ordering::Release);
        }
        frame.position
    }

    /// 结束标记是否已在呈现位置（解码端查看）
    pub fn finished_presented(&self) -> bool {
        let state = self.state();
        state.turn() == Turn::Decoder
            && unsafe { self.slot(state.prepare()) }.position == FramePosition::Finished
    }

    // ---- 渲染端 ----

    /// 呈现帧计划的显示时间
    pub fn next_frame_display_time(&self) -> NextFrame {
        if !self.is_initialized() {
            return NextFrame::Unknown;
        }
        let state = self.state();
        let Some(index) = state.presented() else {
            return NextFrame::Unknown;
        };
        let frame = unsafe { &*self.frames[index].get() };
        match (frame.displayed, frame.display) {
            (Displayed::At(_), _) => NextFrame::AlreadyDone,
            (_, Some(display)) => NextFrame::At(display),
            (_, None) => NextFrame::Unknown,
        }
    }

    /// 渲染端显示了呈现帧，返回它的位置
    pub fn mark_frame_displayed(&self, now: Time) -> Option<Time> {
        if !self.is_initialized() {
            return None;
        }
        let index = self.state().presented()?;
        let frame = unsafe { self.slot(index) };
        frame.displayed = Displayed::At(now);
        match frame.position {
            FramePosition::At(position) => Some(position),
            _ => None,
        }
    }

    /// 交还已显示的帧（奇数 -> 偶数），返回是否推进
    pub fn mark_frame_shown(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let state = self.state();
        let Some(index) = state.presented() else {
            return false;
        };
        let frame = unsafe { &*self.frames[index].get() };
        if !matches!(frame.displayed, Displayed::At(_)) {
            return false;
        }
        match state.apply(RingEvent::Shown) {
            Some(next) => {
                self.counter.store(next.counter(), Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// 当前显示帧的拷贝
    pub fn current_frame(&self) -> Option<VideoFrame> {
        if !self.is_initialized() {
            return None;
        }
        let index = self.state().shown();
        let frame = unsafe { &*self.frames[index].get() };
        frame.image.clone()
    }
}
