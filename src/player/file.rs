use crate::core::config::StreamingConfig;
use crate::core::error::{CodecError, Error, PlayerError, Result};
use crate::core::sync::Notify;
use crate::core::types::{Mode, Time};
use crate::player::codec::{CodecBackend, Container, MediaIo, MediaKind, Packet};
use crate::player::reader::{FillState, Reader};
use crate::player::stream::{compute_stream_duration, Stream};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// DemuxWorker 的回调（由 Player 实现，全部在 worker 线程调用）
pub trait FileDelegate: Send {
    /// 容器已打开、流已选定；返回 false 表示没有可用的流组合，会话以 OpenFailed 结束
    fn file_ready(&mut self, header_size: usize, video: Stream, audio: Stream) -> bool;

    fn file_full_in_cache(&mut self, full: bool);

    fn file_error(&mut self, error: Error);

    /// Reader 需要等待数据块
    fn file_waiting_for_data(&mut self);

    /// 交付排队的包（按流索引）；返回 false 表示数据已经足够，暂停读取
    fn file_process_packets(&mut self, packets: &mut BTreeMap<usize, Vec<Packet>>) -> bool;

    /// 读到文件末尾（结束标记已经交付）；返回 true 表示从头再读一遍
    fn file_process_end_of_file(&mut self) -> bool;

    /// 暂停读取期间被唤醒时询问是否继续读
    fn file_read_more(&mut self) -> bool;

    /// 推进轨道（解码、呈现视频帧）；返回下一次需要处理的延迟（毫秒）
    fn file_process_tracks(&mut self) -> Option<Time>;
}

/// 启动参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStartOptions {
    pub position: Time,
    pub seekable: bool,
    pub mode: Mode,
}

struct WorkerShared {
    interrupted: AtomicBool,
    /// 容器已打开（之后的读取失败归类为 InvalidData）
    opened: AtomicBool,
    /// 检查模式下因为需要等待数据而放弃读取
    aborted: AtomicBool,
    notify: Notify,
}

impl WorkerShared {
    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn sleep(&self, delay: Option<Time>) {
        match delay {
            Some(delay) => {
                self.notify.wait_timeout(Duration::from_millis(delay.max(1) as u64));
            }
            None => self.notify.wait(),
        }
    }
}

/// worker 线程中 Context 与 ReaderIo 共用的部分
struct Feed {
    delegate: Box<dyn FileDelegate>,
    queued: BTreeMap<usize, Vec<Packet>>,
}

impl Feed {
    fn flush(&mut self) -> bool {
        self.delegate.file_process_packets(&mut self.queued)
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

/// 一个打开的媒体：Reader + 按需启动的 DemuxWorker 线程
pub struct File {
    reader: Arc<Reader>,
    backend: Arc<dyn CodecBackend>,
    config: StreamingConfig,
    worker: Option<Worker>,
}

impl File {
    pub fn new(reader: Arc<Reader>, backend: Arc<dyn CodecBackend>, config: StreamingConfig) -> Self {
        Self { reader, backend, config, worker: None }
    }

    pub fn reader(&self) -> &Arc<Reader> {
        &self.reader
    }

    /// 启动 DemuxWorker（已有的会先停止）
    pub fn start(&mut self, delegate: Box<dyn FileDelegate>, options: FileStartOptions) -> Result<()> {
        self.stop(true);

        let shared = Arc::new(WorkerShared {
            interrupted: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let feed = Arc::new(Mutex::new(Feed { delegate, queued: BTreeMap::new() }));
        let context = Context {
            reader: self.reader.clone(),
            backend: self.backend.clone(),
            config: self.config.clone(),
            options,
            shared: shared.clone(),
            feed,
        };

        self.reader.start_streaming();
        let handle = thread::Builder::new()
            .name("myy-demux".into())
            .spawn(move || context.run())
            .map_err(PlayerError::Io)?;
        info!(
            "{} ▶️ DemuxWorker 启动: 位置 {}ms, 模式 {:?}",
            log_ctx(),
            options.position,
            options.mode
        );
        self.worker = Some(Worker { shared, handle: Some(handle) });
        Ok(())
    }

    /// 唤醒 worker（恢复读取、呈现下一帧）
    pub fn wake(&self) {
        if let Some(worker) = &self.worker {
            worker.shared.notify.notify();
        }
    }

    pub fn waker(&self) -> Option<Notify> {
        self.worker.as_ref().map(|worker| worker.shared.notify.clone())
    }

    pub fn active(&self) -> bool {
        self.worker.is_some()
    }

    /// 中断并等待 worker 退出
    ///
    /// still_active 为 true 时马上会开始新的会话，不取消未完成的加载请求。
    pub fn stop(&mut self, still_active: bool) {
        if let Some(mut worker) = self.worker.take() {
            worker.shared.interrupted.store(true, Ordering::Release);
            worker.shared.notify.notify();
            self.reader.wake_waiting();
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("{} ❌ DemuxWorker 线程异常退出", log_ctx());
                }
            }
            info!("{} ⏹ DemuxWorker 已停止", log_ctx());
        }
        self.reader.stop_streaming(still_active);
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.stop(false);
    }
}

/// 容器通过它从 Reader 拉取字节
struct ReaderIo {
    reader: Arc<Reader>,
    shared: Arc<WorkerShared>,
    feed: Arc<Mutex<Feed>>,
    inspection: bool,
    offset: u64,
}

impl ReaderIo {
    fn wait_for_data(&self, first: bool) {
        if first {
            let mut feed = self.feed.lock();
            // 等待期间先把已经读到的包交出去
            feed.flush();
            feed.delegate.file_waiting_for_data();
        }
        let delay = self.feed.lock().delegate.file_process_tracks();
        self.shared.sleep(delay);
    }
}

impl Read for ReaderIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.reader.size();
        if self.offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((size - self.offset) as usize);
        let buffer = &mut buf[..len];
        let mut reported = false;
        loop {
            if self.shared.interrupted() {
                return Err(io::Error::new(io::ErrorKind::Other, "读取被中断"));
            }
            match self.reader.fill(self.offset, buffer, &self.shared.notify) {
                FillState::Success => {
                    self.offset += len as u64;
                    return Ok(len);
                }
                FillState::Failed => {
                    return Err(io::Error::new(io::ErrorKind::Other, "Reader 读取失败"));
                }
                FillState::Waiting => {
                    if self.inspection && self.shared.opened.load(Ordering::Acquire) {
                        self.shared.aborted.store(true, Ordering::Release);
                        return Err(io::Error::new(io::ErrorKind::WouldBlock, "检查模式不等待数据"));
                    }
                    if !reported {
                        debug!("{} ⏳ 等待数据: offset={}", log_ctx(), self.offset);
                    }
                    self.wait_for_data(!reported);
                    reported = true;
                }
            }
        }
    }
}

impl Seek for ReaderIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.reader.size() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => size + delta as i128,
            SeekFrom::Current(delta) => self.offset as i128 + delta as i128,
        };
        if target < 0 || target > size {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek 越界"));
        }
        self.offset = target as u64;
        Ok(self.offset)
    }
}

impl MediaIo for ReaderIo {
    fn size(&self) -> u64 {
        self.reader.size()
    }
}

/// DemuxWorker 线程里的会话上下文
struct Context {
    reader: Arc<Reader>,
    backend: Arc<dyn CodecBackend>,
    config: StreamingConfig,
    options: FileStartOptions,
    shared: Arc<WorkerShared>,
    feed: Arc<Mutex<Feed>>,
}

impl Context {
    fn run(self) {
        info!("{} 🎬 DemuxWorker 线程启动", log_ctx());
        if let Some(mut container) = self.open() {
            self.read_loop(container.as_mut());
        }
        info!("{} 🛑 DemuxWorker 线程退出", log_ctx());
    }

    fn open(&self) -> Option<Box<dyn Container>> {
        let io = ReaderIo {
            reader: self.reader.clone(),
            shared: self.shared.clone(),
            feed: self.feed.clone(),
            inspection: self.options.mode == Mode::Inspection,
            offset: 0,
        };
        let mut container = match self.backend.open(Box::new(io)) {
            Ok(container) => container,
            Err(error) => {
                self.fail(error);
                return None;
            }
        };
        if self.shared.interrupted() {
            return None;
        }

        let container_duration = container.duration();
        let video = if self.options.mode.wants_video() {
            self.init_stream(container.as_mut(), MediaKind::Video, container_duration)
        } else {
            Stream::empty()
        };
        let audio = if self.options.mode.wants_audio() {
            self.init_stream(container.as_mut(), MediaKind::Audio, container_duration)
        } else {
            Stream::empty()
        };
        if !video.is_active() && !audio.is_active() {
            error!("{} ❌ 没有可播放的流（模式 {:?}）", log_ctx(), self.options.mode);
            self.report(Error::OpenFailed);
            return None;
        }

        let position = if self.options.seekable { self.options.position } else { 0 };
        if position > 0 {
            let index = video.index.or(audio.index)?;
            if let Err(error) = container.seek(index, position) {
                warn!("{} ⚠️ seek 到 {}ms 失败（{}），从头开始", log_ctx(), position, error);
                if let Err(error) = container.seek(index, 0) {
                    self.fail(error);
                    return None;
                }
            } else {
                info!("{} ⏩ 向后 seek 到 {}ms", log_ctx(), position);
            }
        }
        if self.shared.interrupted() {
            return None;
        }

        self.reader.header_done();
        self.shared.opened.store(true, Ordering::Release);
        let header_size = self.reader.header_size();

        let mut feed = self.feed.lock();
        feed.queued.clear();
        for index in video.index.into_iter().chain(audio.index) {
            feed.queued.insert(index, Vec::new());
        }
        info!(
            "{} 📂 容器已打开: 视频流 {:?}, 音频流 {:?}, 头部 {} bytes",
            log_ctx(),
            video.index,
            audio.index,
            header_size
        );
        if !feed.delegate.file_ready(header_size, video, audio) {
            drop(feed);
            self.report(Error::OpenFailed);
            return None;
        }
        feed.delegate.file_full_in_cache(self.reader.full_in_cache());
        drop(feed);
        Some(container)
    }

    /// 选出某类型的流并打开解码器；失败时禁用这一路
    fn init_stream(&self, container: &mut dyn Container, kind: MediaKind, container_duration: Option<Time>) -> Stream {
        let Some(index) = container.best_stream(kind) else {
            return Stream::empty();
        };
        let Some(info) = container.streams().into_iter().find(|info| info.index == index) else {
            return Stream::empty();
        };
        let Some(duration) = compute_stream_duration(&info, container_duration, self.config.duration_max_ms) else {
            warn!("{} ⚠️ {:?} 流 {} 时长不合法，禁用", log_ctx(), kind, index);
            return Stream::empty();
        };
        let decoder = match container.open_decoder(index) {
            Ok(decoder) => decoder,
            Err(error) => {
                warn!("{} ⚠️ {:?} 流 {} 打开解码器失败: {}，禁用", log_ctx(), kind, index, error);
                return Stream::empty();
            }
        };
        Stream {
            index: Some(index),
            time_base: info.time_base,
            duration: Some(duration),
            decoder: Some(decoder),
            info: Some(info),
            ..Stream::empty()
        }
    }

    fn read_loop(&self, container: &mut dyn Container) {
        let mut read_till_end = false;
        let mut packets_count: usize = 0;
        loop {
            if self.shared.interrupted() {
                return;
            }
            if read_till_end {
                let delay = self.feed.lock().delegate.file_process_tracks();
                self.shared.sleep(delay);
                continue;
            }
            match container.read_packet() {
                Ok(packet) => {
                    packets_count += 1;
                    let full = {
                        let mut feed = self.feed.lock();
                        match feed.queued.get_mut(&packet.stream_index) {
                            Some(queue) => {
                                queue.push(packet);
                                queue.len() >= self.config.max_queued_packets
                            }
                            None => false,
                        }
                    };
                    if full && !self.process_queued() {
                        return;
                    }
                }
                Err(CodecError::EndOfFile) => {
                    info!("{} 📄 读到文件末尾（共 {} 个包）", log_ctx(), packets_count);
                    {
                        let mut feed = self.feed.lock();
                        for (index, queue) in feed.queued.iter_mut() {
                            queue.push(Packet::end_of_stream(*index));
                        }
                    }
                    if !self.process_queued() {
                        return;
                    }
                    let again = self.feed.lock().delegate.file_process_end_of_file();
                    if !again {
                        read_till_end = true;
                        continue;
                    }
                    let index = self.feed.lock().queued.keys().next().copied();
                    let Some(index) = index else {
                        read_till_end = true;
                        continue;
                    };
                    info!("{} 🔁 循环播放，从头读取", log_ctx());
                    if let Err(error) = container.seek(index, 0) {
                        self.fail(error);
                        return;
                    }
                }
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    /// 交出排队的包；数据足够时休眠到 delegate 要求继续。返回 false 表示被中断
    fn process_queued(&self) -> bool {
        if self.feed.lock().flush() {
            return true;
        }
        debug!("{} 💤 数据已足够，暂停读取", log_ctx());
        loop {
            if self.shared.interrupted() {
                return false;
            }
            let delay = {
                let mut feed = self.feed.lock();
                if feed.delegate.file_read_more() {
                    debug!("{} 继续读取", log_ctx());
                    return true;
                }
                feed.delegate.file_process_tracks()
            };
            self.shared.sleep(delay);
        }
    }

    /// 容器层失败：按 Reader 状态与是否已打开归类
    fn fail(&self, error: CodecError) {
        if self.shared.interrupted() {
            return;
        }
        let opened = self.shared.opened.load(Ordering::Acquire);
        let classified = match self.reader.streaming_error() {
            Some(Error::NotStreamable) => Error::NotStreamable,
            _ if self.shared.aborted.load(Ordering::Acquire) => Error::OpenFailed,
            _ if opened => Error::InvalidData,
            _ => Error::OpenFailed,
        };
        error!("{} ❌ DemuxWorker 失败: {} -> {:?}", log_ctx(), error, classified);
        self.report(classified);
    }

    fn report(&self, error: Error) {
        if self.shared.interrupted() {
            return;
        }
        self.feed.lock().delegate.file_error(error);
    }
}
