use crate::core::error::Result;
use crate::core::sync::Notify;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 加载粒度（块大小）
pub const PART_SIZE: usize = 128 * 1024;

/// 每个分片包含的块数
pub const PARTS_IN_SLICE: usize = 64;

/// 分片大小
pub const SLICE_SIZE: usize = PART_SIZE * PARTS_IN_SLICE;

/// 持久缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub high: u64,
    pub low: u64,
}

impl CacheKey {
    /// 第 number 个分片的键
    pub fn slice(self, number: u64) -> CacheKey {
        CacheKey { high: self.high, low: self.low.wrapping_add(number) }
    }
}

/// Loader 产出的一块数据，或失败标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPart {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl LoadedPart {
    pub const FAILED_OFFSET: u64 = u64::MAX;

    pub fn failed() -> Self {
        Self { offset: Self::FAILED_OFFSET, bytes: Vec::new() }
    }

    pub fn is_failed(&self) -> bool {
        self.offset == Self::FAILED_OFFSET
    }

    /// 对齐到块边界，长度为整块，或恰好到文件末尾
    pub fn valid(&self, size: u64) -> bool {
        if self.is_failed() || self.offset % PART_SIZE as u64 != 0 {
            return false;
        }
        let len = self.bytes.len() as u64;
        let Some(end) = self.offset.checked_add(len) else {
            return false;
        };
        len > 0 && end <= size && (len == PART_SIZE as u64 || end == size)
    }
}

/// Loader 向 Reader 交付数据块的句柄
///
/// 交付时唤醒 Reader 当前登记的等待者（如果有）。
#[derive(Clone)]
pub struct PartSink {
    tx: Sender<LoadedPart>,
    waiting: Arc<Mutex<Option<Notify>>>,
}

impl PartSink {
    pub(crate) fn new() -> (Self, Receiver<LoadedPart>) {
        let (tx, rx) = unbounded();
        let sink = Self { tx, waiting: Arc::new(Mutex::new(None)) };
        (sink, rx)
    }

    /// 返回 false 表示 Reader 已经不存在
    pub fn deliver(&self, part: LoadedPart) -> bool {
        if self.tx.send(part).is_err() {
            return false;
        }
        self.wake_waiting();
        true
    }

    pub(crate) fn set_waiting(&self, notify: Option<Notify>) {
        *self.waiting.lock() = notify;
    }

    pub(crate) fn wake_waiting(&self) {
        if let Some(notify) = self.waiting.lock().take() {
            notify.notify();
        }
    }
}

/// 字节区间加载器（本地文件或远程下载）
///
/// load() 是异步的：结果通过 attach() 提供的 PartSink 交付，失败以 LoadedPart::failed() 表示。
pub trait Loader: Send + Sync {
    fn size(&self) -> u64;

    /// 远程加载器提供持久缓存键，本地加载器返回 None
    fn cache_key(&self) -> Option<CacheKey>;

    fn attach(&self, sink: PartSink);

    /// 请求 offset 所在的块（向下取整到 PART_SIZE）
    fn load(&self, offset: u64);

    fn cancel(&self, offset: u64);

    /// 之前的请求全部降级到之后请求的后面
    fn reset_priorities(&self);

    fn set_priority(&self, priority: i32);

    fn stop(&self);
}

enum LoaderCommand {
    Attach(PartSink),
    Load(u64),
    Cancel(u64),
    ResetPriorities,
    SetPriority(i32),
    Stop,
}

/// 本地文件加载器：后台线程按优先级顺序读取，优先级 <= 0 时暂停读取
pub struct FileLoader {
    path: PathBuf,
    size: u64,
    command_tx: Sender<LoaderCommand>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path)?;
        let size = file.metadata()?.len();
        let (command_tx, command_rx) = unbounded();

        info!("{} 📂 打开本地文件: {:?} ({} bytes)", log_ctx(), path, size);
        let thread_handle = thread::Builder::new()
            .name("file-loader".into())
            .spawn(move || Self::load_loop(file, size, command_rx))?;

        Ok(Self {
            path,
            size,
            command_tx,
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载循环：空闲时阻塞在命令通道上，有请求时先处理完所有命令再读一块
    fn load_loop(mut file: fs::File, size: u64, command_rx: Receiver<LoaderCommand>) {
        let mut sink: Option<PartSink> = None;
        // (代数, offset)：代数越大越优先，同代先来先服务
        let mut pending: VecDeque<(u64, u64)> = VecDeque::new();
        let mut generation = 0u64;
        let mut priority = 1i32;

        loop {
            let command = if pending.is_empty() || priority <= 0 {
                match command_rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            } else {
                command_rx.try_recv().ok()
            };

            if let Some(command) = command {
                match command {
                    LoaderCommand::Attach(new_sink) => sink = Some(new_sink),
                    LoaderCommand::Load(offset) => {
                        if !pending.iter().any(|&(_, o)| o == offset) {
                            pending.push_back((generation, offset));
                        }
                    }
                    LoaderCommand::Cancel(offset) => pending.retain(|&(_, o)| o != offset),
                    LoaderCommand::ResetPriorities => generation += 1,
                    LoaderCommand::SetPriority(value) => {
                        if (value <= 0) != (priority <= 0) {
                            debug!(
                                "{} {} 优先级 {} -> {}，待读 {} 块",
                                log_ctx(),
                                if value <= 0 { "⏸️" } else { "▶️" },
                                priority,
                                value,
                                pending.len()
                            );
                        }
                        priority = value;
                    }
                    LoaderCommand::Stop => break,
                }
                continue;
            }

            let Some(index) = pending
                .iter()
                .enumerate()
                .max_by_key(|(index, (generation, _))| (*generation, std::cmp::Reverse(*index)))
                .map(|(index, _)| index)
            else {
                continue;
            };
            let Some((_, offset)) = pending.remove(index) else {
                continue;
            };
            let Some(sink) = sink.as_ref() else {
                warn!("{} ⚠️ 加载器未连接 Reader，丢弃请求 {}", log_ctx(), offset);
                continue;
            };

            let part = Self::read_part(&mut file, size, offset).unwrap_or_else(|e| {
                warn!("{} ⚠️ 读取块失败 offset={}: {}", log_ctx(), offset, e);
                LoadedPart::failed()
            });
            if !sink.deliver(part) {
                debug!("{} Reader 已释放，加载线程退出", log_ctx());
                break;
            }
        }
        debug!("{} 🛑 文件加载线程退出", log_ctx());
    }

    fn read_part(file: &mut fs::File, size: u64, offset: u64) -> std::io::Result<LoadedPart> {
        let len = (size.saturating_sub(offset)).min(PART_SIZE as u64) as usize;
        let mut bytes = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut bytes)?;
        Ok(LoadedPart { offset, bytes })
    }

    fn send(&self, command: LoaderCommand) {
        if self.command_tx.send(command).is_err() {
            debug!("{} 加载线程已退出，忽略命令", log_ctx());
        }
    }
}

impl Loader for FileLoader {
    fn size(&self) -> u64 {
        self.size
    }

    fn cache_key(&self) -> Option<CacheKey> {
        None
    }

    fn attach(&self, sink: PartSink) {
        self.send(LoaderCommand::Attach(sink));
    }

    fn load(&self, offset: u64) {
        let offset = offset - offset % PART_SIZE as u64;
        if offset >= self.size {
            warn!("{} ⚠️ 请求超出文件末尾: {} >= {}", log_ctx(), offset, self.size);
            return;
        }
        self.send(LoaderCommand::Load(offset));
    }

    fn cancel(&self, offset: u64) {
        self.send(LoaderCommand::Cancel(offset - offset % PART_SIZE as u64));
    }

    fn reset_priorities(&self) {
        self.send(LoaderCommand::ResetPriorities);
    }

    fn set_priority(&self, priority: i32) {
        self.send(LoaderCommand::SetPriority(priority));
    }

    fn stop(&self) {
        self.send(LoaderCommand::Stop);
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ 加载线程异常退出", log_ctx());
            }
        }
    }
}

impl Drop for FileLoader {
    fn drop(&mut self) {
        self.stop();
    }
}
