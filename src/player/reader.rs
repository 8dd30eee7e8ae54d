use crate::core::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::sync::Notify;
use crate::player::cache::{parse_slice, serialize_slice, CacheStore};
use crate::player::loader::{CacheKey, LoadedPart, Loader, PartSink, PART_SIZE, SLICE_SIZE};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::process;
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 文件不超过这么多块时，整个文件都可以当作头部读入
const MAX_ONLY_IN_HEADER_PARTS: u64 = 80;

/// fill() 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    Success,
    /// 已经发出加载请求，等 notify 被唤醒后重试
    Waiting,
    /// Reader 已永久失败，见 streaming_error()
    Failed,
}

#[derive(Default)]
struct Slice {
    /// 分片内相对偏移 -> 块数据
    parts: BTreeMap<u64, Arc<[u8]>>,
    loaded_from_cache: bool,
    changed_since_cache: bool,
    /// 曾经完整加载过（卸载后仍然保留）
    full_in_cache: bool,
}

struct ReaderInner {
    slices: Vec<Slice>,
    /// 最近使用顺序，队首最久未用
    used: VecDeque<usize>,
    /// 已请求、尚未交付的块
    loading: BTreeSet<u64>,
    header_parts: BTreeSet<u64>,
    header_done: bool,
    error: Option<Error>,
    streaming_active: bool,
    real_priority: i32,
}

enum Located {
    Ready(Vec<(u64, Arc<[u8]>)>),
    Missing(u64),
}

/// 把异步、稀疏的 Loader 变成同步的“从 offset 读 N 字节”
///
/// 只有 fill() 的簿记部分持锁，字节拷贝在锁外完成。
pub struct Reader {
    loader: Arc<dyn Loader>,
    size: u64,
    cache: Option<(Arc<dyn CacheStore>, CacheKey)>,
    sink: PartSink,
    parts: Receiver<LoadedPart>,
    config: StreamingConfig,
    inner: Mutex<ReaderInner>,
}

impl Reader {
    pub fn new(
        loader: Arc<dyn Loader>,
        cache: Option<Arc<dyn CacheStore>>,
        config: StreamingConfig,
    ) -> Self {
        let size = loader.size();
        let (sink, parts) = PartSink::new();
        loader.attach(sink.clone());

        let cache = match (cache, loader.cache_key()) {
            (Some(store), Some(key)) => Some((store, key)),
            _ => None,
        };
        let slices_count = (size as usize).div_ceil(SLICE_SIZE);
        info!(
            "{} 📖 Reader 创建: {} bytes, {} 个分片, 缓存: {}",
            log_ctx(),
            size,
            slices_count,
            cache.is_some()
        );

        Self {
            loader,
            size,
            cache,
            sink,
            parts,
            config,
            inner: Mutex::new(ReaderInner {
                slices: (0..slices_count).map(|_| Slice::default()).collect(),
                used: VecDeque::new(),
                loading: BTreeSet::new(),
                header_parts: BTreeSet::new(),
                header_done: false,
                error: None,
                streaming_active: false,
                real_priority: 1,
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 远程加载器（有持久缓存键）
    pub fn is_remote_loader(&self) -> bool {
        self.loader.cache_key().is_some()
    }

    /// 用 [offset, offset + buffer.len()) 的字节填满 buffer
    ///
    /// 数据不全时请求第一个缺失块并返回 Waiting，块到达时唤醒 notify。
    pub fn fill(&self, offset: u64, buffer: &mut [u8], notify: &Notify) -> FillState {
        let len = buffer.len() as u64;
        if len == 0 {
            return FillState::Success;
        }
        let end = match offset.checked_add(len) {
            Some(end) if end <= self.size => end,
            _ => {
                warn!("{} ⚠️ 读取越界: offset={} len={} size={}", log_ctx(), offset, len, self.size);
                return FillState::Failed;
            }
        };

        let mut inner = self.inner.lock();
        loop {
            self.process_loaded_parts(&mut inner);
            if inner.error.is_some() {
                return FillState::Failed;
            }
            match self.locate(&mut inner, offset, end) {
                Located::Ready(chunks) => {
                    self.sink.set_waiting(None);
                    self.finish_success(&mut inner, &chunks);
                    drop(inner);
                    copy_chunks(&chunks, offset, buffer);
                    return FillState::Success;
                }
                Located::Missing(first) => {
                    if self.check_not_streamable(&mut inner) {
                        return FillState::Failed;
                    }
                    self.request(&mut inner, first);
                }
            }

            // 先登记等待者，再确认期间没有新块到达，避免丢失唤醒
            self.sink.set_waiting(Some(notify.clone()));
            if self.parts.is_empty() {
                return FillState::Waiting;
            }
        }
    }

    /// 文件头读取完毕（容器已打开）
    pub fn header_done(&self) {
        self.inner.lock().header_done = true;
    }

    pub fn header_size(&self) -> usize {
        let inner = self.inner.lock();
        (inner.header_parts.len() * PART_SIZE).min(self.size as usize)
    }

    /// 每个分片都曾完整加载过
    pub fn full_in_cache(&self) -> bool {
        self.inner.lock().slices.iter().all(|slice| slice.full_in_cache)
    }

    pub fn streaming_error(&self) -> Option<Error> {
        self.inner.lock().error
    }

    pub fn set_loader_priority(&self, priority: i32) {
        let mut inner = self.inner.lock();
        inner.real_priority = priority;
        if inner.streaming_active {
            self.loader.set_priority(priority);
        }
    }

    pub fn start_streaming(&self) {
        let mut inner = self.inner.lock();
        inner.streaming_active = true;
        self.loader.set_priority(inner.real_priority);
    }

    /// 会话结束：取消等待；彻底停止时还会取消所有未完成的请求
    pub fn stop_streaming(&self, still_active: bool) {
        self.sink.set_waiting(None);
        if still_active {
            return;
        }
        let mut inner = self.inner.lock();
        inner.streaming_active = false;
        self.loader.set_priority(0);
        for offset in std::mem::take(&mut inner.loading) {
            self.loader.cancel(offset);
        }
    }

    /// 唤醒阻塞在 fill() 上的等待者（用于中断）
    pub fn wake_waiting(&self) {
        self.sink.wake_waiting();
    }

    /// 把所有改动过的分片写回缓存
    pub fn finalize_cache(&self) {
        let Some((store, key)) = self.cache.as_ref() else {
            return;
        };
        let mut inner = self.inner.lock();
        for index in 0..inner.slices.len() {
            let max = self.slice_max_size(index);
            let slice = &mut inner.slices[index];
            if slice.changed_since_cache && !slice.parts.is_empty() {
                store.put(key.slice(index as u64 + 1), serialize_slice(&slice.parts, max));
                slice.changed_since_cache = false;
            }
        }
    }

    fn slice_max_size(&self, index: usize) -> usize {
        let start = (index * SLICE_SIZE) as u64;
        (self.size - start).min(SLICE_SIZE as u64) as usize
    }

    fn slice_parts_count(&self, index: usize) -> usize {
        self.slice_max_size(index).div_ceil(PART_SIZE)
    }

    /// 把加载器交付的块并入分片，返回是否处理了任何块
    fn process_loaded_parts(&self, inner: &mut ReaderInner) -> bool {
        let mut any = false;
        for part in self.parts.try_iter() {
            any = true;
            if inner.error.is_some() {
                continue;
            }
            if !part.valid(self.size) {
                error!(
                    "{} ❌ 数据块无效: offset={} len={}",
                    log_ctx(),
                    part.offset,
                    part.bytes.len()
                );
                inner.error = Some(Error::LoadFailed);
                continue;
            }
            if !inner.loading.remove(&part.offset) {
                debug!("{} 丢弃未请求的数据块 offset={}", log_ctx(), part.offset);
                continue;
            }
            let index = (part.offset / SLICE_SIZE as u64) as usize;
            let relative = part.offset % SLICE_SIZE as u64;
            let expected = self.slice_parts_count(index);
            let slice = &mut inner.slices[index];
            if !slice.parts.contains_key(&relative) {
                slice.parts.insert(relative, Arc::from(part.bytes.into_boxed_slice()));
                slice.changed_since_cache = true;
                if slice.parts.len() == expected {
                    slice.full_in_cache = true;
                }
            }
        }
        any
    }

    fn locate(&self, inner: &mut ReaderInner, offset: u64, end: u64) -> Located {
        let first_slice = (offset / SLICE_SIZE as u64) as usize;
        let last_slice = ((end - 1) / SLICE_SIZE as u64) as usize;
        for index in first_slice..=last_slice {
            self.touch_slice(inner, index);
        }

        let mut chunks = Vec::new();
        let mut part = offset - offset % PART_SIZE as u64;
        while part < end {
            let index = (part / SLICE_SIZE as u64) as usize;
            let relative = part % SLICE_SIZE as u64;
            match inner.slices[index].parts.get(&relative) {
                Some(bytes) => chunks.push((part, bytes.clone())),
                None => return Located::Missing(part),
            }
            part += PART_SIZE as u64;
        }
        Located::Ready(chunks)
    }

    /// 标记最近使用；有缓存时第一次访问先从缓存读入
    fn touch_slice(&self, inner: &mut ReaderInner, index: usize) {
        if let Some((store, key)) = self.cache.as_ref() {
            if !inner.slices[index].loaded_from_cache {
                inner.slices[index].loaded_from_cache = true;
                if let Some(data) = store.get(key.slice(index as u64 + 1)) {
                    self.restore_slice(inner, index, &data);
                }
            }
        }
        inner.used.retain(|&used| used != index);
        inner.used.push_back(index);
    }

    fn restore_slice(&self, inner: &mut ReaderInner, index: usize, data: &[u8]) {
        let max = self.slice_max_size(index);
        let Some(parts) = parse_slice(data, max) else {
            warn!("{} ⚠️ 缓存分片 {} 格式错误，忽略", log_ctx(), index);
            return;
        };
        let start = (index * SLICE_SIZE) as u64;
        let expected = self.slice_parts_count(index);
        let slice = &mut inner.slices[index];
        let mut restored = 0;
        for (relative, bytes) in parts {
            let part = LoadedPart { offset: start + relative, bytes };
            if !part.valid(self.size) {
                warn!("{} ⚠️ 缓存块无效 offset={}，忽略", log_ctx(), part.offset);
                continue;
            }
            inner.loading.remove(&part.offset);
            slice.parts.entry(relative).or_insert_with(|| Arc::from(part.bytes.into_boxed_slice()));
            restored += 1;
        }
        if slice.parts.len() == expected {
            slice.full_in_cache = true;
        }
        debug!("{} 从缓存恢复分片 {}: {} 块", log_ctx(), index, restored);
    }

    fn finish_success(&self, inner: &mut ReaderInner, chunks: &[(u64, Arc<[u8]>)]) {
        if !inner.header_done {
            inner.header_parts.extend(chunks.iter().map(|(offset, _)| *offset));
        }
        if self.cache.is_some() {
            while inner.used.len() > self.config.slices_in_memory {
                if let Some(index) = inner.used.pop_front() {
                    self.unload_slice(inner, index);
                }
            }
        }
    }

    /// 写回缓存并释放分片内存（full_in_cache 标记保留）
    fn unload_slice(&self, inner: &mut ReaderInner, index: usize) {
        let Some((store, key)) = self.cache.as_ref() else {
            return;
        };
        let max = self.slice_max_size(index);
        let slice = &mut inner.slices[index];
        if slice.changed_since_cache && !slice.parts.is_empty() {
            store.put(key.slice(index as u64 + 1), serialize_slice(&slice.parts, max));
        }
        let full = slice.full_in_cache;
        *slice = Slice { full_in_cache: full, ..Slice::default() };

        let start = (index * SLICE_SIZE) as u64;
        let cancelled: Vec<u64> = inner.loading.range(start..start + max as u64).copied().collect();
        for offset in cancelled {
            inner.loading.remove(&offset);
            self.loader.cancel(offset);
        }
        debug!("{} 卸载分片 {}", log_ctx(), index);
    }

    fn check_not_streamable(&self, inner: &mut ReaderInner) -> bool {
        if inner.header_done {
            return false;
        }
        let total_parts = self.size.div_ceil(PART_SIZE as u64);
        if total_parts <= MAX_ONLY_IN_HEADER_PARTS {
            return false;
        }
        if inner.header_parts.len() < self.config.max_parts_in_header {
            return false;
        }
        error!(
            "{} ❌ 文件头超过 {} 块，无法边下边播",
            log_ctx(),
            self.config.max_parts_in_header
        );
        inner.error = Some(Error::NotStreamable);
        true
    }

    fn request(&self, inner: &mut ReaderInner, first: u64) {
        if !inner.loading.contains(&first) && !inner.loading.is_empty() {
            // 需求位置变了（例如 seek），之前的请求让位
            self.loader.reset_priorities();
        }
        self.load_at(inner, first);

        if self.is_remote_loader() {
            let mut next = first + PART_SIZE as u64;
            for _ in 0..self.config.preload_parts_ahead {
                if next >= self.size {
                    break;
                }
                let index = (next / SLICE_SIZE as u64) as usize;
                let relative = next % SLICE_SIZE as u64;
                if !inner.slices[index].parts.contains_key(&relative) {
                    self.load_at(inner, next);
                }
                next += PART_SIZE as u64;
            }
        }
    }

    fn load_at(&self, inner: &mut ReaderInner, offset: u64) {
        if inner.loading.insert(offset) {
            self.loader.load(offset);
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.finalize_cache();
        self.loader.stop();
    }
}

fn copy_chunks(chunks: &[(u64, Arc<[u8]>)], offset: u64, buffer: &mut [u8]) {
    let end = offset + buffer.len() as u64;
    for (start, bytes) in chunks {
        let from = offset.max(*start);
        let till = end.min(start + bytes.len() as u64);
        if from >= till {
            continue;
        }
        let source = &bytes[(from - start) as usize..(till - start) as usize];
        let target = (from - offset) as usize;
        buffer[target..target + source.len()].copy_from_slice(source);
    }
}
