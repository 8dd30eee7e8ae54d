use crate::player::loader::{CacheKey, PART_SIZE, PARTS_IN_SLICE};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// 持久缓存的读写约定（存储引擎本身不在这里实现）
pub trait CacheStore: Send + Sync {
    fn get(&self, key: CacheKey) -> Option<Vec<u8>>;
    fn put(&self, key: CacheKey, data: Vec<u8>);
}

/// 内存缓存
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: CacheKey) -> Option<Vec<u8>> {
        self.entries.lock().get(&key).cloned()
    }

    fn put(&self, key: CacheKey, data: Vec<u8>) {
        self.entries.lock().insert(key, data);
    }
}

/// 这个长度会被当作连续存储
fn looks_contiguous(len: usize, max_slice_size: usize) -> bool {
    len % PART_SIZE == 0 || len == max_slice_size
}

/// 序列化一个分片
///
/// 块从分片开头连续排列时直接存原始字节；否则存
/// `u32 数量 + (u32 偏移, u32 长度, 字节)*`，并补零直到不会被误认为连续存储。
/// `parts` 的键是分片内的相对偏移。
pub fn serialize_slice<B: AsRef<[u8]>>(parts: &BTreeMap<u64, B>, max_slice_size: usize) -> Vec<u8> {
    let mut expected = 0u64;
    let mut contiguous = true;
    for (&offset, bytes) in parts {
        if offset != expected {
            contiguous = false;
            break;
        }
        expected += bytes.as_ref().len() as u64;
    }

    if contiguous {
        let mut result = Vec::with_capacity(expected as usize);
        for bytes in parts.values() {
            result.extend_from_slice(bytes.as_ref());
        }
        return result;
    }

    let mut result = Vec::new();
    result.extend_from_slice(&(parts.len() as u32).to_le_bytes());
    for (&offset, bytes) in parts {
        let bytes = bytes.as_ref();
        result.extend_from_slice(&(offset as u32).to_le_bytes());
        result.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        result.extend_from_slice(bytes);
    }
    while looks_contiguous(result.len(), max_slice_size) {
        result.push(0);
    }
    result
}

/// 解析分片，数据不合法时返回 None
pub fn parse_slice(data: &[u8], max_slice_size: usize) -> Option<BTreeMap<u64, Vec<u8>>> {
    let mut result = BTreeMap::new();
    if looks_contiguous(data.len(), max_slice_size) {
        if data.len() > max_slice_size {
            return None;
        }
        for (index, chunk) in data.chunks(PART_SIZE).enumerate() {
            result.insert((index * PART_SIZE) as u64, chunk.to_vec());
        }
        return Some(result);
    }

    let read_u32 = |at: usize| -> Option<u32> {
        let bytes = data.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };

    let count = read_u32(0)? as usize;
    if count == 0 || count > PARTS_IN_SLICE {
        return None;
    }
    let mut at = 4;
    for _ in 0..count {
        let offset = read_u32(at)? as usize;
        let size = read_u32(at + 4)? as usize;
        at += 8;
        if offset % PART_SIZE != 0
            || offset >= max_slice_size
            || size == 0
            || size > max_slice_size - offset
        {
            return None;
        }
        let bytes = data.get(at..at + size)?;
        at += size;
        result.insert(offset as u64, bytes.to_vec());
    }
    Some(result)
}
