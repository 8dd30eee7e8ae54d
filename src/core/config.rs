use crate::core::error::{PlayerError, Result};
use crate::core::types::Time;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 流媒体参数配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// 缓冲不足时等待到至少有这么多数据才继续（毫秒）
    pub buffer_for_ms: Time,

    /// 远程加载器：提前读取多少毫秒后暂停读取
    pub load_in_advance_remote_ms: Time,

    /// 本地加载器：提前读取多少毫秒后暂停读取
    pub load_in_advance_local_ms: Time,

    /// 连续无效数据包的容忍数量，超过即报 InvalidData
    pub skip_invalid_data_packets: u32,

    /// 每路流排队的最大包数，达到后强制交给消费者
    pub max_queued_packets: usize,

    /// 远程加载器在第一个缺失块之后额外预取的块数
    pub preload_parts_ahead: usize,

    /// 有缓存时内存中最多保留的分片数
    pub slices_in_memory: usize,

    /// 文件头允许占用的最大块数，超过即判定为不可流式播放
    pub max_parts_in_header: usize,

    /// 流时长的合理上限（毫秒）
    pub duration_max_ms: Time,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_for_ms: 3000,
            load_in_advance_remote_ms: 32000,
            load_in_advance_local_ms: 5000,
            skip_invalid_data_packets: 10,
            max_queued_packets: 32,
            preload_parts_ahead: 8,
            slices_in_memory: 2,
            max_parts_in_header: 64,
            duration_max_ms: i32::MAX as Time,
        }
    }
}

impl StreamingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_for_ms <= 0 {
            return Err(PlayerError::Config("buffer_for_ms 必须大于 0".into()));
        }
        if self.load_in_advance_local_ms < self.buffer_for_ms
            || self.load_in_advance_remote_ms < self.buffer_for_ms
        {
            return Err(PlayerError::Config("load_in_advance 不能小于 buffer_for_ms".into()));
        }
        if self.max_queued_packets == 0 {
            return Err(PlayerError::Config("max_queued_packets 必须大于 0".into()));
        }
        if self.slices_in_memory == 0 {
            return Err(PlayerError::Config("slices_in_memory 必须大于 0".into()));
        }
        if self.max_parts_in_header == 0 {
            return Err(PlayerError::Config("max_parts_in_header 必须大于 0".into()));
        }
        if self.duration_max_ms <= 0 {
            return Err(PlayerError::Config("duration_max_ms 必须大于 0".into()));
        }
        Ok(())
    }

    /// 根据加载器类型选择提前读取量
    pub fn load_in_advance(&self, remote: bool) -> Time {
        if remote {
            self.load_in_advance_remote_ms
        } else {
            self.load_in_advance_local_ms
        }
    }
}
