use thiserror::Error as ThisError;

/// 流媒体会话失败类型（通过错误通道发布）
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("无法打开媒体（容器/流打开失败，或没有符合模式的流）")]
    OpenFailed,

    #[error("数据无效，无法继续解码")]
    InvalidData,

    #[error("文件格式不支持边下边播")]
    NotStreamable,

    /// Reader 层失败，DemuxWorker 会按是否已打开容器映射为 OpenFailed / InvalidData
    #[error("数据块加载失败")]
    LoadFailed,
}

/// 编解码能力返回的错误
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("无效数据")]
    InvalidData,

    #[error("需要更多输入")]
    Again,

    #[error("流结束")]
    EndOfFile,

    #[error("编解码错误: {0}")]
    Fatal(String),
}

/// 同步返回给调用方的错误（参数误用、配置、IO 等）
#[derive(ThisError, Debug)]
pub enum PlayerError {
    #[error("播放速度超出范围 [0.5, 2.0]: {0}")]
    InvalidSpeed(f64),

    #[error("音视频同时播放时不支持循环")]
    LoopWithBothTracks,

    #[error("当前没有活动的播放会话")]
    NotActive,

    #[error("音频输出错误: {0}")]
    Audio(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("流媒体错误: {0}")]
    Streaming(#[from] Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
