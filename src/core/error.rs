use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("含视频的流未设置 streaming object")]
    MissingStreamingObject,

    #[error("流尚未加载")]
    NotLoaded,

    #[error("流已经加载")]
    AlreadyLoaded,

    #[error("媒体中没有可播放的音频或视频流")]
    NoPlayableStream,

    #[error("不支持的操作: {0}")]
    Unsupported(&'static str),

    #[error("音量步长必须为正数，实际为 {0}")]
    InvalidPitch(f64),

    #[error("解码错误: {0}")]
    Decode(String),

    #[error("帧输出错误: {0}")]
    Sink(String),

    #[error("音频输出错误: {0}")]
    AudioOutput(String),

    #[error("通道已关闭: {0}")]
    Channel(String),

    #[error("配置解析错误: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
