//! 音视频播放的时钟同步与流控制
//!
//! 一个 [`StreamController`] 管理一条流：读包线程从容器读取数据包，
//! 音频填充线程写入带标记的环形缓冲并由输出设备取走，
//! 视频解码线程按 [`SyncObject`] 的参考时钟呈现帧。

pub mod core;
pub mod player;

pub use crate::core::{
    EngineConfig, EngineContext, EngineError, EngineEvent, EofPolicy, EofSignal, MediaInfo, Outcome, PlayPolicy,
    ReferenceClock, Result, SeekDirection, SeekPolicy, StreamId, StreamType,
};
pub use crate::player::{MediaHandles, StreamController, SyncObject, UserSync};
