use serde::{Deserialize, Serialize};

/// 从属端无法确定流位置时上报的时钟值
pub const UNKNOWN_CLOCK: u32 = u32::MAX;

/// 同步双方交换的时钟快照
///
/// 主时钟每次不连续（Seek、循环回到开头）都会递增 `mod_index`，
/// 读取方据此判断时钟值是否属于它期望的那一段流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceClock {
    pub clock: u32,      // 毫秒
    pub paused: bool,
    pub mod_index: u32,
}

impl ReferenceClock {
    pub fn new(clock: u32, paused: bool, mod_index: u32) -> Self {
        Self { clock, paused, mod_index }
    }

    /// 哨兵读数：位置未知，不要据此校正
    pub fn unknown(mod_index: u32) -> Self {
        Self {
            clock: UNKNOWN_CLOCK,
            paused: true,
            mod_index,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.clock == UNKNOWN_CLOCK
    }
}

impl Default for ReferenceClock {
    fn default() -> Self {
        Self::new(0, true, 0)
    }
}

/// 状态切换请求的结果
///
/// `Useless` 不是错误，只表示命令无事可做（播放中再播放、暂停中再暂停），
/// 调用方据此应用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Useless,
}

impl Outcome {
    pub fn is_useless(self) -> bool {
        self == Outcome::Useless
    }
}

/// 暂停中的流被 Seek 时的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekPolicy {
    /// Seek 后保持暂停
    PreservePause,
    /// Seek 后开始播放
    RestartOnSeek,
}

/// 时钟到达流结尾时的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofPolicy {
    Blocking,
    Looping,
}

/// 流已在播放时 `play` 的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayPolicy {
    Neutral,
    /// 无效的 play 会把流倒回开头
    RestartOnRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Backward,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
    AudioVideo,
}

impl StreamType {
    pub fn from_parts(has_audio: bool, has_video: bool) -> Option<Self> {
        match (has_audio, has_video) {
            (true, true) => Some(StreamType::AudioVideo),
            (true, false) => Some(StreamType::Audio),
            (false, true) => Some(StreamType::Video),
            (false, false) => None,
        }
    }

    pub fn has_audio(self) -> bool {
        matches!(self, StreamType::Audio | StreamType::AudioVideo)
    }

    pub fn has_video(self) -> bool {
        matches!(self, StreamType::Video | StreamType::AudioVideo)
    }
}

/// 引擎上下文内的流标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// 已打开媒体的静态描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: u32,  // 毫秒
    pub audio_stream: Option<usize>,
    pub video_stream: Option<usize>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_from_parts() {
        assert_eq!(StreamType::from_parts(true, true), Some(StreamType::AudioVideo));
        assert_eq!(StreamType::from_parts(false, true), Some(StreamType::Video));
        assert_eq!(StreamType::from_parts(false, false), None);
        assert!(StreamType::Audio.has_audio());
        assert!(!StreamType::Audio.has_video());
    }

    #[test]
    fn test_unknown_reference_clock() {
        let clock = ReferenceClock::unknown(4);
        assert!(clock.is_unknown());
        assert_eq!(clock.mod_index, 4);
        assert!(!ReferenceClock::default().is_unknown());
    }
}
