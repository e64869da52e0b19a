use crate::core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 引擎全局参数
///
/// 每个字段都有默认值，JSON 里只需写要覆盖的键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 解码器应输出的采样率
    pub sample_rate: u32,
    pub channels: u16,
    /// 每个解码块的交错采样数
    pub audio_block_samples: usize,
    /// 环形缓冲容量（以解码块计）
    pub ring_blocks: usize,
    /// 每个流队列的包数上限，满了读包线程会阻塞
    pub packet_queue_capacity: usize,
    /// 工作线程两次检查时钟之间的最长睡眠
    pub timer_granularity_ms: u64,
    pub volume_db_pitch: f64,
    /// 音量落在 [low, high] 内时不做缩放
    pub volume_skip_low: f64,
    pub volume_skip_high: f64,
    pub video_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            audio_block_samples: 4096,
            ring_blocks: 4,
            packet_queue_capacity: 6,
            timer_granularity_ms: 10,
            volume_db_pitch: 1.5,
            volume_skip_low: 0.9,
            volume_skip_high: 1.1,
            video_slots: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(EngineError::Configuration(format!("{} 不能为 0", what)));
        if self.sample_rate == 0 {
            return bad("sample_rate");
        }
        if self.channels == 0 {
            return bad("channels");
        }
        if self.audio_block_samples == 0 {
            return bad("audio_block_samples");
        }
        // 填充时要留一个块的余量，所以至少两个块
        if self.ring_blocks < 2 {
            return Err(EngineError::Configuration("ring_blocks 至少为 2".to_string()));
        }
        if self.packet_queue_capacity == 0 {
            return bad("packet_queue_capacity");
        }
        if self.timer_granularity_ms == 0 {
            return bad("timer_granularity_ms");
        }
        if self.video_slots == 0 {
            return bad("video_slots");
        }
        if self.volume_db_pitch <= 0.0 {
            return Err(EngineError::InvalidPitch(self.volume_db_pitch));
        }
        Ok(())
    }

    /// 环形缓冲总容量（交错采样数）
    pub fn ring_capacity(&self) -> usize {
        self.audio_block_samples * self.ring_blocks
    }

    /// 每毫秒播放的交错采样数
    pub fn samples_per_ms(&self) -> f64 {
        self.sample_rate as f64 * self.channels as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "sample_rate": 48000 }"#).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.volume_db_pitch, 1.5);
    }

    #[test]
    fn test_rejects_non_positive_pitch() {
        let err = EngineConfig::from_json_str(r#"{ "volume_db_pitch": 0.0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPitch(_)));
    }

    #[test]
    fn test_rejects_tiny_ring() {
        let err = EngineConfig::from_json_str(r#"{ "ring_blocks": 1 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(EngineError::ConfigParse(_))
        ));
    }
}
