//! 确定性的内存媒体：产生定长数据包的 demuxer、方波音频解码器、
//! 图案视频解码器，以及把像素留在内存并记录显示内容的帧输出

use crate::core::{EngineConfig, EngineError, MediaInfo, Result, SeekDirection};
use crate::player::codec::{AudioCodec, DecodedFrame, VideoCodec};
use crate::player::packet_feeder::{Demuxer, MediaPacket};
use crate::player::video_decoder::{FrameBuffer, FrameSink, GetBufferMethod, GlrMethod, SharedFrameBuffer};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

pub const AUDIO_PACKET_MS: u32 = 20;
pub const FRAME_MS: u32 = 40;
pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 36;

pub struct SyntheticDemuxer {
    info: MediaInfo,
    next_audio: u32,
    next_video: u32,
}

impl SyntheticDemuxer {
    /// 有音频时音频占用流索引 0，视频用下一个
    pub fn new(duration_ms: u32, audio: bool, video: bool) -> Self {
        let audio_stream = audio.then_some(0);
        let video_stream = video.then_some(if audio { 1 } else { 0 });
        let defaults = EngineConfig::default();
        Self {
            info: MediaInfo {
                duration: duration_ms,
                audio_stream,
                video_stream,
                width: if video { FRAME_WIDTH } else { 0 },
                height: if video { FRAME_HEIGHT } else { 0 },
                sample_rate: if audio { defaults.sample_rate } else { 0 },
                channels: if audio { defaults.channels } else { 0 },
            },
            next_audio: 0,
            next_video: 0,
        }
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn align(target_ms: u32, step: u32, direction: SeekDirection) -> u32 {
        match direction {
            SeekDirection::Backward => target_ms / step * step,
            SeekDirection::Forward => target_ms.div_ceil(step) * step,
        }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        let duration = self.info.duration;
        let audio_left = self.info.audio_stream.filter(|_| self.next_audio < duration);
        let video_left = self.info.video_stream.filter(|_| self.next_video < duration);

        let take_audio = match (audio_left, video_left) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(_), Some(_)) => self.next_audio <= self.next_video,
        };

        if take_audio {
            let pts = self.next_audio;
            let length = AUDIO_PACKET_MS.min(duration - pts);
            self.next_audio += length;
            Ok(Some(MediaPacket {
                stream_index: self.info.audio_stream.unwrap_or_default(),
                pts_ms: pts,
                data: length.to_le_bytes().to_vec(),
            }))
        } else {
            let pts = self.next_video;
            self.next_video += FRAME_MS;
            Ok(Some(MediaPacket {
                stream_index: self.info.video_stream.unwrap_or_default(),
                pts_ms: pts,
                data: pts.to_le_bytes().to_vec(),
            }))
        }
    }

    fn seek(&mut self, _stream_index: Option<usize>, target_ms: u32, direction: SeekDirection) -> Result<()> {
        let target = target_ms.min(self.info.duration);
        self.next_audio = Self::align(target, AUDIO_PACKET_MS, direction);
        self.next_video = Self::align(target, FRAME_MS, direction);
        debug!("合成 demuxer 位置: 音频 {}ms 视频 {}ms", self.next_audio, self.next_video);
        Ok(())
    }

    fn description(&self) -> String {
        format!("synthetic media ({}ms)", self.info.duration)
    }
}

fn read_u32(data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| EngineError::Decode(format!("数据包只有 {} 字节，太短", data.len())))?;
    Ok(u32::from_le_bytes(bytes))
}

/// 引擎输出格式的方波
pub struct SyntheticAudioCodec {
    samples_per_ms: f64,
    channels: usize,
}

impl SyntheticAudioCodec {
    pub const AMPLITUDE: i16 = 8000;
    const HALF_PERIOD: usize = 40;

    pub fn new(config: &EngineConfig) -> Self {
        Self {
            samples_per_ms: config.samples_per_ms(),
            channels: config.channels as usize,
        }
    }
}

impl AudioCodec for SyntheticAudioCodec {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<i16>> {
        let length_ms = read_u32(&packet.data)?;
        let samples = (length_ms as f64 * self.samples_per_ms).round() as usize;
        let samples = samples - samples % self.channels;
        Ok((0..samples)
            .map(|i| {
                if (i / Self::HALF_PERIOD) % 2 == 0 {
                    Self::AMPLITUDE
                } else {
                    -Self::AMPLITUDE
                }
            })
            .collect())
    }

    fn description(&self) -> String {
        "synthetic square wave".to_string()
    }
}

/// 前四个字节存放 pts 的 RGBA 画面
pub struct SyntheticVideoCodec {
    width: u32,
    height: u32,
}

impl SyntheticVideoCodec {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl VideoCodec for SyntheticVideoCodec {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>> {
        let pts = read_u32(&packet.data)?;
        let size = (self.width * self.height * 4).max(4) as usize;
        let mut data = vec![(pts / FRAME_MS % 256) as u8; size];
        data[..4].copy_from_slice(&pts.to_le_bytes());
        Ok(Some(DecodedFrame {
            pts_ms: pts,
            width: self.width,
            height: self.height,
            data,
        }))
    }

    fn description(&self) -> String {
        format!("synthetic pattern {}x{}", self.width, self.height)
    }
}

/// 在内存中保存槽缓冲，并记录每个显示帧的 pts
pub struct MemoryFrameSink {
    get_method: GetBufferMethod,
    glr: GlrMethod,
    slots: Mutex<Vec<SharedFrameBuffer>>,
    displayed: Mutex<Vec<u32>>,
}

impl MemoryFrameSink {
    pub fn new(get_method: GetBufferMethod, glr: GlrMethod) -> Self {
        Self {
            get_method,
            glr,
            slots: Mutex::new(Vec::new()),
            displayed: Mutex::new(Vec::new()),
        }
    }

    pub fn displayed(&self) -> Vec<u32> {
        self.displayed.lock().clone()
    }

    fn slot(&self, slot: usize) -> Result<SharedFrameBuffer> {
        self.slots
            .lock()
            .get(slot)
            .cloned()
            .ok_or_else(|| EngineError::Sink(format!("槽 {} 越界", slot)))
    }
}

impl FrameSink for MemoryFrameSink {
    fn get_buffer_method(&self) -> GetBufferMethod {
        self.get_method
    }

    fn glr_method(&self) -> GlrMethod {
        self.glr
    }

    fn init(&self, width: u32, height: u32, slots: usize) -> Result<()> {
        let buffer = || {
            Arc::new(Mutex::new(FrameBuffer {
                width,
                height,
                data: Vec::new(),
            }))
        };
        *self.slots.lock() = (0..slots).map(|_| buffer()).collect();
        Ok(())
    }

    fn get_buffer(&self, slot: usize) -> Result<SharedFrameBuffer> {
        match self.get_method {
            GetBufferMethod::StaticGet => self.slot(slot),
            GetBufferMethod::DynamicGet => {
                let mut slots = self.slots.lock();
                let entry = slots
                    .get_mut(slot)
                    .ok_or_else(|| EngineError::Sink(format!("槽 {} 越界", slot)))?;
                *entry = Arc::new(Mutex::new(FrameBuffer::default()));
                Ok(entry.clone())
            }
        }
    }

    fn refresh_frame(&self, slot: usize) -> Result<()> {
        let buffer = self.slot(slot)?;
        let pts = read_u32(&buffer.lock().data).map_err(|e| EngineError::Sink(e.to_string()))?;
        self.displayed.lock().push(pts);
        Ok(())
    }
}
