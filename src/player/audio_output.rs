use crate::core::{EngineConfig, EngineError, Result};
use crate::player::audio_decoder::AudioHandle;
use crossbeam_channel::{bounded, Sender, RecvTimeoutError};
use log::{debug, info, warn};
use std::process;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 没有设备时按实时速度拉取音频
///
/// 每个定时周期向流要恰好一个周期的采样并丢弃，
/// 像声卡一样推动音频时钟。用于无界面运行和测试
pub struct PacedOutput {
    stop_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PacedOutput {
    pub fn start(config: &EngineConfig, audio: AudioHandle) -> Result<Self> {
        let tick = Duration::from_millis(config.timer_granularity_ms);
        let samples_per_tick =
            config.sample_rate as usize * config.channels as usize * config.timer_granularity_ms as usize / 1000;
        if samples_per_tick == 0 {
            return Err(EngineError::Configuration(
                "定时粒度太小，不足以匹配输出采样率".to_string(),
            ));
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread_handle = thread::Builder::new()
            .name("paced-output".to_string())
            .spawn(move || {
                info!("{} 🔈 定速输出启动: 每 {:?} 取 {} 个采样", log_ctx(), tick, samples_per_tick);
                let mut buffer = vec![0i16; samples_per_tick];
                let mut next = Instant::now() + tick;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    audio.fill_output(&mut buffer);
                    next += tick;
                    // 落后超过一个周期：重新对齐，不要突发补齐
                    let now = Instant::now();
                    if now > next + tick {
                        debug!("{} 定速输出延迟 {:?}", log_ctx(), now - next);
                        next = now + tick;
                    }
                }
                info!("{} 🔇 定速输出停止", log_ctx());
            })?;

        Ok(Self {
            stop_tx,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ 定速输出线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for PacedOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "cpal-output")]
pub use device::DeviceOutput;

#[cfg(feature = "cpal-output")]
mod device {
    use super::log_ctx;
    use crate::core::{EngineConfig, EngineError, Result};
    use crate::player::audio_decoder::AudioHandle;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
    use log::{debug, error, info};

    /// 通过 cpal 输出到声卡。设备回调直接从音频流拉取，由设备推动时钟
    ///
    /// `cpal::Stream` 不是 `Send`，只能留在创建它的线程上
    pub struct DeviceOutput {
        device: Device,
        config: StreamConfig,
        stream: Option<Stream>,
    }

    impl DeviceOutput {
        /// 以引擎输出格式打开默认设备。这里不做重采样，格式不支持即报错
        pub fn new(engine_config: &EngineConfig) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| EngineError::AudioOutput("没有输出设备".to_string()))?;
            debug!("{} 使用音频设备: {}", log_ctx(), device.name().unwrap_or_default());

            let config = StreamConfig {
                channels: engine_config.channels,
                sample_rate: cpal::SampleRate(engine_config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let mut supported = device
                .supported_output_configs()
                .map_err(|e| EngineError::AudioOutput(format!("无法查询输出配置: {}", e)))?;
            if !supported.any(|range| Self::is_config_compatible(&config, &range)) {
                return Err(EngineError::AudioOutput(format!(
                    "设备不支持 {} Hz、{} 声道",
                    engine_config.sample_rate, engine_config.channels
                )));
            }

            Ok(Self {
                device,
                config,
                stream: None,
            })
        }

        fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
            let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
                && config.sample_rate.0 <= supported.max_sample_rate().0;
            rate_in_range && config.channels == supported.channels()
        }

        pub fn start(&mut self, audio: AudioHandle) -> Result<()> {
            if self.stream.is_some() {
                return Ok(());
            }
            let mut scratch: Vec<i16> = Vec::new();
            let stream = self
                .device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0);
                        audio.fill_output(&mut scratch);
                        for (out, sample) in data.iter_mut().zip(&scratch) {
                            *out = *sample as f32 / i16::MAX as f32;
                        }
                    },
                    move |err| {
                        error!("{} ❌ 音频流错误: {}", log_ctx(), err);
                    },
                    None,
                )
                .map_err(|e| EngineError::AudioOutput(format!("无法创建输出流: {}", e)))?;
            stream
                .play()
                .map_err(|e| EngineError::AudioOutput(format!("无法启动输出流: {}", e)))?;
            self.stream = Some(stream);
            info!("{} 🔈 设备输出启动", log_ctx());
            Ok(())
        }

        pub fn stop(&mut self) {
            if self.stream.take().is_some() {
                info!("{} 🔇 设备输出停止", log_ctx());
            }
        }
    }

    impl Drop for DeviceOutput {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineContext, EofNotifier, StreamId};
    use crate::player::audio_decoder::AudioStream;
    use crate::player::codec::AudioCodec;
    use crate::player::packet_feeder::PacketFeeder;
    use crate::player::synthetic::{SyntheticAudioCodec, SyntheticDemuxer};

    #[test]
    fn test_paced_output_drives_clock() {
        let engine = EngineContext::new(EngineConfig {
            sample_rate: 8000,
            channels: 1,
            audio_block_samples: 256,
            ring_blocks: 8,
            timer_granularity_ms: 2,
            ..EngineConfig::default()
        })
        .unwrap();
        let feeder = PacketFeeder::start(Box::new(SyntheticDemuxer::new(10_000, true, false)), Some(0), None, 16)
            .unwrap();
        let codec: Box<dyn AudioCodec> = Box::new(SyntheticAudioCodec::new(engine.config()));
        let eof = EofNotifier::new(StreamId(1), engine.clone());
        let mut stream =
            AudioStream::start(&engine, feeder.audio_queue().unwrap(), codec, feeder.seek_handle(), 0, eof).unwrap();
        let audio = stream.handle();
        audio.play();

        let mut output = PacedOutput::start(engine.config(), audio.clone()).unwrap();
        thread::sleep(Duration::from_millis(200));
        output.stop();
        let clock = audio.reference_clock().clock;
        // 实时速度，给繁忙的机器留余量
        assert!(clock > 50, "clock {}", clock);
        assert!(clock <= 250, "clock {}", clock);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(audio.reference_clock().clock, clock);
        stream.stop();
    }

    #[test]
    fn test_paced_output_rejects_tiny_ticks() {
        let config = EngineConfig {
            sample_rate: 8000,
            channels: 1,
            timer_granularity_ms: 0,
            ..EngineConfig::default()
        };
        let engine = EngineContext::new(EngineConfig::default()).unwrap();
        let feeder =
            PacketFeeder::start(Box::new(SyntheticDemuxer::new(100, true, false)), Some(0), None, 4).unwrap();
        let codec: Box<dyn AudioCodec> = Box::new(SyntheticAudioCodec::new(engine.config()));
        let eof = EofNotifier::new(StreamId(1), engine.clone());
        let stream =
            AudioStream::start(&engine, feeder.audio_queue().unwrap(), codec, feeder.seek_handle(), 0, eof).unwrap();
        assert!(PacedOutput::start(&config, stream.handle()).is_err());
    }
}
