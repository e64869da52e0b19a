use anyhow::{Context, Result};
use avsync::core::{EngineConfig, EngineContext, EngineEvent, EofPolicy, SeekDirection, SeekPolicy};
use avsync::player::synthetic::{FRAME_HEIGHT, FRAME_WIDTH};
use avsync::player::{
    AudioCodec, GetBufferMethod, GlrMethod, MediaHandles, MemoryFrameSink, PacedOutput, StreamController,
    SyntheticAudioCodec, SyntheticDemuxer, SyntheticVideoCodec, VideoCodec,
};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MEDIA_DURATION_MS: u32 = 6_000;

/// 演示脚本中的一步，到达 `at` 时执行
struct Step {
    at: Duration,
    name: &'static str,
    run: fn(&mut StreamController) -> avsync::Result<()>,
}

fn script() -> Vec<Step> {
    vec![
        Step {
            at: Duration::from_millis(0),
            name: "播放",
            run: |s| s.play().map(|_| ()),
        },
        Step {
            at: Duration::from_millis(1_000),
            name: "跳转到 4000ms",
            run: |s| s.absolute_seek(4_000).map(|_| ()),
        },
        Step {
            at: Duration::from_millis(1_500),
            name: "后退 2000ms",
            run: |s| s.relative_seek(2_000, SeekDirection::Backward).map(|_| ()),
        },
        Step {
            at: Duration::from_millis(2_000),
            name: "音量 -2 档",
            run: |s| s.shift_db_volume(-2),
        },
        Step {
            at: Duration::from_millis(2_500),
            name: "暂停",
            run: |s| s.pause().map(|_| ()),
        },
        Step {
            at: Duration::from_millis(3_000),
            name: "播放",
            run: |s| s.play().map(|_| ()),
        },
        Step {
            at: Duration::from_millis(6_500),
            name: "停止",
            run: |s| s.stop().map(|_| ()),
        },
    ]
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 avsync 演示: 合成音视频，无界面");

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_json_file(&path).with_context(|| format!("加载配置 {}", path))?,
        None => EngineConfig::default(),
    };
    let engine = EngineContext::new(config).context("创建引擎")?;

    let media = MediaHandles {
        demuxer: Box::new(SyntheticDemuxer::new(MEDIA_DURATION_MS, true, true)),
        audio_codec: Some(Box::new(SyntheticAudioCodec::new(engine.config())) as Box<dyn AudioCodec>),
        video_codec: Some(Box::new(SyntheticVideoCodec::new(FRAME_WIDTH, FRAME_HEIGHT)) as Box<dyn VideoCodec>),
    };
    let sink = Arc::new(MemoryFrameSink::new(GetBufferMethod::StaticGet, GlrMethod::AsyncGlr));

    let mut stream = StreamController::open(engine.clone(), media)?;
    stream.set_streaming_object(sink.clone())?;
    stream.set_eof_policy(EofPolicy::Looping);
    stream.set_seek_policy(SeekPolicy::RestartOnSeek);
    stream.load()?;

    let audio = stream.audio_handle().context("流中没有音频")?;
    let mut output = PacedOutput::start(engine.config(), audio)?;

    let started = Instant::now();
    let mut steps = script().into_iter().peekable();
    let mut last_report = Instant::now();
    let end = Duration::from_millis(7_000);

    while started.elapsed() < end {
        while let Some(step) = steps.next_if(|step| started.elapsed() >= step.at) {
            info!("🎮 {}", step.name);
            if let Err(e) = (step.run)(&mut stream) {
                warn!("⚠️ {} 失败: {}", step.name, e);
            }
        }

        if let Some(event) = engine.wait_event(Duration::from_millis(10)) {
            if matches!(event, EngineEvent::EndOfStream { .. }) {
                info!("🔁 到达流结尾");
            }
            if let Err(e) = stream.handle_event(&event) {
                warn!("⚠️ 处理事件 {:?} 失败: {}", event, e);
            }
        }

        if last_report.elapsed() >= Duration::from_millis(500) {
            last_report = Instant::now();
            let clock = stream.reference_clock()?;
            info!(
                "⏱ 时钟 {}ms (mod {}, {}) 音量 {:.3}，已显示 {} 帧",
                clock.clock,
                clock.mod_index,
                if clock.paused { "暂停" } else { "播放中" },
                stream.volume(),
                sink.displayed().len()
            );
        }
    }

    output.stop();
    stream.close();
    info!("✅ 完成，共显示 {} 帧", sink.displayed().len());
    Ok(())
}
