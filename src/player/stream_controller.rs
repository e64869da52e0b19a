use crate::core::{
    EngineContext, EngineError, EngineEvent, EofNotifier, EofPolicy, EofSignal, MediaInfo, Outcome, PlayPolicy,
    ReferenceClock, Result, SeekDirection, SeekPolicy, StreamId, StreamType,
};
use crate::player::audio_decoder::{AudioHandle, AudioStream};
use crate::player::codec::{AudioCodec, VideoCodec};
use crate::player::packet_feeder::{Demuxer, PacketFeeder};
use crate::player::sync_object::{SyncObject, UserSync};
use crate::player::video_decoder::{FrameSink, VideoHandle, VideoStream, VideoStreamParams, VideoWaker};
use log::{debug, info, warn};
use std::process;
use std::sync::Arc;
use std::thread;

/// 超过这么多档后音量要么听不见，要么削波
pub const MAX_DB_STEPS: i32 = 64;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 打开的媒体带来的东西：容器读取器和可解码流的解码器
pub struct MediaHandles {
    pub demuxer: Box<dyn Demuxer>,
    pub audio_codec: Option<Box<dyn AudioCodec>>,
    pub video_codec: Option<Box<dyn VideoCodec>>,
}

struct LoadedStream {
    stream_type: StreamType,
    // drop 顺序即关闭顺序：视频、音频、读包线程、同步对象
    video: Option<VideoStream>,
    audio: Option<AudioStream>,
    feeder: PacketFeeder,
    sync: Option<Arc<SyncObject>>,
}

#[derive(Debug, Clone, Copy)]
struct LastSeek {
    mod_index: u32,
    target: u32,
}

/// 一条可播放的流：策略、音量、Seek 记录，以及加载后的工作线程
///
/// 命令都由单个控制线程发出，除短暂持锁外不会阻塞在工作线程上
pub struct StreamController {
    id: StreamId,
    engine: Arc<EngineContext>,
    info: MediaInfo,
    media: Option<MediaHandles>,
    loaded: Option<LoadedStream>,

    streaming_object: Option<Arc<dyn FrameSink>>,
    user_sync: Option<UserSync>,
    audio_enabled: bool,
    video_enabled: bool,

    eof_policy: EofPolicy,
    seek_policy: SeekPolicy,
    play_policy: PlayPolicy,
    eof: Arc<EofNotifier>,

    volume: f64,
    db_volume: i32,
    db_pitch: f64,

    last_seek: Option<LastSeek>,
}

impl StreamController {
    /// 打开一条流。工作线程在 `load` 时才启动，
    /// 中间可以设置策略、同步对象和 streaming object
    pub fn open(engine: Arc<EngineContext>, media: MediaHandles) -> Result<Self> {
        let info = media.demuxer.media_info().clone();
        if info.audio_stream.is_none() && info.video_stream.is_none() {
            return Err(EngineError::NoPlayableStream);
        }
        let id = engine.allocate_stream_id();
        info!(
            "{} 📂 流 {:?} 已打开: {} ({}ms, 音频 {:?}, 视频 {:?})",
            log_ctx(),
            id,
            media.demuxer.description(),
            info.duration,
            info.audio_stream,
            info.video_stream
        );
        let db_pitch = engine.config().volume_db_pitch;
        let eof = EofNotifier::new(id, engine.clone());
        Ok(Self {
            id,
            engine,
            info,
            media: Some(media),
            loaded: None,
            streaming_object: None,
            user_sync: None,
            audio_enabled: true,
            video_enabled: true,
            eof_policy: EofPolicy::Blocking,
            seek_policy: SeekPolicy::PreservePause,
            play_policy: PlayPolicy::Neutral,
            eof,
            volume: 1.0,
            db_volume: 0,
            db_pitch,
            last_seek: None,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn has_audio(&self) -> bool {
        self.audio_enabled
            && self.info.audio_stream.is_some()
            && self.media.as_ref().map_or(true, |m| m.audio_codec.is_some())
    }

    fn has_video(&self) -> bool {
        self.video_enabled
            && self.info.video_stream.is_some()
            && self.media.as_ref().map_or(true, |m| m.video_codec.is_some())
    }

    fn ensure_not_loaded(&self) -> Result<()> {
        if self.loaded.is_some() {
            return Err(EngineError::AlreadyLoaded);
        }
        Ok(())
    }

    fn loaded(&self) -> Result<&LoadedStream> {
        self.loaded.as_ref().ok_or(EngineError::NotLoaded)
    }

    // ========== 设置 ==========

    pub fn set_streaming_object(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.ensure_not_loaded()?;
        self.streaming_object = Some(sink);
        Ok(())
    }

    pub fn set_sync_object(&mut self, sync: UserSync) -> Result<()> {
        self.ensure_not_loaded()?;
        self.user_sync = Some(sync);
        Ok(())
    }

    pub fn disable_audio(&mut self) -> Result<()> {
        self.ensure_not_loaded()?;
        self.audio_enabled = false;
        Ok(())
    }

    pub fn disable_video(&mut self) -> Result<()> {
        self.ensure_not_loaded()?;
        self.video_enabled = false;
        Ok(())
    }

    pub fn set_eof_policy(&mut self, policy: EofPolicy) {
        self.eof_policy = policy;
        let looping = policy == EofPolicy::Looping;
        if let Some(loaded) = &self.loaded {
            if let Some(sync) = &loaded.sync {
                sync.set_looping(looping);
            }
            if let Some(audio) = &loaded.audio {
                audio.handle().set_looping(looping);
            }
        }
    }

    pub fn eof_policy(&self) -> EofPolicy {
        self.eof_policy
    }

    pub fn set_seek_policy(&mut self, policy: SeekPolicy) {
        self.seek_policy = policy;
    }

    pub fn seek_policy(&self) -> SeekPolicy {
        self.seek_policy
    }

    pub fn set_play_policy(&mut self, policy: PlayPolicy) {
        self.play_policy = policy;
    }

    pub fn play_policy(&self) -> PlayPolicy {
        self.play_policy
    }

    pub fn set_eof_signal(&mut self, signal: EofSignal) {
        self.eof.set_signal(signal);
    }

    /// 校验配置并启动工作线程
    pub fn load(&mut self) -> Result<()> {
        self.ensure_not_loaded()?;
        let stream_type =
            StreamType::from_parts(self.has_audio(), self.has_video()).ok_or(EngineError::NoPlayableStream)?;
        if stream_type.has_video() && self.streaming_object.is_none() {
            return Err(EngineError::MissingStreamingObject);
        }
        SyncObject::check_user_sync(stream_type, self.user_sync.as_ref())?;

        let media = self
            .media
            .take()
            .ok_or_else(|| EngineError::Configuration("流已关闭".to_string()))?;
        let MediaHandles {
            demuxer,
            audio_codec,
            video_codec,
        } = media;
        let config = self.engine.config();
        let audio_index = self.info.audio_stream.filter(|_| stream_type.has_audio());
        let video_index = self.info.video_stream.filter(|_| stream_type.has_video());
        let looping = self.eof_policy == EofPolicy::Looping;

        info!("{} 🚀 加载流 {:?}，类型 {:?}", log_ctx(), self.id, stream_type);
        let feeder = PacketFeeder::start(demuxer, audio_index, video_index, config.packet_queue_capacity)?;

        let audio = match (audio_index, audio_codec, feeder.audio_queue()) {
            (Some(index), Some(codec), Some(queue)) => {
                let stream = AudioStream::start(
                    &self.engine,
                    queue,
                    codec,
                    feeder.seek_handle(),
                    index,
                    self.eof.clone(),
                )?;
                let handle = stream.handle();
                handle.set_volume(self.volume);
                handle.set_looping(looping);
                Some(stream)
            }
            _ => None,
        };
        let audio_handle = audio.as_ref().map(AudioStream::handle);

        let waker = stream_type.has_video().then(VideoWaker::pair);
        let sync = SyncObject::cross_wire(
            stream_type,
            self.user_sync.clone(),
            audio_handle.as_ref(),
            waker.as_ref().map(|(waker, _)| waker),
        )?
        .map(Arc::new);
        if let Some(sync) = &sync {
            sync.set_looping(looping);
            info!("{} 🔗 同步对象: {}", log_ctx(), sync.description());
        }
        if let Some(handle) = &audio_handle {
            handle.set_slave(sync.as_ref().map(|s| s.slave()));
        }

        let video = match (video_index, video_codec, feeder.video_queue(), waker) {
            (Some(_), Some(codec), Some(queue), Some(waker)) => {
                let sync = sync
                    .clone()
                    .ok_or_else(|| EngineError::Configuration("视频流缺少同步对象".to_string()))?;
                let sink = self.streaming_object.clone().ok_or(EngineError::MissingStreamingObject)?;
                let params = VideoStreamParams {
                    queue,
                    codec,
                    sink,
                    sync,
                    waker,
                    audio: audio_handle.clone(),
                    // 有音频时由音频流上报结尾
                    eof: audio_handle.is_none().then(|| self.eof.clone()),
                    width: self.info.width,
                    height: self.info.height,
                };
                Some(VideoStream::start(self.id, self.engine.clone(), params)?)
            }
            _ => None,
        };

        self.loaded = Some(LoadedStream {
            stream_type,
            video,
            audio,
            feeder,
            sync,
        });
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    // ========== 播放控制 ==========

    /// `PlayPolicy::RestartOnRepeat` 下无效的 play 会把流倒回开头
    pub fn play(&mut self) -> Result<Outcome> {
        let loaded = self.loaded()?;
        let outcome = match (&loaded.sync, &loaded.audio) {
            (Some(sync), _) => sync.play(),
            (None, Some(audio)) => audio.handle().play(),
            (None, None) => return Err(EngineError::NotLoaded),
        };
        info!("{} ▶️ play: {:?}", log_ctx(), outcome);
        if outcome.is_useless() && self.play_policy == PlayPolicy::RestartOnRepeat {
            match self.rewind() {
                Err(EngineError::Unsupported(what)) => {
                    debug!("{} 主端不支持 {}，跳过重复播放的倒回", log_ctx(), what)
                }
                other => {
                    other?;
                }
            }
        }
        Ok(outcome)
    }

    pub fn pause(&mut self) -> Result<Outcome> {
        let loaded = self.loaded()?;
        let outcome = match (&loaded.sync, &loaded.audio) {
            (Some(sync), _) => sync.pause().ok_or(EngineError::Unsupported("pause"))?,
            (None, Some(audio)) => audio.handle().pause(),
            (None, None) => return Err(EngineError::NotLoaded),
        };
        info!("{} ⏸ pause: {:?}", log_ctx(), outcome);
        Ok(outcome)
    }

    /// 暂停并回到开头，保持暂停
    pub fn stop(&mut self) -> Result<Outcome> {
        if let Err(e) = self.pause() {
            // 主端不支持暂停也照样倒回
            debug!("{} 停止时未能暂停: {}", log_ctx(), e);
        }
        info!("{} ⏹ 停止", log_ctx());
        self.seek_pipeline(0, 0, SeekDirection::Backward, SeekPolicy::PreservePause)
    }

    pub fn rewind(&mut self) -> Result<Outcome> {
        info!("{} ⏮ 倒回", log_ctx());
        self.seek_pipeline(0, 0, SeekDirection::Backward, self.seek_policy)
    }

    /// 从当前位置移动 `shift` 毫秒。
    /// 上一次 Seek 尚未反映到时钟时，以它的目标为基准
    pub fn relative_seek(&mut self, shift: u32, direction: SeekDirection) -> Result<Outcome> {
        self.ensure_seekable()?;
        let (base, _) = self.seek_base()?;
        let requested = match direction {
            SeekDirection::Backward => base.saturating_sub(shift),
            SeekDirection::Forward => base.saturating_add(shift),
        };
        let target = self.clamp_to_duration(requested);
        info!("{} ⏩ 相对 Seek {:?} {}ms -> {}ms", log_ctx(), direction, shift, target);
        self.seek_pipeline(target, requested, direction, self.seek_policy)
    }

    pub fn absolute_seek(&mut self, requested: u32) -> Result<Outcome> {
        self.ensure_seekable()?;
        let (_, current) = self.seek_base()?;
        let target = self.clamp_to_duration(requested);
        let direction = if target <= current {
            SeekDirection::Backward
        } else {
            SeekDirection::Forward
        };
        info!("{} ⏩ Seek 到 {}ms", log_ctx(), target);
        self.seek_pipeline(target, requested, direction, self.seek_policy)
    }

    fn ensure_seekable(&self) -> Result<()> {
        let loaded = self.loaded()?;
        if let Some(sync) = &loaded.sync {
            if !sync.can_seek() {
                return Err(EngineError::Unsupported("seek"));
            }
        }
        Ok(())
    }

    /// 返回 (移动的起点, 当前时钟)。
    /// 上一次 Seek 尚未反映到时钟时，用它的目标代替时钟
    fn seek_base(&self) -> Result<(u32, u32)> {
        let clock = self.reference_clock()?;
        let current = if clock.is_unknown() { 0 } else { clock.clock };
        let base = match self.last_seek {
            Some(last) if last.mod_index == clock.mod_index => last.target,
            _ => current,
        };
        Ok((base, current))
    }

    /// 超过结尾的目标回到开头并上报结尾
    fn clamp_to_duration(&self, target: u32) -> u32 {
        if target >= self.info.duration {
            info!("{} 📄 Seek 目标 {}ms 超过结尾 ({}ms)", log_ctx(), target, self.info.duration);
            self.eof.signal_wrapped();
            return 0;
        }
        target
    }

    /// 所有 Seek 都经过这里，包括停止和倒回。`requested` 是钳制前的目标；
    /// 时钟出现新的 mod_index 之前，后续 Seek 都以它为基准
    fn seek_pipeline(
        &mut self,
        target: u32,
        requested: u32,
        direction: SeekDirection,
        policy: SeekPolicy,
    ) -> Result<Outcome> {
        self.ensure_seekable()?;
        let clock = self.reference_clock()?;
        let loaded = self.loaded()?;
        let audio = loaded.audio.as_ref().map(AudioStream::handle);
        let video = loaded.video.as_ref().map(VideoStream::handle);

        // 在读包线程发出标记之前，解码器就开始丢弃数据
        let generation = loaded.feeder.seek_handle().seek_with(None, target, direction, |generation| {
            if let Some(audio) = &audio {
                audio.start_seeking(policy, generation);
            }
            if let Some(video) = &video {
                video.start_seeking(generation);
            }
        })?;

        let outcome = match (&loaded.sync, &audio) {
            (Some(sync), _) => sync.seek(target, policy).ok_or(EngineError::Unsupported("seek"))?,
            (None, Some(audio)) => audio.seek(),
            (None, None) => return Err(EngineError::NotLoaded),
        };
        if let Some(video) = &video {
            video.seek(generation);
        }
        self.last_seek = Some(LastSeek {
            mod_index: clock.mod_index,
            target: requested,
        });
        Ok(outcome)
    }

    /// 对没有音频的流应用结尾策略。有音频的流在音频线程内处理结尾
    pub fn handle_end_of_stream(&mut self) -> Result<Outcome> {
        let loaded = self.loaded()?;
        if loaded.audio.is_some() {
            return Ok(Outcome::Useless);
        }
        let looping = match &loaded.sync {
            Some(sync) => sync.is_looping(),
            None => self.eof_policy == EofPolicy::Looping,
        };
        if looping {
            self.rewind()
        } else {
            match self.pause() {
                Err(EngineError::Unsupported(_)) => Ok(Outcome::Useless),
                other => other,
            }
        }
    }

    /// 分发发给本流的引擎事件
    pub fn handle_event(&mut self, event: &EngineEvent) -> Result<()> {
        match *event {
            EngineEvent::Refresh { stream, slot } if stream == self.id => self.refresh_video_frame(slot),
            EngineEvent::EndOfStream { stream, wrapped } if stream == self.id && !wrapped => {
                self.handle_end_of_stream().map(|_| ())
            }
            _ => Ok(()),
        }
    }

    pub fn refresh_video_frame(&self, slot: usize) -> Result<()> {
        let loaded = self.loaded()?;
        match &loaded.video {
            Some(video) => video.handle().refresh_video_frame(slot),
            None => Err(EngineError::Unsupported("refresh")),
        }
    }

    // ========== 查询 ==========

    pub fn reference_clock(&self) -> Result<ReferenceClock> {
        let loaded = self.loaded()?;
        match (&loaded.sync, &loaded.audio) {
            (Some(sync), _) => Ok(sync.get_ref_clock()),
            (None, Some(audio)) => Ok(audio.handle().reference_clock()),
            (None, None) => Err(EngineError::NotLoaded),
        }
    }

    pub fn clock(&self) -> Result<u32> {
        Ok(self.reference_clock()?.clock)
    }

    pub fn duration(&self) -> u32 {
        self.info.duration
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        match &self.loaded {
            Some(loaded) => Some(loaded.stream_type),
            None => StreamType::from_parts(self.has_audio(), self.has_video()),
        }
    }

    pub fn width(&self) -> u32 {
        if self.has_video() {
            self.info.width
        } else {
            0
        }
    }

    pub fn height(&self) -> u32 {
        if self.has_video() {
            self.info.height
        } else {
            0
        }
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    /// 供音频输出设备拉取数据的一端
    pub fn audio_handle(&self) -> Option<AudioHandle> {
        self.loaded.as_ref()?.audio.as_ref().map(AudioStream::handle)
    }

    pub fn video_handle(&self) -> Option<VideoHandle> {
        self.loaded.as_ref()?.video.as_ref().map(VideoStream::handle)
    }

    // ========== 音量 ==========

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.max(0.0);
        if let Some(audio) = self.audio_handle() {
            audio.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// 音量 = pitch ^ steps，steps 钳制在 ±`MAX_DB_STEPS` 内
    pub fn set_db_volume(&mut self, steps: i32) -> Result<()> {
        if self.db_pitch <= 0.0 {
            return Err(EngineError::InvalidPitch(self.db_pitch));
        }
        let steps = steps.clamp(-MAX_DB_STEPS, MAX_DB_STEPS);
        self.db_volume = steps;
        let mut volume = 1.0;
        if steps >= 0 {
            for _ in 0..steps {
                volume *= self.db_pitch;
            }
        } else {
            for _ in steps..0 {
                volume /= self.db_pitch;
            }
        }
        debug!("{} 🔊 dB 音量 {} -> {:.4}", log_ctx(), steps, volume);
        self.set_volume(volume);
        Ok(())
    }

    pub fn db_volume(&self) -> i32 {
        self.db_volume
    }

    pub fn shift_db_volume(&mut self, shift: i32) -> Result<()> {
        self.set_db_volume(self.db_volume.saturating_add(shift))
    }

    /// 修改每档倍率并重新应用当前档位
    pub fn set_db_volume_pitch(&mut self, pitch: f64) -> Result<()> {
        if pitch <= 0.0 {
            return Err(EngineError::InvalidPitch(pitch));
        }
        self.db_pitch = pitch;
        self.set_db_volume(self.db_volume)
    }

    pub fn db_volume_pitch(&self) -> f64 {
        self.db_pitch
    }

    // ========== 关闭 ==========

    /// 按生产者最后的顺序停止工作线程：视频、音频、读包线程
    pub fn close(&mut self) {
        self.media = None;
        let Some(mut loaded) = self.loaded.take() else {
            return;
        };
        info!("{} 🛑 关闭流 {:?}", log_ctx(), self.id);
        if let Some(mut video) = loaded.video.take() {
            video.stop();
        }
        if let Some(mut audio) = loaded.audio.take() {
            audio.stop();
        }
        loaded.feeder.stop();
        if let Some(sync) = loaded.sync.take() {
            if Arc::strong_count(&sync) > 1 {
                warn!("{} ⚠️ 关闭后同步对象仍被共享", log_ctx());
            }
        }
        info!("{} ✅ 流 {:?} 已关闭", log_ctx(), self.id);
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineConfig, ReferenceClock};
    use crate::player::sync_object::{SyncMaster, SyncSlave};
    use crate::player::synthetic::{
        MemoryFrameSink, SyntheticAudioCodec, SyntheticDemuxer, SyntheticVideoCodec, FRAME_HEIGHT, FRAME_WIDTH,
    };
    use crate::player::video_decoder::{GetBufferMethod, GlrMethod};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn engine() -> Arc<EngineContext> {
        EngineContext::new(EngineConfig {
            sample_rate: 8000,
            channels: 1,
            audio_block_samples: 256,
            ring_blocks: 8,
            timer_granularity_ms: 2,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    fn media(engine: &EngineContext, duration_ms: u32, audio: bool, video: bool) -> MediaHandles {
        MediaHandles {
            demuxer: Box::new(SyntheticDemuxer::new(duration_ms, audio, video)),
            audio_codec: audio.then(|| Box::new(SyntheticAudioCodec::new(engine.config())) as Box<dyn AudioCodec>),
            video_codec: video
                .then(|| Box::new(SyntheticVideoCodec::new(FRAME_WIDTH, FRAME_HEIGHT)) as Box<dyn VideoCodec>),
        }
    }

    fn sink() -> Arc<MemoryFrameSink> {
        Arc::new(MemoryFrameSink::new(GetBufferMethod::StaticGet, GlrMethod::SyncGlr))
    }

    fn loaded_audio(duration_ms: u32) -> (Arc<EngineContext>, StreamController) {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, duration_ms, true, false)).unwrap();
        stream.load().unwrap();
        (engine, stream)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_audio(stream: &StreamController, samples: usize) {
        let audio = stream.audio_handle().unwrap();
        let mut out = vec![0i16; samples];
        wait_until(|| audio.buffered() >= samples);
        audio.fill_output(&mut out);
    }

    /// 只在测试要求时才移动时钟的主端
    struct ManualMaster {
        clock: AtomicU32,
        mod_index: AtomicU32,
        seeks: Mutex<Vec<u32>>,
    }

    impl ManualMaster {
        fn new(clock: u32) -> Self {
            Self {
                clock: AtomicU32::new(clock),
                mod_index: AtomicU32::new(0),
                seeks: Mutex::new(Vec::new()),
            }
        }

        /// 待处理的 Seek 落地
        fn settle(&self, clock: u32) {
            self.clock.store(clock, Ordering::SeqCst);
            self.mod_index.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SyncMaster for ManualMaster {
        fn get_ref_clock(&self) -> ReferenceClock {
            ReferenceClock::new(
                self.clock.load(Ordering::SeqCst),
                true,
                self.mod_index.load(Ordering::SeqCst),
            )
        }

        fn play(&self) -> Outcome {
            Outcome::Done
        }

        fn seek(&self, target_ms: u32, _policy: SeekPolicy) -> Option<Outcome> {
            self.seeks.lock().push(target_ms);
            Some(Outcome::Done)
        }

        fn can_seek(&self) -> bool {
            true
        }
    }

    fn video_with_master(duration_ms: u32, master: Arc<dyn SyncMaster>) -> (Arc<EngineContext>, StreamController) {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, duration_ms, false, true)).unwrap();
        stream.set_streaming_object(sink()).unwrap();
        stream.set_sync_object(UserSync::with_master(master)).unwrap();
        stream.load().unwrap();
        (engine, stream)
    }

    #[test]
    fn test_commands_before_load() {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, 1000, true, false)).unwrap();
        assert!(matches!(stream.play(), Err(EngineError::NotLoaded)));
        assert!(matches!(stream.clock(), Err(EngineError::NotLoaded)));
        assert_eq!(stream.stream_type(), Some(StreamType::Audio));
        stream.load().unwrap();
        assert!(matches!(stream.load(), Err(EngineError::AlreadyLoaded)));
        assert!(matches!(stream.disable_audio(), Err(EngineError::AlreadyLoaded)));
    }

    #[test]
    fn test_load_configuration_errors() {
        let engine = engine();

        let mut video = StreamController::open(engine.clone(), media(&engine, 1000, false, true)).unwrap();
        assert!(matches!(video.load(), Err(EngineError::MissingStreamingObject)));

        let mut av = StreamController::open(engine.clone(), media(&engine, 1000, true, true)).unwrap();
        av.set_streaming_object(sink()).unwrap();
        av.set_sync_object(UserSync::with_master(Arc::new(ManualMaster::new(0)))).unwrap();
        assert!(matches!(av.load(), Err(EngineError::Configuration(_))));

        let mut audio = StreamController::open(engine.clone(), media(&engine, 1000, true, false)).unwrap();
        audio.set_sync_object(UserSync::with_master(Arc::new(ManualMaster::new(0)))).unwrap();
        assert!(matches!(audio.load(), Err(EngineError::Configuration(_))));

        let mut none = StreamController::open(engine.clone(), media(&engine, 1000, true, true)).unwrap();
        none.disable_audio().unwrap();
        none.disable_video().unwrap();
        assert!(matches!(none.load(), Err(EngineError::NoPlayableStream)));
    }

    #[test]
    fn test_disable_video_turns_av_into_audio() {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, 1000, true, true)).unwrap();
        assert_eq!(stream.stream_type(), Some(StreamType::AudioVideo));
        assert_eq!(stream.width(), FRAME_WIDTH);
        stream.disable_video().unwrap();
        stream.load().unwrap();
        assert_eq!(stream.stream_type(), Some(StreamType::Audio));
        assert_eq!(stream.width(), 0);
        assert_eq!(stream.height(), 0);
    }

    #[test]
    fn test_seek_past_end_goes_to_start_and_signals() {
        let engine = engine();
        let master = Arc::new(ManualMaster::new(5000));
        let mut stream = StreamController::open(engine.clone(), media(&engine, 120_000, false, true)).unwrap();
        stream.set_streaming_object(sink()).unwrap();
        stream.set_sync_object(UserSync::with_master(master.clone())).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        stream.set_eof_signal(EofSignal::Callback(Arc::new(move |_: StreamId| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        stream.load().unwrap();

        stream.absolute_seek(130_000).unwrap();
        assert_eq!(*master.seeks.lock(), vec![0]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _ = engine;
    }

    #[test]
    fn test_relative_backward_seek_clamps_at_zero() {
        let master = Arc::new(ManualMaster::new(5000));
        let (_engine, mut stream) = video_with_master(60_000, master.clone());
        stream.relative_seek(10_000, SeekDirection::Backward).unwrap();
        assert_eq!(*master.seeks.lock(), vec![0]);
    }

    #[test]
    fn test_pending_seeks_chain_off_previous_target() {
        let master = Arc::new(ManualMaster::new(10_000));
        let (_engine, mut stream) = video_with_master(60_000, master.clone());

        stream.relative_seek(5000, SeekDirection::Forward).unwrap();
        // 主端还没动：从 15000 而不是 10000 起算
        stream.relative_seek(5000, SeekDirection::Forward).unwrap();
        assert_eq!(*master.seeks.lock(), vec![15_000, 20_000]);

        // 时钟动了，重新以它为基准
        master.settle(20_000);
        stream.relative_seek(5000, SeekDirection::Forward).unwrap();
        assert_eq!(master.seeks.lock()[2], 25_000);

        // 这次 Seek 又处于待处理状态
        stream.relative_seek(1000, SeekDirection::Backward).unwrap();
        assert_eq!(master.seeks.lock()[3], 24_000);
    }

    #[test]
    fn test_stop_and_rewind_replace_pending_target() {
        let master = Arc::new(ManualMaster::new(10_000));
        let (_engine, mut stream) = video_with_master(60_000, master.clone());

        stream.relative_seek(5000, SeekDirection::Forward).unwrap();
        stream.stop().unwrap();
        stream.relative_seek(1000, SeekDirection::Forward).unwrap();
        assert_eq!(*master.seeks.lock(), vec![15_000, 0, 1000]);

        stream.rewind().unwrap();
        stream.relative_seek(2000, SeekDirection::Forward).unwrap();
        assert_eq!(master.seeks.lock()[3..].to_vec(), vec![0, 2000]);
    }

    #[test]
    fn test_seek_past_end_keeps_video_stream_playing() {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, 2000, false, true)).unwrap();
        stream.set_streaming_object(sink()).unwrap();
        stream.load().unwrap();
        stream.play().unwrap();
        stream.absolute_seek(5000).unwrap();

        let mut wrapped = 0;
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            if let Some(event) = engine.wait_event(Duration::from_millis(5)) {
                if matches!(event, EngineEvent::EndOfStream { wrapped: true, .. }) {
                    wrapped += 1;
                }
                stream.handle_event(&event).unwrap();
            }
        }
        assert_eq!(wrapped, 1);
        let clock = stream.reference_clock().unwrap();
        assert!(!clock.paused);
        assert!(clock.clock < 2000);
    }

    #[test]
    fn test_user_master_without_pause() {
        struct PlayOnly;
        impl SyncMaster for PlayOnly {
            fn get_ref_clock(&self) -> ReferenceClock {
                ReferenceClock::new(0, false, 0)
            }
            fn play(&self) -> Outcome {
                Outcome::Useless
            }
        }
        let (_engine, mut stream) = video_with_master(1000, Arc::new(PlayOnly));
        assert!(matches!(stream.pause(), Err(EngineError::Unsupported(_))));
        assert!(matches!(stream.absolute_seek(10), Err(EngineError::Unsupported(_))));
        // 不支持 Seek 时无效的 play 无法倒回
        stream.set_play_policy(PlayPolicy::RestartOnRepeat);
        assert_eq!(stream.play().unwrap(), Outcome::Useless);
    }

    #[test]
    fn test_pause_twice_then_play_rewinds_at_end() {
        let (engine, mut stream) = loaded_audio(100);
        stream.set_play_policy(PlayPolicy::RestartOnRepeat);
        assert_eq!(stream.play().unwrap(), Outcome::Done);
        let audio = stream.audio_handle().unwrap();
        let mut out = vec![0i16; 400];
        wait_until(|| {
            audio.fill_output(&mut out);
            audio.at_end()
        });
        assert!(matches!(engine.poll_event(), Some(EngineEvent::EndOfStream { .. })));

        assert_eq!(stream.pause().unwrap(), Outcome::Useless);
        assert_eq!(stream.pause().unwrap(), Outcome::Useless);
        assert_eq!(stream.play().unwrap(), Outcome::Useless);
        // 倒回后流回到开头，仍然暂停
        assert!(!audio.at_end());
        assert!(!audio.is_playing());
        assert_eq!(stream.play().unwrap(), Outcome::Done);
        drain_audio(&stream, 80);
        assert_eq!(stream.clock().unwrap(), 10);
    }

    #[test]
    fn test_stop_keeps_pause_and_rewinds() {
        let (_engine, mut stream) = loaded_audio(5000);
        stream.set_seek_policy(SeekPolicy::RestartOnSeek);
        stream.play().unwrap();
        drain_audio(&stream, 800);
        assert_eq!(stream.clock().unwrap(), 100);
        stream.stop().unwrap();
        let audio = stream.audio_handle().unwrap();
        assert!(!audio.is_playing());
        wait_until(|| audio.buffered() > 0);
        let clock = stream.reference_clock().unwrap();
        assert_eq!(clock.clock, 0);
        assert!(clock.paused);
    }

    #[test]
    fn test_mod_index_never_decreases() {
        let (_engine, mut stream) = loaded_audio(10_000);
        stream.play().unwrap();
        let mut last = stream.reference_clock().unwrap().mod_index;
        for target in [3000, 1000, 6000] {
            stream.absolute_seek(target).unwrap();
            drain_audio(&stream, 80);
            let clock = stream.reference_clock().unwrap();
            assert!(clock.mod_index > last);
            assert_eq!(clock.clock, target + 10);
            last = clock.mod_index;
        }
    }

    #[test]
    fn test_db_volume() {
        let (_engine, mut stream) = loaded_audio(1000);
        stream.set_db_volume(2).unwrap();
        assert!((stream.volume() - 2.25).abs() < 1e-9);
        stream.shift_db_volume(-3).unwrap();
        assert_eq!(stream.db_volume(), -1);
        assert!((stream.volume() - 1.0 / 1.5).abs() < 1e-9);
        stream.set_db_volume_pitch(2.0).unwrap();
        assert!((stream.volume() - 0.5).abs() < 1e-9);
        assert!((stream.audio_handle().unwrap().volume() - 0.5).abs() < 1e-9);
        assert!(matches!(stream.set_db_volume_pitch(0.0), Err(EngineError::InvalidPitch(_))));
        assert_eq!(stream.db_volume_pitch(), 2.0);
    }

    #[test]
    fn test_db_volume_steps_are_bounded() {
        let (_engine, mut stream) = loaded_audio(1000);
        stream.set_db_volume(i32::MAX).unwrap();
        assert_eq!(stream.db_volume(), MAX_DB_STEPS);
        assert!(stream.volume().is_finite());
        stream.shift_db_volume(1).unwrap();
        assert_eq!(stream.db_volume(), MAX_DB_STEPS);
        stream.set_db_volume(i32::MIN).unwrap();
        assert_eq!(stream.db_volume(), -MAX_DB_STEPS);
        assert!(stream.volume() > 0.0);
    }

    #[test]
    fn test_video_only_loop_through_end_event() {
        let engine = engine();
        let mut stream = StreamController::open(engine.clone(), media(&engine, 200, false, true)).unwrap();
        let frames = sink();
        stream.set_streaming_object(frames.clone()).unwrap();
        stream.set_eof_policy(EofPolicy::Looping);
        stream.load().unwrap();
        stream.play().unwrap();

        let mut ends = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while ends < 2 {
            assert!(Instant::now() < deadline, "stream did not loop");
            if let Some(event) = engine.wait_event(Duration::from_millis(5)) {
                if matches!(event, EngineEvent::EndOfStream { .. }) {
                    ends += 1;
                }
                stream.handle_event(&event).unwrap();
            }
        }
        let shown = frames.displayed();
        // 第二轮从第一帧重新开始
        assert!(shown.iter().filter(|pts| **pts == 0).count() >= 2);
    }

    #[test]
    fn test_audio_only_user_slave_is_signalled() {
        struct CountingSlave(AtomicUsize);
        impl SyncSlave for CountingSlave {
            fn signal_state_change(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let engine = engine();
        let slave = Arc::new(CountingSlave(AtomicUsize::new(0)));
        let mut stream = StreamController::open(engine.clone(), media(&engine, 1000, true, false)).unwrap();
        stream.set_sync_object(UserSync::with_slave(slave.clone())).unwrap();
        stream.load().unwrap();
        stream.play().unwrap();
        stream.absolute_seek(500).unwrap();
        assert_eq!(slave.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_engine, mut stream) = loaded_audio(1000);
        stream.close();
        stream.close();
        assert!(!stream.is_loaded());
        assert!(matches!(stream.load(), Err(EngineError::Configuration(_))));
    }
}
