//! 视频解码线程、帧槽与刷新握手
//!
//! 解码好的画面提前写入输出槽。槽的 pts 按同步时钟到期时，
//! 线程发送 `EngineEvent::Refresh`，控制线程通过 `refresh_video_frame` 显示，
//! 并按输出端的 get/lock/release 方式归还槽

use crate::core::{EngineContext, EngineError, EngineEvent, EofNotifier, Outcome, Result, StreamId};
use crate::player::audio_decoder::AudioHandle;
use crate::player::codec::{DecodedFrame, VideoCodec};
use crate::player::packet_feeder::{PacketQueue, QueueItem};
use crate::player::sync_object::SyncObject;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 落后时钟超过这个值的帧直接丢弃，不显示
const LATE_FRAME_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetBufferMethod {
    /// 缓冲不变：每个槽只调用一次 `get_buffer`
    StaticGet,
    /// 每个解码帧都调用 `get_buffer`
    DynamicGet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlrMethod {
    /// 槽中的帧显示后立即重新装载
    SyncGlr,
    /// 下一个槽显示后才重新装载
    AsyncGlr,
}

/// 一个槽的像素内存
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub type SharedFrameBuffer = Arc<Mutex<FrameBuffer>>;

/// 解码帧的去处（纹理、窗口表面、内存等）
///
/// 除 `refresh_frame` 外都在视频线程上调用；
/// `refresh_frame` 在控制线程上执行
pub trait FrameSink: Send + Sync {
    fn get_buffer_method(&self) -> GetBufferMethod {
        GetBufferMethod::StaticGet
    }

    fn glr_method(&self) -> GlrMethod {
        GlrMethod::SyncGlr
    }

    fn init(&self, width: u32, height: u32, slots: usize) -> Result<()>;

    fn get_buffer(&self, slot: usize) -> Result<SharedFrameBuffer>;

    fn lock_buffer(&self, _slot: usize) -> Result<()> {
        Ok(())
    }

    /// 对刚写入的缓冲做后处理
    fn filter_buffer(&self, _slot: usize, _buffer: &mut FrameBuffer) -> Result<()> {
        Ok(())
    }

    fn release_buffer(&self, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn refresh_frame(&self, slot: usize) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 唤醒视频线程的通道，从不阻塞
#[derive(Clone)]
pub struct VideoWaker {
    tx: Sender<()>,
}

impl VideoWaker {
    pub fn pair() -> (VideoWaker, Receiver<()>) {
        // 有一个待处理的唤醒就够了
        let (tx, rx) = bounded(1);
        (VideoWaker { tx }, rx)
    }

    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => debug!("{} 视频线程已退出，丢弃唤醒", log_ctx()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Filling,
    Ready,
    // 刷新事件已发出，尚未处理
    Posted,
    Displayed,
}

#[derive(Debug, Clone, Copy)]
struct ReadyFrame {
    slot: usize,
    pts_ms: u32,
    generation: u64,
}

struct VideoState {
    slots: Vec<SlotState>,
    ready: VecDeque<ReadyFrame>,
    generation: u64,
    awaiting_seek: bool,
    // 主端已完成的最后一次 Seek
    released: u64,
    at_end: bool,
}

impl VideoState {
    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| *s == SlotState::Free)
    }

    fn drop_queued_frames(&mut self) {
        for slot in self.slots.iter_mut() {
            if matches!(*slot, SlotState::Ready | SlotState::Posted) {
                *slot = SlotState::Free;
            }
        }
        self.ready.clear();
    }
}

// 本次 Seek 的帧要等主端稳定
#[derive(Debug, Clone, Copy)]
struct Hold {
    generation: u64,
    needs_release: bool,
}

struct VideoShared {
    id: StreamId,
    engine: Arc<EngineContext>,
    state: Mutex<VideoState>,
    sink: Arc<dyn FrameSink>,
    static_buffers: Mutex<Vec<Option<SharedFrameBuffer>>>,
    waker: VideoWaker,
    running: AtomicBool,
    granularity: Duration,
    width: u32,
    height: u32,
}

/// 视频流的控制端
#[derive(Clone)]
pub struct VideoHandle {
    shared: Arc<VideoShared>,
}

impl VideoHandle {
    /// 显示已发送的槽，必须在控制线程上调用
    pub fn refresh_video_frame(&self, slot: usize) -> Result<()> {
        let shared = &self.shared;
        {
            let state = shared.state.lock();
            match state.slots.get(slot) {
                Some(SlotState::Posted) => {}
                Some(other) => {
                    // 事件发出后被 Seek 清空
                    debug!("{} 🧹 忽略槽 {} 的刷新 ({:?})", log_ctx(), slot, other);
                    return Ok(());
                }
                None => return Err(EngineError::Sink(format!("没有帧槽 {}", slot))),
            }
        }

        let displayed = shared.sink.refresh_frame(slot);

        let mut state = shared.state.lock();
        if state.slots[slot] == SlotState::Posted {
            match shared.sink.glr_method() {
                GlrMethod::SyncGlr => state.slots[slot] = SlotState::Free,
                GlrMethod::AsyncGlr => {
                    for s in state.slots.iter_mut() {
                        if *s == SlotState::Displayed {
                            *s = SlotState::Free;
                        }
                    }
                    state.slots[slot] = SlotState::Displayed;
                }
            }
        }
        drop(state);
        shared.waker.wake();
        displayed
    }

    /// 丢弃所有已解码帧；线程在收到 `Seek(generation)` 前读到的都是过期数据
    pub fn start_seeking(&self, generation: u64) {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.max(generation);
        state.awaiting_seek = true;
        state.at_end = false;
        state.drop_queued_frames();
        drop(state);
        self.shared.waker.wake();
    }

    /// 主端已移动，`generation` 的帧可以显示了
    pub fn seek(&self, generation: u64) -> Outcome {
        let mut state = self.shared.state.lock();
        state.released = state.released.max(generation);
        drop(state);
        self.shared.waker.wake();
        Outcome::Done
    }

    pub fn width(&self) -> u32 {
        self.shared.width
    }

    pub fn height(&self) -> u32 {
        self.shared.height
    }

    pub fn stream_id(&self) -> StreamId {
        self.shared.id
    }
}

/// 解码线程除共享状态外需要的全部内容
pub struct VideoStreamParams {
    pub queue: PacketQueue,
    pub codec: Box<dyn VideoCodec>,
    pub sink: Arc<dyn FrameSink>,
    pub sync: Arc<SyncObject>,
    pub waker: (VideoWaker, Receiver<()>),
    /// 音频流为主端时存在
    pub audio: Option<AudioHandle>,
    /// 由本流上报整条流结尾时存在
    pub eof: Option<Arc<EofNotifier>>,
    pub width: u32,
    pub height: u32,
}

pub struct VideoStream {
    shared: Arc<VideoShared>,
    thread_handle: Option<JoinHandle<()>>,
}

struct DecodeLoop {
    shared: Arc<VideoShared>,
    queue: PacketQueue,
    codec: Box<dyn VideoCodec>,
    sync: Arc<SyncObject>,
    wakeups: Receiver<()>,
    audio: Option<AudioHandle>,
    eof: Option<Arc<EofNotifier>>,
    hold: Option<Hold>,
    eof_reported: bool,
    shown: usize,
    dropped: usize,
}

enum Step {
    Post(ReadyFrame),
    Drop(ReadyFrame),
    Wait(Duration),
}

impl VideoStream {
    pub fn start(id: StreamId, engine: Arc<EngineContext>, params: VideoStreamParams) -> Result<Self> {
        let config = engine.config();
        let slots = config.video_slots;
        let granularity = Duration::from_millis(config.timer_granularity_ms);
        if params.sink.glr_method() == GlrMethod::AsyncGlr && slots < 2 {
            return Err(EngineError::Configuration(
                "异步 get/lock/release 至少需要两个帧槽".to_string(),
            ));
        }
        params.sink.init(params.width, params.height, slots)?;

        let (waker, wakeups) = params.waker;
        let shared = Arc::new(VideoShared {
            id,
            engine: engine.clone(),
            state: Mutex::new(VideoState {
                slots: vec![SlotState::Free; slots],
                ready: VecDeque::with_capacity(slots),
                generation: 0,
                awaiting_seek: false,
                released: 0,
                at_end: false,
            }),
            sink: params.sink,
            static_buffers: Mutex::new(vec![None; slots]),
            waker,
            running: AtomicBool::new(true),
            granularity,
            width: params.width,
            height: params.height,
        });

        let mut decode_loop = DecodeLoop {
            shared: shared.clone(),
            queue: params.queue,
            codec: params.codec,
            sync: params.sync,
            wakeups,
            audio: params.audio,
            eof: params.eof,
            hold: None,
            eof_reported: false,
            shown: 0,
            dropped: 0,
        };
        let thread_handle = thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || decode_loop.run())?;

        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn handle(&self) -> VideoHandle {
        VideoHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.waker.wake();
            if handle.join().is_err() {
                error!("{} ❌ 视频解码线程 panic", log_ctx());
            }
            if let Err(e) = self.shared.sink.close() {
                warn!("{} ⚠️ 关闭帧输出失败: {}", log_ctx(), e);
            }
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DecodeLoop {
    fn run(&mut self) {
        info!("{} 🎬 视频解码线程启动: {}", log_ctx(), self.codec.description());
        while self.shared.running.load(Ordering::SeqCst) {
            let (has_free_slot, nothing_ready, at_end) = {
                let state = self.shared.state.lock();
                (state.free_slot().is_some(), state.ready.is_empty(), state.at_end)
            };

            // 到结尾也继续读：后面可能还有循环或 Seek 标记
            if has_free_slot {
                let item = if nothing_ready {
                    self.queue.get_packet_timeout(self.shared.granularity)
                } else {
                    self.queue.get_packet(false)
                };
                if let Some(item) = item {
                    self.handle_item(item);
                    continue;
                }
            }

            match self.next_step() {
                Step::Post(frame) => {
                    self.shown += 1;
                    self.shared.engine.post(EngineEvent::Refresh {
                        stream: self.shared.id,
                        slot: frame.slot,
                    });
                }
                Step::Drop(frame) => {
                    self.dropped += 1;
                    debug!("{} 🗑 丢弃迟到帧 {}ms", log_ctx(), frame.pts_ms);
                }
                Step::Wait(timeout) => {
                    if at_end && nothing_ready {
                        self.report_end();
                    }
                    // 状态变化或槽被释放会提前结束等待
                    let _ = self.wakeups.recv_timeout(timeout);
                }
            }
        }
        info!(
            "{} 🛑 视频解码线程退出 (显示 {} 帧，丢弃 {} 帧)",
            log_ctx(),
            self.shown,
            self.dropped
        );
    }

    fn handle_item(&mut self, item: QueueItem) {
        match item {
            QueueItem::Seek(generation) => {
                let mut state = self.shared.state.lock();
                if generation < state.generation {
                    return;
                }
                let needs_release = state.awaiting_seek && generation == state.generation;
                state.generation = generation;
                state.awaiting_seek = false;
                state.at_end = false;
                drop(state);
                // 不是我们发起的标记，来自音频循环
                self.hold = Some(Hold {
                    generation,
                    needs_release,
                });
                self.eof_reported = false;
                self.codec.flush();
            }
            QueueItem::EndOfStream => {
                let mut state = self.shared.state.lock();
                if !state.awaiting_seek {
                    state.at_end = true;
                }
            }
            QueueItem::Packet(packet) => {
                let generation = {
                    let state = self.shared.state.lock();
                    if state.awaiting_seek {
                        return;
                    }
                    state.generation
                };
                match self.codec.decode(&packet) {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.store_frame(frame, generation) {
                            warn!("{} ⚠️ 保存帧失败: {}", log_ctx(), e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{} ⚠️ 视频解码失败 ({}ms): {}", log_ctx(), packet.pts_ms, e),
                }
            }
        }
    }

    fn slot_buffer(&self, slot: usize) -> Result<SharedFrameBuffer> {
        let sink = &self.shared.sink;
        if sink.get_buffer_method() == GetBufferMethod::DynamicGet {
            return sink.get_buffer(slot);
        }
        let mut buffers = self.shared.static_buffers.lock();
        if let Some(buffer) = &buffers[slot] {
            return Ok(buffer.clone());
        }
        let buffer = sink.get_buffer(slot)?;
        buffers[slot] = Some(buffer.clone());
        Ok(buffer)
    }

    /// 把解码画面拷贝到空闲槽并排队等待显示
    fn store_frame(&mut self, frame: DecodedFrame, generation: u64) -> Result<()> {
        let slot = {
            let mut state = self.shared.state.lock();
            if state.awaiting_seek || state.generation != generation {
                return Ok(());
            }
            let Some(slot) = state.free_slot() else {
                return Err(EngineError::Sink("没有空闲帧槽".to_string()));
            };
            state.slots[slot] = SlotState::Filling;
            slot
        };

        let sink = &self.shared.sink;
        let written = self.slot_buffer(slot).and_then(|buffer| {
            sink.lock_buffer(slot)?;
            {
                let mut buffer = buffer.lock();
                buffer.width = frame.width;
                buffer.height = frame.height;
                buffer.data.clear();
                buffer.data.extend_from_slice(&frame.data);
                sink.filter_buffer(slot, &mut buffer)?;
            }
            sink.release_buffer(slot)
        });

        let mut state = self.shared.state.lock();
        if written.is_err() || state.awaiting_seek || state.generation != generation {
            // 也覆盖了拷贝期间开始的 Seek
            state.slots[slot] = SlotState::Free;
            return written;
        }
        state.slots[slot] = SlotState::Ready;
        state.ready.push_back(ReadyFrame {
            slot,
            pts_ms: frame.pts_ms,
            generation,
        });
        Ok(())
    }

    fn hold_released(&mut self, frame: &ReadyFrame) -> bool {
        let Some(hold) = self.hold else {
            return true;
        };
        if frame.generation != hold.generation {
            // 上一轮的尾巴
            return true;
        }
        let released = !hold.needs_release || self.shared.state.lock().released >= hold.generation;
        let audio_settled = self.audio.as_ref().map_or(true, |audio| !audio.is_rebasing());
        if released && audio_settled {
            self.hold = None;
            return true;
        }
        false
    }

    /// 决定如何处理最早就绪的帧
    fn next_step(&mut self) -> Step {
        let granularity = self.shared.granularity;
        let Some(front) = self.shared.state.lock().ready.front().copied() else {
            return Step::Wait(granularity);
        };
        if !self.hold_released(&front) {
            return Step::Wait(granularity);
        }

        let clock = self.sync.get_ref_clock();
        if clock.is_unknown() || clock.paused {
            return Step::Wait(granularity);
        }
        if front.pts_ms > clock.clock {
            let early = Duration::from_millis((front.pts_ms - clock.clock) as u64);
            return Step::Wait(early.min(granularity));
        }

        let mut state = self.shared.state.lock();
        // 查看之后队列可能已被 Seek 清空
        match state.ready.front() {
            Some(current) if current.slot == front.slot && current.generation == front.generation => {}
            _ => return Step::Wait(Duration::ZERO),
        }
        state.ready.pop_front();
        if clock.clock - front.pts_ms > LATE_FRAME_MS && !state.ready.is_empty() {
            state.slots[front.slot] = SlotState::Free;
            return Step::Drop(front);
        }
        state.slots[front.slot] = SlotState::Posted;
        Step::Post(front)
    }

    fn report_end(&mut self) {
        if self.eof_reported {
            return;
        }
        self.eof_reported = true;
        if let Some(eof) = &self.eof {
            info!("{} 📄 视频流到达结尾", log_ctx());
            eof.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineConfig, SeekDirection, SeekPolicy};
    use crate::player::packet_feeder::PacketFeeder;
    use crate::player::sync_object::{SyncMaster, SyncSlave, VideoSlave, WallClockMaster};
    use crate::player::synthetic::{MemoryFrameSink, SyntheticDemuxer, SyntheticVideoCodec};
    use std::time::Instant;

    struct Fixture {
        engine: Arc<EngineContext>,
        feeder: PacketFeeder,
        sync: Arc<SyncObject>,
        sink: Arc<MemoryFrameSink>,
        stream: VideoStream,
    }

    fn start(duration_ms: u32, glr: GlrMethod) -> Fixture {
        let config = EngineConfig {
            timer_granularity_ms: 2,
            ..EngineConfig::default()
        };
        let engine = EngineContext::new(config).unwrap();
        let demuxer = SyntheticDemuxer::new(duration_ms, false, true);
        let info = demuxer.info().clone();
        let feeder = PacketFeeder::start(Box::new(demuxer), None, info.video_stream, 6).unwrap();
        let (waker, wakeups) = VideoWaker::pair();
        let master: Arc<dyn SyncMaster> = Arc::new(WallClockMaster::new());
        let slave: Arc<dyn SyncSlave> = Arc::new(VideoSlave::new(waker.clone()));
        let sync = Arc::new(SyncObject::new(master, slave, false));
        let sink = Arc::new(MemoryFrameSink::new(GetBufferMethod::StaticGet, glr));
        let id = engine.allocate_stream_id();
        let stream = VideoStream::start(
            id,
            engine.clone(),
            VideoStreamParams {
                queue: feeder.video_queue().unwrap(),
                codec: Box::new(SyntheticVideoCodec::new(info.width, info.height)),
                sink: sink.clone(),
                sync: sync.clone(),
                waker: (waker, wakeups),
                audio: None,
                eof: Some(EofNotifier::new(id, engine.clone())),
                width: info.width,
                height: info.height,
            },
        )
        .unwrap();
        Fixture {
            engine,
            feeder,
            sync,
            sink,
            stream,
        }
    }

    /// 刷新已发送的帧直到 `done` 成立，返回看到的事件
    fn pump(fixture: &Fixture, mut done: impl FnMut(&[EngineEvent]) -> bool) -> Vec<EngineEvent> {
        let handle = fixture.stream.handle();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut events = Vec::new();
        while !done(&events) {
            assert!(Instant::now() < deadline, "video stream stalled");
            if let Some(event) = fixture.engine.wait_event(Duration::from_millis(5)) {
                if let EngineEvent::Refresh { slot, .. } = event {
                    handle.refresh_video_frame(slot).unwrap();
                }
                events.push(event);
            }
        }
        events
    }

    fn refreshes(events: &[EngineEvent]) -> usize {
        events.iter().filter(|e| matches!(e, EngineEvent::Refresh { .. })).count()
    }

    #[test]
    fn test_paused_clock_shows_nothing() {
        let fixture = start(1000, GlrMethod::SyncGlr);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fixture.engine.poll_event(), None);
        assert!(fixture.sink.displayed().is_empty());
    }

    #[test]
    fn test_frames_follow_clock_in_order() {
        let fixture = start(1000, GlrMethod::SyncGlr);
        fixture.sync.play();
        pump(&fixture, |events| refreshes(events) >= 4);
        let shown = fixture.sink.displayed();
        assert!(shown.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(shown[0], 0);
    }

    #[test]
    fn test_async_glr_keeps_displayed_slot() {
        let fixture = start(1000, GlrMethod::AsyncGlr);
        fixture.sync.play();
        pump(&fixture, |events| refreshes(events) >= 3);
        let state = fixture.stream.shared.state.lock();
        let displayed = state.slots.iter().filter(|s| **s == SlotState::Displayed).count();
        assert_eq!(displayed, 1);
    }

    #[test]
    fn test_async_glr_needs_two_slots() {
        let config = EngineConfig {
            video_slots: 1,
            ..EngineConfig::default()
        };
        let engine = EngineContext::new(config).unwrap();
        let demuxer = SyntheticDemuxer::new(1000, false, true);
        let feeder = PacketFeeder::start(Box::new(demuxer), None, Some(0), 6).unwrap();
        let (waker, wakeups) = VideoWaker::pair();
        let sync = Arc::new(SyncObject::new(
            Arc::new(WallClockMaster::new()),
            Arc::new(VideoSlave::new(waker.clone())),
            false,
        ));
        let result = VideoStream::start(
            engine.allocate_stream_id(),
            engine.clone(),
            VideoStreamParams {
                queue: feeder.video_queue().unwrap(),
                codec: Box::new(SyntheticVideoCodec::new(4, 4)),
                sink: Arc::new(MemoryFrameSink::new(GetBufferMethod::DynamicGet, GlrMethod::AsyncGlr)),
                sync,
                waker: (waker, wakeups),
                audio: None,
                eof: None,
                width: 4,
                height: 4,
            },
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_seek_shows_frames_from_target() {
        let fixture = start(10_000, GlrMethod::SyncGlr);
        let video = fixture.stream.handle();
        let generation = fixture
            .feeder
            .seek_handle()
            .seek_with(None, 5000, SeekDirection::Forward, |generation| video.start_seeking(generation))
            .unwrap();
        fixture.sync.seek(5000, SeekPolicy::RestartOnSeek);
        video.seek(generation);

        pump(&fixture, |events| refreshes(events) >= 2);
        let shown = fixture.sink.displayed();
        assert!(shown[0] >= 5000);
    }

    #[test]
    fn test_end_of_stream_is_reported_once() {
        let fixture = start(200, GlrMethod::SyncGlr);
        fixture.sync.play();
        let events = pump(&fixture, |events| {
            events.iter().any(|e| matches!(e, EngineEvent::EndOfStream { .. }))
        });
        assert!(refreshes(&events) >= 1);
        thread::sleep(Duration::from_millis(30));
        let again = std::iter::from_fn(|| fixture.engine.poll_event())
            .filter(|e| matches!(e, EngineEvent::EndOfStream { .. }))
            .count();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_refresh_of_unknown_slot_is_an_error() {
        let fixture = start(1000, GlrMethod::SyncGlr);
        let video = fixture.stream.handle();
        assert!(video.refresh_video_frame(99).is_err());
        // 空闲槽不会被显示
        assert!(video.refresh_video_frame(0).is_ok());
        assert!(fixture.sink.displayed().is_empty());
    }

    #[test]
    fn test_waker_never_blocks() {
        let (waker, wakeups) = VideoWaker::pair();
        waker.wake();
        waker.wake();
        assert!(wakeups.try_recv().is_ok());
        assert!(wakeups.try_recv().is_err());
        drop(wakeups);
        waker.wake();
    }
}
