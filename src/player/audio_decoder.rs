//! 音频解码/填充线程，以及采样环形缓冲的输出端
//!
//! 填充线程解码数据包、应用音量，按块写入交错 `i16` 采样的环形缓冲，
//! 输出回调负责取走。两端共用一把锁，这把锁同时保护标记表：
//! 填充端在偏移上打标记（停止、流结尾、时钟重定基），
//! 输出端的读指针到达时做出响应。

use crate::core::{
    EngineContext, EofNotifier, Outcome, ReferenceClock, Result, SeekDirection, SeekPolicy, UNKNOWN_CLOCK,
};
use crate::player::codec::AudioCodec;
use crate::player::markers::{AudioMarkers, MarkerPayload, PositionMarker};
use crate::player::packet_feeder::{PacketQueue, QueueItem, SeekHandle};
use crate::player::sync_object::SyncSlave;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

struct AudioState {
    // `capacity` 个采样的环，外加一个块的余量用于连续写入
    ring: Vec<i16>,
    read: usize,
    write: usize,
    filled: usize,
    markers: AudioMarkers,

    playing: bool,
    // 输出遇到了停止标记（或从未开始）
    halted: bool,
    at_end: bool,
    looping: bool,
    seek_policy: SeekPolicy,

    // 本流已知的最新 Seek 代号
    generation: u64,
    // 丢弃队列数据，直到出现 `Seek(generation)`
    awaiting_seek: bool,
    // 下一个解码的包重新锚定时钟
    pending_rebase: bool,
    // 已请求不连续，但还没播放到
    rebasing: bool,

    clock_base: u32,
    played: u64,
    mod_index: u32,
}

impl AudioState {
    fn clock_now(&self, samples_per_second: u64) -> u32 {
        let elapsed = self.played * 1000 / samples_per_second;
        (self.clock_base as u64 + elapsed).min(UNKNOWN_CLOCK as u64 - 1) as u32
    }

    fn paused(&self) -> bool {
        self.halted || !self.playing
    }

    fn flush(&mut self) {
        self.read = 0;
        self.write = 0;
        self.filled = 0;
        self.markers.clear();
    }

    /// 写位置 `at` 对应的标记偏移。
    /// 写指针已进入读指针下一圈的位置，在读指针回绕前记在环末尾之后
    fn marker_offset(&self, at: usize, capacity: usize) -> usize {
        if at < self.read {
            at + capacity
        } else {
            at
        }
    }

    /// 读指针碰到最近标记前可拷贝的采样数
    fn distance_to_marker(&self, capacity: usize) -> usize {
        self.markers
            .head_offsets()
            .map(|offset| (offset + capacity - self.read) % capacity)
            .min()
            .unwrap_or(usize::MAX)
    }
}

#[derive(Default)]
struct Deferred {
    end_of_stream: bool,
    slave: bool,
}

/// 音频流的共享核心，填充线程和驱动输出回调的一方各持一份
pub struct AudioShared {
    state: Mutex<AudioState>,
    space: Condvar,
    volume: AtomicCell<f64>,
    skip_band: (f64, f64),
    capacity: usize,
    block: usize,
    samples_per_second: u64,
    granularity: Duration,
    stream_index: usize,
    running: AtomicBool,
    eof: Arc<EofNotifier>,
    slave: Mutex<Option<Arc<dyn SyncSlave>>>,
    seek_handle: SeekHandle,
}

/// 控制器、同步对象和输出端使用的可克隆句柄
#[derive(Clone)]
pub struct AudioHandle {
    shared: Arc<AudioShared>,
}

impl AudioHandle {
    pub fn reference_clock(&self) -> ReferenceClock {
        let shared = &self.shared;
        let state = shared.state.lock();
        // 读指针处的重定基已经生效
        if state.markers.rebases.needs_rebase_at(state.read) {
            if let Some(value) = state.markers.rebases.current_value_at_head() {
                return ReferenceClock::new(value, state.paused(), state.mod_index.wrapping_add(1));
            }
        }
        ReferenceClock::new(state.clock_now(shared.samples_per_second), state.paused(), state.mod_index)
    }

    pub fn play(&self) -> Outcome {
        let mut state = self.shared.state.lock();
        if state.playing {
            return Outcome::Useless;
        }
        if state.at_end && !state.looping {
            // 在 Seek 之前没有可播放的了
            return Outcome::Useless;
        }
        state.playing = true;
        state.halted = false;
        // 输出尚未到达的暂停
        let read = state.read;
        if state.markers.stops.peek_first() == Some(read) {
            state.markers.stops.pop();
        }
        debug!("{} ▶️ 音频在 {}ms 处播放", log_ctx(), state.clock_now(self.shared.samples_per_second));
        Outcome::Done
    }

    pub fn pause(&self) -> Outcome {
        let mut state = self.shared.state.lock();
        if !state.playing {
            return Outcome::Useless;
        }
        state.playing = false;
        let read = state.read;
        state.markers.stops.push_front(read);
        debug!("{} ⏸ 音频在 {}ms 处暂停", log_ctx(), state.clock_now(self.shared.samples_per_second));
        Outcome::Done
    }

    /// 清空缓冲的音频和标记。
    /// 填充线程在收到 `Seek(generation)` 之前看到的都是过期数据
    pub fn start_seeking(&self, policy: SeekPolicy, generation: u64) {
        let mut state = self.shared.state.lock();
        state.flush();
        // 清空可能丢掉了输出尚未到达的暂停标记
        state.halted = !state.playing;
        state.generation = state.generation.max(generation);
        state.awaiting_seek = true;
        state.pending_rebase = false;
        state.rebasing = true;
        state.at_end = false;
        state.seek_policy = policy;
        drop(state);
        // 等待空间的写端必须感知到清空
        self.shared.space.notify_all();
    }

    /// Seek 的后半段，新时钟随第一个数据包到来
    pub fn seek(&self) -> Outcome {
        let mut state = self.shared.state.lock();
        if state.seek_policy == SeekPolicy::RestartOnSeek && !state.playing {
            state.playing = true;
            state.halted = false;
        }
        Outcome::Done
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.state.lock().looping = looping;
    }

    pub fn set_slave(&self, slave: Option<Arc<dyn SyncSlave>>) {
        *self.shared.slave.lock() = slave;
    }

    pub fn set_volume(&self, volume: f64) {
        self.shared.volume.store(volume.max(0.0));
    }

    pub fn volume(&self) -> f64 {
        self.shared.volume.load()
    }

    pub fn is_rebasing(&self) -> bool {
        self.shared.state.lock().rebasing
    }

    pub fn at_end(&self) -> bool {
        self.shared.state.lock().at_end
    }

    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    /// 当前缓冲的采样数
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().filled
    }

    /// 输出回调：用交错采样填满 `out`。
    /// 欠载或停止时输出静音；时钟只随真实数据前进
    pub fn fill_output(&self, out: &mut [i16]) {
        let shared = &self.shared;
        let capacity = shared.capacity;
        let mut deferred = Deferred::default();
        let mut state = shared.state.lock();

        let mut pos = 0;
        while pos < out.len() {
            let read = state.read;
            if let Some(marker) = state.markers.take_due(read) {
                Self::apply_marker(&mut state, marker, &mut deferred);
                continue;
            }
            if state.halted || state.filled == 0 {
                out[pos..].fill(0);
                break;
            }
            let n = (out.len() - pos)
                .min(state.filled)
                .min(state.distance_to_marker(capacity))
                .min(capacity - read);
            out[pos..pos + n].copy_from_slice(&state.ring[read..read + n]);
            if read + n == capacity {
                // 写指针下一圈的标记进入当前圈
                state.markers.rebase(0, capacity, 0);
            }
            state.read = (read + n) % capacity;
            state.filled -= n;
            state.played += n as u64;
            pos += n;
        }
        drop(state);
        shared.space.notify_all();

        if deferred.end_of_stream {
            shared.eof.signal();
        }
        if deferred.slave {
            let slave = shared.slave.lock().clone();
            if let Some(slave) = slave {
                slave.signal_state_change();
            }
        }
    }

    fn apply_marker(state: &mut AudioState, marker: PositionMarker, deferred: &mut Deferred) {
        match marker.payload {
            MarkerPayload::ClockRebase(value) => {
                state.clock_base = value;
                state.played = 0;
                state.mod_index = state.mod_index.wrapping_add(1);
                if !state.markers.rebases.has_entry() {
                    state.rebasing = false;
                }
            }
            MarkerPayload::EndOfStream => {
                deferred.end_of_stream = true;
                if state.looping {
                    deferred.slave = true;
                } else {
                    state.at_end = true;
                    state.playing = false;
                }
            }
            MarkerPayload::Stop => {
                state.halted = true;
            }
        }
    }
}

/// 持有一条音频流的填充线程
pub struct AudioStream {
    shared: Arc<AudioShared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioStream {
    pub fn start(
        engine: &EngineContext,
        queue: PacketQueue,
        codec: Box<dyn AudioCodec>,
        seek_handle: SeekHandle,
        stream_index: usize,
        eof: Arc<EofNotifier>,
    ) -> Result<Self> {
        let config = engine.config();
        let capacity = config.ring_capacity();
        let block = config.audio_block_samples;
        let shared = Arc::new(AudioShared {
            state: Mutex::new(AudioState {
                ring: vec![0; capacity + block],
                read: 0,
                write: 0,
                filled: 0,
                markers: AudioMarkers::new(),
                playing: false,
                halted: true,
                at_end: false,
                looping: false,
                seek_policy: SeekPolicy::PreservePause,
                generation: 0,
                awaiting_seek: false,
                pending_rebase: true,
                rebasing: false,
                clock_base: 0,
                played: 0,
                mod_index: 0,
            }),
            space: Condvar::new(),
            volume: AtomicCell::new(1.0),
            skip_band: (config.volume_skip_low, config.volume_skip_high),
            capacity,
            block,
            samples_per_second: config.sample_rate as u64 * config.channels as u64,
            granularity: Duration::from_millis(config.timer_granularity_ms),
            stream_index,
            running: AtomicBool::new(true),
            eof,
            slave: Mutex::new(None),
            seek_handle,
        });

        let thread_shared = shared.clone();
        let thread_handle = thread::Builder::new()
            .name("audio-fill".to_string())
            .spawn(move || Self::fill_loop(thread_shared, queue, codec))?;

        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn handle(&self) -> AudioHandle {
        AudioHandle {
            shared: self.shared.clone(),
        }
    }

    fn fill_loop(shared: Arc<AudioShared>, queue: PacketQueue, mut codec: Box<dyn AudioCodec>) {
        info!("{} 🔊 音频填充线程启动: {}", log_ctx(), codec.description());
        let mut decoded_packets: usize = 0;

        while shared.running.load(Ordering::SeqCst) {
            let Some(item) = queue.get_packet_timeout(shared.granularity) else {
                continue;
            };
            match item {
                QueueItem::Seek(generation) => {
                    let mut state = shared.state.lock();
                    if generation < state.generation {
                        debug!("{} 🧹 过期的音频 Seek 标记 #{}", log_ctx(), generation);
                        continue;
                    }
                    state.generation = generation;
                    state.awaiting_seek = false;
                    state.pending_rebase = true;
                    state.at_end = false;
                    drop(state);
                    codec.flush();
                }
                QueueItem::EndOfStream => Self::on_end_of_stream(&shared),
                QueueItem::Packet(packet) => {
                    if shared.state.lock().awaiting_seek {
                        continue;
                    }
                    let samples = match codec.decode(&packet) {
                        Ok(samples) => samples,
                        Err(e) => {
                            warn!("{} ⚠️ 音频解码失败 ({}ms): {}", log_ctx(), packet.pts_ms, e);
                            continue;
                        }
                    };
                    decoded_packets += 1;
                    if decoded_packets <= 3 {
                        debug!("{} 🔊 音频包 #{} pts {}ms，{} 个采样", log_ctx(), decoded_packets, packet.pts_ms, samples.len());
                    }
                    Self::write_samples(&shared, samples, packet.pts_ms);
                }
            }
        }
        info!("{} 🛑 音频填充线程退出 (共解码 {} 个包)", log_ctx(), decoded_packets);
    }

    fn on_end_of_stream(shared: &AudioShared) {
        let mut state = shared.state.lock();
        if state.awaiting_seek {
            return;
        }
        if state.pending_rebase {
            // 直接 Seek 到了结尾，没有数据包带来新时钟
            state.pending_rebase = false;
            state.rebasing = false;
        }
        let write = state.write;
        let offset = state.marker_offset(write, shared.capacity);
        state.markers.eofs.push(offset);
        if !state.looping {
            state.markers.stops.push(offset);
            debug!("{} 📄 在 {} 处标记音频结尾", log_ctx(), write);
            return;
        }
        drop(state);

        // 与控制器一致，先拿 Seek 锁再拿状态锁
        let rewind = shared
            .seek_handle
            .try_seek_with(Some(shared.stream_index), 0, SeekDirection::Backward, |generation| {
                let mut state = shared.state.lock();
                if state.awaiting_seek {
                    // 用户 Seek 抢先一步，已清掉结尾标记
                    return false;
                }
                state.generation = generation;
                state.awaiting_seek = true;
                state.rebasing = true;
                true
            });
        match rewind {
            Ok(Some(generation)) => info!("{} 🔁 音频循环，读包线程倒回开头 (Seek #{})", log_ctx(), generation),
            Ok(None) => debug!("{} 🔁 循环倒回被 Seek 取代", log_ctx()),
            Err(e) => error!("{} ❌ 循环倒回失败: {}", log_ctx(), e),
        }
    }

    fn scale(shared: &AudioShared, samples: &mut [i16]) {
        let volume = shared.volume.load();
        let (low, high) = shared.skip_band;
        if volume >= low && volume <= high {
            return;
        }
        for sample in samples.iter_mut() {
            *sample = (*sample as f64 * volume).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
    }

    /// 按块写入一个包的采样，空间不足时等待。
    /// 有待处理的重定基时由第一个块携带
    fn write_samples(shared: &AudioShared, mut samples: Vec<i16>, pts_ms: u32) {
        Self::scale(shared, &mut samples);
        let capacity = shared.capacity;
        let mut state = shared.state.lock();
        if state.awaiting_seek {
            // 解码期间开始了 Seek
            return;
        }
        let generation = state.generation;

        for chunk in samples.chunks(shared.block) {
            let n = chunk.len();
            // 严格小于：环满时 write == read 无法区分
            while state.filled + n >= capacity {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                shared.space.wait_for(&mut state, shared.granularity);
                if state.awaiting_seek || state.generation != generation {
                    // 等待期间被 Seek 清空
                    return;
                }
            }

            let write = state.write;
            if state.pending_rebase {
                state.pending_rebase = false;
                let offset = state.marker_offset(write, capacity);
                state.markers.rebases.push(offset, pts_ms);
                debug!("{} ⏱ 时钟重定基为 {}ms (位于 {})", log_ctx(), pts_ms, write);
            }

            state.ring[write..write + n].copy_from_slice(chunk);
            let end = write + n;
            if end > capacity {
                // 把溢出部分移到环的开头
                state.ring.copy_within(capacity..end, 0);
            }
            state.write = end % capacity;
            state.filled += n;
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.space.notify_all();
            if handle.join().is_err() {
                error!("{} ❌ 音频填充线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.stop();
    }
}
