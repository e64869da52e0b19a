//! 两条独立线程时间线之间的主从时钟协商
//!
//! 主端持有权威时钟（`get_ref_clock`、`play`、`pause`、`seek`）；
//! 主端发生了从暂停标志看不出来的变化（播放、Seek、循环）时通知从端。
//! 标准绑定以音频流或墙上时钟为主、视频解码器为从；
//! 用户可以替换其中一半，另一半由控制器交叉连接。

use crate::core::{Outcome, ReferenceClock, SeekPolicy, StreamType, WallClock, EngineError, Result};
use crate::player::audio_decoder::AudioHandle;
use crate::player::video_decoder::VideoWaker;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait SyncMaster: Send + Sync {
    /// 当前时钟，必须能从任意线程并发调用
    fn get_ref_clock(&self) -> ReferenceClock;

    /// 已在播放时返回 `Outcome::Useless`
    fn play(&self) -> Outcome;

    /// 主端不支持暂停时返回 `None`
    fn pause(&self) -> Option<Outcome> {
        None
    }

    /// 主端不能 Seek 时返回 `None`，须与 `can_seek` 一致
    fn seek(&self, _target_ms: u32, _policy: SeekPolicy) -> Option<Outcome> {
        None
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        "user master".to_string()
    }
}

pub trait SyncSlave: Send + Sync {
    /// 可能在音频线程上执行，要么线程安全，要么只做唤醒
    fn signal_state_change(&self);

    fn description(&self) -> String {
        "user slave".to_string()
    }
}

/// 以音频流为时钟
pub struct AudioMaster {
    audio: AudioHandle,
}

impl AudioMaster {
    pub fn new(audio: AudioHandle) -> Self {
        Self { audio }
    }
}

impl SyncMaster for AudioMaster {
    fn get_ref_clock(&self) -> ReferenceClock {
        self.audio.reference_clock()
    }

    fn play(&self) -> Outcome {
        self.audio.play()
    }

    fn pause(&self) -> Option<Outcome> {
        Some(self.audio.pause())
    }

    // 新时钟来自 Seek 后的第一个 pts，暂停策略在开始 Seek 时已交给音频
    fn seek(&self, _target_ms: u32, _policy: SeekPolicy) -> Option<Outcome> {
        Some(self.audio.seek())
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        "audio master".to_string()
    }
}

/// 以自由运行的计时器为时钟，没有音频时使用
pub struct WallClockMaster {
    clock: WallClock,
}

impl WallClockMaster {
    pub fn new() -> Self {
        Self { clock: WallClock::new() }
    }
}

impl Default for WallClockMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMaster for WallClockMaster {
    fn get_ref_clock(&self) -> ReferenceClock {
        self.clock.reference()
    }

    fn play(&self) -> Outcome {
        if self.clock.play() {
            Outcome::Done
        } else {
            Outcome::Useless
        }
    }

    fn pause(&self) -> Option<Outcome> {
        Some(if self.clock.pause() { Outcome::Done } else { Outcome::Useless })
    }

    fn seek(&self, target_ms: u32, policy: SeekPolicy) -> Option<Outcome> {
        self.clock.set_time(target_ms);
        if policy == SeekPolicy::RestartOnSeek {
            self.clock.play();
        }
        Some(Outcome::Done)
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        "wall clock master".to_string()
    }
}

/// 唤醒视频解码线程，让它立即重新读取时钟
pub struct VideoSlave {
    waker: VideoWaker,
}

impl VideoSlave {
    pub fn new(waker: VideoWaker) -> Self {
        Self { waker }
    }
}

impl SyncSlave for VideoSlave {
    fn signal_state_change(&self) {
        self.waker.wake();
    }

    fn description(&self) -> String {
        "video slave".to_string()
    }
}

/// 用户提供的主从端，须在流加载前设置
#[derive(Clone, Default)]
pub struct UserSync {
    pub master: Option<Arc<dyn SyncMaster>>,
    pub slave: Option<Arc<dyn SyncSlave>>,
}

impl UserSync {
    pub fn with_master(master: Arc<dyn SyncMaster>) -> Self {
        Self { master: Some(master), slave: None }
    }

    pub fn with_slave(slave: Arc<dyn SyncSlave>) -> Self {
        Self { master: None, slave: Some(slave) }
    }
}

/// 流当前生效的主从对
pub struct SyncObject {
    looping: AtomicBool,
    master: Arc<dyn SyncMaster>,
    slave: Arc<dyn SyncSlave>,
    user_supplied: bool,
}

impl SyncObject {
    pub fn new(master: Arc<dyn SyncMaster>, slave: Arc<dyn SyncSlave>, user_supplied: bool) -> Self {
        Self {
            looping: AtomicBool::new(false),
            master,
            slave,
            user_supplied,
        }
    }

    /// 为流选择主从对，用户缺的那一半由这里补上。
    /// 纯音频流且没有用户对象时不建同步对象
    pub fn cross_wire(
        stream_type: StreamType,
        user: Option<UserSync>,
        audio: Option<&AudioHandle>,
        video_waker: Option<&VideoWaker>,
    ) -> Result<Option<SyncObject>> {
        let missing = |what: &str| EngineError::Configuration(format!("缺少{}", what));

        let Some(user) = user else {
            return Ok(match stream_type {
                StreamType::Audio => None,
                StreamType::Video => {
                    let waker = video_waker.ok_or_else(|| missing("视频解码器"))?;
                    Some(SyncObject::new(
                        Arc::new(WallClockMaster::new()),
                        Arc::new(VideoSlave::new(waker.clone())),
                        false,
                    ))
                }
                StreamType::AudioVideo => {
                    let audio = audio.ok_or_else(|| missing("音频解码器"))?;
                    let waker = video_waker.ok_or_else(|| missing("视频解码器"))?;
                    Some(SyncObject::new(
                        Arc::new(AudioMaster::new(audio.clone())),
                        Arc::new(VideoSlave::new(waker.clone())),
                        false,
                    ))
                }
            });
        };

        Self::check_user_sync(stream_type, Some(&user))?;
        match stream_type {
            StreamType::Audio => {
                if user.master.is_some() {
                    warn!("⚠️ 忽略用户主时钟，音频流以自身为时钟");
                }
                let slave = user.slave.ok_or_else(|| missing("同步从端"))?;
                let audio = audio.ok_or_else(|| missing("音频解码器"))?;
                Ok(Some(SyncObject::new(Arc::new(AudioMaster::new(audio.clone())), slave, true)))
            }
            StreamType::Video => {
                if user.slave.is_some() {
                    warn!("⚠️ 忽略用户从端，视频流以视频解码器为从端");
                }
                let master = user.master.ok_or_else(|| missing("同步主端"))?;
                let waker = video_waker.ok_or_else(|| missing("视频解码器"))?;
                Ok(Some(SyncObject::new(master, Arc::new(VideoSlave::new(waker.clone())), true)))
            }
            StreamType::AudioVideo => Err(EngineError::Configuration(
                "音视频流不支持用户同步对象".to_string(),
            )),
        }
    }

    /// 拒绝无法驱动此类型流的用户同步对象
    pub fn check_user_sync(stream_type: StreamType, user: Option<&UserSync>) -> Result<()> {
        let Some(user) = user else {
            return Ok(());
        };
        match stream_type {
            StreamType::Audio if user.slave.is_none() => Err(EngineError::Configuration(
                "音频流的同步对象必须提供 signal_state_change".to_string(),
            )),
            StreamType::Video if user.master.is_none() => Err(EngineError::Configuration(
                "视频流的同步对象必须提供 get_ref_clock 和 play".to_string(),
            )),
            StreamType::AudioVideo => Err(EngineError::Configuration(
                "音视频流不支持用户同步对象".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn get_ref_clock(&self) -> ReferenceClock {
        self.master.get_ref_clock()
    }

    /// 暂停 -> 播放；只有状态真的变了才通知从端
    pub fn play(&self) -> Outcome {
        let outcome = self.master.play();
        if outcome == Outcome::Done {
            self.slave.signal_state_change();
        }
        outcome
    }

    /// 播放 -> 暂停。不通知从端，从端自己读暂停标志
    pub fn pause(&self) -> Option<Outcome> {
        self.master.pause()
    }

    pub fn can_seek(&self) -> bool {
        self.master.can_seek()
    }

    pub fn seek(&self, target_ms: u32, policy: SeekPolicy) -> Option<Outcome> {
        let outcome = self.master.seek(target_ms, policy)?;
        debug!("⏩ {} Seek 到 {}ms ({:?})", self.master.description(), target_ms, policy);
        self.slave.signal_state_change();
        Some(outcome)
    }

    pub fn slave(&self) -> Arc<dyn SyncSlave> {
        self.slave.clone()
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    pub fn is_user_supplied(&self) -> bool {
        self.user_supplied
    }

    pub fn description(&self) -> String {
        format!("{} -> {}", self.master.description(), self.slave.description())
    }
}
