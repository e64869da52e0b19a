use crate::core::{EngineError, MediaInfo, Result, SeekDirection};
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 解复用出的一个数据包，`pts_ms` 为流内显示时间（毫秒）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub stream_index: usize,
    pub pts_ms: u32,
    pub data: Vec<u8>,
}

/// 由读包线程驱动的容器读取器
///
/// 不同数据源（文件、网络、内存、合成）各自实现
pub trait Demuxer: Send {
    fn media_info(&self) -> &MediaInfo;

    /// - `Ok(Some(packet))`: 下一个数据包
    /// - `Ok(None)`: 文件结束
    /// - `Err(e)`: 读取失败，按文件结束处理
    fn read_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// 重新定位读取位置。`Backward` 表示取目标处或之前的关键点
    fn seek(&mut self, stream_index: Option<usize>, target_ms: u32, direction: SeekDirection) -> Result<()>;

    fn description(&self) -> String;
}

/// 解码器从队列中取到的内容
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem {
    Packet(MediaPacket),
    EndOfStream,
    /// 其后的数据都属于同一代的 Seek
    Seek(u64),
}

/// 单个流的数据包队列读端
#[derive(Clone)]
pub struct PacketQueue {
    rx: Receiver<QueueItem>,
}

impl PacketQueue {
    /// 不带 `wait` 时队列为空立即返回 `None`；
    /// 带 `wait` 时阻塞到有数据或读包线程退出
    pub fn get_packet(&self, wait: bool) -> Option<QueueItem> {
        if wait {
            self.rx.recv().ok()
        } else {
            self.rx.try_recv().ok()
        }
    }

    pub fn get_packet_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

enum FeederCommand {
    Seek {
        stream_index: Option<usize>,
        target_ms: u32,
        direction: SeekDirection,
        generation: u64,
    },
    Stop,
}

/// 读包线程的可克隆控制端，解码器用它实现循环
///
/// 每次 Seek 都带一个代号，解码器据此丢弃旧代的数据。
/// 代号的分配和入队在同一把锁下完成，读包线程收到的代号总是递增的
#[derive(Clone)]
pub struct SeekHandle {
    command_tx: Sender<FeederCommand>,
    last_generation: Arc<Mutex<u64>>,
}

impl SeekHandle {
    pub fn context_seek(&self, stream_index: Option<usize>, target_ms: u32, direction: SeekDirection) -> Result<u64> {
        self.seek_with(stream_index, target_ms, direction, |_| {})
    }

    /// 在命令入队前用新代号调用 `prepare`，
    /// 让解码器在读包线程响应之前就开始丢弃数据
    pub fn seek_with(
        &self,
        stream_index: Option<usize>,
        target_ms: u32,
        direction: SeekDirection,
        prepare: impl FnOnce(u64),
    ) -> Result<u64> {
        let mut last = self.last_generation.lock();
        *last += 1;
        let generation = *last;
        prepare(generation);
        self.send_seek(stream_index, target_ms, direction, generation)?;
        Ok(generation)
    }

    /// 同 `seek_with`，但 `prepare` 返回 false 时放弃这次 Seek
    pub fn try_seek_with(
        &self,
        stream_index: Option<usize>,
        target_ms: u32,
        direction: SeekDirection,
        prepare: impl FnOnce(u64) -> bool,
    ) -> Result<Option<u64>> {
        let mut last = self.last_generation.lock();
        *last += 1;
        let generation = *last;
        if !prepare(generation) {
            return Ok(None);
        }
        self.send_seek(stream_index, target_ms, direction, generation)?;
        Ok(Some(generation))
    }

    fn send_seek(&self, stream_index: Option<usize>, target_ms: u32, direction: SeekDirection, generation: u64) -> Result<()> {
        self.command_tx
            .send(FeederCommand::Seek {
                stream_index,
                target_ms,
                direction,
                generation,
            })
            .map_err(|e| EngineError::Channel(format!("发送 Seek 命令失败: {}", e)))
    }
}

struct Route {
    stream_index: usize,
    label: &'static str,
    tx: Sender<QueueItem>,
    // Seek 时用来清掉过期数据包
    rx: Receiver<QueueItem>,
    sent: usize,
}

enum Flow {
    Continue,
    Exit,
}

/// 读包线程
///
/// 队列有界：队列满时读包线程阻塞（背压），但仍然监听 Seek/停止命令
pub struct PacketFeeder {
    thread_handle: Option<JoinHandle<()>>,
    seek_handle: SeekHandle,
    audio_queue: Option<PacketQueue>,
    video_queue: Option<PacketQueue>,
    media_info: MediaInfo,
}

impl PacketFeeder {
    pub fn start(
        demuxer: Box<dyn Demuxer>,
        audio_stream: Option<usize>,
        video_stream: Option<usize>,
        capacity: usize,
    ) -> Result<Self> {
        if audio_stream.is_none() && video_stream.is_none() {
            return Err(EngineError::NoPlayableStream);
        }
        let media_info = demuxer.media_info().clone();
        let (command_tx, command_rx) = unbounded::<FeederCommand>();

        let mut routes = Vec::new();
        let mut make_route = |index: Option<usize>, label: &'static str| {
            index.map(|stream_index| {
                let (tx, rx) = bounded::<QueueItem>(capacity.max(1));
                routes.push(Route {
                    stream_index,
                    label,
                    tx,
                    rx: rx.clone(),
                    sent: 0,
                });
                PacketQueue { rx }
            })
        };
        let audio_queue = make_route(audio_stream, "audio");
        let video_queue = make_route(video_stream, "video");

        let thread_handle = thread::Builder::new()
            .name("packet-feeder".to_string())
            .spawn(move || {
                Self::feed_loop(demuxer, command_rx, routes);
            })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            seek_handle: SeekHandle {
                command_tx,
                last_generation: Arc::new(Mutex::new(0)),
            },
            audio_queue,
            video_queue,
            media_info,
        })
    }

    fn feed_loop(mut demuxer: Box<dyn Demuxer>, command_rx: Receiver<FeederCommand>, mut routes: Vec<Route>) {
        info!("{} 🎬 读包线程启动: {}", log_ctx(), demuxer.description());

        let mut at_end = false;
        loop {
            let mut exit = false;
            while let Ok(command) = command_rx.try_recv() {
                match Self::handle_command(demuxer.as_mut(), &mut routes, command) {
                    Flow::Continue => at_end = false,
                    Flow::Exit => {
                        exit = true;
                        break;
                    }
                }
            }
            if exit {
                break;
            }

            if at_end {
                // 没有可读的了，睡到有人 Seek 或停止
                match command_rx.recv() {
                    Ok(command) => match Self::handle_command(demuxer.as_mut(), &mut routes, command) {
                        Flow::Continue => at_end = false,
                        Flow::Exit => break,
                    },
                    Err(_) => break,
                }
                continue;
            }

            let packet = match demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    info!("{} 📄 读包线程到达文件末尾，等待命令", log_ctx());
                    at_end = true;
                    match Self::broadcast_end(demuxer.as_mut(), &mut routes, &command_rx) {
                        Some(Flow::Exit) => break,
                        // 通知结尾期间收到了 Seek
                        Some(Flow::Continue) => at_end = false,
                        None => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!("{} ❌ 读取数据包失败: {}", log_ctx(), e);
                    at_end = true;
                    match Self::broadcast_end(demuxer.as_mut(), &mut routes, &command_rx) {
                        Some(Flow::Exit) => break,
                        Some(Flow::Continue) => at_end = false,
                        None => {}
                    }
                    continue;
                }
            };

            let Some(route) = routes.iter_mut().find(|r| r.stream_index == packet.stream_index) else {
                // 不解码的流
                continue;
            };
            route.sent += 1;
            if route.sent <= 3 || route.sent % 500 == 0 {
                debug!("{} 📦 {} 数据包 #{} pts {}ms", log_ctx(), route.label, route.sent, packet.pts_ms);
            }

            let tx = route.tx.clone();
            select! {
                send(tx, QueueItem::Packet(packet)) -> res => {
                    if res.is_err() {
                        warn!("{} ⚠️ 数据包队列已关闭", log_ctx());
                        break;
                    }
                }
                recv(command_rx) -> command => {
                    // 阻塞中的那个包早于命令，直接丢弃
                    match command {
                        Ok(command) => {
                            if let Flow::Exit = Self::handle_command(demuxer.as_mut(), &mut routes, command) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        let sent: Vec<String> = routes.iter().map(|r| format!("{} {}", r.sent, r.label)).collect();
        info!("{} 🛑 读包线程退出 (已发送 {})", log_ctx(), sent.join(", "));
        // 发送端在此 drop，唤醒阻塞等待的解码器
    }

    /// 向每个队列推送 `EndOfStream`。被命令打断时返回该命令的处理结果
    fn broadcast_end(
        demuxer: &mut dyn Demuxer,
        routes: &mut [Route],
        command_rx: &Receiver<FeederCommand>,
    ) -> Option<Flow> {
        for i in 0..routes.len() {
            let tx = routes[i].tx.clone();
            select! {
                send(tx, QueueItem::EndOfStream) -> res => {
                    if res.is_err() {
                        return Some(Flow::Exit);
                    }
                }
                recv(command_rx) -> command => {
                    return Some(match command {
                        Ok(command) => Self::handle_command(demuxer, routes, command),
                        Err(_) => Flow::Exit,
                    });
                }
            }
        }
        None
    }

    fn handle_command(demuxer: &mut dyn Demuxer, routes: &mut [Route], command: FeederCommand) -> Flow {
        match command {
            FeederCommand::Seek {
                stream_index,
                target_ms,
                direction,
                generation,
            } => {
                info!(
                    "{} ⏩ 读包线程 Seek #{} 到 {}ms ({:?})",
                    log_ctx(),
                    generation,
                    target_ms,
                    direction
                );
                for route in routes.iter() {
                    let flushed = route.rx.try_iter().count();
                    if flushed > 0 {
                        debug!("{} 🧹 清除 {} 个过期的 {} 数据", log_ctx(), flushed, route.label);
                    }
                }
                if let Err(e) = demuxer.seek(stream_index, target_ms, direction) {
                    // 失败也照样发标记，避免解码器一直等待
                    error!("{} ❌ Seek 失败: {}", log_ctx(), e);
                }
                for route in routes.iter() {
                    if route.tx.send(QueueItem::Seek(generation)).is_err() {
                        return Flow::Exit;
                    }
                }
                Flow::Continue
            }
            FeederCommand::Stop => {
                info!("{} ⏹ 读包线程收到停止命令", log_ctx());
                Flow::Exit
            }
        }
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    pub fn audio_queue(&self) -> Option<PacketQueue> {
        self.audio_queue.clone()
    }

    pub fn video_queue(&self) -> Option<PacketQueue> {
        self.video_queue.clone()
    }

    pub fn seek_handle(&self) -> SeekHandle {
        self.seek_handle.clone()
    }

    pub fn context_seek(&self, stream_index: Option<usize>, target_ms: u32, direction: SeekDirection) -> Result<u64> {
        self.seek_handle.context_seek(stream_index, target_ms, direction)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.seek_handle.command_tx.send(FeederCommand::Stop);
            // 阻塞在满队列上的读包线程也在监听命令
            if handle.join().is_err() {
                error!("{} ❌ 读包线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for PacketFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}
