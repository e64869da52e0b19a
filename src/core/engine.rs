use crate::core::{EngineConfig, Result, StreamId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 工作线程发给控制线程的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// `slot` 中的帧到期了，用它调用 `refresh_video_frame`
    Refresh { stream: StreamId, slot: usize },
    /// 流播放到结尾（或循环越过结尾）
    /// `wrapped` 表示越过结尾的 Seek 已经把流送回开头
    EndOfStream { stream: StreamId, wrapped: bool },
}

pub type EofCallback = Arc<dyn Fn(StreamId) + Send + Sync>;

/// 流到达结尾时的通知方式
#[derive(Clone)]
pub enum EofSignal {
    None,
    /// 在引擎通道上发送 `EngineEvent::EndOfStream`
    Event,
    /// 由检测到结尾的线程直接调用用户函数
    Callback(EofCallback),
}

/// 各组件共享的引擎状态
pub struct EngineContext {
    config: EngineConfig,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    next_stream_id: AtomicU64,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (events_tx, events_rx) = unbounded();
        Ok(Arc::new(Self {
            config,
            events_tx,
            events_rx,
            next_stream_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 非阻塞地取下一个事件
    pub fn poll_event(&self) -> Option<EngineEvent> {
        self.events_rx.try_recv().ok()
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<EngineEvent> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn post(&self, event: EngineEvent) {
        // context 自己持有接收端，通道不会断开
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn allocate_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// 每个流的结尾通知器，解码器和控制器共用
pub struct EofNotifier {
    stream: StreamId,
    engine: Arc<EngineContext>,
    signal: Mutex<EofSignal>,
}

impl EofNotifier {
    pub fn new(stream: StreamId, engine: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            stream,
            engine,
            signal: Mutex::new(EofSignal::Event),
        })
    }

    pub fn set_signal(&self, signal: EofSignal) {
        *self.signal.lock() = signal;
    }

    pub fn signal(&self) {
        self.notify(false);
    }

    /// 越过结尾的 Seek 触发的结尾通知（流已回到开头）
    pub fn signal_wrapped(&self) {
        self.notify(true);
    }

    fn notify(&self, wrapped: bool) {
        // 先 clone 出来，用户回调不在锁内执行
        let signal = self.signal.lock().clone();
        match signal {
            EofSignal::None => {}
            EofSignal::Event => {
                debug!("📄 流 {:?} 到达结尾 (wrapped: {})，发送事件", self.stream, wrapped);
                self.engine.post(EngineEvent::EndOfStream {
                    stream: self.stream,
                    wrapped,
                });
            }
            EofSignal::Callback(callback) => callback(self.stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_eof_event_is_posted() {
        let engine = EngineContext::new(EngineConfig::default()).unwrap();
        let id = engine.allocate_stream_id();
        let notifier = EofNotifier::new(id, engine.clone());
        notifier.signal();
        assert_eq!(engine.poll_event(), Some(EngineEvent::EndOfStream { stream: id, wrapped: false }));
        assert_eq!(engine.poll_event(), None);
        notifier.signal_wrapped();
        assert_eq!(engine.poll_event(), Some(EngineEvent::EndOfStream { stream: id, wrapped: true }));
    }

    #[test]
    fn test_eof_callback_and_none() {
        let engine = EngineContext::new(EngineConfig::default()).unwrap();
        let notifier = EofNotifier::new(engine.allocate_stream_id(), engine.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        notifier.set_signal(EofSignal::Callback(Arc::new(move |_: StreamId| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        notifier.signal();
        notifier.set_signal(EofSignal::None);
        notifier.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.poll_event(), None);
    }

    #[test]
    fn test_stream_ids_are_distinct() {
        let engine = EngineContext::new(EngineConfig::default()).unwrap();
        assert_ne!(engine.allocate_stream_id(), engine.allocate_stream_id());
    }
}
