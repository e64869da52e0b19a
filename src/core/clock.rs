use crate::core::ReferenceClock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 自由运行的墙上时钟，流没有音频时作为主时钟
#[derive(Clone)]
pub struct WallClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_ms: u32,           // base_instant 时刻的时钟值
    base_instant: Instant,
    paused: bool,
    mod_index: u32,
}

impl ClockInner {
    fn now(&self) -> u32 {
        if self.paused {
            self.base_ms
        } else {
            let elapsed = self.base_instant.elapsed().as_millis();
            let now = self.base_ms as u128 + elapsed;
            // 保持在未知时钟哨兵值之下
            now.min(u32::MAX as u128 - 1) as u32
        }
    }
}

impl WallClock {
    /// 新时钟从 0 开始，处于暂停状态
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_ms: 0,
                base_instant: Instant::now(),
                paused: true,
                mod_index: 0,
            })),
        }
    }

    pub fn now(&self) -> u32 {
        self.inner.lock().now()
    }

    pub fn reference(&self) -> ReferenceClock {
        let inner = self.inner.lock();
        ReferenceClock::new(inner.now(), inner.paused, inner.mod_index)
    }

    /// 时钟已在运行时返回 false
    pub fn play(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return false;
        }
        inner.base_instant = Instant::now();
        inner.paused = false;
        true
    }

    /// 时钟已暂停时返回 false
    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.paused {
            return false;
        }
        inner.base_ms = inner.now();
        inner.paused = true;
        true
    }

    /// 重新锚定时钟（属于一次不连续）
    pub fn set_time(&self, clock_ms: u32) {
        let mut inner = self.inner.lock();
        inner.base_ms = clock_ms;
        inner.base_instant = Instant::now();
        inner.mod_index = inner.mod_index.wrapping_add(1);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_starts_paused_at_zero() {
        let clock = WallClock::new();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.reference(), ReferenceClock::new(0, true, 0));
    }

    #[test]
    fn test_play_pause_transitions() {
        let clock = WallClock::new();
        assert!(clock.play());
        assert!(!clock.play());
        thread::sleep(Duration::from_millis(20));
        assert!(clock.pause());
        assert!(!clock.pause());
        let frozen = clock.now();
        assert!(frozen >= 20);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now(), frozen);
    }

    #[test]
    fn test_set_time_bumps_mod_index() {
        let clock = WallClock::new();
        clock.set_time(5000);
        clock.set_time(7000);
        let reference = clock.reference();
        assert_eq!(reference.clock, 7000);
        assert_eq!(reference.mod_index, 2);
        assert!(reference.paused);
    }
}
