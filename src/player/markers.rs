//! 音频环形缓冲的位置标记
//!
//! 填充线程在环形缓冲的偏移处打上事件标记（停止输出、流结尾、时钟重定基），
//! 输出回调的读指针走到该偏移时执行对应动作。
//! 标记表是固定大小的小环，实时线程不做内存分配。
//! 调用方在整个读改过程中持有音频锁，这里不加锁。

use log::warn;

/// 两个在途解码块加一个待处理的切换
pub const MARKER_LIST_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerPayload {
    Stop,
    EndOfStream,
    ClockRebase(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionMarker {
    pub offset: usize,
    pub payload: MarkerPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Stop,
    EndOfStream,
}

/// 基于定长数组的有界 FIFO
#[derive(Debug, Clone)]
struct Ring<T: Copy + Default> {
    slots: [T; MARKER_LIST_CAPACITY],
    head: usize,
    len: usize,
}

impl<T: Copy + Default> Ring<T> {
    fn new() -> Self {
        Self {
            slots: [T::default(); MARKER_LIST_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    fn slot(&self, index: usize) -> usize {
        (self.head + index) % MARKER_LIST_CAPACITY
    }

    fn front(&self) -> Option<&T> {
        (self.len > 0).then(|| &self.slots[self.head])
    }

    fn front_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        Some(&mut self.slots[self.head])
    }

    fn back(&self) -> Option<&T> {
        (self.len > 0).then(|| &self.slots[self.slot(self.len - 1)])
    }

    fn back_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        let slot = self.slot(self.len - 1);
        Some(&mut self.slots[slot])
    }

    /// 追加到队尾，满时淘汰最旧的一项
    fn push_back(&mut self, value: T) -> Option<T> {
        let evicted = if self.len == MARKER_LIST_CAPACITY {
            self.pop_front()
        } else {
            None
        };
        let slot = self.slot(self.len);
        self.slots[slot] = value;
        self.len += 1;
        evicted
    }

    /// 插入到队头，满时淘汰最新的一项
    fn push_front(&mut self, value: T) -> Option<T> {
        let evicted = if self.len == MARKER_LIST_CAPACITY {
            self.len -= 1;
            Some(self.slots[self.slot(self.len)])
        } else {
            None
        };
        self.head = (self.head + MARKER_LIST_CAPACITY - 1) % MARKER_LIST_CAPACITY;
        self.slots[self.head] = value;
        self.len += 1;
        evicted
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head];
        self.head = (self.head + 1) % MARKER_LIST_CAPACITY;
        self.len -= 1;
        Some(value)
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        for index in 0..self.len {
            let slot = self.slot(index);
            f(&mut self.slots[slot]);
        }
    }
}

fn rebase_offset(offset: usize, old_start: usize, old_end: usize, new_start: usize) -> usize {
    debug_assert!(old_start <= old_end);
    if offset >= old_end {
        new_start + (offset - old_end)
    } else {
        offset
    }
}

/// 只记录偏移的标记表（停止、流结尾）
#[derive(Debug, Clone)]
pub struct MarkerList {
    kind: MarkerKind,
    ring: Ring<usize>,
}

impl MarkerList {
    pub fn new(kind: MarkerKind) -> Self {
        Self { kind, ring: Ring::new() }
    }

    pub fn has_entry(&self) -> bool {
        self.ring.len > 0
    }

    pub fn len(&self) -> usize {
        self.ring.len
    }

    pub fn peek_first(&self) -> Option<usize> {
        self.ring.front().copied()
    }

    pub fn peek_last(&self) -> Option<usize> {
        self.ring.back().copied()
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.ring.pop_front()
    }

    /// 追加标记；与最后一项相同的偏移不重复添加
    pub fn push(&mut self, offset: usize) {
        if self.peek_last() == Some(offset) {
            return;
        }
        if let Some(evicted) = self.ring.push_back(offset) {
            warn!("⚠️ {:?} 标记表已满，丢弃位于 {} 的标记", self.kind, evicted);
        }
    }

    /// 在所有待处理项之前插入停止标记（在当前位置暂停）
    pub fn push_front(&mut self, offset: usize) {
        if self.kind != MarkerKind::Stop {
            warn!("⚠️ {:?} 标记表不支持 push_front，已忽略", self.kind);
            return;
        }
        if self.peek_first() == Some(offset) {
            return;
        }
        if let Some(evicted) = self.ring.push_front(offset) {
            warn!("⚠️ 停止标记表已满，丢弃位于 {} 的标记", evicted);
        }
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// 把偏移不小于 `old_end` 的项移到 `new_start` 之后，跟随回绕的数据
    pub fn rebase(&mut self, old_start: usize, old_end: usize, new_start: usize) {
        self.ring
            .for_each_mut(|offset| *offset = rebase_offset(*offset, old_start, old_end, new_start));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RebaseEntry {
    offset: usize,
    value: u32,
}

/// 每项带有重新起算时钟值的标记表
#[derive(Debug, Clone)]
pub struct ClockRebaseList {
    ring: Ring<RebaseEntry>,
}

impl ClockRebaseList {
    pub fn new() -> Self {
        Self { ring: Ring::new() }
    }

    pub fn has_entry(&self) -> bool {
        self.ring.len > 0
    }

    pub fn len(&self) -> usize {
        self.ring.len
    }

    pub fn peek_first(&self) -> Option<usize> {
        self.ring.front().map(|entry| entry.offset)
    }

    pub fn peek_last(&self) -> Option<usize> {
        self.ring.back().map(|entry| entry.offset)
    }

    /// 队头项的值，不弹出
    pub fn current_value_at_head(&self) -> Option<u32> {
        self.ring.front().map(|entry| entry.value)
    }

    /// 队头标记恰好位于 `offset` 时为 true
    pub fn needs_rebase_at(&self, offset: usize) -> bool {
        self.peek_first() == Some(offset)
    }

    /// 弹出队头项并返回其时钟值
    pub fn pop(&mut self) -> Option<u32> {
        self.ring.pop_front().map(|entry| entry.value)
    }

    /// 追加一个重定基标记。偏移不能减小；
    /// 同一偏移上的第二次重定基会覆盖前一次的值
    pub fn push(&mut self, offset: usize, value: u32) -> bool {
        if let Some(last) = self.ring.back_mut() {
            if offset < last.offset {
                warn!("⚠️ 位于 {} 的时钟重定基被拒绝，落后于 {}", offset, last.offset);
                return false;
            }
            if offset == last.offset {
                last.value = value;
                return true;
            }
        }
        if let Some(evicted) = self.ring.push_back(RebaseEntry { offset, value }) {
            warn!("⚠️ 时钟重定基表已满，丢弃位于 {} 的项", evicted.offset);
        }
        true
    }

    /// 只保留位于 `offset` 的项；没有匹配项时清空并返回 false
    pub fn keep_only(&mut self, offset: usize) -> bool {
        while let Some(entry) = self.ring.front() {
            if entry.offset == offset {
                self.ring.len = 1;
                return true;
            }
            self.ring.pop_front();
        }
        false
    }

    /// 把队头项移到 `offset`，保留其值
    pub fn reset_head_offset(&mut self, offset: usize) {
        if let Some(entry) = self.ring.front_mut() {
            entry.offset = offset;
        }
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn rebase(&mut self, old_start: usize, old_end: usize, new_start: usize) {
        self.ring.for_each_mut(|entry| {
            entry.offset = rebase_offset(entry.offset, old_start, old_end, new_start)
        });
    }
}

impl Default for ClockRebaseList {
    fn default() -> Self {
        Self::new()
    }
}

/// 一条音频流拥有的三张标记表
#[derive(Debug, Clone)]
pub struct AudioMarkers {
    pub stops: MarkerList,
    pub eofs: MarkerList,
    pub rebases: ClockRebaseList,
}

impl AudioMarkers {
    pub fn new() -> Self {
        Self {
            stops: MarkerList::new(MarkerKind::Stop),
            eofs: MarkerList::new(MarkerKind::EndOfStream),
            rebases: ClockRebaseList::new(),
        }
    }

    pub fn clear(&mut self) {
        self.stops.clear();
        self.eofs.clear();
        self.rebases.clear();
    }

    pub fn rebase(&mut self, old_start: usize, old_end: usize, new_start: usize) {
        self.stops.rebase(old_start, old_end, new_start);
        self.eofs.rebase(old_start, old_end, new_start);
        self.rebases.rebase(old_start, old_end, new_start);
    }

    /// 各表的队头偏移，用于限制读指针一次能拷贝多远
    pub fn head_offsets(&self) -> impl Iterator<Item = usize> {
        [self.rebases.peek_first(), self.eofs.peek_first(), self.stops.peek_first()]
            .into_iter()
            .flatten()
    }

    /// 弹出在 `offset` 到期的下一个标记。
    /// 时钟重定基优先，保证上报流结尾时时钟已是最新；停止标记最后处理
    pub fn take_due(&mut self, offset: usize) -> Option<PositionMarker> {
        if self.rebases.needs_rebase_at(offset) {
            let value = self.rebases.pop()?;
            return Some(PositionMarker { offset, payload: MarkerPayload::ClockRebase(value) });
        }
        if self.eofs.peek_first() == Some(offset) {
            self.eofs.pop();
            return Some(PositionMarker { offset, payload: MarkerPayload::EndOfStream });
        }
        if self.stops.peek_first() == Some(offset) {
            self.stops.pop();
            return Some(PositionMarker { offset, payload: MarkerPayload::Stop });
        }
        None
    }
}

impl Default for AudioMarkers {
    fn default() -> Self {
        Self::new()
    }
}
