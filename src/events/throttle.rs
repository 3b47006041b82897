// 计数事件节流器
//
// 高频入队/完成会产生大量计数变化，对外最多每个间隔发出一次，
// 间隔内的变化合并为最新值，待发值在下一次轮询时补发

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 单调毫秒时钟
///
/// 注入虚拟时钟以便在测试里直接推进时间
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// 基于 `Instant` 的系统时钟
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// 手动推进的时钟（测试用）
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct CoalescerState<T> {
    /// 上次放行时间；None 表示从未放行，首个值立即放行
    last_emit_ms: Option<u64>,
    pending: Option<T>,
}

/// 合并节流器
///
/// `offer` 在间隔已满时放行输入值，否则暂存（覆盖旧暂存值）；
/// `poll` 在间隔已满时放行暂存值
pub struct Coalescer<T> {
    interval_ms: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<CoalescerState<T>>,
}

impl<T> Coalescer<T> {
    pub fn new(interval_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval_ms,
            clock,
            state: Mutex::new(CoalescerState {
                last_emit_ms: None,
                pending: None,
            }),
        }
    }

    fn due(&self, state: &CoalescerState<T>, now: u64) -> bool {
        match state.last_emit_ms {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_ms,
        }
    }

    /// 提交一个值；间隔已满时立即放行，否则暂存
    pub fn offer(&self, value: T) -> Option<T> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if self.due(&state, now) {
            state.last_emit_ms = Some(now);
            state.pending = None;
            Some(value)
        } else {
            state.pending = Some(value);
            None
        }
    }

    /// 间隔已满时放行暂存值
    pub fn poll(&self) -> Option<T> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if state.pending.is_some() && self.due(&state, now) {
            state.last_emit_ms = Some(now);
            state.pending.take()
        } else {
            None
        }
    }

    /// 无条件放行暂存值（队列关闭前清空用）
    pub fn flush(&self) -> Option<T> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.pending.is_some() {
            state.last_emit_ms = Some(now);
        }
        state.pending.take()
    }
}
