//! # 滑动窗口限流
//!
//! 60 秒滚动窗口内记录放行时间戳，rps 与 rpm 两个维度独立限制，0 表示该维度不限。
//! 清理、判断、记录在同一把锁内完成。

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 窗口长度
pub const WINDOW: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// 单桶滑动窗口限流器
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_rps: u32,
    max_rpm: u32,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// 创建限流器
    #[must_use]
    pub const fn new(max_rps: u32, max_rpm: u32) -> Self {
        Self {
            max_rps,
            max_rpm,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// 两个维度都不限时为 true
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_rps == 0 && self.max_rpm == 0
    }

    /// 尝试放行一次请求
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// 以指定时间尝试放行
    pub fn allow_at(&self, now: Instant) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while admitted
            .front()
            .is_some_and(|&stamp| now.saturating_duration_since(stamp) > WINDOW)
        {
            admitted.pop_front();
        }

        if self.max_rpm > 0 && admitted.len() >= self.max_rpm as usize {
            return false;
        }
        if self.max_rps > 0 {
            let last_second = admitted
                .iter()
                .rev()
                .take_while(|&&stamp| now.saturating_duration_since(stamp) <= SECOND)
                .count();
            if last_second >= self.max_rps as usize {
                return false;
            }
        }

        admitted.push_back(now);
        true
    }
}

/// 按标签分桶的限流器，每个标签独立使用同一算法
#[derive(Debug)]
pub struct KeyedRateLimiter {
    max_rps: u32,
    max_rpm: u32,
    buckets: DashMap<String, SlidingWindowLimiter>,
}

impl KeyedRateLimiter {
    /// 创建限流器
    #[must_use]
    pub fn new(max_rps: u32, max_rpm: u32) -> Self {
        Self {
            max_rps,
            max_rpm,
            buckets: DashMap::new(),
        }
    }

    /// 尝试为标签放行一次请求
    pub fn allow(&self, label: &str) -> bool {
        self.allow_at(label, Instant::now())
    }

    /// 以指定时间尝试放行
    pub fn allow_at(&self, label: &str, now: Instant) -> bool {
        if self.max_rps == 0 && self.max_rpm == 0 {
            return true;
        }
        if let Some(bucket) = self.buckets.get(label) {
            return bucket.allow_at(now);
        }
        self.buckets
            .entry(label.to_string())
            .or_insert_with(|| SlidingWindowLimiter::new(self.max_rps, self.max_rpm))
            .allow_at(now)
    }

    /// 已创建的桶数量
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_cap_rejects_exactly_the_next_call() {
        let limiter = SlidingWindowLimiter::new(0, 3);
        let start = Instant::now();
        let results: Vec<bool> = (0..5)
            .map(|i| limiter.allow_at(start + Duration::from_secs(i * 2)))
            .collect();
        assert_eq!(results, vec![true, true, true, false, false]);
        assert!(limiter.allow_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn concurrent_callers_never_exceed_the_cap() {
        let limiter = SlidingWindowLimiter::new(0, 50);
        let keyed = KeyedRateLimiter::new(0, 5);
        let (admitted, keyed_admitted) = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let global = (0..20).filter(|_| limiter.allow()).count();
                        let per_key = (0..20).filter(|_| keyed.allow("shared")).count();
                        (global, per_key)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .fold((0, 0), |(a, b), (x, y)| (a + x, b + y))
        });
        assert_eq!(admitted, 50);
        assert_eq!(keyed_admitted, 5);
        assert_eq!(keyed.bucket_count(), 1);
    }

    #[test]
    fn rps_cap_only_counts_last_second() {
        let limiter = SlidingWindowLimiter::new(2, 0);
        let start = Instant::now();
        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start + Duration::from_millis(100)));
        assert!(!limiter.allow_at(start + Duration::from_millis(200)));
        assert!(limiter.allow_at(start + Duration::from_millis(1500)));
    }

    #[test]
    fn zero_caps_are_unlimited() {
        let limiter = SlidingWindowLimiter::new(0, 0);
        assert!((0..1000).all(|_| limiter.allow()));
        let keyed = KeyedRateLimiter::new(0, 0);
        assert!(keyed.allow("a"));
        assert_eq!(keyed.bucket_count(), 0);
    }

    #[test]
    fn keyed_buckets_are_independent() {
        let keyed = KeyedRateLimiter::new(0, 1);
        let now = Instant::now();
        assert!(keyed.allow_at("a", now));
        assert!(!keyed.allow_at("a", now));
        assert!(keyed.allow_at("b", now));
        assert_eq!(keyed.bucket_count(), 2);
    }
}
