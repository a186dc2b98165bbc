use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// 进程级令牌桶。
///
/// 每个被消耗的令牌在消耗时刻之后一个窗口才归还，因此任意长度为一个窗口的
/// 时间段内放行的请求数不会超过容量。补充只依据单调时钟的流逝时间计算，
/// 不依赖定时器。
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    retry_delay: Duration,
    spent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration, retry_delay: Duration) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            capacity,
            window,
            retry_delay,
            spent: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1), Duration::from_millis(100))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut spent, now);
        if spent.len() < self.capacity {
            spent.push_back(now);
            true
        } else {
            false
        }
    }

    /// 无令牌时等待一次 retry_delay 后重试；仍失败则返回 false，由调用方按限流处理
    pub async fn acquire(&self) -> bool {
        if self.try_acquire() {
            return true;
        }
        sleep(self.retry_delay).await;
        self.try_acquire()
    }

    pub fn available(&self) -> usize {
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut spent, Instant::now());
        self.capacity - spent.len()
    }

    fn refill(&self, spent: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = spent.front() {
            if now.duration_since(*oldest) >= self.window {
                spent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_capacity() {
        let limiter = RateLimiter::per_second(10);

        for _ in 0..10 {
            assert!(limiter.acquire().await);
        }
        assert_eq!(limiter.available(), 0);

        // 重试一次（100ms）后仍无令牌
        let started = Instant::now();
        assert!(!limiter.acquire().await);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_return_after_window() {
        let limiter = RateLimiter::per_second(2);
        assert!(limiter.try_acquire());
        sleep(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(limiter.available(), 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_picks_up_returned_token() {
        let limiter = RateLimiter::per_second(1);
        assert!(limiter.try_acquire());
        sleep(Duration::from_millis(950)).await;
        assert!(limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_capacity() {
        let limiter = Arc::new(RateLimiter::per_second(10));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_never_exceeds_capacity() {
        let limiter = RateLimiter::per_second(10);
        let start = Instant::now();
        let mut admitted = Vec::new();

        for step in 0..200u64 {
            // 不均匀的请求节奏
            for _ in 0..(step % 7) {
                if limiter.try_acquire() {
                    admitted.push(start.elapsed());
                }
            }
            sleep(Duration::from_millis(37)).await;
        }

        assert!(admitted.len() > 10);
        for (i, t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|u| **u < *t + Duration::from_secs(1))
                .count();
            assert!(in_window <= 10, "{} requests within one second of {:?}", in_window, t);
        }
    }
}
