//! 退避策略
//!
//! 指数退避 `min(max, base * 2^retry)`，再叠加可替换的抖动。
//!
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// 第 `retry_count` 次失败后的基础延迟（未加抖动）
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// 抖动策略：在基础延迟上加减随机量，避免多个实例同时重试
pub trait BackoffJitter: Send + Sync {
    fn jittered(&self, delay: Duration) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl BackoffJitter for NoJitter {
    fn jittered(&self, delay: Duration) -> Duration {
        delay
    }
}

/// 在 `delay * (1 ± ratio)` 内均匀取值，结果不会为负
#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    ratio: f64,
}

impl RandomJitter {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl BackoffJitter for RandomJitter {
    fn jittered(&self, delay: Duration) -> Duration {
        if self.ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.ratio)..=(1.0 + self.ratio));
        delay.mul_f64(factor)
    }
}
