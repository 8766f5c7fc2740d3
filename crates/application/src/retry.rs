use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

#[derive(Clone, Debug)]
pub enum Backoff {
    /// 指数退避：`base * 2^(attempt-1)`，不超过 `max`；`jitter` 时在 [delay/2, delay] 内随机
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            base,
            max: max.max(base),
            jitter: false,
        }
    }

    pub fn with_jitter(self) -> Self {
        match self {
            Backoff::Exponential { base, max, .. } => Backoff::Exponential {
                base,
                max,
                jitter: true,
            },
        }
    }

    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max, jitter } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                let delay = base.saturating_mul(factor).min(*max);
                if *jitter && !delay.is_zero() {
                    let millis = delay.as_millis() as u64;
                    let half = millis / 2;
                    Duration::from_millis(rand::rng().random_range(half..=millis))
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// 按策略重试异步操作，`retryable` 返回 false 的错误立即返回
pub async fn retry_async<F, Fut, T, E, R>(policy: &RetryPolicy, retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts || !retryable(&e) {
                    return Err(e);
                }
                let delay = policy.backoff.delay_at(attempt);
                sleep(delay).await;
            }
        }
    }
}
