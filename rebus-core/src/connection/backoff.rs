use std::time::Duration;

/// 单次重连周期内的指数退避：`first * factor^(attempt-1)`，不超过 `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    /// 2s, 4s, 8s ... 上限 30s
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(first: Duration, factor: f64, max: Duration) -> Self {
        Self { first, factor, max }
    }

    /// 不退避（立即重试）
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// 第 `attempt` 次失败之后的等待时长（attempt 从 1 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let secs = self.first.as_secs_f64() * factor.powi(exp);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }
}
