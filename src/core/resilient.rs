//! 弹性调用：全局并发闸门 + 限流感知的重试退避
//!
//! 所有出站调用（模型调用）共享同一个 Semaphore，同时在途的调用数不超过 N，超出者挂起等待许可。
//! 失败时按 ProviderErrorKind 分类：限流则优先使用 Provider 给出的等待时间（结构化字段或消息中的
//! "try again in 250ms" / "retry in 1.5s"），否则 `base * 2^attempt + jitter[0,1)`；其余错误直接返回。
//! 许可只在单次尝试期间持有，退避睡眠时释放。

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::Semaphore;

use crate::core::{CallError, ProviderError, ProviderErrorKind};

/// 重试配置
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    /// 指数退避基数
    pub base_delay: Duration,
    /// 单次尝试超时；None 表示不限
    pub timeout: Option<Duration>,
    /// 超时是否视为可重试（默认否）
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            timeout: None,
            retry_on_timeout: false,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }
}

/// 弹性调用器：Clone 后共享同一个并发闸门
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    gate: Arc<Semaphore>,
    max_concurrent: usize,
    config: RetryConfig,
}

impl ResilientCaller {
    pub fn new(max_concurrent: usize, config: RetryConfig) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            gate: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            config,
        }
    }

    /// 使用不同的重试配置（如调用方自带超时），但共享同一个闸门
    pub fn with_config(&self, config: RetryConfig) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            max_concurrent: self.max_concurrent,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前空闲许可数
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    /// 在闸门与重试策略下执行 op；成功返回 (结果, 实际尝试次数)
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<(T, u32), CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let outcome = {
                // 闸门只在此处使用且从不关闭
                let _permit = self.gate.acquire().await.map_err(|_| {
                    CallError::Provider(ProviderError::new(ProviderErrorKind::Other, "admission gate closed"))
                })?;
                match self.config.timeout {
                    Some(limit) => match tokio::time::timeout(limit, op()).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::timeout(format!(
                            "{label} timed out after {}ms",
                            limit.as_millis()
                        ))),
                    },
                    None => op().await,
                }
            };
            attempt += 1;

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(call = label, attempts = attempt, "recovered after retries");
                    }
                    return Ok((value, attempt));
                }
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                tracing::debug!(call = label, kind = ?err.kind, "non-retryable provider error");
                return Err(CallError::Provider(err));
            }

            if attempt >= max_attempts {
                tracing::warn!(call = label, attempts = attempt, "giving up: {}", err);
                return Err(CallError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let wait = retry_wait(&err, attempt - 1, self.config.base_delay);
            tracing::warn!(
                call = label,
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                "provider throttled, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }

    fn is_retryable(&self, err: &ProviderError) -> bool {
        match err.kind {
            ProviderErrorKind::Throttled => true,
            ProviderErrorKind::Timeout => self.config.retry_on_timeout,
            _ => false,
        }
    }
}

impl Default for ResilientCaller {
    fn default() -> Self {
        Self::new(5, RetryConfig::default())
    }
}

/// 单次退避等待的上限；Provider 给出的更长等待也按此截断
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(300);

/// 计算第 attempt 次（从 0 计）失败后的等待时间
pub fn retry_wait(err: &ProviderError, attempt: u32, base_delay: Duration) -> Duration {
    err.retry_after
        .or_else(|| parse_retry_hint(&err.message))
        .unwrap_or_else(|| backoff_delay(base_delay, attempt, rand::random::<f64>()))
        .min(MAX_RETRY_WAIT)
}

/// 指数退避：base * 2^attempt + jitter，jitter 取 [0, 1) 秒；不超过 MAX_RETRY_WAIT
pub fn backoff_delay(base_delay: Duration, attempt: u32, jitter: f64) -> Duration {
    let factor = 2f64.powi(attempt.min(20) as i32);
    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
    capped_secs(base_delay.as_secs_f64() * factor + jitter)
}

/// 秒数转 Duration；溢出 / 非有限值按上限处理，负值视为 0
fn capped_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_RETRY_WAIT)
        .min(MAX_RETRY_WAIT)
}

static RETRY_HINT_RE: OnceLock<Regex> = OnceLock::new();

/// 从限流消息中提取建议等待时间，如 "Please try again in 250ms" / "retry in 1.5s"
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let re = RETRY_HINT_RE.get_or_init(|| {
        Regex::new(r"(?i)(?:try again|retry) in (\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s)\b")
            .expect("retry hint pattern is valid")
    });
    let caps = re.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    let secs = if unit.starts_with('m') { value / 1000.0 } else { value };
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(capped_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn test_parse_retry_hint_ms() {
        let wait = parse_retry_hint("Rate limit reached. Please try again in 250ms.").unwrap();
        assert!((wait.as_secs_f64() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_parse_retry_hint_seconds() {
        let wait = parse_retry_hint("429: retry in 1.5s").unwrap();
        assert!((wait.as_secs_f64() - 1.5).abs() < 1e-9);
        let wait = parse_retry_hint("Please try again in 20 seconds").unwrap();
        assert_eq!(wait, Duration::from_secs(20));
    }

    #[test]
    fn test_parse_retry_hint_absent() {
        assert!(parse_retry_hint("rate limit exceeded").is_none());
    }

    #[test]
    fn test_huge_hint_is_capped() {
        let message = "Rate limit reached. Please try again in 99999999999999999999999s.";
        assert_eq!(parse_retry_hint(message), Some(MAX_RETRY_WAIT));
        let err = ProviderError::throttled(message);
        assert_eq!(retry_wait(&err, 0, Duration::from_secs(1)), MAX_RETRY_WAIT);

        let err = ProviderError::throttled("rate limit").with_retry_after(Duration::MAX);
        assert_eq!(retry_wait(&err, 0, Duration::from_secs(1)), MAX_RETRY_WAIT);
    }

    #[test]
    fn test_backoff_with_huge_base_is_capped() {
        assert_eq!(backoff_delay(Duration::MAX, 20, 0.5), MAX_RETRY_WAIT);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX / 2), 0, 0.0), MAX_RETRY_WAIT);
    }

    #[test]
    fn test_retry_wait_prefers_hint_then_structured() {
        let err = ProviderError::throttled("Rate limit: try again in 250ms");
        let wait = retry_wait(&err, 3, Duration::from_secs(1));
        assert!((wait.as_secs_f64() - 0.25).abs() < 1e-9);

        let err = ProviderError::throttled("rate limit").with_retry_after(Duration::from_millis(700));
        assert_eq!(retry_wait(&err, 0, Duration::from_secs(1)), Duration::from_millis(700));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let base = Duration::from_secs(1);
        for attempt in 0..5 {
            // 最坏抖动下的当前值仍小于最好抖动下的下一次
            let worst_now = backoff_delay(base, attempt, 0.999);
            let best_next = backoff_delay(base, attempt + 1, 0.0);
            assert!(worst_now < best_next);
        }
        let waits: Vec<f64> = (0..4)
            .map(|a| retry_wait(&ProviderError::throttled("rate limit"), a, base).as_secs_f64())
            .collect();
        assert!(waits.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_throttled_until_success() {
        let caller = ResilientCaller::new(2, RetryConfig::default());
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let (value, attempts) = caller
            .call("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::throttled("Rate limit. Please try again in 250ms."))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
        let elapsed = start.elapsed().as_secs_f64();
        assert!((elapsed - 0.5).abs() < 0.01, "elapsed {elapsed}");
    }

    #[tokio::test]
    async fn test_non_throttled_error_not_retried() {
        let caller = ResilientCaller::new(2, RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result: Result<(u32, u32), CallError> = caller
            .call("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::new(ProviderErrorKind::Auth, "401 Unauthorized")) }
            })
            .await;

        assert!(matches!(result, Err(CallError::Provider(ref e)) if e.kind == ProviderErrorKind::Auth));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_attempts() {
        let caller = ResilientCaller::new(1, RetryConfig::default().with_max_attempts(3));
        let calls = AtomicU32::new(0);

        let result: Result<((), u32), CallError> = caller
            .call("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::throttled("429 rate limit")) }
            })
            .await;

        match result {
            Err(CallError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_throttled());
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried_by_default() {
        let config = RetryConfig::default().with_timeout(Duration::from_millis(100));
        let caller = ResilientCaller::new(1, config.clone());
        let calls = AtomicU32::new(0);

        let result: Result<((), u32), CallError> = caller
            .call("slow", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(CallError::Provider(ref e)) if e.kind == ProviderErrorKind::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let retrying = caller.with_config(config.with_retry_on_timeout(true).with_max_attempts(2));
        let result: Result<((), u32), CallError> = retrying
            .call("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CallError::Exhausted { attempts: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_gate_bounds_in_flight_calls() {
        let caller = ResilientCaller::new(2, RetryConfig::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let caller = caller.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                caller
                    .call("gated", || {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, ProviderError>(i)
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(caller.available_permits(), 2);
    }
}
