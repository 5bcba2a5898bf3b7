use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};

/// 截止时间是否已过
pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// 从 `start` 开始的单次外部调用时限，取超时时间和截止时间中较早者
pub(crate) fn call_limit(start: Instant, timeout: Duration, deadline: Option<Instant>) -> Instant {
    let limit = start + timeout;
    match deadline {
        Some(deadline) if deadline < limit => deadline,
        _ => limit,
    }
}

/// 在时限内执行一次外部调用，超时则用 `on_timeout` 构造对应类型的错误
pub(crate) async fn bounded<T, E, F>(
    fut: F,
    timeout: Duration,
    deadline: Option<Instant>,
    on_timeout: fn(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let limit = call_limit(start, timeout, deadline);
    match timeout_at(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit.saturating_duration_since(start))),
    }
}
