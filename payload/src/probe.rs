//! Health probe consulted between chunks, plus the shared backoff.

use std::time::Duration;

use common::err::OResult;
use connection::DbSession;
use mysql_async::Row;
use tracing::debug;

/// 限流阈值
#[derive(Debug, Clone)]
pub struct ProbeLimits {
    /// Threads_running above this is considered overload.
    pub max_threads_running: u64,

    /// Replica lag in seconds; ignored when the server is not a replica.
    pub max_replica_lag: u64,

    /// 1-minute load average cap; 0 disables the check.
    pub max_load_avg: f64,
}

impl Default for ProbeLimits {
    fn default() -> Self {
        ProbeLimits {
            max_threads_running: 50,
            max_replica_lag: 30,
            max_load_avg: 0.0,
        }
    }
}

/// Pluggable throttling decision.
#[async_trait::async_trait]
pub trait HealthProbe: Send {
    /// false 表示需要退避
    async fn healthy(&mut self) -> OResult<bool>;
}

/// Reads server counters through its own session.
pub struct ServerHealthProbe {
    session: DbSession,
    limits: ProbeLimits,
}

impl ServerHealthProbe {
    pub fn new(session: DbSession, limits: ProbeLimits) -> Self {
        ServerHealthProbe { session, limits }
    }
}

#[async_trait::async_trait]
impl HealthProbe for ServerHealthProbe {
    async fn healthy(&mut self) -> OResult<bool> {
        if let Some(value) = self.session.global_status("Threads_running").await? {
            if let Ok(threads) = value.parse::<u64>() {
                if threads > self.limits.max_threads_running {
                    debug!("throttling: Threads_running={}", threads);
                    return Ok(false);
                }
            }
        }

        // replica lag, when this server replicates from elsewhere.
        // 8.0.22 起叫 REPLICA, 旧版本回退到 SLAVE 写法
        let replica: Option<Row> = match self.session.query_first("SHOW REPLICA STATUS").await {
            Ok(row) => row,
            Err(_) => self
                .session
                .query_first("SHOW SLAVE STATUS")
                .await
                .unwrap_or(None),
        };
        if let Some(row) = replica {
            let lag: Option<u64> = row
                .get("Seconds_Behind_Source")
                .or_else(|| row.get("Seconds_Behind_Master"))
                .flatten();
            if let Some(lag) = lag {
                if lag > self.limits.max_replica_lag {
                    debug!("throttling: replica lag {}s", lag);
                    return Ok(false);
                }
            }
        }

        if self.limits.max_load_avg > 0.0 {
            if let Some(load) = read_load_avg() {
                if load > self.limits.max_load_avg {
                    debug!("throttling: load average {}", load);
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

/// Probe that never throttles; used by tests.
pub struct NoopProbe;

#[async_trait::async_trait]
impl HealthProbe for NoopProbe {
    async fn healthy(&mut self) -> OResult<bool> {
        Ok(true)
    }
}

fn read_load_avg() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse::<f64>().ok()
}

/// Exponential backoff with a cap; shared by the throttle and the
/// transient-error retry paths.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Backoff {
        Backoff {
            base_ms,
            cap_ms,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64 << self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(exp.min(self.cap_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Backoff;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut b = Backoff::new(100, 1000);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(800));
        assert_eq!(b.next_delay(), Duration::from_millis(1000));
        assert_eq!(b.next_delay(), Duration::from_millis(1000));

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }
}
