//! Delta replay against the shadow table.
//!
//! Changes apply strictly in `chg_id` order. A type 1/2 entry re-reads the
//! current source row, so replay is idempotent and safe to run while the
//! copier is still behind; a re-read that finds nothing demotes the entry
//! to a delete (insert-then-delete collapse).

use std::time::{Duration, Instant};

use common::err::osc_error::OscError;
use common::err::OResult;
use common::server::CancelToken;
use common::sql::quote_ident;
use connection::DbSession;
use mysql_async::Value;
use tracing::{debug, info};

use crate::chglog::ChgType;
use crate::progress::ProgressRef;

#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub source: String,
    pub shadow: String,
    pub delta: String,
    pub pk_cols: Vec<String>,
    pub projection: Vec<String>,
    pub batch_size: u64,
}

/// Replay bookkeeping. Sessions are passed in per call: catch-up runs on
/// a worker session, the final replay on the cutover session holding the
/// table locks.
pub struct Replayer {
    plan: ReplayPlan,
    /// 高水位 H, 单调递增
    high_water: u64,
    cancel: CancelToken,
    progress: ProgressRef,
}

impl Replayer {
    pub fn new(plan: ReplayPlan, cancel: CancelToken, progress: ProgressRef) -> Replayer {
        Replayer {
            plan,
            high_water: 0,
            cancel,
            progress,
        }
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Apply up to one batch; returns the number of applied entries.
    pub async fn replay_batch(&mut self, session: &mut DbSession) -> OResult<u64> {
        self.replay_batch_inner(session, true).await
    }

    /// BEGIN would release held table locks, so the batch run inside the
    /// cutover lock window stays in autocommit mode.
    async fn replay_batch_inner(
        &mut self,
        session: &mut DbSession,
        transactional: bool,
    ) -> OResult<u64> {
        let rows = session
            .query_rows(&fetch_sql(&self.plan, self.high_water))
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        if transactional {
            session.begin().await?;
        }
        let mut applied = 0u64;
        for row in rows {
            self.cancel.check()?;
            let values = row.unwrap();
            let (chg_id, chg_type, pk) = decode_entry(&values)?;

            match chg_type {
                ChgType::Insert | ChgType::UpdateNew => {
                    let affected = session.exec(&replace_sql(&self.plan, &pk)).await?;
                    if affected == 0 {
                        // source row is already gone
                        session.exec(&delete_sql(&self.plan, &pk)).await?;
                    }
                }
                ChgType::Delete => {
                    session.exec(&delete_sql(&self.plan, &pk)).await?;
                }
            }

            self.high_water = chg_id;
            applied += 1;
        }

        // consumed entries leave the delta table with the same commit
        session.exec(&purge_sql(&self.plan, self.high_water)).await?;
        if transactional {
            session.commit().await?;
        }

        self.progress.add_replayed(applied);
        debug!("replayed {} entries, H={}", applied, self.high_water);
        Ok(applied)
    }

    /// Unconsumed tail size.
    pub async fn backlog(&self, session: &mut DbSession) -> OResult<u64> {
        let count: Option<u64> = session
            .query_first(&format!(
                "SELECT COUNT(*) FROM {} WHERE `chg_id` > {}",
                quote_ident(&self.plan.delta),
                self.high_water
            ))
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Loop until the tail is within `max_lag` entries or `max_time`
    /// elapses. Returns the remaining backlog.
    pub async fn catch_up(
        &mut self,
        session: &mut DbSession,
        max_lag: u64,
        max_time: Duration,
    ) -> OResult<u64> {
        let deadline = Instant::now() + max_time;
        loop {
            self.cancel.check()?;
            let applied = self.replay_batch(session).await?;
            let backlog = self.backlog(session).await?;
            if backlog <= max_lag {
                return Ok(backlog);
            }
            if Instant::now() >= deadline {
                info!("catch-up deadline reached, backlog {}", backlog);
                return Ok(backlog);
            }
            if applied == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    /// Final replay inside the cutover lock window: bounded rounds, true
    /// when the delta table drained.
    pub async fn drain(&mut self, session: &mut DbSession, rounds: u32) -> OResult<bool> {
        for _ in 0..rounds.max(1) {
            let applied = self.replay_batch_inner(session, false).await?;
            if applied == 0 {
                return Ok(true);
            }
        }
        Ok(self.backlog(session).await? == 0)
    }
}

fn decode_entry(values: &[Value]) -> OResult<(u64, ChgType, Vec<Value>)> {
    if values.len() < 3 {
        return Err(bad_entry("too few columns"));
    }
    let chg_id = match &values[0] {
        Value::UInt(u) => *u,
        Value::Int(i) if *i >= 0 => *i as u64,
        other => return Err(bad_entry(&format!("chg_id {:?}", other))),
    };
    let code = match &values[1] {
        Value::Int(i) => *i as i8,
        Value::UInt(u) => *u as i8,
        other => return Err(bad_entry(&format!("chg_type {:?}", other))),
    };
    let chg_type = ChgType::try_from(code).map_err(|_| bad_entry(&format!("chg_type {}", code)))?;

    // chg_ts is not selected; the tail of the row is the PK tuple
    let pk = values[2..].to_vec();
    Ok((chg_id, chg_type, pk))
}

fn bad_entry(detail: &str) -> OscError {
    OscError::FatalDb {
        code: 0,
        state: String::from("HY000"),
        msg: format!("malformed delta entry: {}", detail),
    }
}

fn pk_list(plan: &ReplayPlan) -> String {
    plan.pk_cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pk_match(plan: &ReplayPlan, pk: &[Value]) -> String {
    plan.pk_cols
        .iter()
        .zip(pk.iter())
        .map(|(col, value)| format!("{} = {}", quote_ident(col), value.as_sql(false)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn fetch_sql(plan: &ReplayPlan, high_water: u64) -> String {
    format!(
        "SELECT `chg_id`, `chg_type`, {} FROM {} WHERE `chg_id` > {} ORDER BY `chg_id` LIMIT {}",
        pk_list(plan),
        quote_ident(&plan.delta),
        high_water,
        plan.batch_size,
    )
}

pub fn replace_sql(plan: &ReplayPlan, pk: &[Value]) -> String {
    let cols = plan
        .projection
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "REPLACE INTO {} ({}) SELECT {} FROM {} WHERE {}",
        quote_ident(&plan.shadow),
        cols,
        cols,
        quote_ident(&plan.source),
        pk_match(plan, pk),
    )
}

pub fn delete_sql(plan: &ReplayPlan, pk: &[Value]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&plan.shadow),
        pk_match(plan, pk),
    )
}

pub fn purge_sql(plan: &ReplayPlan, high_water: u64) -> String {
    format!(
        "DELETE FROM {} WHERE `chg_id` <= {}",
        quote_ident(&plan.delta),
        high_water,
    )
}

#[cfg(test)]
mod test {
    use mysql_async::Value;

    use crate::chglog::ChgType;

    use super::{decode_entry, delete_sql, fetch_sql, purge_sql, replace_sql, ReplayPlan};

    fn plan() -> ReplayPlan {
        ReplayPlan {
            source: String::from("t1"),
            shadow: String::from("_t1_new"),
            delta: String::from("_t1_chg"),
            pk_cols: vec![String::from("id")],
            projection: vec![String::from("id"), String::from("data")],
            batch_size: 500,
        }
    }

    #[test]
    fn test_fetch_sql_orders_by_chg_id() {
        assert_eq!(
            fetch_sql(&plan(), 42),
            "SELECT `chg_id`, `chg_type`, `id` FROM `_t1_chg` WHERE `chg_id` > 42 ORDER BY `chg_id` LIMIT 500"
        );
    }

    #[test]
    fn test_replace_rereads_source() {
        let sql = replace_sql(&plan(), &[Value::Int(7)]);
        assert_eq!(
            sql,
            "REPLACE INTO `_t1_new` (`id`, `data`) SELECT `id`, `data` FROM `t1` WHERE `id` = 7"
        );
    }

    #[test]
    fn test_delete_and_purge() {
        assert_eq!(
            delete_sql(&plan(), &[Value::Int(7)]),
            "DELETE FROM `_t1_new` WHERE `id` = 7"
        );
        assert_eq!(
            purge_sql(&plan(), 99),
            "DELETE FROM `_t1_chg` WHERE `chg_id` <= 99"
        );
    }

    #[test]
    fn test_decode_entry() {
        let (chg_id, chg_type, pk) =
            decode_entry(&[Value::UInt(12), Value::Int(3), Value::Int(7)]).unwrap();
        assert_eq!(chg_id, 12);
        assert_eq!(chg_type, ChgType::Delete);
        assert_eq!(pk, vec![Value::Int(7)]);

        assert!(decode_entry(&[Value::UInt(1), Value::Int(9), Value::Int(7)]).is_err());
        assert!(decode_entry(&[Value::UInt(1)]).is_err());
    }

    #[test]
    fn test_string_pk_is_quoted() {
        let mut p = plan();
        p.pk_cols = vec![String::from("data")];
        let sql = delete_sql(&p, &[Value::Bytes(b"a'11".to_vec())]);
        assert_eq!(sql, "DELETE FROM `_t1_new` WHERE `data` = 'a\\'11'");
    }
}
