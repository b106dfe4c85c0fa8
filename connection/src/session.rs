use common::err::osc_error::OscError;
use common::err::OResult;
use common::sql::quote_ident;
use mysql_async::prelude::*;
use mysql_async::{Conn, Params, QueryResult, Row, TextProtocol};
use tracing::{debug, instrument};

use crate::session_options::SessionOptions;

/// What a session is opened for; decides the session variables set at
/// connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPurpose {
    /// DDL, metadata reads, delta bookkeeping.
    Control,
    /// Chunk select + LOAD DATA sessions.
    Load,
    /// 增量回放会话
    Replay,
    /// The session that takes the cutover locks.
    Cutover,
    /// Side session used for KILL QUERY.
    Side,
}

impl SessionPurpose {
    fn tag(&self) -> &'static str {
        match self {
            SessionPurpose::Control => "control",
            SessionPurpose::Load => "load",
            SessionPurpose::Replay => "replay",
            SessionPurpose::Cutover => "cutover",
            SessionPurpose::Side => "side",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LockMode {
    Read,
    Write,
}

/// Thin typed execution surface over one MySQL connection.
///
/// Each worker owns its own session; a session is never shared between
/// tasks. The connection thread id is kept so a side session can target
/// this one with KILL QUERY.
pub struct DbSession {
    conn: Conn,
    purpose: SessionPurpose,
    thread_id: u32,
    in_transaction: bool,
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSession")
            .field("purpose", &self.purpose)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl DbSession {
    #[instrument(skip(options))]
    pub async fn connect(options: &SessionOptions, purpose: SessionPurpose) -> OResult<DbSession> {
        let conn = Conn::new(options.to_opts()).await?;
        let thread_id = conn.id();

        let mut session = DbSession {
            conn,
            purpose,
            thread_id,
            in_transaction: false,
        };
        session.harden().await?;

        debug!(
            "[{}] connected, thread_id={}",
            purpose.tag(),
            session.thread_id
        );
        Ok(session)
    }

    /// Session variables per purpose. NO_AUTO_VALUE_ON_ZERO keeps
    /// explicit zero auto-increment values stable across the copy.
    async fn harden(&mut self) -> OResult<()> {
        self.exec("SET SESSION sql_mode = 'NO_AUTO_VALUE_ON_ZERO,STRICT_ALL_TABLES'")
            .await?;
        match self.purpose {
            SessionPurpose::Load | SessionPurpose::Replay => {
                self.exec("SET SESSION foreign_key_checks = 0").await?;
                self.exec("SET SESSION unique_checks = 1").await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn purpose(&self) -> SessionPurpose {
        self.purpose
    }

    /// Centralized identifier interpolation.
    pub fn quote(&self, name: &str) -> String {
        quote_ident(name)
    }

    /// Execute a statement, returning rows affected.
    pub async fn exec(&mut self, stmt: &str) -> OResult<u64> {
        debug!("[{}] exec: {}", self.purpose.tag(), stmt);
        self.conn.query_drop(stmt).await?;
        Ok(self.conn.affected_rows())
    }

    /// Execute with positional parameters.
    pub async fn exec_params<P>(&mut self, stmt: &str, params: P) -> OResult<u64>
    where
        P: Into<Params> + Send,
    {
        debug!("[{}] exec: {}", self.purpose.tag(), stmt);
        self.conn.exec_drop(stmt, params).await?;
        Ok(self.conn.affected_rows())
    }

    /// Buffered query.
    pub async fn query_rows(&mut self, stmt: &str) -> OResult<Vec<Row>> {
        debug!("[{}] query: {}", self.purpose.tag(), stmt);
        let rows = self.conn.query(stmt).await?;
        Ok(rows)
    }

    pub async fn query_rows_params<P>(&mut self, stmt: &str, params: P) -> OResult<Vec<Row>>
    where
        P: Into<Params> + Send,
    {
        debug!("[{}] query: {}", self.purpose.tag(), stmt);
        let rows = self.conn.exec(stmt, params).await?;
        Ok(rows)
    }

    pub async fn query_first<T>(&mut self, stmt: &str) -> OResult<Option<T>>
    where
        T: FromRow + Send + 'static,
    {
        debug!("[{}] query: {}", self.purpose.tag(), stmt);
        let row = self.conn.query_first(stmt).await?;
        Ok(row)
    }

    /// 流式查询, 行由调用方逐条消费
    pub async fn query_stream<'a>(
        &'a mut self,
        stmt: &str,
    ) -> OResult<QueryResult<'a, 'static, TextProtocol>> {
        debug!("[{}] stream: {}", self.purpose.tag(), stmt);
        let result = self.conn.query_iter(stmt.to_string()).await?;
        Ok(result)
    }

    /// Session system variable.
    pub async fn var(&mut self, name: &str) -> OResult<Option<String>> {
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(OscError::FatalDb {
                code: 0,
                state: String::from("HY000"),
                msg: format!("bad variable name {:?}", name),
            });
        }
        let row: Option<(String, String)> = self
            .query_first(&format!("SHOW VARIABLES LIKE '{}'", name))
            .await?;
        Ok(row.map(|(_, value)| value))
    }

    /// Global status counter (Threads_running and friends).
    pub async fn global_status(&mut self, name: &str) -> OResult<Option<String>> {
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(OscError::FatalDb {
                code: 0,
                state: String::from("HY000"),
                msg: format!("bad status name {:?}", name),
            });
        }
        let row: Option<(String, String)> = self
            .query_first(&format!("SHOW GLOBAL STATUS LIKE '{}'", name))
            .await?;
        Ok(row.map(|(_, value)| value))
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub async fn begin(&mut self) -> OResult<()> {
        self.exec("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> OResult<()> {
        self.exec("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> OResult<()> {
        self.exec("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn set_lock_wait_timeout(&mut self, secs: u64) -> OResult<()> {
        self.exec(&format!("SET SESSION lock_wait_timeout = {}", secs))
            .await?;
        self.exec(&format!("SET SESSION innodb_lock_wait_timeout = {}", secs))
            .await?;
        Ok(())
    }

    pub async fn lock_tables(&mut self, specs: &[(String, LockMode)]) -> OResult<()> {
        let stmt = render_lock_tables(specs);
        self.exec(&stmt).await?;
        Ok(())
    }

    pub async fn unlock_tables(&mut self) -> OResult<()> {
        self.exec("UNLOCK TABLES").await?;
        Ok(())
    }

    /// Abort the statement currently running on another connection.
    pub async fn kill_query(&mut self, thread_id: u32) -> OResult<()> {
        self.exec(&format!("KILL QUERY {}", thread_id)).await?;
        Ok(())
    }

    pub async fn disconnect(self) -> OResult<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

/// Build the statements the cutover issues, kept here so the lock
/// surface stays next to the session that runs it.
pub fn render_lock_tables(specs: &[(String, LockMode)]) -> String {
    let parts: Vec<String> = specs
        .iter()
        .map(|(table, mode)| {
            let mode = match mode {
                LockMode::Read => "READ",
                LockMode::Write => "WRITE",
            };
            format!("{} {}", quote_ident(table), mode)
        })
        .collect();
    format!("LOCK TABLES {}", parts.join(", "))
}

#[cfg(test)]
mod test {
    use super::{render_lock_tables, LockMode};

    #[test]
    fn test_render_lock_tables() {
        let stmt = render_lock_tables(&[
            (String::from("t1"), LockMode::Write),
            (String::from("_t1_new"), LockMode::Write),
        ]);
        assert_eq!(stmt, "LOCK TABLES `t1` WRITE, `_t1_new` WRITE");
    }
}
