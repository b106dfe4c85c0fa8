//! Chunked copy of the source table into the shadow table.
//!
//! PK-ordered ranges are dumped `INTO OUTFILE` and loaded back with
//! `LOAD DATA INFILE ... CHARACTER SET binary`, one short transaction per
//! chunk. Rows that change after their chunk was dumped are reconciled by
//! the replayer.

use std::path::{Path, PathBuf};
use std::time::Instant;

use common::err::osc_error::OscError;
use common::err::OResult;
use common::pretty_util::{to_bytes_len_pretty, to_duration_pretty};
use common::server::CancelToken;
use common::sql::{quote_ident, quote_string};
use connection::DbSession;
use mysql_async::Value;
use tracing::{debug, info, warn};

use crate::hooks::{HookPoint, Hooks};
use crate::idents::SessionIdents;
use crate::probe::{Backoff, HealthProbe};
use crate::progress::ProgressRef;

/// Outfile compression, applied between dump and load.
#[derive(Debug, Clone)]
pub struct Compression {
    /// Filter command reading stdin, writing stdout; `-d` must invert it.
    pub command: String,
    pub extension: String,
}

/// Immutable inputs of one copy run.
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub source: String,
    pub shadow: String,
    pub pk_cols: Vec<String>,
    pub projection: Vec<String>,
    pub chunk_size: u64,
    pub additional_where: Option<String>,
    pub eliminate_dups: bool,
    pub skip_affected_rows_check: bool,
    pub compression: Option<Compression>,
    pub max_chunk_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

pub struct ChunkCopier {
    session: DbSession,
    plan: CopyPlan,
    idents: SessionIdents,
    probe: Box<dyn HealthProbe>,
    cancel: CancelToken,
    progress: ProgressRef,
    hooks: Hooks,
}

impl ChunkCopier {
    pub fn new(
        session: DbSession,
        plan: CopyPlan,
        idents: SessionIdents,
        probe: Box<dyn HealthProbe>,
        cancel: CancelToken,
        progress: ProgressRef,
        hooks: Hooks,
    ) -> ChunkCopier {
        ChunkCopier {
            session,
            plan,
            idents,
            probe,
            cancel,
            progress,
            hooks,
        }
    }

    pub async fn run(mut self) -> OResult<()> {
        let started = Instant::now();
        // 每个 chunk 的 SELECT 在自身快照下执行
        self.session
            .exec("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await?;

        let mut throttle = Backoff::new(self.plan.backoff_base_ms, self.plan.backoff_cap_ms);
        let mut chunk_no = 0u64;

        loop {
            self.cancel.check()?;
            self.throttle(&mut throttle).await?;

            let lower = self.progress.last_pk();
            let upper = self.chunk_boundary(&lower).await?;
            let outfile = self.idents.outfile(chunk_no);

            let rows = self.copy_chunk_with_retry(&lower, &upper, &outfile).await?;
            debug!("chunk {} copied, {} rows", chunk_no, rows);

            match upper {
                Some(bound) => self.progress.set_last_pk(bound),
                None => {
                    // final, open-ended chunk
                    self.progress.set_copy_done();
                    break;
                }
            }
            chunk_no += 1;
        }

        info!(
            "copy finished: {} rows in {} chunks, {} in {}",
            self.progress.copied_rows(),
            self.progress.chunks(),
            to_bytes_len_pretty(self.progress.copied_bytes() as usize),
            to_duration_pretty(&started.elapsed()),
        );
        Ok(())
    }

    async fn throttle(&mut self, backoff: &mut Backoff) -> OResult<()> {
        loop {
            if self.probe.healthy().await? {
                backoff.reset();
                return Ok(());
            }
            let delay = backoff.next_delay();
            info!("server busy, backing off {}", to_duration_pretty(&delay));
            tokio::time::sleep(delay).await;
            self.cancel.check()?;
        }
    }

    /// PK of the chunk_size-th row past the lower bound, None for the
    /// final chunk.
    async fn chunk_boundary(&mut self, lower: &Option<Vec<Value>>) -> OResult<Option<Vec<Value>>> {
        let sql = boundary_sql(&self.plan, lower);
        let rows = self.session.query_rows(&sql).await?;
        Ok(rows.into_iter().next().map(|row| row.unwrap()))
    }

    async fn copy_chunk_with_retry(
        &mut self,
        lower: &Option<Vec<Value>>,
        upper: &Option<Vec<Value>>,
        outfile: &Path,
    ) -> OResult<u64> {
        let mut backoff = Backoff::new(self.plan.backoff_base_ms, self.plan.backoff_cap_ms);
        loop {
            match self.copy_chunk(lower, upper, outfile).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_transient() && backoff.attempts() < self.plan.max_chunk_retries => {
                    warn!("chunk copy failed, retrying: {}", err);
                    remove_if_exists(outfile).await?;
                    remove_if_exists(&self.compressed_path(outfile)).await?;
                    let delay = backoff.next_delay();
                    tokio::time::sleep(delay).await;
                    self.cancel.check()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn copy_chunk(
        &mut self,
        lower: &Option<Vec<Value>>,
        upper: &Option<Vec<Value>>,
        outfile: &Path,
    ) -> OResult<u64> {
        remove_if_exists(outfile).await?;

        let path = outfile.to_string_lossy().to_string();
        let dump = dump_sql(&self.plan, lower, upper, &path);
        self.session.exec(&dump).await?;

        let bytes = match tokio::fs::metadata(outfile).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if let Some(compression) = &self.plan.compression {
            compress(compression, outfile).await?;
        }
        self.hooks
            .fire(HookPoint::AfterSelectChunkIntoOutfile)
            .await?;
        if let Some(compression) = &self.plan.compression {
            decompress(compression, outfile).await?;
        }

        let expected = if self.needs_affected_rows_check() {
            Some(count_outfile_rows(outfile).await?)
        } else {
            None
        };

        let load = load_sql(&self.plan, &path);
        let affected = self.session.exec(&load).await?;

        if let Some(expected) = expected {
            if affected != expected {
                return Err(OscError::FatalDb {
                    code: 0,
                    state: String::from("HY000"),
                    msg: format!(
                        "LOAD DATA affected {} rows, outfile has {}",
                        affected, expected
                    ),
                });
            }
        }

        remove_if_exists(outfile).await?;
        remove_if_exists(&self.compressed_path(outfile)).await?;

        self.progress.record_chunk(affected, bytes);
        Ok(affected)
    }

    /// REPLACE counts deletions too, so the row-count comparison only
    /// holds for a plain load.
    fn needs_affected_rows_check(&self) -> bool {
        !self.plan.skip_affected_rows_check && !self.plan.eliminate_dups
    }

    fn compressed_path(&self, outfile: &Path) -> PathBuf {
        match &self.plan.compression {
            Some(c) => compressed_name(outfile, &c.extension),
            None => outfile.to_path_buf(),
        }
    }
}

fn compressed_name(outfile: &Path, extension: &str) -> PathBuf {
    let mut name = outfile.as_os_str().to_os_string();
    name.push(extension);
    PathBuf::from(name)
}

async fn compress(compression: &Compression, outfile: &Path) -> OResult<()> {
    let packed = compressed_name(outfile, &compression.extension);
    pipe_through(
        &compression.command,
        outfile,
        &packed,
    )
    .await?;
    remove_if_exists(outfile).await
}

async fn decompress(compression: &Compression, outfile: &Path) -> OResult<()> {
    let packed = compressed_name(outfile, &compression.extension);
    pipe_through(
        &format!("{} -d", compression.command),
        &packed,
        outfile,
    )
    .await
}

async fn pipe_through(command: &str, input: &Path, output: &Path) -> OResult<()> {
    let line = format!(
        "{} < '{}' > '{}'",
        command,
        input.display(),
        output.display()
    );
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&line)
        .status()
        .await?;
    if !status.success() {
        return Err(OscError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("compressor failed: {} ({})", line, status),
        )));
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> OResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// OUTFILE escapes embedded newlines, so raw `\n` bytes count rows.
async fn count_outfile_rows(path: &Path) -> OResult<u64> {
    let bytes = tokio::fs::read(path).await?;
    Ok(bytes.iter().filter(|b| **b == b'\n').count() as u64)
}

fn literals(values: &[Value]) -> Vec<String> {
    values.iter().map(|v| v.as_sql(false)).collect()
}

/// `(a, b) > bound` expanded to the index-friendly OR form.
pub fn tuple_gt(cols: &[String], bound: &[String]) -> String {
    let mut clauses = Vec::with_capacity(cols.len());
    for i in 0..cols.len() {
        let mut parts = Vec::with_capacity(i + 1);
        for j in 0..i {
            parts.push(format!("{} = {}", quote_ident(&cols[j]), bound[j]));
        }
        parts.push(format!("{} > {}", quote_ident(&cols[i]), bound[i]));
        clauses.push(format!("({})", parts.join(" AND ")));
    }
    format!("({})", clauses.join(" OR "))
}

fn where_clause(
    plan: &CopyPlan,
    lower: &Option<Vec<Value>>,
    upper: &Option<Vec<Value>>,
) -> String {
    let mut parts = Vec::new();
    if let Some(lower) = lower {
        parts.push(tuple_gt(&plan.pk_cols, &literals(lower)));
    }
    if let Some(upper) = upper {
        // pk <= upper
        parts.push(format!("NOT {}", tuple_gt(&plan.pk_cols, &literals(upper))));
    }
    if let Some(extra) = &plan.additional_where {
        parts.push(format!("({})", extra));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    }
}

fn order_by(plan: &CopyPlan) -> String {
    plan.pk_cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn boundary_sql(plan: &CopyPlan, lower: &Option<Vec<Value>>) -> String {
    let pk_list = order_by(plan);
    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}, 1",
        pk_list,
        quote_ident(&plan.source),
        where_clause(plan, lower, &None),
        pk_list,
        plan.chunk_size - 1,
    )
}

pub fn dump_sql(
    plan: &CopyPlan,
    lower: &Option<Vec<Value>>,
    upper: &Option<Vec<Value>>,
    outfile: &str,
) -> String {
    let cols = plan
        .projection
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {}{} ORDER BY {} INTO OUTFILE {} CHARACTER SET binary",
        cols,
        quote_ident(&plan.source),
        where_clause(plan, lower, upper),
        order_by(plan),
        quote_string(outfile),
    )
}

pub fn load_sql(plan: &CopyPlan, outfile: &str) -> String {
    let cols = plan
        .projection
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "LOAD DATA INFILE {}{} INTO TABLE {} CHARACTER SET binary ({})",
        quote_string(outfile),
        if plan.eliminate_dups { " REPLACE" } else { "" },
        quote_ident(&plan.shadow),
        cols,
    )
}

#[cfg(test)]
mod test {
    use mysql_async::Value;

    use super::{boundary_sql, dump_sql, load_sql, tuple_gt, Compression, CopyPlan};

    fn plan() -> CopyPlan {
        CopyPlan {
            source: String::from("t1"),
            shadow: String::from("_t1_new"),
            pk_cols: vec![String::from("a"), String::from("b")],
            projection: vec![String::from("a"), String::from("b"), String::from("data")],
            chunk_size: 500,
            additional_where: None,
            eliminate_dups: false,
            skip_affected_rows_check: false,
            compression: None,
            max_chunk_retries: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
        }
    }

    #[test]
    fn test_tuple_gt_expansion() {
        let cols = vec![String::from("a"), String::from("b")];
        let sql = tuple_gt(&cols, &[String::from("1"), String::from("2")]);
        assert_eq!(sql, "((`a` > 1) OR (`a` = 1 AND `b` > 2))");
    }

    #[test]
    fn test_boundary_sql_first_chunk() {
        let sql = boundary_sql(&plan(), &None);
        assert_eq!(
            sql,
            "SELECT `a`, `b` FROM `t1` ORDER BY `a`, `b` LIMIT 499, 1"
        );
    }

    #[test]
    fn test_dump_sql_with_range_and_extra_where() {
        let mut p = plan();
        p.additional_where = Some(String::from("`data` IS NOT NULL"));
        let lower = Some(vec![Value::Int(10), Value::Int(20)]);
        let upper = Some(vec![Value::Int(30), Value::Int(40)]);

        let sql = dump_sql(&p, &lower, &upper, "/tmp/osc/chunk_0.outfile");
        assert!(sql.contains("((`a` > 10) OR (`a` = 10 AND `b` > 20))"));
        assert!(sql.contains("NOT ((`a` > 30) OR (`a` = 30 AND `b` > 40))"));
        assert!(sql.contains("(`data` IS NOT NULL)"));
        assert!(sql.ends_with("INTO OUTFILE '/tmp/osc/chunk_0.outfile' CHARACTER SET binary"));
    }

    #[test]
    fn test_load_sql_replace_mode() {
        let mut p = plan();
        let sql = load_sql(&p, "/tmp/f");
        assert_eq!(
            sql,
            "LOAD DATA INFILE '/tmp/f' INTO TABLE `_t1_new` CHARACTER SET binary (`a`, `b`, `data`)"
        );

        p.eliminate_dups = true;
        let sql = load_sql(&p, "/tmp/f");
        assert!(sql.contains("LOAD DATA INFILE '/tmp/f' REPLACE INTO TABLE"));
    }

    #[test]
    fn test_compressed_name() {
        let c = Compression {
            command: String::from("zstd -q"),
            extension: String::from(".zst"),
        };
        let packed = super::compressed_name(std::path::Path::new("/tmp/chunk_0.outfile"), &c.extension);
        assert_eq!(packed.to_string_lossy(), "/tmp/chunk_0.outfile.zst");
    }
}
