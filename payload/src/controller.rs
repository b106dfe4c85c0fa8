//! Top-level state machine driving the whole schema change.
//!
//!   INIT → VALIDATE → CREATE_SHADOW → INSTALL_TRIGGERS → COPY
//!        → REPLAY_CATCHUP → CUTOVER → CLEANUP → DONE
//!
//! 任何状态出错(或收到取消信号)都会转入 CLEANUP; CLEANUP 自身失败则进入
//! CLEANUP_FAILED, 状态文件保留给下一次 cleanup。

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::config::OscConfig;
use common::err::osc_error::OscError;
use common::err::OResult;
use common::server::CancelToken;
use common::sql::quote_ident;
use connection::session::LockMode;
use connection::{DbSession, SessionOptions, SessionPurpose};
use schema::differ::{diff, DiffOptions, SchemaDiff};
use schema::model::TableDef;
use schema::parser::parse_create_table;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checksum;
use crate::chglog::{ChangeLog, RESERVED_DELTA_COLUMNS};
use crate::chunk::{ChunkCopier, Compression, CopyPlan};
use crate::cleanup::cleanup_artifacts;
use crate::hooks::{HookPoint, Hooks};
use crate::idents::SessionIdents;
use crate::probe::{HealthProbe, ProbeLimits, ServerHealthProbe};
use crate::progress::{Progress, ProgressRef};
use crate::replay::{Replayer, ReplayPlan};
use crate::state_file::{state_path, write_state, StateRecord};

/// Cutover attempts before the run gives up converging.
const MAX_CUTOVER_ATTEMPTS: u32 = 3;

/// Rounds of the long-transaction guard before one cutover attempt is
/// abandoned.
const LONG_TRX_GUARD_ROUNDS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscState {
    Init,
    Validate,
    CreateShadow,
    InstallTriggers,
    Copy,
    ReplayCatchup,
    Cutover,
    Cleanup,
    Done,
    CleanupFailed,
}

impl fmt::Display for OscState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OscState::Init => "INIT",
            OscState::Validate => "VALIDATE",
            OscState::CreateShadow => "CREATE_SHADOW",
            OscState::InstallTriggers => "INSTALL_TRIGGERS",
            OscState::Copy => "COPY",
            OscState::ReplayCatchup => "REPLAY_CATCHUP",
            OscState::Cutover => "CUTOVER",
            OscState::Cleanup => "CLEANUP",
            OscState::Done => "DONE",
            OscState::CleanupFailed => "CLEANUP_FAILED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub state: OscState,
    /// Schemas were already identical; nothing was copied.
    pub noop: bool,
    pub copied_rows: u64,
    pub replayed_rows: u64,
}

pub struct PayloadController {
    config: OscConfig,
    session_options: SessionOptions,
    target: TableDef,
    cancel: CancelToken,
    hooks: Hooks,
    state: OscState,

    /// Worker connection ids, killable from a side session.
    worker_threads: Arc<Mutex<Vec<u32>>>,
}

impl PayloadController {
    pub fn new(config: OscConfig, target: TableDef, cancel: CancelToken, hooks: Hooks) -> Self {
        let session_options = SessionOptions::from_config(&config.mysql);
        PayloadController {
            config,
            session_options,
            target,
            cancel,
            hooks,
            state: OscState::Init,
            worker_threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> OscState {
        self.state
    }

    fn enter(&mut self, state: OscState) {
        info!("state {} -> {}", self.state, state);
        self.state = state;
    }

    pub async fn run(&mut self) -> OResult<RunReport> {
        self.enter(OscState::Init);
        self.hooks.fire(HookPoint::BeforeInitConnection).await?;
        let mut control =
            DbSession::connect(&self.session_options, SessionPurpose::Control).await?;

        self.enter(OscState::Validate);
        let prepared = match self.validate(&mut control).await? {
            Some(prepared) => prepared,
            None => {
                // identical schemas
                self.enter(OscState::Done);
                return Ok(RunReport {
                    state: self.state,
                    noop: true,
                    copied_rows: 0,
                    replayed_rows: 0,
                });
            }
        };

        // First server-state mutation comes next; record how to undo it.
        write_state(&prepared.state_file, &prepared.record).await?;
        tokio::fs::create_dir_all(&prepared.idents.outfile_dir).await?;

        let progress = Progress::new();
        let outcome = self
            .drive(&mut control, &prepared, progress.clone())
            .await;

        match outcome {
            Ok(()) => {
                self.enter(OscState::Cleanup);
                match cleanup_artifacts(
                    &mut control,
                    &prepared.record,
                    Some(&prepared.state_file),
                    &self.hooks,
                )
                .await
                {
                    Ok(_) => {
                        self.enter(OscState::Done);
                        Ok(RunReport {
                            state: self.state,
                            noop: false,
                            copied_rows: progress.copied_rows(),
                            replayed_rows: progress.replayed_rows(),
                        })
                    }
                    Err(err) => {
                        // the swap went through; only artifacts remain
                        self.enter(OscState::CleanupFailed);
                        error!("post-swap cleanup failed: {}", err);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                error!("run failed in {}: {}", self.state, err);
                self.enter(OscState::Cleanup);
                match cleanup_artifacts(
                    &mut control,
                    &prepared.record,
                    Some(&prepared.state_file),
                    &self.hooks,
                )
                .await
                {
                    Ok(summary) => {
                        info!("{}", summary);
                        Err(err)
                    }
                    Err(cleanup_err) => {
                        self.enter(OscState::CleanupFailed);
                        error!("cleanup after failure also failed: {}", cleanup_err);
                        Err(cleanup_err)
                    }
                }
            }
        }
    }

    /// The copy pipeline between state-file creation and the rename.
    async fn drive(
        &mut self,
        control: &mut DbSession,
        prepared: &Prepared,
        progress: ProgressRef,
    ) -> OResult<()> {
        self.enter(OscState::CreateShadow);
        let shadow_ddl = prepared.new_def.with_name(&prepared.idents.shadow).to_string();
        control.exec(&shadow_ddl).await?;
        self.hooks.fire(HookPoint::AfterRunDdl).await?;

        self.enter(OscState::InstallTriggers);
        prepared.changelog.install(control).await?;
        self.hooks.fire(HookPoint::AfterRunDdl).await?;

        self.enter(OscState::Copy);
        self.copy_and_catch_up(prepared, progress.clone()).await?;

        // convergence loop: catch up further, then try to cut over
        let mut attempts = 0u32;
        loop {
            self.cancel.check()?;
            self.enter(OscState::ReplayCatchup);
            let mut replayer = Replayer::new(
                prepared.replay_plan.clone(),
                self.cancel.clone(),
                progress.clone(),
            );
            let backlog = replayer
                .catch_up(
                    control,
                    self.config.osc.final_replay_limit,
                    Duration::from_millis(self.config.osc.max_replay_time_ms),
                )
                .await?;
            if backlog > self.config.osc.final_replay_limit {
                return Err(OscError::FatalDb {
                    code: 0,
                    state: String::from("HY000"),
                    msg: format!(
                        "replay cannot converge: backlog {} after catch-up window",
                        backlog
                    ),
                });
            }

            self.enter(OscState::Cutover);
            attempts += 1;
            if self.try_cutover(prepared, progress.clone()).await? {
                return Ok(());
            }
            if attempts >= MAX_CUTOVER_ATTEMPTS {
                return Err(OscError::FatalDb {
                    code: 0,
                    state: String::from("HY000"),
                    msg: format!("cutover abandoned after {} attempts", attempts),
                });
            }
            warn!("cutover attempt {} did not converge, retrying", attempts);
        }
    }

    /// Chunk copy and replay catch-up, two concurrent workers with their
    /// own sessions.
    async fn copy_and_catch_up(&mut self, prepared: &Prepared, progress: ProgressRef) -> OResult<()> {
        let copy_session = DbSession::connect(&self.session_options, SessionPurpose::Load).await?;
        let mut replay_session =
            DbSession::connect(&self.session_options, SessionPurpose::Replay).await?;
        let probe_session = DbSession::connect(&self.session_options, SessionPurpose::Side).await?;
        {
            let mut ids = self.worker_threads.lock().unwrap();
            ids.push(copy_session.thread_id());
            ids.push(replay_session.thread_id());
        }

        let killer = self.spawn_killer();

        let probe: Box<dyn HealthProbe> =
            Box::new(ServerHealthProbe::new(probe_session, ProbeLimits::default()));
        let copier = ChunkCopier::new(
            copy_session,
            prepared.copy_plan.clone(),
            prepared.idents.clone(),
            probe,
            self.cancel.clone(),
            progress.clone(),
            self.hooks.clone(),
        );
        let mut copy_handle: JoinHandle<OResult<()>> = tokio::spawn(copier.run());

        let mut replayer = Replayer::new(
            prepared.replay_plan.clone(),
            self.cancel.clone(),
            progress.clone(),
        );
        let replay_progress = progress.clone();
        let replay_cancel = self.cancel.clone();
        let max_lag = self.config.osc.max_replay_lag;
        let mut replay_handle: JoinHandle<OResult<()>> = tokio::spawn(async move {
            loop {
                replay_cancel.check()?;
                let applied = replayer.replay_batch(&mut replay_session).await?;
                if replay_progress.is_copy_done() {
                    let backlog = replayer.backlog(&mut replay_session).await?;
                    if backlog <= max_lag {
                        return Ok(());
                    }
                }
                if applied == 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        });

        let (copy_result, replay_result) = tokio::select! {
            r = &mut copy_handle => {
                let copy_result = join_flatten(r);
                if copy_result.is_err() {
                    self.cancel.cancel();
                }
                let replay_result = join_flatten(replay_handle.await);
                (copy_result, replay_result)
            }
            r = &mut replay_handle => {
                // the replay worker only returns early on error
                let replay_result = join_flatten(r);
                self.cancel.cancel();
                let copy_result = join_flatten(copy_handle.await);
                (copy_result, replay_result)
            }
        };
        killer.abort();
        self.worker_threads.lock().unwrap().clear();

        // prefer the primary failure over the induced cancellation
        match (copy_result, replay_result) {
            (Ok(()), Ok(())) => {
                // a run cancelled from outside still has the flag set
                self.cancel.check()
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(copy_err), Err(replay_err)) => {
                if matches!(copy_err, OscError::Cancelled) {
                    Err(replay_err)
                } else {
                    Err(copy_err)
                }
            }
        }
    }

    /// One cutover attempt. Ok(false) means the delta did not drain
    /// within the bounded window; locks were released and the caller goes
    /// back to catch-up.
    async fn try_cutover(&mut self, prepared: &Prepared, progress: ProgressRef) -> OResult<bool> {
        self.long_trx_guard().await?;

        let mut cutover = DbSession::connect(&self.session_options, SessionPurpose::Cutover).await?;
        cutover
            .set_lock_wait_timeout(self.config.osc.lock_wait_timeout)
            .await?;

        cutover
            .lock_tables(&[
                (prepared.idents.source.clone(), LockMode::Write),
                (prepared.idents.shadow.clone(), LockMode::Write),
                (prepared.idents.delta.clone(), LockMode::Write),
            ])
            .await?;

        let mut replayer = Replayer::new(
            prepared.replay_plan.clone(),
            self.cancel.clone(),
            progress,
        );
        let drained = replayer
            .drain(&mut cutover, self.config.osc.final_replay_rounds)
            .await?;
        if !drained {
            cutover.unlock_tables().await?;
            cutover.disconnect().await?;
            return Ok(false);
        }

        if !self.config.osc.skip_checksum {
            if let Err(err) = checksum::verify(
                &mut cutover,
                &prepared.idents.source,
                &prepared.idents.shadow,
                &prepared.copy_plan.projection,
            )
            .await
            {
                cutover.unlock_tables().await?;
                cutover.disconnect().await?;
                return Err(err);
            }
        }

        // the linearization point
        let rename = format!(
            "RENAME TABLE {} TO {}, {} TO {}",
            quote_ident(&prepared.idents.source),
            quote_ident(&prepared.idents.old),
            quote_ident(&prepared.idents.shadow),
            quote_ident(&prepared.idents.source),
        );
        cutover.exec(&rename).await?;
        cutover.unlock_tables().await?;
        cutover.disconnect().await?;

        info!(
            "cutover complete: `{}` now carries the new schema",
            prepared.idents.source
        );
        Ok(true)
    }

    /// Delay the cutover while old transactions are still running; they
    /// would stall LOCK TABLES and stretch the lock window.
    async fn long_trx_guard(&mut self) -> OResult<()> {
        let mut session = DbSession::connect(&self.session_options, SessionPurpose::Side).await?;
        for round in 0..LONG_TRX_GUARD_ROUNDS {
            self.cancel.check()?;
            let count: Option<u64> = session
                .query_first(&format!(
                    "SELECT COUNT(*) FROM information_schema.innodb_trx \
                     WHERE trx_started < NOW() - INTERVAL {} SECOND",
                    self.config.osc.long_trx_time
                ))
                .await?;
            if count.unwrap_or(0) == 0 {
                session.disconnect().await?;
                return Ok(());
            }
            warn!(
                "long-running transaction(s) present, delaying cutover (round {})",
                round + 1
            );
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        session.disconnect().await?;
        Err(OscError::TransientDb {
            code: 0,
            state: String::from("HY000"),
            msg: String::from("long-running transactions kept blocking the cutover"),
        })
    }

    fn spawn_killer(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let ids = self.worker_threads.clone();
        let options = self.session_options.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let targets: Vec<u32> = ids.lock().unwrap().clone();
            if targets.is_empty() {
                return;
            }
            if let Ok(mut side) = DbSession::connect(&options, SessionPurpose::Side).await {
                for id in targets {
                    let _ = side.kill_query(id).await;
                }
            }
        })
    }

    /// Schema work: read the live definition, diff, derive plans and
    /// names. Returns None when the schemas are semantically identical.
    async fn validate(&mut self, control: &mut DbSession) -> OResult<Option<Prepared>> {
        let database = self.config.mysql.database.clone().ok_or_else(|| {
            OscError::Precondition(String::from("no database selected"))
        })?;
        if self.config.osc.chunk_size == 0 {
            return Err(OscError::Precondition(String::from("chunk_size must be >= 1")));
        }

        let source_name = self.target.name.clone();
        let show: Option<(String, String)> = control
            .query_first(&format!("SHOW CREATE TABLE {}", quote_ident(&source_name)))
            .await
            .map_err(|err| match err {
                OscError::FatalDb { code: 1146, .. } => OscError::Precondition(format!(
                    "table `{}` does not exist in `{}`",
                    source_name, database
                )),
                OscError::FatalDb { code: 1049, .. } => {
                    OscError::Precondition(format!("database `{}` does not exist", database))
                }
                other => other,
            })?;
        let (_, current_ddl) = show.ok_or_else(|| {
            OscError::Precondition(format!("table `{}` does not exist", source_name))
        })?;
        let old_def = parse_create_table(&current_ddl)?;

        let mut new_def = self.target.clone();
        if self.config.osc.rm_partition {
            new_def.partition = None;
        }

        let schema_diff = self.run_differ(&old_def, &new_def)?;
        if schema_diff.is_identical() {
            info!(
                "`{}` already matches the requested schema, nothing to do",
                source_name
            );
            return Ok(None);
        }
        for entry in &schema_diff.entries {
            info!("diff: {:?}", entry);
        }

        // chunking and change capture address rows by the current key
        let old_canonical = old_def.canonical();
        let key = old_canonical.effective_key().ok_or_else(|| {
            OscError::Precondition(format!(
                "table `{}` has no primary or unique key to chunk by",
                source_name
            ))
        })?;
        let pk_cols: Vec<String> = key.columns.iter().map(|c| c.name.clone()).collect();

        for col in &pk_cols {
            if RESERVED_DELTA_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(col)) {
                return Err(OscError::Precondition(format!(
                    "key column `{}` collides with a delta table column",
                    col
                )));
            }
            if !schema_diff.projection.contains(col) {
                return Err(OscError::Precondition(format!(
                    "key column `{}` does not survive into the new schema; \
                     captured changes could not be addressed",
                    col
                )));
            }
        }

        let outfile_root = self.outfile_root(control).await?;
        let idents = SessionIdents::new(&source_name, &outfile_root);
        let changelog = ChangeLog::new(&idents, &old_def)?;
        let record = StateRecord::new(&database, &idents);
        let state_file = state_path(&outfile_root, record.pid);

        let compression = if self.config.osc.enable_outfile_compression {
            Some(Compression {
                command: self.config.osc.outfile_compressor.clone(),
                extension: self.config.osc.compressed_outfile_extension.clone(),
            })
        } else {
            None
        };

        let copy_plan = CopyPlan {
            source: idents.source.clone(),
            shadow: idents.shadow.clone(),
            pk_cols: pk_cols.clone(),
            projection: schema_diff.projection.clone(),
            chunk_size: self.config.osc.chunk_size,
            additional_where: self.config.osc.additional_where.clone(),
            eliminate_dups: self.config.osc.eliminate_dups,
            skip_affected_rows_check: self.config.osc.skip_affected_rows_check,
            compression,
            max_chunk_retries: self.config.osc.max_chunk_retries,
            backoff_base_ms: self.config.osc.backoff_base_ms,
            backoff_cap_ms: self.config.osc.backoff_cap_ms,
        };
        let replay_plan = ReplayPlan {
            source: idents.source.clone(),
            shadow: idents.shadow.clone(),
            delta: idents.delta.clone(),
            pk_cols,
            projection: schema_diff.projection.clone(),
            batch_size: self.config.osc.replay_batch_size,
        };

        Ok(Some(Prepared {
            new_def,
            idents,
            changelog,
            record,
            state_file,
            copy_plan,
            replay_plan,
        }))
    }

    fn run_differ(&self, old_def: &TableDef, new_def: &TableDef) -> OResult<SchemaDiff> {
        let options = DiffOptions {
            allow_new_pk: self.config.osc.allow_new_pk,
            allow_no_pk: self.config.osc.allow_no_pk,
            eliminate_dups: self.config.osc.eliminate_dups,
            fail_for_implicit_conv: self.config.osc.fail_for_implicit_conv,
            no_engine_check: self.config.osc.no_engine_check,
        };
        diff(old_def, new_def, &options).into_checked()
    }

    /// Outfile root: explicit config, else the server's secure_file_priv
    /// when it is enforced, else the system temp dir.
    async fn outfile_root(&self, control: &mut DbSession) -> OResult<PathBuf> {
        if let Some(dir) = &self.config.osc.outfile_dir {
            return Ok(PathBuf::from(dir));
        }
        if let Some(priv_dir) = control.var("secure_file_priv").await? {
            if !priv_dir.is_empty() && !priv_dir.eq_ignore_ascii_case("null") {
                return Ok(PathBuf::from(priv_dir));
            }
        }
        Ok(std::env::temp_dir())
    }
}

/// Everything VALIDATE derives for the later phases.
struct Prepared {
    new_def: TableDef,
    idents: SessionIdents,
    changelog: ChangeLog,
    record: StateRecord,
    state_file: PathBuf,
    copy_plan: CopyPlan,
    replay_plan: ReplayPlan,
}

fn join_flatten(result: Result<OResult<()>, tokio::task::JoinError>) -> OResult<()> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(OscError::FatalDb {
            code: 0,
            state: String::from("HY000"),
            msg: format!("worker task failed: {}", join_err),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::OscState;

    #[test]
    fn test_state_names() {
        assert_eq!(OscState::Init.to_string(), "INIT");
        assert_eq!(OscState::ReplayCatchup.to_string(), "REPLAY_CATCHUP");
        assert_eq!(OscState::CleanupFailed.to_string(), "CLEANUP_FAILED");
    }
}
