//! Idempotent removal of every intermediate artifact.
//!
//! Every step tolerates the artifact being absent already, so running
//! cleanup twice is the same as running it once. The state file goes away
//! only after everything else did.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use common::config::OscConfig;
use common::err::osc_error::OscError;
use common::err::OResult;
use common::sql::quote_ident;
use connection::{DbSession, SessionOptions, SessionPurpose};
use tracing::{info, warn};

use crate::hooks::{HookPoint, Hooks};
use crate::state_file::{find_state_files, read_state, remove_state, StateRecord};

#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub dropped: Vec<String>,
    pub failed: Vec<String>,
    pub state_file_removed: bool,
}

impl fmt::Display for CleanupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup: {} artifact(s) removed",
            self.dropped.len()
        )?;
        if !self.failed.is_empty() {
            write!(f, ", {} FAILED ({})", self.failed.len(), self.failed.join("; "))?;
        }
        if self.state_file_removed {
            write!(f, ", state file removed")?;
        } else {
            write!(f, ", state file kept")?;
        }
        Ok(())
    }
}

/// Drop triggers, shadow, delta and old table, remove outfiles, then the
/// state file. Collects per-step failures instead of stopping at the
/// first one, so a second run has less to do.
pub async fn cleanup_artifacts(
    session: &mut DbSession,
    record: &StateRecord,
    state_path: Option<&Path>,
    hooks: &Hooks,
) -> OResult<CleanupSummary> {
    hooks.fire(HookPoint::BeforeCleanup).await?;

    let mut summary = CleanupSummary::default();

    let statements = [
        format!("DROP TRIGGER IF EXISTS {}", quote_ident(&record.trigger_ins)),
        format!("DROP TRIGGER IF EXISTS {}", quote_ident(&record.trigger_upd)),
        format!("DROP TRIGGER IF EXISTS {}", quote_ident(&record.trigger_del)),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&record.shadow)),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&record.delta)),
        format!("DROP TABLE IF EXISTS {}", quote_ident(&record.old)),
    ];
    for stmt in &statements {
        match session.exec(stmt).await {
            Ok(_) => summary.dropped.push(stmt.clone()),
            Err(err) => {
                warn!("cleanup step failed: {} ({})", stmt, err);
                summary.failed.push(format!("{}: {}", stmt, err));
            }
        }
    }

    match tokio::fs::remove_dir_all(&record.outfile_dir).await {
        Ok(()) => summary
            .dropped
            .push(format!("outfile dir {}", record.outfile_dir.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => summary.failed.push(format!(
            "outfile dir {}: {}",
            record.outfile_dir.display(),
            e
        )),
    }

    if !summary.failed.is_empty() {
        // state file stays for the next cleanup invocation
        hooks.fire(HookPoint::AfterCleanup).await?;
        return Err(OscError::Cleanup(summary.to_string()));
    }

    if let Some(path) = state_path {
        remove_state(path).await?;
        summary.state_file_removed = true;
    }

    hooks.fire(HookPoint::AfterCleanup).await?;
    info!("{}", summary);
    Ok(summary)
}

/// `cleanup` mode: no-op without a state file, otherwise undo every run
/// recorded on this instance. A still-running owner process is terminated
/// first (or the cleanup refused, without force_cleanup).
pub async fn cleanup_instance(
    config: &OscConfig,
    state_root: &Path,
    hooks: &Hooks,
) -> OResult<CleanupSummary> {
    let files = find_state_files(state_root).await?;
    if files.is_empty() {
        info!("no state file found, nothing to clean up");
        return Ok(CleanupSummary::default());
    }

    let mut total = CleanupSummary::default();
    for path in files {
        let record = read_state(&path).await?;

        if record.pid != std::process::id() && pid_alive(record.pid) {
            info!("killing running osc process {}", record.pid);
            terminate_pid(record.pid).await?;
            if pid_alive(record.pid) && !config.osc.force_cleanup {
                return Err(OscError::Cleanup(format!(
                    "process {} still running (use force_cleanup to override)",
                    record.pid
                )));
            }
        }

        let mut session_options = SessionOptions::from_config(&config.mysql);
        session_options.database = Some(record.database.clone());
        let mut session = DbSession::connect(&session_options, SessionPurpose::Control).await?;

        let summary = cleanup_artifacts(&mut session, &record, Some(&path), hooks).await?;
        total.dropped.extend(summary.dropped);
        total.state_file_removed |= summary.state_file_removed;
    }

    Ok(total)
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

async fn terminate_pid(pid: u32) -> OResult<()> {
    let status = tokio::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .await?;
    if !status.success() {
        warn!("kill {} exited with {}", pid, status);
    }
    // give the process a moment to run its own cleanup
    for _ in 0..20 {
        if !pid_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::CleanupSummary;

    #[test]
    fn test_summary_display() {
        let mut summary = CleanupSummary::default();
        summary.dropped.push(String::from("DROP TABLE IF EXISTS `_t1_new`"));
        summary.state_file_removed = true;
        let line = summary.to_string();
        assert!(line.contains("1 artifact(s) removed"));
        assert!(line.contains("state file removed"));

        summary.failed.push(String::from("boom"));
        assert!(summary.to_string().contains("1 FAILED"));
    }
}
