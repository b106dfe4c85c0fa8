//! Callback points for the external test harness.
//!
//! Each point maps to one executable file under the hook directory; the
//! connection coordinates are exported through the environment so a hook
//! can reach the same instance. A failing hook aborts the run.

use std::path::PathBuf;

use common::err::osc_error::OscError;
use common::err::OResult;
use connection::SessionOptions;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeInitConnection,
    AfterRunDdl,
    AfterSelectChunkIntoOutfile,
    BeforeCleanup,
    AfterCleanup,
}

impl HookPoint {
    pub fn file_name(&self) -> &'static str {
        match self {
            HookPoint::BeforeInitConnection => "before_init_connection",
            HookPoint::AfterRunDdl => "after_run_ddl",
            HookPoint::AfterSelectChunkIntoOutfile => "after_select_chunk_into_outfile",
            HookPoint::BeforeCleanup => "before_cleanup",
            HookPoint::AfterCleanup => "after_cleanup",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hooks {
    dir: Option<PathBuf>,
    database: Option<String>,
    session: Option<SessionOptions>,
}

impl Hooks {
    /// Disabled hooks; every fire() is a no-op.
    pub fn disabled() -> Hooks {
        Hooks::default()
    }

    pub fn new(dir: PathBuf, database: Option<String>, session: SessionOptions) -> Hooks {
        Hooks {
            dir: Some(dir),
            database,
            session: Some(session),
        }
    }

    pub async fn fire(&self, point: HookPoint) -> OResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(point.file_name());
        if !path.exists() {
            debug!("hook {} not present, skipping", point.file_name());
            return Ok(());
        }

        info!("firing hook {}", point.file_name());
        let mut command = tokio::process::Command::new(&path);
        if let Some(db) = &self.database {
            command.env("OSC_DATABASE", db);
        }
        if let Some(session) = &self.session {
            if let Some(socket) = &session.socket {
                command.env("OSC_SOCKET", socket);
            }
            command
                .env("OSC_HOST", &session.host)
                .env("OSC_PORT", session.port.to_string())
                .env("OSC_USER", &session.username)
                .env("OSC_PASSWORD", &session.password);
        }

        let status = command.status().await?;
        if !status.success() {
            return Err(OscError::Hook {
                point: point.file_name().to_string(),
                msg: format!("exit status {}", status),
            });
        }
        Ok(())
    }
}
