use std::path::{Path, PathBuf};

use common::config::OscConfig;
use common::err::osc_error::OscError;
use common::err::OResult;
use common::server::CancelToken;
use connection::{DbSession, SessionOptions, SessionPurpose};
use payload::cleanup::{cleanup_instance, CleanupSummary};
use payload::controller::PayloadController;
use payload::direct::run_direct;
use payload::hooks::Hooks;
use schema::parser::parse_statements;
use tracing::{info, warn};

use crate::cli_options::CliOptions;

/// Drives the payload from parsed CLI input. One controller per table in
/// the DDL file, run sequentially.
pub struct CliClient {
    #[allow(dead_code)]
    cli_options: CliOptions,
    config: OscConfig,
    cancel: CancelToken,
}

impl CliClient {
    pub fn new(cli_options: CliOptions, config: OscConfig) -> Self {
        CliClient {
            cli_options,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// 信号转取消标志; worker 在安全点检查。cleanup 模式杀进程用的是
    /// SIGTERM, 这里一并监听。
    pub fn install_signal_handler(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(_) => return,
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            warn!("termination signal received, cancelling run");
            cancel.cancel();
        });
    }

    fn hooks(&self) -> Hooks {
        match &self.config.osc.hooks_dir {
            Some(dir) => Hooks::new(
                PathBuf::from(dir),
                self.config.mysql.database.clone(),
                SessionOptions::from_config(&self.config.mysql),
            ),
            None => Hooks::disabled(),
        }
    }

    pub async fn run_copy(&mut self, ddl_file: &Path) -> OResult<()> {
        let input = tokio::fs::read_to_string(ddl_file).await?;
        let tables = parse_statements(&input)?;
        if tables.is_empty() {
            return Err(OscError::Validation(format!(
                "no CREATE TABLE statement in {}",
                ddl_file.display()
            )));
        }

        for table in tables {
            self.cancel.check()?;
            let name = table.name.clone();
            info!("starting schema change for `{}`", name);

            let mut controller = PayloadController::new(
                self.config.clone(),
                table,
                self.cancel.clone(),
                self.hooks(),
            );
            let report = controller.run().await?;
            if report.noop {
                println!("`{}`: already up to date", name);
            } else {
                println!(
                    "`{}`: done ({} rows copied, {} changes replayed)",
                    name, report.copied_rows, report.replayed_rows
                );
            }
        }
        Ok(())
    }

    pub async fn run_direct(&mut self, ddl_file: &Path) -> OResult<()> {
        let input = tokio::fs::read_to_string(ddl_file).await?;
        let options = SessionOptions::from_config(&self.config.mysql);
        let mut session = DbSession::connect(&options, SessionPurpose::Control).await?;
        let count = run_direct(&mut session, &input, &self.hooks()).await?;
        println!("direct: {} statement(s) executed", count);
        session.disconnect().await?;
        Ok(())
    }

    pub async fn run_cleanup(&mut self, force: bool) -> OResult<()> {
        self.config.osc.force_cleanup |= force;

        let hooks = self.hooks();
        let mut total = CleanupSummary::default();
        for root in self.state_roots().await {
            let summary = cleanup_instance(&self.config, &root, &hooks).await?;
            total.dropped.extend(summary.dropped);
            total.state_file_removed |= summary.state_file_removed;
        }
        println!("{}", total);
        Ok(())
    }

    /// Candidate directories a previous run may have put its state file
    /// in: the configured outfile dir, the server's secure_file_priv and
    /// the system temp dir.
    async fn state_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(dir) = &self.config.osc.outfile_dir {
            roots.push(PathBuf::from(dir));
        }

        let options = SessionOptions::from_config(&self.config.mysql);
        if let Ok(mut session) = DbSession::connect(&options, SessionPurpose::Side).await {
            if let Ok(Some(priv_dir)) = session.var("secure_file_priv").await {
                if !priv_dir.is_empty() && !priv_dir.eq_ignore_ascii_case("null") {
                    roots.push(PathBuf::from(priv_dir));
                }
            }
            let _ = session.disconnect().await;
        }

        roots.push(std::env::temp_dir());
        roots.dedup();
        roots
    }
}
