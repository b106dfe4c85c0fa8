pub mod load_style;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_style::LoadStyle;
use crate::err::osc_error::OscError;

#[derive(Debug, Serialize, Deserialize)]
pub struct FConfig {
    config: OscConfig,

    /// 配置的加载方式
    load_style: LoadStyle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    app_name: String,

    pub mysql: MysqlConfig,
    pub osc: OscOptions,
    pub base: BaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// 日志输出路径
    log_dir: Option<String>,
}

/// MySQL 连接配置。socket 优先于 host/port。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub socket: Option<String>,
    pub host: Option<String>,
    pub port: Option<i16>,
    pub username: String,
    pub password: String,

    /// 目标库名
    pub database: Option<String>,
}

/// Copy-engine tunables. Field names double as the option names the CLI
/// and config file accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscOptions {
    /// Allow the new schema to carry a different primary key.
    pub allow_new_pk: bool,

    /// Allow a new schema without any primary/unique key.
    /// (alias: unblock_table_creation_without_pk)
    #[serde(alias = "unblock_table_creation_without_pk")]
    pub allow_no_pk: bool,

    /// Resolve duplicate-key conflicts with REPLACE semantics instead of
    /// failing, and accept collation changes that may collapse keys.
    pub eliminate_dups: bool,

    /// Reject any column change that needs an implicit lossy conversion.
    pub fail_for_implicit_conv: bool,

    /// Strip the partition clause from the new schema before diffing.
    pub rm_partition: bool,

    /// Skip the engine equality check between old and new schema.
    pub no_engine_check: bool,

    /// cleanup 模式: 即使 pid 仍存活也强制清理
    pub force_cleanup: bool,

    /// Pipe each chunk outfile through the configured compressor.
    pub enable_outfile_compression: bool,
    pub outfile_compressor: String,
    pub compressed_outfile_extension: String,

    /// Rows per copy chunk.
    pub chunk_size: u64,

    /// Rows per replay batch.
    pub replay_batch_size: u64,

    /// Catch-up ends when the unconsumed delta tail is within this many rows.
    pub max_replay_lag: u64,

    /// Catch-up 阶段的时间上限（毫秒）
    pub max_replay_time_ms: u64,

    /// Convergence bound: copier done and unconsumed delta rows at most
    /// this many before the cutover may be attempted.
    pub final_replay_limit: u64,

    /// Final-replay iterations inside the lock window before the attempt
    /// is abandoned and the run falls back to catch-up.
    pub final_replay_rounds: u32,

    /// Cutover lock budget in seconds; also sets lock_wait_timeout for
    /// the cutover session.
    pub lock_wait_timeout: u64,

    /// Delay the cutover while transactions older than this many seconds
    /// are running.
    pub long_trx_time: u64,

    /// Retries per failed chunk before the run fails.
    pub max_chunk_retries: u32,

    /// Throttle/retry backoff: initial sleep and cap, milliseconds.
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    /// Extra predicate ANDed into every chunk select.
    pub additional_where: Option<String>,

    /// 跳过 LOAD DATA 影响行数与 outfile 行数的核对
    pub skip_affected_rows_check: bool,

    /// Skip the post-copy checksum comparison.
    pub skip_checksum: bool,

    /// Override for the outfile directory root (defaults to the system
    /// temp dir).
    pub outfile_dir: Option<String>,

    /// Directory holding hook scripts; hooks are disabled when unset.
    pub hooks_dir: Option<String>,
}

impl Default for FConfig {
    fn default() -> Self {
        FConfig {
            config: OscConfig::default(),
            load_style: LoadStyle::DEFAULT,
        }
    }
}

impl Default for MysqlConfig {
    fn default() -> Self {
        MysqlConfig {
            socket: None,
            host: Some("127.0.0.1".to_string()),
            port: Some(3306),
            username: "root".to_string(),
            password: "".to_string(),
            database: None,
        }
    }
}

impl Default for OscOptions {
    fn default() -> Self {
        OscOptions {
            allow_new_pk: false,
            allow_no_pk: false,
            eliminate_dups: false,
            fail_for_implicit_conv: false,
            rm_partition: false,
            no_engine_check: false,
            force_cleanup: false,
            enable_outfile_compression: false,
            outfile_compressor: "zstd".to_string(),
            compressed_outfile_extension: ".zst".to_string(),
            chunk_size: 500,
            replay_batch_size: 500,
            max_replay_lag: 1000,
            max_replay_time_ms: 600_000,
            final_replay_limit: 500,
            final_replay_rounds: 10,
            lock_wait_timeout: 30,
            long_trx_time: 30,
            max_chunk_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            additional_where: None,
            skip_affected_rows_check: false,
            skip_checksum: false,
            outfile_dir: None,
            hooks_dir: None,
        }
    }
}

impl Default for BaseConfig {
    fn default() -> Self {
        BaseConfig {
            log_dir: Some(String::from("/tmp/osc")),
        }
    }
}

impl FConfig {
    pub fn new(c: OscConfig) -> Self {
        FConfig {
            config: c,
            load_style: LoadStyle::TOML,
        }
    }

    pub fn get_config(self) -> OscConfig {
        self.config
    }
}

impl BaseConfig {
    pub fn get_log_dir(&self) -> Option<String> {
        self.log_dir.clone()
    }
}

impl MysqlConfig {
    pub fn get_host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn get_port(&self) -> i16 {
        self.port.unwrap_or(3306)
    }

    pub fn have_host(&self) -> bool {
        self.host.is_none()
    }

    pub fn have_port(&self) -> bool {
        self.port.is_none()
    }
}

/// 读取指定路径下的配制文件信息
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<OscConfig, OscError> {
    let mut file = File::open(path.as_ref())?;
    let mut s = String::new();

    let _ = file.read_to_string(&mut s);
    toml::from_str(s.as_str()).map_err(|e| OscError::Validation(e.to_string()))
}
