use std::io;

use thiserror::Error;

/// 错误分类。决定 CLI 的退出码与重试策略。
#[derive(Debug, Error)]
pub enum OscError {
    //////////////////////
    // SQL Parser
    //////////////////////
    /// 输入的 CREATE TABLE 无法解析
    #[error("parse error at line {line}, column {column}: {msg}")]
    Parse {
        line: usize,
        column: usize,
        msg: String,
    },

    //////////////////////
    // Schema Differ
    //////////////////////
    /// The requested schema change is disallowed by policy.
    #[error("validation error: {0}")]
    Validation(String),

    /// 运行前置条件不满足（缺库、缺表、缺主键、引擎不一致等）
    #[error("precondition error: {0}")]
    Precondition(String),

    //////////////////////
    // DB
    //////////////////////
    /// Retryable server-side error (deadlock, lock wait timeout, lost
    /// connection). Absorbed with bounded retries inside components.
    #[error("transient db error [{code}] ({state}): {msg}")]
    TransientDb { code: u16, state: String, msg: String },

    /// Not retryable. Surfaced to the controller, which runs cleanup.
    #[error("fatal db error [{code}] ({state}): {msg}")]
    FatalDb { code: u16, state: String, msg: String },

    //////////////////////
    // IO / Hooks
    //////////////////////
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// hook 脚本以非 0 退出
    #[error("hook {point} failed: {msg}")]
    Hook { point: String, msg: String },

    //////////////////////
    // Control flow
    //////////////////////
    #[error("operation cancelled")]
    Cancelled,

    /// Cleanup itself failed; the state file is retained so a later
    /// `cleanup` invocation can finish the job.
    #[error("cleanup error: {0}")]
    Cleanup(String),
}

/// Server error codes treated as retryable.
///   1040 too many connections, 1205 lock wait timeout, 1213 deadlock,
///   2006 server has gone away, 2013 lost connection during query.
const TRANSIENT_CODES: [u16; 5] = [1040, 1205, 1213, 2006, 2013];

impl OscError {
    /// CLI 退出码约定:
    ///   0 成功, 1 校验/解析错误, 2 运行时错误, 3 需要再次 cleanup
    pub fn exit_code(&self) -> i32 {
        match self {
            OscError::Parse { .. } | OscError::Validation(_) => 1,
            OscError::Cleanup(_) => 3,
            _ => 2,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OscError::TransientDb { .. })
    }

    /// Primary-cause SQL state for the single-line terminal report.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            OscError::TransientDb { state, .. } | OscError::FatalDb { state, .. } => {
                Some(state.as_str())
            }
            _ => None,
        }
    }
}

impl From<mysql_async::Error> for OscError {
    fn from(error: mysql_async::Error) -> Self {
        match error {
            mysql_async::Error::Server(ref err) => {
                if TRANSIENT_CODES.contains(&err.code) {
                    OscError::TransientDb {
                        code: err.code,
                        state: err.state.clone(),
                        msg: err.message.clone(),
                    }
                } else {
                    OscError::FatalDb {
                        code: err.code,
                        state: err.state.clone(),
                        msg: err.message.clone(),
                    }
                }
            }
            // 网络断连按 transient 处理，由上层重试
            mysql_async::Error::Io(err) => OscError::TransientDb {
                code: 2013,
                state: String::from("08S01"),
                msg: err.to_string(),
            },
            other => OscError::FatalDb {
                code: 0,
                state: String::from("HY000"),
                msg: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::OscError;

    #[test]
    fn test_exit_code() {
        let e = OscError::Parse {
            line: 1,
            column: 2,
            msg: String::from("x"),
        };
        assert_eq!(e.exit_code(), 1);
        assert_eq!(OscError::Validation(String::from("pk")).exit_code(), 1);
        assert_eq!(OscError::Cancelled.exit_code(), 2);
        assert_eq!(OscError::Cleanup(String::from("drop")).exit_code(), 3);
    }

    #[test]
    fn test_transient() {
        let e = OscError::TransientDb {
            code: 1213,
            state: String::from("40001"),
            msg: String::from("Deadlock found"),
        };
        assert!(e.is_transient());
        assert_eq!(e.sql_state(), Some("40001"));
    }
}
