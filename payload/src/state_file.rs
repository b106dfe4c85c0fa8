//! Crash-safe cleanup state.
//!
//! The record is written before the first state-mutating DDL and removed
//! as the very last cleanup step, so a crashed run can always be undone
//! from the names recorded here.

use std::path::{Path, PathBuf};

use chrono::Local;
use common::err::osc_error::OscError;
use common::err::OResult;

use crate::idents::SessionIdents;

/// Line-delimited, fixed order. Bump the header on layout changes.
const STATE_FILE_VERSION: &str = "osc-state-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub database: String,
    pub source: String,
    pub shadow: String,
    pub delta: String,
    pub old: String,
    pub outfile_dir: PathBuf,
    pub trigger_ins: String,
    pub trigger_upd: String,
    pub trigger_del: String,
    pub pid: u32,
    pub created_at: String,
}

impl StateRecord {
    pub fn new(database: &str, idents: &SessionIdents) -> StateRecord {
        StateRecord {
            database: database.to_string(),
            source: idents.source.clone(),
            shadow: idents.shadow.clone(),
            delta: idents.delta.clone(),
            old: idents.old.clone(),
            outfile_dir: idents.outfile_dir.clone(),
            trigger_ins: idents.trigger_ins.clone(),
            trigger_upd: idents.trigger_upd.clone(),
            trigger_del: idents.trigger_del.clone(),
            pid: std::process::id(),
            created_at: Local::now().to_rfc3339(),
        }
    }

    fn render(&self) -> String {
        [
            STATE_FILE_VERSION,
            &self.database,
            &self.source,
            &self.shadow,
            &self.delta,
            &self.old,
            &self.outfile_dir.to_string_lossy(),
            &self.trigger_ins,
            &self.trigger_upd,
            &self.trigger_del,
            &self.pid.to_string(),
            &self.created_at,
        ]
        .join("\n")
    }

    pub fn parse(content: &str) -> OResult<StateRecord> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() < 12 || lines[0] != STATE_FILE_VERSION {
            return Err(OscError::Cleanup(String::from(
                "unrecognized state file layout",
            )));
        }
        let pid = lines[10]
            .parse::<u32>()
            .map_err(|_| OscError::Cleanup(String::from("bad pid in state file")))?;

        Ok(StateRecord {
            database: lines[1].to_string(),
            source: lines[2].to_string(),
            shadow: lines[3].to_string(),
            delta: lines[4].to_string(),
            old: lines[5].to_string(),
            outfile_dir: PathBuf::from(lines[6]),
            trigger_ins: lines[7].to_string(),
            trigger_upd: lines[8].to_string(),
            trigger_del: lines[9].to_string(),
            pid,
            created_at: lines[11].to_string(),
        })
    }
}

/// `<root>/osc.<pid>.state`
pub fn state_path(root: &Path, pid: u32) -> PathBuf {
    root.join(format!("osc.{}.state", pid))
}

pub async fn write_state(path: &Path, record: &StateRecord) -> OResult<()> {
    tokio::fs::write(path, record.render()).await?;
    Ok(())
}

pub async fn read_state(path: &Path) -> OResult<StateRecord> {
    let content = tokio::fs::read_to_string(path).await?;
    StateRecord::parse(&content)
}

pub async fn remove_state(path: &Path) -> OResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every state file under `root`, any pid.
pub async fn find_state_files(root: &Path) -> OResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("osc.") && name.ends_with(".state") {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use crate::idents::SessionIdents;

    use super::{find_state_files, read_state, remove_state, state_path, write_state, StateRecord};

    #[tokio::test]
    async fn test_round_trip() {
        let dir = std::env::temp_dir().join(format!("osc_state_test_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let idents = SessionIdents::with_nonce("table1", Path::new("/tmp"), "deadbeef");
        let record = StateRecord::new("test", &idents);
        let path = state_path(&dir, record.pid);

        write_state(&path, &record).await.unwrap();
        let loaded = read_state(&path).await.unwrap();
        assert_eq!(record, loaded);

        let listed = find_state_files(&dir).await.unwrap();
        assert_eq!(listed, vec![path.clone()]);

        // removal is idempotent
        remove_state(&path).await.unwrap();
        remove_state(&path).await.unwrap();
        assert!(find_state_files(&dir).await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StateRecord::parse("not a state file").is_err());
    }
}
