//! Session-scoped identifiers derived from the source table name.
//!
//! 所有名字带 nonce, 同一个表的两次运行互不冲突; 超长表名截断后仍然
//! 保持唯一。

use std::path::{Path, PathBuf};

/// MySQL identifier limit, in characters.
const MAX_IDENT_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionIdents {
    pub source: String,
    pub shadow: String,
    pub delta: String,
    pub old: String,
    pub trigger_ins: String,
    pub trigger_upd: String,
    pub trigger_del: String,
    pub nonce: String,
    pub outfile_dir: PathBuf,
}

impl SessionIdents {
    pub fn new(source: &str, outfile_root: &Path) -> SessionIdents {
        let nonce = format!("{:08x}", rand::random::<u32>());
        SessionIdents::with_nonce(source, outfile_root, &nonce)
    }

    pub fn with_nonce(source: &str, outfile_root: &Path, nonce: &str) -> SessionIdents {
        let outfile_dir = outfile_root.join(format!("_{}_{}", fs_safe(source), nonce));

        SessionIdents {
            source: source.to_string(),
            shadow: suffixed(source, "_new", nonce),
            delta: suffixed(source, "_chg", nonce),
            old: suffixed(source, "_old", nonce),
            trigger_ins: suffixed(source, "_chg_ins", nonce),
            trigger_upd: suffixed(source, "_chg_upd", nonce),
            trigger_del: suffixed(source, "_chg_del", nonce),
            nonce: nonce.to_string(),
            outfile_dir,
        }
    }

    /// Outfile path for one chunk attempt.
    pub fn outfile(&self, chunk: u64) -> PathBuf {
        self.outfile_dir.join(format!("chunk_{:08}.outfile", chunk))
    }
}

/// `_<source><suffix>`; when over the identifier limit the source part is
/// truncated and the nonce inserted to keep the name unique.
fn suffixed(source: &str, suffix: &str, nonce: &str) -> String {
    let full = format!("_{}{}", source, suffix);
    if full.chars().count() <= MAX_IDENT_CHARS {
        return full;
    }

    // _<head>_<nonce><suffix>
    let budget = MAX_IDENT_CHARS - suffix.chars().count() - nonce.chars().count() - 2;
    let head: String = source.chars().take(budget).collect();
    format!("_{}_{}{}", head, nonce, suffix)
}

/// Table names go into a directory name; keep only filesystem-safe chars.
fn fs_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{SessionIdents, MAX_IDENT_CHARS};

    #[test]
    fn test_plain_names() {
        let idents = SessionIdents::with_nonce("table1", Path::new("/tmp"), "deadbeef");
        assert_eq!(idents.shadow, "_table1_new");
        assert_eq!(idents.delta, "_table1_chg");
        assert_eq!(idents.old, "_table1_old");
        assert_eq!(idents.trigger_ins, "_table1_chg_ins");
        assert_eq!(idents.trigger_del, "_table1_chg_del");
        assert!(idents
            .outfile_dir
            .to_string_lossy()
            .starts_with("/tmp/_table1_deadbeef"));
    }

    #[test]
    fn test_unicode_name_counts_chars() {
        let name = "(╯°□°）╯︵ ┻━┻";
        let idents = SessionIdents::with_nonce(name, Path::new("/tmp"), "deadbeef");
        assert_eq!(idents.shadow, format!("_{}_new", name));
        assert!(idents.shadow.chars().count() <= MAX_IDENT_CHARS);
    }

    #[test]
    fn test_long_names_truncated_and_unique() {
        let long_a = "a".repeat(80);
        let long_b = format!("{}b", "a".repeat(80));

        let a = SessionIdents::with_nonce(&long_a, Path::new("/tmp"), "11111111");
        let b = SessionIdents::with_nonce(&long_b, Path::new("/tmp"), "22222222");

        for name in [
            &a.shadow,
            &a.delta,
            &a.old,
            &a.trigger_ins,
            &a.trigger_upd,
            &a.trigger_del,
        ] {
            assert!(name.chars().count() <= MAX_IDENT_CHARS, "{} too long", name);
        }
        // 截断后靠 nonce 保持唯一
        assert_ne!(a.shadow, b.shadow);
        assert_ne!(a.delta, b.delta);
    }
}
