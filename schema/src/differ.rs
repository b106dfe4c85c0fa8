//! Schema differ: classifies the change between two table definitions and
//! derives the projection used to populate the shadow table.

use std::fmt;

use common::err::osc_error::OscError;
use common::err::OResult;
use tracing::debug;

use crate::model::{ColumnDef, IndexKind, TableDef};

/// Policy knobs, a copy of the engine options the differ cares about.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub allow_new_pk: bool,
    pub allow_no_pk: bool,
    pub eliminate_dups: bool,
    pub fail_for_implicit_conv: bool,
    pub no_engine_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Canonical forms are byte-identical; nothing to do.
    Identical,
    /// A row-by-row copy with the projection is well defined and lossless.
    SafeCopy,
    /// The copy is possible but at least one column conversion is lossy.
    Unsafe,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoPrimaryKey,
    PrimaryKeyChange,
    CollationChangeCollision { column: String },
    ImplicitConversion { column: String, detail: String },
    EngineMismatch { old: String, new: String },
    /// CHECK constraints / stored generated columns / foreign keys.
    UnsupportedConstruct(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoPrimaryKey => {
                write!(f, "new schema has no primary or unique key (use allow_no_pk to override)")
            }
            RejectReason::PrimaryKeyChange => {
                write!(f, "primary key differs between schemas (use allow_new_pk to override)")
            }
            RejectReason::CollationChangeCollision { column } => write!(
                f,
                "collation change on keyed column `{}` may collapse distinct keys (use eliminate_dups to override)",
                column
            ),
            RejectReason::ImplicitConversion { column, detail } => {
                write!(f, "column `{}` needs an implicit conversion: {}", column, detail)
            }
            RejectReason::EngineMismatch { old, new } => {
                write!(f, "engine change {} -> {} (use no_engine_check to override)", old, new)
            }
            RejectReason::UnsupportedConstruct(what) => {
                write!(f, "unsupported construct: {}", what)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    AddColumn(String),
    DropColumn(String),
    ModifyColumn { name: String, detail: String },
    AddIndex(String),
    DropIndex(String),
    OptionChange(String),
    PartitionChange,
}

#[derive(Debug, Clone)]
pub struct SchemaDiff {
    pub entries: Vec<DiffEntry>,
    pub classification: Classification,
    /// Shared, non-generated columns in new-schema order: the safe-copy
    /// projection for outfile select and replay.
    pub projection: Vec<String>,
}

impl SchemaDiff {
    pub fn is_identical(&self) -> bool {
        self.classification == Classification::Identical
    }

    /// Err(Validation) when the classification is Rejected, Ok otherwise.
    pub fn into_checked(self) -> OResult<SchemaDiff> {
        if let Classification::Rejected(reason) = &self.classification {
            return Err(OscError::Validation(reason.to_string()));
        }
        Ok(self)
    }
}

pub fn diff(old: &TableDef, new: &TableDef, opts: &DiffOptions) -> SchemaDiff {
    let old = old.canonical();
    let new = new.canonical();

    let projection = projection_of(&old, &new);

    if let Some(reason) = reject_reason(&old, &new, opts) {
        debug!("schema change rejected: {}", reason);
        return SchemaDiff {
            entries: Vec::new(),
            classification: Classification::Rejected(reason),
            projection,
        };
    }

    let entries = entries_of(&old, &new);
    let classification = if entries.is_empty() {
        Classification::Identical
    } else if has_implicit_conversion(&old, &new, opts).is_some() {
        Classification::Unsafe
    } else {
        Classification::SafeCopy
    };

    SchemaDiff {
        entries,
        classification,
        projection,
    }
}

fn reject_reason(old: &TableDef, new: &TableDef, opts: &DiffOptions) -> Option<RejectReason> {
    // constructs the copy engine refuses to reason about
    for (t, label) in [(old, "current"), (new, "target")] {
        if !t.foreign_keys.is_empty() {
            return Some(RejectReason::UnsupportedConstruct(format!(
                "foreign keys on the {} schema",
                label
            )));
        }
        if !t.checks.is_empty() {
            return Some(RejectReason::UnsupportedConstruct(format!(
                "CHECK constraints on the {} schema",
                label
            )));
        }
    }
    if let Some(col) = new
        .columns
        .iter()
        .find(|c| c.generated.as_ref().map(|g| g.stored).unwrap_or(false))
    {
        return Some(RejectReason::UnsupportedConstruct(format!(
            "stored generated column `{}`",
            col.name
        )));
    }

    // 1. keyless target
    if new.effective_key().is_none() && !opts.allow_no_pk {
        return Some(RejectReason::NoPrimaryKey);
    }

    // 2. primary key change (removal, introduction, different columns)
    let old_pk = pk_columns(old);
    let new_pk = pk_columns(new);
    if old_pk != new_pk && !opts.allow_new_pk {
        return Some(RejectReason::PrimaryKeyChange);
    }

    // 3. collation change on a keyed column may collapse distinct values
    if !opts.eliminate_dups {
        for col in &new.columns {
            let Some(old_col) = old.column(&col.name) else {
                continue;
            };
            if !is_keyed(old, &col.name) && !is_keyed(new, &col.name) {
                continue;
            }
            let old_coll = old.column_collation(old_col);
            let new_coll = new.column_collation(col);
            if old_coll != new_coll {
                let collapsing = new_coll
                    .as_deref()
                    .map(|c| !c.ends_with("_bin") && c != "binary")
                    .unwrap_or(false);
                if collapsing || old_col.charset != col.charset {
                    return Some(RejectReason::CollationChangeCollision {
                        column: col.name.clone(),
                    });
                }
            }
        }
    }

    // 4. implicit conversions
    if opts.fail_for_implicit_conv {
        if let Some((column, detail)) = has_implicit_conversion(old, new, opts) {
            return Some(RejectReason::ImplicitConversion { column, detail });
        }
    }

    // 5. engine change
    if !opts.no_engine_check {
        if let (Some(old_engine), Some(new_engine)) = (&old.options.engine, &new.options.engine) {
            if old_engine != new_engine {
                return Some(RejectReason::EngineMismatch {
                    old: old_engine.clone(),
                    new: new_engine.clone(),
                });
            }
        }
    }

    None
}

fn pk_columns(t: &TableDef) -> Vec<String> {
    t.primary_key()
        .map(|i| i.columns.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

fn is_keyed(t: &TableDef, column: &str) -> bool {
    t.indexes.iter().any(|i| {
        matches!(i.kind, IndexKind::Primary | IndexKind::Unique)
            && i.columns.iter().any(|c| c.name == column)
    })
}

const TEXT_FAMILY_RANK: [(&str, u8); 6] = [
    ("char", 1),
    ("varchar", 1),
    ("tinytext", 1),
    ("text", 2),
    ("mediumtext", 3),
    ("longtext", 4),
];

fn text_rank(base: &str) -> Option<u8> {
    TEXT_FAMILY_RANK
        .iter()
        .find(|(b, _)| *b == base)
        .map(|(_, r)| *r)
}

/// First lossy conversion between shared columns, if any.
fn has_implicit_conversion(
    old: &TableDef,
    new: &TableDef,
    opts: &DiffOptions,
) -> Option<(String, String)> {
    for col in &new.columns {
        let Some(old_col) = old.column(&col.name) else {
            continue;
        };
        if let Some(detail) = lossy_conversion(old_col, col, opts) {
            return Some((col.name.clone(), detail));
        }
    }
    None
}

fn lossy_conversion(old: &ColumnDef, new: &ColumnDef, opts: &DiffOptions) -> Option<String> {
    let ot = &old.sql_type;
    let nt = &new.sql_type;

    if let (Some(old_rank), Some(new_rank)) = (ot.integer_rank(), nt.integer_rank()) {
        if new_rank < old_rank {
            return Some(format!("narrowing {} to {}", ot.base, nt.base));
        }
        if ot.unsigned != nt.unsigned {
            return Some(String::from("signedness change"));
        }
        return None;
    }

    if ot.base == nt.base && (ot.base == "varchar" || ot.base == "char") {
        if !opts.eliminate_dups {
            if let (Some(old_len), Some(new_len)) = (ot.length, nt.length) {
                if new_len < old_len {
                    return Some(format!("shorter {} ({} -> {})", nt.base, old_len, new_len));
                }
            }
        }
        if old.charset != new.charset {
            return Some(format!(
                "charset change {:?} -> {:?}",
                old.charset, new.charset
            ));
        }
        return None;
    }

    if let (Some(old_rank), Some(new_rank)) = (text_rank(&ot.base), text_rank(&nt.base)) {
        if new_rank < old_rank {
            return Some(format!("narrowing {} to {}", ot.base, nt.base));
        }
        return None;
    }

    if ot.base == "decimal" && nt.base == "decimal" {
        let old_len = ot.length.unwrap_or(10);
        let new_len = nt.length.unwrap_or(10);
        let old_scale = ot.scale.unwrap_or(0);
        let new_scale = nt.scale.unwrap_or(0);
        if new_len < old_len || new_scale < old_scale {
            return Some(String::from("decimal precision loss"));
        }
        return None;
    }

    if ot.base != nt.base {
        return Some(format!("type change {} -> {}", ot.base, nt.base));
    }

    None
}

fn entries_of(old: &TableDef, new: &TableDef) -> Vec<DiffEntry> {
    let mut entries = Vec::new();

    for col in &old.columns {
        if new.column(&col.name).is_none() {
            entries.push(DiffEntry::DropColumn(col.name.clone()));
        }
    }
    for col in &new.columns {
        match old.column(&col.name) {
            None => entries.push(DiffEntry::AddColumn(col.name.clone())),
            Some(old_col) => {
                let before = old_col.to_string();
                let after = col.to_string();
                if before != after {
                    entries.push(DiffEntry::ModifyColumn {
                        name: col.name.clone(),
                        detail: format!("{} -> {}", before, after),
                    });
                }
            }
        }
    }

    let index_repr =
        |t: &TableDef| -> Vec<(String, String)> {
            t.indexes.iter().map(|i| (i.name.clone(), i.to_string())).collect()
        };
    let old_indexes = index_repr(old);
    let new_indexes = index_repr(new);
    for (name, repr) in &old_indexes {
        if !new_indexes.iter().any(|(_, r)| r == repr) {
            entries.push(DiffEntry::DropIndex(name.clone()));
        }
    }
    for (name, repr) in &new_indexes {
        if !old_indexes.iter().any(|(_, r)| r == repr) {
            entries.push(DiffEntry::AddIndex(name.clone()));
        }
    }

    let opt_changes = [
        ("engine", &old.options.engine, &new.options.engine),
        ("charset", &old.options.charset, &new.options.charset),
        ("collation", &old.options.collation, &new.options.collation),
        ("row_format", &old.options.row_format, &new.options.row_format),
        ("comment", &old.options.comment, &new.options.comment),
    ];
    for (what, before, after) in opt_changes {
        if before != after {
            entries.push(DiffEntry::OptionChange(format!(
                "{}: {:?} -> {:?}",
                what, before, after
            )));
        }
    }

    let partition_repr = |t: &TableDef| t.partition.as_ref().map(|p| p.to_string());
    if partition_repr(old) != partition_repr(new) {
        entries.push(DiffEntry::PartitionChange);
    }

    entries
}

fn projection_of(old: &TableDef, new: &TableDef) -> Vec<String> {
    new.columns
        .iter()
        .filter(|c| c.generated.is_none())
        .filter(|c| old.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::{diff, Classification, DiffEntry, DiffOptions, RejectReason};
    use crate::parser::parse_create_table;

    fn opts() -> DiffOptions {
        DiffOptions::default()
    }

    /// diff(S, S) = identical
    #[test]
    fn test_diff_reflexive() {
        let t = parse_create_table(
            "CREATE TABLE t (id INT NOT NULL, data VARCHAR(10), PRIMARY KEY (id))
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        )
        .unwrap();
        let d = diff(&t, &t, &opts());
        assert_eq!(d.classification, Classification::Identical);
        assert!(d.entries.is_empty());
        assert_eq!(d.projection, vec!["id", "data"]);
    }

    #[test]
    fn test_add_column_is_safe_copy() {
        let old = parse_create_table("CREATE TABLE t1 (id INT NOT NULL, PRIMARY KEY (id))").unwrap();
        let new = parse_create_table(
            "CREATE TABLE t1 (id INT NOT NULL, data VARCHAR(10) DEFAULT NULL, PRIMARY KEY (id))",
        )
        .unwrap();

        let d = diff(&old, &new, &opts());
        assert_eq!(d.classification, Classification::SafeCopy);
        assert_eq!(d.entries, vec![DiffEntry::AddColumn(String::from("data"))]);
        // 新增列不在投影中
        assert_eq!(d.projection, vec!["id"]);
    }

    /// Scenario: PK shrinks from (id1,id2,id3) to (id2,id3) without opt-in.
    #[test]
    fn test_pk_removal_rejected() {
        let old = parse_create_table(
            "CREATE TABLE t (id1 INT NOT NULL, id2 INT NOT NULL, id3 INT NOT NULL,
             PRIMARY KEY (id1, id2, id3))",
        )
        .unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (id1 INT NOT NULL, id2 INT NOT NULL, id3 INT NOT NULL,
             PRIMARY KEY (id2, id3))",
        )
        .unwrap();

        let d = diff(&old, &new, &opts());
        assert_eq!(
            d.classification,
            Classification::Rejected(RejectReason::PrimaryKeyChange)
        );

        let mut relaxed = opts();
        relaxed.allow_new_pk = true;
        assert_eq!(diff(&old, &new, &relaxed).classification, Classification::SafeCopy);
    }

    #[test]
    fn test_keyless_target_rejected() {
        let old = parse_create_table("CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id))").unwrap();
        let new = parse_create_table("CREATE TABLE t (id INT NOT NULL)").unwrap();

        let d = diff(&old, &new, &opts());
        assert_eq!(
            d.classification,
            Classification::Rejected(RejectReason::NoPrimaryKey)
        );
    }

    /// Scenario: collation change on the PK column without eliminate_dups.
    #[test]
    fn test_collation_collision_rejected() {
        let old = parse_create_table(
            "CREATE TABLE t (data VARCHAR(10) NOT NULL, PRIMARY KEY (data))
             DEFAULT CHARSET=latin1",
        )
        .unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (data VARCHAR(10) NOT NULL COLLATE latin1_general_cs, PRIMARY KEY (data))
             DEFAULT CHARSET=latin1",
        )
        .unwrap();

        let d = diff(&old, &new, &opts());
        assert_eq!(
            d.classification,
            Classification::Rejected(RejectReason::CollationChangeCollision {
                column: String::from("data")
            })
        );

        let mut relaxed = opts();
        relaxed.eliminate_dups = true;
        assert_ne!(
            diff(&old, &new, &relaxed).classification,
            Classification::Rejected(RejectReason::CollationChangeCollision {
                column: String::from("data")
            })
        );
    }

    #[test]
    fn test_narrowing_rejected_only_with_flag() {
        let old = parse_create_table(
            "CREATE TABLE t (id BIGINT NOT NULL, PRIMARY KEY (id))",
        )
        .unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id))",
        )
        .unwrap();

        // 不加开关时归类为 unsafe, 继续执行
        let d = diff(&old, &new, &opts());
        assert_eq!(d.classification, Classification::Unsafe);

        let mut strict = opts();
        strict.fail_for_implicit_conv = true;
        match diff(&old, &new, &strict).classification {
            Classification::Rejected(RejectReason::ImplicitConversion { column, .. }) => {
                assert_eq!(column, "id");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn test_engine_change_rejected() {
        let old = parse_create_table(
            "CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id)) ENGINE=InnoDB",
        )
        .unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id)) ENGINE=MyISAM",
        )
        .unwrap();

        match diff(&old, &new, &opts()).classification {
            Classification::Rejected(RejectReason::EngineMismatch { .. }) => {}
            other => panic!("unexpected classification {other:?}"),
        }

        let mut relaxed = opts();
        relaxed.no_engine_check = true;
        assert_eq!(
            diff(&old, &new, &relaxed).classification,
            Classification::SafeCopy
        );
    }

    #[test]
    fn test_check_constraint_refused() {
        let old = parse_create_table("CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id))").unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (id INT NOT NULL, PRIMARY KEY (id), CONSTRAINT c CHECK (id > 0))",
        )
        .unwrap();

        match diff(&old, &new, &opts()).classification {
            Classification::Rejected(RejectReason::UnsupportedConstruct(_)) => {}
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn test_cosmetic_spelling_is_identical() {
        let old = parse_create_table(
            "CREATE TABLE t (id int(11) NOT NULL, PRIMARY KEY (id))
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
             /*!50100 PARTITION BY HASH (id) PARTITIONS 2 */",
        )
        .unwrap();
        let new = parse_create_table(
            "CREATE TABLE t (id INTEGER NOT NULL, PRIMARY KEY (id))
             ENGINE=innodb DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci
             PARTITION BY HASH (id) PARTITIONS 2",
        )
        .unwrap();

        let d = diff(&old, &new, &opts());
        assert_eq!(d.classification, Classification::Identical);
    }
}
