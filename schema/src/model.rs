//! Normalized in-memory description of one table.
//!
//! 两个 schema 语义相等, 当且仅当规范化后的 DDL 文本完全一致。
//! 规范化内容: 整数显示宽度、字符集/排序规则继承、索引排序、
//! 分区子句中的引擎描述。

use std::fmt;

use common::sql::{quote_ident, quote_string};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub checks: Vec<CheckDef>,
    pub foreign_keys: Vec<String>,
    pub partition: Option<PartitionDef>,
    pub options: TableOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub auto_increment: bool,
    pub on_update_current_ts: bool,
    pub generated: Option<GeneratedDef>,
    pub comment: Option<String>,
}

/// SQL type with length/precision. `base` is kept lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlType {
    pub base: String,
    pub length: Option<u32>,
    pub scale: Option<u32>,
    pub unsigned: bool,
    pub zerofill: bool,
    /// enum / set 的取值列表
    pub value_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    Null,
    /// Quoted literal or number, stored unquoted.
    Literal(String),
    /// CURRENT_TIMESTAMP and friends, or a parenthesized 8.0 expression.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDef {
    pub expr: String,
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// "PRIMARY" for the primary key.
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<IndexColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IndexKind {
    Primary,
    Unique,
    NonUnique,
    Fulltext,
    Spatial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    /// 前缀索引长度
    pub prefix: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDef {
    pub name: Option<String>,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDef {
    pub kind: PartitionKind,
    /// HASH/RANGE/LIST 的表达式, KEY/COLUMNS 的列名列表原样保存
    pub expr: String,
    pub columns_variant: bool,
    /// PARTITIONS n（HASH/KEY）
    pub count: Option<u32>,
    pub partitions: Vec<PartitionSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PartitionKind {
    Range,
    List,
    Hash,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    /// VALUES LESS THAN (...) / VALUES IN (...) 的原始文本
    pub values: Option<String>,
    /// Per-partition engine clause; stripped during canonicalization.
    pub engine: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub engine: Option<String>,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub row_format: Option<String>,
    pub comment: Option<String>,
    pub auto_increment: Option<u64>,
}

/// Default collation per charset, used when only the charset is named.
const CHARSET_DEFAULT_COLLATION: [(&str, &str); 7] = [
    ("latin1", "latin1_swedish_ci"),
    ("utf8", "utf8_general_ci"),
    ("utf8mb3", "utf8mb3_general_ci"),
    ("utf8mb4", "utf8mb4_general_ci"),
    ("ascii", "ascii_general_ci"),
    ("binary", "binary"),
    ("gbk", "gbk_chinese_ci"),
];

pub fn default_collation_for(charset: &str) -> Option<&'static str> {
    CHARSET_DEFAULT_COLLATION
        .iter()
        .find(|(cs, _)| cs.eq_ignore_ascii_case(charset))
        .map(|(_, coll)| *coll)
}

pub fn charset_of_collation(collation: &str) -> &str {
    match collation.find('_') {
        Some(idx) => &collation[..idx],
        None => collation,
    }
}

const INTEGER_BASES: [&str; 6] = ["tinyint", "smallint", "mediumint", "int", "integer", "bigint"];

const TEXT_BASES: [&str; 8] = [
    "char",
    "varchar",
    "tinytext",
    "text",
    "mediumtext",
    "longtext",
    "enum",
    "set",
];

impl SqlType {
    pub fn new(base: &str) -> Self {
        SqlType {
            base: base.to_ascii_lowercase(),
            length: None,
            scale: None,
            unsigned: false,
            zerofill: false,
            value_list: Vec::new(),
        }
    }

    pub fn is_integer(&self) -> bool {
        INTEGER_BASES.contains(&self.base.as_str())
    }

    pub fn is_text(&self) -> bool {
        TEXT_BASES.contains(&self.base.as_str())
    }

    /// Width rank inside the integer family, for narrowing detection.
    pub fn integer_rank(&self) -> Option<u8> {
        match self.base.as_str() {
            "tinyint" => Some(1),
            "smallint" => Some(2),
            "mediumint" => Some(3),
            "int" | "integer" => Some(4),
            "bigint" => Some(5),
            _ => None,
        }
    }

    /// Drop display widths and alias spellings so that `int(11)` and
    /// `INTEGER` compare equal.
    pub fn canonicalize(&mut self) {
        if self.base == "integer" {
            self.base = String::from("int");
        }
        if self.base == "numeric" {
            self.base = String::from("decimal");
        }
        if self.is_integer() {
            self.length = None;
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if !self.value_list.is_empty() {
            let vals: Vec<String> = self.value_list.iter().map(|v| quote_string(v)).collect();
            write!(f, "({})", vals.join(","))?;
        } else if let Some(len) = self.length {
            match self.scale {
                Some(scale) => write!(f, "({},{})", len, scale)?,
                None => write!(f, "({})", len)?,
            }
        }
        if self.unsigned {
            write!(f, " unsigned")?;
        }
        if self.zerofill {
            write!(f, " zerofill")?;
        }
        Ok(())
    }
}

impl TableDef {
    /// 主键; 不存在时返回 None
    pub fn primary_key(&self) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.kind == IndexKind::Primary)
    }

    /// The index the copy engine chunks by: the primary key, else the
    /// first unique index whose columns are all NOT NULL.
    pub fn effective_key(&self) -> Option<&IndexDef> {
        if let Some(pk) = self.primary_key() {
            return Some(pk);
        }
        self.indexes.iter().find(|i| {
            i.kind == IndexKind::Unique
                && i.columns.iter().all(|ic| {
                    self.column(&ic.name)
                        .map(|c| !c.nullable)
                        .unwrap_or(false)
                })
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Effective collation of a column after table-level resolution.
    pub fn column_collation(&self, col: &ColumnDef) -> Option<String> {
        if let Some(coll) = &col.collation {
            return Some(coll.clone());
        }
        if let Some(cs) = &col.charset {
            return default_collation_for(cs).map(|s| s.to_string());
        }
        if !col.sql_type.is_text() {
            return None;
        }
        if let Some(coll) = &self.options.collation {
            return Some(coll.clone());
        }
        self.options
            .charset
            .as_deref()
            .and_then(default_collation_for)
            .map(|s| s.to_string())
    }

    /// Canonical clone used for semantic equality and shadow DDL.
    pub fn canonical(&self) -> TableDef {
        let mut t = self.clone();
        t.canonicalize();
        t
    }

    pub fn canonicalize(&mut self) {
        // table charset/collation 互相补全
        if self.options.collation.is_none() {
            if let Some(cs) = self.options.charset.clone() {
                self.options.collation = default_collation_for(&cs).map(|s| s.to_string());
            }
        }
        if self.options.charset.is_none() {
            if let Some(coll) = self.options.collation.clone() {
                self.options.charset = Some(charset_of_collation(&coll).to_string());
            }
        }
        if let Some(engine) = &self.options.engine {
            self.options.engine = Some(engine.to_ascii_lowercase());
        }
        // AUTO_INCREMENT 计数器是运行时状态, 不参与语义比较
        self.options.auto_increment = None;

        let table_charset = self.options.charset.clone();
        let table_collation = self.options.collation.clone();

        for col in &mut self.columns {
            col.sql_type.canonicalize();
            if col.sql_type.is_text() {
                if col.collation.is_none() {
                    col.collation = match &col.charset {
                        Some(cs) => default_collation_for(cs).map(|s| s.to_string()),
                        None => table_collation.clone(),
                    };
                }
                if col.charset.is_none() {
                    col.charset = match &col.collation {
                        Some(coll) => Some(charset_of_collation(coll).to_string()),
                        None => table_charset.clone(),
                    };
                }
            }
        }

        // PRIMARY first, the rest sorted by name
        self.indexes.sort_by(|a, b| {
            let a_primary = a.kind == IndexKind::Primary;
            let b_primary = b.kind == IndexKind::Primary;
            b_primary.cmp(&a_primary).then_with(|| a.name.cmp(&b.name))
        });

        if let Some(part) = &mut self.partition {
            for spec in &mut part.partitions {
                spec.engine = None;
            }
        }
    }

    /// Semantic equality: canonical forms render byte-identically.
    pub fn semantic_eq(&self, other: &TableDef) -> bool {
        self.canonical().to_string() == other.canonical().to_string()
    }

    /// Same definition under a different table name (shadow table DDL).
    pub fn with_name(&self, name: &str) -> TableDef {
        let mut t = self.clone();
        t.name = name.to_string();
        t
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", quote_ident(&self.name), self.sql_type)?;
        if let Some(cs) = &self.charset {
            write!(f, " CHARACTER SET {}", cs)?;
        }
        if let Some(coll) = &self.collation {
            write!(f, " COLLATE {}", coll)?;
        }
        if let Some(gen) = &self.generated {
            write!(
                f,
                " GENERATED ALWAYS AS ({}) {}",
                gen.expr,
                if gen.stored { "STORED" } else { "VIRTUAL" }
            )?;
        }
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        if let Some(default) = &self.default {
            match default {
                DefaultValue::Null => write!(f, " DEFAULT NULL")?,
                DefaultValue::Literal(v) => write!(f, " DEFAULT {}", quote_string(v))?,
                DefaultValue::Expr(e) => write!(f, " DEFAULT {}", e)?,
            }
        }
        if self.on_update_current_ts {
            write!(f, " ON UPDATE CURRENT_TIMESTAMP")?;
        }
        if self.auto_increment {
            write!(f, " AUTO_INCREMENT")?;
        }
        if let Some(comment) = &self.comment {
            write!(f, " COMMENT {}", quote_string(comment))?;
        }
        Ok(())
    }
}

impl fmt::Display for IndexDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| match c.prefix {
                Some(p) => format!("{}({})", quote_ident(&c.name), p),
                None => quote_ident(&c.name),
            })
            .collect();
        let cols = cols.join(",");

        match self.kind {
            IndexKind::Primary => write!(f, "PRIMARY KEY ({})", cols),
            IndexKind::Unique => write!(f, "UNIQUE KEY {} ({})", quote_ident(&self.name), cols),
            IndexKind::NonUnique => write!(f, "KEY {} ({})", quote_ident(&self.name), cols),
            IndexKind::Fulltext => {
                write!(f, "FULLTEXT KEY {} ({})", quote_ident(&self.name), cols)
            }
            IndexKind::Spatial => write!(f, "SPATIAL KEY {} ({})", quote_ident(&self.name), cols),
        }
    }
}

impl fmt::Display for PartitionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PartitionKind::Range => "RANGE",
            PartitionKind::List => "LIST",
            PartitionKind::Hash => "HASH",
            PartitionKind::Key => "KEY",
        };
        if self.columns_variant {
            write!(f, "PARTITION BY {} COLUMNS({})", kind, self.expr)?;
        } else {
            write!(f, "PARTITION BY {}({})", kind, self.expr)?;
        }
        if let Some(count) = self.count {
            write!(f, " PARTITIONS {}", count)?;
        }
        if !self.partitions.is_empty() {
            let specs: Vec<String> = self
                .partitions
                .iter()
                .map(|p| {
                    let mut s = format!("PARTITION {}", quote_ident(&p.name));
                    if let Some(values) = &p.values {
                        s.push(' ');
                        s.push_str(values);
                    }
                    if let Some(engine) = &p.engine {
                        s.push_str(&format!(" ENGINE = {}", engine));
                    }
                    s
                })
                .collect();
            write!(f, "\n({})", specs.join(",\n "))?;
        }
        Ok(())
    }
}

impl fmt::Display for TableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CREATE TABLE {} (", quote_ident(&self.name))?;

        let mut lines: Vec<String> = Vec::new();
        for col in &self.columns {
            lines.push(format!("  {}", col));
        }
        for idx in &self.indexes {
            lines.push(format!("  {}", idx));
        }
        for check in &self.checks {
            match &check.name {
                Some(name) => lines.push(format!(
                    "  CONSTRAINT {} CHECK ({})",
                    quote_ident(name),
                    check.expr
                )),
                None => lines.push(format!("  CHECK ({})", check.expr)),
            }
        }
        for fk in &self.foreign_keys {
            lines.push(format!("  {}", fk));
        }
        writeln!(f, "{}", lines.join(",\n"))?;
        write!(f, ")")?;

        if let Some(engine) = &self.options.engine {
            write!(f, " ENGINE={}", engine)?;
        }
        if let Some(ai) = self.options.auto_increment {
            write!(f, " AUTO_INCREMENT={}", ai)?;
        }
        if let Some(cs) = &self.options.charset {
            write!(f, " DEFAULT CHARSET={}", cs)?;
        }
        if let Some(coll) = &self.options.collation {
            write!(f, " COLLATE={}", coll)?;
        }
        if let Some(rf) = &self.options.row_format {
            write!(f, " ROW_FORMAT={}", rf)?;
        }
        if let Some(comment) = &self.options.comment {
            write!(f, " COMMENT={}", quote_string(comment))?;
        }
        if let Some(part) = &self.partition {
            write!(f, "\n{}", part)?;
        }
        Ok(())
    }
}
