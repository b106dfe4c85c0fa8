//! Change capture: the delta table plus the three AFTER triggers.
//!
//! `chg_id` 是唯一的全序; 回放从不依赖 `chg_ts`。触发器跑在源表事务内,
//! 已提交的 DML 一定按提交顺序出现在 delta 表中。

use common::err::osc_error::OscError;
use common::err::OResult;
use common::sql::quote_ident;
use connection::DbSession;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use schema::model::{ColumnDef, TableDef};
use tracing::info;

use crate::idents::SessionIdents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum ChgType {
    Insert = 1,
    UpdateNew = 2,
    Delete = 3,
}

/// Column names the delta table reserves for itself.
pub const RESERVED_DELTA_COLUMNS: [&str; 3] = ["chg_id", "chg_type", "chg_ts"];

#[derive(Debug, Clone)]
pub struct ChangeLog {
    source: String,
    delta: String,
    trigger_ins: String,
    trigger_upd: String,
    trigger_del: String,
    pk_cols: Vec<String>,
    pk_col_ddl: Vec<String>,
}

impl ChangeLog {
    pub fn new(idents: &SessionIdents, table: &TableDef) -> OResult<ChangeLog> {
        let canonical = table.canonical();
        let key = canonical.effective_key().ok_or_else(|| {
            OscError::Precondition(format!(
                "table `{}` has no usable primary or unique key",
                table.name
            ))
        })?;

        let mut pk_cols = Vec::new();
        let mut pk_col_ddl = Vec::new();
        for index_col in &key.columns {
            let col = canonical.column(&index_col.name).ok_or_else(|| {
                OscError::Precondition(format!(
                    "key column `{}` missing from table `{}`",
                    index_col.name, table.name
                ))
            })?;
            pk_cols.push(col.name.clone());
            pk_col_ddl.push(render_key_column(col));
        }

        Ok(ChangeLog {
            source: idents.source.clone(),
            delta: idents.delta.clone(),
            trigger_ins: idents.trigger_ins.clone(),
            trigger_upd: idents.trigger_upd.clone(),
            trigger_del: idents.trigger_del.clone(),
            pk_cols,
            pk_col_ddl,
        })
    }

    pub fn pk_cols(&self) -> &[String] {
        &self.pk_cols
    }

    pub fn delta_table(&self) -> &str {
        &self.delta
    }

    pub fn create_statements(&self) -> Vec<String> {
        let mut stmts = Vec::with_capacity(4);

        let mut ddl = format!(
            "CREATE TABLE {} (\n  `chg_id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,\n  `chg_type` TINYINT NOT NULL",
            quote_ident(&self.delta)
        );
        for col in &self.pk_col_ddl {
            ddl.push_str(",\n  ");
            ddl.push_str(col);
        }
        ddl.push_str(
            ",\n  `chg_ts` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,\n  PRIMARY KEY (`chg_id`)\n) ENGINE=InnoDB",
        );
        stmts.push(ddl);

        let pk_list = self
            .pk_cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let values = |prefix: &str, chg_type: ChgType| -> String {
            let mut vals = vec![format!("{}", i8::from(chg_type))];
            vals.extend(
                self.pk_cols
                    .iter()
                    .map(|c| format!("{}.{}", prefix, quote_ident(c))),
            );
            vals.join(", ")
        };
        let insert_into = format!(
            "INSERT INTO {} (`chg_type`, {})",
            quote_ident(&self.delta),
            pk_list
        );

        stmts.push(format!(
            "CREATE TRIGGER {} AFTER INSERT ON {} FOR EACH ROW {} VALUES ({})",
            quote_ident(&self.trigger_ins),
            quote_ident(&self.source),
            insert_into,
            values("NEW", ChgType::Insert)
        ));

        // PK 不变时记一条 type=2; PK 变更时编码为删旧 + 插新
        let pk_stable = self
            .pk_cols
            .iter()
            .map(|c| format!("NEW.{} <=> OLD.{}", quote_ident(c), quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        stmts.push(format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {} FOR EACH ROW BEGIN \
             IF ({}) THEN {} VALUES ({}); \
             ELSE {} VALUES ({}); {} VALUES ({}); \
             END IF; END",
            quote_ident(&self.trigger_upd),
            quote_ident(&self.source),
            pk_stable,
            insert_into,
            values("NEW", ChgType::UpdateNew),
            insert_into,
            values("OLD", ChgType::Delete),
            insert_into,
            values("NEW", ChgType::Insert),
        ));

        stmts.push(format!(
            "CREATE TRIGGER {} AFTER DELETE ON {} FOR EACH ROW {} VALUES ({})",
            quote_ident(&self.trigger_del),
            quote_ident(&self.source),
            insert_into,
            values("OLD", ChgType::Delete)
        ));

        stmts
    }

    pub fn drop_statements(&self) -> Vec<String> {
        vec![
            format!("DROP TRIGGER IF EXISTS {}", quote_ident(&self.trigger_ins)),
            format!("DROP TRIGGER IF EXISTS {}", quote_ident(&self.trigger_upd)),
            format!("DROP TRIGGER IF EXISTS {}", quote_ident(&self.trigger_del)),
            format!("DROP TABLE IF EXISTS {}", quote_ident(&self.delta)),
        ]
    }

    pub async fn install(&self, session: &mut DbSession) -> OResult<()> {
        for stmt in self.create_statements() {
            session.exec(&stmt).await?;
        }
        info!(
            "change capture installed on `{}` (delta `{}`)",
            self.source, self.delta
        );
        Ok(())
    }

    /// Drop triggers first so writes stop feeding the delta table.
    pub async fn remove(&self, session: &mut DbSession) -> OResult<()> {
        for stmt in self.drop_statements() {
            session.exec(&stmt).await?;
        }
        info!("change capture removed from `{}`", self.source);
        Ok(())
    }
}

/// Key column copied by value into the delta table.
fn render_key_column(col: &ColumnDef) -> String {
    let mut ddl = format!("{} {}", quote_ident(&col.name), col.sql_type);
    if let Some(cs) = &col.charset {
        ddl.push_str(&format!(" CHARACTER SET {}", cs));
    }
    if let Some(coll) = &col.collation {
        ddl.push_str(&format!(" COLLATE {}", coll));
    }
    ddl.push_str(" NOT NULL");
    ddl
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use schema::parser::parse_create_table;

    use crate::idents::SessionIdents;

    use super::{ChangeLog, ChgType};

    fn changelog(ddl: &str) -> ChangeLog {
        let table = parse_create_table(ddl).unwrap();
        let idents = SessionIdents::with_nonce(&table.name, Path::new("/tmp"), "deadbeef");
        ChangeLog::new(&idents, &table).unwrap()
    }

    #[test]
    fn test_chg_type_codes() {
        assert_eq!(i8::from(ChgType::Insert), 1);
        assert_eq!(i8::from(ChgType::UpdateNew), 2);
        assert_eq!(i8::from(ChgType::Delete), 3);
        assert_eq!(ChgType::try_from(3i8).unwrap(), ChgType::Delete);
    }

    #[test]
    fn test_create_statements_shape() {
        let log = changelog(
            "CREATE TABLE t1 (id INT NOT NULL, data VARCHAR(10), PRIMARY KEY (id)) ENGINE=InnoDB",
        );
        let stmts = log.create_statements();
        assert_eq!(stmts.len(), 4);

        assert!(stmts[0].starts_with("CREATE TABLE `_t1_chg`"));
        assert!(stmts[0].contains("`chg_id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT"));
        assert!(stmts[0].contains("`id` int NOT NULL"));
        assert!(stmts[0].contains("PRIMARY KEY (`chg_id`)"));

        assert!(stmts[1].contains("AFTER INSERT ON `t1`"));
        assert!(stmts[1].contains("VALUES (1, NEW.`id`)"));
        assert!(stmts[3].contains("AFTER DELETE ON `t1`"));
        assert!(stmts[3].contains("VALUES (3, OLD.`id`)"));
    }

    #[test]
    fn test_update_trigger_encodes_pk_change() {
        let log = changelog(
            "CREATE TABLE t (a INT NOT NULL, b INT NOT NULL, v INT, PRIMARY KEY (a, b))",
        );
        let stmts = log.create_statements();
        let upd = &stmts[2];

        assert!(upd.contains("AFTER UPDATE ON `t`"));
        assert!(upd.contains("NEW.`a` <=> OLD.`a` AND NEW.`b` <=> OLD.`b`"));
        // PK 不变: 单条 type=2; PK 变更: 删旧插新
        assert!(upd.contains("VALUES (2, NEW.`a`, NEW.`b`)"));
        assert!(upd.contains("VALUES (3, OLD.`a`, OLD.`b`)"));
        assert!(upd.contains("VALUES (1, NEW.`a`, NEW.`b`)"));
    }

    #[test]
    fn test_key_column_keeps_collation() {
        let log = changelog(
            "CREATE TABLE t (data VARCHAR(10) NOT NULL, PRIMARY KEY (data)) DEFAULT CHARSET=latin1",
        );
        let stmts = log.create_statements();
        assert!(stmts[0].contains("`data` varchar(10) CHARACTER SET latin1 COLLATE latin1_swedish_ci NOT NULL"));
    }

    #[test]
    fn test_drop_statements_idempotent_form() {
        let log = changelog("CREATE TABLE t1 (id INT NOT NULL, PRIMARY KEY (id))");
        for stmt in log.drop_statements() {
            assert!(stmt.contains("IF EXISTS"));
        }
    }
}
