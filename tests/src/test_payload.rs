//! Payload-layer checks that run without a server: generated names and
//! every statement the engine would send.

#[cfg(test)]
mod test_payload {
    use std::path::Path;

    use mysql_async::Value;
    use payload::chglog::ChangeLog;
    use payload::chunk::{boundary_sql, dump_sql, load_sql, CopyPlan};
    use payload::idents::SessionIdents;
    use payload::replay::{delete_sql, fetch_sql, replace_sql, ReplayPlan};
    use payload::state_file::StateRecord;
    use schema::parser::parse_create_table;

    fn idents_for(table: &str) -> SessionIdents {
        SessionIdents::with_nonce(table, Path::new("/tmp"), "cafebabe")
    }

    /// All generated identifiers for the unicode table quote correctly,
    /// and survive the state-file round trip.
    #[tokio::test]
    async fn test_unicode_generated_identifiers() {
        let name = "(╯°□°）╯︵ ┻━┻";
        let table = parse_create_table(&format!(
            "CREATE TABLE `{}` (id INT NOT NULL, data VARCHAR(10), PRIMARY KEY (id))",
            name
        ))
        .unwrap();

        let idents = idents_for(name);
        assert_eq!(idents.shadow, format!("_{}_new", name));

        let log = ChangeLog::new(&idents, &table).unwrap();
        for stmt in log.create_statements() {
            // 表名中的全角括号等字符必须完整出现在反引号内
            assert!(stmt.contains(name), "statement lost the name: {}", stmt);
        }

        let dir = std::env::temp_dir().join(format!("osc_unicode_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("probe.state");

        let record = StateRecord::new("test", &idents);
        payload::state_file::write_state(&path, &record).await.unwrap();
        let parsed = payload::state_file::read_state(&path).await.unwrap();
        assert_eq!(parsed.source, name);
        assert_eq!(parsed.shadow, idents.shadow);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    /// The full statement set of one small copy, end to end on SQL level.
    #[test]
    fn test_statement_set_for_simple_table() {
        let copy_plan = CopyPlan {
            source: String::from("table1"),
            shadow: String::from("_table1_new"),
            pk_cols: vec![String::from("id")],
            projection: vec![String::from("id")],
            chunk_size: 500,
            additional_where: None,
            eliminate_dups: false,
            skip_affected_rows_check: false,
            compression: None,
            max_chunk_retries: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 1000,
        };

        assert_eq!(
            boundary_sql(&copy_plan, &None),
            "SELECT `id` FROM `table1` ORDER BY `id` LIMIT 499, 1"
        );

        let dump = dump_sql(
            &copy_plan,
            &Some(vec![Value::Int(2)]),
            &None,
            "/tmp/x/chunk_00000001.outfile",
        );
        assert_eq!(
            dump,
            "SELECT `id` FROM `table1` WHERE ((`id` > 2)) ORDER BY `id` \
             INTO OUTFILE '/tmp/x/chunk_00000001.outfile' CHARACTER SET binary"
        );

        assert_eq!(
            load_sql(&copy_plan, "/tmp/x/chunk_00000001.outfile"),
            "LOAD DATA INFILE '/tmp/x/chunk_00000001.outfile' INTO TABLE `_table1_new` \
             CHARACTER SET binary (`id`)"
        );

        let replay_plan = ReplayPlan {
            source: copy_plan.source.clone(),
            shadow: copy_plan.shadow.clone(),
            delta: String::from("_table1_chg"),
            pk_cols: copy_plan.pk_cols.clone(),
            projection: copy_plan.projection.clone(),
            batch_size: 500,
        };
        assert_eq!(
            fetch_sql(&replay_plan, 0),
            "SELECT `chg_id`, `chg_type`, `id` FROM `_table1_chg` WHERE `chg_id` > 0 \
             ORDER BY `chg_id` LIMIT 500"
        );
        assert_eq!(
            replace_sql(&replay_plan, &[Value::Int(1)]),
            "REPLACE INTO `_table1_new` (`id`) SELECT `id` FROM `table1` WHERE `id` = 1"
        );
        assert_eq!(
            delete_sql(&replay_plan, &[Value::Int(1)]),
            "DELETE FROM `_table1_new` WHERE `id` = 1"
        );
    }

    /// Composite keys show up in PK order everywhere.
    #[test]
    fn test_composite_key_ordering() {
        let table = parse_create_table(
            "CREATE TABLE t (id1 INT NOT NULL, id2 INT NOT NULL, id3 INT NOT NULL, v INT,
             PRIMARY KEY (id1, id2, id3))",
        )
        .unwrap();
        let idents = idents_for("t");
        let log = ChangeLog::new(&idents, &table).unwrap();
        assert_eq!(log.pk_cols(), &["id1", "id2", "id3"]);

        let delta_ddl = &log.create_statements()[0];
        let p1 = delta_ddl.find("`id1`").unwrap();
        let p2 = delta_ddl.find("`id2`").unwrap();
        let p3 = delta_ddl.find("`id3`").unwrap();
        assert!(p1 < p2 && p2 < p3);
    }

    /// Re-running the purge/fetch pair over an already-applied prefix is
    /// a no-op on SQL level: the fetch window opens past the high-water
    /// mark, never below it.
    #[test]
    fn test_replay_window_monotonic() {
        let plan = ReplayPlan {
            source: String::from("t"),
            shadow: String::from("_t_new"),
            delta: String::from("_t_chg"),
            pk_cols: vec![String::from("id")],
            projection: vec![String::from("id")],
            batch_size: 100,
        };
        for h in [0u64, 10, 10, 57] {
            let sql = fetch_sql(&plan, h);
            assert!(sql.contains(&format!("`chg_id` > {}", h)));
        }
    }
}
