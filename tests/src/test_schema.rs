//! End-to-end schema-layer checks: full DDL in, classification out.

#[cfg(test)]
mod test_schema {
    use schema::differ::{diff, Classification, DiffOptions, RejectReason};
    use schema::parser::{parse_create_table, parse_statements};

    /// before.sql / new.sql of the add-column scenario.
    #[test]
    fn test_add_column_scenario_classifies_safe() {
        let before = parse_create_table(
            "CREATE TABLE `table1` (
               `id` int(11) NOT NULL,
               PRIMARY KEY (`id`)
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;",
        )
        .unwrap();
        let after = parse_create_table(
            "CREATE TABLE `table1` (
               `id` int(11) NOT NULL,
               `data` varchar(10) DEFAULT NULL,
               PRIMARY KEY (`id`)
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;",
        )
        .unwrap();

        let d = diff(&before, &after, &DiffOptions::default());
        assert_eq!(d.classification, Classification::SafeCopy);
        assert_eq!(d.projection, vec!["id"]);
    }

    /// PK (id1,id2,id3) -> (id2,id3) must be refused without allow_new_pk.
    #[test]
    fn test_pk_shrink_scenario_rejected() {
        let before = parse_create_table(
            "CREATE TABLE tbl (
               id1 INT NOT NULL, id2 INT NOT NULL, id3 INT NOT NULL, v VARCHAR(32),
               PRIMARY KEY (id1, id2, id3)
             )",
        )
        .unwrap();
        let after = parse_create_table(
            "CREATE TABLE tbl (
               id1 INT NOT NULL, id2 INT NOT NULL, id3 INT NOT NULL, v VARCHAR(32),
               PRIMARY KEY (id2, id3)
             )",
        )
        .unwrap();

        let d = diff(&before, &after, &DiffOptions::default());
        assert_eq!(
            d.classification,
            Classification::Rejected(RejectReason::PrimaryKeyChange)
        );
        // 被拒绝的变更应报退出码 1
        assert_eq!(d.into_checked().unwrap_err().exit_code(), 1);
    }

    /// Collation change on the keyed column, eliminate_dups off.
    #[test]
    fn test_collation_scenario_rejected() {
        let before = parse_create_table(
            "CREATE TABLE t (`data` varchar(10) NOT NULL, PRIMARY KEY (`data`))
             ENGINE=InnoDB DEFAULT CHARSET=latin1",
        )
        .unwrap();
        let after = parse_create_table(
            "CREATE TABLE t (`data` varchar(10) COLLATE latin1_general_cs NOT NULL,
             PRIMARY KEY (`data`)) ENGINE=InnoDB DEFAULT CHARSET=latin1",
        )
        .unwrap();

        let d = diff(&before, &after, &DiffOptions::default());
        match d.classification {
            Classification::Rejected(RejectReason::CollationChangeCollision { column }) => {
                assert_eq!(column, "data");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    /// Hash-partitioned table with only cosmetic spelling differences.
    #[test]
    fn test_hash_partition_scenario_identical() {
        let before = parse_create_table(
            "CREATE TABLE t (
               `id` int(11) NOT NULL,
               PRIMARY KEY (`id`)
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
             /*!50100 PARTITION BY HASH (`id`) PARTITIONS 2 */",
        )
        .unwrap();
        let after = parse_create_table(
            "CREATE TABLE t (
               `id` INT NOT NULL,
               PRIMARY KEY (`id`)
             ) ENGINE=InnoDB CHARACTER SET utf8mb4 COLLATE utf8mb4_general_ci
             PARTITION BY HASH (`id`) PARTITIONS 2",
        )
        .unwrap();

        let d = diff(&before, &after, &DiffOptions::default());
        assert_eq!(d.classification, Classification::Identical);

        // partition descriptor survives rendering
        let rendered = after.to_string();
        assert!(rendered.contains("PARTITION BY HASH"));
        assert!(rendered.contains("PARTITIONS 2"));
    }

    /// Table name from the unicode scenario round-trips through render.
    #[test]
    fn test_unicode_table_round_trip() {
        let ddl = "CREATE TABLE `(╯°□°）╯︵ ┻━┻` (
            `id` int NOT NULL,
            `data` varchar(10) DEFAULT NULL,
            PRIMARY KEY (`id`)
        ) ENGINE=InnoDB";

        let first = parse_create_table(ddl).unwrap();
        assert_eq!(first.name, "(╯°□°）╯︵ ┻━┻");

        let second = parse_create_table(&first.to_string()).unwrap();
        assert_eq!(first, second);
        assert!(first.semantic_eq(&second));
    }

    /// A dump file with DROP / INSERT noise yields only the tables.
    #[test]
    fn test_dump_file_parsing() {
        let tables = parse_statements(
            "-- dump
             SET NAMES utf8mb4;
             DROP TABLE IF EXISTS `a`;
             CREATE TABLE `a` (id INT NOT NULL, PRIMARY KEY (id));
             INSERT INTO `a` VALUES (1), (2);
             CREATE TABLE `b` (id INT NOT NULL, PRIMARY KEY (id));",
        )
        .unwrap();
        assert_eq!(tables.len(), 2);
    }

    /// diff(S, S) stays identical across every scenario schema above.
    #[test]
    fn test_diff_reflexive_on_scenario_schemas() {
        let ddls = [
            "CREATE TABLE t1 (id INT NOT NULL, PRIMARY KEY (id))",
            "CREATE TABLE t2 (a INT NOT NULL, b VARCHAR(16) NOT NULL, PRIMARY KEY (a, b))
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            "CREATE TABLE t3 (id INT NOT NULL, PRIMARY KEY (id))
             PARTITION BY HASH (id) PARTITIONS 4",
        ];
        for ddl in ddls {
            let t = parse_create_table(ddl).unwrap();
            let d = diff(&t, &t, &DiffOptions::default());
            assert_eq!(d.classification, Classification::Identical, "{}", ddl);
        }
    }
}
