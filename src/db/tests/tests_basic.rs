//! The basic read/write surface: add, remove, select, verify, browse,
//! describe, argument validation, lifecycle.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::{add, open};
    use crate::db::DbError;
    use crate::value::{Id, Text, Value, Write};
    use tempfile::TempDir;

    /// # Scenario
    /// add("name","jeff"); remove("name","jeff"): select is empty and
    /// verify false. A second add makes it visible again.
    #[test]
    fn add_remove_add() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let name = Text::new("name");

        assert!(db.add(name.clone(), Value::from("jeff"), record).unwrap());
        assert!(db.remove(name.clone(), Value::from("jeff"), record).unwrap());
        assert!(db.select(record, &name, None).unwrap().is_empty());
        assert!(!db.verify(record, &name, &Value::from("jeff"), None).unwrap());

        assert!(db.add(name.clone(), Value::from("jeff"), record).unwrap());
        assert!(db.verify(record, &name, &Value::from("jeff"), None).unwrap());
    }

    #[test]
    fn duplicate_add_and_absent_remove_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("k");

        assert!(db.add(key.clone(), Value::Int32(1), record).unwrap());
        assert!(!db.add(key.clone(), Value::Int32(1), record).unwrap());
        assert!(!db.remove(key.clone(), Value::Int32(2), record).unwrap());

        // the raw surface surfaces the violation as InvalidArgument
        let err = db
            .accept(Write::add(key.clone(), Value::Int32(1), record))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[test]
    fn accept_returns_strictly_increasing_versions() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let mut last = 0;
        for i in 0..20 {
            let version = db
                .accept(Write::add(Text::new("n"), Value::Int64(i), Id(1)))
                .unwrap();
            assert!(version > last, "version {version} after {last}");
            last = version;
        }
    }

    #[test]
    fn multi_value_fields_and_browse() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        add(&db, 1, "tag", Value::from("alpha"));
        add(&db, 1, "tag", Value::from("beta"));
        add(&db, 1, "age", Value::Int32(30));

        let tags = db.select(Id(1), &Text::new("tag"), None).unwrap();
        assert_eq!(tags.len(), 2);

        let keys = db.describe(Id(1), None).unwrap();
        assert_eq!(keys, [Text::new("age"), Text::new("tag")].into_iter().collect());

        let browse = db.browse_record(Id(1), None).unwrap();
        assert_eq!(browse[&Text::new("tag")].len(), 2);

        let inverted = db.browse_key(&Text::new("tag"), None).unwrap();
        assert_eq!(inverted[&Value::from("alpha")], [Id(1)].into_iter().collect());
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        for bad in ["", "dotted.key"] {
            let err = db
                .accept(Write::add(Text::new(bad), Value::Int32(1), Id(1)))
                .unwrap_err();
            assert!(matches!(err, DbError::InvalidArgument(_)), "{bad:?}");
        }
    }

    #[test]
    fn inventory_tracks_every_record_written() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        add(&db, 1, "k", Value::Int32(1));
        add(&db, 9, "k", Value::Int32(1));
        // removal does not erase a record from the inventory
        assert!(db.remove(Text::new("k"), Value::Int32(1), Id(9)).unwrap());
        assert_eq!(db.inventory().unwrap(), [Id(1), Id(9)].into_iter().collect());
    }

    #[test]
    fn stopped_database_rejects_operations() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        add(&db, 1, "k", Value::Int32(1));
        db.stop().unwrap();
        db.stop().unwrap(); // idempotent
        assert!(matches!(
            db.select(Id(1), &Text::new("k"), None),
            Err(DbError::Stopped)
        ));
        assert!(matches!(
            db.add(Text::new("k"), Value::Int32(2), Id(1)),
            Err(DbError::Stopped)
        ));
    }
}
