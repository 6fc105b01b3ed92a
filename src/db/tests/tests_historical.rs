//! Historical reads: every query surface answers at an arbitrary
//! version.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::{add, open};
    use crate::value::{Id, Text, Value, Write};
    use tempfile::TempDir;

    /// # Scenario
    /// add("x",1); t = now; remove("x",1): `select at t` still sees {1}
    /// while the present is empty.
    #[test]
    fn select_at_historical_version() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("x");

        let t_add = db
            .accept(Write::add(key.clone(), Value::Int32(1), record))
            .unwrap();
        assert!(db.remove(key.clone(), Value::Int32(1), record).unwrap());

        assert_eq!(
            db.select(record, &key, Some(t_add)).unwrap(),
            [Value::Int32(1)].into_iter().collect()
        );
        assert!(db.select(record, &key, None).unwrap().is_empty());
        assert!(db.verify(record, &key, &Value::Int32(1), Some(t_add)).unwrap());
    }

    #[test]
    fn browse_and_describe_at_version() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);

        let t1 = db
            .accept(Write::add(Text::new("a"), Value::Int32(1), record))
            .unwrap();
        db.accept(Write::add(Text::new("b"), Value::Int32(2), record))
            .unwrap();

        assert_eq!(db.describe(record, Some(t1)).unwrap().len(), 1);
        assert_eq!(db.describe(record, None).unwrap().len(), 2);
        assert_eq!(db.browse_record(record, Some(t1)).unwrap().len(), 1);
    }

    #[test]
    fn chronologize_walks_the_window() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("k");

        let v1 = db
            .accept(Write::add(key.clone(), Value::Int32(1), record))
            .unwrap();
        let v2 = db
            .accept(Write::add(key.clone(), Value::Int32(2), record))
            .unwrap();
        let v3 = db
            .accept(Write::remove(key.clone(), Value::Int32(1), record))
            .unwrap();

        let timeline = db.chronologize(record, &key, v1, v3).unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[&v1], [Value::Int32(1)].into_iter().collect());
        assert_eq!(timeline[&v2].len(), 2);
        assert_eq!(timeline[&v3], [Value::Int32(2)].into_iter().collect());

        // a narrower window still seeds from earlier history
        let tail = db.chronologize(record, &key, v3, v3).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[&v3], [Value::Int32(2)].into_iter().collect());
    }

    #[test]
    fn audit_lists_every_revision() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        add(&db, 1, "a", Value::Int32(1));
        add(&db, 1, "b", Value::Int32(2));
        assert!(db.remove(Text::new("a"), Value::Int32(1), record).unwrap());

        let history = db.audit(record).unwrap();
        assert_eq!(history.len(), 3);
        let versions: Vec<_> = history.keys().collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn find_at_historical_version() {
        use crate::query::{Criteria, Operator};
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());

        let t1 = db
            .accept(Write::add(Text::new("age"), Value::Int32(30), Id(1)))
            .unwrap();
        db.accept(Write::add(Text::new("age"), Value::Int32(40), Id(2)))
            .unwrap();

        let criteria = Criteria::leaf("age", Operator::GreaterThan, vec![Value::Int32(20)]);
        assert_eq!(db.find(&criteria, Some(t1)).unwrap(), [Id(1)].into_iter().collect());
        assert_eq!(db.find(&criteria, None).unwrap().len(), 2);
    }
}
