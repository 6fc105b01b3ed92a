//! Numeric tag collisions: equal magnitude, different tags.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::open;
    use crate::query::{Criteria, Operator};
    use crate::value::{Id, Text, Value};
    use tempfile::TempDir;

    /// # Scenario
    /// add("v",18) and add("v",18.0) both succeed: the variants share an
    /// equality class but remain distinct stored values. `find EQUALS`
    /// on either form returns the record; `browse` shows both variants.
    #[test]
    fn int_and_double_collide_for_queries_but_not_storage() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("v");

        assert!(db.add(key.clone(), Value::Int32(18), record).unwrap());
        assert!(db.add(key.clone(), Value::Float64(18.0), record).unwrap());

        let values = db.select(record, &key, None).unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&Value::Int32(18)));
        assert!(values.contains(&Value::Float64(18.0)));

        for probe in [Value::Int32(18), Value::Float64(18.0), Value::Int64(18)] {
            let criteria = Criteria::leaf("v", Operator::Equals, vec![probe.clone()]);
            assert_eq!(
                db.find(&criteria, None).unwrap(),
                [record].into_iter().collect(),
                "probe {probe}"
            );
            assert!(db.verify(record, &key, &probe, None).unwrap());
        }

        let browse = db.browse_key(&key, None).unwrap();
        // one entry per stored variant, each pointing at the record
        assert_eq!(browse.len(), 2);
        for ids in browse.values() {
            assert_eq!(ids, &[record].into_iter().collect());
        }
    }

    #[test]
    fn removing_one_variant_keeps_the_class_satisfied() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("v");

        db.add(key.clone(), Value::Int32(18), record).unwrap();
        db.add(key.clone(), Value::Float64(18.0), record).unwrap();
        assert!(db.remove(key.clone(), Value::Int32(18), record).unwrap());

        // the double variant still satisfies class queries
        assert!(db.verify(record, &key, &Value::Int32(18), None).unwrap());
        assert_eq!(db.select(record, &key, None).unwrap().len(), 1);

        assert!(db.remove(key.clone(), Value::Float64(18.0), record).unwrap());
        assert!(!db.verify(record, &key, &Value::Int32(18), None).unwrap());
    }

    #[test]
    fn string_and_tag_share_a_class() {
        let tmp = TempDir::new().unwrap();
        let db = open(tmp.path());
        let record = Id(1);
        let key = Text::new("label");

        db.add(key.clone(), Value::String(Text::new("foo")), record)
            .unwrap();
        assert!(db
            .verify(record, &key, &Value::Tag(Text::new("foo")), None)
            .unwrap());
        // distinct storage: the tag variant can still be added
        assert!(db.add(key.clone(), Value::Tag(Text::new("foo")), record).unwrap());
        assert_eq!(db.select(record, &key, None).unwrap().len(), 2);
    }
}
