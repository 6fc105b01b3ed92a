//! Criteria textual form: `parse(format(c)) == c` for every operator and
//! value kind.

#[cfg(test)]
mod tests {
    use crate::query::{Criteria, Operator, QueryError};
    use crate::value::{Id, Text, Value};

    fn round_trip(criteria: &Criteria) {
        let rendered = criteria.to_string();
        let parsed = Criteria::parse(&rendered)
            .unwrap_or_else(|e| panic!("failed to parse {rendered:?}: {e}"));
        assert_eq!(&parsed, criteria, "round trip through {rendered:?}");
    }

    #[test]
    fn leaves_round_trip_every_value_kind() {
        let values = [
            Value::Bool(true),
            Value::Int32(18),
            Value::Int64(18),
            Value::Float32(2.5),
            Value::Float64(-3.25),
            Value::String(Text::new("two words")),
            Value::Link(Id(42)),
            Value::Tag(Text::new("label")),
            Value::Timestamp(1_700_000),
            Value::Null,
        ];
        for value in values {
            round_trip(&Criteria::leaf("field", Operator::Equals, vec![value]));
        }
    }

    #[test]
    fn every_operator_round_trips() {
        let single = [
            Operator::Equals,
            Operator::NotEquals,
            Operator::GreaterThan,
            Operator::GreaterThanOrEquals,
            Operator::LessThan,
            Operator::LessThanOrEquals,
            Operator::Regex,
            Operator::NotRegex,
            Operator::Like,
            Operator::NotLike,
            Operator::Contains,
            Operator::NotContains,
            Operator::LinksTo,
        ];
        for op in single {
            round_trip(&Criteria::leaf("k", op, vec![Value::from("x")]));
        }
        round_trip(&Criteria::leaf(
            "k",
            Operator::Between,
            vec![Value::Int32(1), Value::Int32(9)],
        ));
    }

    #[test]
    fn nested_combinations_round_trip() {
        let age = Criteria::leaf("age", Operator::GreaterThan, vec![Value::Int32(21)]);
        let name = Criteria::leaf("name", Operator::Equals, vec![Value::from("jeff")]);
        let city = Criteria::leaf("city", Operator::NotEquals, vec![Value::from("nyc")]);
        round_trip(&age.clone().and(name.clone()));
        round_trip(&age.clone().or(name.clone()).negate());
        round_trip(&age.and(name.or(city.negate())));
    }

    #[test]
    fn navigation_keys_round_trip() {
        round_trip(&Criteria::leaf(
            "identity.credential.counter",
            Operator::Equals,
            vec![Value::Int32(50)],
        ));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for bad in [
            "",
            "key",
            "key FROBNICATE 1",
            "(a EQUALS 1 AND",
            "key EQUALS",
            "key BETWEEN 1",
            "key EQUALS 1 trailing garbage",
            "key EQUALS \"unterminated",
        ] {
            assert!(
                matches!(Criteria::parse(bad), Err(QueryError::InvalidCriteria(_))),
                "{bad:?} should not parse"
            );
        }
    }
}
