//! The infix search match rule, driven through corpus positions.

#[cfg(test)]
mod tests {
    use crate::query::matcher::infix_match;
    use crate::query::tokenize::tokenize;
    use crate::query::{QueryError, Reader, search};
    use crate::value::{Id, Position, Text, Value};
    use std::collections::{BTreeMap, BTreeSet};

    struct CorpusOnly {
        docs: Vec<(u64, &'static str)>,
    }

    impl Reader for CorpusOnly {
        fn select(&self, _: Id, _: &Text) -> Result<BTreeSet<Value>, QueryError> {
            Ok(BTreeSet::new())
        }

        fn index_lookup(&self, _: &Text, _: &Value) -> Result<BTreeSet<Id>, QueryError> {
            Ok(BTreeSet::new())
        }

        fn index_browse(&self, _: &Text) -> Result<BTreeMap<Value, BTreeSet<Id>>, QueryError> {
            Ok(BTreeMap::new())
        }

        fn corpus_positions(
            &self,
            _: &Text,
        ) -> Result<BTreeMap<Text, BTreeSet<Position>>, QueryError> {
            let mut out: BTreeMap<Text, BTreeSet<Position>> = BTreeMap::new();
            for (record, text) in &self.docs {
                for (index, token) in tokenize(text).into_iter().enumerate() {
                    out.entry(token).or_default().insert(Position {
                        record: Id(*record),
                        index: index as u32,
                    });
                }
            }
            Ok(out)
        }

        fn inventory(&self) -> Result<BTreeSet<Id>, QueryError> {
            Ok(self.docs.iter().map(|(r, _)| Id(*r)).collect())
        }
    }

    fn ids(raw: &[u64]) -> BTreeSet<Id> {
        raw.iter().copied().map(Id).collect()
    }

    fn run(docs: Vec<(u64, &'static str)>, query: &str) -> BTreeSet<Id> {
        let reader = CorpusOnly { docs };
        search(&reader, &Text::new("bio"), query).unwrap()
    }

    /// # Scenario
    /// `add("bio", "barfoobar foobarfoo")` — the query "f bar" matches
    /// as an infix ("f" within the first token, "bar" within the
    /// second), while "zzz" matches nothing.
    #[test]
    fn infix_substring_per_position() {
        let docs = vec![(1, "barfoobar foobarfoo")];
        assert_eq!(run(docs.clone(), "f bar"), ids(&[1]));
        assert_eq!(run(docs.clone(), "zzz"), ids(&[]));
        assert_eq!(run(docs, "foobar"), ids(&[1]));
    }

    /// # Scenario
    /// The substring rule is uniform across query positions: in a
    /// three-token query the interior token matches by substring too,
    /// not by whole-token equality.
    #[test]
    fn interior_tokens_match_by_substring() {
        let docs = vec![(1, "alphabet better gamma"), (2, "alphabet beta gamma")];
        // interior token "ett" is a substring of "better" only
        assert_eq!(run(docs.clone(), "alpha ett gamma"), ids(&[1]));
        // exact interior token still matches both its own doc
        assert_eq!(run(docs.clone(), "alpha beta gamma"), ids(&[2]));
        // all three positions matching by proper substring
        assert_eq!(run(docs, "lphabet ette amm"), ids(&[1]));
    }

    #[test]
    fn query_terms_must_be_consecutive() {
        let docs = vec![(1, "alpha beta gamma"), (2, "alpha gamma beta")];
        assert_eq!(run(docs.clone(), "alpha beta"), ids(&[1]));
        assert_eq!(run(docs.clone(), "beta gamma"), ids(&[1]));
        assert_eq!(run(docs, "gamma beta"), ids(&[2]));
    }

    #[test]
    fn case_and_stopwords_are_normalized() {
        let docs = vec![(1, "The Quick Brown Fox")];
        // "the" disappears on both sides before positions are assigned
        assert_eq!(run(docs.clone(), "THE QUICK"), ids(&[1]));
        assert_eq!(run(docs, "quick brown"), ids(&[1]));
    }

    #[test]
    fn empty_query_matches_nothing() {
        let docs = vec![(1, "something")];
        assert_eq!(run(docs.clone(), ""), ids(&[]));
        assert_eq!(run(docs, "the of and"), ids(&[]));
    }

    #[test]
    fn multiple_documents_filtered_independently() {
        let docs = vec![
            (1, "rust storage engine"),
            (2, "java storage engine"),
            (3, "rust web framework"),
        ];
        assert_eq!(run(docs.clone(), "rust"), ids(&[1, 3]));
        assert_eq!(run(docs.clone(), "storage engine"), ids(&[1, 2]));
        assert_eq!(run(docs, "rust storage"), ids(&[1]));
    }

    #[test]
    fn infix_match_rule_directly() {
        let stored = tokenize("barfoobar foobarfoo");
        assert!(infix_match(&stored, &tokenize("f bar")));
        assert!(infix_match(&stored, &tokenize("oob")));
        assert!(!infix_match(&stored, &tokenize("zzz")));
        assert!(!infix_match(&stored, &tokenize("bar foo zzz")));
        // query longer than the document cannot match
        assert!(!infix_match(&stored, &tokenize("a b c")));
    }
}
