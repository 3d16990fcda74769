//! Filter compiler (C3): translates a [`FilterSet`] into a single indexed
//! SQL query plan. The same plan-shape is used for both historical queries
//! and fan-out re-evaluation (§4.7 constrains `ids` to a single event first).
use crate::filter::{Filter, FilterSet};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value;
use std::collections::HashSet;

/// A compiled query: parameterized SQL text plus its bound values, in the
/// order `?` placeholders appear. Never executed by this module.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub sql: String,
    pub params: Vec<Value>,
}

/// The result of compiling a filter set against the admission gate.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// The filter set passed the admission gate (§4.3 rule 5); run this plan.
    Admitted(QueryPlan),
    /// The filter set was rejected by the admission gate. Per spec this is
    /// "no rows", not an error: the connection layer emits `CLOSED` with an
    /// empty reason for the owning subscription instead of running a query.
    Rejected,
}

lazy_static! {
    static ref SEARCH_SANITIZER: Regex = Regex::new(r"[^A-Za-z0-9_\s]").unwrap();
}

/// Replace every character outside `[A-Za-z0-9_\s]` with a single space
/// (§4.3 rule 2), so the sanitized string is safe to hand to FTS5 `MATCH`.
fn sanitize_search(raw: &str) -> String {
    SEARCH_SANITIZER.replace_all(raw, " ").into_owned()
}

/// Push an `column IN (?, ?, ...)` component, or a constant-false component
/// when `values` is empty (an empty `IN ()` list is a SQL syntax error and,
/// semantically, an empty allow-set can never match anything).
fn push_in_clause(column: &str, values: &HashSet<String>, components: &mut Vec<String>, params: &mut Vec<Value>) {
    if values.is_empty() {
        components.push("0".to_owned());
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    components.push(format!("{column} IN ({placeholders})"));
    for v in values {
        params.push(Value::Text(v.clone()));
    }
}

fn push_kind_clause(kinds: &HashSet<u16>, components: &mut Vec<String>, params: &mut Vec<Value>) {
    if kinds.is_empty() {
        components.push("0".to_owned());
        return;
    }
    let placeholders = vec!["?"; kinds.len()].join(", ");
    components.push(format!("e.kind IN ({placeholders})"));
    for k in kinds {
        params.push(Value::Integer(i64::from(*k)));
    }
}

/// One `#X` axis: a tag-index membership predicate. Multiple axes within a
/// single filter are each their own `EXISTS`, implicitly `AND`ed together —
/// the intersection the spec calls for (§4.3 rule 1).
fn push_tag_clause(letter: char, values: &HashSet<String>, components: &mut Vec<String>, params: &mut Vec<Value>) {
    if values.is_empty() {
        components.push("0".to_owned());
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    components.push(format!(
        "EXISTS (SELECT 1 FROM tags_index ti WHERE ti.fid = e.rowid AND ti.value IN ({placeholders}))"
    ));
    for v in values {
        params.push(Value::Text(format!("{letter}:{v}")));
    }
}

/// Build the conjunction of predicates for a single filter (an empty filter
/// matches everything: its component list collapses to `1=1`). Returns the
/// clause and whether it drew on `search`, which decides this filter's
/// internal ordering (§4.3 rule 3).
fn compile_filter(filter: &Filter, params: &mut Vec<Value>) -> (String, bool) {
    let mut components: Vec<String> = Vec::new();
    let mut uses_rank = false;

    if let Some(ids) = &filter.ids {
        push_in_clause("e.id", ids, &mut components, params);
    }
    if let Some(authors) = &filter.authors {
        push_in_clause("e.pubkey", authors, &mut components, params);
    }
    if let Some(kinds) = &filter.kinds {
        push_kind_clause(kinds, &mut components, params);
    }
    for (letter, values) in &filter.tags {
        push_tag_clause(*letter, values, &mut components, params);
    }
    if let Some(since) = filter.since {
        components.push("e.created_at >= ?".to_owned());
        params.push(Value::Integer(since));
    }
    if let Some(until) = filter.until {
        components.push("e.created_at <= ?".to_owned());
        params.push(Value::Integer(until));
    }
    if let Some(search) = &filter.search {
        if search.chars().count() == 2 {
            // Exact name-tag prefix match: a literal substring check on the
            // raw tags column rather than the FTS engine (§4.3 rule 1).
            components.push("e.tags LIKE ('%' || ? || '%') ESCAPE '\\'".to_owned());
            params.push(Value::Text(search.clone()));
        } else {
            let sanitized = sanitize_search(search);
            components.push(
                "e.rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?)".to_owned(),
            );
            params.push(Value::Text(sanitized));
            uses_rank = true;
        }
    }

    let clause = if components.is_empty() {
        "1=1".to_owned()
    } else {
        format!("({})", components.join(" AND "))
    };
    (clause, uses_rank)
}

/// Compile one filter into its own bounded, ordered subquery, carrying an
/// extra `rank_val` column (its bm25 rank when it uses `search`, else `0`)
/// so the outer query in [`compile`] can still order the union by rank
/// without losing each arm's own limit. `limit` is applied here, inside the
/// arm, rather than to the assembled result: §4.3 rule 4 is a tail clamp
/// *per filter*, not a clamp on the OR'd/unioned whole.
///
/// The inner `SELECT ... LIMIT` is wrapped in its own `SELECT * FROM (...)`
/// so that when several of these are joined with `UNION`, each arm's
/// `ORDER BY`/`LIMIT` binds to that arm alone - SQLite (like standard SQL)
/// only lets a compound SELECT's *last* arm carry a bare `ORDER BY`/`LIMIT`
/// otherwise.
fn filter_subquery(filter: &Filter, params: &mut Vec<Value>) -> (String, bool) {
    let (clause, uses_rank) = compile_filter(filter, params);
    let rank_expr = if uses_rank {
        "(SELECT bm25(events_fts) FROM events_fts WHERE events_fts.rowid = e.rowid)"
    } else {
        "0"
    };
    let mut inner = format!(
        "SELECT e.id, e.pubkey, e.created_at, e.kind, e.tags, e.content, e.sig, \
         {rank_expr} AS rank_val FROM events e WHERE {clause}"
    );
    if uses_rank {
        // Rank order: events_fts5's bm25() is smaller-is-better.
        inner.push_str(" ORDER BY rank_val ASC");
    } else {
        inner.push_str(" ORDER BY e.created_at DESC");
    }
    if let Some(l) = filter.limit {
        inner.push_str(" LIMIT ?");
        params.push(Value::Integer(i64::from(l)));
    }
    (format!("SELECT * FROM ({inner})"), uses_rank)
}

/// Compile a filter set into a query plan, or `Rejected` if it fails the
/// admission gate. Each filter compiles to its own limited/ordered arm
/// (see [`filter_subquery`]); the arms are `UNION`ed (deduplicating an
/// event that satisfies more than one filter) and the union is given one
/// final ordering pass per §4.3 rule 3.
pub fn compile(filters: &FilterSet, admitted_kinds: &HashSet<u16>) -> QueryOutcome {
    if !filters.is_admitted(admitted_kinds) {
        return QueryOutcome::Rejected;
    }

    let mut params: Vec<Value> = Vec::new();
    let mut subqueries: Vec<String> = Vec::new();
    let mut any_rank = false;

    for filter in &filters.0 {
        let (subquery, uses_rank) = filter_subquery(filter, &mut params);
        subqueries.push(subquery);
        any_rank |= uses_rank;
    }

    let union_sql = subqueries.join(" UNION ");
    let mut sql = format!("SELECT id, pubkey, created_at, kind, tags, content, sig FROM ({union_sql}) ");

    if any_rank {
        sql.push_str("ORDER BY rank_val ASC");
    } else {
        sql.push_str("ORDER BY created_at DESC");
    }

    QueryOutcome::Admitted(QueryPlan { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn admitted() -> HashSet<u16> {
        HashSet::from([1, 30063])
    }

    #[test]
    fn rejects_filter_without_admitted_kind() {
        let fs = FilterSet::from_values(&[json!({"authors": ["ab"]})]).unwrap();
        assert!(matches!(compile(&fs, &admitted()), QueryOutcome::Rejected));
    }

    #[test]
    fn admits_and_orders_by_created_at_without_search() {
        let fs = FilterSet::from_values(&[json!({"kinds": [1], "authors": ["ab"]})]).unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => {
                assert!(plan.sql.contains("ORDER BY e.created_at DESC"));
                assert!(plan.sql.contains("e.kind IN (?)"));
                assert!(plan.sql.contains("e.pubkey IN (?)"));
            }
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn search_of_len_two_is_substring_not_fts() {
        let fs = FilterSet::from_values(&[json!({"kinds": [1], "search": "ab"})]).unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => {
                assert!(plan.sql.contains("LIKE"));
                assert!(!plan.sql.contains("events_fts MATCH"));
                assert!(plan.sql.contains("ORDER BY e.created_at DESC"));
            }
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn search_longer_than_two_uses_fts_rank_order() {
        let fs = FilterSet::from_values(&[json!({"kinds": [1], "search": "a!b"})]).unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => {
                assert!(plan.sql.contains("events_fts MATCH"));
                assert!(plan.sql.contains("bm25"));
                // sanitized: "!" becomes a space
                assert!(plan.params.iter().any(|v| matches!(v, Value::Text(s) if s == "a b")));
            }
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn multiple_tag_axes_are_anded_within_a_filter() {
        let fs = FilterSet::from_values(&[json!({"kinds": [1], "#d": ["x"], "#t": ["y"]})]).unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => {
                assert_eq!(plan.sql.matches("EXISTS").count(), 2);
                assert!(plan.sql.contains(") AND EXISTS"));
            }
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn filters_within_a_set_are_unioned() {
        let fs = FilterSet::from_values(&[
            json!({"kinds": [1]}),
            json!({"kinds": [30063]}),
        ])
        .unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => assert!(plan.sql.contains(" UNION ")),
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn limit_is_applied_per_filter_not_to_the_combined_result() {
        let fs = FilterSet::from_values(&[
            json!({"kinds": [1], "limit": 5}),
            json!({"kinds": [30063], "limit": 20}),
        ])
        .unwrap();
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => {
                // Each filter gets its own `LIMIT ?` inside its own arm,
                // rather than one `LIMIT` clamping the unioned whole.
                assert_eq!(plan.sql.matches("LIMIT ?").count(), 2);
                assert!(!plan.sql.trim_end().ends_with("LIMIT ?"));
                assert!(plan.params.contains(&Value::Integer(5)));
                assert!(plan.params.contains(&Value::Integer(20)));
            }
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn empty_set_membership_is_unsatisfiable() {
        let mut f = Filter::from_value(&json!({"kinds": [1]})).unwrap();
        f.authors = Some(HashSet::new());
        let fs = FilterSet(vec![f]);
        match compile(&fs, &admitted()) {
            QueryOutcome::Admitted(plan) => assert!(plan.sql.contains("AND 0") || plan.sql.contains("(0 ")),
            QueryOutcome::Rejected => panic!("expected admission"),
        }
    }
}
