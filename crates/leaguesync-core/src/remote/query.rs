use serde_json::Value;

/// Filter, order, and limit for a remote listing.
///
/// `eq` filters must all match; `any_eq` alternatives need one match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    eq: Vec<(String, String)>,
    any_eq: Vec<(String, String)>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.eq.push((column.to_string(), value.to_string()));
        self
    }

    /// Rows where at least one of the given `column = value` pairs holds.
    pub fn any_eq(mut self, alternatives: &[(&str, &str)]) -> Self {
        self.any_eq = alternatives
            .iter()
            .map(|(c, v)| (c.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// PostgREST query-string pairs.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .eq
            .iter()
            .map(|(c, v)| (c.clone(), format!("eq.{}", v)))
            .collect();
        if !self.any_eq.is_empty() {
            let alternatives: Vec<String> = self
                .any_eq
                .iter()
                .map(|(c, v)| format!("{}.eq.{}", c, v))
                .collect();
            pairs.push(("or".to_string(), format!("({})", alternatives.join(","))));
        }
        if let Some((ref column, ascending)) = self.order {
            let direction = if ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", column, direction)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }

    /// Whether `row` passes the filters. Used by in-process stores.
    pub fn matches(&self, row: &Value) -> bool {
        let column_is = |column: &str, expected: &str| match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == expected,
        };
        self.eq.iter().all(|(c, v)| column_is(c, v))
            && (self.any_eq.is_empty() || self.any_eq.iter().any(|(c, v)| column_is(c, v)))
    }

    /// Filter, sort, and truncate `rows` in memory.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows.into_iter().filter(|row| self.matches(row)).collect();
        if let Some((ref column, ascending)) = self.order {
            rows.sort_by(|a, b| {
                let ordering = compare_json(a.get(column), b.get(column));
                if ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

/// Nulls sort last in ascending order, as in Postgres.
fn compare_json(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_pairs() {
        let query = ListQuery::new()
            .eq("status", "pending")
            .any_eq(&[("challenger_id", "u1"), ("challenged_id", "u1")])
            .order_by("created_at", false)
            .limit(20);
        assert_eq!(
            query.to_query_pairs(),
            vec![
                ("status".to_string(), "eq.pending".to_string()),
                (
                    "or".to_string(),
                    "(challenger_id.eq.u1,challenged_id.eq.u1)".to_string()
                ),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn test_matches() {
        let query = ListQuery::new().any_eq(&[("challenger_id", "u1"), ("challenged_id", "u1")]);
        assert!(query.matches(&json!({"challenger_id": "u1", "challenged_id": "u2"})));
        assert!(query.matches(&json!({"challenger_id": "u3", "challenged_id": "u1"})));
        assert!(!query.matches(&json!({"challenger_id": "u3", "challenged_id": "u4"})));

        let numeric = ListQuery::new().eq("season", "3");
        assert!(numeric.matches(&json!({"season": 3})));
    }

    #[test]
    fn test_apply_orders_with_nulls_last() {
        let rows = vec![
            json!({"id": "c", "ranking_position": null}),
            json!({"id": "b", "ranking_position": 2}),
            json!({"id": "a", "ranking_position": 1}),
        ];
        let ordered = ListQuery::new()
            .order_by("ranking_position", true)
            .limit(2)
            .apply(rows);
        let ids: Vec<&str> = ordered.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
