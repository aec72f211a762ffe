use super::*;

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn people() -> Vec<Row> {
    vec![
        row(&[
            ("id", Value::Int64(1)),
            ("name", Value::Str("alice".into())),
            ("score", Value::Int32(10)),
            ("team", Value::Str("red".into())),
        ]),
        row(&[
            ("id", Value::Int64(2)),
            ("name", Value::Str("bob".into())),
            ("score", Value::Int32(20)),
            ("team", Value::Str("blue".into())),
        ]),
        row(&[
            ("id", Value::Int64(3)),
            ("name", Value::Str("carol".into())),
            ("score", Value::Int32(10)),
            ("team", Value::Str("red".into())),
        ]),
        row(&[
            ("id", Value::Int64(4)),
            ("name", Value::Str("dave".into())),
            ("score", Value::Null),
            ("team", Value::Str("blue".into())),
        ]),
    ]
}

#[test]
fn test_filter_eq_and_order() {
    let result = QueryBuilder::new("t")
        .where_eq("score", Value::Int32(10))
        .order_by_asc("id")
        .execute(people());
    assert_eq!(result.len(), 2);
    assert_eq!(result[0]["name"], Value::Str("alice".into()));
    assert_eq!(result[1]["name"], Value::Str("carol".into()));
}

#[test]
fn test_empty_input_and_empty_groups() {
    // Empty table yields empty result.
    assert!(QueryBuilder::new("t").execute(Vec::new()).is_empty());
    // Empty AND root matches everything.
    assert_eq!(QueryBuilder::new("t").execute(people()).len(), 4);
    // Empty OR group matches nothing.
    let result = QueryBuilder::new("t")
        .group_start(LogicalOperator::Or)
        .group_end()
        .execute(people());
    assert!(result.is_empty());
}

#[test]
fn test_null_semantics() {
    // Equality on null is false; only IS_NULL sees it.
    let result = QueryBuilder::new("t")
        .where_eq("score", Value::Null)
        .execute(people());
    assert!(result.is_empty());

    let result = QueryBuilder::new("t").where_null("score").execute(people());
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["name"], Value::Str("dave".into()));

    let result = QueryBuilder::new("t")
        .where_not_null("score")
        .execute(people());
    assert_eq!(result.len(), 3);
}

#[test]
fn test_numeric_string_coercion() {
    let result = QueryBuilder::new("t")
        .where_eq("score", Value::Str("20".into()))
        .execute(people());
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["name"], Value::Str("bob".into()));

    let result = QueryBuilder::new("t")
        .where_gt("score", Value::Str("15".into()))
        .execute(people());
    assert_eq!(result.len(), 1);
}

#[test]
fn test_like_operator() {
    let rows = people();
    // Case-insensitive with wildcards.
    let result = QueryBuilder::new("t")
        .where_like("name", "%AR%")
        .execute(rows.clone());
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["name"], Value::Str("carol".into()));

    // No wildcards means exact match.
    let result = QueryBuilder::new("t")
        .where_like("name", "bob")
        .execute(rows.clone());
    assert_eq!(result.len(), 1);

    // Underscore matches one character.
    let result = QueryBuilder::new("t")
        .where_like("name", "b_b")
        .execute(rows.clone());
    assert_eq!(result.len(), 1);

    // Empty pattern matches everything.
    let result = QueryBuilder::new("t").where_like("name", "").execute(rows);
    assert_eq!(result.len(), 4);
}

#[test]
fn test_between_inclusive_and_inverted() {
    let result = QueryBuilder::new("t")
        .where_between("score", Value::Int32(10), Value::Int32(20))
        .execute(people());
    assert_eq!(result.len(), 3);

    let result = QueryBuilder::new("t")
        .where_between("score", Value::Int32(20), Value::Int32(10))
        .execute(people());
    assert!(result.is_empty());
}

#[test]
fn test_in_and_text_operators() {
    let result = QueryBuilder::new("t")
        .where_in("name", vec![Value::Str("alice".into()), Value::Str("dave".into())])
        .execute(people());
    assert_eq!(result.len(), 2);

    let result = QueryBuilder::new("t")
        .where_not_in("team", vec![Value::Str("red".into())])
        .execute(people());
    assert_eq!(result.len(), 2);

    let result = QueryBuilder::new("t")
        .where_starts_with("name", "ca")
        .execute(people());
    assert_eq!(result.len(), 1);

    let result = QueryBuilder::new("t")
        .where_ends_with("name", "e")
        .execute(people());
    assert_eq!(result.len(), 2); // alice, dave

    let result = QueryBuilder::new("t")
        .where_contains("name", "o")
        .execute(people());
    assert_eq!(result.len(), 2); // bob, carol

    let result = QueryBuilder::new("t")
        .where_regex("name", "^[ab]")
        .execute(people());
    assert_eq!(result.len(), 2);
}

#[test]
fn test_nested_groups_with_or() {
    // team = 'red' AND (score > 15 OR name LIKE 'a%')
    let result = QueryBuilder::new("t")
        .where_eq("team", Value::Str("red".into()))
        .group_start(LogicalOperator::Or)
        .where_gt("score", Value::Int32(15))
        .where_like("name", "a%")
        .group_end()
        .execute(people());
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["name"], Value::Str("alice".into()));
}

#[test]
fn test_or_where_switches_root_logic() {
    let result = QueryBuilder::new("t")
        .where_eq("name", Value::Str("alice".into()))
        .or_where("name", Operator::Eq, Some(Value::Str("bob".into())))
        .execute(people());
    assert_eq!(result.len(), 2);
}

#[test]
fn test_pagination_boundaries() {
    let base = || QueryBuilder::new("t").order_by_asc("id");

    // limit 0 is empty regardless of matches.
    assert!(base().limit(0).execute(people()).is_empty());

    // offset beyond matches is empty.
    assert!(base().offset(10).execute(people()).is_empty());

    let result = base().paginate(2, 2).execute(people());
    assert_eq!(result.len(), 2);
    assert_eq!(result[0]["id"], Value::Int64(3));
}

#[test]
fn test_projection_and_distinct() {
    let result = QueryBuilder::new("t")
        .select(["team"])
        .distinct()
        .order_by_asc("team")
        .execute(people());
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].len(), 1);
    assert!(result[0].contains_key("team"));
}

#[test]
fn test_multi_key_ordering_with_nulls() {
    let rows = people();
    let result = QueryBuilder::new("t")
        .order_by("score", OrderDirection::Desc, false)
        .order_by_asc("name")
        .execute(rows.clone());
    // Nulls last, then 20, then the two 10s tie-broken by name.
    assert_eq!(result[0]["name"], Value::Str("bob".into()));
    assert_eq!(result[1]["name"], Value::Str("alice".into()));
    assert_eq!(result[2]["name"], Value::Str("carol".into()));
    assert_eq!(result[3]["name"], Value::Str("dave".into()));

    let result = QueryBuilder::new("t")
        .order_by("score", OrderDirection::Asc, true)
        .execute(rows);
    assert_eq!(result[0]["name"], Value::Str("dave".into()));
}

#[test]
fn test_plain_aggregations() {
    let result = QueryBuilder::new("t")
        .count("*", Some("n"))
        .sum("score", None)
        .avg("score", None)
        .min("score", None)
        .max("score", None)
        .execute(people());
    assert_eq!(result.len(), 1);
    let row = &result[0];
    assert_eq!(row["n"], Value::Int64(4));
    assert_eq!(row["SUM_score"], Value::Int64(40));
    assert!(matches!(row["AVG_score"], Value::Float64(v) if (v - 40.0 / 3.0).abs() < 1e-9));
    assert_eq!(row["MIN_score"], Value::Int32(10));
    assert_eq!(row["MAX_score"], Value::Int32(20));

    // COUNT(column) skips nulls.
    let result = QueryBuilder::new("t").count("score", None).execute(people());
    assert_eq!(result[0]["COUNT_score"], Value::Int64(3));
}

#[test]
fn test_group_by_aggregation() {
    let mut result = QueryBuilder::new("t")
        .group_by(["team"])
        .count("*", Some("members"))
        .sum("score", Some("total"))
        .execute(people());
    result.sort_by_key(|row| row["team"].display_string());

    assert_eq!(result.len(), 2);
    assert_eq!(result[0]["team"], Value::Str("blue".into()));
    assert_eq!(result[0]["members"], Value::Int64(2));
    assert_eq!(result[0]["total"], Value::Int64(20));
    assert_eq!(result[1]["team"], Value::Str("red".into()));
    assert_eq!(result[1]["total"], Value::Int64(20));
}

#[test]
fn test_params_round_trip() {
    let original = QueryBuilder::new("t")
        .select(["name", "score"])
        .where_eq("team", Value::Str("red".into()))
        .group_start(LogicalOperator::Or)
        .where_gt("score", Value::Int32(5))
        .where_null("score")
        .group_end()
        .order_by("score", OrderDirection::Desc, true)
        .limit(10)
        .offset(2);

    let params = original.to_params();
    let rebuilt = QueryBuilder::from_params("t", &params).unwrap();

    // Canonical form is stable across the round trip.
    assert_eq!(params, rebuilt.to_params());
    // Both versions produce identical results.
    assert_eq!(original.execute(people()), rebuilt.execute(people()));
}

#[test]
fn test_params_rejects_garbage() {
    let bad = serde_json::json!({ "conditions": { "children": [ { "column": "x" } ] } });
    assert!(matches!(
        QueryBuilder::from_params("t", &bad),
        Err(QueryError::Params(_))
    ));
}
