//! # Query Module
//!
//! Fluent query builder, predicate tree, and in-memory execution over row
//! streams: filtering, ordering, pagination, projection, aggregation with
//! group-by, and distinct.
//!
//! ## Evaluation rules
//!
//! - `IS NULL` / `IS NOT NULL` test presence; every other operator is false
//!   on a null column value (SQL-style null equality is not provided).
//! - Numeric comparisons against string values attempt lossless coercion
//!   both ways before falling back to false.
//! - `LIKE` uses SQL wildcards (`%` → `.*`, `_` → `.`), case-insensitive;
//!   an empty pattern matches everything, a pattern without wildcards is an
//!   exact (case-insensitive) match.
//! - `BETWEEN` is inclusive on both ends; inverted bounds match nothing.
//! - An empty AND-group is true, an empty OR-group is false.
//!
//! ## Canonical parameters
//!
//! [`QueryBuilder::to_params`] renders the whole query as canonical JSON
//! (sorted keys). The same JSON keys the query cache and travels to peer
//! nodes, where [`QueryBuilder::from_params`] rebuilds the query.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;

use regex::RegexBuilder;
use thiserror::Error;
use tracing::warn;

use crate::schema::{Row, Value, row_to_json};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when (de)serializing query parameters.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Parameter JSON does not describe a valid query.
    #[error("Malformed query parameters: {0}")]
    Params(String),
}

// ------------------------------------------------------------------------------------------------
// Operators
// ------------------------------------------------------------------------------------------------

/// Comparison operator of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
    Between,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT_LIKE",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
            Operator::Between => "BETWEEN",
            Operator::Contains => "CONTAINS",
            Operator::StartsWith => "STARTS_WITH",
            Operator::EndsWith => "ENDS_WITH",
            Operator::Regex => "REGEX",
        }
    }

    pub fn parse(text: &str) -> Result<Self, QueryError> {
        Ok(match text {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "IN" => Operator::In,
            "NOT_IN" => Operator::NotIn,
            "LIKE" => Operator::Like,
            "NOT_LIKE" => Operator::NotLike,
            "IS_NULL" => Operator::IsNull,
            "IS_NOT_NULL" => Operator::IsNotNull,
            "BETWEEN" => Operator::Between,
            "CONTAINS" => Operator::Contains,
            "STARTS_WITH" => Operator::StartsWith,
            "ENDS_WITH" => Operator::EndsWith,
            "REGEX" => Operator::Regex,
            other => return Err(QueryError::Params(format!("unknown operator '{other}'"))),
        })
    }
}

/// Connective of a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

/// Sort direction of one ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

// ------------------------------------------------------------------------------------------------
// Condition tree
// ------------------------------------------------------------------------------------------------

/// Leaf predicate: `column <op> value [, value2]`.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    pub value: Option<Value>,
    pub secondary_value: Option<Value>,
}

impl Condition {
    pub fn new(
        column: impl Into<String>,
        operator: Operator,
        value: Option<Value>,
        secondary_value: Option<Value>,
    ) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            secondary_value,
        }
    }

    fn like_to_regex(pattern: &str) -> String {
        let mut regex = String::with_capacity(pattern.len() + 2);
        regex.push('^');
        for ch in pattern.chars() {
            match ch {
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        regex
    }

    fn like_matches(pattern: &str, text: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        match RegexBuilder::new(&Self::like_to_regex(pattern))
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => regex.is_match(text),
            Err(err) => {
                warn!("unbuildable LIKE pattern '{pattern}': {err}");
                false
            }
        }
    }

    /// Evaluates the predicate against one row.
    pub fn evaluate(&self, row: &Row) -> bool {
        let cell = row.get(&self.column).filter(|value| !value.is_null());

        match self.operator {
            Operator::IsNull => return cell.is_none(),
            Operator::IsNotNull => return cell.is_some(),
            _ => {}
        }
        let Some(cell) = cell else {
            return false;
        };

        match self.operator {
            Operator::Eq | Operator::Ne | Operator::Lt | Operator::Le | Operator::Gt
            | Operator::Ge => {
                let Some(target) = &self.value else {
                    return false;
                };
                let Some(ordering) = cell.loose_cmp(target) else {
                    return matches!(self.operator, Operator::Ne);
                };
                match self.operator {
                    Operator::Eq => ordering == Ordering::Equal,
                    Operator::Ne => ordering != Ordering::Equal,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::Le => ordering != Ordering::Greater,
                    Operator::Gt => ordering == Ordering::Greater,
                    Operator::Ge => ordering != Ordering::Less,
                    _ => unreachable!(),
                }
            }
            Operator::In | Operator::NotIn => {
                let matched = match &self.value {
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| cell.loose_cmp(item) == Some(Ordering::Equal)),
                    Some(single) => cell.loose_cmp(single) == Some(Ordering::Equal),
                    None => false,
                };
                if self.operator == Operator::In {
                    matched
                } else {
                    !matched
                }
            }
            Operator::Like | Operator::NotLike => {
                let pattern = self
                    .value
                    .as_ref()
                    .map(Value::display_string)
                    .unwrap_or_default();
                let matched = Self::like_matches(&pattern, &cell.display_string());
                if self.operator == Operator::Like {
                    matched
                } else {
                    !matched
                }
            }
            Operator::Between => {
                let (Some(lo), Some(hi)) = (&self.value, &self.secondary_value) else {
                    return false;
                };
                cell.loose_cmp(lo).is_some_and(|o| o != Ordering::Less)
                    && cell.loose_cmp(hi).is_some_and(|o| o != Ordering::Greater)
            }
            Operator::Contains => {
                let needle = self
                    .value
                    .as_ref()
                    .map(Value::display_string)
                    .unwrap_or_default();
                cell.display_string().contains(&needle)
            }
            Operator::StartsWith => {
                let prefix = self
                    .value
                    .as_ref()
                    .map(Value::display_string)
                    .unwrap_or_default();
                cell.display_string().starts_with(&prefix)
            }
            Operator::EndsWith => {
                let suffix = self
                    .value
                    .as_ref()
                    .map(Value::display_string)
                    .unwrap_or_default();
                cell.display_string().ends_with(&suffix)
            }
            Operator::Regex => {
                let pattern = self
                    .value
                    .as_ref()
                    .map(Value::display_string)
                    .unwrap_or_default();
                match regex::Regex::new(&pattern) {
                    Ok(regex) => regex.is_match(&cell.display_string()),
                    Err(err) => {
                        warn!("unbuildable REGEX pattern '{pattern}': {err}");
                        false
                    }
                }
            }
            Operator::IsNull | Operator::IsNotNull => unreachable!(),
        }
    }
}

/// One node of the predicate tree.
#[derive(Debug, Clone)]
pub enum ConditionNode {
    Leaf(Condition),
    Group(ConditionGroup),
}

impl ConditionNode {
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            ConditionNode::Leaf(condition) => condition.evaluate(row),
            ConditionNode::Group(group) => group.evaluate(row),
        }
    }
}

/// Interior node: children joined by AND/OR, optionally negated.
#[derive(Debug, Clone)]
pub struct ConditionGroup {
    pub children: Vec<ConditionNode>,
    pub logical_op: LogicalOperator,
    pub negated: bool,
}

impl ConditionGroup {
    pub fn new(logical_op: LogicalOperator) -> Self {
        Self {
            children: Vec::new(),
            logical_op,
            negated: false,
        }
    }

    pub fn add(&mut self, node: ConditionNode) {
        self.children.push(node);
    }

    pub fn evaluate(&self, row: &Row) -> bool {
        let result = match self.logical_op {
            LogicalOperator::And => self.children.iter().all(|child| child.evaluate(row)),
            LogicalOperator::Or => {
                !self.children.is_empty() && self.children.iter().any(|child| child.evaluate(row))
            }
        };
        if self.negated { !result } else { result }
    }
}

// ------------------------------------------------------------------------------------------------
// Ordering / aggregation descriptors
// ------------------------------------------------------------------------------------------------

/// One ordering key.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
    pub nulls_first: bool,
}

/// Aggregate function of an [`Aggregation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    fn parse(text: &str) -> Result<Self, QueryError> {
        Ok(match text {
            "COUNT" => AggregateFunction::Count,
            "SUM" => AggregateFunction::Sum,
            "AVG" => AggregateFunction::Avg,
            "MIN" => AggregateFunction::Min,
            "MAX" => AggregateFunction::Max,
            other => {
                return Err(QueryError::Params(format!(
                    "unknown aggregate function '{other}'"
                )));
            }
        })
    }
}

/// One aggregation output column.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub column: String,
    pub alias: Option<String>,
}

impl Aggregation {
    fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.function.as_str(), self.column))
    }
}

// ------------------------------------------------------------------------------------------------
// QueryBuilder
// ------------------------------------------------------------------------------------------------

/// Fluent query description and executor.
///
/// The builder keeps a stack of open condition groups: `group_start` pushes,
/// `group_end` pops into the parent. `where_*` sugar adds a leaf to the
/// innermost open group.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    select_columns: Vec<String>,
    distinct: bool,
    root: ConditionGroup,
    open_groups: Vec<ConditionGroup>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
    offset: usize,
    group_by: Vec<String>,
    aggregations: Vec<Aggregation>,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select_columns: Vec::new(),
            distinct: false,
            root: ConditionGroup::new(LogicalOperator::And),
            open_groups: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            group_by: Vec::new(),
            aggregations: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    // -- projection ------------------------------------------------------------------------------

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn select_all(mut self) -> Self {
        self.select_columns.clear();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    // -- condition tree --------------------------------------------------------------------------

    fn push_node(&mut self, node: ConditionNode) {
        match self.open_groups.last_mut() {
            Some(group) => group.add(node),
            None => self.root.add(node),
        }
    }

    /// Adds a leaf predicate to the innermost open group.
    pub fn where_(
        mut self,
        column: impl Into<String>,
        operator: Operator,
        value: Option<Value>,
    ) -> Self {
        self.push_node(ConditionNode::Leaf(Condition::new(
            column, operator, value, None,
        )));
        self
    }

    pub fn where_eq(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Eq, Some(value))
    }

    pub fn where_ne(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Ne, Some(value))
    }

    pub fn where_lt(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Lt, Some(value))
    }

    pub fn where_le(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Le, Some(value))
    }

    pub fn where_gt(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Gt, Some(value))
    }

    pub fn where_ge(self, column: impl Into<String>, value: Value) -> Self {
        self.where_(column, Operator::Ge, Some(value))
    }

    pub fn where_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.where_(column, Operator::In, Some(Value::Array(values)))
    }

    pub fn where_not_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.where_(column, Operator::NotIn, Some(Value::Array(values)))
    }

    pub fn where_like(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.where_(column, Operator::Like, Some(Value::Str(pattern.into())))
    }

    pub fn where_null(self, column: impl Into<String>) -> Self {
        self.where_(column, Operator::IsNull, None)
    }

    pub fn where_not_null(self, column: impl Into<String>) -> Self {
        self.where_(column, Operator::IsNotNull, None)
    }

    pub fn where_between(self, column: impl Into<String>, lo: Value, hi: Value) -> Self {
        let mut this = self;
        this.push_node(ConditionNode::Leaf(Condition::new(
            column,
            Operator::Between,
            Some(lo),
            Some(hi),
        )));
        this
    }

    pub fn where_contains(self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        self.where_(column, Operator::Contains, Some(Value::Str(needle.into())))
    }

    pub fn where_starts_with(self, column: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.where_(column, Operator::StartsWith, Some(Value::Str(prefix.into())))
    }

    pub fn where_ends_with(self, column: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.where_(column, Operator::EndsWith, Some(Value::Str(suffix.into())))
    }

    pub fn where_regex(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.where_(column, Operator::Regex, Some(Value::Str(pattern.into())))
    }

    /// Alias of [`QueryBuilder::where_`]; the innermost group is already an
    /// AND unless changed.
    pub fn and_where(
        self,
        column: impl Into<String>,
        operator: Operator,
        value: Option<Value>,
    ) -> Self {
        self.where_(column, operator, value)
    }

    /// Switches the innermost open group to OR and adds the predicate.
    pub fn or_where(
        mut self,
        column: impl Into<String>,
        operator: Operator,
        value: Option<Value>,
    ) -> Self {
        match self.open_groups.last_mut() {
            Some(group) => group.logical_op = LogicalOperator::Or,
            None => self.root.logical_op = LogicalOperator::Or,
        }
        self.where_(column, operator, value)
    }

    /// Opens a nested condition group.
    pub fn group_start(mut self, logical_op: LogicalOperator) -> Self {
        self.open_groups.push(ConditionGroup::new(logical_op));
        self
    }

    /// Closes the innermost group, attaching it to its parent.
    pub fn group_end(mut self) -> Self {
        if let Some(group) = self.open_groups.pop() {
            self.push_node(ConditionNode::Group(group));
        }
        self
    }

    // -- ordering & pagination -------------------------------------------------------------------

    pub fn order_by(
        mut self,
        column: impl Into<String>,
        direction: OrderDirection,
        nulls_first: bool,
    ) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
            nulls_first,
        });
        self
    }

    pub fn order_by_asc(self, column: impl Into<String>) -> Self {
        self.order_by(column, OrderDirection::Asc, false)
    }

    pub fn order_by_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, OrderDirection::Desc, false)
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn offset(mut self, count: usize) -> Self {
        self.offset = count;
        self
    }

    /// 1-based page pagination sugar.
    pub fn paginate(self, page: usize, per_page: usize) -> Self {
        self.limit(per_page).offset(page.saturating_sub(1) * per_page)
    }

    // -- aggregation -----------------------------------------------------------------------------

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    fn aggregate(mut self, function: AggregateFunction, column: &str, alias: Option<&str>) -> Self {
        self.aggregations.push(Aggregation {
            function,
            column: column.to_string(),
            alias: alias.map(str::to_string),
        });
        self
    }

    pub fn count(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunction::Count, column, alias)
    }

    pub fn sum(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunction::Sum, column, alias)
    }

    pub fn avg(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunction::Avg, column, alias)
    }

    pub fn min(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunction::Min, column, alias)
    }

    pub fn max(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunction::Max, column, alias)
    }

    // -- execution -------------------------------------------------------------------------------

    /// Closes any groups left open and returns the effective predicate root.
    fn effective_root(&self) -> ConditionGroup {
        let mut root = self.root.clone();
        for group in &self.open_groups {
            root.add(ConditionNode::Group(group.clone()));
        }
        root
    }

    /// Runs the query over a materialized row stream.
    pub fn execute(&self, rows: Vec<Row>) -> Vec<Row> {
        let root = self.effective_root();
        let mut rows: Vec<Row> = rows.into_iter().filter(|row| root.evaluate(row)).collect();

        if !self.aggregations.is_empty() {
            return self.execute_aggregation(rows);
        }

        if !self.order_by.is_empty() {
            self.apply_ordering(&mut rows);
        }

        let mut rows: Vec<Row> = rows.into_iter().skip(self.offset).collect();
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        if !self.select_columns.is_empty() && self.select_columns != ["*"] {
            rows = rows
                .into_iter()
                .map(|row| {
                    self.select_columns
                        .iter()
                        .filter_map(|column| {
                            row.get(column).map(|value| (column.clone(), value.clone()))
                        })
                        .collect()
                })
                .collect();
        }

        if self.distinct {
            let mut seen = std::collections::HashSet::new();
            rows.retain(|row| seen.insert(row_to_json(row).to_string()));
        }

        rows
    }

    /// Multi-key stable sort with per-key direction and null placement.
    fn apply_ordering(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| {
            for key in &self.order_by {
                let left = a.get(&key.column).filter(|v| !v.is_null());
                let right = b.get(&key.column).filter(|v| !v.is_null());
                let rank = |value: &Option<&Value>| match value {
                    None if key.nulls_first => 0u8,
                    None => 2,
                    Some(_) => 1,
                };
                let ordering = match rank(&left).cmp(&rank(&right)) {
                    Ordering::Equal => match (left, right) {
                        (Some(left), Some(right)) => {
                            let ordering = left.cmp_total(right);
                            match key.direction {
                                OrderDirection::Asc => ordering,
                                OrderDirection::Desc => ordering.reverse(),
                            }
                        }
                        _ => Ordering::Equal,
                    },
                    unequal => unequal,
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    fn execute_aggregation(&self, rows: Vec<Row>) -> Vec<Row> {
        if self.group_by.is_empty() {
            let mut result = Row::new();
            for aggregation in &self.aggregations {
                result.insert(aggregation.output_name(), Self::compute(aggregation, &rows));
            }
            return vec![result];
        }

        let mut groups: std::collections::BTreeMap<String, (Row, Vec<Row>)> =
            std::collections::BTreeMap::new();
        for row in rows {
            let key_values: Row = self
                .group_by
                .iter()
                .map(|column| {
                    (
                        column.clone(),
                        row.get(column).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect();
            let key = row_to_json(&key_values).to_string();
            groups
                .entry(key)
                .or_insert_with(|| (key_values, Vec::new()))
                .1
                .push(row);
        }

        groups
            .into_values()
            .map(|(mut result, group_rows)| {
                for aggregation in &self.aggregations {
                    result.insert(
                        aggregation.output_name(),
                        Self::compute(aggregation, &group_rows),
                    );
                }
                result
            })
            .collect()
    }

    fn compute(aggregation: &Aggregation, rows: &[Row]) -> Value {
        if aggregation.function == AggregateFunction::Count {
            let count = if aggregation.column == "*" {
                rows.len()
            } else {
                rows.iter()
                    .filter(|row| {
                        row.get(&aggregation.column).is_some_and(|v| !v.is_null())
                    })
                    .count()
            };
            return Value::Int64(count as i64);
        }

        let values: Vec<&Value> = rows
            .iter()
            .filter_map(|row| row.get(&aggregation.column))
            .filter(|value| !value.is_null())
            .collect();
        if values.is_empty() {
            return Value::Null;
        }

        match aggregation.function {
            AggregateFunction::Sum => {
                let integral = values
                    .iter()
                    .all(|v| matches!(v, Value::Int32(_) | Value::Int64(_) | Value::Timestamp(_)));
                if integral {
                    Value::Int64(values.iter().filter_map(|v| v.as_i64()).sum())
                } else {
                    Value::Float64(values.iter().filter_map(|v| v.as_f64()).sum())
                }
            }
            AggregateFunction::Avg => {
                let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
                Value::Float64(sum / values.len() as f64)
            }
            AggregateFunction::Min => values
                .iter()
                .min_by(|a, b| a.cmp_total(b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
            AggregateFunction::Max => values
                .iter()
                .max_by(|a, b| a.cmp_total(b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
            AggregateFunction::Count => unreachable!(),
        }
    }

    // -- canonical parameters --------------------------------------------------------------------

    fn node_to_json(node: &ConditionNode) -> serde_json::Value {
        match node {
            ConditionNode::Leaf(condition) => serde_json::json!({
                "column": condition.column,
                "op": condition.operator.as_str(),
                "value": condition.value.as_ref().map(Value::to_json),
                "value2": condition.secondary_value.as_ref().map(Value::to_json),
            }),
            ConditionNode::Group(group) => Self::group_to_json(group),
        }
    }

    fn group_to_json(group: &ConditionGroup) -> serde_json::Value {
        serde_json::json!({
            "logic": match group.logical_op {
                LogicalOperator::And => "AND",
                LogicalOperator::Or => "OR",
            },
            "negated": group.negated,
            "children": group.children.iter().map(Self::node_to_json).collect::<Vec<_>>(),
        })
    }

    /// Canonical JSON form: query-cache key material and the peer-query wire
    /// payload. Keys are sorted, so identical queries always render
    /// identically.
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::json!({
            "columns": self.select_columns,
            "conditions": Self::group_to_json(&self.effective_root()),
            "distinct": self.distinct,
            "order_by": self.order_by.iter().map(|key| serde_json::json!({
                "column": key.column,
                "direction": match key.direction {
                    OrderDirection::Asc => "ASC",
                    OrderDirection::Desc => "DESC",
                },
                "nulls_first": key.nulls_first,
            })).collect::<Vec<_>>(),
            "limit": self.limit,
            "offset": self.offset,
            "group_by": self.group_by,
            "aggregations": self.aggregations.iter().map(|agg| serde_json::json!({
                "function": agg.function.as_str(),
                "column": agg.column,
                "alias": agg.alias,
            })).collect::<Vec<_>>(),
        })
    }

    fn node_from_json(json: &serde_json::Value) -> Result<ConditionNode, QueryError> {
        if json.get("children").is_some() {
            return Ok(ConditionNode::Group(Self::group_from_json(json)?));
        }
        let column = json
            .get("column")
            .and_then(|v| v.as_str())
            .ok_or_else(|| QueryError::Params("condition missing 'column'".into()))?;
        let operator = Operator::parse(
            json.get("op")
                .and_then(|v| v.as_str())
                .ok_or_else(|| QueryError::Params("condition missing 'op'".into()))?,
        )?;
        let value = json
            .get("value")
            .filter(|v| !v.is_null())
            .map(Value::from_json_untyped);
        let secondary_value = json
            .get("value2")
            .filter(|v| !v.is_null())
            .map(Value::from_json_untyped);
        Ok(ConditionNode::Leaf(Condition::new(
            column,
            operator,
            value,
            secondary_value,
        )))
    }

    fn group_from_json(json: &serde_json::Value) -> Result<ConditionGroup, QueryError> {
        let logic = match json.get("logic").and_then(|v| v.as_str()).unwrap_or("AND") {
            "OR" => LogicalOperator::Or,
            _ => LogicalOperator::And,
        };
        let mut group = ConditionGroup::new(logic);
        group.negated = json
            .get("negated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if let Some(children) = json.get("children").and_then(|v| v.as_array()) {
            for child in children {
                group.add(Self::node_from_json(child)?);
            }
        }
        Ok(group)
    }

    /// Rebuilds a query from its [`QueryBuilder::to_params`] JSON.
    pub fn from_params(table: &str, params: &serde_json::Value) -> Result<Self, QueryError> {
        let mut builder = QueryBuilder::new(table);
        if let Some(columns) = params.get("columns").and_then(|v| v.as_array()) {
            builder.select_columns = columns
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        if let Some(conditions) = params.get("conditions") {
            builder.root = Self::group_from_json(conditions)?;
        }
        builder.distinct = params
            .get("distinct")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if let Some(order_by) = params.get("order_by").and_then(|v| v.as_array()) {
            for key in order_by {
                let column = key
                    .get("column")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| QueryError::Params("order key missing 'column'".into()))?;
                let direction = match key.get("direction").and_then(|v| v.as_str()) {
                    Some("DESC") => OrderDirection::Desc,
                    _ => OrderDirection::Asc,
                };
                let nulls_first = key
                    .get("nulls_first")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                builder.order_by.push(OrderBy {
                    column: column.to_string(),
                    direction,
                    nulls_first,
                });
            }
        }
        builder.limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        builder.offset = params
            .get("offset")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if let Some(group_by) = params.get("group_by").and_then(|v| v.as_array()) {
            builder.group_by = group_by
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        if let Some(aggregations) = params.get("aggregations").and_then(|v| v.as_array()) {
            for aggregation in aggregations {
                let function = AggregateFunction::parse(
                    aggregation
                        .get("function")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            QueryError::Params("aggregation missing 'function'".into())
                        })?,
                )?;
                let column = aggregation
                    .get("column")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| QueryError::Params("aggregation missing 'column'".into()))?;
                builder.aggregations.push(Aggregation {
                    function,
                    column: column.to_string(),
                    alias: aggregation
                        .get("alias")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                });
            }
        }
        Ok(builder)
    }
}
