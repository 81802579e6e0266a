use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{JqlError, JqlResult};
use crate::value::{Record, Value};

/// The operation a [`Query`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Find,
    Create,
    CreateBatch,
    Update,
    Delete,
    Count,
    Aggregate,
    Transaction,
    Explain,
    Validate,
    ListTables,
    Describe,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Create => "create",
            Self::CreateBatch => "create_batch",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::Transaction => "transaction",
            Self::Explain => "explain",
            Self::Validate => "validate",
            Self::ListTables => "list_tables",
            Self::Describe => "describe",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operators accepted in `where` and `having`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne", alias = "<>")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "ilike")]
    ILike,
    #[serde(rename = "not_like")]
    NotLike,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "null", alias = "is_null")]
    Null,
    #[serde(rename = "not_null", alias = "is_not_null")]
    NotNull,
    #[serde(rename = "exists")]
    Exists,
}

impl Operator {
    /// SQL spelling of the operator.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::NotLike => "NOT LIKE",
            Self::Between => "BETWEEN",
            Self::Null => "IS NULL",
            Self::NotNull => "IS NOT NULL",
            Self::Exists => "EXISTS",
        }
    }
}

/// One predicate of a `where` list.
///
/// Exactly one of the plain value, `and`, `or_group`, `subquery` or `ref` forms applies.
/// `or` decides how this condition joins the one before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Operator>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub or: bool,
    /// Raw column reference compared against `field`, emitted verbatim.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub column_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subquery: Option<Box<Query>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<Condition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub or_group: Vec<Condition>,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: Some(op),
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, Operator::Null, Value::Null)
    }

    /// A parenthesised group whose members are joined by their own flags.
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            and: conditions,
            ..Self::default()
        }
    }

    /// A parenthesised group whose members are all joined by OR.
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            or_group: conditions,
            ..Self::default()
        }
    }

    pub fn subquery(field: impl Into<String>, op: Operator, query: Query) -> Self {
        Self {
            field: field.into(),
            op: Some(op),
            subquery: Some(Box::new(query)),
            ..Self::default()
        }
    }

    pub fn column(field: impl Into<String>, op: Operator, column: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: Some(op),
            column_ref: Some(column.into()),
            ..Self::default()
        }
    }

    /// Joins this condition to the previous one with OR instead of AND.
    pub fn or(mut self) -> Self {
        self.or = true;
        self
    }

    pub fn operator(&self) -> Operator {
        self.op.unwrap_or(Operator::Eq)
    }

    fn validate(&self) -> JqlResult<()> {
        let forms = [
            !self.and.is_empty(),
            !self.or_group.is_empty(),
            self.subquery.is_some(),
            self.column_ref.is_some(),
        ];
        let structured = forms.iter().filter(|set| **set).count();
        if structured > 1 || (structured == 1 && !self.value.is_null()) {
            return Err(JqlError::Validation(format!(
                "condition on {:?} mixes value, and, or_group, subquery and ref forms",
                self.field
            )));
        }
        if structured == 0 && self.field.is_empty() {
            return Err(JqlError::Validation(
                "condition requires a field".to_owned(),
            ));
        }
        for nested in self.and.iter().chain(&self.or_group) {
            nested.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub desc: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HavingCondition {
    #[serde(rename = "fn")]
    pub func: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClause {
    pub table: String,
    /// left, right, inner, full. Empty means INNER.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// `left column = right column` pairs, both emitted verbatim.
    pub on: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateField {
    #[serde(rename = "fn")]
    pub func: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(rename = "as", default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
}

/// A projection entry: a column name or an aggregate descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Column(String),
    Aggregate(AggregateField),
}

impl From<&str> for Selection {
    fn from(column: &str) -> Self {
        Selection::Column(column.to_owned())
    }
}

impl From<AggregateField> for Selection {
    fn from(agg: AggregateField) -> Self {
        Selection::Aggregate(agg)
    }
}

/// A relation to preload: a bare name, or names mapped to their own nested preloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WithSpec {
    Name(String),
    Nested(IndexMap<String, Vec<WithSpec>>),
}

impl WithSpec {
    pub fn nested(name: impl Into<String>, children: Vec<WithSpec>) -> Self {
        let mut map = IndexMap::new();
        map.insert(name.into(), children);
        WithSpec::Nested(map)
    }

    /// Flattens into `(relation name, nested specs)` pairs.
    pub fn entries(&self) -> Vec<(&str, &[WithSpec])> {
        match self {
            WithSpec::Name(name) => vec![(name.as_str(), &[][..])],
            WithSpec::Nested(map) => map
                .iter()
                .map(|(name, nested)| (name.as_str(), nested.as_slice()))
                .collect(),
        }
    }
}

impl From<&str> for WithSpec {
    fn from(name: &str) -> Self {
        WithSpec::Name(name.to_owned())
    }
}

/// A JQL request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Condition>,
    #[serde(skip_serializing_if = "Record::is_empty")]
    pub data: Record,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_batch: Vec<Record>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<Selection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<Order>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<HavingCondition>,
    #[serde(skip_serializing_if = "is_zero")]
    pub limit: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub with: Vec<WithSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub join: Vec<JoinClause>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Query>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// `"250ms"`, `"5s"`, `"2m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    /// Target of `explain` and `validate`.
    #[serde(rename = "query", skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<Query>>,
    /// Redeems a token returned by a blocked destructive write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_token: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Query {
    pub fn new(action: Action, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn find(table: impl Into<String>) -> Self {
        Self::new(Action::Find, table)
    }

    pub fn create(table: impl Into<String>, data: Record) -> Self {
        Self {
            data,
            ..Self::new(Action::Create, table)
        }
    }

    pub fn create_batch(table: impl Into<String>, data_batch: Vec<Record>) -> Self {
        Self {
            data_batch,
            ..Self::new(Action::CreateBatch, table)
        }
    }

    pub fn update(table: impl Into<String>, data: Record) -> Self {
        Self {
            data,
            ..Self::new(Action::Update, table)
        }
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(Action::Delete, table)
    }

    pub fn count(table: impl Into<String>) -> Self {
        Self::new(Action::Count, table)
    }

    pub fn transaction(operations: Vec<Query>) -> Self {
        Self {
            action: Some(Action::Transaction),
            operations,
            ..Self::default()
        }
    }

    pub fn explain(inner: Query) -> Self {
        Self {
            action: Some(Action::Explain),
            inner: Some(Box::new(inner)),
            ..Self::default()
        }
    }

    /// Appends a predicate.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn select<S: Into<Selection>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.select.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with(mut self, spec: impl Into<WithSpec>) -> Self {
        self.with.push(spec.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Parses a JQL JSON document.
    pub fn parse(jql: &str) -> JqlResult<Self> {
        Ok(serde_json::from_str(jql)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Rejects queries missing the fields their action requires.
    pub fn validate(&self) -> JqlResult<()> {
        let Some(action) = self.action else {
            return Err(JqlError::Validation("action is required".to_owned()));
        };
        let need_table = || {
            if self.table.is_empty() {
                Err(JqlError::Validation(format!(
                    "table is required for action {:?}",
                    action.as_str()
                )))
            } else {
                Ok(())
            }
        };

        match action {
            Action::Find | Action::Count | Action::Delete | Action::Aggregate | Action::Describe => {
                need_table()?
            }
            Action::Update => {
                need_table()?;
                if self.data.is_empty() {
                    return Err(JqlError::Validation(
                        "data is required for action \"update\"".to_owned(),
                    ));
                }
            }
            Action::Create => {
                need_table()?;
                if self.data.is_empty() {
                    return Err(JqlError::Validation(
                        "data is required for action \"create\"".to_owned(),
                    ));
                }
            }
            Action::CreateBatch => {
                need_table()?;
                if self.data_batch.is_empty() {
                    return Err(JqlError::Validation(
                        "data_batch is required for action \"create_batch\"".to_owned(),
                    ));
                }
            }
            Action::Transaction => {
                if self.operations.is_empty() {
                    return Err(JqlError::Validation(
                        "operations is required for action \"transaction\"".to_owned(),
                    ));
                }
            }
            Action::Explain | Action::Validate => {
                if self.inner.is_none() {
                    return Err(JqlError::Validation(format!(
                        "query is required for action {:?}",
                        action.as_str()
                    )));
                }
            }
            Action::ListTables => {}
        }

        for condition in &self.filters {
            condition.validate()?;
        }
        self.timeout_duration()?;
        Ok(())
    }

    /// The parsed `timeout`, if one was given.
    pub fn timeout_duration(&self) -> JqlResult<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}

/// Parses `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(raw: &str) -> JqlResult<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| JqlError::Validation(format!("invalid timeout {:?}", raw)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(JqlError::Validation(format!("invalid timeout {:?}", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let q = Query::parse(
            r#"{
                "table": "users",
                "action": "find",
                "where": [
                    {"field": "age", "op": ">", "value": 18},
                    {"field": "status", "op": "in", "value": ["a", "b"], "or": true},
                    {"or_group": [{"field": "x", "op": "null"}, {"field": "y", "op": "not_null"}]}
                ],
                "select": ["id", {"fn": "count", "field": "id", "as": "n"}],
                "order_by": [{"field": "id", "desc": true}],
                "with": ["posts", {"profile": ["avatar"]}],
                "limit": 10,
                "timeout": "5s"
            }"#,
        )
        .unwrap();

        assert_eq!(q.action, Some(Action::Find));
        assert_eq!(q.filters.len(), 3);
        assert_eq!(q.filters[0].operator(), Operator::Gt);
        assert!(q.filters[1].or);
        assert_eq!(q.filters[2].or_group.len(), 2);
        assert_eq!(
            q.select[1],
            Selection::Aggregate(AggregateField {
                func: "count".into(),
                field: "id".into(),
                alias: "n".into()
            })
        );
        assert_eq!(q.with[1].entries()[0].0, "profile");
        assert_eq!(q.timeout_duration().unwrap(), Some(Duration::from_secs(5)));
        q.validate().unwrap();
    }

    #[test]
    fn operator_aliases_parse() {
        let c: Condition = serde_json::from_str(r#"{"field": "a", "op": "gte", "value": 1}"#).unwrap();
        assert_eq!(c.operator(), Operator::Gte);
        let c: Condition = serde_json::from_str(r#"{"field": "a", "value": 1}"#).unwrap();
        assert_eq!(c.operator(), Operator::Eq);
    }

    #[test]
    fn validate_requires_action_specific_fields() {
        let missing_action = Query {
            table: "users".into(),
            ..Query::default()
        };
        assert!(missing_action.validate().is_err());

        let create = Query::new(Action::Create, "users");
        let err = create.validate().unwrap_err();
        assert!(err.to_string().contains("data is required"));

        let tx = Query::transaction(vec![]);
        assert!(tx.validate().unwrap_err().to_string().contains("operations"));

        let explain = Query::new(Action::Explain, "");
        assert!(explain.validate().is_err());

        Query::new(Action::ListTables, "").validate().unwrap();
    }

    #[test]
    fn validate_rejects_mixed_condition_forms() {
        let mut cond = Condition::eq("a", 1);
        cond.column_ref = Some("b.a".into());
        let q = Query::find("t").filter(cond);
        assert!(q.validate().is_err());

        let nested_bad = Condition::any(vec![Condition::default()]);
        assert!(Query::find("t").filter(nested_bad).validate().is_err());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn unknown_action_is_a_parse_error() {
        let err = Query::parse(r#"{"table": "t", "action": "truncate"}"#).unwrap_err();
        assert!(matches!(err, JqlError::Parse(_)));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let q = Query::find("users").limit(5);
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json, serde_json::json!({"table": "users", "action": "find", "limit": 5}));
    }
}
