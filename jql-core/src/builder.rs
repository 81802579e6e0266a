use std::fmt::Write;

use crate::dialect::Dialect;
use crate::error::{JqlError, JqlResult};
use crate::query::{
    Action, AggregateField, Condition, HavingCondition, JoinClause, Operator, Query, Selection,
};
use crate::value::{Record, Value};

/// A compiled statement: SQL text plus its positional parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compiles a [`Query`] into parameterised SQL for one dialect.
///
/// Identifiers are quoted by the dialect unless they are `*` or already qualified
/// (`table.column`); every user-supplied value becomes a placeholder.
#[derive(Debug, Clone, Copy)]
pub struct SqlBuilder<'a> {
    dialect: &'a dyn Dialect,
    returning: Option<&'a str>,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            returning: Some("id"),
        }
    }

    /// Column named in `RETURNING` for inserts. Defaults to `id`.
    pub fn with_primary_key(mut self, primary_key: &'a str) -> Self {
        self.returning = Some(primary_key);
        self
    }

    /// Inserts into tables without a primary key must not ask for one back.
    pub fn without_returning(mut self) -> Self {
        self.returning = None;
        self
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn build(&self, query: &Query) -> JqlResult<BuildResult> {
        let mut stmt = Statement {
            dialect: self.dialect,
            params: Vec::new(),
        };
        let sql = match query.action {
            Some(Action::Find) | Some(Action::Aggregate) => stmt.select(query)?,
            Some(Action::Create) => stmt.insert(query, self.returning)?,
            Some(Action::CreateBatch) => stmt.insert_batch(query, self.returning)?,
            Some(Action::Update) => stmt.update(query)?,
            Some(Action::Delete) => stmt.delete(query)?,
            Some(Action::Count) => stmt.count(query)?,
            Some(other) => {
                return Err(JqlError::Build(format!(
                    "unsupported action for SQL building: {}",
                    other
                )));
            }
            None => return Err(JqlError::Validation("action is required".to_owned())),
        };
        Ok(BuildResult {
            sql,
            params: stmt.params,
        })
    }
}

/// Per-build state; placeholders are numbered by the parameter count so far.
struct Statement<'a> {
    dialect: &'a dyn Dialect,
    params: Vec<Value>,
}

impl Statement<'_> {
    fn bind(&mut self, value: &Value) -> JqlResult<String> {
        if let Some(reference) = value.find_ref() {
            return Err(JqlError::UnresolvedReference(reference.clone()));
        }
        self.params.push(value.clone());
        Ok(self.dialect.placeholder(self.params.len()))
    }

    fn column(&self, name: &str) -> String {
        if name == "*" || name.contains('.') {
            name.to_owned()
        } else {
            self.dialect.quote(name)
        }
    }

    fn select(&mut self, query: &Query) -> JqlResult<String> {
        let mut sql = String::with_capacity(128);
        sql.push_str("SELECT ");
        if query.select.is_empty() {
            sql.push('*');
        } else {
            let projection = query
                .select
                .iter()
                .map(|s| match s {
                    Selection::Column(name) => Ok(self.column(name)),
                    Selection::Aggregate(agg) => self.aggregate(agg),
                })
                .collect::<JqlResult<Vec<_>>>()?;
            sql.push_str(&projection.join(", "));
        }
        let _ = write!(sql, " FROM {}", self.dialect.quote(&query.table));

        for join in &query.join {
            sql.push_str(&self.join(join)?);
        }
        self.where_clause(&mut sql, &query.filters)?;

        if !query.group_by.is_empty() {
            let fields: Vec<_> = query.group_by.iter().map(|f| self.column(f)).collect();
            let _ = write!(sql, " GROUP BY {}", fields.join(", "));
        }
        if !query.having.is_empty() {
            let mut parts = Vec::with_capacity(query.having.len());
            for having in &query.having {
                parts.push(self.having(having)?);
            }
            let _ = write!(sql, " HAVING {}", parts.join(" AND "));
        }
        if !query.order_by.is_empty() {
            let fields: Vec<_> = query
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        self.column(&o.field),
                        if o.desc { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", fields.join(", "));
        }
        if query.limit > 0 {
            let _ = write!(sql, " LIMIT {}", query.limit);
        }
        if query.offset > 0 {
            let _ = write!(sql, " OFFSET {}", query.offset);
        }
        Ok(sql)
    }

    fn function_name(func: &str) -> JqlResult<String> {
        if func.is_empty() || !func.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(JqlError::Build(format!("invalid aggregate function {:?}", func)));
        }
        Ok(func.to_ascii_uppercase())
    }

    fn aggregate_call(&self, func: &str, field: &str) -> JqlResult<String> {
        let func = Self::function_name(func)?;
        if field.is_empty() || field == "*" {
            Ok(format!("{}(*)", func))
        } else {
            Ok(format!("{}({})", func, self.column(field)))
        }
    }

    fn aggregate(&self, agg: &AggregateField) -> JqlResult<String> {
        let call = self.aggregate_call(&agg.func, &agg.field)?;
        if agg.alias.is_empty() {
            Ok(call)
        } else {
            Ok(format!("{} AS {}", call, self.dialect.quote(&agg.alias)))
        }
    }

    fn join(&self, join: &JoinClause) -> JqlResult<String> {
        let kind = if join.kind.is_empty() {
            "INNER".to_owned()
        } else {
            join.kind.to_ascii_uppercase()
        };
        if !kind.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
            return Err(JqlError::Build(format!("invalid join type {:?}", join.kind)));
        }
        let mut sql = format!(" {} JOIN {}", kind, self.dialect.quote(&join.table));
        let on: Vec<_> = join
            .on
            .iter()
            .map(|(left, right)| format!("{} = {}", left, right))
            .collect();
        if !on.is_empty() {
            let _ = write!(sql, " ON {}", on.join(" AND "));
        }
        Ok(sql)
    }

    fn having(&mut self, having: &HavingCondition) -> JqlResult<String> {
        let lhs = self.aggregate_call(&having.func, &having.field)?;
        self.predicate(lhs, having.op, &having.value)
    }

    fn where_clause(&mut self, sql: &mut String, filters: &[Condition]) -> JqlResult<()> {
        if filters.is_empty() {
            return Ok(());
        }
        let clause = self.conditions(filters)?;
        let _ = write!(sql, " WHERE {}", clause);
        Ok(())
    }

    fn conditions(&mut self, conditions: &[Condition]) -> JqlResult<String> {
        let mut sql = String::new();
        for (i, condition) in conditions.iter().enumerate() {
            if i > 0 {
                sql.push_str(if condition.or { " OR " } else { " AND " });
            }
            let rendered = self.condition(condition)?;
            sql.push_str(&rendered);
        }
        Ok(sql)
    }

    fn condition(&mut self, condition: &Condition) -> JqlResult<String> {
        if !condition.and.is_empty() {
            return Ok(format!("({})", self.conditions(&condition.and)?));
        }
        if !condition.or_group.is_empty() {
            let mut parts = Vec::with_capacity(condition.or_group.len());
            for member in &condition.or_group {
                parts.push(self.condition(member)?);
            }
            return Ok(format!("({})", parts.join(" OR ")));
        }

        let op = condition.operator();
        if let Some(sub) = &condition.subquery {
            let inner = self.select(sub)?;
            if op == Operator::Exists {
                return Ok(format!("EXISTS ({})", inner));
            }
            return Ok(format!("{} {} ({})", self.column(&condition.field), op.sql(), inner));
        }
        if let Some(column) = &condition.column_ref {
            return Ok(format!("{} {} {}", self.column(&condition.field), op.sql(), column));
        }

        let lhs = self.column(&condition.field);
        self.predicate(lhs, op, &condition.value)
    }

    fn predicate(&mut self, lhs: String, op: Operator, value: &Value) -> JqlResult<String> {
        match op {
            Operator::Null | Operator::NotNull => Ok(format!("{} {}", lhs, op.sql())),
            Operator::In | Operator::NotIn => {
                let items = value.as_array().ok_or_else(|| {
                    JqlError::Build("IN operator requires array value".to_owned())
                })?;
                if items.is_empty() {
                    // Nothing can be IN an empty set, everything is NOT IN it.
                    return Ok(if op == Operator::In { "1=0" } else { "1=1" }.to_owned());
                }
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    placeholders.push(self.bind(item)?);
                }
                Ok(format!("{} {} ({})", lhs, op.sql(), placeholders.join(", ")))
            }
            Operator::Between => match value.as_array() {
                Some([low, high]) => {
                    let low = self.bind(low)?;
                    let high = self.bind(high)?;
                    Ok(format!("{} BETWEEN {} AND {}", lhs, low, high))
                }
                _ => Err(JqlError::Build(
                    "BETWEEN operator requires array of two values".to_owned(),
                )),
            },
            Operator::ILike if !self.dialect.supports_ilike() => {
                let ph = self.bind(value)?;
                Ok(format!("LOWER({}) LIKE LOWER({})", lhs, ph))
            }
            Operator::Exists => Err(JqlError::Build("EXISTS operator requires subquery".to_owned())),
            _ => {
                let ph = self.bind(value)?;
                Ok(format!("{} {} {}", lhs, op.sql(), ph))
            }
        }
    }

    fn returning(&self, sql: &mut String, primary_key: Option<&str>) {
        if let Some(pk) = primary_key.filter(|_| self.dialect.supports_returning()) {
            let _ = write!(sql, " RETURNING {}", self.dialect.quote(pk));
        }
    }

    fn insert(&mut self, query: &Query, primary_key: Option<&str>) -> JqlResult<String> {
        if query.data.is_empty() {
            return Err(JqlError::Build("no data provided for insert".to_owned()));
        }
        let columns: Vec<_> = query.data.keys().map(|k| self.dialect.quote(k)).collect();
        let mut placeholders = Vec::with_capacity(query.data.len());
        for value in query.data.values() {
            placeholders.push(self.bind(value)?);
        }
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.dialect.quote(&query.table),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.returning(&mut sql, primary_key);
        Ok(sql)
    }

    fn insert_batch(&mut self, query: &Query, primary_key: Option<&str>) -> JqlResult<String> {
        let Some(first) = query.data_batch.first().filter(|r| !r.is_empty()) else {
            return Err(JqlError::Build("no data provided for batch insert".to_owned()));
        };
        let keys: Vec<&String> = first.keys().collect();
        let columns: Vec<_> = keys.iter().map(|k| self.dialect.quote(k)).collect();

        let mut rows = Vec::with_capacity(query.data_batch.len());
        for (i, record) in query.data_batch.iter().enumerate() {
            if !same_keys(first, record) {
                return Err(JqlError::Build(format!(
                    "batch record {} has different columns than record 0",
                    i
                )));
            }
            let mut placeholders = Vec::with_capacity(keys.len());
            for key in &keys {
                let value = record.get(key.as_str()).unwrap_or(&Value::Null);
                placeholders.push(self.bind(value)?);
            }
            rows.push(format!("({})", placeholders.join(", ")));
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.dialect.quote(&query.table),
            columns.join(", "),
            rows.join(", ")
        );
        self.returning(&mut sql, primary_key);
        Ok(sql)
    }

    fn update(&mut self, query: &Query) -> JqlResult<String> {
        if query.data.is_empty() {
            return Err(JqlError::Build("no data provided for update".to_owned()));
        }
        let mut sets = Vec::with_capacity(query.data.len());
        for (column, value) in &query.data {
            let col = self.dialect.quote(column);
            let set = match counter_delta(value) {
                Some((sign, delta)) => format!("{} = {} {} {}", col, col, sign, self.bind(delta)?),
                None => format!("{} = {}", col, self.bind(value)?),
            };
            sets.push(set);
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.dialect.quote(&query.table),
            sets.join(", ")
        );
        self.where_clause(&mut sql, &query.filters)?;
        Ok(sql)
    }

    fn delete(&mut self, query: &Query) -> JqlResult<String> {
        let mut sql = format!("DELETE FROM {}", self.dialect.quote(&query.table));
        self.where_clause(&mut sql, &query.filters)?;
        Ok(sql)
    }

    fn count(&mut self, query: &Query) -> JqlResult<String> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.dialect.quote(&query.table));
        self.where_clause(&mut sql, &query.filters)?;
        Ok(sql)
    }
}

fn same_keys(a: &Record, b: &Record) -> bool {
    a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
}

/// `{"$incr": n}` / `{"$decr": n}` update payloads.
fn counter_delta(value: &Value) -> Option<(&'static str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    if let Some(delta) = map.get("$incr") {
        Some(("+", delta))
    } else {
        map.get("$decr").map(|delta| ("-", delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, PostgresDialect, SqliteDialect};
    use crate::query::Order;
    use crate::value::Reference;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn select_with_filters_order_and_paging() {
        let q = Query::find("users")
            .select(["id", "name"])
            .filter(Condition::new("age", Operator::Gt, 18))
            .filter(Condition::eq("status", "active"))
            .order(Order::desc("created_at"))
            .limit(10)
            .offset(20);

        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE \"age\" > $1 AND \"status\" = $2 \
             ORDER BY \"created_at\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(built.params, vec![Value::Int(18), Value::from("active")]);
    }

    #[test]
    fn mysql_uses_backticks_and_question_marks() {
        let q = Query::find("users").filter(Condition::eq("id", 1));
        let built = SqlBuilder::new(&MySqlDialect).build(&q).unwrap();
        assert_eq!(built.sql, "SELECT * FROM `users` WHERE `id` = ?");
    }

    #[test]
    fn or_flag_and_groups() {
        let q = Query::find("t")
            .filter(Condition::eq("a", 1))
            .filter(Condition::eq("b", 2).or())
            .filter(Condition::any(vec![
                Condition::is_null("c"),
                Condition::new("d", Operator::NotNull, Value::Null),
            ]))
            .filter(Condition::all(vec![
                Condition::eq("e", 3),
                Condition::eq("f", 4).or(),
            ]));
        let built = SqlBuilder::new(&SqliteDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "SELECT * FROM \"t\" WHERE \"a\" = ? OR \"b\" = ? AND (\"c\" IS NULL OR \"d\" IS NOT NULL) \
             AND (\"e\" = ? OR \"f\" = ?)"
        );
        assert_eq!(built.params.len(), 4);
    }

    #[test]
    fn in_expands_and_empty_in_short_circuits() {
        let q = Query::find("t").filter(Condition::new("id", Operator::In, vec![1, 2, 3]));
        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(built.sql, "SELECT * FROM \"t\" WHERE \"id\" IN ($1, $2, $3)");

        let empty = Query::find("t")
            .filter(Condition::new("id", Operator::In, Vec::<i64>::new()))
            .filter(Condition::new("x", Operator::NotIn, Vec::<i64>::new()));
        let built = SqlBuilder::new(&PostgresDialect).build(&empty).unwrap();
        assert_eq!(built.sql, "SELECT * FROM \"t\" WHERE 1=0 AND 1=1");
        assert!(built.params.is_empty());
    }

    #[test]
    fn in_and_between_shape_errors() {
        let q = Query::find("t").filter(Condition::new("id", Operator::In, 1));
        let err = SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err();
        assert_eq!(err.to_string(), "IN operator requires array value");

        let q = Query::find("t").filter(Condition::new("n", Operator::Between, vec![1]));
        let err = SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err();
        assert_eq!(err.to_string(), "BETWEEN operator requires array of two values");

        let q = Query::find("t").filter(Condition::new("n", Operator::Exists, 1));
        let err = SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err();
        assert_eq!(err.to_string(), "EXISTS operator requires subquery");
    }

    #[test]
    fn between_binds_two_params() {
        let q = Query::find("t").filter(Condition::new("n", Operator::Between, vec![1, 9]));
        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(built.sql, "SELECT * FROM \"t\" WHERE \"n\" BETWEEN $1 AND $2");
    }

    #[test]
    fn ilike_is_emulated_without_native_support() {
        let q = Query::find("t").filter(Condition::new("name", Operator::ILike, "%ann%"));
        let pg = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(pg.sql, "SELECT * FROM \"t\" WHERE \"name\" ILIKE $1");
        let lite = SqlBuilder::new(&SqliteDialect).build(&q).unwrap();
        assert_eq!(lite.sql, "SELECT * FROM \"t\" WHERE LOWER(\"name\") LIKE LOWER(?)");
    }

    #[test]
    fn subquery_continues_placeholder_numbering() {
        let sub = Query::find("orders")
            .select(["user_id"])
            .filter(Condition::new("total", Operator::Gt, 100));
        let q = Query::find("users")
            .filter(Condition::eq("active", true))
            .filter(Condition::subquery("id", Operator::In, sub));
        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "SELECT * FROM \"users\" WHERE \"active\" = $1 AND \"id\" IN \
             (SELECT \"user_id\" FROM \"orders\" WHERE \"total\" > $2)"
        );
        assert_eq!(built.params, vec![Value::Bool(true), Value::Int(100)]);
    }

    #[test]
    fn exists_subquery_has_no_left_operand() {
        let sub = Query::find("orders").filter(Condition::column(
            "user_id",
            Operator::Eq,
            "users.id",
        ));
        let q = Query::find("users").filter(Condition::subquery("", Operator::Exists, sub));
        let built = SqlBuilder::new(&SqliteDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "SELECT * FROM \"users\" WHERE EXISTS (SELECT * FROM \"orders\" WHERE \"user_id\" = users.id)"
        );
    }

    #[test]
    fn aggregates_joins_group_and_having() {
        let q = Query {
            join: vec![JoinClause {
                table: "orders".into(),
                kind: "left".into(),
                on: [("users.id".to_owned(), "orders.user_id".to_owned())]
                    .into_iter()
                    .collect(),
            }],
            group_by: vec!["users.id".into()],
            having: vec![HavingCondition {
                func: "count".into(),
                field: String::new(),
                op: Operator::Gt,
                value: Value::Int(5),
            }],
            ..Query::new(Action::Aggregate, "users").select([
                Selection::from("users.id"),
                Selection::Aggregate(AggregateField {
                    func: "sum".into(),
                    field: "orders.total".into(),
                    alias: "spent".into(),
                }),
            ])
        };
        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "SELECT users.id, SUM(orders.total) AS \"spent\" FROM \"users\" \
             LEFT JOIN \"orders\" ON users.id = orders.user_id GROUP BY users.id HAVING COUNT(*) > $1"
        );
    }

    #[test]
    fn aggregate_function_names_are_checked() {
        let q = Query::find("t").select([Selection::Aggregate(AggregateField {
            func: "count(*); drop table t; --".into(),
            field: String::new(),
            alias: String::new(),
        })]);
        assert!(SqlBuilder::new(&SqliteDialect).build(&q).is_err());
    }

    #[test]
    fn insert_returns_primary_key_when_supported() {
        let data = record(&[("name", Value::from("ann")), ("age", Value::Int(30))]);
        let q = Query::create("users", data);
        let pg = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(
            pg.sql,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES ($1, $2) RETURNING \"id\""
        );
        let my = SqlBuilder::new(&MySqlDialect).build(&q).unwrap();
        assert_eq!(my.sql, "INSERT INTO `users` (`name`, `age`) VALUES (?, ?)");
        let custom = SqlBuilder::new(&SqliteDialect)
            .with_primary_key("user_id")
            .build(&q)
            .unwrap();
        assert!(custom.sql.ends_with("RETURNING \"user_id\""));
        let keyless = SqlBuilder::new(&SqliteDialect)
            .without_returning()
            .build(&q)
            .unwrap();
        assert!(!keyless.sql.contains("RETURNING"));
    }

    #[test]
    fn batch_insert_follows_first_record_column_order() {
        let q = Query::create_batch(
            "t",
            vec![
                record(&[("a", Value::Int(1)), ("b", Value::Int(2))]),
                record(&[("b", Value::Int(4)), ("a", Value::Int(3))]),
            ],
        );
        let built = SqlBuilder::new(&MySqlDialect).build(&q).unwrap();
        assert_eq!(built.sql, "INSERT INTO `t` (`a`, `b`) VALUES (?, ?), (?, ?)");
        assert_eq!(
            built.params,
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
    }

    #[test]
    fn batch_insert_rejects_mismatched_columns() {
        let q = Query::create_batch(
            "t",
            vec![
                record(&[("a", Value::Int(1))]),
                record(&[("c", Value::Int(2))]),
            ],
        );
        assert!(matches!(
            SqlBuilder::new(&SqliteDialect).build(&q),
            Err(JqlError::Build(_))
        ));
        let empty = Query::create_batch("t", vec![]);
        assert_eq!(
            SqlBuilder::new(&SqliteDialect).build(&empty).unwrap_err().to_string(),
            "no data provided for batch insert"
        );
    }

    #[test]
    fn update_with_counters() {
        let mut incr = Record::new();
        incr.insert("$incr".into(), Value::Int(1));
        let data = record(&[("views", Value::Object(incr)), ("title", Value::from("x"))]);
        let q = Query::update("posts", data).filter(Condition::eq("id", 7));
        let built = SqlBuilder::new(&PostgresDialect).build(&q).unwrap();
        assert_eq!(
            built.sql,
            "UPDATE \"posts\" SET \"views\" = \"views\" + $1, \"title\" = $2 WHERE \"id\" = $3"
        );
    }

    #[test]
    fn delete_count_and_missing_data() {
        let q = Query::delete("t").filter(Condition::eq("id", 1));
        assert_eq!(
            SqlBuilder::new(&SqliteDialect).build(&q).unwrap().sql,
            "DELETE FROM \"t\" WHERE \"id\" = ?"
        );
        let q = Query::count("t");
        assert_eq!(
            SqlBuilder::new(&SqliteDialect).build(&q).unwrap().sql,
            "SELECT COUNT(*) FROM \"t\""
        );
        let q = Query::update("t", Record::new());
        assert_eq!(
            SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err().to_string(),
            "no data provided for update"
        );
    }

    #[test]
    fn unresolved_reference_is_rejected() {
        let q = Query::find("t").filter(Condition::eq("user_id", Reference::new("u", "id")));
        let err = SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err();
        assert!(matches!(err, JqlError::UnresolvedReference(r) if r.alias == "u"));
    }

    #[test]
    fn non_sql_actions_are_rejected() {
        let q = Query::new(Action::ListTables, "");
        assert_eq!(
            SqlBuilder::new(&SqliteDialect).build(&q).unwrap_err().to_string(),
            "unsupported action for SQL building: list_tables"
        );
    }
}
