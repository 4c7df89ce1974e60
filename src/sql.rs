use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, WeekReference};
use crate::limits::MAX_IN_CLAUSE_STATUSES;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterResource {
        id: Ulid,
        name: Option<String>,
    },
    RegisterAccount {
        id: Ulid,
    },
    RegisterGroup {
        id: Ulid,
    },
    CreateRequest {
        draft: RequestDraft,
    },
    UpdateStatus {
        id: Ulid,
        change: StatusChange,
    },
    SelectBlockedSlots {
        resource_id: Ulid,
        reference: WeekReference,
    },
    SelectRequests {
        id: Option<Ulid>,
        filter: RequestFilter,
        /// From `"end" > x`.
        window_start: Option<Ms>,
        /// From `start < x`.
        window_end: Option<Ms>,
    },
    SelectResources,
}

/// Parse the first statement of `sql`.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    parse_statement(&stmts[0])
}

/// Parse every `;`-separated statement, as sent in one simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = named_row(insert, &["id", "name"])?;
            let mut id = None;
            let mut name = None;
            for (col, expr) in &row {
                match col.as_str() {
                    "id" => id = Some(parse_ulid_expr(expr)?),
                    "name" => name = parse_string_or_null(expr)?,
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::RegisterResource {
                id: id.ok_or(SqlError::MissingColumn("id"))?,
                name,
            })
        }
        "accounts" => Ok(Command::RegisterAccount { id: parse_id_row(insert)? }),
        "groups" => Ok(Command::RegisterGroup { id: parse_id_row(insert)? }),
        "requests" => {
            let row = named_row(
                insert,
                &[
                    "resource_id",
                    "owner_id",
                    "group_id",
                    "start",
                    "end",
                    "title",
                    "description",
                    "reason",
                ],
            )?;
            // Absent columns stay None so the store can name the missing field.
            let mut draft = RequestDraft::default();
            for (col, expr) in &row {
                match col.as_str() {
                    "resource_id" => draft.resource_id = parse_ulid_or_null(expr)?,
                    "owner_id" => draft.owner_id = parse_ulid_or_null(expr)?,
                    "group_id" => draft.group_id = parse_ulid_or_null(expr)?,
                    "start" | "start_time" => draft.start = parse_instant_or_null(expr)?,
                    "end" | "end_time" => draft.end = parse_instant_or_null(expr)?,
                    "title" => draft.title = parse_string_or_null(expr)?,
                    "description" => draft.description = parse_string_or_null(expr)?,
                    "reason" => draft.reason = parse_string_or_null(expr)?,
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::CreateRequest { draft })
        }
        "status_changes" => {
            let row = named_row(
                insert,
                &["request_id", "status", "actor_id", "secondary_approver_id"],
            )?;
            let (mut id, mut status, mut actor, mut secondary) = (None, None, None, None);
            for (col, expr) in &row {
                match col.as_str() {
                    "request_id" => id = Some(parse_ulid_expr(expr)?),
                    "status" => status = Some(parse_status_expr(expr)?),
                    "actor_id" => actor = Some(parse_ulid_expr(expr)?),
                    "secondary_approver_id" => secondary = parse_ulid_or_null(expr)?,
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            let mut change = StatusChange::new(
                status.ok_or(SqlError::MissingColumn("status"))?,
                actor.ok_or(SqlError::MissingColumn("actor_id"))?,
            );
            if let Some(secondary) = secondary {
                change = change.with_secondary_approver(secondary);
            }
            Ok(Command::UpdateStatus {
                id: id.ok_or(SqlError::MissingColumn("request_id"))?,
                change,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Single-column `(id)` registration row.
fn parse_id_row(insert: &ast::Insert) -> Result<Ulid, SqlError> {
    let mut id = None;
    for (col, expr) in &named_row(insert, &["id"])? {
        match col.as_str() {
            "id" => id = Some(parse_ulid_expr(expr)?),
            _ => return Err(SqlError::UnknownColumn(col.clone())),
        }
    }
    id.ok_or(SqlError::MissingColumn("id"))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "blocked_slots" => Ok(Command::SelectBlockedSlots {
            resource_id: filters.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
            reference: filters.week_of.ok_or(SqlError::MissingFilter("week_of"))?,
        }),
        "requests" => Ok(Command::SelectRequests {
            id: filters.id,
            filter: RequestFilter {
                resource_id: filters.resource_id,
                owner_id: filters.owner_id,
                group_id: filters.group_id,
                statuses: filters.statuses,
            },
            window_start: filters.end_after,
            window_end: filters.start_before,
        }),
        "resources" => Ok(Command::SelectResources),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    owner_id: Option<Ulid>,
    group_id: Option<Ulid>,
    statuses: Option<Vec<RequestStatus>>,
    week_of: Option<WeekReference>,
    start_before: Option<Ms>,
    end_after: Option<Ms>,
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, f)?,
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    extract_filters(left, f)?;
                    extract_filters(right, f)?;
                }
                (ast::BinaryOperator::Eq, Some("id")) => f.id = Some(parse_ulid_expr(right)?),
                (ast::BinaryOperator::Eq, Some("resource_id")) => {
                    f.resource_id = Some(parse_ulid_expr(right)?)
                }
                (ast::BinaryOperator::Eq, Some("owner_id")) => {
                    f.owner_id = Some(parse_ulid_expr(right)?)
                }
                (ast::BinaryOperator::Eq, Some("group_id")) => {
                    f.group_id = Some(parse_ulid_expr(right)?)
                }
                (ast::BinaryOperator::Eq, Some("status")) => {
                    f.statuses = Some(vec![parse_status_expr(right)?])
                }
                (ast::BinaryOperator::Eq, Some("week_of")) => {
                    let text = literal_text(right)?;
                    f.week_of = Some(text.parse().map_err(|e| SqlError::Parse(format!("{e}")))?);
                }
                (ast::BinaryOperator::Lt, Some("start") | Some("start_time")) => {
                    f.start_before = Some(parse_instant_expr(right)?)
                }
                (ast::BinaryOperator::Gt, Some("end") | Some("end_time")) => {
                    f.end_after = Some(parse_instant_expr(right)?)
                }
                _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
            }
        }
        Expr::InList {
            expr: col,
            list,
            negated: false,
        } if expr_column_name(col).as_deref() == Some("status") => {
            if list.len() > MAX_IN_CLAUSE_STATUSES {
                return Err(SqlError::Parse("too many statuses in IN list".into()));
            }
            let statuses = list
                .iter()
                .map(parse_status_expr)
                .collect::<Result<Vec<_>, _>>()?;
            f.statuses = Some(statuses);
        }
        _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Pair the single VALUES row with its column names. Without a column list,
/// values are taken positionally in `default_columns` order.
fn named_row(insert: &ast::Insert, default_columns: &[&str]) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().take(row.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Text of a string or numeric literal.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string or number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// RFC 3339 string or integer milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    let s = literal_text(expr)?;
    calendar::parse_instant(&s).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_instant_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_instant_expr(expr).map(Some)
}

fn parse_status_expr(expr: &Expr) -> Result<RequestStatus, SqlError> {
    literal_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
