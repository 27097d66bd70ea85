use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{ReservationRequest, RoomRequest};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectRooms,
    InsertRoom(RoomRequest),
    SelectReservations {
        room_id: Option<Ulid>,
        id: Option<Ulid>,
    },
    InsertReservation(ReservationRequest),
    UpdateReservationStatus {
        id: Ulid,
        status: String,
    },
    SelectAvailability {
        room_id: Ulid,
        date: String,
    },
    SelectNotifications,
    MarkNotificationRead {
        id: Ulid,
    },
}

/// Which row layout a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Rooms,
    Reservations,
    Availability,
    Notifications,
}

impl Command {
    pub fn row_shape(&self) -> RowShape {
        match self {
            Command::SelectRooms | Command::InsertRoom(_) => RowShape::Rooms,
            Command::SelectReservations { .. }
            | Command::InsertReservation(_)
            | Command::UpdateReservationStatus { .. } => RowShape::Reservations,
            Command::SelectAvailability { .. } => RowShape::Availability,
            Command::SelectNotifications | Command::MarkNotificationRead { .. } => RowShape::Notifications,
        }
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    stmts.into_iter().next().ok_or(SqlError::Empty)
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Query(query) => parse_select(&query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, &assignments, &selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row layout of a statement without reading its values, so it works on
/// unbound `$n` placeholders.
pub fn describe(sql: &str) -> Result<Option<RowShape>, SqlError> {
    let table = match parse_statement(sql)? {
        Statement::Insert(insert) => insert_table_name(&insert)?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => match select.from.first() {
                Some(from) => table_factor_name(&from.relation)?,
                None => return Ok(None),
            },
            _ => return Ok(None),
        },
        Statement::Update { table, .. } => table_factor_name(&table.relation)?,
        _ => return Ok(None),
    };
    Ok(match table.as_str() {
        "rooms" => Some(RowShape::Rooms),
        "reservations" => Some(RowShape::Reservations),
        "availability" => Some(RowShape::Availability),
        "notifications" => Some(RowShape::Notifications),
        _ => None,
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (name[, capacity[, amenities]])
        "rooms" => {
            if values.is_empty() || values.len() > 3 {
                return Err(SqlError::WrongArity("rooms", 3, values.len()));
            }
            let capacity = match values.get(1) {
                Some(expr) => parse_i64_or_null(expr)?,
                None => None,
            };
            let amenities = match values.get(2) {
                Some(expr) => parse_text_or_null(expr)?
                    .map(|list| list.split(',').map(|a| a.trim().to_string()).collect())
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(Command::InsertRoom(RoomRequest {
                name: parse_text_or_null(&values[0])?,
                capacity,
                amenities,
            }))
        }
        // (room_id, title, description, attendees, start_time, end_time)
        "reservations" => {
            if values.len() != 6 {
                return Err(SqlError::WrongArity("reservations", 6, values.len()));
            }
            Ok(Command::InsertReservation(ReservationRequest {
                room_id: parse_ulid_or_null(&values[0])?,
                title: parse_text_or_null(&values[1])?,
                description: parse_text_or_null(&values[2])?,
                attendees: parse_i64_or_null(&values[3])?,
                start_time: parse_text_or_null(&values[4])?,
                end_time: parse_text_or_null(&values[5])?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE must set exactly one column".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };

    match (table.as_str(), column.as_deref()) {
        ("reservations", Some("status")) => Ok(Command::UpdateReservationStatus {
            id,
            status: parse_text_or_null(&assignment.value)?.unwrap_or_default(),
        }),
        ("notifications", Some("is_read")) => {
            if parse_bool(&assignment.value)? {
                Ok(Command::MarkNotificationRead { id })
            } else {
                Err(SqlError::Unsupported("notifications can only be marked read".into()))
            }
        }
        ("reservations" | "notifications", col) => Err(SqlError::Unsupported(format!(
            "cannot update column {} of {table}",
            col.unwrap_or("?")
        ))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "notifications" => Ok(Command::SelectNotifications),
        "reservations" => Ok(Command::SelectReservations {
            room_id: filter("room_id").map(parse_ulid_expr).transpose()?,
            id: filter("id").map(parse_ulid_expr).transpose()?,
        }),
        "availability" => {
            let room_id = filter("room_id").ok_or(SqlError::MissingFilter("room_id"))?;
            let date = filter("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectAvailability {
                room_id: parse_ulid_expr(room_id)?,
                date: parse_text_or_null(date)?.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

/// Any scalar literal as text; `NULL` is `None`.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(value) => Err(SqlError::Parse(format!("expected text, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
