use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_VALUES;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertListing {
        id: Ulid,
        listing: NewListing,
    },
    UpdateListing {
        id: Ulid,
        patch: ListingPatch,
    },
    DeleteListing {
        id: Ulid,
    },
    SelectListings {
        id: Option<Ulid>,
    },
    InsertBooking(NewBooking),
    BatchInsertBookings {
        bookings: Vec<NewBooking>,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        listing_id: Option<Ulid>,
        statuses: Vec<BookingStatus>,
    },
    SelectQuote {
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        booking_id: Option<Ulid>,
    },
    InsertReview {
        id: Ulid,
        listing_id: Ulid,
        rating: i64,
        comment: String,
    },
    DeleteReview {
        id: Ulid,
    },
    SelectReviews {
        id: Option<Ulid>,
        listing_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const LISTING_COLUMNS: [&str; 5] = ["id", "name", "description", "location", "price_per_night"];
const BOOKING_COLUMNS: [&str; 4] = ["id", "listing_id", "start_date", "end_date"];
const REVIEW_COLUMNS: [&str; 4] = ["id", "listing_id", "rating", "comment"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "listings" => {
            let [values] = rows else {
                return Err(SqlError::Unsupported("multi-row INSERT into listings".into()));
            };
            let mut row = Row::new("listings", &columns, &LISTING_COLUMNS, values)?;
            let id = row.take_opt("id", parse_ulid)?.unwrap_or_else(Ulid::new);
            let listing = NewListing {
                name: row.take("name", parse_text)?,
                description: row.take("description", parse_text)?,
                location: row.take("location", parse_text)?,
                price_per_night: row.take("price_per_night", parse_money)?,
            };
            row.finish()?;
            Ok(Command::InsertListing { id, listing })
        }
        "bookings" => {
            let mut bookings = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let booking = parse_booking_row(&columns, values)
                    .map_err(|e| if rows.len() > 1 { e.in_row(i) } else { e })?;
                bookings.push(booking);
            }
            if bookings.len() == 1 {
                Ok(Command::InsertBooking(bookings.remove(0)))
            } else {
                Ok(Command::BatchInsertBookings { bookings })
            }
        }
        "reviews" => {
            let [values] = rows else {
                return Err(SqlError::Unsupported("multi-row INSERT into reviews".into()));
            };
            let mut row = Row::new("reviews", &columns, &REVIEW_COLUMNS, values)?;
            let id = row.take_opt("id", parse_ulid)?.unwrap_or_else(Ulid::new);
            let listing_id = row.take("listing_id", parse_ulid)?;
            let rating = row.take("rating", parse_i64)?;
            let comment = row.take("comment", parse_text)?;
            row.finish()?;
            Ok(Command::InsertReview {
                id,
                listing_id,
                rating,
                comment,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_row(columns: &[String], values: &[Expr]) -> Result<NewBooking, SqlError> {
    let mut row = Row::new("bookings", columns, &BOOKING_COLUMNS, values)?;
    let id = row.take_opt("id", parse_ulid)?.unwrap_or_else(Ulid::new);
    let listing_id = row.take("listing_id", parse_ulid)?;
    let start_date = row.take("start_date", parse_date)?;
    let end_date = row.take("end_date", parse_date)?;
    // Derived; a client-supplied value is ignored.
    row.take_opt("total_price", parse_money)?;
    row.finish()?;
    Ok(NewBooking {
        id,
        listing_id,
        start_date,
        end_date,
    })
}

/// Column name → value for one VALUES row. Without an explicit column list
/// the values are positional; a leading `id` may be omitted.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        columns: &[String],
        defaults: &[&str],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if !columns.is_empty() {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.to_vec()
        } else if values.len() == defaults.len() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else if values.len() + 1 == defaults.len() {
            defaults[1..].iter().map(|c| c.to_string()).collect()
        } else {
            return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
        };
        Ok(Self {
            table,
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn from_assignments(
        table: &'static str,
        assignments: &'a [ast::Assignment],
    ) -> Result<Self, SqlError> {
        let mut cells = Vec::with_capacity(assignments.len());
        for a in assignments {
            let name = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                _ => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            cells.push((name, &a.value));
        }
        Ok(Self { table, cells })
    }

    fn take_expr(&mut self, column: &str) -> Option<&'a Expr> {
        let pos = self.cells.iter().position(|(name, _)| name == column)?;
        Some(self.cells.remove(pos).1)
    }

    fn has(&self, column: &str) -> bool {
        self.cells.iter().any(|(name, _)| name == column)
    }

    fn take_opt<T>(
        &mut self,
        column: &'static str,
        parse: fn(&'static str, &Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.take_expr(column).map(|e| parse(column, e)).transpose()
    }

    fn take<T>(
        &mut self,
        column: &'static str,
        parse: fn(&'static str, &Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.take_opt(column, parse)?
            .ok_or(SqlError::MissingColumn(column))
    }

    /// Every column must have been consumed.
    fn finish(self) -> Result<(), SqlError> {
        match self.cells.into_iter().next() {
            Some((name, _)) => Err(SqlError::UnknownColumn(self.table, name)),
            None => Ok(()),
        }
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "listings" => {
            let mut row = Row::from_assignments("listings", assignments)?;
            let patch = ListingPatch {
                name: row.take_opt("name", parse_text)?,
                description: row.take_opt("description", parse_text)?,
                location: row.take_opt("location", parse_text)?,
                price_per_night: row.take_opt("price_per_night", parse_money)?,
            };
            row.finish()?;
            Ok(Command::UpdateListing { id, patch })
        }
        "bookings" => {
            let mut row = Row::from_assignments("bookings", assignments)?;
            row.take_opt("total_price", parse_money)?;
            if row.has("status") {
                let status = row.take("status", parse_status)?;
                if !row.cells.is_empty() {
                    return Err(SqlError::Unsupported(
                        "status cannot be changed together with other columns".into(),
                    ));
                }
                return Ok(Command::SetBookingStatus { id, status });
            }
            let patch = BookingPatch {
                listing_id: row.take_opt("listing_id", parse_ulid)?,
                start_date: row.take_opt("start_date", parse_date)?,
                end_date: row.take_opt("end_date", parse_date)?,
            };
            row.finish()?;
            Ok(Command::UpdateBooking { id, patch })
        }
        "reviews" => Err(SqlError::Unsupported("reviews are immutable".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "listings" => Ok(Command::DeleteListing { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "reviews" => Ok(Command::DeleteReview { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters.0)?;
    }

    let cmd = match table.as_str() {
        "listings" => Command::SelectListings {
            id: filters.ulid("id")?,
        },
        "bookings" => Command::SelectBookings {
            id: filters.ulid("id")?,
            listing_id: filters.ulid("listing_id")?,
            statuses: filters.statuses()?,
        },
        "reviews" => {
            let id = filters.ulid("id")?;
            let listing_id = filters.ulid("listing_id")?;
            if id.is_none() && listing_id.is_none() {
                return Err(SqlError::MissingFilter("listing_id"));
            }
            Command::SelectReviews { id, listing_id }
        }
        "quote" => Command::SelectQuote {
            listing_id: filters
                .ulid("listing_id")?
                .ok_or(SqlError::MissingFilter("listing_id"))?,
            start: filters
                .date("start_date")?
                .ok_or(SqlError::MissingFilter("start_date"))?,
            end: filters
                .date("end_date")?
                .ok_or(SqlError::MissingFilter("end_date"))?,
            booking_id: filters.ulid("booking_id")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

enum Filter<'a> {
    Eq(&'a Expr),
    In(&'a [Expr]),
}

/// Conjunctive `col = value` / `col IN (...)` terms of a WHERE clause.
#[derive(Default)]
struct Filters<'a>(Vec<(String, Filter<'a>)>);

impl<'a> Filters<'a> {
    fn take(&mut self, column: &str) -> Option<Filter<'a>> {
        let pos = self.0.iter().position(|(name, _)| name == column)?;
        Some(self.0.remove(pos).1)
    }

    fn ulid(&mut self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        match self.take(column) {
            None => Ok(None),
            Some(Filter::Eq(e)) => parse_ulid(column, e).map(Some),
            Some(Filter::In(_)) => Err(SqlError::Unsupported(format!("IN on {column}"))),
        }
    }

    fn date(&mut self, column: &'static str) -> Result<Option<NaiveDate>, SqlError> {
        match self.take(column) {
            None => Ok(None),
            Some(Filter::Eq(e)) => parse_date(column, e).map(Some),
            Some(Filter::In(_)) => Err(SqlError::Unsupported(format!("IN on {column}"))),
        }
    }

    fn statuses(&mut self) -> Result<Vec<BookingStatus>, SqlError> {
        match self.take("status") {
            None => Ok(Vec::new()),
            Some(Filter::Eq(e)) => Ok(vec![parse_status("status", e)?]),
            Some(Filter::In(list)) => list.iter().map(|e| parse_status("status", e)).collect(),
        }
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.0.into_iter().next() {
            Some((name, _)) => Err(SqlError::Unsupported(format!("filter on {name}"))),
            None => Ok(()),
        }
    }
}

fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, Filter<'a>)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, Filter::Eq(&**right)));
            Ok(())
        }
        Expr::InList {
            expr: left,
            list,
            negated: false,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            if list.len() > MAX_IN_CLAUSE_VALUES {
                return Err(SqlError::Unsupported(format!(
                    "IN list longer than {MAX_IN_CLAUSE_VALUES}"
                )));
            }
            out.push((col, Filter::In(list.as_slice())));
            Ok(())
        }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Filters::default();
    collect_filters(sel, &mut filters.0)?;
    let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;
    filters.finish()?;
    Ok(id)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Text of a literal (`'...'`, number, `-number`, `'...'::type`); `None` for NULL.
fn literal_text(column: &'static str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            other => Err(SqlError::InvalidValue(column, format!("unexpected literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal_text(column, expr)?.map(|s| format!("-{s}"))),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal_text(column, expr),
        other => Err(SqlError::InvalidValue(column, format!("expected literal, got {other}"))),
    }
}

fn required_text(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    literal_text(column, expr)?.ok_or(SqlError::InvalidValue(column, "must not be NULL".into()))
}

fn parse_text(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    required_text(column, expr)
}

fn parse_ulid(column: &'static str, expr: &Expr) -> Result<Ulid, SqlError> {
    let s = required_text(column, expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(column, format!("bad ULID: {e}")))
}

fn parse_date(column: &'static str, expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = required_text(column, expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(column, format!("bad date {s:?}: {e}")))
}

fn parse_money(column: &'static str, expr: &Expr) -> Result<Money, SqlError> {
    let s = required_text(column, expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(column, format!("bad amount {s:?}: {e}")))
}

fn parse_i64(column: &'static str, expr: &Expr) -> Result<i64, SqlError> {
    let s = required_text(column, expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(column, format!("bad integer {s:?}: {e}")))
}

fn parse_status(column: &'static str, expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = required_text(column, expr)?;
    s.parse().map_err(|e| SqlError::InvalidValue(column, e))
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("row {0}: {1}")]
    InRow(usize, Box<SqlError>),
}

impl SqlError {
    fn in_row(self, row: usize) -> SqlError {
        SqlError::InRow(row, Box::new(self))
    }

    /// Bad literal values, as opposed to statements we cannot parse.
    pub fn is_invalid_value(&self) -> bool {
        match self {
            SqlError::InvalidValue(..) => true,
            SqlError::InRow(_, inner) => inner.is_invalid_value(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const BID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn insert_listing_named_columns() {
        let sql = format!(
            "INSERT INTO listings (id, name, description, location, price_per_night) \
             VALUES ('{LID}', 'Loft', 'Sunny', 'Lisbon', 120.50)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertListing { id, listing } => {
                assert_eq!(id.to_string(), LID);
                assert_eq!(listing.name, "Loft");
                assert_eq!(listing.location, "Lisbon");
                assert_eq!(listing.price_per_night.to_string(), "120.50");
            }
            other => panic!("expected InsertListing, got {other:?}"),
        }
    }

    #[test]
    fn insert_listing_without_id_generates_one() {
        let sql = "INSERT INTO listings (name, location, description, price_per_night) \
                   VALUES ('Cabin', 'Tahoe', 'Woods', '99.99')";
        match parse_sql(sql).unwrap() {
            Command::InsertListing { listing, .. } => {
                assert_eq!(listing.location, "Tahoe");
                assert_eq!(listing.description, "Woods");
                assert_eq!(listing.price_per_night.to_string(), "99.99");
            }
            other => panic!("expected InsertListing, got {other:?}"),
        }
    }

    #[test]
    fn insert_listing_positional() {
        let sql = "INSERT INTO listings VALUES ('Cabin', 'Woods', 'Tahoe', 80)";
        match parse_sql(sql).unwrap() {
            Command::InsertListing { listing, .. } => {
                assert_eq!(listing.name, "Cabin");
                assert_eq!(listing.price_per_night.to_string(), "80.00");
            }
            other => panic!("expected InsertListing, got {other:?}"),
        }
    }

    #[test]
    fn insert_listing_missing_price() {
        let sql = "INSERT INTO listings (name, description, location) VALUES ('a', 'b', 'c')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn("price_per_night"))
        ));
    }

    #[test]
    fn insert_listing_unknown_column() {
        let sql = "INSERT INTO listings (name, description, location, price_per_night, stars) \
                   VALUES ('a', 'b', 'c', 1, 5)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::UnknownColumn("listings", _))
        ));
    }

    #[test]
    fn insert_booking_with_dates() {
        let sql = format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{BID}', '{LID}', '2025-06-01', '2025-06-04')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => {
                assert_eq!(b.id.to_string(), BID);
                assert_eq!(b.listing_id.to_string(), LID);
                assert_eq!(b.start_date, d("2025-06-01"));
                assert_eq!(b.end_date, d("2025-06-04"));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn insert_booking_ignores_total_price() {
        let sql = format!(
            "INSERT INTO bookings (listing_id, start_date, end_date, total_price) \
             VALUES ('{LID}', '2025-06-01', '2025-06-04', 1.00)"
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertBooking(_)));
    }

    #[test]
    fn insert_booking_bad_date() {
        let sql = format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) \
             VALUES ('{LID}', '2025-02-30', '2025-03-04')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.is_invalid_value());
    }

    #[test]
    fn insert_multiple_bookings_is_batch() {
        let sql = format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) VALUES \
             ('{LID}', '2025-06-01', '2025-06-04'), ('{LID}', '2025-06-04', '2025-06-06')"
        );
        match parse_sql(&sql).unwrap() {
            Command::BatchInsertBookings { bookings } => {
                assert_eq!(bookings.len(), 2);
                assert_eq!(bookings[1].start_date, d("2025-06-04"));
                assert_ne!(bookings[0].id, bookings[1].id);
            }
            other => panic!("expected BatchInsertBookings, got {other:?}"),
        }
    }

    #[test]
    fn batch_error_names_row() {
        let sql = format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) VALUES \
             ('{LID}', '2025-06-01', '2025-06-04'), ('{LID}', 'soon', '2025-06-06')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::InRow(1, _)));
        assert!(err.is_invalid_value());
    }

    #[test]
    fn insert_review() {
        let sql = format!(
            "INSERT INTO reviews (listing_id, rating, comment) VALUES ('{LID}', 4, 'Cozy')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReview {
                rating, comment, ..
            } => {
                assert_eq!(rating, 4);
                assert_eq!(comment, "Cozy");
            }
            other => panic!("expected InsertReview, got {other:?}"),
        }
    }

    #[test]
    fn update_listing_partial() {
        let sql = format!("UPDATE listings SET price_per_night = 150 WHERE id = '{LID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateListing { id, patch } => {
                assert_eq!(id.to_string(), LID);
                assert_eq!(patch.price_per_night.map(|p| p.to_string()).as_deref(), Some("150.00"));
                assert_eq!(patch.name, None);
            }
            other => panic!("expected UpdateListing, got {other:?}"),
        }
    }

    #[test]
    fn update_booking_dates_ignores_total_price() {
        let sql = format!(
            "UPDATE bookings SET end_date = '2025-06-08', total_price = 5 WHERE id = '{BID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { patch, .. } => {
                assert_eq!(patch.end_date, Some(d("2025-06-08")));
                assert_eq!(patch.start_date, None);
                assert_eq!(patch.listing_id, None);
            }
            other => panic!("expected UpdateBooking, got {other:?}"),
        }
    }

    #[test]
    fn update_booking_status() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{BID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetBookingStatus {
                id: Ulid::from_string(BID).unwrap(),
                status: BookingStatus::Confirmed,
            }
        );
    }

    #[test]
    fn update_booking_status_with_dates_rejected() {
        let sql = format!(
            "UPDATE bookings SET status = 'canceled', end_date = '2025-06-08' WHERE id = '{BID}'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_without_id_rejected() {
        let sql = "UPDATE listings SET name = 'x'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn delete_each_table() {
        for (table, check) in [
            ("listings", "DeleteListing"),
            ("bookings", "DeleteBooking"),
            ("reviews", "DeleteReview"),
        ] {
            let cmd = parse_sql(&format!("DELETE FROM {table} WHERE id = '{LID}'")).unwrap();
            assert!(format!("{cmd:?}").starts_with(check), "{cmd:?}");
        }
    }

    #[test]
    fn select_listings() {
        assert_eq!(
            parse_sql("SELECT * FROM listings").unwrap(),
            Command::SelectListings { id: None }
        );
        let cmd = parse_sql(&format!("SELECT * FROM listings WHERE id = '{LID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectListings { id: Some(_) }));
    }

    #[test]
    fn select_bookings_by_listing_and_status_list() {
        let sql = format!(
            "SELECT * FROM bookings WHERE listing_id = '{LID}' AND status IN ('pending', 'confirmed')"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings {
                id,
                listing_id,
                statuses,
            } => {
                assert_eq!(id, None);
                assert_eq!(listing_id.map(|l| l.to_string()).as_deref(), Some(LID));
                assert_eq!(statuses, BookingStatus::ACTIVE.to_vec());
            }
            other => panic!("expected SelectBookings, got {other:?}"),
        }
    }

    #[test]
    fn select_bookings_unknown_status() {
        let sql = "SELECT * FROM bookings WHERE status = 'archived'";
        assert!(parse_sql(sql).unwrap_err().is_invalid_value());
    }

    #[test]
    fn select_quote() {
        let sql = format!(
            "SELECT * FROM quote WHERE listing_id = '{LID}' AND start_date = '2025-06-01' \
             AND end_date = '2025-06-04' AND booking_id = '{BID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectQuote {
                start,
                end,
                booking_id,
                ..
            } => {
                assert_eq!(start, d("2025-06-01"));
                assert_eq!(end, d("2025-06-04"));
                assert!(booking_id.is_some());
            }
            other => panic!("expected SelectQuote, got {other:?}"),
        }
    }

    #[test]
    fn select_quote_requires_dates() {
        let sql = format!("SELECT * FROM quote WHERE listing_id = '{LID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("start_date"))
        ));
    }

    #[test]
    fn select_reviews_requires_listing() {
        assert!(matches!(
            parse_sql("SELECT * FROM reviews"),
            Err(SqlError::MissingFilter("listing_id"))
        ));
    }

    #[test]
    fn unsupported_filters_rejected() {
        let sql = format!("SELECT * FROM listings WHERE id = '{LID}' OR name = 'x'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = format!("SELECT * FROM listings WHERE location = '{LID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn unknown_table_and_empty() {
        assert!(matches!(
            parse_sql("SELECT * FROM guests"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC"), Err(SqlError::Parse(_))));
    }
}
