use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RentdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct RentdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RentdQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertListing { id, listing } => {
                engine.create_listing(id, listing).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateListing { id, patch } => {
                engine.update_listing(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteListing { id } => {
                engine.delete_listing(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectListings { id } => {
                let listings = match id {
                    Some(id) => match engine.get_listing(id).await {
                        Ok(l) => vec![l],
                        Err(EngineError::ListingNotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_listings().await,
                };
                let schema = Arc::new(listings_schema());
                let rows = listings.iter().map(|l| listing_row(&schema, l)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertBooking(b) => {
                engine
                    .create_booking_with_id(b.id, b.listing_id, b.start_date, b.end_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertBookings { bookings } => {
                let created = engine.create_bookings(bookings).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("INSERT").with_rows(created.len()),
                )])
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetBookingStatus { id, status } => {
                engine.set_status(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings {
                id,
                listing_id,
                statuses,
            } => {
                let bookings = match (id, listing_id) {
                    (Some(id), _) => match engine.get_booking(id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::BookingNotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    (None, Some(lid)) => engine
                        .bookings_for_listing(lid, &statuses)
                        .await
                        .map_err(engine_err)?,
                    (None, None) => engine.list_bookings().await,
                };
                let schema = Arc::new(bookings_schema());
                let rows = bookings
                    .iter()
                    .filter(|b| listing_id.is_none_or(|lid| b.listing_id == lid))
                    .filter(|b| statuses.is_empty() || statuses.contains(&b.status))
                    .map(|b| booking_row(&schema, b))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectQuote {
                listing_id,
                start,
                end,
                booking_id,
            } => {
                let quote = engine
                    .propose_booking(listing_id, start, end, booking_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(quote_schema());
                let rows = vec![quote_row(&schema, &quote)];
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertReview {
                id,
                listing_id,
                rating,
                comment,
            } => {
                engine
                    .add_review(id, listing_id, rating, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteReview { id } => {
                engine.delete_review(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReviews { id, listing_id } => {
                let reviews = match (id, listing_id) {
                    (Some(id), _) => match engine.get_review(id).await {
                        Ok(r) => vec![r],
                        Err(EngineError::ReviewNotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    (None, Some(lid)) => engine.get_reviews(lid).await.map_err(engine_err)?,
                    (None, None) => Vec::new(),
                };
                let schema = Arc::new(reviews_schema());
                let rows = reviews
                    .iter()
                    .filter(|r| listing_id.is_none_or(|lid| r.listing_id == lid))
                    .map(|r| review_row(&schema, r))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn listings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("description", Type::TEXT),
        field("location", Type::VARCHAR),
        field("price_per_night", Type::NUMERIC),
        field("bookings_count", Type::INT8),
        field("created_at", Type::TIMESTAMPTZ),
        field("updated_at", Type::TIMESTAMPTZ),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("start_date", Type::DATE),
        field("end_date", Type::DATE),
        field("total_price", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("created_at", Type::TIMESTAMPTZ),
    ]
}

fn reviews_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("rating", Type::INT8),
        field("comment", Type::TEXT),
        field("created_at", Type::TIMESTAMPTZ),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("listing_id", Type::VARCHAR),
        field("start_date", Type::DATE),
        field("end_date", Type::DATE),
        field("nights", Type::INT8),
        field("price_per_night", Type::NUMERIC),
        field("total_price", Type::NUMERIC),
    ]
}

/// Result columns for a statement, judged from its text (parameters may not
/// be bound yet).
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return Vec::new();
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("listings") => listings_schema(),
        Some("bookings") => bookings_schema(),
        Some("reviews") => reviews_schema(),
        Some("quote") => quote_schema(),
        _ => Vec::new(),
    }
}

fn timestamp(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn listing_row(schema: &Arc<Vec<FieldInfo>>, l: &ListingInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&l.id.to_string())?;
    encoder.encode_field(&l.name)?;
    encoder.encode_field(&l.description)?;
    encoder.encode_field(&l.location)?;
    encoder.encode_field(&l.price_per_night.to_string())?;
    encoder.encode_field(&(l.bookings_count as i64))?;
    encoder.encode_field(&timestamp(l.created_at))?;
    encoder.encode_field(&timestamp(l.updated_at))?;
    Ok(encoder.take_row())
}

fn booking_row(schema: &Arc<Vec<FieldInfo>>, b: &BookingInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.listing_id.to_string())?;
    encoder.encode_field(&b.stay.start.to_string())?;
    encoder.encode_field(&b.stay.end.to_string())?;
    encoder.encode_field(&b.total_price.to_string())?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&timestamp(b.created_at))?;
    Ok(encoder.take_row())
}

fn review_row(schema: &Arc<Vec<FieldInfo>>, r: &ReviewInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.listing_id.to_string())?;
    encoder.encode_field(&i64::from(r.rating))?;
    encoder.encode_field(&r.comment)?;
    encoder.encode_field(&timestamp(r.created_at))?;
    Ok(encoder.take_row())
}

fn quote_row(schema: &Arc<Vec<FieldInfo>>, q: &Quote) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&q.listing_id.to_string())?;
    encoder.encode_field(&q.stay.start.to_string())?;
    encoder.encode_field(&q.stay.end.to_string())?;
    encoder.encode_field(&q.nights)?;
    encoder.encode_field(&q.price_per_night.to_string())?;
    encoder.encode_field(&q.total_price.to_string())?;
    Ok(encoder.take_row())
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline text-format parameters as quoted literals in one left-to-right
/// pass over the statement. Inlined values are never rescanned, so a value
/// containing `$1` stays literal text. Placeholders without a bound
/// parameter are left as written.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let Some(param) = sql[start + 1..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx))
        else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(value) => {
                let text = String::from_utf8_lossy(value.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = i;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(RentdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RentdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RentdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ListingNotFound(_)
        | EngineError::BookingNotFound(_)
        | EngineError::ReviewNotFound(_) => "P0002",
        EngineError::InvalidRange { .. }
        | EngineError::InvalidRating(_)
        | EngineError::InvalidPrice(_)
        | EngineError::InvalidField { .. } => "22023",
        EngineError::DateConflict { .. } => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) => "58030",
    }
}

/// Message leads with the reason code so clients can branch on it.
fn engine_err(e: EngineError) -> PgWireError {
    let mut message = format!("{}: {e}", e.reason_code());
    if let Some(field) = e.field() {
        message.push_str(&format!(" (field: {field})"));
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_invalid_value() { "22P02" } else { "42601" };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_takes_highest() {
        assert_eq!(count_params("SELECT * FROM quote"), 0);
        assert_eq!(
            count_params("SELECT * FROM quote WHERE listing_id = $1 AND end_date = $3"),
            3
        );
        assert_eq!(count_params("UPDATE listings SET name = $10 WHERE id = $2"), 10);
    }

    #[test]
    fn substitute_quotes_and_escapes() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"O'Hara"[..]), None, Some(&b"x"[..])];
        let sql = substitute_params("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('O''Hara', NULL, 'x')");
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_params() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        let sql = substitute_params("$1 $10", &params);
        assert_eq!(sql, "'1' '10'");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let params: Vec<Option<&[u8]>> =
            vec![Some(&b"Loft"[..]), Some(&b"Only $1 cleaning fee"[..])];
        let sql = substitute_params(
            "INSERT INTO listings (name, description, location, price_per_night) \
             VALUES ($1, $2, 'x', 10)",
            &params,
        );
        assert!(sql.ends_with("VALUES ('Loft', 'Only $1 cleaning fee', 'x', 10)"));
    }

    #[test]
    fn unbound_placeholders_are_left_alone() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"a"[..])];
        assert_eq!(substitute_params("$1, $2, $0, $", &params), "'a', $2, $0, $");
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(schema_for("SELECT * FROM listings").len(), 8);
        assert_eq!(schema_for("select * from quote where listing_id = $1").len(), 6);
        assert_eq!(schema_for("SELECT * FROM bookings;").len(), 7);
        assert!(schema_for("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let conflict = EngineError::DateConflict {
            conflicting: ulid::Ulid::new(),
            stay_start: chrono::NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            stay_end: chrono::NaiveDate::from_ymd_opt(2025, 6, 5).unwrap(),
        };
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::BookingNotFound(ulid::Ulid::new())), "P0002");
        assert_eq!(sqlstate(&EngineError::InvalidRating(9)), "22023");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                from: BookingStatus::Canceled,
                to: BookingStatus::Confirmed,
            }),
            "55000"
        );
    }

    #[test]
    fn timestamps_render_rfc3339() {
        assert_eq!(timestamp(0), "1970-01-01T00:00:00.000Z");
    }
}
