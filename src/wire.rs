use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RoomBookAuthSource;
use crate::availability::AvailabilityService;
use crate::calendar::SlotCalendar;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct RoomBookHandler {
    engine: Arc<Engine>,
    availability: Arc<AvailabilityService>,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>, availability: Arc<AvailabilityService>) -> Self {
        Self {
            engine,
            availability,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// Execute one command and record RED metrics for it.
    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterResource { id, name } => {
                engine.register_resource(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RegisterAccount { id } => {
                engine.register_account(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RegisterGroup { id } => {
                engine.register_group(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CreateRequest { draft } => {
                let request = engine.create_request(draft).await.map_err(engine_err)?;
                ack_response(&request)
            }
            Command::UpdateStatus { id, change } => {
                let request = engine.update_status(id, change).await.map_err(engine_err)?;
                ack_response(&request)
            }
            Command::SelectBlockedSlots {
                resource_id,
                reference,
            } => {
                let week = self
                    .availability
                    .blocked_slots(resource_id, reference)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(blocked_slots_schema());
                let calendar = self.availability.calendar();
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<_>> = week
                    .slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&format_instant(calendar, slot)?)?;
                        encoder.encode_field(&slot)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRequests {
                id,
                filter,
                window_start,
                window_end,
            } => {
                let requests = self
                    .select_requests(id, &filter, window_start, window_end)
                    .await
                    .map_err(engine_err)?;
                let calendar = self.availability.calendar();
                let schema = Arc::new(requests_schema());
                let rows: Vec<PgWireResult<_>> = requests
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.owner_id.to_string())?;
                        encoder.encode_field(&r.group_id.to_string())?;
                        encoder.encode_field(&r.approver_id.map(|a| a.to_string()))?;
                        encoder.encode_field(&r.secondary_approver_id.map(|a| a.to_string()))?;
                        encoder.encode_field(&format_instant(calendar, r.span.start)?)?;
                        encoder.encode_field(&format_instant(calendar, r.span.end)?)?;
                        encoder.encode_field(&r.span.start)?;
                        encoder.encode_field(&r.span.end)?;
                        encoder.encode_field(&r.title)?;
                        encoder.encode_field(&r.description)?;
                        encoder.encode_field(&r.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&(r.request_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }

    /// By id, by overlap window on one resource, or by filter scan.
    async fn select_requests(
        &self,
        id: Option<ulid::Ulid>,
        filter: &RequestFilter,
        window_start: Option<Ms>,
        window_end: Option<Ms>,
    ) -> Result<Vec<BookingRequest>, EngineError> {
        let in_window = |r: &BookingRequest| {
            window_start.is_none_or(|ws| r.span.end > ws) && window_end.is_none_or(|we| r.span.start < we)
        };

        if let Some(id) = id {
            let request = self.engine.get_request(id).await?;
            return Ok(if filter.matches(&request) && in_window(&request) {
                vec![request]
            } else {
                vec![]
            });
        }

        if let (Some(resource_id), Some(ws), Some(we)) = (filter.resource_id, window_start, window_end) {
            let statuses = filter
                .statuses
                .clone()
                .unwrap_or_else(|| RequestStatus::ALL.to_vec());
            let mut found = self
                .engine
                .find_overlapping(resource_id, ws, we, &statuses)
                .await?;
            found.retain(|r| filter.matches(r));
            return Ok(found);
        }

        let mut found = self.engine.list_requests(filter).await;
        found.retain(in_window);
        Ok(found)
    }
}

fn ack_response(request: &BookingRequest) -> PgWireResult<Response> {
    let schema = Arc::new(ack_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&request.id.to_string())?;
    encoder.encode_field(&request.status.as_str())?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn format_instant(calendar: &SlotCalendar, t: Ms) -> PgWireResult<String> {
    calendar.format(t).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22008".into(),
            e.to_string(),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn blocked_slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id"),
        text_field("slot_start"),
        int8_field("slot_start_ms"),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("status"),
        text_field("resource_id"),
        text_field("owner_id"),
        text_field("group_id"),
        text_field("approver_id"),
        text_field("secondary_approver_id"),
        text_field("start"),
        text_field("end"),
        int8_field("start_ms"),
        int8_field("end_ms"),
        text_field("title"),
        text_field("description"),
        text_field("reason"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int8_field("request_count"),
    ]
}

fn ack_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("status")]
}

/// Row shape of a statement, decided from its text alone so that
/// Describe works before parameters are bound.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let normalized = stmt.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.starts_with("INSERT INTO REQUESTS") || normalized.starts_with("INSERT INTO STATUS_CHANGES") {
        ack_schema()
    } else if !normalized.starts_with("SELECT") {
        vec![]
    } else if normalized.contains("FROM BLOCKED_SLOTS") {
        blocked_slots_schema()
    } else if normalized.contains("FROM REQUESTS") {
        requests_schema()
    } else if normalized.contains("FROM RESOURCES") {
        resources_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, portal.parameters.as_slice());
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N) in statement order.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = sql[i + 1..]
                    .bytes()
                    .take_while(u8::is_ascii_digit)
                    .count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder index in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound text-format parameters into the statement in one pass, so
/// a bound value is never itself scanned for placeholders.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(engine: Arc<Engine>, availability: Arc<AvailabilityService>, password: String) -> Self {
        let auth_source = RoomBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomBookHandler::new(engine, availability)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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
    availability: Arc<AvailabilityService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = RoomBookFactory::new(engine, availability, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation { .. } => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Conflict(_) => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Unavailable(_) => "58030",
    }
}

/// Validation errors name the offending column in DETAIL and the rule it
/// broke in HINT.
fn error_info(e: &EngineError) -> ErrorInfo {
    let mut info = ErrorInfo::new("ERROR".into(), sqlstate(e).into(), e.to_string());
    if let EngineError::Validation { field, reason } = e {
        info.detail = Some((*field).to_string());
        info.hint = Some((*reason).to_string());
    }
    info
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(error_info(&e)))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
