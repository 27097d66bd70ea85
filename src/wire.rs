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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RoomkeepAuthSource;
use crate::engine::{Engine, EngineError, OfficeClock};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::office::{OfficeError, OfficeManager};
use crate::sql::{self, Command, RowShape, SqlError};

pub struct RoomkeepHandler {
    offices: Arc<OfficeManager>,
    query_parser: Arc<RoomkeepQueryParser>,
}

impl RoomkeepHandler {
    pub fn new(offices: Arc<OfficeManager>) -> Self {
        Self {
            offices,
            query_parser: Arc::new(RoomkeepQueryParser),
        }
    }

    /// Office engine from the database name, caller from the login user.
    async fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Identity)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))?;

        let engine = self.offices.get_or_open(&db).await.map_err(office_err)?;
        let caller = engine.identify(&user).await.map_err(engine_err)?;
        Ok((engine, caller))
    }

    async fn run(
        &self,
        engine: &Engine,
        caller: &Identity,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, caller, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        tracing::debug!(office = %engine.office(), user = %caller.user, command = label, status, "query");
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: &Identity,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let clock = engine.clock();
        let shape = cmd.row_shape();
        let schema = Arc::new(schema_for(shape, format));

        let rows: Vec<PgWireResult<DataRow>> = match cmd {
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await.map_err(engine_err)?;
                rooms.iter().map(|r| encode_room(&schema, clock, r)).collect()
            }
            Command::InsertRoom(request) => {
                let room = engine.create_room(caller, request).await.map_err(engine_err)?;
                vec![encode_room(&schema, clock, &room)]
            }
            Command::SelectReservations { room_id, id: Some(id) } => {
                let reservation = engine.get_reservation(caller, id).await.map_err(engine_err)?;
                if room_id.is_some_and(|room| room != reservation.room_id) {
                    vec![]
                } else {
                    vec![encode_reservation(&schema, clock, &reservation)]
                }
            }
            Command::SelectReservations { room_id, id: None } => {
                let reservations = engine
                    .list_reservations(caller, room_id)
                    .await
                    .map_err(engine_err)?;
                reservations
                    .iter()
                    .map(|r| encode_reservation(&schema, clock, r))
                    .collect()
            }
            Command::InsertReservation(request) => {
                let reservation = engine
                    .create_reservation(caller, request)
                    .await
                    .map_err(engine_err)?;
                vec![encode_reservation(&schema, clock, &reservation)]
            }
            Command::UpdateReservationStatus { id, status } => {
                let reservation = engine
                    .update_status(caller, id, &status)
                    .await
                    .map_err(engine_err)?;
                vec![encode_reservation(&schema, clock, &reservation)]
            }
            Command::SelectAvailability { room_id, date } => {
                let date = engine.parse_date(&date).map_err(engine_err)?;
                let slots = engine
                    .compute_availability(room_id, date)
                    .await
                    .map_err(engine_err)?;
                slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&clock.to_rfc3339(slot.span.start))?;
                        encoder.encode_field(&clock.to_rfc3339(slot.span.end))?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect()
            }
            Command::SelectNotifications => {
                let notifications = engine.list_notifications(caller).await.map_err(engine_err)?;
                notifications
                    .iter()
                    .map(|n| encode_notification(&schema, clock, n))
                    .collect()
            }
            Command::MarkNotificationRead { id } => {
                let notification = engine
                    .mark_notification_read(caller, id)
                    .await
                    .map_err(engine_err)?;
                vec![encode_notification(&schema, clock, &notification)]
            }
        };

        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

// ── Row layouts ──────────────────────────────────────────────────

fn columns(names: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    names
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn schema_for(shape: RowShape, format: &Format) -> Vec<FieldInfo> {
    match shape {
        RowShape::Rooms => columns(
            &[
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("office", Type::VARCHAR),
                ("capacity", Type::INT8),
                ("amenities", Type::VARCHAR),
                ("is_active", Type::BOOL),
                ("created_at", Type::VARCHAR),
            ],
            format,
        ),
        RowShape::Reservations => columns(
            &[
                ("id", Type::VARCHAR),
                ("room_id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("office", Type::VARCHAR),
                ("title", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("attendees", Type::INT8),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("created_at", Type::VARCHAR),
                ("updated_at", Type::VARCHAR),
            ],
            format,
        ),
        RowShape::Availability => columns(
            &[
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
                ("available", Type::BOOL),
            ],
            format,
        ),
        RowShape::Notifications => columns(
            &[
                ("id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("message", Type::VARCHAR),
                ("kind", Type::VARCHAR),
                ("is_read", Type::BOOL),
                ("created_at", Type::VARCHAR),
            ],
            format,
        ),
    }
}

fn encode_room(schema: &Arc<Vec<FieldInfo>>, clock: &OfficeClock, room: &Room) -> PgWireResult<DataRow> {
    let amenities = serde_json::to_string(&room.amenities)
        .map_err(|e| user_error("XX000", format!("amenities: {e}")))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&room.id.to_string())?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&room.office)?;
    encoder.encode_field(&i64::from(room.capacity))?;
    encoder.encode_field(&amenities)?;
    encoder.encode_field(&room.is_active)?;
    encoder.encode_field(&clock.to_rfc3339(room.created_at))?;
    Ok(encoder.take_row())
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    clock: &OfficeClock,
    r: &Reservation,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&r.user)?;
    encoder.encode_field(&r.office)?;
    encoder.encode_field(&r.title)?;
    encoder.encode_field(&r.description)?;
    encoder.encode_field(&i64::from(r.attendees))?;
    encoder.encode_field(&clock.to_rfc3339(r.span.start))?;
    encoder.encode_field(&clock.to_rfc3339(r.span.end))?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&clock.to_rfc3339(r.created_at))?;
    encoder.encode_field(&clock.to_rfc3339(r.updated_at))?;
    Ok(encoder.take_row())
}

fn encode_notification(
    schema: &Arc<Vec<FieldInfo>>,
    clock: &OfficeClock,
    n: &Notification,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&n.id.to_string())?;
    encoder.encode_field(&n.user)?;
    encoder.encode_field(&n.message)?;
    encoder.encode_field(&n.kind.as_str())?;
    encoder.encode_field(&n.is_read)?;
    encoder.encode_field(&clock.to_rfc3339(n.created_at))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for RoomkeepHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let (engine, caller) = self.resolve(client).await?;
        let response = self.run(&engine, &caller, cmd, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomkeepQueryParser;

#[async_trait]
impl QueryParser for RoomkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        result_schema(stmt, format)
    }
}

fn result_schema(stmt: &str, format: &Format) -> PgWireResult<Vec<FieldInfo>> {
    Ok(sql::describe(stmt)
        .map_err(sql_err)?
        .map(|shape| schema_for(shape, format))
        .unwrap_or_default())
}

#[async_trait]
impl ExtendedQueryHandler for RoomkeepHandler {
    type Statement = String;
    type QueryParser = RoomkeepQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let (engine, caller) = self.resolve(client).await?;
        self.run(&engine, &caller, cmd, &portal.result_column_format).await
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
        let fields = result_schema(&target.statement, &Format::UnifiedText)?;
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = result_schema(&target.statement.statement, &target.result_column_format)?;
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Count the highest $N parameter placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    placeholders(sql).map(|(_, n)| n).max().unwrap_or(0)
}

/// `($N byte range, N)` for every placeholder outside `'...'` literals.
fn placeholders(sql: &str) -> impl Iterator<Item = (std::ops::Range<usize>, usize)> + '_ {
    let bytes = sql.as_bytes();
    let mut in_literal = false;
    let mut i = 0;
    std::iter::from_fn(move || {
        while i < bytes.len() {
            let c = bytes[i];
            i += 1;
            if c == b'\'' {
                in_literal = !in_literal;
                continue;
            }
            if c != b'$' || in_literal {
                continue;
            }
            let start = i - 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                return Some((start..i, n));
            }
        }
        None
    })
}

/// Substitute bound parameter values (text format) for `$1, $2, ...`.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// One left-to-right pass over the statement, so bound values are never
/// rescanned. Placeholders without a bound value are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomkeepFactory {
    handler: Arc<RoomkeepHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomkeepFactory {
    pub fn new(offices: Arc<OfficeManager>, password: String) -> Self {
        Self {
            handler: Arc::new(RoomkeepHandler::new(offices)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RoomkeepAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomkeepFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    offices: Arc<OfficeManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomkeepFactory::new(offices, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Unknown(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn office_err(e: OfficeError) -> PgWireError {
    let code = match &e {
        OfficeError::InvalidName(_) | OfficeError::TooMany => "3D000",
        OfficeError::Io(_) | OfficeError::Engine(_) => "08006",
    };
    user_error(code, format!("office error: {e}"))
}
