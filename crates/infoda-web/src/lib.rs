//! Read-only JSON API over the loaded enrollment tables.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use infoda_core::{ProgramRow, SectionRow};
use infoda_load::store::{program_from_row, section_from_row};
use infoda_load::{validate_schema_name, DbConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "infoda-web";
pub const SERVICE_NAME: &str = "infoda-api";

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub pool: Option<PgPool>,
    pub schema: String,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// An unreachable database is not fatal: data routes answer 503 until restart.
    pub async fn connect_from_env() -> anyhow::Result<Self> {
        let db = DbConfig::from_env();
        validate_schema_name(&db.schema)?;
        let pool = match db.connect(5).await {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, host = %db.host, "database unavailable; data routes will answer 503");
                None
            }
        };
        Ok(Self::new(pool, db.schema))
    }

    fn pool(&self) -> Result<&PgPool, ApiError> {
        self.pool.as_ref().ok_or(ApiError::NoDatabase)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("route not found")]
    NotFound,
    #[error("invalid program id {0:?}")]
    InvalidProgramId(String),
    #[error("database not configured")]
    NoDatabase,
    #[error("query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidProgramId(_) => StatusCode::BAD_REQUEST,
            ApiError::NoDatabase => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Database(err) = &self {
            error!(error = %err, "query failed");
        }
        (
            self.status(),
            Json(json!({ "ok": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T> {
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    fn all(data: Vec<T>) -> Self {
        Self {
            total: data.len() as i64,
            limit: None,
            offset: None,
            data,
        }
    }

    fn page(total: i64, page: Page, data: Vec<T>) -> Self {
        Self {
            total,
            limit: Some(page.limit),
            offset: Some(page.offset),
            data,
        }
    }
}

/// One enrollment joined with its program, section and source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentView {
    pub student_id: String,
    pub student_name: String,
    pub program_id: i32,
    pub program_code: Option<i32>,
    pub program_name: String,
    pub section_id: i32,
    pub section_code: String,
    pub subject_name: String,
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramCount {
    pub program_name: String,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionCount {
    pub section_code: String,
    pub subject_name: String,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Unparseable values fall back to the defaults; the limit is clamped to `1..=200`.
    pub fn parse(limit: Option<&str>, offset: Option<&str>) -> Self {
        let number = |value: Option<&str>| value.and_then(|v| v.trim().parse::<i64>().ok());
        Self {
            limit: number(limit).unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: number(offset).unwrap_or(0).max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    StudentId,
    Section,
}

impl SortKey {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("student_id") => SortKey::StudentId,
            Some("section") => SortKey::Section,
            _ => SortKey::Name,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortKey::Name => "e.apellidos_nombres",
            SortKey::StudentId => "e.matricula",
            SortKey::Section => "s.codigo_seccion",
        }
    }
}

pub fn sort_direction(order: Option<&str>) -> &'static str {
    match order {
        Some(o) if o.trim().eq_ignore_ascii_case("desc") => "DESC",
        _ => "ASC",
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentsQuery {
    pub section: Option<String>,
    pub program: Option<String>,
    pub q: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsQuery {
    pub section: Option<String>,
    pub program: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub program: Option<String>,
    pub q: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn contains_pattern(value: &str) -> String {
    format!("%{value}%")
}

fn push_clause<'q, 'a>(
    qb: &'q mut QueryBuilder<'a, Postgres>,
    first: &mut bool,
) -> &'q mut QueryBuilder<'a, Postgres> {
    qb.push(if std::mem::take(first) { " WHERE " } else { " AND " })
}

/// Optional predicates over the joined enrollment rows. Text fields are expected
/// trimmed and non-empty.
#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub student_id: Option<String>,
    pub section: Option<String>,
    pub program_id: Option<i32>,
    /// Case-insensitive substring of the program name.
    pub program: Option<String>,
    /// Case-insensitive substring of the student name or id.
    pub q: Option<String>,
}

impl StudentFilter {
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        let mut first = true;
        if let Some(student_id) = &self.student_id {
            push_clause(qb, &mut first)
                .push("e.matricula = ")
                .push_bind(student_id.clone());
        }
        if let Some(section) = &self.section {
            push_clause(qb, &mut first)
                .push("s.codigo_seccion = ")
                .push_bind(section.clone());
        }
        if let Some(program_id) = self.program_id {
            push_clause(qb, &mut first)
                .push("e.id_carrera = ")
                .push_bind(program_id);
        }
        if let Some(program) = &self.program {
            push_clause(qb, &mut first)
                .push("c.nombre_carrera ILIKE ")
                .push_bind(contains_pattern(program));
        }
        if let Some(q) = &self.q {
            push_clause(qb, &mut first)
                .push("(e.apellidos_nombres ILIKE ")
                .push_bind(contains_pattern(q))
                .push(" OR e.matricula ILIKE ")
                .push_bind(contains_pattern(q))
                .push(")");
        }
    }
}

fn enrollment_from(schema: &str) -> String {
    format!(
        " FROM {schema}.estudiantes e \
         JOIN {schema}.carrera c ON c.id_carrera = e.id_carrera \
         JOIN {schema}.seccion s ON s.id_seccion = e.id_seccion \
         LEFT JOIN {schema}.archivo_origen a ON a.id_archivo = e.id_archivo"
    )
}

const ENROLLMENT_COLUMNS: &str = "SELECT e.matricula, e.apellidos_nombres, c.id_carrera, \
     c.codigo_carrera, c.nombre_carrera, s.id_seccion, s.codigo_seccion, \
     COALESCE(s.nombre_asignatura, '') AS nombre_asignatura, a.nombre_archivo";

fn enrollment_from_row(row: &PgRow) -> Result<EnrollmentView, sqlx::Error> {
    Ok(EnrollmentView {
        student_id: row.try_get("matricula")?,
        student_name: row.try_get("apellidos_nombres")?,
        program_id: row.try_get("id_carrera")?,
        program_code: row.try_get("codigo_carrera")?,
        program_name: row.try_get("nombre_carrera")?,
        section_id: row.try_get("id_seccion")?,
        section_code: row.try_get("codigo_seccion")?,
        subject_name: row.try_get("nombre_asignatura")?,
        source_file: row.try_get("nombre_archivo")?,
    })
}

async fn count_enrollments(
    pool: &PgPool,
    schema: &str,
    filter: &StudentFilter,
) -> Result<i64, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT COUNT(*) AS total{}",
        enrollment_from(schema)
    ));
    filter.push_where(&mut qb);
    qb.build().fetch_one(pool).await?.try_get("total")
}

async fn fetch_enrollments(
    pool: &PgPool,
    schema: &str,
    filter: &StudentFilter,
    order_by: &str,
    page: Option<Page>,
) -> Result<Vec<EnrollmentView>, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "{ENROLLMENT_COLUMNS}{}",
        enrollment_from(schema)
    ));
    filter.push_where(&mut qb);
    qb.push(" ORDER BY ").push(order_by);
    if let Some(page) = page {
        qb.push(" LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
    }
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(enrollment_from_row).collect()
}

async fn page_of_enrollments(
    state: &AppState,
    filter: StudentFilter,
    order_by: &str,
    page: Page,
) -> Result<ListResponse<EnrollmentView>, ApiError> {
    let pool = state.pool()?;
    let total = count_enrollments(pool, &state.schema, &filter).await?;
    let data = fetch_enrollments(pool, &state.schema, &filter, order_by, Some(page)).await?;
    Ok(ListResponse::page(total, page, data))
}

const BY_NAME: &str = "e.apellidos_nombres ASC, e.matricula ASC";

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/students", get(students_handler))
        .route("/students/by-id/{student_id}", get(student_by_id_handler))
        .route("/students/stats/by-program", get(stats_by_program_handler))
        .route("/students/stats/by-section", get(stats_by_section_handler))
        .route("/programs", get(programs_handler))
        .route("/programs/{id}/students", get(program_students_handler))
        .route("/sections", get(sections_handler))
        .route("/sections/{code}/students", get(section_students_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("INFODA_API_PORT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(3000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding query api to port {port}"))?;
    info!(port, database = state.pool.is_some(), "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let state = AppState::connect_from_env().await?;
    serve(state, port.unwrap_or_else(port_from_env)).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": SERVICE_NAME }))
}

async fn not_found_handler() -> ApiError {
    ApiError::NotFound
}

async fn students_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StudentsQuery>,
) -> Result<Json<ListResponse<EnrollmentView>>, ApiError> {
    let page = Page::parse(query.limit.as_deref(), query.offset.as_deref());
    let order_by = format!(
        "{} {}, e.matricula ASC, s.codigo_seccion ASC",
        SortKey::parse(query.sort.as_deref()).column(),
        sort_direction(query.order.as_deref())
    );
    let filter = StudentFilter {
        section: non_empty(query.section),
        program: non_empty(query.program),
        q: non_empty(query.q),
        ..StudentFilter::default()
    };
    Ok(Json(page_of_enrollments(&state, filter, &order_by, page).await?))
}

async fn student_by_id_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(student_id): AxumPath<String>,
) -> Result<Json<ListResponse<EnrollmentView>>, ApiError> {
    let pool = state.pool()?;
    let filter = StudentFilter {
        student_id: Some(student_id.trim().to_string()),
        ..StudentFilter::default()
    };
    let data = fetch_enrollments(
        pool,
        &state.schema,
        &filter,
        "s.codigo_seccion ASC, e.apellidos_nombres ASC",
        None,
    )
    .await?;
    Ok(Json(ListResponse::all(data)))
}

async fn stats_by_program_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ListResponse<ProgramCount>>, ApiError> {
    let pool = state.pool()?;
    let filter = StudentFilter {
        section: non_empty(query.section),
        q: non_empty(query.q),
        ..StudentFilter::default()
    };
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT c.nombre_carrera, COUNT(*) AS total{}",
        enrollment_from(&state.schema)
    ));
    filter.push_where(&mut qb);
    qb.push(" GROUP BY c.nombre_carrera ORDER BY total DESC, c.nombre_carrera ASC");

    let rows = qb.build().fetch_all(pool).await?;
    let data = rows
        .iter()
        .map(|row| {
            Ok(ProgramCount {
                program_name: row.try_get("nombre_carrera")?,
                total: row.try_get("total")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;
    Ok(Json(ListResponse::all(data)))
}

async fn stats_by_section_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ListResponse<SectionCount>>, ApiError> {
    let pool = state.pool()?;
    let filter = StudentFilter {
        program: non_empty(query.program),
        q: non_empty(query.q),
        ..StudentFilter::default()
    };
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT s.codigo_seccion, COALESCE(s.nombre_asignatura, '') AS nombre_asignatura, \
         COUNT(*) AS total{}",
        enrollment_from(&state.schema)
    ));
    filter.push_where(&mut qb);
    qb.push(" GROUP BY s.codigo_seccion, s.nombre_asignatura ORDER BY s.codigo_seccion ASC");

    let rows = qb.build().fetch_all(pool).await?;
    let data = rows
        .iter()
        .map(|row| {
            Ok(SectionCount {
                section_code: row.try_get("codigo_seccion")?,
                subject_name: row.try_get("nombre_asignatura")?,
                total: row.try_get("total")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;
    Ok(Json(ListResponse::all(data)))
}

async fn programs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ListResponse<ProgramRow>>, ApiError> {
    let pool = state.pool()?;
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT id_carrera, codigo_carrera, nombre_carrera FROM {}.carrera",
        state.schema
    ));
    if let Some(q) = non_empty(query.q) {
        qb.push(" WHERE nombre_carrera ILIKE ")
            .push_bind(contains_pattern(&q));
    }
    qb.push(" ORDER BY nombre_carrera");

    let rows = qb.build().fetch_all(pool).await?;
    let data = rows
        .iter()
        .map(program_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ListResponse::all(data)))
}

async fn program_students_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListResponse<EnrollmentView>>, ApiError> {
    let program_id = id
        .trim()
        .parse::<i32>()
        .map_err(|_| ApiError::InvalidProgramId(id.clone()))?;
    let page = Page::parse(query.limit.as_deref(), query.offset.as_deref());
    let filter = StudentFilter {
        program_id: Some(program_id),
        ..StudentFilter::default()
    };
    Ok(Json(page_of_enrollments(&state, filter, BY_NAME, page).await?))
}

async fn sections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ListResponse<SectionRow>>, ApiError> {
    let pool = state.pool()?;
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT id_seccion, codigo_seccion, nombre_asignatura FROM {}.seccion",
        state.schema
    ));
    if let Some(q) = non_empty(query.q) {
        qb.push(" WHERE (codigo_seccion ILIKE ")
            .push_bind(contains_pattern(&q))
            .push(" OR COALESCE(nombre_asignatura, '') ILIKE ")
            .push_bind(contains_pattern(&q))
            .push(")");
    }
    qb.push(" ORDER BY codigo_seccion");

    let rows = qb.build().fetch_all(pool).await?;
    let data = rows
        .iter()
        .map(section_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ListResponse::all(data)))
}

async fn section_students_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListResponse<EnrollmentView>>, ApiError> {
    let page = Page::parse(query.limit.as_deref(), query.offset.as_deref());
    let filter = StudentFilter {
        section: Some(code.trim().to_string()),
        program: non_empty(query.program),
        q: non_empty(query.q),
        ..StudentFilter::default()
    };
    Ok(Json(page_of_enrollments(&state, filter, BY_NAME, page).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn offline_app() -> Router {
        app(AppState::new(None, "infoda"))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_answers_without_database() {
        let (status, body) = get_json(offline_app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "service": "infoda-api" }));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (status, body) = get_json(offline_app(), "/upload-csv").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error"], json!("route not found"));
    }

    #[tokio::test]
    async fn data_routes_answer_503_without_database() {
        let app = offline_app();
        for uri in [
            "/students?section=503203-4&limit=10",
            "/students/by-id/12345",
            "/students/stats/by-program",
            "/students/stats/by-section?program=ing",
            "/programs?q=ing",
            "/programs/3/students",
            "/sections",
            "/sections/503203-4/students?q=perez",
        ] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert_eq!(body["ok"], json!(false), "{uri}");
        }
    }

    #[tokio::test]
    async fn non_numeric_program_id_is_rejected() {
        let (status, body) = get_json(offline_app(), "/programs/abc/students").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
    }

    #[test]
    fn page_parsing_clamps_and_defaults() {
        assert_eq!(Page::parse(None, None), Page { limit: 50, offset: 0 });
        assert_eq!(Page::parse(Some("500"), Some("20")), Page { limit: 200, offset: 20 });
        assert_eq!(Page::parse(Some("abc"), Some("-3")), Page { limit: 50, offset: 0 });
        assert_eq!(Page::parse(Some("0"), None).limit, 1);
    }

    #[test]
    fn sort_keys_are_whitelisted() {
        assert_eq!(SortKey::parse(Some("student_id")), SortKey::StudentId);
        assert_eq!(SortKey::parse(Some(" Section ")), SortKey::Section);
        assert_eq!(SortKey::parse(Some("creado_en; DROP")), SortKey::Name);
        assert_eq!(sort_direction(Some("DESC")), "DESC");
        assert_eq!(sort_direction(Some("sideways")), "ASC");
        assert_eq!(sort_direction(None), "ASC");
    }

    #[test]
    fn filter_binds_every_predicate() {
        let filter = StudentFilter {
            section: Some("503203-4".to_string()),
            program: Some("ing".to_string()),
            q: Some("pe".to_string()),
            ..StudentFilter::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        filter.push_where(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT 1 WHERE s.codigo_seccion = $1 AND c.nombre_carrera ILIKE $2 \
             AND (e.apellidos_nombres ILIKE $3 OR e.matricula ILIKE $4)"
        );

        let mut empty = QueryBuilder::<Postgres>::new("SELECT 1");
        StudentFilter::default().push_where(&mut empty);
        assert_eq!(empty.sql(), "SELECT 1");
    }

    #[test]
    fn list_response_omits_paging_for_full_lists() {
        let value = serde_json::to_value(ListResponse::all(vec![1, 2])).unwrap();
        assert_eq!(value, json!({ "total": 2, "data": [1, 2] }));
        let paged = ListResponse::page(10, Page { limit: 2, offset: 4 }, vec![5, 6]);
        assert_eq!(
            serde_json::to_value(paged).unwrap(),
            json!({ "total": 10, "limit": 2, "offset": 4, "data": [5, 6] })
        );
    }
}
