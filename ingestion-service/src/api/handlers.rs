//! Query API handlers. Engine calls scan in-memory structures synchronously,
//! so each one runs on the blocking pool.

use std::str::FromStr;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use telemetry_engine::{
    domain::{Category, Reading, WindowSize},
    index::RebuildStats,
    query::{ConsumerTotal, SeriesPoint},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::{error::ApiError, ApiState};

const DEFAULT_TOP_N: usize = 10;
const MAX_TOP_N: usize = 1_000;
/// A leap year of hourly points fits.
const MAX_SERIES_POINTS: u64 = 10_000;

/// Raw query string; fields are validated per endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct UsageParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub region: Option<String>,
    pub category: Option<String>,
    pub window: Option<String>,
    pub n: Option<usize>,
}

impl UsageParams {
    fn range(&self) -> Result<(OffsetDateTime, OffsetDateTime), ApiError> {
        let from = parse_ts("from", self.from.as_deref())?;
        let to = parse_ts("to", self.to.as_deref())?;
        if from > to {
            return Err(ApiError::InvalidQuery(format!("'from' ({from}) is after 'to' ({to})")));
        }
        Ok((from, to))
    }

    fn category(&self) -> Result<Option<Category>, ApiError> {
        self.category
            .as_deref()
            .map(Category::from_str)
            .transpose()
            .map_err(ApiError::InvalidQuery)
    }

    fn window(&self) -> Result<Option<WindowSize>, ApiError> {
        self.window
            .as_deref()
            .map(WindowSize::from_str)
            .transpose()
            .map_err(ApiError::InvalidQuery)
    }
}

fn parse_ts(name: &str, value: Option<&str>) -> Result<OffsetDateTime, ApiError> {
    let value = value.ok_or_else(|| ApiError::InvalidQuery(format!("missing '{name}'")))?;
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| ApiError::InvalidQuery(format!("invalid '{name}' timestamp '{value}': {e}")))
}

fn params(query: Result<Query<UsageParams>, QueryRejection>) -> Result<UsageParams, ApiError> {
    query
        .map(|Query(p)| p)
        .map_err(|e| ApiError::InvalidQuery(e.body_text()))
}

async fn blocking<F, R>(f: F) -> Result<R, ApiError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("query task failed: {e}")))
}

#[derive(Debug, Serialize)]
pub struct TotalResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
    pub total_kwh: f64,
}

/// `GET /api/usage/total?from&to[&region][&category]`
pub async fn usage_total(
    State(state): State<ApiState>,
    query: Result<Query<UsageParams>, QueryRejection>,
) -> Result<Json<TotalResponse>, ApiError> {
    let p = params(query)?;
    let (from, to) = p.range()?;
    let category = p.category()?;
    let region = p.region;

    let engine = state.engine.clone();
    let r = region.clone();
    let total_kwh = blocking(move || engine.query().total_usage(r.as_deref(), category, from, to)).await?;

    Ok(Json(TotalResponse {
        region,
        category,
        from,
        to,
        total_kwh,
    }))
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub window: WindowSize,
    pub points: Vec<SeriesPoint>,
}

/// `GET /api/usage/series?from&to[&window][&region][&category]`, hourly by default.
pub async fn usage_series(
    State(state): State<ApiState>,
    query: Result<Query<UsageParams>, QueryRejection>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let p = params(query)?;
    let (from, to) = p.range()?;
    let category = p.category()?;
    let window = p.window()?.unwrap_or(WindowSize::Hour);
    let len = state.engine.query().series_len(window, from, to);
    if len > MAX_SERIES_POINTS {
        return Err(ApiError::InvalidQuery(format!(
            "range spans {len} {window} windows; at most {MAX_SERIES_POINTS} allowed"
        )));
    }

    let engine = state.engine.clone();
    let points =
        blocking(move || engine.query().time_series(p.region.as_deref(), category, window, from, to)).await?;
    Ok(Json(SeriesResponse { window, points }))
}

/// `GET /api/usage/top?from&to[&n]`
pub async fn usage_top(
    State(state): State<ApiState>,
    query: Result<Query<UsageParams>, QueryRejection>,
) -> Result<Json<Vec<ConsumerTotal>>, ApiError> {
    let p = params(query)?;
    let (from, to) = p.range()?;
    let n = p.n.unwrap_or(DEFAULT_TOP_N);
    if n > MAX_TOP_N {
        return Err(ApiError::InvalidQuery(format!("'n' must be at most {MAX_TOP_N}")));
    }

    let engine = state.engine.clone();
    let top = blocking(move || engine.query().top_consumers(n, from, to)).await?;
    Ok(Json(top))
}

/// `GET /api/meters/:meter_id/profile?from&to`
pub async fn meter_profile(
    State(state): State<ApiState>,
    Path(meter_id): Path<String>,
    query: Result<Query<UsageParams>, QueryRejection>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let p = params(query)?;
    let (from, to) = p.range()?;

    let engine = state.engine.clone();
    let readings = blocking(move || engine.query().load_profile(&meter_id, from, to)).await?;
    Ok(Json(readings))
}

/// `POST /api/index/rebuild[?window]`, every indexed window when omitted.
pub async fn rebuild_index(
    State(state): State<ApiState>,
    query: Result<Query<UsageParams>, QueryRejection>,
) -> Result<Json<Vec<RebuildStats>>, ApiError> {
    let p = params(query)?;
    let engine = state.engine.clone();
    let cancel = state.shutdown.child_token();

    let stats = match p.window()? {
        Some(size) => blocking(move || engine.rebuild(size, &cancel).map(|s| vec![s])).await??,
        None => blocking(move || engine.index().rebuild_all(&cancel)).await??,
    };
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub readings: usize,
    pub meters: usize,
    pub high_water_sequence: u64,
    pub windows: Vec<WindowSize>,
}

/// `GET /health`
pub async fn health(State(state): State<ApiState>) -> Json<Health> {
    let store = state.engine.store();
    Json(Health {
        status: "ok",
        readings: store.len(),
        meters: store.meter_count(),
        high_water_sequence: store.high_water_sequence(),
        windows: state.engine.index().window_sizes(),
    })
}
