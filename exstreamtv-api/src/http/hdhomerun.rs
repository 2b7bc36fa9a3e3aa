//! HDHomeRun device emulation.
//!
//! Serves the discovery, lineup and tuner endpoints DVR applications expect.
//! Field names are PascalCase for protocol compatibility; the lineup is the
//! same unified view M3U and XMLTV project.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use super::error::{AppError, AppResult};
use super::iptv::serve_channel_ts;
use super::AppState;

/// HDHomeRun discovery response (PascalCase wire format).
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    pub tuner_count: u32,
}

/// One lineup.json entry.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntryJson {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// lineup_status.json payload.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// `GET /discover.json` (and `/hdhomerun/discover.json`)
pub async fn discover(State(state): State<AppState>) -> Json<DiscoverResponse> {
    let hdhr = &state.config.hdhomerun;
    Json(DiscoverResponse {
        friendly_name: hdhr.friendly_name.clone(),
        model_number: hdhr.model_number.clone(),
        firmware_name: hdhr.firmware_name.clone(),
        firmware_version: hdhr.firmware_version.clone(),
        device_id: hdhr.device_id.clone(),
        device_auth: hdhr.device_auth.clone(),
        base_url: state.base_url.clone(),
        lineup_url: format!("{}/lineup.json", state.base_url),
        tuner_count: hdhr.tuner_count,
    })
}

/// `GET /lineup.json`
pub async fn lineup(State(state): State<AppState>) -> Json<Vec<LineupEntryJson>> {
    let entries = state
        .lineup()
        .into_iter()
        .filter(|e| e.channel.streaming_mode.serves_hdhomerun())
        .map(|e| LineupEntryJson {
            guide_number: e.guide_number,
            guide_name: e.channel.name,
            url: e.stream_url,
        })
        .collect();
    Json(entries)
}

/// `GET /lineup_status.json`
///
/// Static answer: channel scanning does not apply to virtual lineups.
pub async fn lineup_status() -> Json<LineupStatusResponse> {
    Json(LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 0,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    })
}

/// `GET /tuner{N}/stream?channel=auto:v<number>` (also accepts `url=`).
pub async fn tuner_stream(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let number = parse_tuner_target(&params)
        .ok_or_else(|| AppError::bad_request("missing or invalid channel parameter"))?;
    serve_channel_ts(&state, number, addr, &headers).map(IntoResponse::into_response)
}

/// Extract the channel number from `channel=auto:v<n>` or `url=<absolute>`.
fn parse_tuner_target(params: &HashMap<String, String>) -> Option<u32> {
    if let Some(value) = params.get("channel") {
        // Accept auto:v5, auto:ch5 and a bare number.
        let trimmed = value
            .strip_prefix("auto:v")
            .or_else(|| value.strip_prefix("auto:ch"))
            .unwrap_or(value);
        return trimmed.parse().ok();
    }
    if let Some(url) = params.get("url") {
        // Absolute stream URL: the last path segment is <number>.ts.
        let parsed = url::Url::parse(url).ok()?;
        let last = parsed.path_segments()?.next_back()?;
        return last.strip_suffix(".ts").unwrap_or(last).parse().ok();
    }
    None
}
