//! IPTV surface: M3U playlist, XMLTV guide, per-channel MPEG-TS.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use exstreamtv_core::metrics;
use exstreamtv_core::models::SessionId;
use exstreamtv_core::service::{ChannelRuntime, SessionManager, SessionRejection};

use super::error::{AppError, AppResult};
use super::AppState;
use crate::xmltv::{render_xmltv, ChannelGuide};

/// Guide horizon served in the XMLTV document.
const EPG_HORIZON_HOURS: i64 = 24;

/// `GET /iptv/channels.m3u`
pub async fn playlist(State(state): State<AppState>) -> Response {
    let playlist = crate::m3u::render_playlist(&state.lineup());
    (
        [(header::CONTENT_TYPE, "audio/x-mpegurl")],
        playlist,
    )
        .into_response()
}

/// `GET /iptv/xmltv.xml`
pub async fn xmltv(State(state): State<AppState>) -> AppResult<Response> {
    let lineup = state.lineup();
    let horizon = chrono::Duration::hours(EPG_HORIZON_HOURS);

    let mut guides = Vec::with_capacity(lineup.len());
    for entry in &lineup {
        let programmes = state
            .timeline
            .programme_window(&entry.channel.id, horizon)
            .unwrap_or_default();
        guides.push(ChannelGuide { entry, programmes });
    }

    let xml = render_xmltv(&guides)
        .map_err(|e| AppError::internal(format!("XMLTV generation failed: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], xml).into_response())
}

/// `GET /iptv/channel/{number}.ts`
pub async fn stream(
    State(state): State<AppState>,
    Path(number): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let number: u32 = number
        .strip_suffix(".ts")
        .unwrap_or(&number)
        .parse()
        .map_err(|_| AppError::bad_request("channel number must be numeric"))?;
    serve_channel_ts(&state, number, addr, &headers)
}

/// Attach a subscriber to a channel's hub and stream MPEG-TS to the client.
///
/// Shared by the IPTV and tuner endpoints. Once headers are sent the
/// connection never turns into a 5xx; source trouble shows up as
/// error-screen bytes instead.
pub fn serve_channel_ts(
    state: &AppState,
    number: u32,
    addr: SocketAddr,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let runtime = state
        .channels
        .get_by_number(number)
        .ok_or_else(|| AppError::not_found(format!("channel {number}")))?;

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let session = state
        .sessions
        .open(runtime.id(), addr.to_string(), user_agent)
        .map_err(|rejection| match rejection {
            SessionRejection::PerChannelCap => AppError::tuners_exhausted(),
            SessionRejection::ShuttingDown => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
            }
        })?;

    debug!(channel = number, session = %session.session_id, "Subscriber attached");
    let body = subscriber_body(&runtime, Arc::clone(&state.sessions), session.session_id);

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response())
}

/// Session lifetime tracker: closing happens exactly when the response body
/// is dropped, whether by client hangup or stream end.
struct SessionGuard {
    sessions: Arc<SessionManager>,
    session_id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.close(&self.session_id);
    }
}

fn subscriber_body(
    runtime: &Arc<ChannelRuntime>,
    sessions: Arc<SessionManager>,
    session_id: SessionId,
) -> Body {
    let rx = runtime.subscribe();
    let channel_label = runtime.channel().number.to_string();
    let guard = SessionGuard {
        sessions: Arc::clone(&sessions),
        session_id,
    };

    let stream = futures::stream::unfold(
        (rx, sessions, session_id, channel_label, guard),
        |(mut rx, sessions, session_id, channel_label, guard)| async move {
            match rx.recv().await {
                Ok(chunk) => {
                    sessions.record_bytes(&session_id, chunk.len() as u64);
                    Some((
                        Ok::<Bytes, std::convert::Infallible>(chunk),
                        (rx, sessions, session_id, channel_label, guard),
                    ))
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow subscriber: drop it rather than stall the hub.
                    warn!(
                        session = %session_id,
                        skipped,
                        "Subscriber fell behind, dropping"
                    );
                    metrics::channel::SLOW_SUBSCRIBERS_DROPPED_TOTAL
                        .with_label_values(&[channel_label.as_str()])
                        .inc();
                    sessions.record_error(&session_id, "slow subscriber dropped");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        },
    );

    Body::from_stream(stream)
}
