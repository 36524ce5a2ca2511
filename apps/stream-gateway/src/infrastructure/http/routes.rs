//! Stream Routes
//!
//! REST lookups and the WebSocket stream handlers. Every stream handler
//! runs the same loop over its session's forward channel: attach a client,
//! write its events until the browser sends any frame (re-attach under the
//! same client id) or goes away (stop). The client is detached once, when
//! the session stops; a re-attach replaces the registry entry in place and
//! keeps its upstream references.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::AppState;
use crate::application::ports::{PersistenceError, TradeRecord};
use crate::domain::feed::{ClientId, Code};
use crate::domain::registry::{ClientReceiver, MarketReceivers, TradeClient};
use crate::infrastructure::websocket::{OutboundFrame, SessionError, SessionHandle, session};

// =============================================================================
// REST
// =============================================================================

/// Body of `GET /api/v1/stream/codes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodesResponse {
    /// Subscribed codes in natural order.
    pub codes: Vec<Code>,
}

/// Body of `POST /api/v1/trade/records`: an order id or a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TradeQuery {
    /// Order to look up.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Inclusive lower bound on order time.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on order time.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// A validated [`TradeQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum TradeSelector {
    Order(String),
    Range(DateTime<Utc>, DateTime<Utc>),
}

impl TryFrom<TradeQuery> for TradeSelector {
    type Error = &'static str;

    fn try_from(query: TradeQuery) -> Result<Self, Self::Error> {
        let order_id = query.order_id.filter(|id| !id.is_empty());
        match (order_id, query.start_time, query.end_time) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                Err("order_id and time range are mutually exclusive")
            }
            (Some(order_id), None, None) => Ok(Self::Order(order_id)),
            (None, Some(start), Some(end)) if start <= end => Ok(Self::Range(start, end)),
            (None, Some(_), Some(_)) => Err("start_time is after end_time"),
            (None, _, _) => Err("either order_id or time range must be specified"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn records_response(result: Result<Vec<TradeRecord>, PersistenceError>) -> Response {
    match result {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Trade records lookup failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}

pub(super) async fn subscribed_codes(State(state): State<Arc<AppState>>) -> Json<CodesResponse> {
    Json(CodesResponse {
        codes: state.market.subscribed_codes().await,
    })
}

pub(super) async fn subscribed_stock_codes(
    State(state): State<Arc<AppState>>,
) -> Json<CodesResponse> {
    Json(CodesResponse {
        codes: state.stock.subscribed_codes().await,
    })
}

pub(super) async fn trade_records(State(state): State<Arc<AppState>>) -> Response {
    records_response(state.trades.find_all().await)
}

pub(super) async fn query_trade_records(
    State(state): State<Arc<AppState>>,
    Json(query): Json<TradeQuery>,
) -> Response {
    let selector = match TradeSelector::try_from(query) {
        Ok(selector) => selector,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, reason),
    };
    let result = match selector {
        TradeSelector::Order(order_id) => state
            .trades
            .find_by_order_id(&order_id)
            .await
            .map(|record| record.into_iter().collect()),
        TradeSelector::Range(start, end) => state.trades.find_in_range(start, end).await,
    };
    records_response(result)
}

pub(super) async fn undone_trade_records(
    State(state): State<Arc<AppState>>,
    Path(code): Path<Code>,
) -> Response {
    records_response(state.trades.find_undone_by_code(&code).await)
}

pub(super) async fn trigger_trade_update(State(state): State<Arc<AppState>>) -> Response {
    match state.trade.trigger_update().await {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

// =============================================================================
// WebSocket Handlers
// =============================================================================

pub(super) async fn market_firehose(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_market(socket, state, None))
}

pub(super) async fn market_single_code(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(code): Path<Code>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_market(socket, state, Some(code)))
}

pub(super) async fn stock_firehose(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_stock(socket, state, None))
}

pub(super) async fn stock_single_code(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(code): Path<Code>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_stock(socket, state, Some(code)))
}

pub(super) async fn trade_firehose(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_trade(socket, state, None))
}

pub(super) async fn trade_single_code(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(code): Path<Code>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_trade(socket, state, Some(code)))
}

pub(super) async fn keep_alive(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (forward_tx, mut forward_rx) = mpsc::channel(1);
        let session = session::start(socket, forward_tx, state.ws_buffer, &state.shutdown);
        while forward_rx.recv().await.is_some() {}
        session.close();
    })
}

// =============================================================================
// Session Loops
// =============================================================================

/// What the loop does after a client's pump returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Reattach,
    Stop,
}

impl From<Option<Bytes>> for Next {
    fn from(signal: Option<Bytes>) -> Self {
        if signal.is_some() {
            Self::Reattach
        } else {
            Self::Stop
        }
    }
}

async fn serve_market(socket: WebSocket, state: Arc<AppState>, code: Option<Code>) {
    let (forward_tx, mut forward_rx) = mpsc::channel(1);
    let session = session::start(socket, forward_tx, state.ws_buffer, &state.shutdown);
    let id = ClientId::new();
    tracing::debug!(client_id = %id, code = ?code, "Market session started");

    loop {
        let (client, receivers) = state.market.client_with_id(id);
        match &code {
            Some(code) => state.market.attach_single_code(code, client).await,
            None => state.market.attach_firehose(client).await,
        }
        if pump_market(&session, receivers, &mut forward_rx).await == Next::Stop {
            break;
        }
    }

    match &code {
        Some(code) => state.market.detach_single_code(code, id),
        None => state.market.detach_firehose(id),
    };
    session.close();
    tracing::debug!(client_id = %id, "Market session ended");
}

async fn serve_trade(socket: WebSocket, state: Arc<AppState>, code: Option<Code>) {
    let (forward_tx, mut forward_rx) = mpsc::channel(1);
    let session = session::start(socket, forward_tx, state.ws_buffer, &state.shutdown);
    let id = ClientId::new();
    tracing::debug!(client_id = %id, code = ?code, "Trade session started");

    loop {
        let (client, receiver) = TradeClient::with_id(id);
        match &code {
            Some(code) => state.trade.attach_single_code(code, client),
            None => state.trade.attach_firehose(client),
        }
        if pump_feed(&session, receiver, &mut forward_rx).await == Next::Stop {
            break;
        }
    }

    match &code {
        Some(code) => state.trade.detach_single_code(code, id),
        None => state.trade.detach_firehose(id),
    };
    session.close();
    tracing::debug!(client_id = %id, "Trade session ended");
}

async fn serve_stock(socket: WebSocket, state: Arc<AppState>, code: Option<Code>) {
    let (forward_tx, mut forward_rx) = mpsc::channel(1);
    let session = session::start(socket, forward_tx, state.ws_buffer, &state.shutdown);
    let id = ClientId::new();
    tracing::debug!(client_id = %id, code = ?code, "Stock session started");

    loop {
        let (client, receiver) = state.stock.client_with_id(id);
        match &code {
            Some(code) => state.stock.attach_single_code(code, client).await,
            None => state.stock.attach_firehose(client).await,
        }
        if pump_feed(&session, receiver, &mut forward_rx).await == Next::Stop {
            break;
        }
    }

    match &code {
        Some(code) => state.stock.detach_single_code(code, id),
        None => state.stock.detach_firehose(id),
    };
    session.close();
    tracing::debug!(client_id = %id, "Stock session ended");
}

async fn pump_market(
    session: &SessionHandle,
    mut receivers: MarketReceivers,
    forward: &mut mpsc::Receiver<Bytes>,
) -> Next {
    loop {
        tokio::select! {
            () = session.closed() => return Next::Stop,
            signal = forward.recv() => return signal.into(),
            Some(tick) = receivers.ticks.recv() => {
                if !write_frame(session, &tick) {
                    return Next::Stop;
                }
            }
            Some(bid_ask) = receivers.bid_asks.recv() => {
                if !write_frame(session, &bid_ask) {
                    return Next::Stop;
                }
            }
        }
    }
}

async fn pump_feed<E: OutboundFrame>(
    session: &SessionHandle,
    mut receiver: ClientReceiver<E>,
    forward: &mut mpsc::Receiver<Bytes>,
) -> Next {
    loop {
        tokio::select! {
            () = session.closed() => return Next::Stop,
            signal = forward.recv() => return signal.into(),
            Some(event) = receiver.recv() => {
                if !write_frame(session, &event) {
                    return Next::Stop;
                }
            }
        }
    }
}

/// Returns `false` once the session is closed. A full write buffer drops
/// the frame.
fn write_frame(session: &SessionHandle, event: &impl OutboundFrame) -> bool {
    match session.write_binary(event.encode_frame()) {
        Ok(()) => true,
        Err(SessionError::Full) => {
            tracing::trace!("Session write buffer full, frame dropped");
            true
        }
        Err(SessionError::Closed) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_signal_means_reattach() {
        assert_eq!(Next::from(Some(Bytes::from_static(b"x"))), Next::Reattach);
        assert_eq!(Next::from(None), Next::Stop);
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn order_id_query_selects_one_order() {
        let query = TradeQuery {
            order_id: Some("ord-1".to_string()),
            ..TradeQuery::default()
        };
        assert_eq!(
            TradeSelector::try_from(query),
            Ok(TradeSelector::Order("ord-1".to_string()))
        );
    }

    #[test]
    fn range_query_selects_range() {
        let query = TradeQuery {
            start_time: Some(at(0)),
            end_time: Some(at(60)),
            ..TradeQuery::default()
        };
        assert_eq!(
            TradeSelector::try_from(query),
            Ok(TradeSelector::Range(at(0), at(60)))
        );
    }

    #[test]
    fn incomplete_or_conflicting_queries_are_rejected() {
        let empty_id = TradeQuery {
            order_id: Some(String::new()),
            ..TradeQuery::default()
        };
        let half_range = TradeQuery {
            start_time: Some(at(0)),
            ..TradeQuery::default()
        };
        let both = TradeQuery {
            order_id: Some("ord-1".to_string()),
            start_time: Some(at(0)),
            end_time: Some(at(60)),
        };
        let inverted = TradeQuery {
            start_time: Some(at(60)),
            end_time: Some(at(0)),
            ..TradeQuery::default()
        };
        for query in [TradeQuery::default(), empty_id, half_range, both, inverted] {
            assert!(TradeSelector::try_from(query).is_err());
        }
    }
}
