//! Trade Stream Integration Tests
//!
//! Trade executions from the in-memory upstream reach WebSocket clients as
//! protobuf frames and land in the trade repository.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod common;

use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::StreamExt;
use prost::Message as _;
use rust_decimal::Decimal;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use common::{WAIT, eventually, spawn_gateway};
use stream_gateway::infrastructure::bus::TOPIC_REFERENCE_DATA_READY;
use stream_gateway::proto;
use stream_gateway::{
    ControlEvent, FeedKind, OrderAction, OrderStatus, OrderType, TradeExecution, TradeRepository,
    router,
};

fn trade(order_id: &str, code: &str, filled: i64) -> TradeExecution {
    TradeExecution {
        order_id: order_id.to_string(),
        code: code.to_string(),
        order_type: OrderType::Future,
        action: OrderAction::Sell,
        price: Decimal::new(16_980, 0),
        quantity: 3,
        filled_quantity: filled,
        status: if filled == 3 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartFilled
        },
        order_time: Utc::now(),
    }
}

async fn next_trade<S>(ws: &mut S) -> proto::Trade
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Binary(data) => return proto::Trade::decode(data.as_ref()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn trades_flow_after_reference_data_is_ready() {
    let gw = spawn_gateway().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.ws_url("/ws/v1/trade/stream"))
        .await
        .unwrap();
    eventually(|| gw.trade.registry_stats().firehose_clients == 1).await;
    assert!(!gw.trade.is_streaming());

    gw.bus
        .publish(TOPIC_REFERENCE_DATA_READY, ControlEvent::ReferenceDataReady);
    assert!(gw.source.wait_for_streams(FeedKind::Trade, "", 1, WAIT).await);

    gw.source.push_trade(trade("o-1", "TXF", 1));
    gw.source.push_trade(trade("o-2", "MXF", 3));

    let first = next_trade(&mut ws).await;
    let second = next_trade(&mut ws).await;
    assert_eq!(first.order_id, "o-1");
    assert_eq!(first.filled_quantity, 1);
    assert_eq!(second.order_id, "o-2");
    assert_eq!(second.price, 16_980.0);
}

#[tokio::test]
async fn single_code_trade_socket_filters_by_code() {
    let gw = spawn_gateway().await;
    gw.trade.start_streaming();
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.ws_url("/ws/v1/trade/stream/TXF"))
        .await
        .unwrap();
    eventually(|| gw.trade.registry_stats().single_code_clients == 1).await;
    assert!(gw.source.wait_for_streams(FeedKind::Trade, "", 1, WAIT).await);

    gw.source.push_trade(trade("o-1", "MXF", 1));
    gw.source.push_trade(trade("o-2", "TXF", 1));

    let got = next_trade(&mut ws).await;
    assert_eq!(got.order_id, "o-2");
    assert_eq!(got.code, "TXF");
}

#[tokio::test]
async fn executions_are_persisted_and_listed() {
    let gw = spawn_gateway().await;
    gw.trade.start_streaming();
    assert!(gw.source.wait_for_streams(FeedKind::Trade, "", 1, WAIT).await);

    gw.source.push_trade(trade("o-7", "TXF", 1));
    gw.source.push_trade(trade("o-7", "TXF", 3));
    gw.source.push_trade(trade("o-8", "MXF", 1));

    timeout(WAIT, async {
        loop {
            let filled = gw.repository.len() == 2
                && gw
                    .repository
                    .find_all()
                    .await
                    .unwrap()
                    .iter()
                    .any(|r| r.trade.order_id == "o-7" && r.trade.filled_quantity == 3);
            if filled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let response = router(std::sync::Arc::clone(&gw.state))
        .oneshot(
            Request::builder()
                .uri("/api/v1/trade/records")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let records: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let order_ids: Vec<_> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["order_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(order_ids.len(), 2);
    assert!(order_ids.contains(&"o-7".to_string()));
    assert!(order_ids.contains(&"o-8".to_string()));
}

#[tokio::test]
async fn closing_trade_socket_detaches_client() {
    let gw = spawn_gateway().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.ws_url("/ws/v1/trade/stream"))
        .await
        .unwrap();
    eventually(|| gw.trade.registry_stats().firehose_clients == 1).await;

    ws.close(None).await.unwrap();

    eventually(|| gw.trade.registry_stats().firehose_clients == 0).await;
}
