//! gRPC Upstream Adapter
//!
//! [`MarketDataSource`] over a tonic channel to the upstream
//! `gateway.v1.MarketDataService`. The channel connects lazily and
//! reconnects on demand, so each subscription attempt is one RPC.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic_prost::ProstCodec;

use super::proto;
use crate::application::ports::{FeedStream, MarketDataSource, UpstreamError};
use crate::domain::feed::{BidAsk, Code, Quote, Snapshot, SnapshotKind, Tick, TradeExecution};

const SUBSCRIBE_TICK_PATH: &str = "/gateway.v1.MarketDataService/SubscribeTick";
const SUBSCRIBE_BID_ASK_PATH: &str = "/gateway.v1.MarketDataService/SubscribeBidAsk";
const SUBSCRIBE_QUOTE_PATH: &str = "/gateway.v1.MarketDataService/SubscribeStockQuote";
const SUBSCRIBE_TRADE_PATH: &str = "/gateway.v1.MarketDataService/SubscribeTrade";
const UPDATE_TRADE_PATH: &str = "/gateway.v1.MarketDataService/UpdateAndPublishTrade";
const GET_SNAPSHOT_PATH: &str = "/gateway.v1.MarketDataService/GetSnapshot";

/// Upstream client over a shared tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcMarketDataSource {
    inner: Grpc<Channel>,
}

impl GrpcMarketDataSource {
    /// Create a client for `uri` without connecting yet.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Transport` if the URI is invalid.
    pub fn connect_lazy(uri: &str, connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let endpoint = Endpoint::from_shared(uri.to_string())
            .map_err(|e| UpstreamError::Transport {
                message: e.to_string(),
            })?
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true);
        Ok(Self {
            inner: Grpc::new(endpoint.connect_lazy()),
        })
    }

    async fn ready(&self) -> Result<Grpc<Channel>, UpstreamError> {
        let mut grpc = self.inner.clone();
        grpc.ready().await.map_err(|e| UpstreamError::Transport {
            message: format!("service was not ready: {e}"),
        })?;
        Ok(grpc)
    }

    async fn open_stream<Req, Resp, E>(
        &self,
        request: Req,
        path: &'static str,
    ) -> Result<FeedStream<E>, UpstreamError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + 'static,
        E: TryFrom<Resp, Error = UpstreamError> + Send + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec = ProstCodec::<Req, Resp>::default();
        let response = grpc
            .server_streaming(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(status_error)?;

        let stream = response
            .into_inner()
            .map(|item| item.map_err(status_error).and_then(E::try_from));
        Ok(stream.boxed())
    }
}

fn status_error(status: tonic::Status) -> UpstreamError {
    UpstreamError::Rpc {
        code: status.code().description().to_string(),
        message: status.message().to_string(),
    }
}

#[async_trait]
impl MarketDataSource for GrpcMarketDataSource {
    async fn subscribe_tick(&self, code: &str) -> Result<FeedStream<Tick>, UpstreamError> {
        let request = proto::SubscribeRequest {
            code: code.to_string(),
        };
        self.open_stream::<_, proto::Tick, _>(request, SUBSCRIBE_TICK_PATH)
            .await
    }

    async fn subscribe_bid_ask(&self, code: &str) -> Result<FeedStream<BidAsk>, UpstreamError> {
        let request = proto::SubscribeRequest {
            code: code.to_string(),
        };
        self.open_stream::<_, proto::BidAsk, _>(request, SUBSCRIBE_BID_ASK_PATH)
            .await
    }

    async fn subscribe_quote(&self, code: &str) -> Result<FeedStream<Quote>, UpstreamError> {
        let request = proto::SubscribeRequest {
            code: code.to_string(),
        };
        self.open_stream::<_, proto::StockQuote, _>(request, SUBSCRIBE_QUOTE_PATH)
            .await
    }

    async fn subscribe_trade(&self) -> Result<FeedStream<TradeExecution>, UpstreamError> {
        self.open_stream::<_, proto::Trade, _>(proto::TradeStreamRequest {}, SUBSCRIBE_TRADE_PATH)
            .await
    }

    async fn trigger_trade_update(&self) -> Result<(), UpstreamError> {
        let mut grpc = self.ready().await?;
        let codec =
            ProstCodec::<proto::TradeUpdateRequest, proto::TradeUpdateResponse>::default();
        grpc.unary(
            tonic::Request::new(proto::TradeUpdateRequest {}),
            PathAndQuery::from_static(UPDATE_TRADE_PATH),
            codec,
        )
        .await
        .map_err(status_error)?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        kind: SnapshotKind,
        codes: &[Code],
    ) -> Result<HashMap<Code, Snapshot>, UpstreamError> {
        let mut grpc = self.ready().await?;
        let request = proto::SnapshotRequest {
            r#type: proto::SnapshotType::from(kind).into(),
            codes: codes.to_vec(),
        };
        let codec = ProstCodec::<proto::SnapshotRequest, proto::SnapshotResponse>::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(GET_SNAPSHOT_PATH),
                codec,
            )
            .await
            .map_err(status_error)?;

        let mut snapshots = HashMap::new();
        for (code, entry) in response.into_inner().snapshots {
            match Snapshot::try_from(entry) {
                Ok(snapshot) => {
                    snapshots.insert(code, snapshot);
                }
                Err(e) => tracing::warn!(code = %code, error = %e, "Discarding invalid snapshot"),
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_uri_is_rejected() {
        let result = GrpcMarketDataSource::connect_lazy("not a uri", Duration::from_secs(1));
        assert!(matches!(result, Err(UpstreamError::Transport { .. })));
    }

    #[test]
    fn status_maps_to_rpc_error() {
        let err = status_error(tonic::Status::not_found("no such code"));
        match err {
            UpstreamError::Rpc { code, message } => {
                assert_eq!(code, tonic::Code::NotFound.description());
                assert_eq!(message, "no such code");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
