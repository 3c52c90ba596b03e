//! gRPC client for the two-method agent service.
//!
//! Method stubs are written by hand against [`tonic::client::Grpc`] in the
//! same shape tonic's generated clients take: ready the channel, pick the
//! codec, invoke by path. The codec plugs the wire format from
//! [`super::wire`] into tonic's encoder/decoder traits.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Buf;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder, Streaming};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use super::types::{Empty, HealthResponse, TaskEvent, TaskRequest};
use super::wire::WireMessage;

const EXECUTE_PATH: &str = "/agent.AgentService/Execute";
const HEALTH_PATH: &str = "/agent.AgentService/Health";

/// Per-attempt TCP connect deadline for the lazy channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one agent's RPC endpoint on loopback.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub struct AgentClient {
    inner: Grpc<Channel>,
}

impl AgentClient {
    /// Build a client for the agent listening on `127.0.0.1:port`, without
    /// transport security.
    ///
    /// The channel is lazy: the TCP connection is established on first use,
    /// so this only fails on a malformed endpoint. A dead endpoint surfaces
    /// as a transport error on the first call.
    pub fn connect_lazy(port: u16) -> Result<Self, tonic::transport::Error> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))?
            .connect_timeout(CONNECT_TIMEOUT);
        Ok(Self {
            inner: Grpc::new(endpoint.connect_lazy()),
        })
    }

    /// Server-streaming Execute: send one request, receive events until
    /// end-of-stream.
    pub async fn execute(&mut self, req: TaskRequest) -> Result<ExecuteStream, Status> {
        self.ready().await?;
        let codec: WireCodec<TaskRequest, TaskEvent> = WireCodec::default();
        let path = PathAndQuery::from_static(EXECUTE_PATH);
        let response = self
            .inner
            .server_streaming(Request::new(req), path, codec)
            .await?;
        Ok(ExecuteStream {
            inner: response.into_inner(),
        })
    }

    /// Unary health probe.
    pub async fn health(&mut self) -> Result<HealthResponse, Status> {
        self.ready().await?;
        let codec: WireCodec<Empty, HealthResponse> = WireCodec::default();
        let path = PathAndQuery::from_static(HEALTH_PATH);
        let response = self.inner.unary(Request::new(Empty), path, codec).await?;
        Ok(response.into_inner())
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::new(Code::Unknown, format!("service not ready: {e}")))
    }
}

/// Server-stream of task events from one Execute call.
pub struct ExecuteStream {
    inner: Streaming<TaskEvent>,
}

impl ExecuteStream {
    /// Next event, or `None` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<TaskEvent>, Status> {
        self.inner.message().await
    }

    /// Drain the stream, returning all events in arrival order.
    pub async fn recv_all(mut self) -> Result<Vec<TaskEvent>, Status> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Adapts a [`WireMessage`] pair to tonic's codec traits.
struct WireCodec<E, D> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> Default for WireCodec<E, D> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Codec for WireCodec<E, D>
where
    E: WireMessage,
    D: WireMessage,
{
    type Encode = E;
    type Decode = D;
    type Encoder = WireEncoder<E>;
    type Decoder = WireDecoder<D>;

    fn encoder(&mut self) -> Self::Encoder {
        WireEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        WireDecoder(PhantomData)
    }
}

struct WireEncoder<E>(PhantomData<E>);

impl<E: WireMessage> Encoder for WireEncoder<E> {
    type Item = E;
    type Error = Status;

    fn encode(&mut self, item: E, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode_into(dst);
        Ok(())
    }
}

struct WireDecoder<D>(PhantomData<D>);

impl<D: WireMessage> Decoder for WireDecoder<D> {
    type Item = D;
    type Error = Status;

    // tonic hands over exactly one length-prefixed gRPC frame at a time.
    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<D>, Status> {
        let data = src.copy_to_bytes(src.remaining());
        let msg = D::decode(&data).map_err(|e| Status::new(Code::Internal, e.to_string()))?;
        Ok(Some(msg))
    }
}
