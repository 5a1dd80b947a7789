use std::{
    any::Any,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::Duration,
};

use futures::{channel::mpsc, stream::BoxStream, Sink, SinkExt, Stream, StreamExt};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;
use tonic::{transport::ClientTlsConfig, Status};
use yellowstone_grpc_client::{GeyserGrpcBuilderError, GeyserGrpcClient};
use yellowstone_grpc_proto::prelude::{SubscribeRequest, SubscribeUpdate};

use crate::subscription::SubscriptionDescriptor;

pub type UpdateStream = BoxStream<'static, Result<SubscribeUpdate, Status>>;
type RequestSink = Pin<Box<dyn Sink<SubscribeRequest, Error = mpsc::SendError> + Send>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("GeyserGrpcBuilderError {0}")]
    GeyserGrpcBuilderError(#[from] GeyserGrpcBuilderError),
    #[error("GrpcError {0}")]
    GrpcError(#[from] Status),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("subscription already sent on this stream")]
    AlreadySubscribed,
    #[error("stream is {0:?}, refusing to write")]
    NotOpen(StreamState),
    #[error("SubscribeSendError {0}")]
    Sink(#[from] mpsc::SendError),
}

/// Handles only exist once a connector has opened the RPC, so a `StreamHandle` starts
/// `Open`. `Unconnected` is the state before that point; it is never stored in a handle
/// and is what an unknown raw value decodes to.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Unconnected = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for StreamState {
    fn from(value: u8) -> Self {
        match value {
            1 => StreamState::Open,
            2 => StreamState::Closing,
            3 => StreamState::Closed,
            _ => StreamState::Unconnected,
        }
    }
}

struct Halves {
    sink: Option<RequestSink>,
    updates: Option<UpdateStream>,
    /// Keeps the client (and its channel) alive until close
    transport: Option<Box<dyn Any + Send>>,
}

/// The open duplex stream. Safe to share behind an `Arc`; `state` is the one-shot guard
/// deciding which caller performs the close.
pub struct StreamHandle {
    state: AtomicU8,
    subscribed: AtomicBool,
    halves: Mutex<Halves>,
}

impl StreamHandle {
    /// Wraps the halves of an already established stream, so the handle starts `Open`.
    pub fn new<Tx, Rx>(sink: Tx, updates: Rx) -> Self
    where
        Tx: Sink<SubscribeRequest, Error = mpsc::SendError> + Send + 'static,
        Rx: Stream<Item = Result<SubscribeUpdate, Status>> + Send + 'static,
    {
        Self {
            state: AtomicU8::new(StreamState::Open as u8),
            subscribed: AtomicBool::new(false),
            halves: Mutex::new(Halves {
                sink: Some(Box::pin(sink)),
                updates: Some(updates.boxed()),
                transport: None,
            }),
        }
    }

    fn with_transport(mut self, transport: impl Any + Send) -> Self {
        self.halves.get_mut().transport = Some(Box::new(transport));
        self
    }

    pub fn state(&self) -> StreamState {
        StreamState::from(self.state.load(Ordering::Acquire))
    }

    /// Writes the subscription. Only the first call on a handle ever reaches the wire.
    pub async fn send(&self, descriptor: &SubscriptionDescriptor) -> Result<(), SendError> {
        let mut halves = self.halves.lock().await;
        let state = self.state();
        if state != StreamState::Open {
            return Err(SendError::NotOpen(state));
        }
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(SendError::AlreadySubscribed);
        }
        let sink = halves
            .sink
            .as_mut()
            .ok_or(SendError::NotOpen(StreamState::Closed))?;
        sink.send(descriptor.to_request()).await?;
        Ok(())
    }

    /// Hands the inbound half to its single reader. `None` if already taken or closed.
    pub async fn take_updates(&self) -> Option<UpdateStream> {
        self.halves.lock().await.updates.take()
    }

    /// Half-closes the request side and releases the transport. Returns `true` only for
    /// the call that performed the close; every later call is a no-op.
    pub async fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                StreamState::Open as u8,
                StreamState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("close skipped, stream is {:?}", self.state());
            return false;
        }

        let mut halves = self.halves.lock().await;
        if let Some(mut sink) = halves.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("error closing subscribe sink: {e}");
            }
        }
        halves.updates = None;
        halves.transport = None;
        self.state.store(StreamState::Closed as u8, Ordering::Release);
        true
    }
}

#[tonic::async_trait]
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn open(&self) -> Result<StreamHandle, ConnectionError>;
}

#[derive(Clone, Debug)]
pub struct GeyserConnector {
    endpoint: String,
    x_token: Option<String>,
    connect_timeout: Duration,
    max_decoding_message_size: usize,
}

impl GeyserConnector {
    pub fn new(
        endpoint: String,
        x_token: Option<String>,
        connect_timeout: Duration,
        max_decoding_message_size: usize,
    ) -> Self {
        Self {
            endpoint,
            x_token,
            connect_timeout,
            max_decoding_message_size,
        }
    }
}

#[tonic::async_trait]
impl Connector for GeyserConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open(&self) -> Result<StreamHandle, ConnectionError> {
        info!("Connecting to gRPC endpoint: {}", self.endpoint);
        let mut builder = GeyserGrpcClient::build_from_shared(self.endpoint.clone())?
            .x_token(self.x_token.clone())?
            .connect_timeout(self.connect_timeout)
            .max_decoding_message_size(self.max_decoding_message_size);
        if self.endpoint.starts_with("https://") {
            builder = builder.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }

        let mut client = builder.connect().await?;
        // nothing is written to `subscribe_tx` until the descriptor is sent
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded();
        let updates = client.geyser.subscribe(subscribe_rx).await?.into_inner();
        Ok(StreamHandle::new(subscribe_tx, updates).with_transport(client))
    }
}
