//! Length-prefixed JSON transport over TCP.
//!
//! Unary calls share one connection, serialized behind an async mutex; the
//! per-call deadline covers waiting for that mutex as well as the exchange. A
//! connection that fails or is abandoned mid-call is dropped and re-opened on
//! the next call, so callers only ever observe the failure as `UNAVAILABLE` or
//! `DEADLINE_EXCEEDED`. Streams use their own connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use futures::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::address::KernelAddress;
use crate::transport::{
    Transport, TransportError, TransportStream, WireRequest, WireResponse,
};

/// Default per-call timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

type KernelFramed = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

pub struct TcpTransport {
    address: KernelAddress,
    timeout: Duration,
    conn: Mutex<Option<KernelFramed>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(address: KernelAddress) -> Self {
        Self::with_timeout(address, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(address: KernelAddress, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> &KernelAddress {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request_frame(&self, namespace: &str, method: &str, args: Value) -> WireRequest {
        WireRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.to_string(),
            method: method.to_string(),
            args,
        }
    }
}

async fn open(address: &KernelAddress, timeout: Duration) -> Result<KernelFramed, TransportError> {
    let target = address.socket_target();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| TransportError::deadline_exceeded(format!("connect to {target} timed out")))?
        .map_err(|e| TransportError::unavailable(format!("connect to {target} failed: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("kernel_transport_nodelay_failed address={target} error={e}");
    }
    log::info!("kernel_transport_connected address={target}");
    Ok(Framed::new(stream, codec()))
}

async fn send_frame(framed: &mut KernelFramed, request: &WireRequest) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| TransportError::invalid_argument(format!("unencodable request: {e}")))?;
    framed
        .send(Bytes::from(payload))
        .await
        .map_err(|e| TransportError::unavailable(format!("write failed: {e}")))
}

/// Reads until the response for `id` arrives. Frames for other ids belong to
/// calls that were abandoned on timeout and are skipped.
async fn read_response(framed: &mut KernelFramed, id: u64) -> Result<WireResponse, TransportError> {
    loop {
        let frame = framed
            .next()
            .await
            .ok_or_else(|| TransportError::unavailable("kernel closed the connection"))?
            .map_err(|e| TransportError::unavailable(format!("read failed: {e}")))?;
        let response: WireResponse = serde_json::from_slice(&frame)
            .map_err(|e| TransportError::internal(format!("malformed response frame: {e}")))?;
        if response.id == id {
            return Ok(response);
        }
        log::warn!(
            "kernel_transport_stale_frame expected_id={id} got_id={}",
            response.id
        );
    }
}

async fn exchange(framed: &mut KernelFramed, request: &WireRequest) -> Result<WireResponse, TransportError> {
    send_frame(framed, request).await?;
    read_response(framed, request.id).await
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let connect = async {
            let mut slot = self.conn.lock().await;
            if slot.is_none() {
                *slot = Some(open(&self.address, self.timeout).await?);
            }
            Ok::<_, TransportError>(())
        };
        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| TransportError::deadline_exceeded("connect timed out"))?
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.conn.lock().await.take().is_some() {
            log::info!("kernel_transport_closed address={}", self.address);
        }
        Ok(())
    }

    async fn request(
        &self,
        namespace: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, TransportError> {
        let request = self.request_frame(namespace, method, args);
        // The connection is taken out of the slot for the exchange and put
        // back only on success. A call abandoned mid-exchange drops it.
        let call = async {
            let mut slot = self.conn.lock().await;
            let mut framed = match slot.take() {
                Some(framed) => framed,
                None => open(&self.address, self.timeout).await?,
            };
            let response = exchange(&mut framed, &request).await?;
            *slot = Some(framed);
            Ok::<_, TransportError>(response)
        };
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::deadline_exceeded(format!(
                "{namespace}.{method} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };
        outcome
            .map_err(|err| {
                log::warn!(
                    "kernel_transport_reset address={} method={method} error={err}",
                    self.address
                );
                err
            })?
            .into_result()
    }

    /// Each stream runs on a dedicated connection that closes when the stream
    /// ends or is dropped.
    async fn request_stream(
        &self,
        namespace: &str,
        method: &str,
        args: Value,
    ) -> Result<TransportStream, TransportError> {
        let request = self.request_frame(namespace, method, args);
        let start = async {
            let mut framed = open(&self.address, self.timeout).await?;
            send_frame(&mut framed, &request).await?;
            Ok::<_, TransportError>(framed)
        };
        let framed = match tokio::time::timeout(self.timeout, start).await {
            Ok(started) => started?,
            Err(_) => {
                return Err(TransportError::deadline_exceeded(format!(
                    "{namespace}.{method} stream request timed out"
                )))
            }
        };

        let timeout = self.timeout;
        let id = request.id;
        let items = stream::unfold(Some(framed), move |state| async move {
            let mut framed = state?;
            let next = match tokio::time::timeout(timeout, read_response(&mut framed, id)).await {
                Ok(next) => next,
                Err(_) => Err(TransportError::deadline_exceeded("stream item timed out")),
            };
            match next {
                Ok(response) if response.end => None,
                Ok(response) => match response.into_result() {
                    Ok(value) => Some((Ok(value), Some(framed))),
                    Err(err) => Some((Err(err), None)),
                },
                Err(err) => Some((Err(err), None)),
            }
        });
        Ok(items.boxed())
    }
}

/// Serves one kernel connection, dispatching each request frame to `backend`.
///
/// Used to expose the in-process kernel over TCP. Returns when the peer closes
/// the connection.
pub async fn serve_connection(
    stream: TcpStream,
    backend: Arc<dyn Transport>,
) -> Result<(), TransportError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut framed = Framed::new(stream, codec());
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| TransportError::unavailable(format!("read failed: {e}")))?;
        let response = match serde_json::from_slice::<WireRequest>(&frame) {
            Ok(request) => {
                match backend
                    .request(&request.namespace, &request.method, request.args)
                    .await
                {
                    Ok(result) => WireResponse::success(request.id, result),
                    Err(err) => WireResponse::failure(request.id, &err),
                }
            }
            Err(e) => {
                log::warn!("kernel_server_bad_frame peer={peer} error={e}");
                WireResponse::failure(
                    0,
                    &TransportError::invalid_argument(format!("malformed request frame: {e}")),
                )
            }
        };
        let payload = serde_json::to_vec(&response)
            .map_err(|e| TransportError::internal(format!("unencodable response: {e}")))?;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(|e| TransportError::unavailable(format!("write failed: {e}")))?;
    }
    log::debug!("kernel_server_peer_closed peer={peer}");
    Ok(())
}
