//! Host side of the JSON-RPC transport.
//!
//! [`RpcClient`] multiplexes requests over one line-delimited stream; a
//! background task routes responses back to callers by request id.
//! [`RpcClient::negotiate`] turns the raw connection into a typed
//! [`RpcOutput`] or fails with a typed [`NegotiateError`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    DispenseRequest, DispenseResponse, Info, METHOD_ADD_METRICS, METHOD_ADD_SAMPLES,
    METHOD_DISPENSE, METHOD_INIT, METHOD_START, METHOD_STOP, Metric, OUTPUT_METHODS, Output,
    Params, PluginError, Sample,
};

/// Upper bound for a single framed message.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Line codec shared by both ends of the transport.
pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    fn into_result(self) -> Result<Value, PluginError> {
        match self.error {
            Some(RpcErrorObject { code, message }) => Err(PluginError::Rpc { code, message }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

pub(crate) fn codec_error(e: LinesCodecError) -> PluginError {
    match e {
        LinesCodecError::Io(e) => PluginError::Transport(e),
        LinesCodecError::MaxLineLengthExceeded => {
            PluginError::Codec(format!("message exceeds {MAX_LINE_LENGTH} bytes"))
        }
    }
}

type Reply = oneshot::Sender<Result<Value, PluginError>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared with the response reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Reply>>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: u64) -> Option<Reply> {
        self.pending().remove(&id)
    }

    /// Mark the connection dead and fail every outstanding call.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waiting: Vec<Reply> = self.pending().drain().map(|(_, tx)| tx).collect();
        for tx in waiting {
            let _ = tx.send(Err(PluginError::Closed));
        }
    }
}

async fn read_responses<R>(mut lines: FramedRead<R, LinesCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "error reading from plugin transport");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<RpcResponse>(trimmed) {
            Ok(response) => match shared.take(response.id) {
                Some(tx) => {
                    let _ = tx.send(response.into_result());
                }
                None => debug!(id = response.id, "response for unknown or abandoned request"),
            },
            Err(e) => warn!(error = %e, "skipping malformed response from plugin"),
        }
    }
    shared.close();
}

/// JSON-RPC client over one plugin connection.
pub struct RpcClient {
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, LinesCodec>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Start a client over an established connection. Must be called from
    /// within a tokio runtime.
    pub fn new<R, W>(reader: FramedRead<R, LinesCodec>, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_responses(reader, Arc::clone(&shared)));
        let writer: BoxedWriter = Box::new(writer);
        Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, codec())),
            shared,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// `true` once the plugin side of the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Issue one request and wait for its response or for `ctx` to be
    /// cancelled.
    pub async fn call(
        &self,
        ctx: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value, PluginError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| PluginError::Codec(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        if self.is_closed() {
            self.shared.take(id);
            return Err(PluginError::Closed);
        }

        // A started write is never abandoned; a torn line would corrupt
        // the framing for every later call.
        let sent = {
            let mut writer = tokio::select! {
                writer = self.writer.lock() => writer,
                () = ctx.cancelled() => {
                    self.shared.take(id);
                    return Err(PluginError::Cancelled);
                }
            };
            writer.send(line).await.map_err(codec_error)
        };
        if let Err(e) = sent {
            self.shared.take(id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(PluginError::Closed)),
            () = ctx.cancelled() => {
                self.shared.take(id);
                Err(PluginError::Cancelled)
            }
        }
    }

    /// [`call`](Self::call) with typed parameters and result.
    pub async fn call_typed<P, T>(
        &self,
        ctx: &CancellationToken,
        method: &str,
        params: &P,
    ) -> Result<T, PluginError>
    where
        P: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| PluginError::Codec(e.to_string()))?;
        let result = self.call(ctx, method, params).await?;
        serde_json::from_value(result).map_err(|e| PluginError::Codec(e.to_string()))
    }

    /// [`call`](Self::call) for methods whose result carries no data.
    pub async fn call_unit<P>(
        &self,
        ctx: &CancellationToken,
        method: &str,
        params: &P,
    ) -> Result<(), PluginError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let params = serde_json::to_value(params).map_err(|e| PluginError::Codec(e.to_string()))?;
        self.call(ctx, method, params).await.map(drop)
    }

    /// Request `service` and check that it implements every [`Output`]
    /// method.
    pub async fn negotiate(
        self: Arc<Self>,
        ctx: &CancellationToken,
        service: &str,
    ) -> Result<RpcOutput, NegotiateError> {
        let request = DispenseRequest {
            name: service.to_string(),
        };
        let response: DispenseResponse = self
            .call_typed(ctx, METHOD_DISPENSE, &request)
            .await
            .map_err(NegotiateError::Dispense)?;

        let missing: Vec<String> = OUTPUT_METHODS
            .iter()
            .filter(|method| !response.methods.iter().any(|m| m == *method))
            .map(|method| (*method).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(NegotiateError::MissingCapabilities {
                service: service.to_string(),
                missing,
            });
        }

        Ok(RpcOutput { client: self })
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    #[error("failed to dispense plugin service: {0}")]
    Dispense(#[source] PluginError),

    #[error("service {service:?} does not implement {}", missing.join(", "))]
    MissingCapabilities { service: String, missing: Vec<String> },
}

/// [`Output`] implemented by remote calls to the plugin.
#[derive(Debug, Clone)]
pub struct RpcOutput {
    client: Arc<RpcClient>,
}

#[async_trait]
impl Output for RpcOutput {
    async fn init(&self, ctx: &CancellationToken, params: Params) -> Result<Info, PluginError> {
        self.client.call_typed(ctx, METHOD_INIT, &params).await
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<(), PluginError> {
        self.client.call_unit(ctx, METHOD_START, &Value::Null).await
    }

    async fn stop(&self, ctx: &CancellationToken) -> Result<(), PluginError> {
        self.client.call_unit(ctx, METHOD_STOP, &Value::Null).await
    }

    async fn add_metrics(
        &self,
        ctx: &CancellationToken,
        metrics: Vec<Metric>,
    ) -> Result<(), PluginError> {
        self.client.call_unit(ctx, METHOD_ADD_METRICS, &metrics).await
    }

    async fn add_samples(
        &self,
        ctx: &CancellationToken,
        samples: Vec<Sample>,
    ) -> Result<(), PluginError> {
        self.client.call_unit(ctx, METHOD_ADD_SAMPLES, &samples).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::protocol::{MetricType, ValueType};
    use crate::transport::serve::serve_connection;

    /// In-memory plugin recording the methods it was asked to run.
    #[derive(Default)]
    struct EchoOutput {
        calls: StdMutex<Vec<String>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Output for EchoOutput {
        async fn init(&self, _ctx: &CancellationToken, params: Params) -> Result<Info, PluginError> {
            self.calls.lock().unwrap().push("init".to_string());
            Ok(Info {
                description: format!("echo ({} vars)", params.environment.len()),
                buffering: 250,
            })
        }

        async fn start(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push("start".to_string());
            if self.fail_start {
                return Err(PluginError::failed("refusing to start"));
            }
            Ok(())
        }

        async fn stop(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        async fn add_metrics(
            &self,
            _ctx: &CancellationToken,
            metrics: Vec<Metric>,
        ) -> Result<(), PluginError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("metrics:{}", metrics.len()));
            Ok(())
        }

        async fn add_samples(
            &self,
            _ctx: &CancellationToken,
            samples: Vec<Sample>,
        ) -> Result<(), PluginError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("samples:{}", samples.len()));
            Ok(())
        }
    }

    /// Connect a client to `output` served over an in-memory pipe.
    fn connect(output: Arc<EchoOutput>, capabilities: Vec<String>) -> Arc<RpcClient> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        tokio::spawn(async move {
            let _ = serve_connection(
                FramedRead::new(server_read, codec()),
                server_write,
                output.as_ref(),
                &capabilities,
            )
            .await;
        });

        Arc::new(RpcClient::new(FramedRead::new(client_read, codec()), client_write))
    }

    fn all_methods() -> Vec<String> {
        OUTPUT_METHODS.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn response_into_result_maps_error_object() {
        let err = RpcResponse::failure(3, METHOD_NOT_FOUND, "nope")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, PluginError::Rpc { code: METHOD_NOT_FOUND, .. }));
    }

    #[test]
    fn response_without_result_is_null() {
        let response: RpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn negotiate_and_drive_full_lifecycle() {
        let plugin = Arc::new(EchoOutput::default());
        let client = connect(Arc::clone(&plugin), all_methods());
        let ctx = CancellationToken::new();

        let output = client.negotiate(&ctx, "output").await.unwrap();

        let info = output
            .init(
                &ctx,
                Params {
                    environment: HashMap::from([("A".to_string(), "1".to_string())]),
                },
            )
            .await
            .unwrap();
        assert_eq!(info.description, "echo (1 vars)");
        assert_eq!(info.buffering, 250);

        output.start(&ctx).await.unwrap();
        output
            .add_metrics(
                &ctx,
                vec![Metric {
                    name: "vus".to_string(),
                    metric_type: MetricType::Gauge,
                    contains: ValueType::Default,
                    ..Metric::default()
                }],
            )
            .await
            .unwrap();
        output
            .add_samples(&ctx, vec![Sample::default(), Sample::default()])
            .await
            .unwrap();
        output.stop(&ctx).await.unwrap();

        assert_eq!(
            *plugin.calls.lock().unwrap(),
            vec!["init", "start", "metrics:1", "samples:2", "stop"]
        );
    }

    #[tokio::test]
    async fn negotiate_reports_missing_capabilities() {
        let plugin = Arc::new(EchoOutput::default());
        let capabilities = vec![METHOD_INIT.to_string(), METHOD_START.to_string()];
        let client = connect(plugin, capabilities);

        let err = client
            .negotiate(&CancellationToken::new(), "output")
            .await
            .unwrap_err();
        match err {
            NegotiateError::MissingCapabilities { service, missing } => {
                assert_eq!(service, "output");
                assert_eq!(
                    missing,
                    vec![METHOD_STOP, METHOD_ADD_METRICS, METHOD_ADD_SAMPLES]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn negotiate_unknown_service_fails_dispense() {
        let client = connect(Arc::new(EchoOutput::default()), all_methods());
        let err = client
            .negotiate(&CancellationToken::new(), "input")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiateError::Dispense(PluginError::Rpc { code: METHOD_NOT_FOUND, .. })
        ));
    }

    #[tokio::test]
    async fn plugin_errors_propagate_with_message() {
        let plugin = Arc::new(EchoOutput {
            fail_start: true,
            ..EchoOutput::default()
        });
        let client = connect(plugin, all_methods());
        let ctx = CancellationToken::new();
        let output = client.negotiate(&ctx, "output").await.unwrap();

        match output.start(&ctx).await.unwrap_err() {
            PluginError::Rpc { message, .. } => assert_eq!(message, "refusing to start"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled() {
        // A peer that reads requests but never answers.
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let _server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_io).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        let client = RpcClient::new(FramedRead::new(client_read, codec()), client_write);

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = client.call(&ctx, METHOD_START, Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));
    }

    #[tokio::test]
    async fn peer_disconnect_fails_pending_and_later_calls() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server_io);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            // Dropping the stream closes the connection without answering.
        });
        let client = RpcClient::new(FramedRead::new(client_read, codec()), client_write);
        let ctx = CancellationToken::new();

        let err = client.call(&ctx, METHOD_START, Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::Closed), "{err}");
        server.await.unwrap();

        assert!(client.is_closed());
        let err = client.call(&ctx, METHOD_STOP, Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::Closed | PluginError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_response_lines_are_skipped() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_io);
            let mut lines = BufReader::new(read).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let request: RpcRequest = serde_json::from_str(&line).unwrap();
                write.write_all(b"this is not json\n").await.unwrap();
                let reply = serde_json::to_string(&RpcResponse::success(
                    request.id,
                    json!({"description": "late", "buffering": 0}),
                ))
                .unwrap();
                write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
            // Keep the connection open until the test finishes.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let client = RpcClient::new(FramedRead::new(client_read, codec()), client_write);

        let info: Info = client
            .call_typed(&CancellationToken::new(), METHOD_INIT, &Params::default())
            .await
            .unwrap();
        assert_eq!(info.description, "late");
    }
}
