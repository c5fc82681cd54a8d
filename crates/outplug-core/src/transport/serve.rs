//! Plugin side of the transport: announce a handshake, then answer
//! requests by dispatching to an [`Output`] implementation.

use std::io::Write as _;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::rpc::{INVALID_PARAMS, METHOD_NOT_FOUND, RpcRequest, RpcResponse, codec};
use super::{
    ENV_PROTOCOL_VERSIONS, ENV_TRANSPORTS, HANDSHAKE, HandshakeConfig, HandshakeLine, Network,
    Transport,
};
use crate::logbridge::encode_structured;
use crate::protocol::output::PLUGIN_FAILURE_CODE;
use crate::protocol::{
    DispenseRequest, DispenseResponse, METHOD_ADD_METRICS, METHOD_ADD_SAMPLES, METHOD_DISPENSE,
    METHOD_INIT, METHOD_START, METHOD_STOP, OUTPUT_METHODS, Output, Params, PluginError,
    SERVICE_NAME,
};

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub transport: Transport,
    pub handshake: HandshakeConfig,
    /// Methods advertised in the dispense response.
    pub capabilities: Vec<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            transport: Transport::JsonRpc,
            handshake: HANDSHAKE,
            capabilities: OUTPUT_METHODS.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("this binary is an output plugin; it must be launched by the host")]
    NotLaunchedByHost,

    #[error("host does not accept transport {0}")]
    TransportRejected(Transport),

    #[error("host does not accept protocol version {0}")]
    VersionRejected(u32),

    #[error("transport error: {0}")]
    Transport(#[from] LinesCodecError),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Check the host-provided environment before announcing anything.
pub fn check_environment(
    options: &ServeOptions,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ServeError> {
    let cookie = lookup(options.handshake.magic_cookie_key);
    if cookie.as_deref() != Some(options.handshake.magic_cookie_value) {
        return Err(ServeError::NotLaunchedByHost);
    }

    if let Some(versions) = lookup(ENV_PROTOCOL_VERSIONS) {
        let version = options.handshake.protocol_version;
        let accepted = versions
            .split(',')
            .any(|v| v.trim().parse::<u32>().ok() == Some(version));
        if !accepted {
            return Err(ServeError::VersionRejected(version));
        }
    }

    if let Some(transports) = lookup(ENV_TRANSPORTS) {
        let transport = options.transport;
        if !transports.split(',').any(|t| t.trim() == transport.as_str()) {
            return Err(ServeError::TransportRejected(transport));
        }
    }

    Ok(())
}

async fn announce(line: &HandshakeLine) -> Result<(), ServeError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Run `output` as a plugin process until the host stops it or hangs up.
pub async fn serve<O: Output + 'static>(output: O, options: ServeOptions) -> Result<(), ServeError> {
    check_environment(&options, |key| std::env::var(key).ok())?;
    let app_version = options.handshake.protocol_version;

    match options.transport {
        Transport::Stdio => {
            announce(&HandshakeLine {
                app_version,
                network: Network::Stdio,
                address: "-".to_string(),
                transport: Transport::Stdio,
            })
            .await?;
            serve_connection(
                FramedRead::new(tokio::io::stdin(), codec()),
                tokio::io::stdout(),
                &output,
                &options.capabilities,
            )
            .await
        }
        Transport::JsonRpc => {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            announce(&HandshakeLine {
                app_version,
                network: Network::Tcp,
                address: listener.local_addr()?.to_string(),
                transport: Transport::JsonRpc,
            })
            .await?;
            let (stream, _) = listener.accept().await?;
            let (read, write) = stream.into_split();
            serve_connection(
                FramedRead::new(read, codec()),
                write,
                &output,
                &options.capabilities,
            )
            .await
        }
    }
}

/// Answer requests on one connection until it closes or a successful
/// `Stop` has been acknowledged.
pub async fn serve_connection<R, W, O>(
    mut requests: FramedRead<R, LinesCodec>,
    writer: W,
    output: &O,
    capabilities: &[String],
) -> Result<(), ServeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: Output + ?Sized,
{
    let mut responses = FramedWrite::new(writer, codec());
    let ctx = CancellationToken::new();

    while let Some(line) = requests.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                PluginLogger::new().log("warn", "dropping malformed request", &[(
                    "error",
                    Value::String(e.to_string()),
                )]);
                continue;
            }
        };

        let stopping = request.method == METHOD_STOP;
        let response = dispatch(output, &ctx, capabilities, request).await;
        let acknowledged = response.error.is_none();
        responses.send(serde_json::to_string(&response)?).await?;

        if stopping && acknowledged {
            break;
        }
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, PluginError> {
    serde_json::from_value(params).map_err(|e| PluginError::Rpc {
        code: INVALID_PARAMS,
        message: e.to_string(),
    })
}

fn encode<T: Serialize>(value: T) -> Result<Value, PluginError> {
    serde_json::to_value(value).map_err(|e| PluginError::Codec(e.to_string()))
}

async fn invoke<O: Output + ?Sized>(
    output: &O,
    ctx: &CancellationToken,
    method: &str,
    params: Value,
) -> Result<Value, PluginError> {
    match method {
        METHOD_INIT => encode(output.init(ctx, decode::<Params>(params)?).await?),
        METHOD_START => output.start(ctx).await.map(|()| Value::Null),
        METHOD_STOP => output.stop(ctx).await.map(|()| Value::Null),
        METHOD_ADD_METRICS => output
            .add_metrics(ctx, decode(params)?)
            .await
            .map(|()| Value::Null),
        METHOD_ADD_SAMPLES => output
            .add_samples(ctx, decode(params)?)
            .await
            .map(|()| Value::Null),
        other => Err(PluginError::Rpc {
            code: METHOD_NOT_FOUND,
            message: format!("method {other} not found"),
        }),
    }
}

async fn dispatch<O: Output + ?Sized>(
    output: &O,
    ctx: &CancellationToken,
    capabilities: &[String],
    request: RpcRequest,
) -> RpcResponse {
    let RpcRequest {
        id, method, params, ..
    } = request;

    let result: Result<Value, PluginError> = if method == METHOD_DISPENSE {
        decode::<DispenseRequest>(params).and_then(|req| {
            if req.name == SERVICE_NAME {
                encode(DispenseResponse {
                    methods: capabilities.to_vec(),
                })
            } else {
                Err(PluginError::Rpc {
                    code: METHOD_NOT_FOUND,
                    message: format!("unknown service {:?}", req.name),
                })
            }
        })
    } else if !capabilities.iter().any(|m| *m == method) {
        Err(PluginError::Rpc {
            code: METHOD_NOT_FOUND,
            message: format!("method {method} not found"),
        })
    } else {
        invoke(output, ctx, &method, params).await
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(PluginError::Rpc { code, message }) => RpcResponse::failure(id, code, message),
        Err(other) => RpcResponse::failure(id, PLUGIN_FAILURE_CODE, other.to_string()),
    }
}

/// Writes log records to stderr in the format the host bridges.
#[derive(Debug, Clone, Default)]
pub struct PluginLogger {
    module: Option<String>,
}

impl PluginLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
        }
    }

    /// Render one record as a JSON line (without the newline).
    pub fn line(&self, level: &str, message: &str, fields: &[(&str, Value)]) -> String {
        let mut entry = Map::new();
        entry.insert("@level".to_string(), Value::String(level.to_string()));
        entry.insert("@message".to_string(), Value::String(message.to_string()));
        entry.insert(
            "@timestamp".to_string(),
            Value::String(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
        );
        if let Some(module) = &self.module {
            entry.insert("@module".to_string(), Value::String(module.clone()));
        }
        for (key, value) in fields {
            let value = match value {
                Value::Object(map) => Value::String(encode_structured(map)),
                other => other.clone(),
            };
            entry.insert((*key).to_string(), value);
        }
        Value::Object(entry).to_string()
    }

    pub fn log(&self, level: &str, message: &str, fields: &[(&str, Value)]) {
        let line = self.line(level, message, fields);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }

    pub fn debug(&self, message: &str, fields: &[(&str, Value)]) {
        self.log("debug", message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, Value)]) {
        self.log("info", message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, Value)]) {
        self.log("warn", message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, Value)]) {
        self.log("error", message, fields);
    }
}
