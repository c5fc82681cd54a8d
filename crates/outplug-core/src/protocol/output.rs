//! The `Output` trait -- the capability set every plugin endpoint exposes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Info, Metric, Params, Sample};

/// JSON-RPC "server error" code used for failures raised by the plugin
/// implementation itself.
pub const PLUGIN_FAILURE_CODE: i64 = -32000;

/// Errors returned by [`Output`] calls.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("plugin transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed plugin message: {0}")]
    Codec(String),

    #[error("connection to plugin closed")]
    Closed,

    #[error("plugin call cancelled")]
    Cancelled,
}

impl PluginError {
    /// A failure raised by a plugin implementation.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Rpc {
            code: PLUGIN_FAILURE_CODE,
            message: message.into(),
        }
    }
}

/// Lifecycle and streaming contract of an output plugin.
///
/// Call order: [`init`](Self::init) once, [`start`](Self::start) once, any
/// number of [`add_metrics`](Self::add_metrics) and
/// [`add_samples`](Self::add_samples), then [`stop`](Self::stop) once.
/// Every call carries a token the caller may cancel.
#[async_trait]
pub trait Output: Send + Sync {
    /// Establish identity and desired flush cadence.
    async fn init(&self, ctx: &CancellationToken, params: Params) -> Result<Info, PluginError>;

    /// The plugin must accept telemetry as soon as this returns `Ok`.
    async fn start(&self, ctx: &CancellationToken) -> Result<(), PluginError>;

    async fn stop(&self, ctx: &CancellationToken) -> Result<(), PluginError>;

    /// Announce metric definitions not announced before.
    async fn add_metrics(&self, ctx: &CancellationToken, metrics: Vec<Metric>)
    -> Result<(), PluginError>;

    async fn add_samples(&self, ctx: &CancellationToken, samples: Vec<Sample>)
    -> Result<(), PluginError>;
}

// Compile-time assertion: Output must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Output) {}
};
