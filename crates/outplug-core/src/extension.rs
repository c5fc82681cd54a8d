//! The harness-facing output that delivers telemetry to a plugin.
//!
//! [`Extension`] owns the plugin process, the sample buffer, the metric
//! registry and the flush scheduler, and drives the plugin through
//! `init -> start -> (add_metrics | add_samples)* -> stop`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::SampleBuffer;
use crate::config::{ConfigError, ExtensionConfig};
use crate::dedup::MetricRegistry;
use crate::flusher::{FlusherError, PeriodicFlusher};
use crate::harness::{
    HarnessOutput, OutputFactory, OutputParams, SampleContainer, Thresholds,
};
use crate::launcher::{LaunchError, PluginHandle, launch};
use crate::protocol::mapping::{MappingError, map_sample, verify_kind_cardinality};
use crate::protocol::{Info, Output, Params, PluginError};

/// Where an [`Extension`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("plugin init failed: {0}")]
    Init(#[source] PluginError),

    #[error("plugin start failed: {0}")]
    Start(#[source] PluginError),

    #[error("plugin stop failed: {0}")]
    Stop(#[source] PluginError),

    #[error("cannot schedule flushes: {0}")]
    Flusher(#[from] FlusherError),

    #[error("cannot {operation} an output that is {state}")]
    InvalidState {
        operation: &'static str,
        state: Lifecycle,
    },
}

/// State reached by both the harness-facing methods and the flusher task.
struct Shared {
    id: Uuid,
    output: Arc<dyn Output>,
    buffer: SampleBuffer,
    registry: Mutex<MetricRegistry>,
    cancel: CancellationToken,
}

impl Shared {
    /// Drain the buffer and deliver it: new definitions first, then every
    /// sample. Failures are logged and the batch is not retried.
    async fn flush(&self) {
        let batches = self.buffer.drain();

        let (metrics, samples) = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let mut metrics = Vec::new();
            let mut samples = Vec::with_capacity(batches.iter().map(Vec::len).sum());
            for sample in batches.iter().flatten() {
                if let Some(metric) = registry.resolve(sample) {
                    metrics.push(metric);
                }
                samples.push(map_sample(sample));
            }
            (metrics, samples)
        };

        if !metrics.is_empty() {
            let count = metrics.len();
            if let Err(e) = self.output.add_metrics(&self.cancel, metrics).await {
                warn!(extension = %self.id, count, error = %e, "failed to send metric definitions");
            }
        }

        let count = samples.len();
        if let Err(e) = self.output.add_samples(&self.cancel, samples).await {
            warn!(extension = %self.id, count, error = %e, "failed to send samples");
        }
    }
}

/// Output that buffers harness telemetry and forwards it to a plugin.
pub struct Extension {
    shared: Arc<Shared>,
    info: Info,
    config: ExtensionConfig,
    state: Lifecycle,
    flusher: Option<PeriodicFlusher>,
    handle: Option<PluginHandle>,
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("id", &self.shared.id)
            .field("info", &self.info)
            .field("state", &self.state)
            .field("plugin", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Extension {
    /// Launch the plugin named by `params.config_argument` and initialize
    /// it. The returned extension is ready to [`start`](Self::start).
    pub async fn new(params: OutputParams) -> Result<Self, ExtensionError> {
        verify_kind_cardinality(params.kind_cardinality)?;
        let config = ExtensionConfig::resolve(&params.environment)?;

        let handle = launch(
            &params.config_argument,
            Arc::clone(&params.logger),
            &config.launch_options(),
        )
        .await?;
        info!(plugin = handle.name(), pid = ?handle.pid(), "output plugin launched");

        let output = handle.output();
        let cancel = CancellationToken::new();
        let init = output
            .init(
                &cancel,
                Params {
                    environment: params.environment,
                },
            )
            .await;

        match init {
            Ok(info) => Ok(Self::assemble(output, info, config, cancel, Some(handle))),
            Err(e) => {
                handle.shutdown(config.stop_grace()).await;
                Err(ExtensionError::Init(e))
            }
        }
    }

    /// Wrap an already-connected plugin endpoint and initialize it.
    pub async fn with_output(
        output: Arc<dyn Output>,
        environment: HashMap<String, String>,
        config: ExtensionConfig,
    ) -> Result<Self, ExtensionError> {
        let cancel = CancellationToken::new();
        let info = output
            .init(&cancel, Params { environment })
            .await
            .map_err(ExtensionError::Init)?;
        Ok(Self::assemble(output, info, config, cancel, None))
    }

    fn assemble(
        output: Arc<dyn Output>,
        info: Info,
        config: ExtensionConfig,
        cancel: CancellationToken,
        handle: Option<PluginHandle>,
    ) -> Self {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            output,
            buffer: SampleBuffer::new(),
            registry: Mutex::new(MetricRegistry::new()),
            cancel,
        });
        debug!(
            extension = %shared.id,
            description = %info.description,
            buffering_ms = info.buffering,
            "output plugin initialized"
        );
        Self {
            shared,
            info,
            config,
            state: Lifecycle::Initialized,
            flusher: None,
            handle,
        }
    }

    pub fn description(&self) -> &str {
        &self.info.description
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn set_thresholds(&self, thresholds: HashMap<String, Thresholds>) {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_thresholds(thresholds);
    }

    /// Buffer sample batches for the next flush. Never waits on the plugin.
    pub fn add_samples(&self, batches: Vec<SampleContainer>) {
        self.shared.buffer.add(batches);
    }

    /// Run one flush cycle immediately.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Start the plugin, then the periodic flusher.
    pub async fn start(&mut self) -> Result<(), ExtensionError> {
        if self.state != Lifecycle::Initialized {
            return Err(ExtensionError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        let buffering = self.config.buffering_period(self.info.buffering);
        if buffering.period.is_zero() {
            return Err(FlusherError::ZeroPeriod.into());
        }
        if buffering.below_floor {
            warn!(
                extension = %self.shared.id,
                requested = ?buffering.period,
                minimum_ms = self.config.min_buffering_ms,
                "requested buffering period is below the recommended minimum"
            );
        }

        self.shared
            .output
            .start(&self.shared.cancel)
            .await
            .map_err(ExtensionError::Start)?;

        let shared = Arc::clone(&self.shared);
        let flusher = PeriodicFlusher::start(buffering.period, move || {
            let shared = Arc::clone(&shared);
            async move { shared.flush().await }
        })?;
        info!(
            extension = %self.shared.id,
            period = ?flusher.period(),
            "output plugin started"
        );
        self.flusher = Some(flusher);
        self.state = Lifecycle::Running;
        Ok(())
    }

    /// Stop flushing, stop the plugin and release its process.
    ///
    /// Samples buffered since the last flush are discarded unless
    /// `flush_on_stop` is set.
    pub async fn stop(&mut self) -> Result<(), ExtensionError> {
        if self.state != Lifecycle::Running {
            return Err(ExtensionError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.state = Lifecycle::Stopped;

        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop().await;
        }

        if self.config.flush_on_stop && !self.shared.buffer.is_empty() {
            self.shared.flush().await;
        } else {
            let dropped: usize = self.shared.buffer.drain().iter().map(Vec::len).sum();
            if dropped > 0 {
                debug!(extension = %self.shared.id, dropped, "discarding samples buffered since the last flush");
            }
        }

        let stopped = self.shared.output.stop(&self.shared.cancel).await;
        self.shared.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            handle.shutdown(self.config.stop_grace()).await;
        }

        info!(extension = %self.shared.id, "output plugin stopped");
        stopped.map_err(ExtensionError::Stop)
    }
}

#[async_trait]
impl HarnessOutput for Extension {
    fn description(&self) -> String {
        self.info.description.clone()
    }

    fn set_thresholds(&self, thresholds: HashMap<String, Thresholds>) {
        Extension::set_thresholds(self, thresholds);
    }

    async fn start(&mut self) -> Result<()> {
        Ok(Extension::start(self).await?)
    }

    fn add_metric_samples(&self, samples: Vec<SampleContainer>) {
        self.add_samples(samples);
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(Extension::stop(self).await?)
    }
}

/// Factory registered under `"plugin"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginOutputFactory;

#[async_trait]
impl OutputFactory for PluginOutputFactory {
    fn name(&self) -> &str {
        "plugin"
    }

    async fn create(&self, params: OutputParams) -> Result<Box<dyn HarnessOutput>> {
        Ok(Box::new(Extension::new(params).await?))
    }
}
