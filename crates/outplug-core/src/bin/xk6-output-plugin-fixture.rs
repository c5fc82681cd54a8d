//! Configurable output plugin used by the integration tests.
//!
//! Every call it receives can be appended to a JSON-lines file with
//! `--record`, and individual methods can be made to fail or disappear
//! from the advertised capability list.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use outplug_core::protocol::{Info, Metric, OUTPUT_METHODS, Output, Params, PluginError, Sample};
use outplug_core::transport::{PluginLogger, ServeOptions, Transport, serve};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Jsonrpc,
    Stdio,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Jsonrpc => Transport::JsonRpc,
            TransportArg::Stdio => Transport::Stdio,
        }
    }
}

#[derive(Parser)]
#[command(name = "xk6-output-plugin-fixture", about = "Output plugin for exercising the host")]
struct Cli {
    /// Transport announced in the handshake
    #[arg(long, value_enum, default_value_t = TransportArg::Jsonrpc)]
    transport: TransportArg,
    /// Description returned from init
    #[arg(long, default_value = "fixture")]
    description: String,
    /// Requested buffering period in milliseconds (0 = host default)
    #[arg(long, default_value_t = 0)]
    buffering: u32,
    /// Append every received call to this file as JSON lines
    #[arg(long)]
    record: Option<PathBuf>,
    #[arg(long)]
    fail_init: bool,
    #[arg(long)]
    fail_add_metrics: bool,
    #[arg(long)]
    fail_add_samples: bool,
    /// Leave a method out of the advertised capabilities
    #[arg(long, value_name = "METHOD")]
    omit: Vec<String>,
    /// Print garbage instead of a handshake
    #[arg(long)]
    bad_handshake: bool,
}

#[derive(Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum Recorded<'a> {
    Init {
        environment: &'a HashMap<String, String>,
    },
    Start,
    Stop,
    AddMetrics {
        metrics: &'a [Metric],
    },
    AddSamples {
        samples: &'a [Sample],
    },
}

struct Recorder(Option<Mutex<File>>);

impl Recorder {
    fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self(None));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open record file {}", path.display()))?;
        Ok(Self(Some(Mutex::new(file))))
    }

    fn record(&self, call: &Recorded<'_>) -> Result<(), PluginError> {
        let Some(file) = &self.0 else {
            return Ok(());
        };
        let line = serde_json::to_string(call).map_err(|e| PluginError::Codec(e.to_string()))?;
        let mut file = file.lock().map_err(|_| PluginError::failed("record file poisoned"))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

struct Fixture {
    cli: Cli,
    recorder: Recorder,
    log: PluginLogger,
}

#[async_trait]
impl Output for Fixture {
    async fn init(&self, _ctx: &CancellationToken, params: Params) -> Result<Info, PluginError> {
        self.recorder.record(&Recorded::Init {
            environment: &params.environment,
        })?;
        if self.cli.fail_init {
            self.log.error("refusing to initialize", &[]);
            return Err(PluginError::failed("init rejected by fixture"));
        }
        self.log.info(
            "initialized",
            &[
                ("timestamp", json!("2024-01-01T00:00:00Z")),
                (
                    "settings",
                    json!({"buffering": self.cli.buffering, "description": self.cli.description}),
                ),
                ("variables", json!(params.environment.len())),
            ],
        );
        Ok(Info {
            description: self.cli.description.clone(),
            buffering: self.cli.buffering,
        })
    }

    async fn start(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
        self.recorder.record(&Recorded::Start)?;
        self.log.debug("started", &[]);
        Ok(())
    }

    async fn stop(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
        self.recorder.record(&Recorded::Stop)?;
        self.log.info("stopped", &[]);
        Ok(())
    }

    async fn add_metrics(
        &self,
        _ctx: &CancellationToken,
        metrics: Vec<Metric>,
    ) -> Result<(), PluginError> {
        self.recorder.record(&Recorded::AddMetrics { metrics: &metrics })?;
        if self.cli.fail_add_metrics {
            return Err(PluginError::failed("metric sink unavailable"));
        }
        Ok(())
    }

    async fn add_samples(
        &self,
        _ctx: &CancellationToken,
        samples: Vec<Sample>,
    ) -> Result<(), PluginError> {
        self.recorder.record(&Recorded::AddSamples { samples: &samples })?;
        if self.cli.fail_add_samples {
            return Err(PluginError::failed("sample sink unavailable"));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.bad_handshake {
        println!("this is not a handshake");
        tokio::time::sleep(Duration::from_secs(30)).await;
        return Ok(());
    }

    let capabilities = OUTPUT_METHODS
        .iter()
        .filter(|method| !cli.omit.iter().any(|omitted| omitted == *method))
        .map(|method| (*method).to_string())
        .collect();
    let options = ServeOptions {
        transport: cli.transport.into(),
        capabilities,
        ..ServeOptions::default()
    };

    let recorder = Recorder::open(cli.record.as_deref())?;
    let fixture = Fixture {
        cli,
        recorder,
        log: PluginLogger::named("fixture"),
    };
    serve(fixture, options).await.context("plugin terminated with an error")?;
    Ok(())
}
