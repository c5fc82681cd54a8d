//! Bridge from the plugin-side logging convention into `tracing`.
//!
//! Plugins write one JSON object per line to stderr:
//!
//! ```text
//! {"@level":"info","@message":"flushed","@timestamp":"2024-01-01T00:00:00Z","count":"12"}
//! ```
//!
//! Arguments travel as a flat key/value list. A string value beginning
//! with [`STRUCTURED_PREFIX`] carries a JSON object that is attached as a
//! single structured field. Lines that are not JSON are logged verbatim at
//! debug level.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::Level;

/// Marks a string value as an embedded JSON object.
pub const STRUCTURED_PREFIX: &str = "\t\n";

/// Key used for a trailing argument with no partner.
pub const MISSING_KEY: &str = "EXTRA_VALUE_AT_END";

/// Dropped from the arguments; the host logger stamps its own time.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// `tracing` target for bridged plugin records.
pub const PLUGIN_TARGET: &str = "outplug::plugin";

/// Level names used on the plugin side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginLevel {
    /// No level given on the record.
    Unset,
    /// The logger's default level.
    Default,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl PluginLevel {
    /// Parse a level name; unknown names are treated as [`PluginLevel::Unset`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" => Self::Off,
            "default" => Self::Default,
            _ => Self::Unset,
        }
    }

    /// Host level for this record, or `None` when it must be discarded.
    pub fn host_level(self) -> Option<Level> {
        match self {
            Self::Trace | Self::Debug => Some(Level::DEBUG),
            Self::Warn => Some(Level::WARN),
            Self::Error => Some(Level::ERROR),
            Self::Info | Self::Default | Self::Unset => Some(Level::INFO),
            Self::Off => None,
        }
    }
}

/// Value of one attached field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Structured(Map<String, Value>),
}

impl FieldValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Structured(m) => Value::Object(m.clone()),
        }
    }
}

/// One bridged log call.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Name of the plugin the record came from.
    pub logger: String,
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, FieldValue)>,
}

impl LogRecord {
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Attached fields rendered as a JSON object.
    pub fn fields_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Where bridged records end up.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

/// Emits records as `tracing` events under [`PLUGIN_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let fields = record.fields_json();
        let plugin = record.logger.as_str();
        let message = record.message.as_str();
        match record.level {
            Level::ERROR => tracing::error!(target: PLUGIN_TARGET, plugin, %fields, "{message}"),
            Level::WARN => tracing::warn!(target: PLUGIN_TARGET, plugin, %fields, "{message}"),
            Level::INFO => tracing::info!(target: PLUGIN_TARGET, plugin, %fields, "{message}"),
            Level::DEBUG => tracing::debug!(target: PLUGIN_TARGET, plugin, %fields, "{message}"),
            _ => tracing::trace!(target: PLUGIN_TARGET, plugin, %fields, "{message}"),
        }
    }
}

/// Encode `value` so the host attaches it as one structured field.
pub fn encode_structured(value: &Map<String, Value>) -> String {
    format!("{STRUCTURED_PREFIX}{}", Value::Object(value.clone()))
}

/// Decode an embedded structured payload.
///
/// Returns `None` when `value` lacks [`STRUCTURED_PREFIX`] or the rest is
/// not a JSON object.
pub fn decode_structured(value: &str) -> Option<Map<String, Value>> {
    let payload = value.strip_prefix(STRUCTURED_PREFIX)?;
    serde_json::from_str::<Map<String, Value>>(payload).ok()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a flat key/value argument list into fields.
pub fn build_fields(args: &[Value]) -> Vec<(String, FieldValue)> {
    let mut fields = Vec::with_capacity(args.len() / 2 + 1);
    for chunk in args.chunks(2) {
        match chunk {
            [key, value] => {
                if key.as_str() == Some(TIMESTAMP_KEY) {
                    continue;
                }
                let value = match value {
                    Value::String(s) => decode_structured(s)
                        .map_or_else(|| FieldValue::Text(s.clone()), FieldValue::Structured),
                    other => FieldValue::Text(stringify(other)),
                };
                fields.push((stringify(key), value));
            }
            [extra] => fields.push((MISSING_KEY.to_string(), FieldValue::Text(stringify(extra)))),
            _ => {}
        }
    }
    fields
}

/// Adapter attached to one plugin's diagnostics.
#[derive(Clone)]
pub struct LogBridge {
    name: String,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for LogBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBridge").field("name", &self.name).finish()
    }
}

impl LogBridge {
    pub fn new(name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit one record built from a plugin log call.
    pub fn accept(&self, level: PluginLevel, message: &str, args: &[Value]) {
        let fields = build_fields(args);
        let Some(level) = level.host_level() else {
            return;
        };
        self.sink.emit(&LogRecord {
            logger: self.name.clone(),
            level,
            message: message.to_string(),
            fields,
        });
    }

    /// Emit one line read from the plugin's stderr.
    pub fn accept_line(&self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        let Ok(mut entry) = serde_json::from_str::<Map<String, Value>>(line) else {
            self.accept(PluginLevel::Debug, line, &[]);
            return;
        };

        let level = entry
            .remove("@level")
            .as_ref()
            .and_then(Value::as_str)
            .map_or(PluginLevel::Unset, PluginLevel::parse);
        let message = entry
            .remove("@message")
            .map(|m| stringify(&m))
            .unwrap_or_default();

        let mut args = Vec::with_capacity(entry.len() * 2 + 4);
        if let Some(ts) = entry.remove("@timestamp") {
            args.push(Value::String(TIMESTAMP_KEY.to_string()));
            args.push(ts);
        }
        if let Some(module) = entry.remove("@module") {
            args.push(Value::String("module".to_string()));
            args.push(module);
        }
        for (key, value) in entry {
            args.push(Value::String(key));
            args.push(value);
        }

        self.accept(level, &message, &args);
    }
}
