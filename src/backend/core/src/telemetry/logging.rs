//! `tracing` subscriber setup and PII masking.
//!
//! Collaborator error bodies and notification text can carry a candidate's
//! contact details, so they go through [`SensitiveFieldRedactor::global`]
//! before being logged or stored.

use serde::Deserialize;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

const EMAIL: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const PHONE: &str = r"\+?\d[\d\s().-]{8,}\d";
const BEARER: &str = r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Multi-line, coloured
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base `EnvFilter` directive, e.g. `info` or `warn,autoapply_core=debug`
    pub level: String,
    pub format: LogFormat,
    /// Extra directives such as `sqlx=warn`, applied after `level`
    pub directives: Vec<String>,
    pub show_location: bool,
    pub show_target: bool,
    /// Emit an event when a span closes, with busy and idle time
    pub span_timings: bool,
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            format: LogFormat::Json,
            directives: vec!["sqlx=warn".into(), "hyper=warn".into()],
            show_location: false,
            show_target: true,
            span_timings: false,
            redaction: RedactionConfig::default(),
        }
    }
}

/// What counts as sensitive.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub mask: String,
    /// A field whose name contains one of these (case-insensitive) is masked whole
    pub sensitive_fields: Vec<String>,
    /// Regexes whose matches are masked inside any value
    pub value_patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mask: "[REDACTED]".into(),
            sensitive_fields: ["email", "phone", "mobile", "password", "secret", "token", "authorization", "api_key"]
                .into_iter()
                .map(String::from)
                .collect(),
            value_patterns: vec![EMAIL.into(), PHONE.into(), BEARER.into()],
        }
    }
}

/// Compiled form of a [`RedactionConfig`].
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    enabled: bool,
    mask: String,
    sensitive_fields: Vec<String>,
    patterns: Vec<regex::Regex>,
}

impl SensitiveFieldRedactor {
    /// Patterns that fail to compile are dropped with a warning.
    pub fn new(config: &RedactionConfig) -> Self {
        let patterns = config
            .value_patterns
            .iter()
            .filter_map(|source| match regex::Regex::new(source) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(pattern = %source, error = %e, "Skipping invalid redaction pattern");
                    None
                }
            })
            .collect();

        Self {
            enabled: config.enabled,
            mask: config.mask.clone(),
            sensitive_fields: config.sensitive_fields.iter().map(|f| f.to_lowercase()).collect(),
            patterns,
        }
    }

    /// The redactor installed by [`init_logging`], or the default one.
    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }

    pub fn should_redact_field(&self, field_name: &str) -> bool {
        let name = field_name.to_lowercase();
        self.enabled && self.sensitive_fields.iter().any(|f| name.contains(f.as_str()))
    }

    pub fn redact_value(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_owned();
        }
        let mut out = value.to_owned();
        for regex in &self.patterns {
            if regex.is_match(&out) {
                out = regex.replace_all(&out, self.mask.as_str()).into_owned();
            }
        }
        out
    }

    /// Mask the whole value for a sensitive field name, otherwise only the matches.
    pub fn redact(&self, field_name: &str, value: &str) -> String {
        if self.should_redact_field(field_name) {
            self.mask.clone()
        } else {
            self.redact_value(value)
        }
    }
}

/// Install the global subscriber and redactor.
///
/// `development` swaps the JSON default for pretty output. Fails if a
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SensitiveFieldRedactor::new(&config.redaction));

    let filter = config
        .directives
        .iter()
        .try_fold(EnvFilter::try_new(&config.level)?, |filter, directive| {
            Ok::<_, anyhow::Error>(filter.add_directive(directive.parse()?))
        })?;

    let format = match (environment, config.format) {
        ("development", LogFormat::Json) => LogFormat::Pretty,
        (_, format) => format,
    };

    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_file(config.show_location)
        .with_line_number(config.show_location)
        .with_span_events(if config.span_timings { FmtSpan::CLOSE } else { FmtSpan::NONE });

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).try_init()?;

    tracing::debug!(?format, level = %config.level, "Logging initialized");
    Ok(())
}
