use parley_events::Topic;
use parley_mirror::MirrorMode;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Io,
    Parse,
    Missing(&'static str),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing(key) => write!(f, "configuration key {} missing", key),
            Self::Invalid(key) => write!(f, "configuration value {} invalid", key),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    /// `None` blocks until entries arrive.
    pub block: Option<Duration>,
    /// `None` disables stale-entry claiming.
    pub claim_idle: Option<Duration>,
    pub retry_delay: Duration,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub mode: MirrorMode,
    pub target: Option<String>,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub storage: StorageConfig,
    pub streams: StreamConfig,
    pub mirror: MirrorConfig,
    pub presence_channel: String,
    pub session_buffer: usize,
    pub metrics_interval: Option<Duration>,
}

/// Loads projector configuration from a file with environment overrides.
///
/// A missing file is not an error: every key has an environment override,
/// so containerised deployments can run without one.
pub fn load_configuration(path: &Path) -> Result<ProjectorConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(_) => return Err(ConfigError::Io),
    };
    parse_configuration(&contents, &|key| env::var(key).ok())
}

/// Parses sectioned `key = value` text; `lookup` supplies environment overrides.
pub fn parse_configuration(
    contents: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ProjectorConfig, ConfigError> {
    let mut map = parse_sections(contents)?;
    let mut value = |env_key: &str, file_key: &str| -> Option<String> {
        lookup(env_key)
            .or_else(|| map.remove(file_key))
            .filter(|value| !value.trim().is_empty())
    };

    let backend = match value("PARLEY_BACKEND", "storage.backend")
        .unwrap_or_else(|| "redis".to_string())
        .as_str()
    {
        "redis" => BackendKind::Redis,
        "memory" => BackendKind::Memory,
        _ => return Err(ConfigError::Invalid("storage.backend")),
    };
    let redis_url = value("PARLEY_REDIS_URL", "storage.redis_url");
    if backend == BackendKind::Redis && redis_url.is_none() {
        return Err(ConfigError::Missing("storage.redis_url"));
    }

    let group = value("PARLEY_GROUP", "streams.group").unwrap_or_else(|| "projector".to_string());
    // a restarted process must come back under the same name to see its own pending entries
    let consumer = value("PARLEY_CONSUMER", "streams.consumer")
        .or_else(|| lookup("HOSTNAME").filter(|host| !host.trim().is_empty()))
        .unwrap_or_else(|| "projector".to_string());
    let batch_size = number(
        value("PARLEY_BATCH_SIZE", "streams.batch_size"),
        500,
        "streams.batch_size",
    )?;
    if batch_size == 0 {
        return Err(ConfigError::Invalid("streams.batch_size"));
    }
    let block_ms = number(value("PARLEY_BLOCK_MS", "streams.block_ms"), 0, "streams.block_ms")?;
    let claim_idle_ms = number(
        value("PARLEY_CLAIM_IDLE_MS", "streams.claim_idle_ms"),
        60_000,
        "streams.claim_idle_ms",
    )?;
    let retry_delay_ms = number(
        value("PARLEY_RETRY_DELAY_MS", "streams.retry_delay_ms"),
        1000,
        "streams.retry_delay_ms",
    )?;
    let topics = parse_topics(value("PARLEY_TOPICS", "streams.topics"))?;

    let mode = value("PARLEY_MIRROR", "mirror.mode")
        .unwrap_or_default()
        .parse::<MirrorMode>()
        .map_err(|_| ConfigError::Invalid("mirror.mode"))?;
    let target = value("PARLEY_MIRROR_TARGET", "mirror.target");
    if !matches!(mode, MirrorMode::Null | MirrorMode::Debug) && target.is_none() {
        return Err(ConfigError::Missing("mirror.target"));
    }
    let queue_capacity = number(
        value("PARLEY_MIRROR_QUEUE", "mirror.queue_capacity"),
        1024,
        "mirror.queue_capacity",
    )?;
    if queue_capacity == 0 {
        return Err(ConfigError::Invalid("mirror.queue_capacity"));
    }

    let presence_channel = value("PARLEY_PRESENCE_CHANNEL", "presence.channel")
        .unwrap_or_else(|| "presence_updates".to_string());
    let session_buffer = number(
        value("PARLEY_SESSION_BUFFER", "fanout.session_buffer"),
        64,
        "fanout.session_buffer",
    )?;
    if session_buffer == 0 {
        return Err(ConfigError::Invalid("fanout.session_buffer"));
    }
    let metrics_secs = number(
        value("PARLEY_METRICS_INTERVAL", "metrics.log_interval_secs"),
        60,
        "metrics.log_interval_secs",
    )?;

    Ok(ProjectorConfig {
        storage: StorageConfig { backend, redis_url },
        streams: StreamConfig {
            group,
            consumer,
            batch_size,
            block: (block_ms > 0).then(|| Duration::from_millis(block_ms as u64)),
            claim_idle: (claim_idle_ms > 0).then(|| Duration::from_millis(claim_idle_ms as u64)),
            retry_delay: Duration::from_millis(retry_delay_ms as u64),
            topics,
        },
        mirror: MirrorConfig {
            mode,
            target,
            queue_capacity,
        },
        presence_channel,
        session_buffer,
        metrics_interval: (metrics_secs > 0).then(|| Duration::from_secs(metrics_secs as u64)),
    })
}

fn parse_sections(contents: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let Some((key, raw)) = trimmed.split_once('=') else {
            return Err(ConfigError::Parse);
        };
        let key = if section.is_empty() {
            key.trim().to_string()
        } else {
            format!("{}.{}", section, key.trim())
        };
        let mut value = raw.trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }
    Ok(map)
}

fn number(raw: Option<String>, default: usize, key: &'static str) -> Result<usize, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

fn parse_topics(raw: Option<String>) -> Result<Vec<Topic>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Topic::ALL.to_vec());
    };
    let mut topics = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let topic = name
            .parse::<Topic>()
            .map_err(|_| ConfigError::Invalid("streams.topics"))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    if topics.is_empty() {
        return Ok(Topic::ALL.to_vec());
    }
    Ok(topics)
}
