use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::sink::DurableSink;
use crate::store::BlobStore;
use crate::tools::ToolRunner;

/// BLAKE3 digest of a blob's bytes. Its hex form is the blob id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hash32([u8; 32]);

impl Hash32 {
    #[cfg(test)]
    pub(crate) fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Hashes a file through a memory map, reading it once.
    pub(crate) fn of_file(path: &Utf8Path) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_mmap_rayon(path)?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub(crate) fn to_hex(self) -> String {
        self.0.iter().fold(String::with_capacity(64), |mut acc, byte| {
            let _ = write!(acc, "{byte:02x}");
            acc
        })
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Name of the pseudo-assembly built from the graph itself. It may lack
/// sequence for some contigs without that being an error.
pub const DEFAULT_SENTINEL_EVENT: &str = "_MINIGRAPH_";

/// Settings shared by every task in a workflow run.
///
/// All fields have defaults, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Number of task bodies that may run at the same time.
    pub workers: usize,
    /// Delay between the starts of consecutive staggered siblings.
    pub stagger: Duration,
    /// Use event names instead of numeric ids as sequence prefixes.
    pub event_name_as_id: bool,
    /// Event allowed to have no sequence for a contig.
    pub sentinel_event: String,
    /// Upper bound on the runtime of any single external tool.
    pub tool_timeout: Option<Duration>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            stagger: Duration::ZERO,
            event_name_as_id: false,
            sentinel_event: DEFAULT_SENTINEL_EVENT.to_string(),
            tool_timeout: None,
        }
    }
}

impl FlowConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_event_name_as_id(mut self, enabled: bool) -> Self {
        self.event_name_as_id = enabled;
        self
    }

    pub fn with_sentinel_event(mut self, event: impl Into<String>) -> Self {
        self.sentinel_event = event.into();
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }
}

/// Global configuration and services available to all tasks.
///
/// Cloning is cheap, the services are shared behind `Arc`s.
#[derive(Clone)]
pub struct Environment {
    pub config: FlowConfig,
    /// Where task outputs are kept and shared between tasks.
    pub store: Arc<dyn BlobStore>,
    /// How external executables are launched.
    pub tools: Arc<dyn ToolRunner>,
    /// Optional direct-to-storage destination for final artifacts.
    pub sink: Option<Arc<dyn DurableSink>>,
}

impl Environment {
    pub fn new(config: FlowConfig, store: Arc<dyn BlobStore>, tools: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            store,
            tools,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DurableSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
