//! Types shared between the loader, the controller and the experiment harness.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Default declared priority of a load. Requests below this are eligible for
/// cancellation under critical memory pressure.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Declared priority used by [`preload`](crate::loader::ResourceLoader::preload).
pub const PRELOAD_PRIORITY: u32 = 1;

/// How the body of a resource is handed to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Json,
    Text,
    #[default]
    Bytes,
}

/// Per-request options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    /// Declared priority, higher loads first.
    pub priority: u32,
    /// Per-attempt timeout, falls back to the configured timeout.
    pub timeout: Option<Duration>,
    pub response_kind: ResponseKind,
    /// Skip the cache lookup and the offline check.
    pub bypass_cache: bool,
    /// Maximum number of retries, falls back to the configured retry count.
    pub retry_count: Option<u32>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            timeout: None,
            response_kind: ResponseKind::default(),
            bypass_cache: false,
            retry_count: None,
        }
    }
}

impl LoadOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_response_kind(mut self, kind: ResponseKind) -> Self {
        self.response_kind = kind;
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
}

/// The raw outcome of one successful fetch, as stored in the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResource {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// The decoded body of a resource.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceData {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

/// A loaded resource, decoded to the kind the caller asked for.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub url: String,
    pub content_type: Option<String>,
    pub data: ResourceData,
    /// Whether the value was served from the cache without touching the network.
    pub from_cache: bool,
}

impl Resource {
    /// Decodes a raw resource into the requested kind.
    pub fn decode(
        url: &str,
        raw: &RawResource,
        kind: ResponseKind,
        from_cache: bool,
    ) -> Result<Self, LoadError> {
        let data = match kind {
            ResponseKind::Bytes => ResourceData::Bytes(raw.body.clone()),
            ResponseKind::Text => match std::str::from_utf8(&raw.body) {
                Ok(text) => ResourceData::Text(text.to_owned()),
                Err(e) => return Err(LoadError::Malformed(e.to_string())),
            },
            ResponseKind::Json => match serde_json::from_slice(&raw.body) {
                Ok(value) => ResourceData::Json(value),
                Err(e) => return Err(LoadError::Malformed(e.to_string())),
            },
        };

        Ok(Self {
            url: url.to_owned(),
            content_type: raw.content_type.clone(),
            data,
            from_cache,
        })
    }

    /// The size of the decoded body in bytes, where it is meaningful.
    pub fn len(&self) -> usize {
        match &self.data {
            ResourceData::Bytes(bytes) => bytes.len(),
            ResourceData::Text(text) => text.len(),
            ResourceData::Json(value) => value.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The kind of a resource, derived from the extension of its URL path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Stylesheet,
    Script,
    Data,
    Font,
    Image,
    Other,
}

impl ResourceType {
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let file = path.rsplit('/').next().unwrap_or(path);
        let Some((_, ext)) = file.rsplit_once('.') else {
            return Self::Other;
        };
        match ext.to_ascii_lowercase().as_str() {
            "css" => Self::Stylesheet,
            "js" | "mjs" | "cjs" => Self::Script,
            "json" => Self::Data,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Self::Font,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "avif" | "ico" => Self::Image,
            _ => Self::Other,
        }
    }

    /// Stylesheets, scripts and data files are loaded ahead of everything else.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Stylesheet | Self::Script | Self::Data)
    }
}

/// Normalizes a URL for use as cache and merge key.
///
/// Absolute URLs are parsed and lose their fragment, relative ones are only trimmed.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.into()
        }
        Err(_) => url.to_owned(),
    }
}

/// The class of device the loader runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    LowEndDesktop,
    LowEndMobile,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::LowEndDesktop => "low-end-desktop",
            Self::LowEndMobile => "low-end-mobile",
        }
    }
}

/// The network status as reported by the network monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
    #[default]
    Unknown,
}

impl NetworkStatus {
    /// Quality rank, lower is worse.
    ///
    /// `Unknown` ranks between `Poor` and `Fair`: it never wins a tie against a
    /// known-bad status.
    pub fn quality(self) -> u8 {
        match self {
            Self::Offline => 0,
            Self::Poor => 1,
            Self::Unknown => 2,
            Self::Fair => 3,
            Self::Good => 4,
            Self::Excellent => 5,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        if other.quality() < self.quality() {
            other
        } else {
            self
        }
    }

    pub fn is_offline(self) -> bool {
        self == Self::Offline
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-change event from the network monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatusChange {
    pub status: NetworkStatus,
    pub previous_status: NetworkStatus,
}

/// Identifier of one dispatched attempt in the active-request table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}
