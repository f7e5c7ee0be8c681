//! Mediators: a uniform asynchronous request facade over the backends
//!
//! A [`Mediator`] hides whether a request travels over the RPC socket of the
//! supervised backend ([`rpc::RpcMediator`]) or is dispatched to an in-process
//! component ([`legacy::LegacyMediator`]). The [`locator::ServiceLocator`]
//! picks a mediator per language and feature.

pub mod legacy;
pub mod locator;
pub mod prefs;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

pub use legacy::{
    LegacyComponent, LegacyCompletion, LegacyError, LegacyMediator, LegacyMediatorFactory,
};
pub use locator::{CallOptions, LocatorError, ServiceLocator};
pub use prefs::{MemoryPreferences, Preferences, is_feature_enabled};
pub use rpc::{RpcChannel, RpcMediator, RpcMediatorFactory};

/// Id of the mediator preferred when no preference selects another one
pub const DEFAULT_MEDIATOR: &str = "codeintel/service/mediator/codeintel";

/// Id of the in-process legacy mediator
pub const LEGACY_MEDIATOR: &str = "codeintel/service/mediator/legacy";

/// Consecutive request failures after which a mediator reports itself failing
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

// ============================================================================
// Capabilities and methods
// ============================================================================

/// A named capability a mediator can declare support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Completions,
    Calltips,
    Symbolbrowser,
    Symbollist,
    Symbolscope,
    Scanner,
    Gotodef,
    Jumpsections,
    Findreferences,
}

impl Feature {
    pub const ALL: [Feature; 9] = [
        Feature::Completions,
        Feature::Calltips,
        Feature::Symbolbrowser,
        Feature::Symbollist,
        Feature::Symbolscope,
        Feature::Scanner,
        Feature::Gotodef,
        Feature::Jumpsections,
        Feature::Findreferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Completions => "completions",
            Feature::Calltips => "calltips",
            Feature::Symbolbrowser => "symbolbrowser",
            Feature::Symbollist => "symbollist",
            Feature::Symbolscope => "symbolscope",
            Feature::Scanner => "scanner",
            Feature::Gotodef => "gotodef",
            Feature::Jumpsections => "jumpsections",
            Feature::Findreferences => "findreferences",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| format!("unknown feature: {}", s))
    }
}

/// Closed set of request identifiers understood by the backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    GetCompletions,
    GetDefinition,
    GetReferences,
    GetSymbolsInBuffer,
    GetCaretScope,
    GetNextScope,
    GetPrevScope,
    GetSymbols,
    GetLanguages,
    GetKeywords,
    Scan,
    ScanSummary,
    GetCatalogs,
    LoadCatalog,
    Keepalive,
}

impl Method {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetCompletions => "getCompletions",
            Method::GetDefinition => "getDefinition",
            Method::GetReferences => "getReferences",
            Method::GetSymbolsInBuffer => "getSymbolsInBuffer",
            Method::GetCaretScope => "getCaretScope",
            Method::GetNextScope => "getNextScope",
            Method::GetPrevScope => "getPrevScope",
            Method::GetSymbols => "getSymbols",
            Method::GetLanguages => "getLanguages",
            Method::GetKeywords => "getKeywords",
            Method::Scan => "scan",
            Method::ScanSummary => "scanSummary",
            Method::GetCatalogs => "getCatalogs",
            Method::LoadCatalog => "loadCatalog",
            Method::Keepalive => "keepalive",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Language metadata
// ============================================================================

/// What a backend reports about one language
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    /// Features served for the language; unknown names are dropped
    #[serde(default, deserialize_with = "known_features")]
    pub supports: Vec<Feature>,

    /// API flavour reported by the backend
    #[serde(default)]
    pub api: String,

    /// Any other keys the backend reported
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn known_features<'de, D>(deserializer: D) -> Result<Vec<Feature>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    Ok(names
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(feature) => Some(feature),
            Err(e) => {
                warn!("Ignoring {}", e);
                None
            }
        })
        .collect())
}

/// Parse a `getLanguages` result: `{ "<language>": LanguageInfo, ... }`
pub fn parse_languages(value: Value) -> Result<BTreeMap<String, LanguageInfo>, MediatorError> {
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_value(value).map_err(|e| MediatorError::Decode(e.to_string()))
}

/// Registration record of a mediator for one language
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediatorMeta {
    pub id: String,
    pub name: String,
    pub language: String,
    pub info: LanguageInfo,
}

// ============================================================================
// Errors
// ============================================================================

/// Why a mediated request failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediatorError {
    #[error("Backend is not ready")]
    NotReady,

    #[error("Mediator is failing")]
    Failing,

    #[error("Connection to the backend was lost")]
    ConnectionLost,

    #[error("Request timed out")]
    Timeout,

    #[error("Method does not exist: {method}")]
    MethodNotFound { method: Method },

    #[error("Backend error ({code}): {message}")]
    Transport { message: String, code: i32 },

    #[error("Request rejected with code {code}: {payload}")]
    Rejected { code: i32, payload: String },

    #[error("Invalid JSON payload: {0}")]
    Decode(String),

    #[error("Component error: {0}")]
    Component(String),

    #[error("Component panicked: {0}")]
    Panicked(String),

    #[error("Request was abandoned without a result")]
    Abandoned,
}

impl MediatorError {
    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediatorError::ConnectionLost | MediatorError::NotReady | MediatorError::Timeout
        )
    }
}

// ============================================================================
// Mediator trait
// ============================================================================

/// Uniform request facade implemented by every transport
#[async_trait]
pub trait Mediator: Send + Sync {
    /// Transport identifier, e.g. [`DEFAULT_MEDIATOR`]
    fn id(&self) -> &str;

    /// Registration record; None for the language-less master instance
    fn meta(&self) -> Option<&MediatorMeta>;

    fn capabilities(&self) -> &HashSet<Feature>;

    /// Whether a request can currently succeed
    fn is_ready(&self) -> bool;

    /// Whether the mediator is in a known-bad state
    fn is_failing(&self) -> bool;

    fn supports(&self, feature: Feature) -> bool {
        self.capabilities().contains(&feature)
    }

    /// Issue a request; never panics, failures settle as `Err`
    async fn request(&self, method: Method, args: Value) -> Result<Value, MediatorError>;

    /// Release transport resources held for this mediator
    fn stop(&self);
}

/// Creates mediator instances for one transport
pub trait MediatorFactory: Send + Sync {
    fn create(&self, meta: Option<MediatorMeta>) -> Arc<dyn Mediator>;
}

/// Capabilities declared by `meta`, or `default` for the master instance
pub(crate) fn capabilities_for(
    meta: Option<&MediatorMeta>,
    default: &HashSet<Feature>,
) -> HashSet<Feature> {
    match meta {
        Some(meta) => meta.info.supports.iter().copied().collect(),
        None => default.clone(),
    }
}

/// Counts consecutive request failures
#[derive(Debug)]
pub struct FailureTracker {
    consecutive: AtomicU32,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_tripped(&self) -> bool {
        self.threshold > 0 && self.consecutive.load(Ordering::SeqCst) >= self.threshold
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}
