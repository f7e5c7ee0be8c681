//! Feature clients
//!
//! Thin consumers of [`CodeintelService`](crate::service::CodeintelService)
//! that turn backend answers into [`Notification`]s for the host editor.
//! Backend failures never escape as errors; they are reported as
//! [`Notification::Failed`].

pub mod gotodef;
pub mod scope;
pub mod symbols;

use crate::mediator::Feature;
use crate::service::CodeintelService;
use serde::Serialize;

pub use gotodef::GotoDefinition;
pub use scope::ScopeNavigator;
pub use symbols::{Symbol, SymbolSearch};

#[cfg(windows)]
const IMPORT_PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const IMPORT_PATH_SEPARATOR: &str = ":";

/// Editor state a feature client acts on
#[derive(Debug, Clone, Default)]
pub struct EditorContext {
    pub buf: String,
    /// Caret offset in `buf`
    pub pos: usize,
    /// 1-based caret line
    pub line: usize,
    pub path: Option<String>,
    /// Project or working directory the buffer belongs to
    pub parent_path: Option<String>,
    pub import_paths: Vec<String>,
    pub language: String,
}

impl EditorContext {
    pub(crate) fn joined_import_paths(&self) -> Option<String> {
        if self.import_paths.is_empty() {
            None
        } else {
            Some(self.import_paths.join(IMPORT_PATH_SEPARATOR))
        }
    }
}

/// What the host should show or do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    NotFound,
    Failed { reason: String },
    OpenFile { path: String, line: u64 },
    GotoLine { line: u64 },
    /// The definition lives in an API catalog; `query` names it for a docs lookup
    CatalogDefinition { query: String },
}

/// Receives notifications and navigation targets
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        tracing::info!(?notification, "codeintel notification");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("{feature} is disabled")]
    Disabled { feature: Feature },

    #[error("{feature} is not supported for {language}")]
    Unsupported { feature: Feature, language: String },
}

/// Fail before any request when `feature` is switched off or the language's
/// mediator does not serve it
pub(crate) fn ensure_available(
    service: &CodeintelService,
    feature: Feature,
    language: &str,
) -> Result<(), FeatureError> {
    if !service.is_feature_enabled(feature) {
        return Err(FeatureError::Disabled { feature });
    }
    if !service.supports_feature(feature, language) {
        return Err(FeatureError::Unsupported {
            feature,
            language: language.to_string(),
        });
    }
    Ok(())
}
