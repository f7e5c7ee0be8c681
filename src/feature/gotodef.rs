//! Go to definition

use super::{EditorContext, FeatureError, Notification, Notifier, ensure_available};
use crate::mediator::Feature;
use crate::service::{BufferQuery, CodeintelService};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Definition as reported by the backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Definition {
    pub filename: Option<String>,
    pub line: Option<u64>,
    pub symbol: Option<String>,
    pub parents: Vec<String>,
}

impl Definition {
    /// Catalog definitions carry a filename starting with ':'
    pub fn is_catalog(&self) -> bool {
        self.filename
            .as_deref()
            .is_some_and(|filename| filename.starts_with(':'))
    }
}

pub struct GotoDefinition {
    service: CodeintelService,
    notifier: Arc<dyn Notifier>,
}

impl GotoDefinition {
    pub fn new(service: CodeintelService, notifier: Arc<dyn Notifier>) -> Self {
        Self { service, notifier }
    }

    pub fn is_enabled(&self, ctx: &EditorContext) -> bool {
        ensure_available(&self.service, Feature::Gotodef, &ctx.language).is_ok()
    }

    /// Look up the definition at the caret and report where it is
    pub async fn invoke(&self, ctx: &EditorContext) -> Result<Notification, FeatureError> {
        ensure_available(&self.service, Feature::Gotodef, &ctx.language)?;

        let query = BufferQuery {
            buf: ctx.buf.clone(),
            pos: ctx.pos,
            path: ctx.path.clone(),
            parent_path: ctx.parent_path.clone(),
            import_paths: ctx.joined_import_paths(),
            language: ctx.language.clone(),
            limit: None,
        };

        let notification = match self.service.get_definition(&query).await {
            Ok(result) => Self::interpret(result),
            Err(e) => {
                debug!("getDefinition failed: {}", e);
                Notification::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.notifier.notify(&notification);
        Ok(notification)
    }

    fn interpret(result: Value) -> Notification {
        if result.is_null() {
            return Notification::NotFound;
        }
        let definition: Definition = match serde_json::from_value(result) {
            Ok(definition) => definition,
            Err(e) => {
                debug!("Unrecognised definition: {}", e);
                return Notification::NotFound;
            }
        };

        if definition.is_catalog() {
            return match definition.symbol {
                Some(symbol) => {
                    let mut parts = definition.parents;
                    parts.push(symbol);
                    Notification::CatalogDefinition {
                        query: parts.join(" "),
                    }
                }
                None => Notification::NotFound,
            };
        }

        match (definition.filename, definition.line) {
            (Some(path), line) => Notification::OpenFile {
                path,
                line: line.unwrap_or(0),
            },
            (None, Some(line)) if line > 0 => Notification::GotoLine { line },
            _ => Notification::NotFound,
        }
    }
}
