//! Project-wide symbol search

use super::{EditorContext, FeatureError, Notification, Notifier, ensure_available};
use crate::mediator::Feature;
use crate::service::{CodeintelService, SymbolQuery};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Maximum number of results requested when the caller sets no limit
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub symbol_type: String,
    pub filename: Option<String>,
    pub path: Option<String>,
    pub line: Option<u64>,
    pub pos: Option<i64>,
    pub weight: Option<f64>,
}

impl Symbol {
    /// Navigation target for selecting this symbol
    pub fn target(&self) -> Option<Notification> {
        let path = self.path.clone().or_else(|| self.filename.clone())?;
        Some(Notification::OpenFile {
            path,
            line: self.line.unwrap_or(0),
        })
    }
}

pub struct SymbolSearch {
    service: CodeintelService,
    notifier: Arc<dyn Notifier>,
    limit: usize,
}

impl SymbolSearch {
    pub fn new(service: CodeintelService, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            service,
            notifier,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Search symbols matching `query`, scoped to the context's project
    ///
    /// A failed search yields no symbols and a `Failed` notification.
    pub async fn search(
        &self,
        query: &str,
        ctx: &EditorContext,
    ) -> Result<Vec<Symbol>, FeatureError> {
        ensure_available(&self.service, Feature::Symbolscope, &ctx.language)?;

        let request = SymbolQuery {
            query: query.to_string(),
            path: ctx.path.clone(),
            parent_path: ctx.parent_path.clone(),
            symbol_type: None,
            language: Some(ctx.language.clone()),
            limit: Some(self.limit),
        };

        match self.service.get_symbols(&request).await {
            Ok(value) if value.is_null() => Ok(Vec::new()),
            Ok(value) => match serde_json::from_value::<Vec<Symbol>>(value) {
                Ok(symbols) => Ok(symbols),
                Err(e) => {
                    debug!("Unrecognised symbol list: {}", e);
                    Ok(Vec::new())
                }
            },
            Err(e) => {
                debug!("getSymbols failed: {}", e);
                self.notifier.notify(&Notification::Failed {
                    reason: e.to_string(),
                });
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::testing::{CannedComponent, RecordingNotifier, context, service};
    use serde_json::json;

    #[tokio::test]
    async fn test_search_returns_symbols() {
        let component = Arc::new(CannedComponent::new(
            0,
            r#"[{"name": "join", "type": "function", "filename": "path.py",
                 "path": "/lib/os/path.py", "line": 80, "pos": -1, "weight": 0.5},
                {"name": "sep", "type": "variable"}]"#,
        ));
        let search = SymbolSearch::new(
            service(component.clone(), &[Feature::Symbolscope]),
            Arc::new(RecordingNotifier::default()),
        )
        .with_limit(10);

        let symbols = search.search("jo", &context()).await.unwrap();

        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].symbol_type, "function");
        assert_eq!(
            symbols[0].target(),
            Some(Notification::OpenFile {
                path: "/lib/os/path.py".to_string(),
                line: 80
            })
        );
        assert_eq!(symbols[1].target(), None);

        let args = component.args.lock().unwrap()[0].clone();
        assert_eq!(
            args,
            json!(["jo", "/project/main.py", "/project", null, "Python", 10])
        );
    }

    #[tokio::test]
    async fn test_failed_search_notifies() {
        let component = Arc::new(CannedComponent::new(3, "database locked"));
        let notifier = Arc::new(RecordingNotifier::default());
        let search = SymbolSearch::new(
            service(component, &[Feature::Symbolscope]),
            notifier.clone(),
        );

        assert!(search.search("x", &context()).await.unwrap().is_empty());
        assert!(matches!(
            notifier.seen().as_slice(),
            [Notification::Failed { .. }]
        ));
    }
}
