//! Jump to the next or previous scope (section) of a buffer

use super::{EditorContext, FeatureError, Notification, Notifier, ensure_available};
use crate::mediator::Feature;
use crate::service::{CodeintelService, ScopeQuery};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Prev,
}

pub struct ScopeNavigator {
    service: CodeintelService,
    notifier: Arc<dyn Notifier>,
}

impl ScopeNavigator {
    pub fn new(service: CodeintelService, notifier: Arc<dyn Notifier>) -> Self {
        Self { service, notifier }
    }

    pub fn is_enabled(&self, ctx: &EditorContext) -> bool {
        ensure_available(&self.service, Feature::Jumpsections, &ctx.language).is_ok()
    }

    pub async fn next(&self, ctx: &EditorContext) -> Result<Notification, FeatureError> {
        self.jump(ctx, Direction::Next).await
    }

    pub async fn prev(&self, ctx: &EditorContext) -> Result<Notification, FeatureError> {
        self.jump(ctx, Direction::Prev).await
    }

    async fn jump(
        &self,
        ctx: &EditorContext,
        direction: Direction,
    ) -> Result<Notification, FeatureError> {
        ensure_available(&self.service, Feature::Jumpsections, &ctx.language)?;

        let query = ScopeQuery {
            buf: ctx.buf.clone(),
            line: ctx.line,
            language: ctx.language.clone(),
            ..Default::default()
        };

        let result = match direction {
            Direction::Next => self.service.get_next_scope(&query).await,
            Direction::Prev => self.service.get_prev_scope(&query).await,
        };

        let notification = match result {
            Ok(scope) => match scope.get("line").and_then(|line| line.as_u64()) {
                Some(line) if line > 0 => Notification::GotoLine { line },
                _ => Notification::NotFound,
            },
            Err(e) => {
                debug!("{:?} scope lookup failed: {}", direction, e);
                Notification::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.notifier.notify(&notification);
        Ok(notification)
    }
}
