//! Mediator over an in-process legacy analysis component
//!
//! The component answers through a completion callback carrying
//! `(code, json)`. Code 0 resolves the request with the parsed JSON, any other
//! code rejects it with the raw payload.

use super::{
    FailureTracker, Feature, LEGACY_MEDIATOR, Mediator, MediatorError, MediatorFactory,
    MediatorMeta, Method, capabilities_for,
};
use crate::rpc::DEFAULT_REQUEST_TIMEOUT;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One-shot result callback handed to the component
///
/// Dropping it without calling [`LegacyCompletion::complete`] rejects the
/// request as abandoned.
#[derive(Debug)]
pub struct LegacyCompletion {
    sender: oneshot::Sender<(i32, String)>,
}

impl LegacyCompletion {
    /// Deliver the result; may be called from any thread
    pub fn complete(self, code: i32, result: impl Into<String>) {
        if self.sender.send((code, result.into())).is_err() {
            debug!("Legacy result arrived after the request was dropped");
        }
    }
}

/// Synchronous failure raised by a component method
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LegacyError {
    pub message: String,
}

impl LegacyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn unsupported(method: Method) -> Self {
        Self::new(format!("{} is not implemented", method))
    }
}

/// The in-process analysis component
///
/// Each method receives the positional request arguments as a JSON array and
/// a completion to call once the answer is known. Only methods for which
/// [`LegacyComponent::implements`] returns true are ever invoked.
pub trait LegacyComponent: Send + Sync {
    fn implements(&self, method: Method) -> bool;

    fn get_completions(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetCompletions))
    }

    fn get_definition(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetDefinition))
    }

    fn get_references(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetReferences))
    }

    fn get_symbols_in_buffer(
        &self,
        _args: &Value,
        _done: LegacyCompletion,
    ) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetSymbolsInBuffer))
    }

    fn get_caret_scope(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetCaretScope))
    }

    fn get_next_scope(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetNextScope))
    }

    fn get_prev_scope(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetPrevScope))
    }

    fn get_symbols(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetSymbols))
    }

    fn get_languages(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetLanguages))
    }

    fn get_keywords(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetKeywords))
    }

    fn scan(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::Scan))
    }

    fn scan_summary(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::ScanSummary))
    }

    fn get_catalogs(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::GetCatalogs))
    }

    fn load_catalog(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
        Err(LegacyError::unsupported(Method::LoadCatalog))
    }

    fn keepalive(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
        done.complete(0, "null");
        Ok(())
    }
}

fn invoke(
    component: &dyn LegacyComponent,
    method: Method,
    args: &Value,
    done: LegacyCompletion,
) -> Result<(), LegacyError> {
    match method {
        Method::GetCompletions => component.get_completions(args, done),
        Method::GetDefinition => component.get_definition(args, done),
        Method::GetReferences => component.get_references(args, done),
        Method::GetSymbolsInBuffer => component.get_symbols_in_buffer(args, done),
        Method::GetCaretScope => component.get_caret_scope(args, done),
        Method::GetNextScope => component.get_next_scope(args, done),
        Method::GetPrevScope => component.get_prev_scope(args, done),
        Method::GetSymbols => component.get_symbols(args, done),
        Method::GetLanguages => component.get_languages(args, done),
        Method::GetKeywords => component.get_keywords(args, done),
        Method::Scan => component.scan(args, done),
        Method::ScanSummary => component.scan_summary(args, done),
        Method::GetCatalogs => component.get_catalogs(args, done),
        Method::LoadCatalog => component.load_catalog(args, done),
        Method::Keepalive => component.keepalive(args, done),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Mediator dispatching to a [`LegacyComponent`]
pub struct LegacyMediator {
    meta: Option<MediatorMeta>,
    capabilities: HashSet<Feature>,
    component: Arc<dyn LegacyComponent>,
    request_timeout: Duration,
    failures: FailureTracker,
}

impl LegacyMediator {
    pub fn new(
        component: Arc<dyn LegacyComponent>,
        meta: Option<MediatorMeta>,
        capabilities: HashSet<Feature>,
    ) -> Self {
        Self {
            meta,
            capabilities,
            component,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failures: FailureTracker::default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failures = FailureTracker::new(threshold);
        self
    }

    async fn dispatch(&self, method: Method, args: Value) -> Result<Value, MediatorError> {
        if !self.component.implements(method) {
            return Err(MediatorError::MethodNotFound { method });
        }

        let (sender, receiver) = oneshot::channel();
        let done = LegacyCompletion { sender };
        let component = self.component.as_ref();

        match panic::catch_unwind(AssertUnwindSafe(|| invoke(component, method, &args, done))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MediatorError::Component(e.message)),
            Err(payload) => return Err(MediatorError::Panicked(panic_message(payload))),
        }

        match tokio::time::timeout(self.request_timeout, receiver).await {
            Err(_) => Err(MediatorError::Timeout),
            Ok(Err(_)) => Err(MediatorError::Abandoned),
            Ok(Ok((0, payload))) if payload.trim().is_empty() => Ok(Value::Null),
            Ok(Ok((0, payload))) => serde_json::from_str(&payload)
                .map_err(|e| MediatorError::Decode(e.to_string())),
            Ok(Ok((code, payload))) => Err(MediatorError::Rejected { code, payload }),
        }
    }
}

#[async_trait]
impl Mediator for LegacyMediator {
    fn id(&self) -> &str {
        LEGACY_MEDIATOR
    }

    fn meta(&self) -> Option<&MediatorMeta> {
        self.meta.as_ref()
    }

    fn capabilities(&self) -> &HashSet<Feature> {
        &self.capabilities
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_failing(&self) -> bool {
        self.failures.is_tripped()
    }

    async fn request(&self, method: Method, args: Value) -> Result<Value, MediatorError> {
        let result = self.dispatch(method, args).await;

        match &result {
            Ok(_) => self.failures.record_success(),
            Err(MediatorError::MethodNotFound { .. }) => {
                debug!("Legacy component does not implement {}", method)
            }
            Err(e) => {
                let failures = self.failures.record_failure();
                warn!("Legacy {} failed ({} in a row): {}", method, failures, e);
            }
        }
        result
    }

    fn stop(&self) {}
}

/// Creates [`LegacyMediator`]s sharing one component
pub struct LegacyMediatorFactory {
    component: Arc<dyn LegacyComponent>,
    capabilities: HashSet<Feature>,
    request_timeout: Duration,
}

impl LegacyMediatorFactory {
    /// `capabilities` are those of the language-less master instance
    pub fn new(component: Arc<dyn LegacyComponent>, capabilities: HashSet<Feature>) -> Self {
        Self {
            component,
            capabilities,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl MediatorFactory for LegacyMediatorFactory {
    fn create(&self, meta: Option<MediatorMeta>) -> Arc<dyn Mediator> {
        let capabilities = capabilities_for(meta.as_ref(), &self.capabilities);
        Arc::new(
            LegacyMediator::new(Arc::clone(&self.component), meta, capabilities)
                .with_request_timeout(self.request_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::LanguageInfo;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Component with one behaviour per method
    #[derive(Default)]
    struct FakeComponent {
        invocations: AtomicUsize,
        parked: Mutex<Vec<LegacyCompletion>>,
    }

    impl LegacyComponent for FakeComponent {
        fn implements(&self, method: Method) -> bool {
            !matches!(method, Method::GetCompletions | Method::GetReferences)
        }

        fn get_definition(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            done.complete(0, r#"{"line":42}"#);
            Ok(())
        }

        fn get_keywords(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            done.complete(1, "no keywords for this language");
            Ok(())
        }

        fn get_symbols(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
            panic!("symbol index is corrupt");
        }

        fn scan(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
            Err(LegacyError::new("scanner unavailable"))
        }

        fn get_catalogs(&self, _args: &Value, _done: LegacyCompletion) -> Result<(), LegacyError> {
            Ok(())
        }

        fn load_catalog(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.parked.lock().unwrap().push(done);
            Ok(())
        }

        fn get_caret_scope(&self, args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            let line = args[1].clone();
            std::thread::spawn(move || done.complete(0, json!({"line": line}).to_string()));
            Ok(())
        }

        fn get_languages(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            done.complete(0, "not json");
            Ok(())
        }
    }

    fn mediator(component: &Arc<FakeComponent>) -> LegacyMediator {
        let component: Arc<dyn LegacyComponent> = component.clone();
        LegacyMediator::new(component, None, HashSet::from([Feature::Gotodef]))
            .with_request_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_missing_method_rejects_without_invoking() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        let result = mediator.request(Method::GetCompletions, json!([])).await;

        assert!(matches!(
            result,
            Err(MediatorError::MethodNotFound {
                method: Method::GetCompletions
            })
        ));
        assert_eq!(component.invocations.load(Ordering::SeqCst), 0);
        assert!(!mediator.is_failing());
    }

    #[tokio::test]
    async fn test_success_resolves_parsed_json() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        let result = mediator
            .request(Method::GetDefinition, json!(["buf", 10, "/tmp/a.py"]))
            .await
            .unwrap();

        assert_eq!(result, json!({"line": 42}));
        assert_eq!(component.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_from_another_thread() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        let result = mediator
            .request(Method::GetCaretScope, json!(["buf", 7, 3, "Python"]))
            .await
            .unwrap();

        assert_eq!(result, json!({"line": 7}));
    }

    #[tokio::test]
    async fn test_non_zero_code_rejects_with_payload() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        match mediator.request(Method::GetKeywords, json!(["Python"])).await {
            Err(MediatorError::Rejected { code, payload }) => {
                assert_eq!(code, 1);
                assert_eq!(payload, "no keywords for this language");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_component_failures_are_contained() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        assert!(matches!(
            mediator.request(Method::GetSymbols, json!([])).await,
            Err(MediatorError::Panicked(message)) if message == "symbol index is corrupt"
        ));
        assert!(matches!(
            mediator.request(Method::Scan, json!([])).await,
            Err(MediatorError::Component(message)) if message == "scanner unavailable"
        ));
        assert!(matches!(
            mediator.request(Method::GetCatalogs, json!([])).await,
            Err(MediatorError::Abandoned)
        ));
        assert!(matches!(
            mediator.request(Method::GetLanguages, json!([])).await,
            Err(MediatorError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_undelivered_completion_times_out() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component);

        assert!(matches!(
            mediator.request(Method::LoadCatalog, json!([])).await,
            Err(MediatorError::Timeout)
        ));

        // A late answer is discarded quietly
        let parked = component.parked.lock().unwrap().pop().unwrap();
        parked.complete(0, "{}");
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_mediator_failing() {
        let component = Arc::new(FakeComponent::default());
        let mediator = mediator(&component).with_failure_threshold(2);

        let _ = mediator.request(Method::Scan, json!([])).await;
        assert!(!mediator.is_failing());
        let _ = mediator.request(Method::Scan, json!([])).await;
        assert!(mediator.is_failing());

        mediator.request(Method::GetDefinition, json!([])).await.unwrap();
        assert!(!mediator.is_failing());
    }

    #[tokio::test]
    async fn test_default_keepalive_and_factory_capabilities() {
        let component: Arc<dyn LegacyComponent> = Arc::new(FakeComponent::default());
        let factory = LegacyMediatorFactory::new(component, HashSet::from([Feature::Scanner]));

        let master = factory.create(None);
        assert!(master.supports(Feature::Scanner));
        assert!(master.is_ready());
        assert_eq!(master.id(), LEGACY_MEDIATOR);
        assert_eq!(
            master.request(Method::Keepalive, json!([])).await.unwrap(),
            Value::Null
        );

        let python = factory.create(Some(MediatorMeta {
            id: LEGACY_MEDIATOR.to_string(),
            name: "Legacy".to_string(),
            language: "Python".to_string(),
            info: LanguageInfo {
                supports: vec![Feature::Completions],
                ..Default::default()
            },
        }));
        assert!(python.supports(Feature::Completions));
        assert!(!python.supports(Feature::Scanner));
        assert_eq!(python.meta().unwrap().language, "Python");
    }
}
