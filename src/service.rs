//! Typed service endpoints
//!
//! Each endpoint names its backend method, the order in which input fields
//! become positional arguments, and its default routing and caching options.
//! Fields missing from an input are sent as `null`.

use crate::mediator::{
    CallOptions, DEFAULT_MEDIATOR, Feature, LanguageInfo, LocatorError, Method, ServiceLocator,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Static description of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    /// Input field names, in argument order
    pub args: &'static [&'static str],
    pub cache: bool,
    pub max_age_ms: Option<u64>,
    pub feature: Option<Feature>,
    pub mediator: Option<&'static str>,
}

impl Endpoint {
    const fn new(method: Method, args: &'static [&'static str]) -> Self {
        Self {
            method,
            args,
            cache: false,
            max_age_ms: None,
            feature: None,
            mediator: None,
        }
    }

    const fn cached(mut self, max_age_ms: Option<u64>) -> Self {
        self.cache = true;
        self.max_age_ms = max_age_ms;
        self
    }

    const fn feature(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    const fn mediator(mut self, id: &'static str) -> Self {
        self.mediator = Some(id);
        self
    }

    /// Default options for a call with `language`
    pub fn options(&self, language: Option<String>) -> CallOptions {
        CallOptions {
            cache: self.cache,
            max_age: self.max_age_ms.map(Duration::from_millis),
            feature: self.feature,
            mediator: self.mediator.map(str::to_string),
            language,
        }
    }

    /// Positional arguments picked from `input` by name
    pub fn arguments(&self, input: &Map<String, Value>) -> Vec<Value> {
        self.args
            .iter()
            .map(|name| input.get(*name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

const BUFFER_ARGS: &[&str] = &["buf", "pos", "path", "parentPath", "importPaths", "language"];

pub const GET_COMPLETIONS: Endpoint = Endpoint::new(
    Method::GetCompletions,
    &["buf", "pos", "path", "parentPath", "importPaths", "language", "limit"],
)
.cached(Some(200))
.feature(Feature::Completions);

pub const GET_SYMBOLS_IN_BUFFER: Endpoint = Endpoint::new(
    Method::GetSymbolsInBuffer,
    &["buf", "line", "pos", "indentString", "language", "sortType"],
)
.cached(Some(200))
.feature(Feature::Symbolbrowser);

pub const GET_CARET_SCOPE: Endpoint =
    Endpoint::new(Method::GetCaretScope, &["buf", "line", "pos", "language"])
        .cached(Some(200))
        .feature(Feature::Symbolbrowser);

pub const GET_LANGUAGES: Endpoint = Endpoint::new(Method::GetLanguages, &[]).cached(None);

pub const GET_KEYWORDS: Endpoint = Endpoint::new(Method::GetKeywords, &["language"]).cached(None);

pub const GET_SYMBOLS: Endpoint = Endpoint::new(
    Method::GetSymbols,
    &["query", "path", "parentPath", "type", "language", "limit"],
)
.cached(Some(10_000))
.feature(Feature::Symbolscope);

pub const SCAN_SUMMARY: Endpoint =
    Endpoint::new(Method::ScanSummary, &["paths", "maxDepth", "excludes", "limit"])
        .feature(Feature::Scanner);

pub const SCAN: Endpoint =
    Endpoint::new(Method::Scan, &["paths", "maxDepth", "excludes"]).feature(Feature::Scanner);

pub const GET_NEXT_SCOPE: Endpoint =
    Endpoint::new(Method::GetNextScope, &["buf", "line", "language"])
        .cached(Some(10_000))
        .feature(Feature::Jumpsections);

pub const GET_PREV_SCOPE: Endpoint =
    Endpoint::new(Method::GetPrevScope, &["buf", "line", "language"])
        .cached(Some(10_000))
        .feature(Feature::Jumpsections);

pub const GET_DEFINITION: Endpoint = Endpoint::new(Method::GetDefinition, BUFFER_ARGS)
    .cached(Some(10_000))
    .feature(Feature::Gotodef);

pub const GET_REFERENCES: Endpoint = Endpoint::new(
    Method::GetReferences,
    &["buf", "pos", "path", "parentPath", "language"],
)
.cached(Some(10_000))
.feature(Feature::Findreferences);

pub const GET_CATALOGS: Endpoint = Endpoint::new(Method::GetCatalogs, &["language"])
    .cached(None)
    .mediator(DEFAULT_MEDIATOR);

pub const LOAD_CATALOG: Endpoint =
    Endpoint::new(Method::LoadCatalog, &["language", "catalog"]).mediator(DEFAULT_MEDIATOR);

pub const KEEPALIVE: Endpoint = Endpoint::new(Method::Keepalive, &[]);

// ============================================================================
// Inputs
// ============================================================================

/// Buffer and caret, for completions, definitions and references
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferQuery {
    pub buf: String,
    pub pos: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Joined with the platform path list separator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_paths: Option<String>,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Buffer and caret line, for scope queries
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQuery {
    pub buf: String,
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indent_string: Option<String>,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQuery {
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    pub excludes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

// ============================================================================
// Service
// ============================================================================

/// Typed front end over the [`ServiceLocator`]
#[derive(Clone)]
pub struct CodeintelService {
    locator: Arc<ServiceLocator>,
}

impl CodeintelService {
    pub fn new(locator: Arc<ServiceLocator>) -> Self {
        Self { locator }
    }

    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.locator
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.locator
            .mediator_by_language(Some(language), false)
            .is_some()
    }

    /// Whether the mediator selected for `language` supports `feature`
    pub fn supports_feature(&self, feature: Feature, language: &str) -> bool {
        self.locator
            .mediator_by_language(Some(language), false)
            .is_some_and(|mediator| mediator.supports(feature))
    }

    /// Whether `feature` is switched on in the preferences
    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        self.locator.is_feature_enabled(feature)
    }

    pub fn language_info(&self, language: &str) -> Option<LanguageInfo> {
        self.locator.language_info(language)
    }

    pub fn flush(&self, request_id: Option<&str>) {
        self.locator.flush(request_id);
    }

    /// Call `endpoint` with its default options
    pub async fn mediate<I: Serialize>(
        &self,
        endpoint: &Endpoint,
        input: &I,
    ) -> Result<Value, LocatorError> {
        let input = to_map(input);
        let language = input
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);
        let options = endpoint.options(language);
        self.mediate_with(endpoint, &input, options).await
    }

    /// Call `endpoint` with explicit options
    pub async fn mediate_with(
        &self,
        endpoint: &Endpoint,
        input: &Map<String, Value>,
        options: CallOptions,
    ) -> Result<Value, LocatorError> {
        let args = endpoint.arguments(input);
        self.locator.call(endpoint.method, args, options).await
    }

    pub async fn get_completions(&self, query: &BufferQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_COMPLETIONS, query).await
    }

    pub async fn get_definition(&self, query: &BufferQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_DEFINITION, query).await
    }

    pub async fn get_references(&self, query: &BufferQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_REFERENCES, query).await
    }

    pub async fn get_symbols_in_buffer(&self, query: &ScopeQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_SYMBOLS_IN_BUFFER, query).await
    }

    pub async fn get_caret_scope(&self, query: &ScopeQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_CARET_SCOPE, query).await
    }

    pub async fn get_next_scope(&self, query: &ScopeQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_NEXT_SCOPE, query).await
    }

    pub async fn get_prev_scope(&self, query: &ScopeQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_PREV_SCOPE, query).await
    }

    pub async fn get_symbols(&self, query: &SymbolQuery) -> Result<Value, LocatorError> {
        self.mediate(&GET_SYMBOLS, query).await
    }

    pub async fn get_languages(&self) -> Result<Value, LocatorError> {
        self.mediate(&GET_LANGUAGES, &json!({})).await
    }

    pub async fn get_keywords(&self, language: &str) -> Result<Value, LocatorError> {
        self.mediate(&GET_KEYWORDS, &json!({ "language": language }))
            .await
    }

    pub async fn scan_summary(&self, query: &ScanQuery) -> Result<Value, LocatorError> {
        self.mediate(&SCAN_SUMMARY, query).await
    }

    pub async fn scan(&self, query: &ScanQuery) -> Result<Value, LocatorError> {
        self.mediate(&SCAN, query).await
    }

    pub async fn get_catalogs(&self, language: &str) -> Result<Value, LocatorError> {
        self.mediate(&GET_CATALOGS, &json!({ "language": language }))
            .await
    }

    pub async fn load_catalog(&self, language: &str, catalog: &str) -> Result<Value, LocatorError> {
        self.mediate(
            &LOAD_CATALOG,
            &json!({ "language": language, "catalog": catalog }),
        )
        .await
    }

    pub async fn keepalive(&self) -> Result<Value, LocatorError> {
        self.mediate(&KEEPALIVE, &json!({})).await
    }
}

fn to_map<I: Serialize>(input: &I) -> Map<String, Value> {
    match serde_json::to_value(input) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!("Service input is not an object: {}", other);
            Map::new()
        }
        Err(e) => {
            warn!("Failed to serialize service input: {}", e);
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::{
        LEGACY_MEDIATOR, LegacyComponent, LegacyCompletion, LegacyError, LegacyMediatorFactory,
        MemoryPreferences,
    };
    use std::sync::Mutex;

    /// Records the arguments of every call and echoes them back
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Method, Value)>>,
    }

    impl Recorder {
        fn record(
            &self,
            method: Method,
            args: &Value,
            done: LegacyCompletion,
        ) -> Result<(), LegacyError> {
            self.calls.lock().unwrap().push((method, args.clone()));
            done.complete(0, json!({ "args": args }).to_string());
            Ok(())
        }

        fn calls(&self) -> Vec<(Method, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LegacyComponent for Recorder {
        fn implements(&self, _method: Method) -> bool {
            true
        }

        fn get_definition(&self, args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.record(Method::GetDefinition, args, done)
        }

        fn get_next_scope(&self, args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.record(Method::GetNextScope, args, done)
        }

        fn get_symbols(&self, args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.record(Method::GetSymbols, args, done)
        }

        fn load_catalog(&self, args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            self.record(Method::LoadCatalog, args, done)
        }
    }

    fn service(recorder: &Arc<Recorder>) -> CodeintelService {
        let locator = Arc::new(ServiceLocator::new(Arc::new(MemoryPreferences::new())));
        let component: Arc<dyn LegacyComponent> = recorder.clone();
        let factory = Arc::new(LegacyMediatorFactory::new(
            component,
            Feature::ALL.into_iter().collect(),
        ));
        // The legacy component also answers for the default mediator id here
        locator.register_factory(DEFAULT_MEDIATOR, factory.clone());
        locator.register_factory(LEGACY_MEDIATOR, factory);
        locator
            .register(
                LEGACY_MEDIATOR,
                "Legacy",
                "Python",
                LanguageInfo {
                    supports: vec![Feature::Gotodef, Feature::Jumpsections, Feature::Symbolscope],
                    ..Default::default()
                },
            )
            .unwrap();
        CodeintelService::new(locator)
    }

    #[test]
    fn test_endpoint_defaults() {
        let options = GET_DEFINITION.options(Some("Python".to_string()));
        assert!(options.cache);
        assert_eq!(options.max_age, Some(Duration::from_secs(10)));
        assert_eq!(options.feature, Some(Feature::Gotodef));

        assert_eq!(GET_COMPLETIONS.options(None).max_age, Some(Duration::from_millis(200)));
        assert!(!SCAN.cache);
        assert_eq!(GET_CATALOGS.mediator, Some(DEFAULT_MEDIATOR));
        assert!(!LOAD_CATALOG.cache);
        assert_eq!(KEEPALIVE.options(None), CallOptions::default());
    }

    #[test]
    fn test_arguments_follow_endpoint_order() {
        let input = to_map(&BufferQuery {
            buf: "import os".to_string(),
            pos: 7,
            language: "Python".to_string(),
            ..Default::default()
        });

        assert_eq!(
            GET_DEFINITION.arguments(&input),
            vec![
                json!("import os"),
                json!(7),
                Value::Null,
                Value::Null,
                Value::Null,
                json!("Python")
            ]
        );
    }

    #[tokio::test]
    async fn test_endpoints_send_positional_arguments() {
        let recorder = Arc::new(Recorder::default());
        let service = service(&recorder);

        let result = service
            .get_definition(&BufferQuery {
                buf: "os.path".to_string(),
                pos: 3,
                path: Some("/src/main.py".to_string()),
                language: "Python".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result["args"][2], "/src/main.py");

        service
            .get_next_scope(&ScopeQuery {
                buf: "def a(): pass".to_string(),
                line: 4,
                language: "Python".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        service
            .get_symbols(&SymbolQuery {
                query: "foo".to_string(),
                symbol_type: Some("function".to_string()),
                language: Some("Python".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        service.load_catalog("Python", "pywin32").await.unwrap();

        let calls = recorder.calls();
        assert_eq!(calls[0].0, Method::GetDefinition);
        assert_eq!(calls[1], (Method::GetNextScope, json!(["def a(): pass", 4, "Python"])));
        assert_eq!(
            calls[2],
            (Method::GetSymbols, json!(["foo", null, null, "function", "Python", null]))
        );
        assert_eq!(calls[3], (Method::LoadCatalog, json!(["Python", "pywin32"])));
    }

    #[tokio::test]
    async fn test_cached_endpoint_is_served_once() {
        let recorder = Arc::new(Recorder::default());
        let service = service(&recorder);
        let query = BufferQuery {
            buf: "x".to_string(),
            pos: 1,
            language: "Python".to_string(),
            ..Default::default()
        };

        service.get_definition(&query).await.unwrap();
        service.get_definition(&query).await.unwrap();
        assert_eq!(recorder.calls().len(), 1);

        service.flush(None);
        service.get_definition(&query).await.unwrap();
        assert_eq!(recorder.calls().len(), 2);
    }

    #[test]
    fn test_language_and_feature_support() {
        let recorder = Arc::new(Recorder::default());
        let service = service(&recorder);

        assert!(service.supports_language("Python"));
        assert!(!service.supports_language("Go"));
        assert!(service.supports_feature(Feature::Gotodef, "Python"));
        assert!(!service.supports_feature(Feature::Completions, "Python"));
        assert!(!service.supports_feature(Feature::Gotodef, "Go"));
        assert_eq!(
            service.language_info("Python").map(|info| info.supports.len()),
            Some(3)
        );
    }
}
