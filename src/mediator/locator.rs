//! Service locator: mediator registry, selection and request dispatch
//!
//! Mediators are registered per language from what each backend reports.
//! [`ServiceLocator::call`] picks the mediator for a request, serves cacheable
//! requests from a short-lived result cache, coalesces identical in-flight
//! cacheable requests and holds cacheable requests back while the backend is
//! still starting.

use super::prefs::{Preferences, is_feature_enabled, mediator_pref_key};
use super::{
    DEFAULT_MEDIATOR, Feature, LanguageInfo, Mediator, MediatorError, MediatorFactory,
    MediatorMeta, Method,
};
use crate::log_timing;
use crate::rpc::DEFAULT_REQUEST_TIMEOUT;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{Level, debug, info, trace, warn};

/// Cache entries older than this are dropped on every call
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(60);

/// How often a held-back cacheable request re-checks readiness
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("No mediator available for language {language:?}")]
    NoMediator { language: Option<String> },

    #[error("Mediator {id} is already registered for {language}")]
    AlreadyRegistered { id: String, language: String },

    #[error(transparent)]
    Mediator(#[from] MediatorError),
}

/// Per-call routing and caching options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Serve from and store into the result cache; coalesce identical calls
    pub cache: bool,
    /// Maximum age of a cached result; None accepts any cached result
    pub max_age: Option<Duration>,
    /// Route to a mediator supporting this feature
    pub feature: Option<Feature>,
    /// Route to the master instance of this mediator, overriding the rest
    pub mediator: Option<String>,
    pub language: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(mut self, max_age: Option<Duration>) -> Self {
        self.cache = true;
        self.max_age = max_age;
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn mediator(mut self, id: impl Into<String>) -> Self {
        self.mediator = Some(id.into());
        self
    }

    pub fn language(mut self, language: Option<impl Into<String>>) -> Self {
        self.language = language.map(Into::into);
        self
    }
}

/// Identity of a request for caching and coalescing
///
/// Strings contribute their length, numbers and booleans their value and
/// anything else nothing; an explicit mediator id is appended.
///
/// The routing language is not part of the id. Two cacheable calls whose
/// arguments only differ in same-length strings (`getKeywords` for "Python"
/// and "Pascal") share a cache entry and an in-flight slot; callers needing
/// them apart pass an explicit mediator or skip the cache.
pub fn request_id(method: Method, args: &[Value], mediator: Option<&str>) -> String {
    let mut id = method.as_str().to_string();
    for arg in args {
        match arg {
            Value::String(s) => id.push_str(&s.chars().count().to_string()),
            Value::Number(n) => id.push_str(&n.to_string()),
            Value::Bool(b) => id.push_str(&b.to_string()),
            _ => {}
        }
    }
    if let Some(mediator) = mediator {
        id.push_str(mediator);
    }
    id
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

type Waiter = oneshot::Sender<Result<Value, MediatorError>>;
type InstanceKey = (String, Option<String>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mediator registry and request dispatcher
pub struct ServiceLocator {
    prefs: Arc<dyn Preferences>,
    factories: RwLock<HashMap<String, Arc<dyn MediatorFactory>>>,

    /// language -> registrations, in registration order
    registered: Mutex<BTreeMap<String, Vec<MediatorMeta>>>,

    /// (mediator id, language) -> instance; language None is the master
    instanced: Mutex<HashMap<InstanceKey, Arc<dyn Mediator>>>,

    cache: Mutex<HashMap<String, CacheEntry>>,

    /// request id -> callers waiting on the request already in flight
    in_flight: Mutex<HashMap<String, Vec<Waiter>>>,

    retry_interval: Duration,
    request_timeout: Duration,
}

impl ServiceLocator {
    pub fn new(prefs: Arc<dyn Preferences>) -> Self {
        Self {
            prefs,
            factories: RwLock::new(HashMap::new()),
            registered: Mutex::new(BTreeMap::new()),
            instanced: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Bound on how long a cacheable call waits for its mediator to become ready
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    pub fn register_factory(&self, id: impl Into<String>, factory: Arc<dyn MediatorFactory>) {
        let id = id.into();
        debug!("Registering mediator factory {}", id);
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(id, factory);
        }
    }

    pub fn factory_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .factories
            .read()
            .map(|factories| factories.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn factory(&self, id: &str) -> Option<Arc<dyn MediatorFactory>> {
        self.factories.read().ok()?.get(id).cloned()
    }

    /// Register mediator `id` as able to serve `language`
    pub fn register(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        language: impl Into<String>,
        info: LanguageInfo,
    ) -> Result<(), LocatorError> {
        let id = id.into();
        let language = language.into();

        let mut registered = lock(&self.registered);
        let metas = registered.entry(language.clone()).or_default();
        if metas.iter().any(|meta| meta.id == id) {
            return Err(LocatorError::AlreadyRegistered { id, language });
        }

        trace!("Registering {} for {}", id, language);
        metas.push(MediatorMeta {
            id,
            name: name.into(),
            language,
            info,
        });
        Ok(())
    }

    /// Unregister `id` for one language, or for every language when None
    ///
    /// Instances created for the affected languages are stopped.
    pub fn unregister(&self, id: &str, language: Option<&str>) {
        let languages: Vec<String> = {
            let mut registered = lock(&self.registered);
            let languages: Vec<String> = match language {
                Some(language) => vec![language.to_string()],
                None => registered.keys().cloned().collect(),
            };

            languages
                .into_iter()
                .filter(|language| {
                    registered.get_mut(language).is_some_and(|metas| {
                        let before = metas.len();
                        metas.retain(|meta| meta.id != id);
                        metas.len() != before
                    })
                })
                .collect()
        };

        let stopped: Vec<Arc<dyn Mediator>> = {
            let mut instanced = lock(&self.instanced);
            languages
                .iter()
                .filter_map(|language| instanced.remove(&(id.to_string(), Some(language.clone()))))
                .collect()
        };

        if !languages.is_empty() {
            debug!("Unregistered {} for {} language(s)", id, languages.len());
        }
        for mediator in stopped {
            mediator.stop();
        }
    }

    /// Every registered mediator id, in first-registration order
    pub fn mediator_ids(&self) -> Vec<String> {
        let registered = lock(&self.registered);
        let mut ids: Vec<String> = Vec::new();
        for meta in registered.values().flatten() {
            if !ids.contains(&meta.id) {
                ids.push(meta.id.clone());
            }
        }
        ids
    }

    pub fn languages(&self) -> Vec<String> {
        lock(&self.registered)
            .iter()
            .filter(|(_, metas)| !metas.is_empty())
            .map(|(language, _)| language.clone())
            .collect()
    }

    pub fn mediators_for_language(&self, language: &str) -> Vec<MediatorMeta> {
        lock(&self.registered)
            .get(language)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the user left `feature` switched on
    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        is_feature_enabled(self.prefs.as_ref(), feature)
    }

    /// Registration chosen for `language`: the preferred one if set, otherwise
    /// the default mediator if registered, otherwise the first registered
    fn meta_for_language(&self, language: &str, force_default: bool) -> Option<MediatorMeta> {
        let preferred = if force_default {
            None
        } else {
            self.prefs
                .get_string(&mediator_pref_key(language))
                .filter(|id| !id.is_empty())
        };

        let registered = lock(&self.registered);
        let metas = registered.get(language)?;

        match preferred {
            Some(id) => {
                let meta = metas.iter().find(|meta| meta.id == id);
                if meta.is_none() {
                    debug!("Preferred mediator {} is not registered for {}", id, language);
                }
                meta.cloned()
            }
            None => metas
                .iter()
                .find(|meta| meta.id == DEFAULT_MEDIATOR)
                .or_else(|| metas.first())
                .cloned(),
        }
    }

    pub fn language_info(&self, language: &str) -> Option<LanguageInfo> {
        self.meta_for_language(language, false).map(|meta| meta.info)
    }

    fn instance(&self, key: InstanceKey, meta: Option<MediatorMeta>) -> Option<Arc<dyn Mediator>> {
        if let Some(mediator) = lock(&self.instanced).get(&key) {
            return Some(Arc::clone(mediator));
        }

        let Some(factory) = self.factory(&key.0) else {
            warn!("No mediator factory registered for {}", key.0);
            return None;
        };
        let created = factory.create(meta);

        let mut instanced = lock(&self.instanced);
        Some(Arc::clone(instanced.entry(key).or_insert(created)))
    }

    /// Language-less master instance of mediator `id`
    pub fn mediator_by_id(&self, id: &str) -> Option<Arc<dyn Mediator>> {
        self.instance((id.to_string(), None), None)
    }

    /// Mediator instance serving `language`
    ///
    /// Without a language this is the master default mediator. A preference
    /// naming a mediator not registered for the language yields None unless
    /// `force_default` ignores the preference.
    pub fn mediator_by_language(
        &self,
        language: Option<&str>,
        force_default: bool,
    ) -> Option<Arc<dyn Mediator>> {
        let Some(language) = language.filter(|language| !language.is_empty()) else {
            return self.mediator_by_id(DEFAULT_MEDIATOR);
        };

        let meta = self.meta_for_language(language, force_default)?;
        self.instance((meta.id.clone(), Some(language.to_string())), Some(meta))
    }

    /// The preferred mediator for `language` if it supports `feature`,
    /// otherwise the default one if it does
    pub fn mediator_by_feature(
        &self,
        feature: Feature,
        language: Option<&str>,
    ) -> Option<Arc<dyn Mediator>> {
        if let Some(mediator) = self.mediator_by_language(language, false)
            && mediator.supports(feature)
        {
            return Some(mediator);
        }

        self.mediator_by_language(language, true)
            .filter(|mediator| mediator.supports(feature))
    }

    /// Stop every instanced mediator and forget the instances
    pub fn stop_all(&self) {
        let instances: Vec<Arc<dyn Mediator>> =
            lock(&self.instanced).drain().map(|(_, mediator)| mediator).collect();
        for mediator in instances {
            mediator.stop();
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn resolve(&self, options: &CallOptions) -> Option<Arc<dyn Mediator>> {
        let language = options.language.as_deref();
        if let Some(id) = &options.mediator {
            self.mediator_by_id(id)
        } else if let Some(feature) = options.feature {
            self.mediator_by_feature(feature, language)
        } else {
            self.mediator_by_language(language, false)
        }
    }

    /// Route a request to the right mediator
    pub async fn call(
        &self,
        method: Method,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, LocatorError> {
        trace!("Mediating request for {}", method);
        self.gc();

        let Some(mediator) = self.resolve(&options) else {
            debug!("Could not find a mediator for language {:?}", options.language);
            return Err(LocatorError::NoMediator {
                language: options.language,
            });
        };

        let id = request_id(method, &args, options.mediator.as_deref());

        if !options.cache {
            self.wait_until_ready(mediator.as_ref(), false).await?;
            return Ok(mediator.request(method, Value::Array(args)).await?);
        }

        if let Some(value) = self.cached(&id, options.max_age) {
            trace!("Returning cached result for {}", id);
            return Ok(value);
        }

        let receiver = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(&id) {
                Some(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Some(receiver)
                }
                None => {
                    in_flight.insert(id.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(receiver) = receiver {
            debug!("{} is already in flight, waiting for its result", id);
            let result = receiver.await.unwrap_or(Err(MediatorError::Abandoned));
            return Ok(result?);
        }

        let guard = InFlight {
            locator: self,
            id: &id,
        };

        let started = Instant::now();
        let result = match self.wait_until_ready(mediator.as_ref(), true).await {
            Ok(()) => mediator.request(method, Value::Array(args)).await,
            Err(e) => Err(e),
        };
        log_timing!(Level::DEBUG, method.as_str(), started.elapsed());

        if let Ok(value) = &result {
            trace!("Caching {}", id);
            lock(&self.cache).insert(
                id.clone(),
                CacheEntry {
                    value: value.clone(),
                    stored_at: Instant::now(),
                },
            );
        }

        guard.complete(&result);
        Ok(result?)
    }

    /// Fail fast or hold back while the mediator is not ready
    async fn wait_until_ready(
        &self,
        mediator: &dyn Mediator,
        cacheable: bool,
    ) -> Result<(), MediatorError> {
        if mediator.is_ready() {
            return Ok(());
        }
        if mediator.is_failing() {
            warn!("Cannot fulfill service request as mediator is failing");
            return Err(MediatorError::Failing);
        }
        if !cacheable {
            warn!("Cannot fulfill service request while mediator isn't ready");
            return Err(MediatorError::NotReady);
        }

        info!("Waiting for mediator {}", mediator.id());
        let deadline = Instant::now() + self.request_timeout;
        loop {
            tokio::time::sleep(self.retry_interval).await;
            if mediator.is_ready() {
                return Ok(());
            }
            if mediator.is_failing() {
                return Err(MediatorError::Failing);
            }
            if Instant::now() >= deadline {
                return Err(MediatorError::NotReady);
            }
        }
    }

    fn cached(&self, id: &str, max_age: Option<Duration>) -> Option<Value> {
        let cache = lock(&self.cache);
        let entry = cache.get(id)?;
        match max_age {
            Some(max_age) if entry.stored_at.elapsed() >= max_age => None,
            _ => Some(entry.value.clone()),
        }
    }

    fn gc(&self) {
        lock(&self.cache).retain(|_, entry| entry.stored_at.elapsed() <= CACHE_MAX_AGE);
    }

    /// Drop one cached result, or all of them
    pub fn flush(&self, id: Option<&str>) {
        debug!("Flushing cache {:?}", id);
        let mut cache = lock(&self.cache);
        match id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }
}

/// Removes an in-flight entry when the leading call finishes or is dropped
///
/// Waiters left behind by a dropped leader see their sender dropped.
struct InFlight<'a> {
    locator: &'a ServiceLocator,
    id: &'a str,
}

impl InFlight<'_> {
    fn complete(self, result: &Result<Value, MediatorError>) {
        let waiters = lock(&self.locator.in_flight).remove(self.id);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.locator.in_flight).remove(self.id);
    }
}
