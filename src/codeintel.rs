//! Codeintel runtime
//!
//! Ties the supervisor, the mediators and the service locator together.
//! Once the backend first reports ready, every engine is asked which
//! languages it serves and is registered for them. While the backend runs a
//! keepalive request is sent periodically so it does not shut itself down.

use crate::mediator::{
    CallOptions, DEFAULT_MEDIATOR, Feature, LEGACY_MEDIATOR, LegacyComponent,
    LegacyMediatorFactory, LocatorError, MediatorFactory, Method, Preferences, RpcChannel,
    RpcMediatorFactory, ServiceLocator, parse_languages,
};
use crate::process::{ConfigError, EventKind, Supervisor, SupervisorConfig, SupervisorError};
use crate::service::CodeintelService;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime settings on top of the supervisor's
#[derive(Debug, Clone)]
pub struct CodeintelConfig {
    /// Period of the keepalive request while the backend runs
    pub keepalive_interval: Duration,
    /// Deadline for a single mediator request
    pub request_timeout: Duration,
    /// How often held-back requests re-check readiness
    pub retry_interval: Duration,
}

impl Default for CodeintelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            request_timeout: crate::rpc::DEFAULT_REQUEST_TIMEOUT,
            retry_interval: crate::mediator::locator::DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl CodeintelConfig {
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, what) in [
            (self.keepalive_interval, "keepalive interval"),
            (self.request_timeout, "request timeout"),
            (self.retry_interval, "retry interval"),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    value,
                    format!("{} must be greater than zero", what),
                ));
            }
        }
        Ok(())
    }
}

/// A source of mediators asked for its languages once the backend is up
struct Engine {
    id: &'static str,
    name: &'static str,
}

const ENGINES: [Engine; 2] = [
    Engine {
        id: DEFAULT_MEDIATOR,
        name: "CodeIntel",
    },
    Engine {
        id: LEGACY_MEDIATOR,
        name: "Legacy",
    },
];

struct Inner {
    config: CodeintelConfig,
    supervisor: Supervisor,
    locator: Arc<ServiceLocator>,
    service: CodeintelService,
    channel: Arc<RpcChannel>,

    /// Set when language registration starts; cleared by `stop`
    registering: AtomicBool,
    /// True once every engine's languages are registered
    services_ready: watch::Sender<bool>,

    keepalive: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<JoinHandle<()>>>,
}

/// Runtime handle; cheap to clone
#[derive(Clone)]
pub struct Codeintel {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Codeintel {
    /// Build the runtime; nothing is spawned until [`Codeintel::start`]
    ///
    /// `legacy` serves the languages the backend does not.
    pub fn new(
        supervisor_config: SupervisorConfig,
        config: CodeintelConfig,
        prefs: Arc<dyn Preferences>,
        legacy: Option<Arc<dyn LegacyComponent>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let supervisor = Supervisor::new(supervisor_config);
        let locator = Arc::new(
            ServiceLocator::new(prefs)
                .with_retry_interval(config.retry_interval)
                .with_request_timeout(config.request_timeout),
        );

        let all_features: HashSet<Feature> = Feature::ALL.iter().copied().collect();
        let channel = RpcChannel::new(supervisor.clone(), config.request_timeout);
        let rpc: Arc<dyn MediatorFactory> = Arc::new(RpcMediatorFactory::new(
            Arc::clone(&channel),
            all_features.clone(),
        ));
        locator.register_factory(DEFAULT_MEDIATOR, rpc);

        if let Some(component) = legacy {
            let factory = LegacyMediatorFactory::new(component, all_features)
                .with_request_timeout(config.request_timeout);
            locator.register_factory(LEGACY_MEDIATOR, Arc::new(factory));
        }

        let (services_ready, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            service: CodeintelService::new(Arc::clone(&locator)),
            config,
            supervisor,
            locator,
            channel,
            registering: AtomicBool::new(false),
            services_ready,
            keepalive: Mutex::new(None),
            registration: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.supervisor.on(EventKind::Started, move |_| {
            Self::on_server_ready(&weak);
        });

        Ok(Self { inner })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.inner.locator
    }

    pub fn service(&self) -> &CodeintelService {
        &self.inner.service
    }

    /// True once the engines' languages are registered
    pub fn is_ready(&self) -> bool {
        *self.inner.services_ready.borrow()
    }

    /// Wait until the engines' languages are registered
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut receiver = self.inner.services_ready.subscribe();
        match tokio::time::timeout(timeout, receiver.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            _ if self.inner.supervisor.is_failing() => Err(SupervisorError::Failing {
                attempts: self.inner.supervisor.snapshot().restart_attempts,
            }),
            _ => Err(SupervisorError::startup_timeout(timeout)),
        }
    }

    /// Start the backend and the keepalive loop
    pub async fn start(&self) -> Result<(), SupervisorError> {
        info!("Starting codeintel");
        self.inner.supervisor.start().await?;
        self.spawn_keepalive();
        Ok(())
    }

    /// Stop the keepalive loop, drop every mediator instance and shut the
    /// backend down
    pub async fn stop(&self) {
        info!("Stopping codeintel");
        if let Some(handle) = lock(&self.inner.keepalive).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.registration).take() {
            handle.abort();
        }

        self.inner.locator.stop_all();
        self.inner.locator.unregister(DEFAULT_MEDIATOR, None);
        self.inner.channel.disconnect();
        self.inner.supervisor.shutdown().await;

        self.inner.registering.store(false, Ordering::SeqCst);
        self.inner.services_ready.send_replace(false);
    }

    fn on_server_ready(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.registering.swap(true, Ordering::SeqCst) {
            debug!("Languages already registered, skipping");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Backend ready outside a runtime, languages not registered");
            inner.registering.store(false, Ordering::SeqCst);
            return;
        };

        let task_inner = Arc::clone(&inner);
        let handle = runtime.spawn(async move {
            for engine in &ENGINES {
                if let Err(e) = Self::register_engine(&task_inner, engine).await {
                    error!("Could not register languages of {}: {}", engine.name, e);
                }
            }
            info!(
                "Codeintel services ready for {} language(s)",
                task_inner.locator.languages().len()
            );
            task_inner.services_ready.send_replace(true);
        });
        *lock(&inner.registration) = Some(handle);
    }

    async fn register_engine(inner: &Inner, engine: &Engine) -> Result<(), LocatorError> {
        if !inner.locator.factory_ids().iter().any(|id| id == engine.id) {
            debug!("{} is not configured", engine.name);
            return Ok(());
        }

        let reply = inner
            .locator
            .call(
                Method::GetLanguages,
                Vec::new(),
                CallOptions::new().mediator(engine.id),
            )
            .await?;
        let languages = parse_languages(reply)?;

        for (language, info) in languages {
            let name = format!("{}: {}", engine.name, language);
            if let Err(e) = inner.locator.register(engine.id, name, language, info) {
                warn!("{}", e);
            }
        }
        Ok(())
    }

    fn spawn_keepalive(&self) {
        let mut slot = lock(&self.inner.keepalive);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.keepalive_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.supervisor.is_ready() {
                    continue;
                }
                if let Err(e) = inner.service.keepalive().await {
                    debug!("Keepalive failed: {}", e);
                }
            }
        }));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mediator::prefs::mediator_pref_key;
    use crate::mediator::{LegacyCompletion, LegacyError, MemoryPreferences};
    use crate::process::ProcessStatus;
    use crate::test_utils::backend::backend_announcing;
    use crate::test_utils::rpc_server::{FakeRpcServer, ok};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;

    struct TclComponent;

    impl LegacyComponent for TclComponent {
        fn implements(&self, method: Method) -> bool {
            matches!(method, Method::GetLanguages | Method::Keepalive)
        }

        fn get_languages(&self, _args: &Value, done: LegacyCompletion) -> Result<(), LegacyError> {
            done.complete(0, r#"{"Tcl": {"supports": ["symbolbrowser"], "api": "legacy"}}"#);
            Ok(())
        }
    }

    async fn backend_server(keepalives: Arc<AtomicUsize>) -> FakeRpcServer {
        FakeRpcServer::start(move |request| match request.method.as_str() {
            "getLanguages" => ok(
                request,
                json!({
                    "Python": {"supports": ["gotodef", "completions"], "api": "codeintel"},
                    "JavaScript": {"supports": ["symbolbrowser"], "api": "codeintel"}
                }),
            ),
            "keepalive" => {
                keepalives.fetch_add(1, Ordering::SeqCst);
                ok(request, Value::Null)
            }
            _ => ok(request, Value::Null),
        })
        .await
    }

    #[test]
    fn test_config_validation() {
        assert!(CodeintelConfig::default().validate().is_ok());
        assert!(matches!(
            CodeintelConfig::default()
                .with_keepalive_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::InvalidTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_languages_register_once_backend_is_ready() {
        let keepalives = Arc::new(AtomicUsize::new(0));
        let server = backend_server(Arc::clone(&keepalives)).await;
        let backend = backend_announcing(server.port);

        let codeintel = Codeintel::new(
            backend.config().build().unwrap(),
            CodeintelConfig::default().with_keepalive_interval(Duration::from_millis(50)),
            Arc::new(MemoryPreferences::new()),
            Some(Arc::new(TclComponent)),
        )
        .unwrap();
        assert!(!codeintel.is_ready());

        codeintel.start().await.unwrap();
        codeintel
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            codeintel.locator().languages(),
            vec!["JavaScript", "Python", "Tcl"]
        );
        let python = codeintel.locator().mediators_for_language("Python");
        assert_eq!(python[0].id, DEFAULT_MEDIATOR);
        assert_eq!(python[0].name, "CodeIntel: Python");
        assert_eq!(
            codeintel.locator().mediators_for_language("Tcl")[0].id,
            LEGACY_MEDIATOR
        );
        assert!(codeintel.service().supports_feature(Feature::Gotodef, "Python"));
        assert!(!codeintel.service().supports_feature(Feature::Gotodef, "Tcl"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(keepalives.load(Ordering::SeqCst) >= 1);

        codeintel.stop().await;
        assert_eq!(codeintel.supervisor().status(), ProcessStatus::Stopped);
        assert!(!codeintel.is_ready());
        assert_eq!(codeintel.locator().mediator_ids(), vec![LEGACY_MEDIATOR]);
    }

    #[tokio::test]
    async fn test_restart_does_not_register_twice() {
        let server = backend_server(Arc::new(AtomicUsize::new(0))).await;
        let backend = backend_announcing(server.port);
        let prefs = Arc::new(MemoryPreferences::new());
        prefs.set_string(&mediator_pref_key("Python"), DEFAULT_MEDIATOR);
        assert_eq!(
            prefs.get_string(&mediator_pref_key("Python")).as_deref(),
            Some(DEFAULT_MEDIATOR)
        );

        let codeintel = Codeintel::new(
            backend.config().build().unwrap(),
            CodeintelConfig::default(),
            prefs,
            None,
        )
        .unwrap();
        codeintel.start().await.unwrap();
        codeintel
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();

        codeintel.supervisor().restart().await.unwrap();
        codeintel
            .supervisor()
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(codeintel.locator().mediators_for_language("Python").len(), 1);
        assert_eq!(codeintel.locator().mediator_ids(), vec![DEFAULT_MEDIATOR]);

        codeintel.stop().await;
    }
}
