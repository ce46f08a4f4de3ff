use std::sync::Arc;
use std::time::Instant;

use crate::bridge::{BridgeRegistry, TerminalBridge};
use crate::config::AppConfig;
use crate::pipeline::{
    Coordinator, DefaultResolver, GitFetcher, PipelineSettings, RecipeResolver, RepoFetcher,
};
use crate::runtime::RuntimeHandle;
use crate::store::{SessionStoreHandle, Stores};
use crate::sweeper::Sweeper;
use crate::teardown::Teardown;

/// Everything the routes need, built once at startup and cloned per request.
#[derive(Clone)]
pub struct AppState {
    start: Instant,
    store_backend: &'static str,
    sessions: SessionStoreHandle,
    runtime: Arc<RuntimeHandle>,
    coordinator: Coordinator,
    bridge: TerminalBridge,
    teardown: Teardown,
    sweeper: Sweeper,
}

impl AppState {
    pub fn new(
        cfg: &AppConfig,
        stores: Stores,
        runtime: Arc<RuntimeHandle>,
        fetcher: Arc<dyn RepoFetcher>,
        resolver: Arc<dyn RecipeResolver>,
    ) -> Self {
        let bridges = BridgeRegistry::new();
        let settings = PipelineSettings {
            limits: cfg.resource_limits(),
            session_ttl: cfg.session_ttl,
            build_timeout: cfg.build_timeout,
            clone_timeout: cfg.clone_timeout,
            workers: cfg.build_workers,
        };
        let coordinator = Coordinator::new(
            stores.tasks.clone(),
            stores.sessions.clone(),
            runtime.clone(),
            fetcher,
            resolver,
            settings,
        );
        let bridge = TerminalBridge::new(stores.sessions.clone(), runtime.clone(), bridges.clone());
        let teardown = Teardown::new(stores.sessions.clone(), runtime.clone(), bridges);
        let sweeper = Sweeper::new(
            stores.sessions.clone(),
            runtime.clone(),
            teardown.clone(),
            cfg.sweep_interval,
            cfg.orphan_grace,
        );
        Self {
            start: Instant::now(),
            store_backend: stores.backend,
            sessions: stores.sessions,
            runtime,
            coordinator,
            bridge,
            teardown,
            sweeper,
        }
    }

    /// Production wiring: `git` for checkouts, the recipe crate for resolution.
    pub fn with_defaults(cfg: &AppConfig, stores: Stores, runtime: Arc<RuntimeHandle>) -> Self {
        Self::new(
            cfg,
            stores,
            runtime,
            Arc::new(GitFetcher),
            Arc::new(DefaultResolver),
        )
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn store_backend(&self) -> &'static str {
        self.store_backend
    }

    pub fn sessions(&self) -> &SessionStoreHandle {
        &self.sessions
    }

    pub fn runtime(&self) -> &Arc<RuntimeHandle> {
        &self.runtime
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn bridge(&self) -> &TerminalBridge {
        &self.bridge
    }

    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }
}
