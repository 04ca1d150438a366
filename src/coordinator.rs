//! Wires the stores, the event bus and the engines together for one process.

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::orchestration::bus::EventBus;
use crate::orchestration::dispatch::DispatchEngine;
use crate::orchestration::health::{AgentLifecycle, HealthConfig, SweeperHandle};
use crate::state::{Layout, LockManager, Store};
use crate::team::{Mailbox, TeamStore};
use crate::tmux::{PaneController, Tmux};
use crate::{log, tlog, tlog_debug, Result};

/// Entry point for a process that takes part in coordination.
///
/// Every component shares one [`EventBus`]; the [`DispatchEngine`] is
/// attached to it on construction.
pub struct Coordinator {
    config: Config,
    layout: Layout,
    store: Store,
    bus: EventBus,
    teams: TeamStore,
    mailbox: Mailbox,
    tasks: Arc<TaskGraph>,
    agents: Arc<AgentLifecycle>,
    dispatch: Arc<DispatchEngine>,
}

impl Coordinator {
    /// Open the root found by [`Config::resolve_root`].
    pub fn open() -> Result<Self> {
        let root = Config::resolve_root()?;
        Self::open_at(&root)
    }

    /// Open `root`, loading its `config.toml` and logging to `root/logs`.
    pub fn open_at(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let layout = Layout::new(root);
        log::init(&layout.logs_dir());
        tlog!("Opening troupe root {}", root.display());
        Ok(Self::with_config(root, config, Arc::new(Tmux)))
    }

    pub fn with_config(root: &Path, config: Config, panes: Arc<dyn PaneController>) -> Self {
        tlog_debug!("Coordinator::with_config root={} config={:?}", root.display(), config);
        let layout = Layout::new(root);
        let store = Store::new(LockManager::with_timeout(config.lock_timeout()));
        let bus = EventBus::new();

        let tasks = Arc::new(TaskGraph::new(store, layout.clone(), bus.clone()));
        let agents = Arc::new(AgentLifecycle::new(
            HealthConfig::from(&config),
            store,
            layout.clone(),
            bus.clone(),
            Arc::clone(&tasks),
            panes,
        ));
        let dispatch = Arc::new(DispatchEngine::new(
            store,
            layout.clone(),
            Arc::clone(&tasks),
            Arc::clone(&agents),
            config.max_dispatch_depth,
        ));
        dispatch.attach(&bus);

        Self {
            teams: TeamStore::new(store, layout.clone()),
            mailbox: Mailbox::new(store, layout.clone()),
            config,
            layout,
            store,
            bus,
            tasks,
            agents,
            dispatch,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> Store {
        self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn teams(&self) -> &TeamStore {
        &self.teams
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn tasks(&self) -> &Arc<TaskGraph> {
        &self.tasks
    }

    pub fn agents(&self) -> &Arc<AgentLifecycle> {
        &self.agents
    }

    pub fn dispatch(&self) -> &Arc<DispatchEngine> {
        &self.dispatch
    }

    /// Start the periodic stale sweep for `team`.
    pub fn spawn_sweeper(&self, team: &str) -> SweeperHandle {
        self.agents.spawn_sweeper(team)
    }

    /// Detach dispatch and drop every bus subscription.
    pub fn shutdown(&self) {
        self.dispatch.detach();
        self.bus.clear();
        tlog_debug!("Coordinator shut down");
    }
}
