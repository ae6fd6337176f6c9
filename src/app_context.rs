//! Process-wide context: configuration, the browser launcher, and the
//! state centers, with explicit lifecycle (`init` / `shutdown`).

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use artifact_store::ArtifactStore;
use browsermcp_registry::{registry_slot, RegistrySlot, ToolCtx, ToolRegistry};
use cdp_adapter::{BrowserConfig, Launcher};
use memory_center::MemoryCenter;
use policy_center::SafetyPolicy;
use session_center::SessionCenter;

pub struct AppContext {
    pub ctx: ToolCtx,
    pub registry: Arc<ToolRegistry>,
    pub slot: RegistrySlot,
}

impl AppContext {
    /// Build the full context from the environment and wire the registry.
    pub fn init() -> Self {
        let config = Arc::new(BrowserConfig::from_env());
        let launcher = Arc::new(Launcher::new(config.clone()));

        let download_root = config
            .download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("browsermcp-downloads"));
        let sessions = Arc::new(SessionCenter::with_defaults(download_root));

        let memory = Arc::new(MemoryCenter::new());
        if let Some(path) = Self::memory_path(&config) {
            match memory.load(&path, false) {
                Ok(0) => {}
                Ok(loaded) => info!(loaded, path = %path.display(), "agent memory loaded"),
                Err(err) => warn!(error = %err, "agent memory load failed"),
            }
        }

        let artifacts = Arc::new(ArtifactStore::new());
        let policy = Arc::new(SafetyPolicy::new());

        let ctx = ToolCtx {
            config,
            launcher,
            sessions,
            memory,
            artifacts,
            policy,
        };

        let slot = registry_slot();
        let registry = Arc::new(crate::server::create_default_registry(slot.clone()));
        let _ = slot.set(registry.clone());
        info!(tools = registry.len(), "tool registry ready");

        Self {
            ctx,
            registry,
            slot,
        }
    }

    pub fn memory_path(config: &BrowserConfig) -> Option<PathBuf> {
        config
            .agent_memory_dir
            .as_ref()
            .map(|dir| dir.join("agent_memory.json"))
    }

    /// Close sockets and stop an owned browser. Memory is persisted only
    /// through the explicit memory save operation, never implicitly.
    pub async fn shutdown(&self) {
        self.ctx.sessions.shutdown().await;
        self.ctx.launcher.stop().await;
    }
}
