//! Remote method names used by the state and widget layers
//!
//! Each bridge flavor namespaces the same methods with its own prefix:
//! the OBS overlay uses `overlays_`, the satellite dashboard `dashboard_`.

/// Overlay bridge prefix
pub const OVERLAY_PREFIX: &str = "overlays_";

/// Dashboard bridge prefix
pub const DASHBOARD_PREFIX: &str = "dashboard_";

/// Full method names for one bridge flavor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodNames {
    pub acquire_state: String,
    pub free_state: String,
    pub state_update: String,
    pub set_config: String,
    pub widget_rpc: String,
    pub broadcast: String,
}

impl MethodNames {
    /// Build the method names for `prefix`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            acquire_state: format!("{prefix}acquireState"),
            free_state: format!("{prefix}freeState"),
            state_update: format!("{prefix}stateUpdate"),
            set_config: format!("{prefix}setConfig"),
            widget_rpc: format!("{prefix}widgetRPC"),
            broadcast: format!("{prefix}broadcast"),
        }
    }
}

impl Default for MethodNames {
    fn default() -> Self {
        Self::with_prefix("")
    }
}
