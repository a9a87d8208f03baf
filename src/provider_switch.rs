//! Guarantees at most one local model backend is active at a time.
//!
//! A single mutex guards the compare-stop-record sequence so two concurrent
//! callers can never both believe they own the switch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// A handle to a running local backend; `stop` must be synchronous and
/// idempotent enough to call once per switch. Held both by the caller and,
/// until superseded, by the switch itself — hence `Arc`, not `Box`.
pub trait ModelBridge: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &str;
    fn stop(&self);
}

/// Supplies a fresh bridge for a given backend kind; called only when the
/// switch decides a new local backend must be started.
#[async_trait]
pub trait BridgeFactory: Send + Sync + std::fmt::Debug {
    async fn start(&self, kind: &str) -> Arc<dyn ModelBridge>;
}

struct State {
    active_local_kind: Option<String>,
    active_bridge: Option<Arc<dyn ModelBridge>>,
}

/// Tracks the currently active local backend and stops the previous one
/// whenever a request switches to a different local kind. External kinds
/// (anything not in `local_kinds`) never affect this state.
pub struct ModelProviderSwitch {
    local_kinds: HashSet<String>,
    factory: Box<dyn BridgeFactory>,
    state: Mutex<State>,
}

impl std::fmt::Debug for ModelProviderSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProviderSwitch")
            .field("local_kinds", &self.local_kinds)
            .finish_non_exhaustive()
    }
}

impl ModelProviderSwitch {
    pub fn new(local_kinds: impl IntoIterator<Item = String>, factory: Box<dyn BridgeFactory>) -> Self {
        Self {
            local_kinds: local_kinds.into_iter().collect(),
            factory,
            state: Mutex::new(State {
                active_local_kind: None,
                active_bridge: None,
            }),
        }
    }

    #[must_use]
    pub fn is_local(&self, kind: &str) -> bool {
        self.local_kinds.contains(kind)
    }

    /// Request a bridge for `kind`. For local kinds, stops the previously
    /// active local backend (if different) before starting the new one;
    /// the compare-stop-record sequence is serialized by a single mutex so
    /// two concurrent callers can never both believe they own the switch.
    pub async fn request(&self, kind: &str) -> Arc<dyn ModelBridge> {
        if !self.is_local(kind) {
            return self.factory.start(kind).await;
        }

        {
            let state = self.state.lock().unwrap();
            if state.active_local_kind.as_deref() == Some(kind) {
                if let Some(bridge) = state.active_bridge.clone() {
                    return bridge;
                }
            }
        }

        let bridge = self.factory.start(kind).await;
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = state.active_bridge.take();
            state.active_local_kind = Some(kind.to_string());
            state.active_bridge = Some(bridge.clone());
            previous
        };
        if let Some(prev) = previous {
            prev.stop();
        }
        bridge
    }

    #[must_use]
    pub fn active_local_kind(&self) -> Option<String> {
        self.state.lock().unwrap().active_local_kind.clone()
    }
}
