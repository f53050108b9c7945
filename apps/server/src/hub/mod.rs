//! The chat hub: per-connection sessions coordinated over the presence
//! registry, admission controller, and history store.

pub mod events;
pub mod mentions;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod session;
pub mod sweeper;

use std::sync::Arc;

use crate::config::Config;
use crate::history::HistoryStore;

use events::FrameLimits;
use ratelimit::AdmissionController;
use registry::PresenceRegistry;

/// Room every connection lands in at upgrade time.
pub const DEFAULT_ROOM: &str = "default";

/// Owns all chat state. Tests construct their own instance; nothing is
/// process-global.
pub struct Hub {
    pub config: Arc<Config>,
    pub history: HistoryStore,
    pub registry: PresenceRegistry,
    pub admission: AdmissionController,
    /// Serializes append → fan-out so delivery order matches persistence
    /// order across senders.
    publish: tokio::sync::Mutex<()>,
}

impl Hub {
    pub fn new(config: Arc<Config>, history: HistoryStore) -> Self {
        Self {
            admission: AdmissionController::new(
                config.rate_limit_capacity,
                config.rate_limit_refill_per_second,
            ),
            registry: PresenceRegistry::new(),
            history,
            publish: tokio::sync::Mutex::new(()),
            config,
        }
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            message_max_chars: self.config.message_max_chars,
            display_name_max_chars: self.config.display_name_max_chars,
        }
    }
}
