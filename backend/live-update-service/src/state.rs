use crate::config::Config;
use crate::hub::{EventSender, FanoutHub};
use crate::sns::SubscriptionConfirmer;
use object_store::ObjectStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub hub: Arc<FanoutHub>,
    pub events: EventSender,
    pub confirmer: Arc<dyn SubscriptionConfirmer>,
    /// Set once startup provisioning has finished
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.hub.is_accepting()
    }
}
