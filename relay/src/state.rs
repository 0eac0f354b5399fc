use std::sync::Arc;

use crate::config::Config;
use crate::hub::RelayHub;

pub struct AppState {
    pub config: Config,
    pub hub: Arc<RelayHub>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let hub = RelayHub::new(config.request_timeout);
        Arc::new(Self { config, hub })
    }
}
