use axum::extract::FromRef;

use crate::dispatch::DispatchManager;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedDispatchManager = Arc<DispatchManager>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub manager: GuardedDispatchManager,
    pub hash: String,
}

impl FromRef<ServerState> for GuardedDispatchManager {
    fn from_ref(input: &ServerState) -> Self {
        input.manager.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
