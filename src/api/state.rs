use std::sync::Arc;

use crate::config::Config;
use crate::manager::SessionManager;

/// Shared application state, following `fileserver::AppState`'s shape of a
/// plain `Clone` struct holding `Arc`s rather than a single god-object.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}
