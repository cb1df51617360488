//! Application state.

use std::sync::Arc;

use vcs_queue::{AdmissionController, JobRegistry};
use vcs_storage::Workspace;

use crate::config::ApiConfig;

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub registry: Arc<JobRegistry>,
    pub admission: AdmissionController,
    pub workspace: Workspace,
}

impl AppState {
    pub fn new(config: ApiConfig, registry: Arc<JobRegistry>, workspace: Workspace) -> Self {
        let admission = AdmissionController::new(Arc::clone(&registry));
        Self {
            config,
            registry,
            admission,
            workspace,
        }
    }
}
