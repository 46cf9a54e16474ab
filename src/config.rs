//! Tunables shared by the service and both binaries.

use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::query::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

/// Runtime configuration for [`DataService`](crate::service::DataService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Rows per INSERT statement during ingestion
    pub batch_size: usize,
    /// Page size used when the caller gives none (or garbage)
    pub default_page_size: u64,
    /// Upper bound for caller-supplied page sizes
    pub max_page_size: u64,
    /// Table name used when an upload asks for a dynamic table without naming one
    pub default_table_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            default_table_name: "demo".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_page_size(mut self, max_page_size: u64) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }
}
