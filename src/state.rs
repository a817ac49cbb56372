//! Shared state carried by the router.

use crate::services::dispatcher::DispatcherHandle;
use crate::services::metadata_store::SqliteMetadataStore;
use crate::services::object_store::ObjectStore;

#[derive(Clone)]
pub struct AppState {
    pub objects: ObjectStore,
    pub metadata: SqliteMetadataStore,
    pub dispatcher: DispatcherHandle,
    /// Uploads into this bucket emit creation events.
    pub source_bucket: String,
}
