//! Pipeline services: stores, thumbnail engine, event handler, dispatcher.

pub mod dispatcher;
pub mod image_locks;
pub mod metadata_store;
pub mod object_store;
pub mod pipeline;
pub mod retry;
pub mod thumbnail_engine;
pub mod traits;
