//! REST implementation of the harvestdesk document store collaborator.

pub mod client;
pub mod encoding;
pub mod error;

pub use client::{FirestoreConfig, FirestoreRestStore};
pub use error::{DocumentStoreError, Result};
