//! Byte filters applied to data crossing a bridge.
//!
//! A [`Filter`] sees every chunk in both directions. Outbound data flows from
//! the TCP side toward the WebSocket side, inbound data the other way. Filters
//! are threaded in registration order for both directions.

use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

/// Raised by a filter to abort the bridge it is running on.
#[derive(Error, Debug, Clone)]
#[error("filter {filter} failed: {message}")]
pub struct FilterError {
    /// Name of the filter that failed.
    pub filter: String,
    /// The chunk that triggered the failure.
    pub data: Vec<u8>,
    pub message: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, data: Vec<u8>, message: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            data,
            message: message.into(),
        }
    }
}

/// Transform applied to each forwarded chunk.
///
/// Returning an empty buffer suppresses the chunk. Returning an error closes
/// the bridge; a filter has no other way to influence the connection.
pub trait Filter: Send + Sync {
    /// Stable identifier, used in logs and failures.
    fn name(&self) -> &str;

    /// Data read from the TCP side, about to be sent over the WebSocket.
    fn on_outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        Ok(data)
    }

    /// Data received from the WebSocket, about to be written to the TCP side.
    fn on_inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        Ok(data)
    }
}

/// Immutable view of a [`FilterChain`] taken when a bridge is created.
#[derive(Clone, Default)]
pub struct FilterSnapshot(Arc<[Arc<dyn Filter>]>);

impl FilterSnapshot {
    pub fn apply_outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.thread(data, |filter, data| filter.on_outbound(data))
    }

    pub fn apply_inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.thread(data, |filter, data| filter.on_inbound(data))
    }

    fn thread(
        &self,
        mut data: Vec<u8>,
        apply: impl Fn(&dyn Filter, Vec<u8>) -> Result<Vec<u8>, FilterError>,
    ) -> Result<Vec<u8>, FilterError> {
        for filter in self.0.iter() {
            // suppressed
            if data.is_empty() {
                break;
            }
            data = apply(filter.as_ref(), data)?;
        }
        Ok(data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|f| f.name().to_string()).collect()
    }
}

impl From<Vec<Arc<dyn Filter>>> for FilterSnapshot {
    fn from(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self(filters.into())
    }
}

/// Ordered, shared list of filters installed on a proxy mapping.
///
/// Mutations replace the whole list, so snapshots held by running bridges
/// are never modified. New bridges pick up the change.
#[derive(Default)]
pub struct FilterChain {
    filters: RwLock<FilterSnapshot>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `filter` at the end of the chain.
    pub fn install(&self, filter: Arc<dyn Filter>) {
        let mut guard = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        let mut filters: Vec<Arc<dyn Filter>> = guard.0.to_vec();
        filters.push(filter);
        *guard = filters.into();
    }

    /// Removes the first occurrence of `filter` (same instance).
    ///
    /// Returns false when the filter was not installed.
    pub fn uninstall(&self, filter: &Arc<dyn Filter>) -> bool {
        let mut guard = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = guard.0.iter().position(|f| same_filter(f, filter)) else {
            return false;
        };
        let mut filters: Vec<Arc<dyn Filter>> = guard.0.to_vec();
        filters.remove(index);
        *guard = filters.into();
        true
    }

    #[must_use]
    pub fn snapshot(&self) -> FilterSnapshot {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl From<Vec<Arc<dyn Filter>>> for FilterChain {
    fn from(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self {
            filters: RwLock::new(filters.into()),
        }
    }
}

fn same_filter(a: &Arc<dyn Filter>, b: &Arc<dyn Filter>) -> bool {
    // Compare data pointers only, vtables may be duplicated across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}
