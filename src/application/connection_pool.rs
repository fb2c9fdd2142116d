//! Connection Pool
//!
//! The set of edge connection handles, keyed by their stable index. Only the
//! supervisor inserts and removes; everything else reads.

use super::connection_handle::{ConnectionHandle, HandleSnapshot};
use crate::domain::entities::HandleState;
use crate::domain::value_objects::ConnIndex;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionPool {
    handles: DashMap<ConnIndex, Arc<ConnectionHandle>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.handles.insert(handle.index(), handle);
    }

    pub fn remove(&self, index: ConnIndex) -> Option<Arc<ConnectionHandle>> {
        self.handles.remove(&index).map(|(_, h)| h)
    }

    pub fn get(&self, index: ConnIndex) -> Option<Arc<ConnectionHandle>> {
        self.handles.get(&index).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.handles.iter().map(|e| e.value().clone()).collect()
    }

    fn count_in(&self, states: &[HandleState]) -> usize {
        self.handles
            .iter()
            .filter(|e| states.contains(&e.value().state()))
            .count()
    }

    /// Handles that are serving streams.
    pub fn active_count(&self) -> usize {
        self.count_in(&[HandleState::Active])
    }

    /// Handles that count toward the target: connecting or active.
    pub fn live_count(&self) -> usize {
        self.count_in(&[HandleState::Connecting, HandleState::Active])
    }

    pub fn connecting_count(&self) -> usize {
        self.count_in(&[HandleState::Connecting])
    }

    /// Number of handles ready to take traffic.
    pub fn ready_connections(&self) -> usize {
        self.active_count()
    }

    /// Lowest index not held by any handle, draining ones included.
    pub fn free_index(&self) -> Option<ConnIndex> {
        (0..=u8::MAX)
            .map(ConnIndex)
            .find(|idx| !self.handles.contains_key(idx))
    }

    /// Active handles with their in-flight stream counts.
    pub fn drain_candidates(&self) -> Vec<(ConnIndex, usize)> {
        self.handles
            .iter()
            .filter(|e| e.value().state() == HandleState::Active)
            .map(|e| (*e.key(), e.value().in_flight()))
            .collect()
    }

    /// Snapshots sorted by index.
    pub fn snapshot(&self) -> Vec<HandleSnapshot> {
        let mut snaps: Vec<HandleSnapshot> =
            self.handles.iter().map(|e| e.value().snapshot()).collect();
        snaps.sort_by_key(|s| s.index);
        snaps
    }
}
