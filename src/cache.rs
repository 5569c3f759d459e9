use crate::models::{AggregatedResult, ProviderId, UsageSnapshot};
use std::collections::HashMap;

/// In-memory snapshot state per provider. Not durable across restarts.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    latest: HashMap<ProviderId, UsageSnapshot>,
    last_connected: HashMap<ProviderId, UsageSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace each provider's entry wholesale with the snapshot from `result`.
    pub fn update(&mut self, result: &AggregatedResult) {
        for snapshot in &result.providers {
            if snapshot.is_connected {
                self.last_connected
                    .insert(snapshot.provider_id, snapshot.clone());
            }
            self.latest.insert(snapshot.provider_id, snapshot.clone());
        }
    }

    /// Most recent snapshot, connected or not.
    pub fn get(&self, provider: ProviderId) -> Option<&UsageSnapshot> {
        self.latest.get(&provider)
    }

    /// Last connected snapshot when the latest one is disconnected, for
    /// "stale since" display.
    pub fn fallback(&self, provider: ProviderId) -> Option<&UsageSnapshot> {
        match self.get(provider) {
            Some(latest) if latest.is_connected => None,
            _ => self.last_connected.get(&provider),
        }
    }
}
