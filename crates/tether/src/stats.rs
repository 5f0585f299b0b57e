/// Counters kept by a session across all of its epochs.
///
/// Snapshots are cheap copies; two snapshots can be subtracted with
/// [`BridgeStats::since`] to see what a piece of host code did at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BridgeStats {
    /// Native refcount increments performed by the bridge.
    pub increments: u64,
    /// Native refcount decrements performed by the bridge.
    pub decrements: u64,
    /// Releases that found their epoch dead and skipped the native decrement.
    pub skipped_releases: u64,
    /// Releases queued because the finalizing thread already held the lock.
    pub deferred_releases: u64,
    /// Native calls issued (wrapped and raw).
    pub calls: u64,
    /// Native calls that raised or crashed.
    pub native_faults: u64,
}

impl BridgeStats {
    /// Refcount units taken and not yet accounted for by a decrement or a skip.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.increments
            .saturating_sub(self.decrements)
            .saturating_sub(self.skipped_releases)
    }

    /// Counter deltas from `earlier` to `self`.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            increments: self.increments.saturating_sub(earlier.increments),
            decrements: self.decrements.saturating_sub(earlier.decrements),
            skipped_releases: self.skipped_releases.saturating_sub(earlier.skipped_releases),
            deferred_releases: self.deferred_releases.saturating_sub(earlier.deferred_releases),
            calls: self.calls.saturating_sub(earlier.calls),
            native_faults: self.native_faults.saturating_sub(earlier.native_faults),
        }
    }
}
