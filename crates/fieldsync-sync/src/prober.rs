//! # Capability Prober
//!
//! Works out which optional features a unit supports by probing the
//! endpoints that only exist when the feature does. A single failed
//! endpoint check reads as "not supported". When the unit answers neither
//! check nothing is cached and the next connect asks again.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use fieldsync_core::Capabilities;

use crate::cache::{DiagnosticCache, DiagnosticKey};
use crate::error::SyncResult;
use crate::unit::UnitApi;

/// Endpoint present on units that record audio.
pub const AUDIO_PROBE_PATH: &str = "/api/audio/audio-mode";

/// Endpoint present on units that support long recording windows.
pub const LONG_RECORDING_PROBE_PATH: &str = "/api/recording/long-recording";

/// Probes and caches per-unit capabilities.
#[derive(Clone)]
pub struct CapabilityProber {
    unit: Arc<dyn UnitApi>,
    cache: DiagnosticCache,
    ttl: Duration,
}

impl CapabilityProber {
    pub fn new(unit: Arc<dyn UnitApi>, cache: DiagnosticCache, ttl: Duration) -> Self {
        CapabilityProber { unit, cache, ttl }
    }

    /// Capabilities of the unit at `base_url`, served from cache within the TTL.
    /// An unreachable unit reads as having no optional features.
    pub async fn probe(&self, device_id: &str, base_url: &str) -> Capabilities {
        let unit = self.unit.clone();
        let url = base_url.to_string();

        let result = self
            .cache
            .get(device_id, DiagnosticKey::Capabilities, self.ttl, || async move {
                Self::probe_uncached(unit.as_ref(), &url).await
            })
            .await;

        match result {
            Ok(capabilities) => capabilities,
            Err(e) => {
                debug!(device_id, error = %e, "Capability check failed, not caching");
                Capabilities::default()
            }
        }
    }

    /// Drops the cached capabilities so the next probe hits the unit.
    pub async fn invalidate(&self, device_id: &str) {
        self.cache
            .invalidate(device_id, DiagnosticKey::Capabilities)
            .await;
    }

    async fn probe_uncached(unit: &dyn UnitApi, base_url: &str) -> SyncResult<Capabilities> {
        let (audio, long_recording) = tokio::join!(
            unit.probe(base_url, AUDIO_PROBE_PATH),
            unit.probe(base_url, LONG_RECORDING_PROBE_PATH),
        );

        let (audio, long_recording) = match (audio, long_recording) {
            (Err(e), Err(other)) if e.is_unreachable() && other.is_unreachable() => return Err(e),
            results => results,
        };

        let capabilities = Capabilities {
            audio: audio.unwrap_or(false),
            long_recording: long_recording.unwrap_or(false),
        };
        debug!(base_url, ?capabilities, "Probed unit capabilities");
        Ok(capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeUnit, FakeUnitDevice};

    const URL: &str = "http://10.0.0.5";

    #[tokio::test]
    async fn test_probe_reads_endpoints_and_caches() {
        let unit = Arc::new(FakeUnit::new());
        let mut device = FakeUnitDevice::new("100", "h1", "kea-watch");
        device.probes.insert(AUDIO_PROBE_PATH.into());
        unit.serve(URL, device);

        let prober = CapabilityProber::new(unit.clone(), DiagnosticCache::new(), Duration::from_secs(300));

        let caps = prober.probe("100", URL).await;
        assert!(caps.audio);
        assert!(!caps.long_recording);

        prober.probe("100", URL).await;
        assert_eq!(unit.call_count("probe"), 2);

        prober.invalidate("100").await;
        prober.probe("100", URL).await;
        assert_eq!(unit.call_count("probe"), 4);
    }

    #[tokio::test]
    async fn test_unreachable_unit_has_no_capabilities() {
        let unit = Arc::new(FakeUnit::new());
        let prober = CapabilityProber::new(unit, DiagnosticCache::new(), Duration::from_secs(300));

        assert_eq!(prober.probe("100", URL).await, Capabilities::default());
    }

    #[tokio::test]
    async fn test_unreachable_result_is_not_cached() {
        let unit = Arc::new(FakeUnit::new());
        let cache = DiagnosticCache::new();
        let prober = CapabilityProber::new(unit.clone(), cache.clone(), Duration::from_secs(300));

        assert_eq!(prober.probe("100", URL).await, Capabilities::default());
        assert!(cache.is_empty().await);

        let mut device = FakeUnitDevice::new("100", "h1", "kea-watch");
        device.probes.insert(AUDIO_PROBE_PATH.into());
        device.probes.insert(LONG_RECORDING_PROBE_PATH.into());
        unit.serve(URL, device);

        let caps = prober.probe("100", URL).await;
        assert!(caps.audio);
        assert!(caps.long_recording);
        assert_eq!(unit.call_count("probe"), 4);
    }
}
