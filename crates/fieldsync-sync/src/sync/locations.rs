//! Station sync.
//!
//! ```text
//!  1. pending creation → merge into a nearby backend station, or create
//!  2. pending rename   → push the staged name (404 drops the local row)
//!  3. pull             → mirror backend stations for every group in use
//! ```
//!
//! A station with a staged rename keeps its local name during the pull.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldsync_core::geo::distance_m;
use fieldsync_core::validation::{validate_accuracy, validate_coords};
use fieldsync_core::{Coords, Device, Location};

use super::{SyncEngine, SyncReport};
use crate::backend::RemoteStation;
use crate::error::{SyncError, SyncResult};
use crate::unit::UnitLocation;

impl SyncEngine {
    pub(super) async fn sync_locations(&self, report: &mut SyncReport) {
        if let Err(e) = self.push_pending_creations(report).await {
            warn!(error = %e, "Station creation stopped");
            report.errors += 1;
        }
        if let Err(e) = self.push_pending_renames(report).await {
            warn!(error = %e, "Station renames stopped");
            report.errors += 1;
        }
        if let Err(e) = self.pull_stations(report).await {
            warn!(error = %e, "Station pull stopped");
            report.errors += 1;
        }
    }

    async fn push_pending_creations(&self, report: &mut SyncReport) -> SyncResult<()> {
        let locations = self.db.locations();
        let is_prod = self.config.is_prod_environment();
        let mut denied: HashSet<String> = HashSet::new();

        for pending in locations.pending_creation().await? {
            if !self.is_active() {
                break;
            }
            if pending.is_prod_environment != is_prod || denied.contains(&pending.group_name) {
                continue;
            }

            // Another device may have created the same site since this
            // one was recorded.
            let known: Vec<Location> = locations
                .list_for_group(&pending.group_name, is_prod)
                .await?
                .into_iter()
                .filter(Location::is_server_known)
                .collect();
            if let Some(target) = self.matcher.find_merge_target(&pending, &known) {
                info!(
                    station_id = %pending.id,
                    into = %target.id,
                    name = %pending.name,
                    "Merging offline station into existing one"
                );
                locations.rename_local(&target.id, &pending.name).await?;
                locations.delete(&pending.id).await?;
                report.stations_synced += 1;
                continue;
            }

            match self
                .backend
                .create_station(&pending.group_name, &pending.name, pending.coords)
                .await
            {
                Ok(server_id) => {
                    locations.mark_created(&pending.id, &server_id).await?;
                    report.stations_synced += 1;
                    info!(station_id = %pending.id, server_id = %server_id, "Station created on backend");
                }
                Err(e) if e.is_access_error() => {
                    warn!(group = %pending.group_name, error = %e, "Station creation forbidden");
                    self.note_group_denied(&pending.group_name, report).await;
                    denied.insert(pending.group_name.clone());
                }
                Err(e) => {
                    warn!(station_id = %pending.id, error = %e, "Station creation failed");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    async fn push_pending_renames(&self, report: &mut SyncReport) -> SyncResult<()> {
        let locations = self.db.locations();
        let is_prod = self.config.is_prod_environment();

        for pending in locations.pending_rename().await? {
            if !self.is_active() {
                break;
            }
            if pending.is_prod_environment != is_prod {
                continue;
            }
            let (Some(server_id), Some(name)) =
                (pending.server_id.as_deref(), pending.update_name_not_yet_synced.as_deref())
            else {
                continue;
            };

            match self.backend.rename_station(server_id, name).await {
                Ok(()) => {
                    locations.mark_rename_synced(&pending.id).await?;
                    report.stations_synced += 1;
                    info!(station_id = %pending.id, name, "Station rename pushed");
                }
                Err(SyncError::NotFound(_)) => {
                    info!(station_id = %pending.id, server_id, "Station gone on backend, dropping it");
                    locations.delete(&pending.id).await?;
                }
                Err(e) if e.is_access_error() => {
                    warn!(station_id = %pending.id, error = %e, "Station rename forbidden");
                    self.note_group_denied(&pending.group_name, report).await;
                }
                Err(e) => {
                    warn!(station_id = %pending.id, error = %e, "Station rename failed");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    async fn pull_stations(&self, report: &mut SyncReport) -> SyncResult<()> {
        let is_prod = self.config.is_prod_environment();

        let mut groups: BTreeSet<String> = self
            .registry
            .connected()
            .await
            .into_iter()
            .filter(|d| d.is_prod_environment == is_prod)
            .map(|d| d.group)
            .collect();
        groups.extend(
            self.db
                .locations()
                .list_all()
                .await?
                .into_iter()
                .filter(|l| l.is_prod_environment == is_prod)
                .map(|l| l.group_name),
        );

        for group in groups {
            if !self.is_active() {
                break;
            }
            match self.backend.list_stations(&group).await {
                Ok(remote) => {
                    for station in remote {
                        if self.mirror_station(&group, is_prod, station).await? {
                            report.stations_synced += 1;
                        }
                    }
                }
                Err(e) => {
                    debug!(group = %group, error = %e, "Station list failed");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Stores or refreshes one backend station. Returns true if a row changed.
    async fn mirror_station(&self, group: &str, is_prod: bool, remote: RemoteStation) -> SyncResult<bool> {
        let locations = self.db.locations();

        match locations.get_by_server_id(&remote.id, is_prod).await? {
            None => {
                let location = Location {
                    id: Uuid::new_v4().to_string(),
                    server_id: Some(remote.id),
                    name: remote.name,
                    update_name_not_yet_synced: None,
                    coords: remote.coords,
                    accuracy_m: 0.0,
                    group_name: group.to_string(),
                    is_prod_environment: is_prod,
                    needs_creation: false,
                    needs_rename: false,
                    updated_at: Utc::now(),
                };
                locations.insert(&location).await?;
                debug!(station_id = %location.id, name = %location.name, "Backend station stored");
                Ok(true)
            }
            Some(local) if local.needs_rename => Ok(false),
            Some(mut local) => {
                if local.name == remote.name && local.coords == remote.coords {
                    return Ok(false);
                }
                local.name = remote.name;
                local.coords = remote.coords;
                local.updated_at = Utc::now();
                locations.update(&local).await?;
                Ok(true)
            }
        }
    }

    /// Records a group the user cannot write to, if the backend confirms it.
    async fn note_group_denied(&self, group: &str, report: &mut SyncReport) {
        match self.backend.user_has_group_access(group).await {
            Ok(false) => {
                if !report.needs_group_access.iter().any(|g| g == group) {
                    report.needs_group_access.push(group.to_string());
                }
            }
            Ok(true) | Err(_) => report.errors += 1,
        }
    }

    // =========================================================================
    // Unit location
    // =========================================================================

    /// Stores the host's GPS fix on a unit when the unit has none, or when
    /// the unit's fix is outside the merge radius of it. Returns true if
    /// the unit was updated.
    pub async fn push_unit_location(
        &self,
        device: &Device,
        coords: Coords,
        accuracy_m: f64,
    ) -> SyncResult<bool> {
        let coords = validate_coords(coords.lat, coords.lng)?;
        let accuracy_m = validate_accuracy(accuracy_m)?;

        let current = self.unit.get_location(&device.url).await?;
        let stale = match &current {
            None => true,
            Some(loc) if loc.is_unset() => true,
            Some(loc) => distance_m(loc.coords(), coords) >= self.matcher.merge_radius(accuracy_m),
        };
        if !stale {
            return Ok(false);
        }

        let location = UnitLocation {
            lat: coords.lat,
            lng: coords.lng,
            altitude: current.and_then(|l| l.altitude),
            accuracy: Some(accuracy_m),
        };
        self.unit.set_location(&device.url, &location).await?;
        info!(device_id = %device.id, lat = coords.lat, lng = coords.lng, "Unit location updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::tests::station;
    use crate::registry::tests::device;
    use crate::sync::tests::{harness, URL};
    use crate::testing::{Failure, FakeUnitDevice};

    const ORIGIN: Coords = Coords::new(-43.5, 172.6);

    fn north(meters: f64) -> Coords {
        Coords::new(ORIGIN.lat + meters / 111_195.0, ORIGIN.lng)
    }

    fn remote(id: &str, name: &str, coords: Coords) -> RemoteStation {
        RemoteStation {
            id: id.into(),
            name: name.into(),
            coords,
        }
    }

    #[tokio::test]
    async fn test_offline_station_is_created() {
        let h = harness().await;
        h.db.locations().insert(&station("a", None, ORIGIN)).await.unwrap();

        let mut report = SyncReport::default();
        h.engine.sync_locations(&mut report).await;

        let stored = h.db.locations().get("a").await.unwrap().unwrap();
        assert!(!stored.needs_creation);
        assert_eq!(stored.server_id.as_deref(), Some("s1"));
        assert_eq!(
            h.backend.state().created_stations,
            vec![("kea-watch".to_string(), "Station a".to_string())]
        );
        // The pull sees the new station under its server id and leaves it alone.
        assert_eq!(h.db.locations().list_all().await.unwrap().len(), 1);
        assert_eq!(report.stations_synced, 1);
    }

    #[tokio::test]
    async fn test_offline_station_merges_into_backend_station() {
        let h = harness().await;
        h.backend
            .state()
            .stations
            .insert("kea-watch".into(), vec![remote("s9", "Station a", ORIGIN)]);
        h.db.locations().insert(&station("a", Some("s9"), ORIGIN)).await.unwrap();
        let mut offline = station("b", None, north(10.0));
        offline.name = "Ridge B".into();
        h.db.locations().insert(&offline).await.unwrap();

        let mut report = SyncReport::default();
        h.engine.sync_locations(&mut report).await;

        assert!(h.db.locations().get("b").await.unwrap().is_none());
        assert!(h.backend.state().created_stations.is_empty());
        assert_eq!(
            h.backend.state().renamed_stations,
            vec![("s9".to_string(), "Ridge B".to_string())]
        );
        let merged = h.db.locations().get("a").await.unwrap().unwrap();
        assert_eq!(merged.name, "Ridge B");
        assert!(!merged.needs_rename);
    }

    #[tokio::test]
    async fn test_rename_of_deleted_station_drops_row() {
        let h = harness().await;
        h.db.locations().insert(&station("a", Some("s1"), ORIGIN)).await.unwrap();
        h.db.locations().rename_local("a", "Creek").await.unwrap();
        h.backend.state().station_failure = Some(Failure::NotFound);

        let mut report = SyncReport::default();
        h.engine.sync_locations(&mut report).await;

        assert!(h.db.locations().get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_stores_new_and_keeps_staged_names() {
        let h = harness().await;
        h.registry.upsert(device("100", Some("h1"), "E1")).await;
        h.db.locations().insert(&station("a", Some("s1"), ORIGIN)).await.unwrap();
        h.db.locations().rename_local("a", "Local name").await.unwrap();
        h.backend.state().station_failure = Some(Failure::Server);
        h.backend.state().stations.insert(
            "kea-watch".into(),
            vec![
                remote("s1", "Backend name", ORIGIN),
                remote("s2", "Far ridge", north(500.0)),
            ],
        );

        let mut report = SyncReport::default();
        h.engine.sync_locations(&mut report).await;

        // The rename failed, so the staged name must survive the pull.
        let a = h.db.locations().get("a").await.unwrap().unwrap();
        assert_eq!(a.update_name_not_yet_synced.as_deref(), Some("Local name"));
        assert!(a.needs_rename);

        let s2 = h.db.locations().get_by_server_id("s2", true).await.unwrap().unwrap();
        assert_eq!(s2.name, "Far ridge");
        assert!(!s2.needs_creation);
        assert_eq!(report.stations_synced, 1);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn test_pull_refreshes_backend_changes() {
        let h = harness().await;
        h.db.locations().insert(&station("a", Some("s1"), ORIGIN)).await.unwrap();
        h.backend
            .state()
            .stations
            .insert("kea-watch".into(), vec![remote("s1", "Renamed upstream", ORIGIN)]);

        let mut report = SyncReport::default();
        h.engine.sync_locations(&mut report).await;

        let a = h.db.locations().get("a").await.unwrap().unwrap();
        assert_eq!(a.name, "Renamed upstream");
    }

    #[tokio::test]
    async fn test_forbidden_creation_reports_group() {
        let h = harness().await;
        h.db.locations().insert(&station("a", None, ORIGIN)).await.unwrap();
        h.db.locations().insert(&station("b", None, north(500.0))).await.unwrap();
        {
            let mut state = h.backend.state();
            state.station_failure = Some(Failure::Forbidden);
            state.denied_groups.insert("kea-watch".into());
        }

        let mut report = SyncReport::default();
        h.engine.push_pending_creations(&mut report).await.unwrap();

        assert_eq!(report.needs_group_access, vec!["kea-watch"]);
        assert_eq!(h.db.locations().pending_creation().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unit_location_pushed_only_when_stale() {
        let h = harness().await;
        h.unit.serve(URL, FakeUnitDevice::new("100", "h1", "kea-watch"));
        let dev = device("100", Some("h1"), "E1");

        assert!(h.engine.push_unit_location(&dev, ORIGIN, 5.0).await.unwrap());
        assert!(!h.engine.push_unit_location(&dev, north(10.0), 5.0).await.unwrap());
        assert!(h.engine.push_unit_location(&dev, north(300.0), 5.0).await.unwrap());

        let stored = h.unit.with_device(URL, |d| d.location.clone()).unwrap();
        assert_eq!(stored.coords(), north(300.0));
        assert_eq!(stored.accuracy, Some(5.0));
    }

    #[tokio::test]
    async fn test_unit_location_rejects_bad_fix() {
        let h = harness().await;
        h.unit.serve(URL, FakeUnitDevice::new("100", "h1", "kea-watch"));
        let dev = device("100", Some("h1"), "E1");

        let err = h
            .engine
            .push_unit_location(&dev, Coords::new(f64::NAN, 0.0), 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(h.unit.call_count("get_location"), 0);
    }
}
