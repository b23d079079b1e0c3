//! # Geofence Station Matcher
//!
//! Keeps two station records from describing the same physical site.
//!
//! ```text
//!   new station "Ridge B" at P (accuracy a)
//!        │
//!        ▼
//!   same group + environment stations within  min_sep/2 + 2a  of P ?
//!        │                                   │
//!        no                                  yes
//!        │                                   │
//!        ▼                                   ▼
//!   insert local row                    rename the existing station to
//!   (needs_creation)                    "Ridge B" (staged, pushed on sync)
//!                                       and keep no duplicate
//! ```
//!
//! When several stations qualify, one the backend already knows wins over
//! a local-only one, then the oldest.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use fieldsync_core::geo::{distance_m, merge_radius_m};
use fieldsync_core::validation::{validate_accuracy, validate_coords, validate_station_name};
use fieldsync_core::{Coords, Location};
use fieldsync_db::Database;

use crate::config::StationSettings;
use crate::error::SyncResult;

/// A station the user wants to create.
#[derive(Debug, Clone)]
pub struct StationDraft {
    pub name: String,
    pub coords: Coords,
    pub accuracy_m: f64,
    pub group_name: String,
    pub is_prod_environment: bool,
}

/// What [`StationMatcher::create_station`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StationOutcome {
    /// A new local station was stored.
    Created(Location),
    /// An existing station was renamed instead.
    Merged(Location),
}

impl StationOutcome {
    pub fn location(&self) -> &Location {
        match self {
            StationOutcome::Created(l) | StationOutcome::Merged(l) => l,
        }
    }
}

/// Finds stations close enough to be merged.
#[derive(Debug, Clone, Copy)]
pub struct StationMatcher {
    min_separation_m: f64,
}

impl StationMatcher {
    pub fn new(min_separation_m: f64) -> Self {
        StationMatcher { min_separation_m }
    }

    pub fn from_settings(settings: &StationSettings) -> Self {
        Self::new(settings.min_separation_m)
    }

    pub fn merge_radius(&self, accuracy_m: f64) -> f64 {
        merge_radius_m(self.min_separation_m, accuracy_m)
    }

    /// Picks the station `candidate` should be merged into, if any.
    pub fn find_merge_target<'a>(
        &self,
        candidate: &Location,
        existing: &'a [Location],
    ) -> Option<&'a Location> {
        let radius = self.merge_radius(candidate.accuracy_m);

        existing
            .iter()
            .filter(|l| l.id != candidate.id && l.same_scope(candidate))
            .filter(|l| distance_m(l.coords, candidate.coords) < radius)
            .min_by(|a, b| {
                b.is_server_known()
                    .cmp(&a.is_server_known())
                    .then(a.updated_at.cmp(&b.updated_at))
                    .then(a.id.cmp(&b.id))
            })
    }

    /// Creates a station, or renames the nearby one it duplicates.
    pub async fn create_station(&self, db: &Database, draft: StationDraft) -> SyncResult<StationOutcome> {
        let name = validate_station_name(&draft.name)?;
        let coords = validate_coords(draft.coords.lat, draft.coords.lng)?;
        let accuracy_m = validate_accuracy(draft.accuracy_m)?;

        let candidate = Location {
            id: Uuid::new_v4().to_string(),
            server_id: None,
            name,
            update_name_not_yet_synced: None,
            coords,
            accuracy_m,
            group_name: draft.group_name,
            is_prod_environment: draft.is_prod_environment,
            needs_creation: true,
            needs_rename: false,
            updated_at: Utc::now(),
        };

        let locations = db.locations();
        let existing = locations
            .list_for_group(&candidate.group_name, candidate.is_prod_environment)
            .await?;

        if let Some(target) = self.find_merge_target(&candidate, &existing) {
            info!(
                station_id = %target.id,
                old_name = %target.name,
                new_name = %candidate.name,
                "New station duplicates an existing one, renaming it"
            );
            locations.rename_local(&target.id, &candidate.name).await?;
            let merged = locations.get(&target.id).await?.unwrap_or_else(|| target.clone());
            return Ok(StationOutcome::Merged(merged));
        }

        locations.insert(&candidate).await?;
        info!(station_id = %candidate.id, name = %candidate.name, "Station created locally");
        Ok(StationOutcome::Created(candidate))
    }
}

impl Default for StationMatcher {
    fn default() -> Self {
        Self::new(fieldsync_core::DEFAULT_MIN_STATION_SEPARATION_M)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use fieldsync_db::DbConfig;

    /// Meters per degree of latitude, close enough for test offsets.
    const M_PER_DEG: f64 = 111_195.0;

    pub(crate) fn station(id: &str, server_id: Option<&str>, coords: Coords) -> Location {
        Location {
            id: id.into(),
            server_id: server_id.map(String::from),
            name: format!("Station {id}"),
            update_name_not_yet_synced: None,
            coords,
            accuracy_m: 0.0,
            group_name: "kea-watch".into(),
            is_prod_environment: true,
            needs_creation: server_id.is_none(),
            needs_rename: false,
            updated_at: Utc::now(),
        }
    }

    fn north_of(origin: Coords, meters: f64) -> Coords {
        Coords::new(origin.lat + meters / M_PER_DEG, origin.lng)
    }

    const ORIGIN: Coords = Coords::new(-43.5, 172.6);

    #[test]
    fn test_merge_target_respects_radius_and_scope() {
        let matcher = StationMatcher::default();
        let candidate = station("new", None, ORIGIN);

        let near = station("near", Some("s1"), north_of(ORIGIN, 10.0));
        let far = station("far", Some("s2"), north_of(ORIGIN, 45.0));
        let mut other_group = station("other", Some("s3"), north_of(ORIGIN, 5.0));
        other_group.group_name = "possum-watch".into();

        let existing = vec![far, other_group, near];
        assert_eq!(matcher.find_merge_target(&candidate, &existing).unwrap().id, "near");

        let existing = vec![existing[0].clone(), existing[1].clone()];
        assert!(matcher.find_merge_target(&candidate, &existing).is_none());
    }

    #[test]
    fn test_accuracy_widens_radius() {
        let matcher = StationMatcher::default();
        let mut candidate = station("new", None, ORIGIN);
        let existing = vec![station("a", Some("s1"), north_of(ORIGIN, 45.0))];

        assert!(matcher.find_merge_target(&candidate, &existing).is_none());

        candidate.accuracy_m = 10.0;
        assert!(matcher.find_merge_target(&candidate, &existing).is_some());
    }

    #[test]
    fn test_server_known_then_oldest_wins() {
        let matcher = StationMatcher::default();
        let candidate = station("new", None, ORIGIN);

        let mut old_local = station("old-local", None, north_of(ORIGIN, 5.0));
        old_local.updated_at = Utc::now() - Duration::days(10);
        let mut newer_server = station("server-new", Some("s2"), north_of(ORIGIN, 5.0));
        newer_server.updated_at = Utc::now() - Duration::days(1);
        let mut older_server = station("server-old", Some("s1"), north_of(ORIGIN, 20.0));
        older_server.updated_at = Utc::now() - Duration::days(5);

        let existing = vec![old_local, newer_server, older_server];
        assert_eq!(
            matcher.find_merge_target(&candidate, &existing).unwrap().id,
            "server-old"
        );
    }

    #[tokio::test]
    async fn test_station_10m_away_renames_existing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.locations()
            .insert(&station("a", Some("s1"), ORIGIN))
            .await
            .unwrap();

        let outcome = StationMatcher::default()
            .create_station(
                &db,
                StationDraft {
                    name: "Ridge B".into(),
                    coords: north_of(ORIGIN, 10.0),
                    accuracy_m: 0.0,
                    group_name: "kea-watch".into(),
                    is_prod_environment: true,
                },
            )
            .await
            .unwrap();

        let merged = match outcome {
            StationOutcome::Merged(l) => l,
            other => panic!("expected merge, got {other:?}"),
        };
        assert_eq!(merged.id, "a");
        assert_eq!(merged.update_name_not_yet_synced.as_deref(), Some("Ridge B"));
        assert!(merged.needs_rename);

        let all = db.locations().list_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_distant_station_is_created() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.locations()
            .insert(&station("a", Some("s1"), ORIGIN))
            .await
            .unwrap();

        let outcome = StationMatcher::default()
            .create_station(
                &db,
                StationDraft {
                    name: "  Creek  ".into(),
                    coords: north_of(ORIGIN, 200.0),
                    accuracy_m: 3.0,
                    group_name: "kea-watch".into(),
                    is_prod_environment: true,
                },
            )
            .await
            .unwrap();

        let created = outcome.location();
        assert!(matches!(outcome, StationOutcome::Created(_)));
        assert_eq!(created.name, "Creek");
        assert!(created.needs_creation);
        assert_eq!(db.locations().pending_creation().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_draft_is_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let err = StationMatcher::default()
            .create_station(
                &db,
                StationDraft {
                    name: " ".into(),
                    coords: ORIGIN,
                    accuracy_m: 0.0,
                    group_name: "kea-watch".into(),
                    is_prod_environment: true,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::SyncError::Validation(_)));
    }
}
