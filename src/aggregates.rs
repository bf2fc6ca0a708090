//! Volume and project counters derived from text units.
//!
//! Nothing here is cached: each call reads the committed unit state. A
//! refresh computes the full aggregate before writing it, so a failure
//! leaves the previously stored aggregate in place.

use crate::db::Database;
use crate::error::Result;
use crate::models::{ProjectAggregate, VolumeAggregate};
use tracing::debug;

#[derive(Clone)]
pub struct AggregateRecomputer {
    db: Database,
}

impl AggregateRecomputer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Volume counters from its units, with the stored `last_submit`
    pub fn volume(&self, project: &str, volume: &str) -> Result<VolumeAggregate> {
        let mut aggregate = self.db.compute_volume_counts(project, volume)?;
        aggregate.last_submit = self
            .db
            .get_volume_aggregate(project, volume)?
            .and_then(|stored| stored.last_submit);
        Ok(aggregate)
    }

    /// Project counters summed from the stored volume aggregates
    pub fn project(&self, project: &str) -> Result<ProjectAggregate> {
        let volumes = self.db.volume_aggregates(project)?;
        let last_submit = self
            .db
            .get_project_aggregate(project)?
            .and_then(|stored| stored.last_submit);
        Ok(ProjectAggregate::from_volumes(project, &volumes, last_submit))
    }

    pub fn refresh_volume(&self, project: &str, volume: &str) -> Result<VolumeAggregate> {
        let aggregate = self.volume(project, volume)?;
        self.db.store_volume_aggregate(&aggregate)?;
        debug!(
            "Refreshed volume {}/{}: {}/{} texts translated, {} approved",
            project, volume, aggregate.translated_texts, aggregate.texts, aggregate.approved_texts
        );
        Ok(aggregate)
    }

    pub fn refresh_project_totals(&self, project: &str) -> Result<ProjectAggregate> {
        let aggregate = self.project(project)?;
        self.db.store_project_aggregate(&aggregate)?;
        Ok(aggregate)
    }

    /// Refresh one volume and the project total it feeds
    pub fn refresh_for_volume(&self, project: &str, volume: &str) -> Result<ProjectAggregate> {
        self.refresh_volume(project, volume)?;
        self.refresh_project_totals(project)
    }

    /// Recompute every volume of a project, then its total
    pub fn refresh_project(&self, project: &str) -> Result<ProjectAggregate> {
        for volume in self.db.volumes(project)? {
            self.refresh_volume(project, &volume)?;
        }
        self.refresh_project_totals(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval;
    use crate::db::RevisionDraft;
    use crate::models::{TextUnit, UnitKey};
    use chrono::Utc;

    fn seeded() -> (Database, AggregateRecomputer) {
        let db = Database::open_in_memory().unwrap();
        db.insert_units(&[
            TextUnit::new(UnitKey::new("p", "0001_a", 1), "Hello"),
            TextUnit::new(UnitKey::new("p", "0001_a", 2), "Good bye"),
            TextUnit::new(UnitKey::new("p", "0002_a", 1), "Yes"),
        ])
        .unwrap();
        let recomputer = AggregateRecomputer::new(db.clone());
        (db, recomputer)
    }

    fn submit(db: &Database, key: &UnitKey, text: &str) {
        let draft = RevisionDraft {
            key: key.clone(),
            text: text.to_string(),
            submitter: "tester".into(),
            prev_revision_id: None,
            created_at: Utc::now(),
            is_translate: true,
            letters: crate::models::count_letters(text),
            spell_issues: vec![],
        };
        db.append_revision(&draft, |unit| approval::propagate(unit, text, false))
            .unwrap();
    }

    #[test]
    fn test_volume_counts_translated_and_approved() {
        let (db, recomputer) = seeded();
        submit(&db, &UnitKey::new("p", "0001_a", 1), "Bonjour");
        submit(&db, &UnitKey::new("p", "0001_a", 2), "Good bye");

        let volume = recomputer.volume("p", "0001_a").unwrap();
        assert_eq!(volume.texts, 2);
        assert_eq!(volume.letters, 12);
        assert_eq!(volume.translated_texts, 2);
        assert_eq!(volume.translated_letters, 12);
        assert_eq!(volume.approved_texts, 1);
        assert_eq!(volume.approved_letters, 7);
    }

    #[test]
    fn test_project_is_sum_of_volumes() {
        let (db, recomputer) = seeded();
        submit(&db, &UnitKey::new("p", "0002_a", 1), "Oui");

        let project = recomputer.refresh_project("p").unwrap();
        assert_eq!(project.texts, 3);
        assert_eq!(project.letters, 15);
        assert_eq!(project.translated_texts, 1);
        assert_eq!(project.translated_letters, 3);
        assert_eq!(db.get_project_aggregate("p").unwrap().unwrap(), project);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let (db, recomputer) = seeded();
        submit(&db, &UnitKey::new("p", "0001_a", 1), "Bonjour");

        let first = recomputer.refresh_project("p").unwrap();
        let second = recomputer.refresh_project("p").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            recomputer.volume("p", "0001_a").unwrap(),
            recomputer.volume("p", "0001_a").unwrap()
        );
    }

    #[test]
    fn test_project_total_uses_stored_volumes() {
        let (db, recomputer) = seeded();
        recomputer.refresh_project("p").unwrap();
        submit(&db, &UnitKey::new("p", "0002_a", 1), "Oui");

        // Only 0001_a is refreshed, so 0002_a's stored row is still the old one
        let project = recomputer.refresh_for_volume("p", "0001_a").unwrap();
        assert_eq!(project.translated_texts, 0);

        let project = recomputer.refresh_for_volume("p", "0002_a").unwrap();
        assert_eq!(project.translated_texts, 1);
    }

    #[test]
    fn test_unknown_project_is_empty() {
        let (_db, recomputer) = seeded();
        let project = recomputer.project("missing").unwrap();
        assert_eq!(project.texts, 0);
        assert_eq!(project.last_submit, None);
    }
}
