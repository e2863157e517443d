// 🌳 Orphans - invalid parent linkage, and hierarchy-checked repair
//
// Orphan: Active, not a Country, no parent_id.
// LinkageIssue: any structural parent problem among Active nodes
// (orphans included).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::entities::{LocationNode, LocationPatch, LocationType};
use crate::error::{ReconciliationResult, ValidationError};
use crate::store::LocationStore;

// ============================================================================
// LINKAGE ISSUES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkageProblem {
    /// No parent on a node that needs one
    MissingParent,

    /// parent_id points at nothing Active
    DanglingParent { parent_id: String },

    /// Parent exists but is not exactly one level shallower
    ParentTypeMismatch {
        parent_id: String,
        parent_type: LocationType,
    },

    /// A Country with a parent
    RootWithParent { parent_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkageIssue {
    pub location_id: String,
    pub name: String,
    pub location_type: LocationType,
    pub problem: LinkageProblem,
}

// ============================================================================
// ORPHAN DETECTOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct OrphanDetector;

impl OrphanDetector {
    pub fn new() -> Self {
        OrphanDetector
    }

    pub fn detect(&self, nodes: &[LocationNode]) -> Vec<LocationNode> {
        nodes.iter().filter(|n| n.is_orphan()).cloned().collect()
    }

    /// Every Active node whose parent linkage breaks the hierarchy.
    /// Parents are resolved among the Active nodes passed in.
    pub fn linkage_issues(&self, nodes: &[LocationNode]) -> Vec<LinkageIssue> {
        let active: HashMap<&str, &LocationNode> = nodes
            .iter()
            .filter(|n| n.is_active())
            .map(|n| (n.id.as_str(), n))
            .collect();

        let mut issues = Vec::new();

        for node in nodes.iter().filter(|n| n.is_active()) {
            let problem = match (&node.parent_id, node.location_type.parent_type()) {
                (None, None) => None,
                (None, Some(_)) => Some(LinkageProblem::MissingParent),
                (Some(parent_id), None) => Some(LinkageProblem::RootWithParent {
                    parent_id: parent_id.clone(),
                }),
                (Some(parent_id), Some(expected)) => match active.get(parent_id.as_str()) {
                    None => Some(LinkageProblem::DanglingParent {
                        parent_id: parent_id.clone(),
                    }),
                    Some(parent) if parent.location_type != expected => {
                        Some(LinkageProblem::ParentTypeMismatch {
                            parent_id: parent_id.clone(),
                            parent_type: parent.location_type,
                        })
                    }
                    Some(_) => None,
                },
            };

            if let Some(problem) = problem {
                issues.push(LinkageIssue {
                    location_id: node.id.clone(),
                    name: node.name.clone(),
                    location_type: node.location_type,
                    problem,
                });
            }
        }

        issues
    }
}

// ============================================================================
// ORPHAN REPAIR
// ============================================================================

pub struct OrphanRepair<'a> {
    locations: &'a dyn LocationStore,
}

impl<'a> OrphanRepair<'a> {
    pub fn new(locations: &'a dyn LocationStore) -> Self {
        OrphanRepair { locations }
    }

    /// Attach `orphan_id` to `parent_id`. The parent must be Active and exactly
    /// one level shallower; nothing is written otherwise.
    pub fn fix(&self, orphan_id: &str, parent_id: &str) -> ReconciliationResult<()> {
        let ids = vec![orphan_id.to_string(), parent_id.to_string()];
        let found = self.locations.get_by_ids(&ids)?;

        let orphan = found
            .iter()
            .find(|n| n.id == orphan_id)
            .ok_or_else(|| ValidationError::UnknownLocation(orphan_id.to_string()))?;
        let parent = found
            .iter()
            .find(|n| n.id == parent_id)
            .ok_or_else(|| ValidationError::UnknownLocation(parent_id.to_string()))?;

        if orphan.status.is_tombstone() {
            return Err(ValidationError::Tombstoned(orphan_id.to_string()).into());
        }
        if !parent.is_active() {
            return Err(ValidationError::ParentNotActive(parent_id.to_string()).into());
        }
        if !orphan.location_type.accepts_parent(parent.location_type) {
            return Err(ValidationError::InvalidHierarchy {
                child: orphan_id.to_string(),
                child_type: orphan.location_type,
                parent: parent_id.to_string(),
                parent_type: parent.location_type,
            }
            .into());
        }

        self.locations
            .update_fields(orphan_id, &LocationPatch::parent(parent_id))?;

        info!(
            orphan_id,
            parent_id,
            orphan_type = %orphan.location_type,
            "attached orphan to parent"
        );

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::entities::LocationStatus;
    use crate::error::ReconciliationError;

    fn create_test_location(
        id: &str,
        location_type: LocationType,
        parent_id: Option<&str>,
    ) -> LocationNode {
        LocationNode::new(id, location_type, parent_id.map(|p| p.to_string())).with_id(id)
    }

    fn seeded_store(nodes: &[LocationNode]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for node in nodes {
            store.insert_location(node).unwrap();
        }
        store
    }

    #[test]
    fn test_detect_orphans() {
        let nodes = vec![
            create_test_location("DO", LocationType::Country, None),
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("C1", LocationType::City, Some("P1")),
            create_test_location("S2", LocationType::Sector, None)
                .with_status(LocationStatus::Inactive),
            create_test_location("S3", LocationType::Sector, None)
                .with_status(LocationStatus::Draft),
        ];

        let orphans = OrphanDetector::new().detect(&nodes);

        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "S1");
    }

    #[test]
    fn test_linkage_issues() {
        let nodes = vec![
            create_test_location("DO", LocationType::Country, None),
            create_test_location("US", LocationType::Country, Some("DO")),
            create_test_location("P1", LocationType::Province, Some("DO")),
            create_test_location("C1", LocationType::City, Some("P1")),
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("S2", LocationType::Sector, Some("P1")),
            create_test_location("S3", LocationType::Sector, Some("gone")),
            create_test_location("S4", LocationType::Sector, Some("C1")),
        ];

        let issues = OrphanDetector::new().linkage_issues(&nodes);
        let by_id: HashMap<&str, &LinkageProblem> = issues
            .iter()
            .map(|i| (i.location_id.as_str(), &i.problem))
            .collect();

        assert_eq!(issues.len(), 4);
        assert!(matches!(by_id["US"], LinkageProblem::RootWithParent { .. }));
        assert_eq!(by_id["S1"], &LinkageProblem::MissingParent);
        assert!(matches!(
            by_id["S2"],
            LinkageProblem::ParentTypeMismatch {
                parent_type: LocationType::Province,
                ..
            }
        ));
        assert!(matches!(by_id["S3"], LinkageProblem::DanglingParent { .. }));
    }

    #[test]
    fn test_parent_that_is_inactive_counts_as_dangling() {
        let nodes = vec![
            create_test_location("C1", LocationType::City, Some("P1"))
                .with_status(LocationStatus::Inactive),
            create_test_location("S1", LocationType::Sector, Some("C1")),
        ];

        let issues = OrphanDetector::new().linkage_issues(&nodes);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location_id, "S1");
    }

    #[test]
    fn test_fix_orphan_with_city_parent() {
        let store = seeded_store(&[
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("C1", LocationType::City, Some("P1")),
        ]);

        OrphanRepair::new(&store).fix("S1", "C1").unwrap();

        assert_eq!(store.get("S1").unwrap().parent_id.as_deref(), Some("C1"));
    }

    #[test]
    fn test_fix_orphan_rejects_deeper_parent() {
        let store = seeded_store(&[
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("N1", LocationType::Neighborhood, Some("S9")),
        ]);

        let err = OrphanRepair::new(&store).fix("S1", "N1").unwrap_err();

        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::InvalidHierarchy { .. })
        ));
        assert!(store.get("S1").unwrap().parent_id.is_none());
    }

    #[test]
    fn test_fix_orphan_rejects_type_skipping() {
        let store = seeded_store(&[
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("P1", LocationType::Province, Some("DO")),
        ]);

        let err = OrphanRepair::new(&store).fix("S1", "P1").unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::InvalidHierarchy { .. })
        ));
    }

    #[test]
    fn test_fix_orphan_rejects_inactive_parent() {
        let store = seeded_store(&[
            create_test_location("S1", LocationType::Sector, None),
            create_test_location("C1", LocationType::City, Some("P1"))
                .with_status(LocationStatus::Inactive),
        ]);

        let err = OrphanRepair::new(&store).fix("S1", "C1").unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::ParentNotActive(_))
        ));
    }

    #[test]
    fn test_fix_orphan_unknown_ids() {
        let store = seeded_store(&[create_test_location("S1", LocationType::Sector, None)]);

        let err = OrphanRepair::new(&store).fix("S1", "nowhere").unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::UnknownLocation(_))
        ));

        let err = OrphanRepair::new(&store).fix("ghost", "S1").unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::UnknownLocation(_))
        ));
    }

    #[test]
    fn test_country_cannot_take_a_parent() {
        let store = seeded_store(&[
            create_test_location("DO", LocationType::Country, None),
            create_test_location("HT", LocationType::Country, None),
        ]);

        let err = OrphanRepair::new(&store).fix("DO", "HT").unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::Validation(ValidationError::InvalidHierarchy { .. })
        ));
    }
}
