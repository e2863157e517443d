// 🔍 Duplicate Detector - find Active locations sharing a normalized key
// Exact match on (normalize(name), type). No fuzzy matching.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::entities::{LocationNode, LocationType};
use crate::normalize::normalize;

// ============================================================================
// GROUP KEY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub canonical_name: String,
    pub location_type: LocationType,
}

impl GroupKey {
    pub fn new(name: &str, location_type: LocationType) -> Self {
        GroupKey {
            canonical_name: normalize(name),
            location_type,
        }
    }

    pub fn of(node: &LocationNode) -> Self {
        GroupKey::new(&node.name, node.location_type)
    }

    pub fn matches(&self, node: &LocationNode) -> bool {
        node.location_type == self.location_type && normalize(&node.name) == self.canonical_name
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.canonical_name, self.location_type)
    }
}

// ============================================================================
// DUPLICATE GROUP (derived, never cached)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: GroupKey,

    /// Ordered by popularity descending, ties by id
    pub members: Vec<LocationNode>,

    /// Suggestion only - the operator may pick any member
    pub recommended_keeper_id: String,
}

impl DuplicateGroup {
    /// Build a group from members sharing `key`, ranking them.
    /// Returns None when `members` is empty.
    pub fn from_members(key: GroupKey, mut members: Vec<LocationNode>) -> Option<Self> {
        rank_members(&mut members);
        let recommended_keeper_id = members.first()?.id.clone();

        Some(DuplicateGroup {
            key,
            members,
            recommended_keeper_id,
        })
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    pub fn total_usage(&self) -> u64 {
        self.members
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.usage_count))
    }
}

fn rank_members(members: &mut [LocationNode]) {
    members.sort_by(|a, b| {
        b.popularity_score
            .cmp(&a.popularity_score)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ============================================================================
// DUPLICATE DETECTOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateDetector;

impl DuplicateDetector {
    pub fn new() -> Self {
        DuplicateDetector
    }

    /// Group Active nodes by (normalized name, type); groups of one are dropped.
    /// Output is ordered by key, so it does not depend on input order.
    pub fn detect(&self, nodes: &[LocationNode]) -> Vec<DuplicateGroup> {
        let mut buckets: BTreeMap<GroupKey, Vec<LocationNode>> = BTreeMap::new();

        for node in nodes.iter().filter(|n| n.is_active()) {
            buckets.entry(GroupKey::of(node)).or_default().push(node.clone());
        }

        buckets
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .filter_map(|(key, members)| DuplicateGroup::from_members(key, members))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LocationStatus;

    fn create_test_location(
        id: &str,
        name: &str,
        location_type: LocationType,
        popularity: u8,
        usage: u64,
    ) -> LocationNode {
        LocationNode::new(name, location_type, Some("parent".to_string()))
            .with_id(id)
            .with_stats(popularity, usage)
    }

    #[test]
    fn test_accent_variants_group_together() {
        let detector = DuplicateDetector::new();

        let a = create_test_location("A", "El Millon", LocationType::Sector, 40, 5);
        let b = create_test_location("B", "El Millón", LocationType::Sector, 70, 12);

        let groups = detector.detect(&[a, b]);

        assert_eq!(groups.len(), 1);
        let ids: Vec<&str> = groups[0].members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(groups[0].recommended_keeper_id, "B");
        assert_eq!(groups[0].key.canonical_name, "el millon");
        assert_eq!(groups[0].total_usage(), 17);
    }

    #[test]
    fn test_same_name_different_type_not_grouped() {
        let detector = DuplicateDetector::new();

        let city = create_test_location("C", "La Romana", LocationType::City, 10, 0);
        let province = create_test_location("P", "La Romana", LocationType::Province, 10, 0);

        assert!(detector.detect(&[city, province]).is_empty());
    }

    #[test]
    fn test_inactive_nodes_ignored() {
        let detector = DuplicateDetector::new();

        let a = create_test_location("A", "Naco", LocationType::Sector, 10, 0);
        let b = create_test_location("B", "Naco", LocationType::Sector, 20, 0)
            .with_status(LocationStatus::Inactive);
        let c = create_test_location("C", "Naco", LocationType::Sector, 30, 0)
            .with_status(LocationStatus::Draft);

        assert!(detector.detect(&[a, b, c]).is_empty());
    }

    #[test]
    fn test_ties_broken_by_id() {
        let detector = DuplicateDetector::new();

        let z = create_test_location("z", "Gazcue", LocationType::Sector, 50, 0);
        let a = create_test_location("a", "gazcue", LocationType::Sector, 50, 0);
        let m = create_test_location("m", "GAZCUE ", LocationType::Sector, 50, 0);

        let groups = detector.detect(&[z, a, m]);
        let ids: Vec<String> = groups[0].member_ids();
        assert_eq!(ids, vec!["a", "m", "z"]);
        assert_eq!(groups[0].recommended_keeper_id, "a");
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = DuplicateDetector::new();

        let nodes = vec![
            create_test_location("1", "Naco", LocationType::Sector, 10, 1),
            create_test_location("2", "Piantini", LocationType::Sector, 20, 2),
            create_test_location("3", "naco", LocationType::Sector, 30, 3),
            create_test_location("4", "Piantíni", LocationType::Sector, 20, 4),
            create_test_location("5", "Bella Vista", LocationType::Sector, 5, 5),
        ];
        let mut reversed = nodes.clone();
        reversed.reverse();

        let first = detector.detect(&nodes);
        let second = detector.detect(&nodes);
        let from_reversed = detector.detect(&reversed);

        assert_eq!(first.len(), 2);
        for groups in [&second, &from_reversed] {
            assert_eq!(groups.len(), first.len());
            for (x, y) in first.iter().zip(groups.iter()) {
                assert_eq!(x.key, y.key);
                assert_eq!(x.member_ids(), y.member_ids());
                assert_eq!(x.recommended_keeper_id, y.recommended_keeper_id);
            }
        }
    }

    #[test]
    fn test_group_key_matches() {
        let key = GroupKey::new("El Millón", LocationType::Sector);
        let node = create_test_location("A", "el millon", LocationType::Sector, 0, 0);
        let city = create_test_location("B", "el millon", LocationType::City, 0, 0);

        assert!(key.matches(&node));
        assert!(!key.matches(&city));
        assert_eq!(key.to_string(), "el millon [Sector]");
    }
}
