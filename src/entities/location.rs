// 📍 Location Entity - Hierarchical place records with stable identity
//
// "Location name is a VALUE (can change), Location UUID is IDENTITY (never changes)"
//
// Hierarchy: Country → Province → City → Sector → Neighborhood
// - parent_id must point at a node exactly one level shallower
// - Country is the only type without a parent
// - Records are never deleted: "deletion" is the Inactive tombstone

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::normalize::normalize;

// ============================================================================
// LOCATION TYPE
// ============================================================================

/// Hierarchy level. Declaration order is depth order, so the derived `Ord`
/// gives `Country < Province < City < Sector < Neighborhood`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LocationType {
    Country,
    Province,
    City,
    Sector,
    Neighborhood,
}

impl LocationType {
    pub const ALL: [LocationType; 5] = [
        LocationType::Country,
        LocationType::Province,
        LocationType::City,
        LocationType::Sector,
        LocationType::Neighborhood,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Country => "country",
            LocationType::Province => "province",
            LocationType::City => "city",
            LocationType::Sector => "sector",
            LocationType::Neighborhood => "neighborhood",
        }
    }

    /// Parse the stored (lowercase) form. Case-insensitive.
    pub fn parse(s: &str) -> Option<LocationType> {
        let lower = s.trim().to_lowercase();
        LocationType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lower)
    }

    /// The only type a node of this type may have as parent
    pub fn parent_type(&self) -> Option<LocationType> {
        match self {
            LocationType::Country => None,
            LocationType::Province => Some(LocationType::Country),
            LocationType::City => Some(LocationType::Province),
            LocationType::Sector => Some(LocationType::City),
            LocationType::Neighborhood => Some(LocationType::Sector),
        }
    }

    /// Is `parent` exactly one level shallower than `self`?
    pub fn accepts_parent(&self, parent: LocationType) -> bool {
        self.parent_type() == Some(parent)
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LocationType::Country => "Country",
            LocationType::Province => "Province",
            LocationType::City => "City",
            LocationType::Sector => "Sector",
            LocationType::Neighborhood => "Neighborhood",
        };
        f.write_str(label)
    }
}

// ============================================================================
// LOCATION STATUS (per-node state machine)
// ============================================================================

/// `Draft ⇄ Active → Inactive`. Inactive is the tombstone and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationStatus {
    Active,
    Inactive,
    Draft,
}

impl LocationStatus {
    pub const ALL: [LocationStatus; 3] = [
        LocationStatus::Active,
        LocationStatus::Inactive,
        LocationStatus::Draft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Active => "active",
            LocationStatus::Inactive => "inactive",
            LocationStatus::Draft => "draft",
        }
    }

    pub fn parse(s: &str) -> Option<LocationStatus> {
        match s.trim().to_lowercase().as_str() {
            "active" => Some(LocationStatus::Active),
            "inactive" => Some(LocationStatus::Inactive),
            "draft" => Some(LocationStatus::Draft),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        *self == LocationStatus::Inactive
    }

    pub fn can_transition_to(&self, next: LocationStatus) -> bool {
        match (self, next) {
            (LocationStatus::Inactive, LocationStatus::Inactive) => true,
            (LocationStatus::Inactive, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// GEOGRAPHIC FIELDS (opaque to reconciliation)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
}

// ============================================================================
// LOCATION NODE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationNode {
    // ========================================================================
    // IDENTITY (never changes)
    // ========================================================================
    pub id: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    /// Operator-entered label
    pub name: String,

    pub display_name: String,

    /// Normalized form of `name`, used for duplicate grouping
    pub canonical_name: String,

    pub location_type: LocationType,

    pub parent_id: Option<String>,

    pub status: LocationStatus,

    /// 0-100
    pub popularity_score: u8,

    pub usage_count: u64,

    pub sort_order: i32,

    pub featured: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoInfo>,

    /// Keeper this record's statistics were folded into by a merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,

    // ========================================================================
    // TIMESTAMPS
    // ========================================================================
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocationNode {
    /// Create a new Active location with a fresh UUID
    pub fn new(name: &str, location_type: LocationType, parent_id: Option<String>) -> Self {
        let now = Utc::now();

        LocationNode {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            canonical_name: normalize(name),
            location_type,
            parent_id,
            status: LocationStatus::Active,
            popularity_score: 0,
            usage_count: 0,
            sort_order: 0,
            featured: false,
            geo: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_stats(mut self, popularity_score: u8, usage_count: u64) -> Self {
        self.popularity_score = popularity_score.min(100);
        self.usage_count = usage_count;
        self
    }

    pub fn with_status(mut self, status: LocationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == LocationStatus::Active
    }

    pub fn is_root(&self) -> bool {
        self.location_type == LocationType::Country
    }

    /// Active, not a country, and no parent at all
    pub fn is_orphan(&self) -> bool {
        self.is_active() && !self.is_root() && self.parent_id.is_none()
    }
}

// ============================================================================
// FIELD PATCH (partial update)
// ============================================================================

/// Fields a caller may rewrite through `LocationStore::update_fields`.
/// `None` leaves the stored value untouched. Status is deliberately absent:
/// status only moves through `bulk_update_status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationPatch {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub canonical_name: Option<String>,
    pub parent_id: Option<String>,
    pub popularity_score: Option<u8>,
    pub usage_count: Option<u64>,
}

impl LocationPatch {
    pub fn parent(parent_id: &str) -> Self {
        LocationPatch {
            parent_id: Some(parent_id.to_string()),
            ..Default::default()
        }
    }

    /// Rewrite all three name fields from one display string
    pub fn rename(display: &str) -> Self {
        LocationPatch {
            name: Some(display.to_string()),
            display_name: Some(display.to_string()),
            canonical_name: Some(normalize(display)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == LocationPatch::default()
    }
}

// ============================================================================
// DEPENDENT RECORDS
// ============================================================================

/// Alternate label pointing at a location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub id: String,
    pub alias: String,
    pub location_id: String,
}

impl Alias {
    pub fn new(alias: &str, location_id: &str) -> Self {
        Alias {
            id: uuid::Uuid::new_v4().to_string(),
            alias: alias.to_string(),
            location_id: location_id.to_string(),
        }
    }
}

/// Category tag. A location links to at most one non-retired tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub location_id: Option<String>,
    pub retired: bool,
}

impl Tag {
    pub fn new(name: &str, location_id: Option<&str>) -> Self {
        Tag {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            location_id: location_id.map(|s| s.to_string()),
            retired: false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ordering_follows_hierarchy() {
        assert!(LocationType::Country < LocationType::Province);
        assert!(LocationType::Province < LocationType::City);
        assert!(LocationType::City < LocationType::Sector);
        assert!(LocationType::Sector < LocationType::Neighborhood);
    }

    #[test]
    fn test_parent_type_is_one_level_up() {
        assert_eq!(LocationType::Country.parent_type(), None);
        assert!(LocationType::Sector.accepts_parent(LocationType::City));
        assert!(!LocationType::Sector.accepts_parent(LocationType::Province));
        assert!(!LocationType::Sector.accepts_parent(LocationType::Neighborhood));
        assert!(!LocationType::Sector.accepts_parent(LocationType::Sector));
    }

    #[test]
    fn test_type_parse_roundtrip() {
        for t in LocationType::ALL {
            assert_eq!(LocationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(LocationType::parse("Sector"), Some(LocationType::Sector));
        assert_eq!(LocationType::parse("barrio"), None);
    }

    #[test]
    fn test_tombstone_is_terminal() {
        assert!(LocationStatus::Draft.can_transition_to(LocationStatus::Active));
        assert!(LocationStatus::Active.can_transition_to(LocationStatus::Draft));
        assert!(LocationStatus::Active.can_transition_to(LocationStatus::Inactive));
        assert!(!LocationStatus::Inactive.can_transition_to(LocationStatus::Active));
        assert!(!LocationStatus::Inactive.can_transition_to(LocationStatus::Draft));
    }

    #[test]
    fn test_new_location_is_active_and_normalized() {
        let node = LocationNode::new("El Millón", LocationType::Sector, None);

        assert!(!node.id.is_empty());
        assert!(node.is_active());
        assert_eq!(node.canonical_name, "el millon");
        assert_eq!(node.display_name, "El Millón");
        assert!(node.is_orphan());
    }

    #[test]
    fn test_country_is_never_an_orphan() {
        let country = LocationNode::new("República Dominicana", LocationType::Country, None);
        assert!(!country.is_orphan());
    }

    #[test]
    fn test_with_stats_clamps_popularity() {
        let node = LocationNode::new("Naco", LocationType::Sector, None).with_stats(250, 3);
        assert_eq!(node.popularity_score, 100);
        assert_eq!(node.usage_count, 3);
    }

    #[test]
    fn test_rename_patch_sets_all_names() {
        let patch = LocationPatch::rename("Santo Domingo Este");
        assert_eq!(patch.name.as_deref(), Some("Santo Domingo Este"));
        assert_eq!(patch.canonical_name.as_deref(), Some("santo domingo este"));
        assert!(patch.parent_id.is_none());
        assert!(LocationPatch::default().is_empty());
    }
}
