// 🗄️ Store seams - the engine's external collaborators
//
// LocationStore is required. AliasStore, TagStore and AuditLog are each
// optional: the engine keeps working (degraded) when one is absent or failing.
//
// `db::SqliteStore` implements all four.

use crate::db::Event;
use crate::entities::{LocationNode, LocationPatch, LocationStatus, Tag};
use crate::error::StoreResult;

/// Persisted hierarchical locations
pub trait LocationStore: Send + Sync {
    /// All Active nodes
    fn list_active(&self) -> StoreResult<Vec<LocationNode>>;

    /// Nodes with the given ids, any status. Unknown ids are simply absent.
    fn get_by_ids(&self, ids: &[String]) -> StoreResult<Vec<LocationNode>>;

    /// Nodes (any status) whose parent is one of `parent_ids`
    fn find_by_parents(&self, parent_ids: &[String]) -> StoreResult<Vec<LocationNode>>;

    /// Point every node in `ids` at `new_parent_id`. Returns rows changed.
    fn reparent(&self, ids: &[String], new_parent_id: &str) -> StoreResult<usize>;

    fn update_fields(&self, id: &str, patch: &LocationPatch) -> StoreResult<()>;

    /// Write merged statistics onto the keeper and mark every id in `folded_ids`
    /// as folded into it, atomically. Must fail with `StoreError::Conflict` (and
    /// change nothing) if any folded id is no longer Active or was already folded.
    fn apply_merge_stats(
        &self,
        keeper_id: &str,
        usage_count: u64,
        popularity_score: u8,
        folded_ids: &[String],
    ) -> StoreResult<()>;

    /// Set `status` on every id in one update. Returns rows changed.
    /// Never writes a non-Inactive status over an Inactive row.
    fn bulk_update_status(&self, ids: &[String], status: LocationStatus) -> StoreResult<usize>;
}

/// Alternate labels for locations
pub trait AliasStore: Send + Sync {
    /// Re-point every alias of `old_location_id` at `new_location_id`
    fn reassign_location(&self, old_location_id: &str, new_location_id: &str)
        -> StoreResult<usize>;
}

/// Category tags linked to locations, and the records using those tags
pub trait TagStore: Send + Sync {
    /// The non-retired tag linked to a location, if any
    fn find_tag_by_location(&self, location_id: &str) -> StoreResult<Option<Tag>>;

    /// Move every usage of `old_tag_id` to `new_tag_id`
    fn reassign_tag_usages(&self, old_tag_id: &str, new_tag_id: &str) -> StoreResult<usize>;

    /// Mark a tag retired and unlink it from its location
    fn retire_tag(&self, tag_id: &str) -> StoreResult<()>;

    fn set_tag_location(&self, tag_id: &str, location_id: &str) -> StoreResult<()>;
}

/// Append-only audit trail
pub trait AuditLog: Send + Sync {
    fn record(&self, event: &Event) -> StoreResult<()>;
}
