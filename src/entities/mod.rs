// Entity Models - the location hierarchy and its dependent records
//
// Identity persists, values change:
// - a location keeps its id for life, including after it is tombstoned
// - aliases and tags point at a location id and follow it through merges

pub mod location;

pub use location::{
    Alias, BoundingBox, GeoInfo, LocationNode, LocationPatch, LocationStatus, LocationType, Tag,
};
