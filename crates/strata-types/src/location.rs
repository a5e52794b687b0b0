//! Pointers into a workflow graph.

use serde::{Deserialize, Serialize};

use crate::ids::SubprocessContextId;

/// What kind of place a location points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// A plain node in the routine's own scope.
    Node,
    /// A node nested inside an active subprocess.
    SubprocessContext,
    /// A call activity waiting on a called routine.
    CallActivity,
}

/// Typed metadata carried by a location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationMetadata {
    /// Subprocess element that owns this location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess_id: Option<String>,
    /// Activation that owns this location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess_context_id: Option<SubprocessContextId>,
    /// Routine invoked by a call activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_element: Option<String>,
    /// Parallel branch this location belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
}

/// Where an execution currently is.
///
/// Locations are immutable snapshots: navigation produces new locations
/// rather than mutating existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractLocation {
    pub node_id: String,
    pub routine_id: String,
    #[serde(rename = "type")]
    pub location_type: LocationType,
    #[serde(default)]
    pub metadata: LocationMetadata,
}

impl AbstractLocation {
    /// A plain node location in the routine's own scope.
    pub fn node(routine_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routine_id: routine_id.into(),
            location_type: LocationType::Node,
            metadata: LocationMetadata::default(),
        }
    }

    /// Copy of this location with a different type.
    pub fn with_type(mut self, location_type: LocationType) -> Self {
        self.location_type = location_type;
        self
    }

    /// Copy of this location with different metadata.
    pub fn with_metadata(mut self, metadata: LocationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Location for the same routine at another node, keeping the
    /// subprocess tagging of `self`.
    pub fn sibling(&self, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routine_id: self.routine_id.clone(),
            location_type: self.location_type,
            metadata: self.metadata.clone(),
        }
    }

    /// Whether this location sits inside a subprocess.
    pub fn is_nested(&self) -> bool {
        self.location_type == LocationType::SubprocessContext
    }
}

impl std::fmt::Display for AbstractLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.routine_id, self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_location() {
        let loc = AbstractLocation::node("main", "Task_1");
        assert_eq!(loc.location_type, LocationType::Node);
        assert!(!loc.is_nested());
        assert_eq!(loc.to_string(), "main#Task_1");
    }

    #[test]
    fn test_sibling_keeps_tagging() {
        let loc = AbstractLocation::node("main", "SubStart")
            .with_type(LocationType::SubprocessContext)
            .with_metadata(LocationMetadata {
                subprocess_id: Some("Sub".into()),
                ..Default::default()
            });
        let next = loc.sibling("SubTask");
        assert_eq!(next.node_id, "SubTask");
        assert!(next.is_nested());
        assert_eq!(next.metadata.subprocess_id.as_deref(), Some("Sub"));
    }

    #[test]
    fn test_location_type_serialization() {
        let json = serde_json::to_string(&LocationType::SubprocessContext).unwrap();
        assert_eq!(json, "\"subprocess_context\"");
    }
}
