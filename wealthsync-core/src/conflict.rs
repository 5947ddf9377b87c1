/// Conflict detection and resolution
///
/// The engine never implements domain-specific merge logic itself: a
/// `ConflictAnalyzer` proposes a resolution with a confidence score, and
/// `ConflictPolicy` decides whether the proposal is applied automatically,
/// pre-applied as a convenience default, or left for the user. With no
/// analyzer configured, the deterministic timestamp fallback still
/// resolves every conflict rather than blocking.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::operation::{EntityKind, SyncOperation};

/// User-facing resolution choice for a pending conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionChoice {
    /// Re-enqueue the local operation so it fights again.
    Local,
    /// Apply the remote operation, discarding the local one.
    Remote,
    /// Apply caller-supplied merged data.
    Merge,
}

/// What an analyzer recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedResolution {
    /// The local (client) side should win.
    Client,
    /// The remote (server) side should win.
    Server,
    /// Apply the analyzer's merged payload.
    Merge,
    /// No safe recommendation; a user must decide.
    Manual,
}

/// Outcome of analyzing two competing versions of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    /// 0-100.
    pub confidence: u8,
    pub can_auto_resolve: bool,
    pub suggested: SuggestedResolution,
    pub merged_data: Option<Value>,
}

impl ConflictAnalysis {
    /// An inconclusive analysis that always surfaces to the user.
    pub fn manual() -> Self {
        Self {
            confidence: 0,
            can_auto_resolve: false,
            suggested: SuggestedResolution::Manual,
            merged_data: None,
        }
    }
}

/// Pure analysis of two competing payloads plus their timestamps.
pub trait ConflictAnalyzer: Send + Sync {
    fn analyze(
        &self,
        entity: EntityKind,
        local: &Value,
        remote: &Value,
        local_timestamp: i64,
        remote_timestamp: i64,
    ) -> ConflictAnalysis;
}

/// Deterministic fallback when no analyzer is available or an analysis
/// is inconclusive: later timestamp wins, an exact tie prefers the
/// remote (server authority).
pub fn timestamp_fallback(local_timestamp: i64, remote_timestamp: i64) -> ConflictAnalysis {
    let suggested = if local_timestamp > remote_timestamp {
        SuggestedResolution::Client
    } else {
        SuggestedResolution::Server
    };
    ConflictAnalysis {
        confidence: 100,
        can_auto_resolve: true,
        suggested,
        merged_data: None,
    }
}

/// Policy constants gating automatic resolution.
///
/// Kept configurable so tests can exercise the boundary values.
#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    /// Minimum confidence to apply a suggestion without surfacing the
    /// conflict at all.
    pub auto_resolve_min_confidence: u8,
    /// Minimum confidence to pre-apply a non-manual suggestion while the
    /// conflict stays visible until confirmed.
    pub pre_apply_min_confidence: u8,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            auto_resolve_min_confidence: 80,
            pre_apply_min_confidence: 50,
        }
    }
}

impl ConflictPolicy {
    /// Ambiguous cases always surface to the user.
    pub fn requires_user_intervention(&self, analysis: &ConflictAnalysis) -> bool {
        matches!(analysis.suggested, SuggestedResolution::Manual)
            || analysis.confidence < self.auto_resolve_min_confidence
    }

    /// Whether a suggestion is strong enough to pre-apply as a default
    /// while awaiting user confirmation.
    pub fn should_pre_apply(&self, analysis: &ConflictAnalysis) -> bool {
        !matches!(analysis.suggested, SuggestedResolution::Manual)
            && analysis.confidence >= self.pre_apply_min_confidence
    }
}

/// One local operation paired with one remote operation for the same
/// entity where neither dominates the other under the staleness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub local_operation: SyncOperation,
    pub remote_operation: SyncOperation,
    pub detected_at: i64,
    /// Analysis recorded when a suggestion was pre-applied, awaiting
    /// user confirmation.
    pub suggested: Option<ConflictAnalysis>,
}

impl SyncConflict {
    pub fn new(local_operation: SyncOperation, remote_operation: SyncOperation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity: remote_operation.entity,
            entity_id: remote_operation.entity_id.clone(),
            local_operation,
            remote_operation,
            detected_at: Utc::now().timestamp_millis(),
            suggested: None,
        }
    }
}

/// Pending-conflict set. Conflicts live here from detection until
/// resolution, whether automatic or user-driven.
#[derive(Default)]
pub struct ConflictRegistry {
    pending: RwLock<HashMap<String, SyncConflict>>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conflict: SyncConflict) -> String {
        let id = conflict.id.clone();
        self.pending.write().insert(id.clone(), conflict);
        id
    }

    pub fn get(&self, conflict_id: &str) -> Option<SyncConflict> {
        self.pending.read().get(conflict_id).cloned()
    }

    pub fn remove(&self, conflict_id: &str) -> Option<SyncConflict> {
        self.pending.write().remove(conflict_id)
    }

    pub fn record_suggestion(&self, conflict_id: &str, analysis: ConflictAnalysis) {
        if let Some(conflict) = self.pending.write().get_mut(conflict_id) {
            conflict.suggested = Some(analysis);
        }
    }

    pub fn pending(&self) -> Vec<SyncConflict> {
        self.pending.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    pub fn clear(&self) {
        self.pending.write().clear();
    }
}

/// Field-level merge for JSON object payloads.
///
/// Fields touched by only one side merge cleanly; fields both sides
/// changed fall back to the newer timestamp per field and lower the
/// confidence, down to a manual recommendation when too many collide.
pub struct FieldMergeAnalyzer {
    /// Confidence when no field was changed by both sides.
    pub clean_merge_confidence: u8,
    /// Starting confidence when fields collide, reduced per collision.
    pub contested_base_confidence: u8,
    /// Confidence deducted per colliding field.
    pub contested_penalty: u8,
    /// Below this, the recommendation degrades to manual.
    pub manual_threshold: u8,
}

impl Default for FieldMergeAnalyzer {
    fn default() -> Self {
        Self {
            clean_merge_confidence: 95,
            contested_base_confidence: 70,
            contested_penalty: 15,
            manual_threshold: 40,
        }
    }
}

impl FieldMergeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn merge_fields(
        local: &Map<String, Value>,
        remote: &Map<String, Value>,
        local_newer: bool,
    ) -> (Map<String, Value>, usize) {
        let mut merged = Map::new();
        let mut contested = 0;

        for (key, local_value) in local {
            match remote.get(key) {
                Some(remote_value) if remote_value != local_value => {
                    contested += 1;
                    let winner = if local_newer { local_value } else { remote_value };
                    merged.insert(key.clone(), winner.clone());
                }
                _ => {
                    merged.insert(key.clone(), local_value.clone());
                }
            }
        }
        for (key, remote_value) in remote {
            if !local.contains_key(key) {
                merged.insert(key.clone(), remote_value.clone());
            }
        }

        (merged, contested)
    }
}

impl ConflictAnalyzer for FieldMergeAnalyzer {
    fn analyze(
        &self,
        _entity: EntityKind,
        local: &Value,
        remote: &Value,
        local_timestamp: i64,
        remote_timestamp: i64,
    ) -> ConflictAnalysis {
        let (Some(local_map), Some(remote_map)) = (local.as_object(), remote.as_object()) else {
            // Deletes and scalar payloads have nothing to merge.
            return timestamp_fallback(local_timestamp, remote_timestamp);
        };

        // A tie goes to the remote side, consistent with the fallback.
        let local_newer = local_timestamp > remote_timestamp;
        let (merged, contested) = Self::merge_fields(local_map, remote_map, local_newer);
        let merged_data = Some(Value::Object(merged));

        if contested == 0 {
            return ConflictAnalysis {
                confidence: self.clean_merge_confidence,
                can_auto_resolve: true,
                suggested: SuggestedResolution::Merge,
                merged_data,
            };
        }

        let penalty = self
            .contested_penalty
            .saturating_mul(contested.min(u8::MAX as usize) as u8);
        let confidence = self.contested_base_confidence.saturating_sub(penalty);
        let suggested = if confidence >= self.manual_threshold {
            SuggestedResolution::Merge
        } else {
            SuggestedResolution::Manual
        };

        ConflictAnalysis {
            confidence,
            can_auto_resolve: false,
            suggested,
            merged_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use crate::ClientId;
    use serde_json::json;

    fn op(entity_id: &str, version: u64) -> SyncOperation {
        SyncOperation::new(
            OperationType::Update,
            EntityKind::Account,
            entity_id,
            json!({}),
            ClientId::from("c1"),
            version,
        )
    }

    #[test]
    fn test_timestamp_fallback_later_wins() {
        let analysis = timestamp_fallback(200, 100);
        assert_eq!(analysis.suggested, SuggestedResolution::Client);
        assert!(analysis.can_auto_resolve);

        let analysis = timestamp_fallback(100, 200);
        assert_eq!(analysis.suggested, SuggestedResolution::Server);
    }

    #[test]
    fn test_timestamp_fallback_tie_prefers_remote() {
        let analysis = timestamp_fallback(100, 100);
        assert_eq!(analysis.suggested, SuggestedResolution::Server);
    }

    #[test]
    fn test_policy_thresholds() {
        let policy = ConflictPolicy::default();

        let strong = ConflictAnalysis {
            confidence: 80,
            can_auto_resolve: true,
            suggested: SuggestedResolution::Merge,
            merged_data: None,
        };
        assert!(!policy.requires_user_intervention(&strong));

        let borderline = ConflictAnalysis {
            confidence: 79,
            ..strong.clone()
        };
        assert!(policy.requires_user_intervention(&borderline));
        assert!(policy.should_pre_apply(&borderline));

        let weak = ConflictAnalysis {
            confidence: 49,
            ..strong.clone()
        };
        assert!(!policy.should_pre_apply(&weak));

        // Manual never auto-resolves or pre-applies, whatever the score.
        let manual = ConflictAnalysis {
            confidence: 100,
            can_auto_resolve: false,
            suggested: SuggestedResolution::Manual,
            merged_data: None,
        };
        assert!(policy.requires_user_intervention(&manual));
        assert!(!policy.should_pre_apply(&manual));
    }

    #[test]
    fn test_field_merge_disjoint_fields() {
        let analyzer = FieldMergeAnalyzer::new();
        let local = json!({"amount": 42, "note": "groceries"});
        let remote = json!({"amount": 42, "category": "food"});

        let analysis = analyzer.analyze(EntityKind::Transaction, &local, &remote, 100, 200);
        assert_eq!(analysis.suggested, SuggestedResolution::Merge);
        assert!(analysis.can_auto_resolve);
        assert_eq!(analysis.confidence, 95);
        assert_eq!(
            analysis.merged_data.unwrap(),
            json!({"amount": 42, "note": "groceries", "category": "food"})
        );
    }

    #[test]
    fn test_field_merge_contested_field_uses_newer_side() {
        let analyzer = FieldMergeAnalyzer::new();
        let local = json!({"amount": 42});
        let remote = json!({"amount": 99});

        // Remote is newer.
        let analysis = analyzer.analyze(EntityKind::Transaction, &local, &remote, 100, 200);
        assert_eq!(analysis.confidence, 55);
        assert!(!analysis.can_auto_resolve);
        assert_eq!(analysis.suggested, SuggestedResolution::Merge);
        assert_eq!(analysis.merged_data.unwrap(), json!({"amount": 99}));

        // Local is newer.
        let analysis = analyzer.analyze(EntityKind::Transaction, &local, &remote, 300, 200);
        assert_eq!(analysis.merged_data.unwrap(), json!({"amount": 42}));
    }

    #[test]
    fn test_field_merge_many_collisions_degrades_to_manual() {
        let analyzer = FieldMergeAnalyzer::new();
        let local = json!({"a": 1, "b": 2, "c": 3});
        let remote = json!({"a": 9, "b": 8, "c": 7});

        let analysis = analyzer.analyze(EntityKind::Budget, &local, &remote, 100, 200);
        assert_eq!(analysis.confidence, 25);
        assert_eq!(analysis.suggested, SuggestedResolution::Manual);
    }

    #[test]
    fn test_field_merge_non_object_falls_back_to_timestamps() {
        let analyzer = FieldMergeAnalyzer::new();
        let analysis =
            analyzer.analyze(EntityKind::Goal, &Value::Null, &json!({"x": 1}), 500, 100);
        assert_eq!(analysis.suggested, SuggestedResolution::Client);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = ConflictRegistry::new();
        let conflict = SyncConflict::new(op("acc1", 3), op("acc1", 3));
        let id = registry.insert(conflict);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        registry.record_suggestion(&id, ConflictAnalysis::manual());
        assert!(registry.get(&id).unwrap().suggested.is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&id).is_none());
    }
}
