//! Collections, scope and run-report models for priming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const CAMPAIGNS: &str = "campaigns";
pub const CAMPAIGN_FIELDS: &str = "campaign_fields";
pub const PLOTS: &str = "plots";
pub const SILO_BAGS: &str = "silo_bags";
pub const HARVEST_SESSIONS: &str = "harvest_sessions";
pub const LOGISTICS_ORDERS: &str = "logistics_orders";
pub const SESSION_REGISTERS: &str = "registers";
pub const SILO_BAG_MOVEMENTS: &str = "movements";

pub const FIELD_ID: &str = "fieldId";
pub const CAMPAIGN_ID: &str = "campaignId";
pub const STATUS: &str = "status";
pub const ACTIVE: &str = "active";
pub const UPDATED_AT: &str = "updatedAt";
pub const CREATED_AT: &str = "createdAt";
pub const DATE: &str = "date";

pub const SILO_BAG_ACTIVE_STATUS: &str = "active";
pub const OPEN_SESSION_STATUSES: [&str; 2] = ["open", "in_progress"];
pub const ACTIVE_LOGISTICS_STATUSES: [&str; 2] = ["pending", "in_transit"];

/// Small tenant-wide collections every client keeps in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCollection {
    Crops,
    Equipment,
    Operators,
    Organizations,
    Users,
}

impl ReferenceCollection {
    pub const ALL: [ReferenceCollection; 5] = [
        ReferenceCollection::Crops,
        ReferenceCollection::Equipment,
        ReferenceCollection::Operators,
        ReferenceCollection::Organizations,
        ReferenceCollection::Users,
    ];

    pub fn collection_name(&self) -> &'static str {
        match self {
            Self::Crops => "crops",
            Self::Equipment => "equipment",
            Self::Operators => "operators",
            Self::Organizations => "organizations",
            Self::Users => "users",
        }
    }
}

/// The (campaign, field-id set) pair bounding which operational entities
/// are relevant. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub campaign_id: String,
    pub field_ids: BTreeSet<String>,
}

impl Scope {
    pub fn new<I, S>(campaign_id: impl Into<String>, field_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            campaign_id: campaign_id.into(),
            field_ids: field_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Stable textual identity, persisted next to the checkpoint.
    pub fn fingerprint(&self) -> String {
        let fields: Vec<&str> = self.field_ids.iter().map(String::as_str).collect();
        format!("{}|{}", self.campaign_id, fields.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimingStage {
    CheckpointRead,
    Reference,
    ScopeResolution,
    ScopedOperational,
    RecentHistory,
    CheckpointCommit,
}

impl fmt::Display for PrimingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckpointRead => "checkpoint_read",
            Self::Reference => "reference",
            Self::ScopeResolution => "scope_resolution",
            Self::ScopedOperational => "scoped_operational",
            Self::RecentHistory => "recent_history",
            Self::CheckpointCommit => "checkpoint_commit",
        };
        f.write_str(name)
    }
}

/// Bootstrap fetches everything; incremental filters to "updated after checkpoint".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimingMode {
    Bootstrap,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimingVariant {
    /// Resolves campaign and fields itself (scheduler triggers).
    FullTenant,
    /// Given a scope by the reference data store.
    Scoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimingEndReason {
    Completed,
    NoActiveCampaign,
    NoAccessibleFields,
}

/// Per-phase outcome. Best-effort phases report skips instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Complete,
    PartialWithSkips(Vec<String>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub stage: PrimingStage,
    pub outcome: PhaseOutcome,
    pub fetched: usize,
    pub duration_ms: i64,
}

/// Diagnostic record of one priming run. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimingMetrics {
    pub tenant_id: String,
    pub variant: PrimingVariant,
    pub mode: PrimingMode,
    pub started_at: DateTime<Utc>,
    pub stage_reached: PrimingStage,
    pub end_reason: Option<PrimingEndReason>,
    pub campaign_id: Option<String>,
    pub field_count: usize,
    pub reference_counts: BTreeMap<String, usize>,
    pub operational_counts: BTreeMap<String, usize>,
    pub history_counts: BTreeMap<String, usize>,
    pub phases: Vec<PhaseReport>,
    pub errors: Vec<String>,
    pub checkpoint: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl PrimingMetrics {
    pub fn new(
        tenant_id: impl Into<String>,
        variant: PrimingVariant,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            variant,
            mode: PrimingMode::Bootstrap,
            started_at,
            stage_reached: PrimingStage::CheckpointRead,
            end_reason: None,
            campaign_id: None,
            field_count: 0,
            reference_counts: BTreeMap::new(),
            operational_counts: BTreeMap::new(),
            history_counts: BTreeMap::new(),
            phases: Vec::new(),
            errors: Vec::new(),
            checkpoint: None,
            duration_ms: 0,
        }
    }

    pub fn operational_total(&self) -> usize {
        self.operational_counts.values().sum()
    }

    pub fn history_total(&self) -> usize {
        self.history_counts.values().sum()
    }

    pub fn phase(&self, stage: PrimingStage) -> Option<&PhaseReport> {
        self.phases.iter().find(|report| report.stage == stage)
    }

    /// Parents whose best-effort history fetch was substituted with empty.
    pub fn skipped_history(&self) -> Vec<String> {
        match self.phase(PrimingStage::RecentHistory).map(|r| &r.outcome) {
            Some(PhaseOutcome::PartialWithSkips(skipped)) => skipped.clone(),
            _ => Vec::new(),
        }
    }
}
