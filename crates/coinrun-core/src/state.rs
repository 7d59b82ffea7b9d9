//! Committed engine state and the staged transactions that change it.
//!
//! Commands never touch [`FundingState`] directly. They open a [`FundingTxn`]
//! over the committed state, stage every row they write, and hand back a
//! [`Changeset`]. The changeset is persisted first and only then applied in
//! memory, so an error at any point leaves no partial state behind.

use crate::audit::{self, AuditEntry};
use crate::config::FundingPolicy;
use crate::error::FundingError;
use crate::ledger::{self, LedgerEntry};
use crate::types::{
    Allocation, AllocationId, Commitment, CommitmentId, FundingRequest, Principal, PrincipalId,
    RequestId, RequestStatus, Run, RunId, RunStatus, Wallet,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Rows written by one command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changeset {
    pub trace_id: String,
    pub principals: Vec<Principal>,
    pub wallets: Vec<Wallet>,
    pub requests: Vec<FundingRequest>,
    pub commitments: Vec<Commitment>,
    pub runs: Vec<Run>,
    pub allocations: Vec<Allocation>,
    pub ledger_entries: Vec<LedgerEntry>,
    pub audit_entries: Vec<AuditEntry>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
            && self.wallets.is_empty()
            && self.requests.is_empty()
            && self.commitments.is_empty()
            && self.runs.is_empty()
            && self.allocations.is_empty()
            && self.ledger_entries.is_empty()
            && self.audit_entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct StateIndex {
    request_commitments: HashMap<RequestId, Vec<CommitmentId>>,
    request_runs: HashMap<RequestId, Vec<RunId>>,
    run_allocations: HashMap<RunId, Vec<AllocationId>>,
    principal_entries: HashMap<PrincipalId, Vec<usize>>,
    request_audit: HashMap<RequestId, Vec<usize>>,
}

/// Authoritative in-memory state of the funding engine.
#[derive(Debug, Clone, Default)]
pub struct FundingState {
    principals: BTreeMap<PrincipalId, Principal>,
    wallets: BTreeMap<PrincipalId, Wallet>,
    requests: BTreeMap<RequestId, FundingRequest>,
    commitments: BTreeMap<CommitmentId, Commitment>,
    runs: BTreeMap<RunId, Run>,
    allocations: BTreeMap<AllocationId, Allocation>,
    ledger: Vec<LedgerEntry>,
    audit: Vec<AuditEntry>,
    index: StateIndex,
}

/// Result of a full integrity sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ledger_chain_ok: bool,
    pub audit_chain_ok: bool,
    pub violations: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.ledger_chain_ok && self.audit_chain_ok && self.violations.is_empty()
    }
}

impl FundingState {
    /// Rebuild state from persisted rows.
    pub fn from_changeset(changes: Changeset) -> Self {
        let mut state = Self::default();
        state.apply(changes);
        state
    }

    /// Apply a committed changeset. Rows replace their previous version; entries append.
    pub fn apply(&mut self, changes: Changeset) {
        for principal in changes.principals {
            self.principals.insert(principal.id.clone(), principal);
        }
        for wallet in changes.wallets {
            self.wallets.insert(wallet.principal.clone(), wallet);
        }
        for request in changes.requests {
            self.requests.insert(request.id, request);
        }
        for commitment in changes.commitments {
            if !self.commitments.contains_key(&commitment.id) {
                self.index
                    .request_commitments
                    .entry(commitment.request)
                    .or_default()
                    .push(commitment.id);
            }
            self.commitments.insert(commitment.id, commitment);
        }
        for run in changes.runs {
            if !self.runs.contains_key(&run.id) {
                self.index
                    .request_runs
                    .entry(run.request)
                    .or_default()
                    .push(run.id);
            }
            self.runs.insert(run.id, run);
        }
        for allocation in changes.allocations {
            if !self.allocations.contains_key(&allocation.id) {
                self.index
                    .run_allocations
                    .entry(allocation.run)
                    .or_default()
                    .push(allocation.id);
            }
            self.allocations.insert(allocation.id, allocation);
        }
        for entry in changes.ledger_entries {
            self.index
                .principal_entries
                .entry(entry.principal.clone())
                .or_default()
                .push(self.ledger.len());
            self.ledger.push(entry);
        }
        for entry in changes.audit_entries {
            if let Some(request) = entry.request {
                self.index
                    .request_audit
                    .entry(request)
                    .or_default()
                    .push(self.audit.len());
            }
            self.audit.push(entry);
        }
    }

    /// Every row and entry, in a form suitable for a full reload.
    pub fn to_changeset(&self) -> Changeset {
        Changeset {
            trace_id: "snapshot".to_string(),
            principals: self.principals.values().cloned().collect(),
            wallets: self.wallets.values().cloned().collect(),
            requests: self.requests.values().cloned().collect(),
            commitments: self.commitments.values().cloned().collect(),
            runs: self.runs.values().cloned().collect(),
            allocations: self.allocations.values().cloned().collect(),
            ledger_entries: self.ledger.clone(),
            audit_entries: self.audit.clone(),
        }
    }

    pub fn principal(&self, id: &PrincipalId) -> Option<&Principal> {
        self.principals.get(id)
    }

    pub fn wallet(&self, id: &PrincipalId) -> Option<&Wallet> {
        self.wallets.get(id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn request(&self, id: RequestId) -> Option<&FundingRequest> {
        self.requests.get(&id)
    }

    pub fn requests(&self) -> impl DoubleEndedIterator<Item = &FundingRequest> {
        self.requests.values()
    }

    pub fn commitment(&self, id: CommitmentId) -> Option<&Commitment> {
        self.commitments.get(&id)
    }

    pub fn run(&self, id: RunId) -> Option<&Run> {
        self.runs.get(&id)
    }

    /// Commitments of a request, oldest first.
    pub fn commitments_for(&self, request: RequestId) -> Vec<&Commitment> {
        lookup(&self.index.request_commitments, &request, &self.commitments)
    }

    /// Runs of a request in run-number order.
    pub fn runs_for(&self, request: RequestId) -> Vec<&Run> {
        lookup(&self.index.request_runs, &request, &self.runs)
    }

    pub fn allocations_for_run(&self, run: RunId) -> Vec<&Allocation> {
        lookup(&self.index.run_allocations, &run, &self.allocations)
    }

    pub fn ledger_entries(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    pub fn entries_for(&self, principal: &PrincipalId) -> Vec<&LedgerEntry> {
        positions(&self.index.principal_entries, principal, &self.ledger)
    }

    pub fn audit_entries(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub fn audit_for_request(&self, request: RequestId) -> Vec<&AuditEntry> {
        positions(&self.index.request_audit, &request, &self.audit)
    }

    /// Queued runs whose request is itself waiting in the queue, oldest first.
    pub fn queued_runs(&self) -> Vec<&Run> {
        self.runs
            .values()
            .filter(|run| run.status == RunStatus::Queued)
            .filter(|run| {
                self.requests
                    .get(&run.request)
                    .is_some_and(|request| request.status == RequestStatus::Queued)
            })
            .collect()
    }

    /// Check both hash chains, wallet replays, commitment bounds, and the single-active-run rule.
    pub fn verify(&self) -> IntegrityReport {
        let mut violations = Vec::new();

        for wallet in self.wallets.values() {
            let replayed = ledger::replay(self.entries_for(&wallet.principal));
            if let Err(mismatch) = replayed.matches(wallet) {
                violations.push(mismatch);
            }
        }

        for commitment in self.commitments.values() {
            if commitment.remaining > commitment.amount {
                violations.push(format!(
                    "{} has remaining {} above amount {}",
                    commitment.id, commitment.remaining, commitment.amount
                ));
            }
            if commitment.refunded > commitment.consumed() {
                violations.push(format!(
                    "{} refunded {} but only {} was consumed",
                    commitment.id,
                    commitment.refunded,
                    commitment.consumed()
                ));
            }
        }

        for request in self.requests.values() {
            let active = self
                .runs_for(request.id)
                .into_iter()
                .filter(|run| run.status.is_active())
                .count();
            if active > 1 {
                violations.push(format!("{} has {} active runs", request.id, active));
            }
        }

        IntegrityReport {
            ledger_chain_ok: ledger::verify_chain(&self.ledger),
            audit_chain_ok: audit::verify_chain(&self.audit),
            violations,
        }
    }
}

fn lookup<'a, K, I, V>(
    index: &HashMap<K, Vec<I>>,
    key: &K,
    rows: &'a BTreeMap<I, V>,
) -> Vec<&'a V>
where
    K: std::hash::Hash + Eq,
    I: Ord,
{
    index
        .get(key)
        .map(|ids| ids.iter().filter_map(|id| rows.get(id)).collect())
        .unwrap_or_default()
}

fn positions<'a, K, V>(index: &HashMap<K, Vec<usize>>, key: &K, rows: &'a [V]) -> Vec<&'a V>
where
    K: std::hash::Hash + Eq,
{
    index
        .get(key)
        .map(|slots| slots.iter().filter_map(|slot| rows.get(*slot)).collect())
        .unwrap_or_default()
}

/// Staged view over [`FundingState`]. Reads see the transaction's own writes.
pub struct FundingTxn<'a> {
    base: &'a FundingState,
    policy: FundingPolicy,
    trace_id: String,
    now: DateTime<Utc>,
    principals: BTreeMap<PrincipalId, Principal>,
    wallets: BTreeMap<PrincipalId, Wallet>,
    requests: BTreeMap<RequestId, FundingRequest>,
    commitments: BTreeMap<CommitmentId, Commitment>,
    runs: BTreeMap<RunId, Run>,
    allocations: BTreeMap<AllocationId, Allocation>,
    ledger: Vec<LedgerEntry>,
    audit: Vec<AuditEntry>,
}

impl<'a> FundingTxn<'a> {
    pub fn begin(base: &'a FundingState, policy: FundingPolicy, now: DateTime<Utc>) -> Self {
        Self {
            base,
            policy,
            trace_id: Uuid::new_v4().to_string(),
            now,
            principals: BTreeMap::new(),
            wallets: BTreeMap::new(),
            requests: BTreeMap::new(),
            commitments: BTreeMap::new(),
            runs: BTreeMap::new(),
            allocations: BTreeMap::new(),
            ledger: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn policy(&self) -> FundingPolicy {
        self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn into_changeset(self) -> Changeset {
        Changeset {
            trace_id: self.trace_id,
            principals: self.principals.into_values().collect(),
            wallets: self.wallets.into_values().collect(),
            requests: self.requests.into_values().collect(),
            commitments: self.commitments.into_values().collect(),
            runs: self.runs.into_values().collect(),
            allocations: self.allocations.into_values().collect(),
            ledger_entries: self.ledger,
            audit_entries: self.audit,
        }
    }

    // --- principals and wallets ---

    pub fn principal(&self, id: &PrincipalId) -> Option<&Principal> {
        self.principals
            .get(id)
            .or_else(|| self.base.principals.get(id))
    }

    pub fn email_taken(&self, email: &str) -> bool {
        self.base
            .principals
            .values()
            .chain(self.principals.values())
            .any(|principal| principal.email.eq_ignore_ascii_case(email))
    }

    pub fn put_principal(&mut self, principal: Principal) {
        self.principals.insert(principal.id.clone(), principal);
    }

    pub fn wallet(&self, id: &PrincipalId) -> Option<&Wallet> {
        self.wallets.get(id).or_else(|| self.base.wallets.get(id))
    }

    pub fn require_wallet(&self, id: &PrincipalId) -> Result<Wallet, FundingError> {
        self.wallet(id)
            .cloned()
            .ok_or_else(|| FundingError::PrincipalNotFound(id.clone()))
    }

    pub fn put_wallet(&mut self, wallet: Wallet) {
        self.wallets.insert(wallet.principal.clone(), wallet);
    }

    // --- requests ---

    pub fn request(&self, id: RequestId) -> Option<&FundingRequest> {
        self.requests
            .get(&id)
            .or_else(|| self.base.requests.get(&id))
    }

    pub fn require_request(&self, id: RequestId) -> Result<FundingRequest, FundingError> {
        self.request(id)
            .cloned()
            .ok_or(FundingError::RequestNotFound(id))
    }

    pub fn put_request(&mut self, request: FundingRequest) {
        self.requests.insert(request.id, request);
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(next_key(&self.base.requests, &self.requests, |id| id.0))
    }

    // --- commitments ---

    pub fn commitment(&self, id: CommitmentId) -> Option<&Commitment> {
        self.commitments
            .get(&id)
            .or_else(|| self.base.commitments.get(&id))
    }

    pub fn put_commitment(&mut self, commitment: Commitment) {
        self.commitments.insert(commitment.id, commitment);
    }

    pub fn next_commitment_id(&self) -> CommitmentId {
        CommitmentId(next_key(&self.base.commitments, &self.commitments, |id| id.0))
    }

    /// Commitments of a request in creation order.
    pub fn commitments_for(&self, request: RequestId) -> Vec<Commitment> {
        merged(
            self.base.index.request_commitments.get(&request),
            &self.base.commitments,
            &self.commitments,
            |commitment| commitment.request == request,
        )
    }

    // --- runs and allocations ---

    pub fn run(&self, id: RunId) -> Option<&Run> {
        self.runs.get(&id).or_else(|| self.base.runs.get(&id))
    }

    pub fn require_run(&self, id: RunId) -> Result<Run, FundingError> {
        self.run(id).cloned().ok_or(FundingError::RunNotFound(id))
    }

    pub fn put_run(&mut self, run: Run) {
        self.runs.insert(run.id, run);
    }

    pub fn next_run_id(&self) -> RunId {
        RunId(next_key(&self.base.runs, &self.runs, |id| id.0))
    }

    pub fn runs_for(&self, request: RequestId) -> Vec<Run> {
        merged(
            self.base.index.request_runs.get(&request),
            &self.base.runs,
            &self.runs,
            |run| run.request == request,
        )
    }

    pub fn active_run(&self, request: RequestId) -> Option<Run> {
        self.runs_for(request)
            .into_iter()
            .find(|run| run.status.is_active())
    }

    pub fn put_allocation(&mut self, allocation: Allocation) {
        self.allocations.insert(allocation.id, allocation);
    }

    pub fn next_allocation_id(&self) -> AllocationId {
        AllocationId(next_key(&self.base.allocations, &self.allocations, |id| id.0))
    }

    pub fn allocations_for_run(&self, run: RunId) -> Vec<Allocation> {
        merged(
            self.base.index.run_allocations.get(&run),
            &self.base.allocations,
            &self.allocations,
            |allocation| allocation.run == run,
        )
    }

    // --- append-only logs ---

    pub fn next_ledger_sequence(&self) -> u64 {
        (self.base.ledger.len() + self.ledger.len()) as u64 + 1
    }

    pub fn last_ledger_hash(&self) -> Option<String> {
        self.ledger
            .last()
            .or_else(|| self.base.ledger.last())
            .map(|entry| entry.entry_hash.clone())
    }

    pub fn push_ledger(&mut self, entry: LedgerEntry) {
        self.ledger.push(entry);
    }

    pub fn staged_ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    pub fn next_audit_sequence(&self) -> u64 {
        (self.base.audit.len() + self.audit.len()) as u64 + 1
    }

    pub fn last_audit_hash(&self) -> Option<String> {
        self.audit
            .last()
            .or_else(|| self.base.audit.last())
            .map(|entry| entry.hash.clone())
    }

    pub fn push_audit(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
    }

    pub fn staged_audit(&self) -> &[AuditEntry] {
        &self.audit
    }
}

fn next_key<K, V>(base: &BTreeMap<K, V>, staged: &BTreeMap<K, V>, raw: impl Fn(&K) -> u64) -> u64
where
    K: Ord,
{
    let base_max = base.keys().next_back().map(&raw).unwrap_or(0);
    let staged_max = staged.keys().next_back().map(&raw).unwrap_or(0);
    base_max.max(staged_max) + 1
}

fn merged<K, V>(
    base_ids: Option<&Vec<K>>,
    base: &BTreeMap<K, V>,
    staged: &BTreeMap<K, V>,
    belongs: impl Fn(&V) -> bool,
) -> Vec<V>
where
    K: Ord + Copy,
    V: Clone,
{
    let mut ids: Vec<K> = base_ids.cloned().unwrap_or_default();
    ids.extend(
        staged
            .iter()
            .filter(|(id, row)| !base.contains_key(*id) && belongs(row))
            .map(|(id, _)| *id),
    );
    ids.sort();
    ids.into_iter()
        .filter_map(|id| staged.get(&id).or_else(|| base.get(&id)).cloned())
        .collect()
}
