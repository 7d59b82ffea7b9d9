use crate::error::FundingError;
use crate::state::FundingTxn;
use crate::types::{Coins, CommitmentId, PriceRef, PrincipalId, RequestId, RunId, Wallet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Balance-affecting event kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Grant,
    Purchase,
    Commit,
    Refund,
}

impl LedgerEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Purchase => "purchase",
            Self::Commit => "commit",
            Self::Refund => "refund",
        }
    }
}

/// What a ledger entry relates to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRef {
    pub request: Option<RequestId>,
    pub run: Option<RunId>,
    pub commitment: Option<CommitmentId>,
    /// Free-form origin of a grant, e.g. `signup`.
    pub source: Option<String>,
    pub price: Option<PriceRef>,
}

impl LedgerRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn price(price: PriceRef) -> Self {
        Self {
            price: Some(price),
            ..Self::default()
        }
    }

    pub fn commitment(request: RequestId, commitment: CommitmentId) -> Self {
        Self {
            request: Some(request),
            commitment: Some(commitment),
            ..Self::default()
        }
    }

    pub fn with_run(mut self, run: RunId) -> Self {
        self.run = Some(run);
        self
    }
}

/// Hash-chained, immutable record of one balance change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub sequence: u64,
    pub trace_id: String,
    pub principal: PrincipalId,
    pub kind: LedgerEntryKind,
    pub delta: i64,
    pub reference: LedgerRef,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl LedgerEntry {
    fn expected_hash(&self) -> String {
        compute_entry_hash(
            self.sequence,
            &self.trace_id,
            &self.principal,
            self.kind,
            self.delta,
            &self.reference,
            self.timestamp,
            self.previous_hash.as_deref(),
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_entry_hash(
    sequence: u64,
    trace_id: &str,
    principal: &PrincipalId,
    kind: LedgerEntryKind,
    delta: i64,
    reference: &LedgerRef,
    timestamp: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "sequence": sequence,
        "trace_id": trace_id,
        "principal": principal,
        "kind": kind,
        "delta": delta,
        "reference": reference,
        "timestamp": timestamp,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Verify sequence contiguity and the hash chain of a full ledger.
pub fn verify_chain(entries: &[LedgerEntry]) -> bool {
    let mut previous_hash: Option<String> = None;
    for (position, entry) in entries.iter().enumerate() {
        if entry.sequence != position as u64 + 1 {
            return false;
        }
        if entry.previous_hash != previous_hash {
            return false;
        }
        if entry.entry_hash != entry.expected_hash() {
            return false;
        }
        previous_hash = Some(entry.entry_hash.clone());
    }
    true
}

/// Wallet counters rebuilt from ledger entries alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletTotals {
    pub available: i64,
    pub granted: i64,
    pub purchased: i64,
    pub spent: i64,
}

impl WalletTotals {
    pub fn matches(&self, wallet: &Wallet) -> Result<(), String> {
        let expected = [
            ("available", self.available, wallet.available),
            ("lifetime_granted", self.granted, wallet.lifetime_granted),
            ("lifetime_purchased", self.purchased, wallet.lifetime_purchased),
            ("lifetime_spent", self.spent, wallet.lifetime_spent),
        ];
        for (field, replayed, stored) in expected {
            if i64::try_from(stored.0).ok() != Some(replayed) {
                return Err(format!(
                    "wallet {} {field} is {} but ledger replay gives {replayed}",
                    wallet.principal, stored.0
                ));
            }
        }
        Ok(())
    }
}

pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> WalletTotals {
    entries
        .into_iter()
        .fold(WalletTotals::default(), |mut totals, entry| {
            totals.available = totals.available.saturating_add(entry.delta);
            match entry.kind {
                LedgerEntryKind::Grant => {
                    totals.granted = totals.granted.saturating_add(entry.delta)
                }
                LedgerEntryKind::Purchase => {
                    totals.purchased = totals.purchased.saturating_add(entry.delta)
                }
                LedgerEntryKind::Commit => totals.spent = totals.spent.saturating_sub(entry.delta),
                LedgerEntryKind::Refund => totals.spent = totals.spent.saturating_sub(entry.delta),
            }
            totals
        })
}

fn positive(amount: Coins) -> Result<i64, FundingError> {
    if amount.is_zero() {
        return Err(FundingError::InvalidAmount(
            "amount must be a positive whole number of coins".to_string(),
        ));
    }
    amount
        .as_delta()
        .ok_or_else(|| FundingError::InvalidAmount(format!("{amount} exceeds the ledger range")))
}

fn overflow(principal: &PrincipalId) -> FundingError {
    FundingError::InvalidAmount(format!("balance of {principal} would overflow"))
}

impl FundingTxn<'_> {
    /// Increase `available` and the lifetime counter matching `kind`.
    pub fn credit(
        &mut self,
        principal: &PrincipalId,
        amount: Coins,
        kind: LedgerEntryKind,
        reference: LedgerRef,
    ) -> Result<LedgerEntry, FundingError> {
        let delta = positive(amount)?;
        let mut wallet = self.require_wallet(principal)?;

        let counter = match kind {
            LedgerEntryKind::Grant => &mut wallet.lifetime_granted,
            LedgerEntryKind::Purchase => &mut wallet.lifetime_purchased,
            LedgerEntryKind::Commit | LedgerEntryKind::Refund => {
                return Err(FundingError::LedgerInvariantViolation(format!(
                    "{} is not a credit kind",
                    kind.as_str()
                )))
            }
        };
        *counter = counter
            .checked_add(amount)
            .ok_or_else(|| overflow(principal))?;
        wallet.available = wallet
            .available
            .checked_add(amount)
            .ok_or_else(|| overflow(principal))?;

        wallet.updated_at = self.now();
        self.put_wallet(wallet);
        Ok(self.append_ledger(principal, kind, delta, reference))
    }

    /// Spend coins from `available`. Fails without touching the wallet when short.
    pub fn debit(
        &mut self,
        principal: &PrincipalId,
        amount: Coins,
        reference: LedgerRef,
    ) -> Result<LedgerEntry, FundingError> {
        let delta = positive(amount)?;
        let mut wallet = self.require_wallet(principal)?;

        wallet.available = wallet.available.checked_sub(amount).ok_or_else(|| {
            FundingError::InsufficientBalance {
                principal: principal.clone(),
                required: amount,
                available: wallet.available,
            }
        })?;
        wallet.lifetime_spent = wallet
            .lifetime_spent
            .checked_add(amount)
            .ok_or_else(|| overflow(principal))?;

        wallet.updated_at = self.now();
        self.put_wallet(wallet);
        Ok(self.append_ledger(principal, LedgerEntryKind::Commit, -delta, reference))
    }

    /// Return previously spent coins. Bounded by what the referenced commitment actually consumed.
    pub fn reverse(
        &mut self,
        principal: &PrincipalId,
        amount: Coins,
        reference: LedgerRef,
    ) -> Result<LedgerEntry, FundingError> {
        let delta = positive(amount)?;
        let commitment_id = reference.commitment.ok_or_else(|| {
            FundingError::LedgerInvariantViolation("refund without a commitment reference".into())
        })?;
        let commitment = self.commitment(commitment_id).ok_or_else(|| {
            FundingError::LedgerInvariantViolation(format!("refund of unknown {commitment_id}"))
        })?;
        if &commitment.principal != principal {
            return Err(FundingError::LedgerInvariantViolation(format!(
                "{commitment_id} belongs to {}, not {principal}",
                commitment.principal
            )));
        }
        let refundable = commitment
            .consumed()
            .checked_sub(commitment.refunded)
            .unwrap_or(Coins::ZERO);
        if amount > refundable {
            return Err(FundingError::LedgerInvariantViolation(format!(
                "refund of {amount} exceeds the {refundable} still spent on {commitment_id}"
            )));
        }

        let mut wallet = self.require_wallet(principal)?;
        wallet.lifetime_spent = wallet.lifetime_spent.checked_sub(amount).ok_or_else(|| {
            FundingError::LedgerInvariantViolation(format!(
                "refund of {amount} exceeds lifetime spend of {principal}"
            ))
        })?;
        wallet.available = wallet
            .available
            .checked_add(amount)
            .ok_or_else(|| overflow(principal))?;

        wallet.updated_at = self.now();
        self.put_wallet(wallet);
        Ok(self.append_ledger(principal, LedgerEntryKind::Refund, delta, reference))
    }

    fn append_ledger(
        &mut self,
        principal: &PrincipalId,
        kind: LedgerEntryKind,
        delta: i64,
        reference: LedgerRef,
    ) -> LedgerEntry {
        let sequence = self.next_ledger_sequence();
        let previous_hash = self.last_ledger_hash();
        let timestamp = self.now();
        let trace_id = self.trace_id().to_string();
        let entry_hash = compute_entry_hash(
            sequence,
            &trace_id,
            principal,
            kind,
            delta,
            &reference,
            timestamp,
            previous_hash.as_deref(),
        );

        let entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            sequence,
            trace_id,
            principal: principal.clone(),
            kind,
            delta,
            reference,
            timestamp,
            previous_hash,
            entry_hash,
        };
        debug!(
            principal = %principal,
            kind = kind.as_str(),
            delta,
            sequence,
            "ledger entry staged"
        );
        self.push_ledger(entry.clone());
        entry
    }
}
