use crate::audit::{actions, AuditRefs};
use crate::error::FundingError;
use crate::ledger::{LedgerEntryKind, LedgerRef};
use crate::state::FundingTxn;
use crate::types::{Coins, PriceRef, Principal, PrincipalId, Wallet};
use crate::validate;
use serde_json::json;

/// Ledger source recorded for the onboarding grant.
pub const SIGNUP_SOURCE: &str = "signup";

impl FundingTxn<'_> {
    /// Create a principal and its wallet, then apply the starter grant.
    pub fn onboard_principal(
        &mut self,
        username: &str,
        email: &str,
    ) -> Result<Wallet, FundingError> {
        let username = validate::username(username)?;
        let email = validate::email(email)?;
        let id = PrincipalId::new(username.clone());
        if self.principal(&id).is_some() {
            return Err(FundingError::DuplicatePrincipal(username));
        }
        if self.email_taken(&email) {
            return Err(FundingError::DuplicatePrincipal(email));
        }

        let now = self.now();
        self.put_principal(Principal {
            id: id.clone(),
            email: email.clone(),
            onboarded_at: now,
        });
        self.put_wallet(Wallet::empty(id.clone(), now));

        let starter = self.policy().starter_grant;
        if !starter.is_zero() {
            self.credit(
                &id,
                starter,
                LedgerEntryKind::Grant,
                LedgerRef::source(SIGNUP_SOURCE),
            )?;
        }

        self.record(
            id.as_str(),
            actions::PRINCIPAL_ONBOARDED,
            AuditRefs::none(),
            json!({ "email": email, "starterGrant": starter.0 }),
        )?;
        self.require_wallet(&id)
    }

    pub fn grant_coins(
        &mut self,
        principal: &PrincipalId,
        amount: Coins,
        source: &str,
    ) -> Result<Wallet, FundingError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(FundingError::validation("grant source must not be empty"));
        }
        self.credit(
            principal,
            amount,
            LedgerEntryKind::Grant,
            LedgerRef::source(source),
        )?;
        self.record(
            source,
            actions::WALLET_GRANTED,
            AuditRefs::none(),
            json!({ "principal": principal, "amount": amount.0 }),
        )?;
        self.require_wallet(principal)
    }

    /// Credit coins whose price was settled by the payment collaborator.
    pub fn purchase_coins(
        &mut self,
        principal: &PrincipalId,
        amount: Coins,
        price: PriceRef,
    ) -> Result<Wallet, FundingError> {
        if price.reference.trim().is_empty() {
            return Err(FundingError::validation("price reference must not be empty"));
        }
        let detail = json!({
            "amount": amount.0,
            "priceRef": price.reference,
            "usdCents": price.usd_cents,
        });
        self.credit(
            principal,
            amount,
            LedgerEntryKind::Purchase,
            LedgerRef::price(price),
        )?;
        self.record(
            principal.as_str(),
            actions::WALLET_PURCHASED,
            AuditRefs::none(),
            detail,
        )?;
        self.require_wallet(principal)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::FundingPolicy;
    use crate::error::FundingError;
    use crate::state::{FundingState, FundingTxn};
    use crate::types::{Coins, PriceRef, PrincipalId};
    use chrono::Utc;

    #[test]
    fn onboarding_grants_starter_coins_once() {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        let wallet = txn.onboard_principal("alice", "alice@example.com").unwrap();
        assert_eq!(wallet.available, Coins(50));
        assert_eq!(wallet.lifetime_granted, Coins(50));
        assert_eq!(txn.staged_ledger().len(), 1);
        assert_eq!(txn.staged_audit().len(), 1);

        assert!(matches!(
            txn.onboard_principal("alice", "other@example.com"),
            Err(FundingError::DuplicatePrincipal(_))
        ));
        assert!(matches!(
            txn.onboard_principal("alice2", "ALICE@example.com"),
            Err(FundingError::DuplicatePrincipal(_))
        ));
    }

    #[test]
    fn purchase_records_price_reference() {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        txn.onboard_principal("bob", "bob@example.com").unwrap();
        let bob = PrincipalId::new("bob");
        let wallet = txn
            .purchase_coins(
                &bob,
                Coins(100),
                PriceRef::new("starter-100").with_usd_cents(1000),
            )
            .unwrap();
        assert_eq!(wallet.available, Coins(150));
        assert_eq!(wallet.lifetime_purchased, Coins(100));
        let entry = txn.staged_ledger().last().unwrap();
        assert_eq!(
            entry.reference.price.as_ref().map(|p| p.reference.as_str()),
            Some("starter-100")
        );
    }

    #[test]
    fn grant_to_unknown_principal_fails() {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        assert!(matches!(
            txn.grant_coins(&PrincipalId::new("ghost"), Coins(5), "promo"),
            Err(FundingError::PrincipalNotFound(_))
        ));
    }
}
