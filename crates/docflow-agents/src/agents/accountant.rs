//! Ledger accountant.
//!
//! Books one revenue entry per item and one entry per tax kind. Totals are
//! passed through as extracted; degenerate totals are repaired by the
//! orchestrator's reconcile step, not here.

use std::collections::BTreeMap;

use anyhow::bail;
use chrono::Utc;
use coordination::documents::{AccountingOutput, ClassificationResult, LedgerEntry};

use super::{StageAgent, StageContext};

pub const REVENUE_ACCOUNT: &str = "3.1.01 revenue";
pub const TAX_ACCOUNT_PREFIX: &str = "2.1.05 taxes";

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerAccountant;

impl StageAgent<ClassificationResult, AccountingOutput> for LedgerAccountant {
    fn name(&self) -> &str {
        "accountant"
    }

    fn run(
        &self,
        classification: ClassificationResult,
        _ctx: &StageContext,
    ) -> anyhow::Result<AccountingOutput> {
        let document = classification.document;
        if document.items.is_empty() {
            bail!("document {} has no items to book", document.document_id);
        }

        let mut ledger_entries: Vec<LedgerEntry> = document
            .items
            .iter()
            .map(|item| LedgerEntry {
                account: REVENUE_ACCOUNT.to_string(),
                description: item.description.clone(),
                amount: item.total_value,
            })
            .collect();

        let mut taxes: BTreeMap<&str, f64> = BTreeMap::new();
        for item in &document.items {
            for (name, amount) in &item.taxes {
                *taxes.entry(name.as_str()).or_default() += amount;
            }
        }
        ledger_entries.extend(taxes.into_iter().map(|(name, amount)| LedgerEntry {
            account: format!("{TAX_ACCOUNT_PREFIX} {name}"),
            description: format!("{name} on {}", document.document_id),
            amount,
        }));

        Ok(AccountingOutput {
            document_id: document.document_id.clone(),
            ledger_entries,
            sped_files: vec![format!("sped_{}.txt", document.document_id)],
            generated_at: Utc::now(),
            totals: Some(document.totals),
            document: Some(document),
        })
    }
}
