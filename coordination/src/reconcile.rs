//! Repair of degenerate accounting totals.
//!
//! Given accounting output whose required totals are missing or zero while
//! the document still has items, recompute the totals from the items.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::documents::{AccountingOutput, Document, DocumentItem, DocumentTotals};

/// Sum item values (falling back to `quantity * unit_price`) and taxes.
pub fn recompute_totals(items: &[DocumentItem]) -> DocumentTotals {
    let items_total = items.iter().map(DocumentItem::effective_total).sum::<f64>().max(0.0);
    let taxes_total = items.iter().map(DocumentItem::tax_total).sum::<f64>().max(0.0);
    DocumentTotals {
        items_total,
        taxes_total,
        grand_total: items_total + taxes_total,
    }
}

/// Fill every zero field of the document's totals from its items. Non-zero
/// fields are kept. Returns whether anything changed.
pub fn ensure_document_totals(document: &mut Document) -> bool {
    let recomputed = recompute_totals(&document.items);
    let before = document.totals;
    let totals = &mut document.totals;
    if totals.items_total == 0.0 {
        totals.items_total = recomputed.items_total;
    }
    if totals.taxes_total == 0.0 {
        totals.taxes_total = recomputed.taxes_total;
    }
    if totals.grand_total == 0.0 {
        totals.grand_total = recomputed.grand_total;
    }
    document.totals != before
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Unchanged,
    Repaired {
        before: DocumentTotals,
        after: DocumentTotals,
    },
}

impl ReconcileOutcome {
    pub fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }
}

/// Detects and repairs degenerate accounting totals.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    epsilon: f64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self { epsilon: 1e-9 }
    }
}

impl Reconciler {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.abs(),
        }
    }

    /// True when the document has items but the totals are missing or the
    /// items or grand total is zero. Taxes may legitimately be zero.
    pub fn needs_repair(&self, output: &AccountingOutput) -> bool {
        let has_items = output
            .document
            .as_ref()
            .is_some_and(|doc| !doc.items.is_empty());
        if !has_items {
            return false;
        }
        match output.totals {
            None => true,
            Some(totals) => self.is_zero(totals.items_total) || self.is_zero(totals.grand_total),
        }
    }

    pub fn reconcile(&self, output: &mut AccountingOutput) -> ReconcileOutcome {
        if !self.needs_repair(output) {
            return ReconcileOutcome::Unchanged;
        }
        let Some(document) = output.document.as_mut() else {
            return ReconcileOutcome::Unchanged;
        };

        let before = output.totals.unwrap_or_default();
        // Start from the accounting view so zeroed fields are recomputed.
        document.totals = before;
        ensure_document_totals(document);
        let after = document.totals;
        output.totals = Some(after);

        if after == before {
            return ReconcileOutcome::Unchanged;
        }
        info!(
            document_id = %output.document_id,
            before_grand_total = before.grand_total,
            after_grand_total = after.grand_total,
            "Accounting totals recomputed"
        );
        ReconcileOutcome::Repaired { before, after }
    }

    fn is_zero(&self, value: f64) -> bool {
        value.abs() <= self.epsilon
    }
}
