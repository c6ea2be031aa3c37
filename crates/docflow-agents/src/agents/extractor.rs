//! Line-oriented extractor.
//!
//! Reads decoded document text where each item is one pipe-separated line:
//!
//! ```text
//! cfop: 5102
//! [SKU-1] Coffee beans 1kg | 2 | 35,90 | 71,80 | icms=12,92
//! Paper filters | 10 | 1,50
//! ```
//!
//! `key: value` lines become metadata (without overriding metadata supplied
//! with the input). Columns after the unit price are an optional declared
//! total and optional `name=value` tax pairs. A missing total stays 0.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use coordination::documents::{parse_amount, Document, DocumentInput, DocumentItem, DocumentTotals};
use regex::Regex;
use tracing::debug;

use super::{StageAgent, StageContext};

static ITEM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\[(?P<sku>[^\]]+)\]\s*)?(?P<desc>[^|]+?)\s*\|\s*(?P<qty>[^|]+?)\s*\|\s*(?P<price>[^|]+?)\s*(?:\|\s*(?P<total>[^|=]*?)\s*)?(?:\|\s*(?P<taxes>[^|]*?))?\s*$",
    )
    .expect("item line regex should compile")
});

static META_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<key>[A-Za-z_][A-Za-z0-9_]*)\s*:\s*(?P<value>.+?)\s*$")
        .expect("metadata line regex should compile")
});

static TAX_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<name>[A-Za-z_]+)\s*=\s*(?P<value>-?[0-9][0-9.,]*)")
        .expect("tax pair regex should compile")
});

#[derive(Debug, Default)]
pub struct LineExtractor;

impl LineExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Parse every item line; other lines are ignored.
    pub fn parse_items(text: &str) -> Vec<DocumentItem> {
        text.lines().filter_map(parse_item).collect()
    }
}

fn parse_item(line: &str) -> Option<DocumentItem> {
    let caps = ITEM_LINE.captures(line)?;
    let quantity = parse_amount(&caps["qty"]);
    let unit_price = parse_amount(&caps["price"]);
    let total_value = caps
        .name("total")
        .map(|m| parse_amount(m.as_str()))
        .unwrap_or(0.0);
    // Header rows and separators parse to all zeros.
    if quantity <= 0.0 && unit_price <= 0.0 && total_value <= 0.0 {
        return None;
    }

    let taxes: BTreeMap<String, f64> = caps
        .name("taxes")
        .map(|m| {
            TAX_PAIR
                .captures_iter(m.as_str())
                .map(|pair| (pair["name"].to_lowercase(), parse_amount(&pair["value"])))
                .collect()
        })
        .unwrap_or_default();

    Some(DocumentItem {
        sku: caps.name("sku").map(|m| m.as_str().trim().to_string()),
        description: caps["desc"].trim().to_string(),
        quantity: if quantity > 0.0 { quantity } else { 1.0 },
        unit_price,
        total_value,
        taxes,
    })
}

impl StageAgent<DocumentInput, Document> for LineExtractor {
    fn name(&self) -> &str {
        "extractor"
    }

    fn run(&self, input: DocumentInput, _ctx: &StageContext) -> anyhow::Result<Document> {
        let items = Self::parse_items(&input.content);
        let mut document = Document::from_input(&input, items);

        for line in input.content.lines().filter(|l| !l.contains('|')) {
            if let Some(caps) = META_LINE.captures(line) {
                let key = caps["key"].to_lowercase();
                document
                    .metadata
                    .entry(key)
                    .or_insert_with(|| caps["value"].to_string().into());
            }
        }

        let declared: f64 = document.items.iter().map(|item| item.total_value).sum();
        document.totals = DocumentTotals {
            items_total: declared,
            taxes_total: 0.0,
            grand_total: declared,
        };

        debug!(
            document_id = %document.document_id,
            items = document.items.len(),
            grand_total = declared,
            "Extracted document"
        );
        Ok(document)
    }
}
