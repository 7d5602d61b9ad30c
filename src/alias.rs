//! Alias table mapping raw counterparty strings to canonical identities

use std::collections::HashMap;

use crate::types::{AliasEntry, CounterpartyCategory};

/// Uppercase, strip punctuation and collapse whitespace, so counterparty
/// names compare across the formatting noise of statement descriptions
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory alias index built from stored [`AliasEntry`] rows
///
/// Loaded once per pass; the matcher queries it to boost name-similarity
/// scoring, and the engine records confirmed raw strings back into it
/// (alias learning).
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    /// normalized variant -> canonical name
    by_variant: HashMap<String, String>,
    /// normalized canonical name -> full entry
    entries: HashMap<String, AliasEntry>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from stored entries
    pub fn from_entries(entries: Vec<AliasEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// Insert or replace an entry, indexing all of its variants
    pub fn insert(&mut self, entry: AliasEntry) {
        for variant in &entry.variants {
            self.by_variant
                .insert(normalize_name(variant), entry.canonical.clone());
        }
        self.entries.insert(normalize_name(&entry.canonical), entry);
    }

    /// Canonical name a raw string is a known variant of, if any
    pub fn lookup(&self, raw: &str) -> Option<&str> {
        self.by_variant.get(&normalize_name(raw)).map(String::as_str)
    }

    /// Whether any known variant of `canonical` occurs inside `text`
    /// (both sides normalized, `canonical` included)
    pub fn variant_in_text(&self, canonical: &str, text: &str) -> bool {
        let Some(entry) = self.entries.get(&normalize_name(canonical)) else {
            return false;
        };
        let haystack = normalize_name(text);
        entry
            .variants
            .iter()
            .map(|v| normalize_name(v))
            .any(|v| !v.is_empty() && haystack.contains(&v))
    }

    /// Record a newly confirmed raw string as a variant of `canonical`,
    /// returning the updated entry for persistence. No-op when the
    /// variant is already known.
    pub fn learn(
        &mut self,
        canonical: &str,
        category: CounterpartyCategory,
        raw: &str,
    ) -> Option<AliasEntry> {
        let normalized = normalize_name(raw);
        if normalized.is_empty() || normalized == normalize_name(canonical) {
            return None;
        }
        if self.by_variant.contains_key(&normalized) {
            return None;
        }

        let entry = self
            .entries
            .entry(normalize_name(canonical))
            .or_insert_with(|| AliasEntry::new(canonical.to_string(), category));
        entry.variants.push(raw.to_string());
        let updated = entry.clone();
        self.by_variant.insert(normalized, updated.canonical.clone());
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_infocert() -> AliasTable {
        let mut entry = AliasEntry::new(
            "Infocert Spa".to_string(),
            CounterpartyCategory::Supplier,
        );
        entry.variants.push("INFOCERT S.P.A.".to_string());
        entry.variants.push("Infocert digital".to_string());
        AliasTable::from_entries(vec![entry])
    }

    #[test]
    fn lookup_is_normalization_insensitive() {
        let table = table_with_infocert();
        assert_eq!(table.lookup("infocert s,p,a,"), Some("Infocert Spa"));
        assert_eq!(table.lookup("unknown corp"), None);
    }

    #[test]
    fn variant_in_text_finds_substring() {
        let table = table_with_infocert();
        assert!(table.variant_in_text("Infocert Spa", "PAGAMENTO INFOCERT S.P.A. RIF 123"));
        assert!(!table.variant_in_text("Infocert Spa", "PAGAMENTO ALTRO FORNITORE"));
        assert!(!table.variant_in_text("Missing Co", "anything"));
    }

    #[test]
    fn variant_lookup_ignores_canonical_formatting() {
        let table = table_with_infocert();
        // same identity, differently punctuated on the querying side
        assert!(table.variant_in_text("INFOCERT S.p.A.", "PAGAMENTO INFOCERT S.P.A. RIF 123"));
        assert!(table.variant_in_text("infocert spa", "saldo infocert digital"));
    }

    #[test]
    fn learn_merges_into_entry_regardless_of_canonical_formatting() {
        let mut table = table_with_infocert();
        let updated = table
            .learn(
                "INFOCERT SPA",
                CounterpartyCategory::Supplier,
                "SEPA INFOCERT IT",
            )
            .unwrap();
        // merged into the existing entry, not a parallel one
        assert_eq!(updated.canonical, "Infocert Spa");
        assert_eq!(updated.variants.len(), 3);
        assert_eq!(table.lookup("SEPA INFOCERT IT"), Some("Infocert Spa"));
    }

    #[test]
    fn learn_adds_new_variant_once() {
        let mut table = table_with_infocert();
        let updated = table.learn(
            "Infocert Spa",
            CounterpartyCategory::Supplier,
            "INFOCERT SPA PAGAMENTO",
        );
        assert!(updated.is_some());
        assert_eq!(table.lookup("INFOCERT SPA PAGAMENTO"), Some("Infocert Spa"));

        // already known now
        assert!(table
            .learn(
                "Infocert Spa",
                CounterpartyCategory::Supplier,
                "infocert spa pagamento"
            )
            .is_none());
    }
}
