//! Matching engine scoring `(document, movement)` pairs
//!
//! Pure: callers apply results through the state machine. Selection is a
//! deterministic function of its inputs, so a pass over the same snapshot
//! always reproduces the same matches.

use bigdecimal::{BigDecimal, ToPrimitive};
use std::collections::HashMap;

use crate::alias::{normalize_name, AliasTable};
use crate::traits::{
    normalize_code, InvoiceNumberExtractor, Reconcilable, ReferenceCodeExtractor,
    SlipCodeExtractor, TicketNumberExtractor,
};
use crate::types::*;

/// Tolerances, windows, weights and thresholds driving the matcher
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Relative amount tolerance (fraction of the document amount)
    pub amount_tolerance_pct: f64,
    /// Absolute amount tolerance floor; the wider of the two applies
    pub amount_epsilon: BigDecimal,
    /// Date window in days around the document reference date, per kind
    pub date_windows: HashMap<DocumentKindTag, i64>,
    /// Weight of amount-closeness in the composite score
    pub weight_amount: f64,
    /// Weight of name-similarity in the composite score
    pub weight_name: f64,
    /// Weight of the date-proximity bonus in the composite score
    pub weight_date: f64,
    /// Scores at or above this are accepted without review
    pub accept_threshold: f64,
    /// Scores in `[review, accept)` are proposed as uncertain matches
    pub review_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        let mut date_windows = HashMap::new();
        date_windows.insert(DocumentKindTag::Invoice, 60);
        date_windows.insert(DocumentKindTag::CardCharge, 30);
        date_windows.insert(DocumentKindTag::TicketCharge, 90);
        date_windows.insert(DocumentKindTag::TaxFormLine, 120);

        Self {
            amount_tolerance_pct: 0.02,
            amount_epsilon: BigDecimal::from(1),
            date_windows,
            weight_amount: 0.4,
            weight_name: 0.4,
            weight_date: 0.2,
            accept_threshold: 0.85,
            review_threshold: 0.55,
        }
    }
}

impl MatchConfig {
    /// Date window (days) for a document kind; 60 when unconfigured
    pub fn date_window(&self, tag: DocumentKindTag) -> i64 {
        self.date_windows.get(&tag).copied().unwrap_or(60)
    }

    /// Amount tolerance for a document: ±pct of the amount, floored at
    /// the absolute epsilon
    pub fn amount_tolerance(&self, amount: &BigDecimal) -> BigDecimal {
        // pct is a small config constant; routing it through f64 keeps
        // the arithmetic simple without touching the money values
        let relative = amount * BigDecimal::try_from(self.amount_tolerance_pct)
            .unwrap_or_else(|_| BigDecimal::from(0));
        if relative > self.amount_epsilon {
            relative
        } else {
            self.amount_epsilon.clone()
        }
    }
}

/// What the caller should do with the best candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    /// Certain or high-confidence match; reconcile directly
    Accept,
    /// Review band; route to `NeedsReviewUncertainMatch`
    Review,
    /// No candidate cleared the minimum threshold
    NoMatch,
}

/// Outcome of scoring one document against a candidate set
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Winning movement, when the decision is not `NoMatch`
    pub movement_id: Option<String>,
    /// Composite score of the winner, 1.0 for reference-code matches
    pub score: f64,
    pub decision: MatchDecision,
    /// Human-readable account of how the score came together
    pub rationale: String,
}

impl MatchResult {
    fn no_match(rationale: impl Into<String>) -> Self {
        Self {
            movement_id: None,
            score: 0.0,
            decision: MatchDecision::NoMatch,
            rationale: rationale.into(),
        }
    }
}

struct Scored<'a> {
    movement: &'a LedgerMovement,
    score: f64,
    quantized: i64,
    date_distance: i64,
    amount_distance: BigDecimal,
    rationale: String,
}

/// Scores match candidates for a document
///
/// Holds the config and the per-kind reference-code extractors. Built-in
/// extractors cover invoices, tickets and tax-form slips; callers can
/// register replacements per kind for new code formats.
pub struct Matcher {
    config: MatchConfig,
    extractors: HashMap<DocumentKindTag, Box<dyn ReferenceCodeExtractor>>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

impl Matcher {
    /// Create a matcher with the built-in extractors registered
    pub fn new(config: MatchConfig) -> Self {
        let mut matcher = Self {
            config,
            extractors: HashMap::new(),
        };
        matcher.register_extractor(DocumentKindTag::Invoice, Box::new(InvoiceNumberExtractor));
        matcher.register_extractor(
            DocumentKindTag::TicketCharge,
            Box::new(TicketNumberExtractor),
        );
        matcher.register_extractor(DocumentKindTag::TaxFormLine, Box::new(SlipCodeExtractor));
        matcher
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Register (or replace) the extractor for a document kind
    pub fn register_extractor(
        &mut self,
        tag: DocumentKindTag,
        extractor: Box<dyn ReferenceCodeExtractor>,
    ) {
        self.extractors.insert(tag, extractor);
    }

    /// Select the best candidate for `document` among `candidates`
    ///
    /// Consumed, annulled and provisional movements never qualify. The
    /// reference-code shortcut dominates every other criterion: a
    /// movement whose description contains the document's unique code
    /// wins with score 1.0 even outside the amount and date windows.
    pub fn find_best_match(
        &self,
        document: &PayableDocument,
        candidates: &[LedgerMovement],
        aliases: &AliasTable,
    ) -> MatchResult {
        let available: Vec<&LedgerMovement> =
            candidates.iter().filter(|m| m.is_available()).collect();
        if available.is_empty() {
            return MatchResult::no_match("no available candidates");
        }

        if let Some(result) = self.match_by_reference_code(document, &available) {
            return result;
        }

        let tolerance = self.config.amount_tolerance(&document.amount_due);
        let window = self.config.date_window(document.kind.tag());

        let mut scored: Vec<Scored<'_>> = available
            .iter()
            .filter_map(|movement| self.score_candidate(document, movement, aliases, &tolerance, window))
            .collect();

        if scored.is_empty() {
            return MatchResult::no_match(format!(
                "no candidate within ±{} and ±{} days",
                tolerance, window
            ));
        }

        // max score; ties broken by date distance, amount distance, id
        scored.sort_by(|a, b| {
            b.quantized
                .cmp(&a.quantized)
                .then_with(|| a.date_distance.cmp(&b.date_distance))
                .then_with(|| a.amount_distance.cmp(&b.amount_distance))
                .then_with(|| a.movement.id.cmp(&b.movement.id))
        });
        let best = &scored[0];

        let decision = if best.score >= self.config.accept_threshold {
            MatchDecision::Accept
        } else if best.score >= self.config.review_threshold {
            MatchDecision::Review
        } else {
            return MatchResult::no_match(format!(
                "best candidate '{}' scored {:.3}, below review threshold",
                best.movement.id, best.score
            ));
        };

        MatchResult {
            movement_id: Some(best.movement.id.clone()),
            score: best.score,
            decision,
            rationale: best.rationale.clone(),
        }
    }

    /// Reference-code shortcut: certain match when the code appears in
    /// the movement's free text
    fn match_by_reference_code(
        &self,
        document: &PayableDocument,
        available: &[&LedgerMovement],
    ) -> Option<MatchResult> {
        let extractor = self.extractors.get(&document.kind.tag())?;
        let code = extractor.extract(document)?;

        let mut hits: Vec<&&LedgerMovement> = available
            .iter()
            .filter(|m| normalize_code(&m.description).contains(&code))
            .collect();
        if hits.is_empty() {
            return None;
        }

        // More than one hit on a unique code still needs a deterministic
        // winner: same tie-break chain as composite scoring.
        hits.sort_by(|a, b| {
            let da = (a.date - document.reference_date()).num_days().abs();
            let db = (b.date - document.reference_date()).num_days().abs();
            let aa = (a.amount.abs() - document.amount_due.abs()).abs();
            let ab = (b.amount.abs() - document.amount_due.abs()).abs();
            da.cmp(&db).then_with(|| aa.cmp(&ab)).then_with(|| a.id.cmp(&b.id))
        });

        Some(MatchResult {
            movement_id: Some(hits[0].id.clone()),
            score: 1.0,
            decision: MatchDecision::Accept,
            rationale: format!("reference code '{}' found in movement description", code),
        })
    }

    fn score_candidate<'a>(
        &self,
        document: &PayableDocument,
        movement: &'a LedgerMovement,
        aliases: &AliasTable,
        tolerance: &BigDecimal,
        window: i64,
    ) -> Option<Scored<'a>> {
        let amount_distance = (movement.amount.abs() - document.amount_due.abs()).abs();
        if &amount_distance > tolerance {
            return None;
        }

        let date_distance = (movement.date - document.reference_date()).num_days().abs();
        if date_distance > window {
            return None;
        }

        let amount_closeness = 1.0
            - (big_to_f64(&amount_distance) / big_to_f64(tolerance)).clamp(0.0, 1.0);
        let (name_similarity, name_tier) =
            name_similarity(document.counterparty(), &movement.description, aliases);
        let date_bonus = match date_distance {
            0..=7 => 1.0,
            8..=30 => 0.6,
            31..=60 => 0.3,
            _ => 0.0,
        };

        let score = self.config.weight_amount * amount_closeness
            + self.config.weight_name * name_similarity
            + self.config.weight_date * date_bonus;

        let rationale = format!(
            "amount {:.2} ({} off), name {:.2} ({}), date {:.1} ({} days off)",
            amount_closeness, amount_distance, name_similarity, name_tier, date_bonus,
            date_distance
        );

        Some(Scored {
            movement,
            score,
            quantized: quantize(score),
            date_distance,
            amount_distance,
            rationale,
        })
    }
}

/// Tiered name similarity: exact > substring containment > alias-table
/// hit > token-overlap ratio > nothing. Returns the score and the tier
/// name for the rationale.
fn name_similarity(counterparty: &str, description: &str, aliases: &AliasTable) -> (f64, &'static str) {
    let name = normalize_name(counterparty);
    let text = normalize_name(description);
    if name.is_empty() || text.is_empty() {
        return (0.0, "none");
    }

    if name == text {
        return (1.0, "exact");
    }
    if text.contains(&name) {
        return (0.85, "substring");
    }
    if aliases.variant_in_text(counterparty, description) {
        return (0.7, "alias");
    }
    if let Some(canonical) = aliases.lookup(description) {
        if normalize_name(canonical) == name {
            return (0.7, "alias");
        }
    }

    let name_tokens: Vec<&str> = name.split_whitespace().collect();
    let overlap = name_tokens
        .iter()
        .filter(|token| text.split_whitespace().any(|t| t == **token))
        .count();
    if overlap > 0 {
        let ratio = overlap as f64 / name_tokens.len() as f64;
        (0.6 * ratio, "token-overlap")
    } else {
        (0.0, "none")
    }
}

/// Quantize a score so float jitter cannot perturb the tie-break chain
fn quantize(score: f64) -> i64 {
    (score * 1e9).round() as i64
}

fn big_to_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn invoice(amount: i64, issue: NaiveDate, counterparty: &str) -> PayableDocument {
        PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::Invoice {
                number: "15".to_string(),
            },
            counterparty.to_string(),
            BigDecimal::from(amount),
            issue,
            issue + chrono::Duration::days(30),
        )
    }

    fn movement(id: &str, amount: i64, date: NaiveDate, description: &str) -> LedgerMovement {
        LedgerMovement::imported(
            id.to_string(),
            date,
            BigDecimal::from(-amount),
            description.to_string(),
            SourceAccount::Bank,
            "batch-1".to_string(),
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn high_confidence_match_is_accepted() {
        // amount exact, counterparty substring, 3 days apart
        let doc = invoice(122, date(2026, 1, 31), "Infocert Spa");
        let candidates = vec![movement(
            "m1",
            122,
            date(2026, 2, 3),
            "INFOCERT SPA PAGAMENTO",
        )];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert_eq!(result.decision, MatchDecision::Accept);
        assert_eq!(result.movement_id.as_deref(), Some("m1"));
        assert!(result.score >= 0.85, "score was {}", result.score);
    }

    #[test]
    fn composite_rationale_reports_each_criterion() {
        let doc = invoice(122, date(2026, 1, 31), "Infocert Spa");
        let candidates = vec![movement(
            "m1",
            122,
            date(2026, 2, 3),
            "INFOCERT SPA PAGAMENTO",
        )];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert!(result.rationale.contains("amount"), "{}", result.rationale);
        assert!(result.rationale.contains("substring"), "{}", result.rationale);
        assert!(result.rationale.contains("days off"), "{}", result.rationale);
    }

    #[test]
    fn reference_code_dominates_amount_and_name_noise() {
        let mut doc = invoice(500, date(2026, 1, 10), "Comune di Milano");
        doc.kind = DocumentKind::TicketCharge {
            ticket_number: "VRB12345".to_string(),
        };
        // wrong amount, unrelated description text around the code
        let candidates = vec![
            movement("m1", 480, date(2026, 3, 1), "PAG. VERBALE VRB 12345 POLIZIA"),
            movement("m2", 500, date(2026, 1, 11), "COMUNE DI MILANO"),
        ];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert_eq!(result.decision, MatchDecision::Accept);
        assert_eq!(result.movement_id.as_deref(), Some("m1"));
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn candidates_outside_both_windows_are_never_returned() {
        let doc = invoice(500, date(2026, 1, 10), "Fornitore Srl");
        let candidates = vec![
            // amount out of tolerance
            movement("m1", 600, date(2026, 1, 12), "FORNITORE SRL"),
            // date out of window
            movement("m2", 500, date(2026, 6, 1), "FORNITORE SRL"),
        ];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert_eq!(result.decision, MatchDecision::NoMatch);
        assert!(result.movement_id.is_none());
    }

    #[test]
    fn consumed_movements_are_not_candidates() {
        let doc = invoice(122, date(2026, 1, 31), "Infocert Spa");
        let mut consumed = movement("m1", 122, date(2026, 2, 3), "INFOCERT SPA PAGAMENTO");
        consumed.consumed_by = Some("other-doc".to_string());

        let result = Matcher::default().find_best_match(&doc, &[consumed], &AliasTable::new());
        assert_eq!(result.decision, MatchDecision::NoMatch);
    }

    #[test]
    fn equal_scores_break_ties_by_date_then_id() {
        // 118 and 122 are both 2.00 away from 120; tolerance is
        // max(2%, 1.00) = 2.40 so both qualify with identical closeness.
        let doc = invoice(120, date(2026, 1, 15), "Fornitore Srl");
        let candidates = vec![
            movement("m-b", 118, date(2026, 1, 20), "FORNITORE SRL"),
            movement("m-a", 122, date(2026, 1, 20), "FORNITORE SRL"),
        ];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        // everything equal: lexicographically smallest id wins
        assert_eq!(result.movement_id.as_deref(), Some("m-a"));

        let candidates = vec![
            movement("m-b", 118, date(2026, 1, 17), "FORNITORE SRL"),
            movement("m-a", 122, date(2026, 1, 20), "FORNITORE SRL"),
        ];
        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        // same date tier, smaller date distance wins ahead of id
        assert_eq!(result.movement_id.as_deref(), Some("m-b"));
    }

    #[test]
    fn alias_hit_scores_between_substring_and_token_overlap() {
        let mut entry = AliasEntry::new("Enel Energia".to_string(), CounterpartyCategory::Supplier);
        entry.variants.push("EE SPA ADDEBITO".to_string());
        let aliases = AliasTable::from_entries(vec![entry]);

        let doc = invoice(200, date(2026, 1, 15), "Enel Energia");
        let candidates = vec![movement("m1", 200, date(2026, 1, 18), "EE SPA ADDEBITO SDD")];

        let with_alias = Matcher::default().find_best_match(&doc, &candidates, &aliases);
        let without_alias =
            Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert!(with_alias.score > without_alias.score);
        assert_eq!(with_alias.decision, MatchDecision::Accept);
    }

    #[test]
    fn weak_name_evidence_lands_in_review_band() {
        // exact amount + close date but zero name evidence: 0.4 + 0.2 = 0.6
        let doc = invoice(300, date(2026, 1, 15), "Fornitore Srl");
        let candidates = vec![movement("m1", 300, date(2026, 1, 16), "BONIFICO DISPOSTO")];

        let result = Matcher::default().find_best_match(&doc, &candidates, &AliasTable::new());
        assert_eq!(result.decision, MatchDecision::Review);
        assert!(result.score < 0.85 && result.score >= 0.55);
    }

    #[test]
    fn token_overlap_scales_with_ratio() {
        let (full, _) = name_similarity("Rossi Costruzioni", "PAGAMENTO ROSSI COSTRUZIONI X", &AliasTable::new());
        let (partial, tier) = name_similarity("Rossi Costruzioni Generali", "BONIFICO ROSSI", &AliasTable::new());
        assert_eq!(full, 0.85); // substring containment
        assert_eq!(tier, "token-overlap");
        assert!(partial > 0.0 && partial < 0.3);
    }
}
