//! # Pattern Miner
//!
//! Clusters teacher overrides into failure patterns using structured signals
//! from the grading trace rather than free-text similarity.
//!
//! ## Cluster keys
//! | Stage | Trigger | Key |
//! |-------|---------|-----|
//! | EXTRACTION | empty/near-empty answer with low extraction confidence | `question_id` |
//! | NORMALIZATION | match failed after normalization ran | last applied rule |
//! | MATCHING | match failed with no normalization context | failure-reason bucket |
//! | SCORING | override changed the score, no upstream anomaly | question type (or id) |
//!
//! A cluster becomes a [`FailurePattern`] once it reaches `min_frequency`
//! members and its homogeneity reaches `min_confidence`.
//!
//! Mining is advisory and pure: empty or unclassifiable input yields an empty
//! result, never an error.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{GeneratorConfig, MinerConfig};
use crate::metrics;

/// Weight of override-direction agreement in cluster confidence; the rest
/// comes from the stage-specific signal.
const DIRECTION_WEIGHT: f64 = 0.7;

fn full_confidence() -> f64 {
    1.0
}

// ─── Override log ─────────────────────────────────────────────────────────────

/// One teacher correction of an automated grading decision.
///
/// Owned by the logging subsystem; the miner only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideLog {
    /// Unique id of this log entry.
    pub log_id: String,
    /// The graded question.
    pub question_id: String,
    /// Question category (e.g. `short_answer`), when known.
    #[serde(default)]
    pub question_type: Option<String>,
    /// Answer text the extraction stage produced.
    #[serde(default)]
    pub extracted_answer: Option<String>,
    /// Extraction confidence (0.0–1.0).
    #[serde(default = "full_confidence")]
    pub extraction_confidence: f64,
    /// Answer after normalization.
    #[serde(default)]
    pub normalized_answer: Option<String>,
    /// Normalization rules that ran, in order.
    #[serde(default)]
    pub normalization_rules_applied: Vec<String>,
    /// Whether the normalized answer matched the key; `None` if matching never ran.
    #[serde(default)]
    pub match_result: Option<bool>,
    /// Matcher's explanation when `match_result` is false.
    #[serde(default)]
    pub match_failure_reason: Option<String>,
    /// Automated score.
    pub score: f64,
    /// Automated grading confidence (0.0–1.0).
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    /// Whether a teacher overrode the score. Only overridden logs are mined.
    pub was_overridden: bool,
    /// Score the teacher assigned.
    #[serde(default)]
    pub override_score: Option<f64>,
    /// Teacher's free-text justification.
    #[serde(default)]
    pub override_reason: Option<String>,
    /// When the automated grade was recorded.
    pub created_at: DateTime<Utc>,
    /// When the teacher overrode it.
    #[serde(default)]
    pub overridden_at: Option<DateTime<Utc>>,
}

impl OverrideLog {
    /// The answer text the matcher actually saw, if any.
    fn answer_variant(&self) -> Option<&str> {
        self.normalized_answer
            .as_deref()
            .or(self.extracted_answer.as_deref())
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    fn direction(&self) -> Direction {
        match self.override_score {
            None => Direction::Unknown,
            Some(o) if (o - self.score).abs() <= f64::EPSILON => Direction::Unchanged,
            Some(o) if o > self.score => Direction::Raised,
            Some(_) => Direction::Lowered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Direction {
    Raised,
    Lowered,
    Unchanged,
    Unknown,
}

// ─── Failure pattern ──────────────────────────────────────────────────────────

/// Grading stage at which a cluster of overrides originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    /// The answer was never extracted.
    Extraction,
    /// A normalization rule produced a form that failed to match.
    Normalization,
    /// The matcher rejected an answer without normalization involvement.
    Matching,
    /// The score itself was wrong.
    Scoring,
}

impl PatternType {
    /// Lowercase label used in signatures and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Normalization => "normalization",
            Self::Matching => "matching",
            Self::Scoring => "scoring",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring category of correction, ready for the patch generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    /// Generated identifier.
    pub pattern_id: String,
    /// Stage the pattern belongs to.
    pub pattern_type: PatternType,
    /// Human-readable summary; may embed a single-quoted rule name.
    pub description: String,
    /// Number of contributing override logs.
    pub frequency: usize,
    /// Cluster homogeneity (0.0–1.0).
    pub confidence: f64,
    /// Whether an automated patch can plausibly address this pattern.
    pub is_fixable: bool,
    /// Stable identifier such as `normalization_unit_conversion`.
    pub error_signature: Option<String>,
    /// Distinct question types among the contributing logs.
    pub affected_question_types: Vec<String>,
    /// Free-text fix suggestion.
    pub suggested_fix: Option<String>,
    /// Bounded sample of contributing log ids.
    pub sample_log_ids: Vec<String>,
    /// Distinct answer variants seen in the cluster, most frequent first.
    pub observed_variants: Vec<String>,
    /// When the pattern was mined.
    pub created_at: DateTime<Utc>,
}

impl FailurePattern {
    /// The cluster key embedded in the error signature, e.g. the question id
    /// for EXTRACTION patterns.
    pub fn cluster_key(&self) -> Option<&str> {
        let prefix = format!("{}_", self.pattern_type.as_str());
        self.error_signature
            .as_deref()
            .and_then(|s| s.strip_prefix(prefix.as_str()))
    }
}

/// Aggregate report for review dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningSummary {
    /// Overridden logs in the analysed batch.
    pub total_overrides: usize,
    /// Patterns emitted.
    pub total_patterns: usize,
    /// Patterns with `is_fixable = true`.
    pub fixable_patterns: usize,
    /// Pattern count per stage.
    pub patterns_by_type: BTreeMap<PatternType, usize>,
    /// When the summary was produced.
    pub analysis_time: DateTime<Utc>,
}

// ─── Miner ────────────────────────────────────────────────────────────────────

/// Stateless override clusterer.
#[derive(Debug, Clone)]
pub struct PatternMiner {
    config: MinerConfig,
    scoring_fix_keywords: Vec<String>,
}

impl Default for PatternMiner {
    fn default() -> Self {
        Self::new(MinerConfig::default())
    }
}

impl PatternMiner {
    /// Create a miner with the default mechanical-scoring keywords.
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            scoring_fix_keywords: GeneratorConfig::default().scoring_fix_keywords,
        }
    }

    /// Override the keywords that mark a SCORING pattern as mechanically fixable.
    pub fn with_scoring_keywords(mut self, keywords: Vec<String>) -> Self {
        self.scoring_fix_keywords = keywords;
        self
    }

    /// Cluster `logs` into failure patterns, most frequent first.
    pub fn analyze_overrides(&self, logs: &[OverrideLog]) -> Vec<FailurePattern> {
        let mut clusters: BTreeMap<(PatternType, String), Vec<&OverrideLog>> = BTreeMap::new();
        for log in logs {
            if let Some(key) = self.classify(log) {
                clusters.entry(key).or_default().push(log);
            }
        }

        let mut patterns: Vec<FailurePattern> = clusters
            .into_iter()
            .filter_map(|((pattern_type, key), members)| {
                self.build_pattern(pattern_type, &key, &members)
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.error_signature.cmp(&b.error_signature))
        });

        for p in &patterns {
            metrics::inc_patterns_mined(p.pattern_type.as_str());
        }
        info!(
            logs = logs.len(),
            patterns = patterns.len(),
            fixable = patterns.iter().filter(|p| p.is_fixable).count(),
            "override analysis complete"
        );
        patterns
    }

    /// Mine only logs created in `[since, until)`.
    pub fn analyze_window(
        &self,
        logs: &[OverrideLog],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<FailurePattern> {
        let in_window: Vec<OverrideLog> = logs
            .iter()
            .filter(|l| l.created_at >= since && l.created_at < until)
            .cloned()
            .collect();
        self.analyze_overrides(&in_window)
    }

    /// Summarise a batch and the patterns mined from it.
    pub fn generate_summary(&self, logs: &[OverrideLog], patterns: &[FailurePattern]) -> MiningSummary {
        let mut patterns_by_type = BTreeMap::new();
        for p in patterns {
            *patterns_by_type.entry(p.pattern_type).or_insert(0) += 1;
        }
        MiningSummary {
            total_overrides: logs.iter().filter(|l| l.was_overridden).count(),
            total_patterns: patterns.len(),
            fixable_patterns: patterns.iter().filter(|p| p.is_fixable).count(),
            patterns_by_type,
            analysis_time: Utc::now(),
        }
    }

    /// Decide which cluster, if any, a log belongs to.
    fn classify(&self, log: &OverrideLog) -> Option<(PatternType, String)> {
        if !log.was_overridden {
            return None;
        }

        let answer_chars = log
            .extracted_answer
            .as_deref()
            .map(|a| a.chars().filter(|c| !c.is_whitespace()).count())
            .unwrap_or(0);
        if answer_chars <= self.config.near_empty_max_chars
            && log.extraction_confidence < self.config.low_extraction_confidence
        {
            return Some((PatternType::Extraction, log.question_id.clone()));
        }

        if log.match_result == Some(false) {
            let rule = log
                .normalization_rules_applied
                .iter()
                .rev()
                .find(|r| !r.trim().is_empty());
            return Some(match rule {
                Some(rule) => (PatternType::Normalization, rule.trim().to_string()),
                None => (
                    PatternType::Matching,
                    reason_bucket(log.match_failure_reason.as_deref()),
                ),
            });
        }

        if matches!(log.direction(), Direction::Raised | Direction::Lowered) {
            let key = log
                .question_type
                .clone()
                .unwrap_or_else(|| log.question_id.clone());
            return Some((PatternType::Scoring, key));
        }

        None
    }

    fn build_pattern(
        &self,
        pattern_type: PatternType,
        key: &str,
        members: &[&OverrideLog],
    ) -> Option<FailurePattern> {
        let frequency = members.len();
        if frequency < self.config.min_frequency {
            debug!(%pattern_type, key, frequency, "cluster below min_frequency");
            return None;
        }

        let confidence = cluster_confidence(pattern_type, members);
        if confidence < self.config.min_confidence {
            debug!(%pattern_type, key, confidence, "cluster below min_confidence");
            return None;
        }

        let observed_variants = self.variants(members);
        let description = describe(pattern_type, key, members);
        let is_fixable = match pattern_type {
            PatternType::Extraction | PatternType::Normalization => true,
            PatternType::Matching => observed_variants.len() >= 2,
            PatternType::Scoring => {
                is_mechanical_scoring_error(&description, &self.scoring_fix_keywords)
            }
        };
        let suggested_fix = suggest_fix(pattern_type, key, is_fixable);

        let affected_question_types: BTreeSet<String> = members
            .iter()
            .filter_map(|l| l.question_type.clone())
            .collect();

        Some(FailurePattern {
            pattern_id: Uuid::new_v4().to_string(),
            pattern_type,
            description,
            frequency,
            confidence,
            is_fixable,
            error_signature: Some(format!("{}_{}", pattern_type.as_str(), key)),
            affected_question_types: affected_question_types.into_iter().collect(),
            suggested_fix,
            sample_log_ids: members
                .iter()
                .take(self.config.max_sample_logs)
                .map(|l| l.log_id.clone())
                .collect(),
            observed_variants,
            created_at: Utc::now(),
        })
    }

    fn variants(&self, members: &[&OverrideLog]) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for v in members.iter().filter_map(|l| l.answer_variant()) {
            *counts.entry(v).or_insert(0) += 1;
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.config.max_variants)
            .map(|(v, _)| v.to_string())
            .collect()
    }
}

/// Whether `description` names a mechanical deduction-rule error.
///
/// Subjective scoring disagreements never match.
pub fn is_mechanical_scoring_error(description: &str, keywords: &[String]) -> bool {
    let lower = description.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.trim().is_empty() && lower.contains(&k.to_lowercase()))
}

/// First three alphabetic words of a match failure reason.
fn reason_bucket(reason: Option<&str>) -> String {
    let words: Vec<String> = reason
        .unwrap_or_default()
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .take(3)
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        "unspecified".to_string()
    } else {
        words.join("_")
    }
}

/// Most common item and its count; ties go to the smallest item.
fn dominant<K: Ord>(items: impl IntoIterator<Item = K>) -> Option<(K, usize)> {
    let mut counts: BTreeMap<K, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    let mut best: Option<(K, usize)> = None;
    for (k, n) in counts {
        if best.as_ref().map_or(true, |(_, m)| n > *m) {
            best = Some((k, n));
        }
    }
    best
}

fn share<K: Ord>(items: impl IntoIterator<Item = K>, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    dominant(items).map_or(0.0, |(_, n)| n as f64 / total as f64)
}

fn cluster_confidence(pattern_type: PatternType, members: &[&OverrideLog]) -> f64 {
    let n = members.len();
    if n == 0 {
        return 0.0;
    }
    let direction = share(members.iter().map(|l| l.direction()), n);
    let signal = match pattern_type {
        PatternType::Extraction => {
            members
                .iter()
                .map(|l| 1.0 - l.extraction_confidence.clamp(0.0, 1.0))
                .sum::<f64>()
                / n as f64
        }
        PatternType::Normalization => share(
            members.iter().map(|l| l.normalization_rules_applied.join(">")),
            n,
        ),
        PatternType::Matching => share(
            members.iter().map(|l| {
                l.match_failure_reason
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase()
            }),
            n,
        ),
        PatternType::Scoring => share(
            members.iter().map(|l| {
                l.override_score
                    .map(|o| ((o - l.score) * 2.0).round() as i64)
                    .unwrap_or(i64::MIN)
            }),
            n,
        ),
    };
    (DIRECTION_WEIGHT * direction + (1.0 - DIRECTION_WEIGHT) * signal).clamp(0.0, 1.0)
}

fn dominant_reason(members: &[&OverrideLog], pick: impl Fn(&OverrideLog) -> Option<&str>) -> String {
    dominant(
        members
            .iter()
            .filter_map(|l| pick(*l))
            .map(str::trim)
            .filter(|r| !r.is_empty()),
    )
    .map(|(r, _)| r.to_string())
    .unwrap_or_else(|| "no reason given".to_string())
}

fn describe(pattern_type: PatternType, key: &str, members: &[&OverrideLog]) -> String {
    let n = members.len();
    match pattern_type {
        PatternType::Extraction => {
            let mean = members.iter().map(|l| l.extraction_confidence).sum::<f64>() / n as f64;
            format!(
                "Extraction failed for question '{key}': {n} empty or near-empty answers \
                 (mean extraction confidence {mean:.2})"
            )
        }
        PatternType::Normalization => format!(
            "Normalization rule '{key}' ran but {n} answers still failed to match"
        ),
        PatternType::Matching => {
            let reason = dominant_reason(members, |l| l.match_failure_reason.as_deref());
            format!("Matching failed for {n} answers ({key}): {reason}")
        }
        PatternType::Scoring => {
            let reason = dominant_reason(members, |l| l.override_reason.as_deref());
            format!("Scoring override on '{key}' ({n} overrides): {reason}")
        }
    }
}

fn suggest_fix(pattern_type: PatternType, key: &str, is_fixable: bool) -> Option<String> {
    match pattern_type {
        PatternType::Extraction => Some(format!(
            "Tighten the extraction prompt for question '{key}' so sparse responses are \
             transcribed instead of dropped"
        )),
        PatternType::Normalization => Some(format!(
            "Extend rule '{key}' with variants so equivalent answers normalize identically"
        )),
        PatternType::Matching if is_fixable => {
            Some("Register the observed answer variants as synonyms".to_string())
        }
        PatternType::Scoring if is_fixable => {
            Some(format!("Correct the deduction rule applied to '{key}'"))
        }
        PatternType::Matching | PatternType::Scoring => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_log(id: &str) -> OverrideLog {
        OverrideLog {
            log_id: id.to_string(),
            question_id: "q1".to_string(),
            question_type: Some("short_answer".to_string()),
            extracted_answer: Some("some answer".to_string()),
            extraction_confidence: 0.95,
            normalized_answer: None,
            normalization_rules_applied: Vec::new(),
            match_result: Some(true),
            match_failure_reason: None,
            score: 0.0,
            confidence: 0.9,
            was_overridden: true,
            override_score: Some(5.0),
            override_reason: None,
            created_at: Utc::now(),
            overridden_at: None,
        }
    }

    fn extraction_log(id: &str) -> OverrideLog {
        OverrideLog {
            extracted_answer: Some(String::new()),
            extraction_confidence: 0.3,
            match_result: None,
            ..base_log(id)
        }
    }

    fn normalization_log(id: &str, answer: &str) -> OverrideLog {
        OverrideLog {
            normalized_answer: Some(answer.to_string()),
            normalization_rules_applied: vec!["trim".to_string(), "unit_conversion".to_string()],
            match_result: Some(false),
            match_failure_reason: Some("value mismatch".to_string()),
            ..base_log(id)
        }
    }

    fn matching_log(id: &str, answer: &str) -> OverrideLog {
        OverrideLog {
            normalized_answer: Some(answer.to_string()),
            match_result: Some(false),
            match_failure_reason: Some("synonym not recognised".to_string()),
            ..base_log(id)
        }
    }

    fn scoring_log(id: &str, reason: &str, score: f64, override_score: f64) -> OverrideLog {
        OverrideLog {
            question_type: Some("essay".to_string()),
            score,
            override_score: Some(override_score),
            override_reason: Some(reason.to_string()),
            ..base_log(id)
        }
    }

    fn miner() -> PatternMiner {
        PatternMiner::default()
    }

    // ── Extraction ───────────────────────────────────────────────────────

    #[test]
    fn test_extraction_cluster_by_question() {
        let logs: Vec<_> = (0..10).map(|i| extraction_log(&format!("l{i}"))).collect();
        let patterns = miner().analyze_overrides(&logs);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_type, PatternType::Extraction);
        assert_eq!(p.frequency, 10);
        assert!(p.is_fixable);
        assert!(p.confidence >= 0.7, "confidence {}", p.confidence);
        assert_eq!(p.error_signature.as_deref(), Some("extraction_q1"));
        assert_eq!(p.cluster_key(), Some("q1"));
        assert_eq!(p.sample_log_ids.len(), 5);
    }

    #[test]
    fn test_confident_extraction_is_not_an_extraction_failure() {
        let logs: Vec<_> = (0..3)
            .map(|i| OverrideLog {
                extraction_confidence: 0.9,
                ..extraction_log(&format!("l{i}"))
            })
            .collect();
        let patterns = miner().analyze_overrides(&logs);
        assert!(patterns.iter().all(|p| p.pattern_type != PatternType::Extraction));
    }

    // ── Normalization ────────────────────────────────────────────────────

    #[test]
    fn test_normalization_keyed_by_last_rule() {
        let logs = vec![
            normalization_log("a", "5 km"),
            normalization_log("b", "5000 m"),
            normalization_log("c", "5 km"),
        ];
        let patterns = miner().analyze_overrides(&logs);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_type, PatternType::Normalization);
        assert!(p.description.contains("'unit_conversion'"));
        assert_eq!(p.error_signature.as_deref(), Some("normalization_unit_conversion"));
        assert_eq!(p.observed_variants, vec!["5 km", "5000 m"]);
        assert!(p.is_fixable);
    }

    // ── Matching ─────────────────────────────────────────────────────────

    #[test]
    fn test_matching_fixable_with_variants() {
        let logs = vec![
            matching_log("a", "photo synthesis"),
            matching_log("b", "photosynth"),
            matching_log("c", "photo synthesis"),
        ];
        let patterns = miner().analyze_overrides(&logs);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_type, PatternType::Matching);
        assert_eq!(p.error_signature.as_deref(), Some("matching_synonym_not_recognised"));
        assert!(p.is_fixable);
        assert!(p.suggested_fix.is_some());
    }

    #[test]
    fn test_matching_single_variant_not_fixable() {
        let logs = vec![matching_log("a", "mitosis"), matching_log("b", "mitosis")];
        let patterns = miner().analyze_overrides(&logs);
        assert_eq!(patterns.len(), 1);
        assert!(!patterns[0].is_fixable);
        assert!(patterns[0].suggested_fix.is_none());
    }

    #[test]
    fn test_reason_bucket() {
        assert_eq!(reason_bucket(Some("Synonym NOT recognised: 'x'")), "synonym_not_recognised");
        assert_eq!(reason_bucket(Some("42!")), "unspecified");
        assert_eq!(reason_bucket(None), "unspecified");
    }

    // ── Scoring ──────────────────────────────────────────────────────────

    #[test]
    fn test_scoring_fixable_only_for_deduction_rules() {
        let mechanical = vec![
            scoring_log("a", "Fixed deduction of 2 points applied twice", 3.0, 5.0),
            scoring_log("b", "Fixed deduction of 2 points applied twice", 3.0, 5.0),
        ];
        let patterns = miner().analyze_overrides(&mechanical);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::Scoring);
        assert!(patterns[0].is_fixable);

        let subjective = vec![
            scoring_log("c", "argument deserves more credit", 3.0, 5.0),
            scoring_log("d", "argument deserves more credit", 3.0, 5.0),
        ];
        let patterns = miner().analyze_overrides(&subjective);
        assert_eq!(patterns.len(), 1);
        assert!(!patterns[0].is_fixable);
    }

    #[test]
    fn test_unchanged_override_is_ignored() {
        let logs = vec![
            scoring_log("a", "looks fine", 4.0, 4.0),
            scoring_log("b", "looks fine", 4.0, 4.0),
        ];
        assert!(miner().analyze_overrides(&logs).is_empty());
    }

    // ── Thresholds and ordering ──────────────────────────────────────────

    #[test]
    fn test_empty_input_yields_empty_output() {
        assert!(miner().analyze_overrides(&[]).is_empty());
    }

    #[test]
    fn test_non_overridden_logs_ignored() {
        let logs: Vec<_> = (0..4)
            .map(|i| OverrideLog {
                was_overridden: false,
                ..extraction_log(&format!("l{i}"))
            })
            .collect();
        assert!(miner().analyze_overrides(&logs).is_empty());
    }

    #[test]
    fn test_min_frequency_filters_singletons() {
        let logs = vec![extraction_log("only")];
        assert!(miner().analyze_overrides(&logs).is_empty());
    }

    #[test]
    fn test_mixed_directions_fail_confidence() {
        let logs = vec![
            scoring_log("a", "fixed deduction misapplied", 3.0, 5.0),
            scoring_log("b", "fixed deduction misapplied", 5.0, 3.0),
        ];
        assert!(miner().analyze_overrides(&logs).is_empty());
    }

    #[test]
    fn test_patterns_sorted_by_frequency() {
        let mut logs: Vec<_> = (0..2).map(|i| extraction_log(&format!("e{i}"))).collect();
        logs.extend((0..4).map(|i| normalization_log(&format!("n{i}"), "5 km")));
        let patterns = miner().analyze_overrides(&logs);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].pattern_type, PatternType::Normalization);
        assert_eq!(patterns[1].pattern_type, PatternType::Extraction);
    }

    #[test]
    fn test_analyze_window_filters_by_created_at() {
        let now = Utc::now();
        let mut old: Vec<_> = (0..3)
            .map(|i| OverrideLog {
                created_at: now - Duration::days(10),
                ..extraction_log(&format!("old{i}"))
            })
            .collect();
        let fresh: Vec<_> = (0..1).map(|i| extraction_log(&format!("new{i}"))).collect();
        old.extend(fresh);

        let patterns = miner().analyze_window(&old, now - Duration::days(1), now + Duration::days(1));
        assert!(patterns.is_empty(), "one fresh log is below min_frequency");

        let patterns = miner().analyze_window(&old, now - Duration::days(30), now + Duration::days(1));
        assert_eq!(patterns[0].frequency, 4);
    }

    #[test]
    fn test_generate_summary_counts() {
        let mut logs: Vec<_> = (0..3).map(|i| extraction_log(&format!("e{i}"))).collect();
        logs.push(matching_log("m0", "x"));
        logs.push(matching_log("m1", "x"));
        logs.push(OverrideLog {
            was_overridden: false,
            ..base_log("skip")
        });
        let m = miner();
        let patterns = m.analyze_overrides(&logs);
        let summary = m.generate_summary(&logs, &patterns);
        assert_eq!(summary.total_overrides, 5);
        assert_eq!(summary.total_patterns, 2);
        assert_eq!(summary.fixable_patterns, 1);
        assert_eq!(summary.patterns_by_type.get(&PatternType::Matching), Some(&1));
    }

    #[test]
    fn test_pattern_type_serializes_uppercase() {
        let json = serde_json::to_string(&PatternType::Normalization).unwrap();
        assert_eq!(json, "\"NORMALIZATION\"");
    }
}
