//! # Patch Generator
//!
//! Turns a fixable [`FailurePattern`] into a versioned [`RulePatch`] that the
//! grading-rule evaluator can load and apply.
//!
//! ## Dispatch table
//! | Pattern | Patch | Target | Enhancement |
//! |---------|-------|--------|-------------|
//! | EXTRACTION | PROMPT | `extraction_prompt` | extraction guidance |
//! | NORMALIZATION | RULE | `normalization_rules` | rule variants |
//! | MATCHING | RULE | `matching_rules` | synonym groups |
//! | SCORING | RULE | `scoring_rules` | deduction rule fix |
//!
//! ## Versioning
//! A version is allocated only after a draft has been produced, so a pattern
//! that yields no patch never consumes a version. Allocation order equals
//! call order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::miner::{is_mechanical_scoring_error, FailurePattern, PatternType};
use super::version::{VersionError, VersionManager};
use crate::config::GeneratorConfig;
use crate::metrics;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by the patch generator.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The version manager could not allocate a version for the patch.
    #[error("version allocation failed: {0}")]
    Version(#[from] VersionError),
}

// ─── Patch model ──────────────────────────────────────────────────────────────

/// Whether a patch rewrites a prompt or a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchType {
    /// LLM prompt change.
    Prompt,
    /// Deterministic rule change.
    Rule,
}

/// The grading artefact a patch modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTarget {
    /// Answer extraction prompt.
    ExtractionPrompt,
    /// Answer normalization rules.
    NormalizationRules,
    /// Answer matching rules.
    MatchingRules,
    /// Score deduction rules.
    ScoringRules,
}

impl PatchTarget {
    /// Wire name of the target.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtractionPrompt => "extraction_prompt",
            Self::NormalizationRules => "normalization_rules",
            Self::MatchingRules => "matching_rules",
            Self::ScoringRules => "scoring_rules",
        }
    }
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical answer and the spellings that should match it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymGroup {
    /// Preferred form.
    pub canonical: String,
    /// Equivalent forms.
    pub synonyms: Vec<String>,
}

/// Strategy-specific payload of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Enhancement {
    /// Extra instructions for the extraction prompt.
    ExtractionGuidance {
        /// What the enhancement does.
        description: String,
        /// Question the guidance applies to, if known.
        question_id: Option<String>,
        /// Text appended to the prompt.
        guidance: String,
    },
    /// Additional accepted variants for a normalization rule.
    RuleVariants {
        /// What the enhancement does.
        description: String,
        /// Rule being extended.
        rule_name: String,
        /// Variants the rule should normalize.
        variants: Vec<String>,
    },
    /// Synonym groups for the matcher.
    SynonymGroups {
        /// What the enhancement does.
        description: String,
        /// Groups to register.
        groups: Vec<SynonymGroup>,
    },
    /// Correction to a mechanical deduction rule.
    DeductionRule {
        /// What the enhancement does.
        description: String,
        /// Question type or id the rule applies to.
        applies_to: Option<String>,
        /// The override justification that identified the error.
        evidence: String,
    },
}

/// Structured patch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchContent {
    /// Artefact being modified.
    pub patch_target: PatchTarget,
    /// Stage of the source pattern.
    pub pattern_type: PatternType,
    /// Strategy payload.
    pub enhancement: Enhancement,
}

/// An immutable, versioned candidate behaviour change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    /// Generated identifier.
    pub patch_id: String,
    /// Prompt or rule patch.
    pub patch_type: PatchType,
    /// Globally unique version, e.g. `v1.0.3`.
    pub version: String,
    /// Human-readable summary.
    pub description: String,
    /// Payload applied by the grading-rule evaluator.
    pub content: PatchContent,
    /// Pattern this patch was generated from.
    pub source_pattern_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// ─── Strategies ───────────────────────────────────────────────────────────────

/// A patch before a version has been assigned.
struct Draft {
    patch_type: PatchType,
    patch_target: PatchTarget,
    description: String,
    enhancement: Enhancement,
}

type Strategy = fn(&PatchGenerator, &FailurePattern) -> Option<Draft>;

fn strategy_for(pattern_type: PatternType) -> Strategy {
    match pattern_type {
        PatternType::Extraction => draft_extraction,
        PatternType::Normalization => draft_normalization,
        PatternType::Matching => draft_matching,
        PatternType::Scoring => draft_scoring,
    }
}

fn quoted_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'([^']+)'").ok()).as_ref()
}

fn quantity_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*([A-Za-z]+)\.?\s*$").ok())
        .as_ref()
}

/// First single-quoted name in `text`.
fn quoted_name(text: &str) -> Option<String> {
    quoted_name_regex()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

const UNIT_ALIASES: &[&[&str]] = &[
    &["km", "kilometre", "kilometer", "kilometres", "kilometers"],
    &["m", "metre", "meter", "metres", "meters"],
    &["cm", "centimetre", "centimeter", "centimetres", "centimeters"],
    &["mm", "millimetre", "millimeter", "millimetres", "millimeters"],
    &["kg", "kilogram", "kilograms", "kgs"],
    &["g", "gram", "grams"],
    &["s", "sec", "secs", "second", "seconds"],
    &["min", "mins", "minute", "minutes"],
    &["h", "hr", "hrs", "hour", "hours"],
    &["l", "litre", "liter", "litres", "liters"],
    &["ml", "millilitre", "milliliter", "millilitres", "milliliters"],
];

/// Unit spellings equivalent to `variant` (`"5 km"` → `"5 kilometre"`, …).
fn unit_expansions(variant: &str) -> Vec<String> {
    let Some(caps) = quantity_regex().and_then(|re| re.captures(variant)) else {
        return Vec::new();
    };
    let (Some(number), Some(unit)) = (caps.get(1), caps.get(2)) else {
        return Vec::new();
    };
    let unit = unit.as_str().to_lowercase();
    UNIT_ALIASES
        .iter()
        .find(|aliases| aliases.contains(&unit.as_str()))
        .map(|aliases| {
            aliases
                .iter()
                .flat_map(|a| [format!("{}{a}", number.as_str()), format!("{} {a}", number.as_str())])
                .collect()
        })
        .unwrap_or_default()
}

fn draft_extraction(_: &PatchGenerator, pattern: &FailurePattern) -> Option<Draft> {
    let question_id = pattern.cluster_key().map(str::to_string);
    let scope = question_id
        .as_deref()
        .map_or_else(|| "this question".to_string(), |q| format!("question '{q}'"));
    Some(Draft {
        patch_type: PatchType::Prompt,
        patch_target: PatchTarget::ExtractionPrompt,
        description: format!("Improve answer extraction for {scope}"),
        enhancement: Enhancement::ExtractionGuidance {
            description: pattern.description.clone(),
            question_id,
            guidance: "Transcribe every mark in the answer region, including partial, crossed-out \
                       or faint text. Return an empty answer only when the region is blank."
                .to_string(),
        },
    })
}

fn draft_normalization(_: &PatchGenerator, pattern: &FailurePattern) -> Option<Draft> {
    let rule_name = quoted_name(&pattern.description)
        .or_else(|| pattern.cluster_key().map(str::to_string))?;

    let mut variants: BTreeSet<String> = pattern.observed_variants.iter().cloned().collect();
    if rule_name.to_lowercase().contains("unit") {
        for v in &pattern.observed_variants {
            variants.extend(unit_expansions(v));
        }
    }

    Some(Draft {
        patch_type: PatchType::Rule,
        patch_target: PatchTarget::NormalizationRules,
        description: format!("Extend normalization rule '{rule_name}'"),
        enhancement: Enhancement::RuleVariants {
            description: pattern.description.clone(),
            rule_name,
            variants: variants.into_iter().collect(),
        },
    })
}

fn draft_matching(_: &PatchGenerator, pattern: &FailurePattern) -> Option<Draft> {
    let (canonical, rest) = pattern.observed_variants.split_first()?;
    if rest.is_empty() {
        return None;
    }
    Some(Draft {
        patch_type: PatchType::Rule,
        patch_target: PatchTarget::MatchingRules,
        description: format!("Accept {} synonyms of '{canonical}'", rest.len()),
        enhancement: Enhancement::SynonymGroups {
            description: pattern.description.clone(),
            groups: vec![SynonymGroup {
                canonical: canonical.clone(),
                synonyms: rest.to_vec(),
            }],
        },
    })
}

fn draft_scoring(generator: &PatchGenerator, pattern: &FailurePattern) -> Option<Draft> {
    if !is_mechanical_scoring_error(&pattern.description, &generator.config.scoring_fix_keywords) {
        return None;
    }
    let applies_to = pattern.cluster_key().map(str::to_string);
    Some(Draft {
        patch_type: PatchType::Rule,
        patch_target: PatchTarget::ScoringRules,
        description: format!(
            "Correct deduction rule for {}",
            applies_to.as_deref().unwrap_or("affected questions")
        ),
        enhancement: Enhancement::DeductionRule {
            description: pattern.description.clone(),
            applies_to,
            evidence: pattern
                .suggested_fix
                .clone()
                .unwrap_or_else(|| pattern.description.clone()),
        },
    })
}

// ─── Generator ────────────────────────────────────────────────────────────────

/// Synthesises rule patches from failure patterns.
#[derive(Debug, Clone)]
pub struct PatchGenerator {
    config: GeneratorConfig,
    versions: VersionManager,
}

impl PatchGenerator {
    /// Create a generator that draws versions from `versions`.
    pub fn new(config: GeneratorConfig, versions: VersionManager) -> Self {
        Self { config, versions }
    }

    /// Generate a patch for `pattern`.
    ///
    /// Returns `Ok(None)` when the pattern is not fixable, or when no
    /// strategy can derive a concrete change (for SCORING, when the
    /// description does not name a mechanical deduction error).
    ///
    /// # Errors
    ///
    /// [`GeneratorError::Version`] if version allocation fails.
    pub fn generate_patch(&self, pattern: &FailurePattern) -> Result<Option<RulePatch>, GeneratorError> {
        if !pattern.is_fixable {
            debug!(pattern_id = %pattern.pattern_id, "pattern not fixable; no patch");
            return Ok(None);
        }

        let Some(draft) = strategy_for(pattern.pattern_type)(self, pattern) else {
            debug!(
                pattern_id = %pattern.pattern_id,
                pattern_type = %pattern.pattern_type,
                "no patch derivable from pattern"
            );
            return Ok(None);
        };

        let version = self.versions.allocate_version()?;
        let patch = RulePatch {
            patch_id: Uuid::new_v4().to_string(),
            patch_type: draft.patch_type,
            version,
            description: draft.description,
            content: PatchContent {
                patch_target: draft.patch_target,
                pattern_type: pattern.pattern_type,
                enhancement: draft.enhancement,
            },
            source_pattern_id: pattern.pattern_id.clone(),
            created_at: Utc::now(),
        };

        metrics::inc_patch_generated(patch.content.patch_target.as_str());
        info!(
            patch_id = %patch.patch_id,
            version = %patch.version,
            target = %patch.content.patch_target,
            source_pattern_id = %patch.source_pattern_id,
            "rule patch generated"
        );
        Ok(Some(patch))
    }

    /// Generate patches for every pattern in order, skipping unfixable ones.
    ///
    /// # Errors
    ///
    /// Stops at the first version allocation failure.
    pub fn generate_patches(&self, patterns: &[FailurePattern]) -> Result<Vec<RulePatch>, GeneratorError> {
        let mut patches = Vec::new();
        for pattern in patterns {
            if let Some(patch) = self.generate_patch(pattern)? {
                patches.push(patch);
            }
        }
        Ok(patches)
    }
}
