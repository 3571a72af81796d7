//! Per-gene running aggregate over a stream of variant records.

use super::record::{SignificanceCategory, VariantRecord};
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};

const TOP_CONSEQUENCES: usize = 5;
const TOP_CONDITIONS: usize = 10;
const MAX_VARIANT_TYPES: usize = 32;

/// Detail-list caps. Output size is bounded by these regardless of how
/// many records a gene has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorCaps {
    pub detail_cap: usize,
    pub condition_cap: usize,
}

impl Default for AccumulatorCaps {
    fn default() -> Self {
        Self {
            detail_cap: geneweave_core::constants::DEFAULT_CLINVAR_DETAIL_CAP,
            condition_cap: geneweave_core::constants::DEFAULT_CLINVAR_CONDITION_CAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneAccumulator {
    caps: AccumulatorCaps,
    total: u64,
    categories: [u64; 7],
    consequences: BTreeMap<&'static str, u64>,
    stars: [u64; 5],
    high_confidence_pathogenic: u64,
    conditions: HashMap<String, u64>,
    variant_types: BTreeMap<String, u64>,
    pathogenic_variants: Vec<JsonValue>,
    protein_positions: Vec<u32>,
    /// Most recent evaluation date seen, with the text it was parsed from.
    last_evaluated: Option<(Option<NaiveDate>, String)>,
}

impl GeneAccumulator {
    pub fn new(caps: AccumulatorCaps) -> Self {
        Self {
            caps,
            total: 0,
            categories: [0; 7],
            consequences: BTreeMap::new(),
            stars: [0; 5],
            high_confidence_pathogenic: 0,
            conditions: HashMap::new(),
            variant_types: BTreeMap::new(),
            pathogenic_variants: Vec::new(),
            protein_positions: Vec::new(),
            last_evaluated: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn pathogenic_detail_len(&self) -> usize {
        self.pathogenic_variants.len()
    }

    pub fn protein_position_len(&self) -> usize {
        self.protein_positions.len()
    }

    pub fn condition_len(&self) -> usize {
        self.conditions.len()
    }

    pub fn add(&mut self, record: &VariantRecord) {
        self.total += 1;

        let category = record.category();
        self.categories[category.index()] += 1;

        let consequence = record.consequence();
        *self.consequences.entry(consequence.as_str()).or_insert(0) += 1;

        let stars = record.review_stars();
        self.stars[usize::from(stars.min(4))] += 1;

        if !record.variant_type.is_empty() {
            let known = self.variant_types.contains_key(&record.variant_type);
            if known || self.variant_types.len() < MAX_VARIANT_TYPES {
                *self.variant_types.entry(record.variant_type.clone()).or_insert(0) += 1;
            }
        }

        for condition in &record.phenotypes {
            let condition = condition.trim();
            if condition.is_empty() || is_placeholder_condition(condition) {
                continue;
            }
            if let Some(count) = self.conditions.get_mut(condition) {
                *count += 1;
            } else if self.conditions.len() < self.caps.condition_cap {
                self.conditions.insert(condition.to_string(), 1);
            }
        }

        if let Some(evaluated) = record.last_evaluated.as_deref().filter(|s| !s.is_empty() && *s != "-") {
            let parsed = parse_evaluated_date(evaluated);
            let newer = match (&self.last_evaluated, parsed) {
                (None, _) => true,
                (Some((None, _)), Some(_)) => true,
                (Some((Some(current), _)), Some(date)) => date > *current,
                (Some(_), None) => false,
            };
            if newer {
                self.last_evaluated = Some((parsed, evaluated.to_string()));
            }
        }

        if category.is_pathogenic() {
            if stars >= 2 {
                self.high_confidence_pathogenic += 1;
            }
            if self.pathogenic_variants.len() < self.caps.detail_cap {
                self.pathogenic_variants.push(json!({
                    "variation_id": record.variation_id,
                    "name": record.name,
                    "significance": category.as_str(),
                    "review_stars": stars,
                    "consequence": consequence.as_str(),
                }));
            }
            if let Some(position) = record.protein_position() {
                if self.protein_positions.len() < self.caps.detail_cap {
                    self.protein_positions.push(position);
                }
            }
        }
    }

    fn count(&self, category: SignificanceCategory) -> u64 {
        self.categories[category.index()]
    }

    fn percentage(&self, count: u64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (count as f64 / self.total as f64 * 10_000.0).round() / 100.0
    }

    /// Summary payload. A pure function of the accumulated state.
    pub fn finalize(&self) -> JsonValue {
        use SignificanceCategory::*;

        let pathogenic = self.count(Pathogenic) + self.count(LikelyPathogenic);
        let benign = self.count(Benign) + self.count(LikelyBenign);

        let mut counts = serde_json::Map::new();
        for category in SignificanceCategory::ALL {
            counts.insert(category.as_str().to_string(), json!(self.count(category)));
        }

        let top_consequences: Vec<JsonValue> = top_n(self.consequences.iter().map(|(k, v)| (*k, *v)), TOP_CONSEQUENCES)
            .into_iter()
            .map(|(name, count)| json!({"consequence": name, "count": count}))
            .collect();
        let top_conditions: Vec<JsonValue> = top_n(self.conditions.iter().map(|(k, v)| (k.as_str(), *v)), TOP_CONDITIONS)
            .into_iter()
            .map(|(name, count)| json!({"condition": name, "count": count}))
            .collect();

        let max_stars = self.stars.iter().rposition(|n| *n > 0).unwrap_or(0);
        let mut positions = self.protein_positions.clone();
        positions.sort_unstable();

        json!({
            "source": "clinvar",
            "total_variants": self.total,
            "counts": counts,
            "pathogenic_count": pathogenic,
            "benign_count": benign,
            "vus_count": self.count(Uncertain),
            "conflicting_count": self.count(Conflicting),
            "pathogenic_percentage": self.percentage(pathogenic),
            "benign_percentage": self.percentage(benign),
            "vus_percentage": self.percentage(self.count(Uncertain)),
            "consequence_counts": self.consequences,
            "top_consequences": top_consequences,
            "review_stars": {
                "0": self.stars[0], "1": self.stars[1], "2": self.stars[2],
                "3": self.stars[3], "4": self.stars[4],
            },
            "max_review_stars": max_stars,
            "top_conditions": top_conditions,
            "variant_types": self.variant_types,
            "pathogenic_variants": self.pathogenic_variants,
            "protein_positions": positions,
            "last_evaluated": self.last_evaluated.as_ref().map(|(_, raw)| raw),
            "has_pathogenic": pathogenic > 0,
            "has_conflicting": self.count(Conflicting) > 0,
            "high_confidence": self.high_confidence_pathogenic > 0,
        })
    }
}

fn is_placeholder_condition(condition: &str) -> bool {
    matches!(
        condition.to_ascii_lowercase().as_str(),
        "not provided" | "not specified" | "-"
    )
}

/// Bulk rows use `Mar 01, 2015`; E-utilities summaries use `2015/03/01 00:00`.
fn parse_evaluated_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%b %d, %Y")
        .ok()
        .or_else(|| raw.get(..10).and_then(|day| NaiveDate::parse_from_str(day, "%Y/%m/%d").ok()))
}

/// Highest counts first, ties broken by name.
fn top_n<'a>(items: impl Iterator<Item = (&'a str, u64)>, n: usize) -> Vec<(&'a str, u64)> {
    let mut items: Vec<_> = items.collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    items.truncate(n);
    items
}
