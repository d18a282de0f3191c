use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use permit_core::{PermitRecord, ScoreBreakdown, ScoredRecord};
use serde::Deserialize;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Weights {
    pub size: f64,
    pub location: f64,
    pub urgency: f64,
    pub permit_type: f64,
}

impl Weights {
    fn total(&self) -> f64 {
        self.size + self.location + self.urgency + self.permit_type
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SizeBand {
    pub below: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SizeRules {
    pub unknown: f64,
    /// Ascending `below` thresholds; the first band the valuation falls under wins.
    pub bands: Vec<SizeBand>,
    pub top: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JurisdictionBonus {
    pub name: String,
    pub bonus: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationRules {
    pub base: f64,
    pub premium: f64,
    #[serde(default)]
    pub premium_areas: Vec<String>,
    #[serde(default)]
    pub jurisdiction_bonus: Vec<JurisdictionBonus>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeTier {
    pub name: String,
    pub score: f64,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeRules {
    pub fallback: f64,
    /// Checked in order; the first tier with a matching keyword wins.
    pub tiers: Vec<TypeTier>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UrgencyRules {
    pub min_text_chars: usize,
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

/// Contents of `rules/scoring.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringRules {
    pub weights: Weights,
    pub size: SizeRules,
    pub location: LocationRules,
    pub permit_type: TypeRules,
    pub urgency: UrgencyRules,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            weights: Weights {
                size: 0.35,
                location: 0.25,
                urgency: 0.20,
                permit_type: 0.20,
            },
            size: SizeRules {
                unknown: 30.0,
                bands: [(10_000.0, 20.0), (50_000.0, 40.0), (100_000.0, 60.0), (250_000.0, 80.0)]
                    .into_iter()
                    .map(|(below, score)| SizeBand { below, score })
                    .collect(),
                top: 100.0,
            },
            location: LocationRules {
                base: 50.0,
                premium: 85.0,
                premium_areas: words(&[
                    "downtown",
                    "green hills",
                    "brentwood",
                    "franklin",
                    "murfreesboro",
                    "gallatin",
                    "hendersonville",
                ]),
                jurisdiction_bonus: vec![
                    JurisdictionBonus {
                        name: "williamson".into(),
                        bonus: 15.0,
                    },
                    JurisdictionBonus {
                        name: "davidson".into(),
                        bonus: 10.0,
                    },
                ],
            },
            permit_type: TypeRules {
                fallback: 50.0,
                tiers: vec![
                    TypeTier {
                        name: "high".into(),
                        score: 90.0,
                        keywords: words(&[
                            "new construction",
                            "commercial",
                            "addition",
                            "renovation",
                            "remodel",
                            "multi-family",
                            "retail",
                            "restaurant",
                        ]),
                    },
                    TypeTier {
                        name: "medium".into(),
                        score: 60.0,
                        keywords: words(&["repair", "alteration", "replacement", "install"]),
                    },
                    TypeTier {
                        name: "low".into(),
                        score: 30.0,
                        keywords: words(&["fence", "sign", "demolition", "pool"]),
                    },
                ],
            },
            urgency: UrgencyRules {
                min_text_chars: 10,
                positive: words(&[
                    "new",
                    "construct",
                    "construction",
                    "build",
                    "expansion",
                    "addition",
                    "luxury",
                    "custom",
                    "premium",
                    "upscale",
                    "major",
                    "complete",
                    "restaurant",
                    "retail",
                    "mixed use",
                    "multi-family",
                    "suite",
                ]),
                negative: words(&[
                    "demolish",
                    "demolition",
                    "repair",
                    "damage",
                    "fire",
                    "minor",
                    "temporary",
                    "removal",
                    "remove",
                    "patch",
                    "sign",
                    "fence",
                ]),
            },
        }
    }
}

impl ScoringRules {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_str(text).context("parsing rules/scoring.yaml")?;
        rules.validate()?;
        Ok(rules)
    }

    /// Loads `rules/scoring.yaml` under `root`, or the built-in rules when the
    /// file does not exist.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("scoring.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let total = self.weights.total();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            bail!("scoring weights must sum to 1.0, got {total}");
        }
        let weights = [
            self.weights.size,
            self.weights.location,
            self.weights.urgency,
            self.weights.permit_type,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("scoring weights must be non-negative");
        }
        if self
            .size
            .bands
            .windows(2)
            .any(|pair| pair[0].below >= pair[1].below)
        {
            bail!("size bands must be listed in ascending order");
        }

        let mut scores = vec![
            ("size.unknown".to_string(), self.size.unknown),
            ("size.top".to_string(), self.size.top),
            ("location.base".to_string(), self.location.base),
            ("location.premium".to_string(), self.location.premium),
            ("permit_type.fallback".to_string(), self.permit_type.fallback),
        ];
        scores.extend(self.size.bands.iter().map(|band| {
            (format!("size band below {}", band.below), band.score)
        }));
        scores.extend(self.location.jurisdiction_bonus.iter().map(|bonus| {
            (format!("jurisdiction bonus {}", bonus.name), bonus.bonus)
        }));
        scores.extend(
            self.permit_type
                .tiers
                .iter()
                .map(|tier| (format!("permit type tier {}", tier.name), tier.score)),
        );
        if let Some((name, score)) = scores
            .iter()
            .find(|(_, score)| !(0.0..=100.0).contains(score))
        {
            bail!("{name} score must be within 0..=100, got {score}");
        }
        Ok(())
    }
}

/// Polarity of free text in [-1, 1]: positive means an exciting, large or
/// time-sensitive project, negative a minor or teardown job.
pub trait UrgencySignal: Send + Sync {
    fn text_urgency(&self, text: &str) -> f64;
}

/// Keyword-count polarity: `(positive - negative) / (positive + negative)`
/// over whole-word (or whole-phrase) hits.
#[derive(Debug, Clone)]
pub struct LexiconUrgency {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl LexiconUrgency {
    pub fn new(rules: &UrgencyRules) -> Self {
        let prepare = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|w| word_padded(w))
                .filter(|w| !w.trim().is_empty())
                .collect()
        };
        Self {
            positive: prepare(&rules.positive),
            negative: prepare(&rules.negative),
        }
    }
}

/// Lowercases, turns everything except letters, digits and hyphens into
/// single spaces, and pads both ends so phrase lookups can match whole words.
fn word_padded(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

impl UrgencySignal for LexiconUrgency {
    fn text_urgency(&self, text: &str) -> f64 {
        let haystack = word_padded(text);
        let hits = |list: &[String]| list.iter().filter(|w| haystack.contains(w.as_str())).count();
        let positive = hits(&self.positive) as f64;
        let negative = hits(&self.negative) as f64;
        if positive + negative == 0.0 {
            return 0.0;
        }
        (positive - negative) / (positive + negative)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Pure lead scorer: the same record always gets the same score.
#[derive(Clone)]
pub struct Scorer {
    rules: ScoringRules,
    urgency: Arc<dyn UrgencySignal>,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer").field("rules", &self.rules).finish_non_exhaustive()
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringRules::default())
    }
}

impl Scorer {
    pub fn new(rules: ScoringRules) -> Self {
        let urgency = Arc::new(LexiconUrgency::new(&rules.urgency));
        Self { rules, urgency }
    }

    /// Swaps in a different urgency signal, e.g. a model-backed one.
    pub fn with_urgency_signal(mut self, signal: Arc<dyn UrgencySignal>) -> Self {
        self.urgency = signal;
        self
    }

    pub fn rules(&self) -> &ScoringRules {
        &self.rules
    }

    pub fn size_score(&self, record: &PermitRecord) -> f64 {
        let value = record.valuation();
        if value == 0.0 {
            return self.rules.size.unknown.clamp(0.0, 100.0);
        }
        self.rules
            .size
            .bands
            .iter()
            .find(|band| value < band.below)
            .map_or(self.rules.size.top, |band| band.score)
            .clamp(0.0, 100.0)
    }

    pub fn location_score(&self, record: &PermitRecord) -> f64 {
        let rules = &self.rules.location;
        let address = record.address.to_lowercase();
        let jurisdiction = record.jurisdiction.to_lowercase();

        let premium = rules.premium_areas.iter().any(|area| {
            let area = area.to_lowercase();
            address.contains(&area) || jurisdiction.contains(&area)
        });
        let mut score = if premium { rules.premium } else { rules.base };
        if let Some(bonus) = rules
            .jurisdiction_bonus
            .iter()
            .find(|b| jurisdiction.contains(&b.name.to_lowercase()))
        {
            score += bonus.bonus;
        }
        score.clamp(0.0, 100.0)
    }

    pub fn urgency_score(&self, record: &PermitRecord) -> f64 {
        let text = format!("{} {}", record.permit_type, record.work_description);
        let text = text.trim();
        if text.chars().count() < self.rules.urgency.min_text_chars {
            return 50.0;
        }
        let polarity = self.urgency.text_urgency(text);
        let polarity = if polarity.is_finite() {
            polarity.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        // Negative text only pulls the score down to 20.
        let score = if polarity >= 0.0 {
            50.0 + polarity * 50.0
        } else {
            50.0 + polarity * 30.0
        };
        round2(score)
    }

    pub fn type_score(&self, record: &PermitRecord) -> f64 {
        let permit_type = record.permit_type.to_lowercase();
        self.rules
            .permit_type
            .tiers
            .iter()
            .find(|tier| {
                tier.keywords
                    .iter()
                    .any(|keyword| permit_type.contains(&keyword.to_lowercase()))
            })
            .map_or(self.rules.permit_type.fallback, |tier| tier.score)
            .clamp(0.0, 100.0)
    }

    pub fn breakdown(&self, record: &PermitRecord) -> ScoreBreakdown {
        ScoreBreakdown {
            size: self.size_score(record),
            location: self.location_score(record),
            urgency: self.urgency_score(record),
            permit_type: self.type_score(record),
        }
    }

    /// Weighted total, rounded to two decimals and kept within 0..=100.
    pub fn combine(&self, breakdown: &ScoreBreakdown) -> f64 {
        let w = &self.rules.weights;
        let total = breakdown.size * w.size
            + breakdown.location * w.location
            + breakdown.urgency * w.urgency
            + breakdown.permit_type * w.permit_type;
        round2(total).clamp(0.0, 100.0)
    }

    pub fn score(&self, record: PermitRecord) -> ScoredRecord {
        let score_breakdown = self.breakdown(&record);
        ScoredRecord {
            score: self.combine(&score_breakdown),
            score_breakdown,
            record,
        }
    }

    /// Scores every record and ranks them highest first. Equal scores keep
    /// their input order.
    pub fn score_batch(&self, records: Vec<PermitRecord>) -> Vec<ScoredRecord> {
        let mut scored: Vec<ScoredRecord> = records.into_iter().map(|r| self.score(r)).collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }
}

/// First `n` entries of an already ranked batch.
pub fn top_leads(ranked: &[ScoredRecord], n: usize) -> &[ScoredRecord] {
    &ranked[..n.min(ranked.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn permit(permit_type: &str, description: &str, value: f64) -> PermitRecord {
        let mut r = PermitRecord::new("test", Utc::now());
        r.address = "12 Elm St".into();
        r.jurisdiction = "Travis County".into();
        r.permit_type = permit_type.into();
        r.work_description = description.into();
        r.estimated_value = value;
        r
    }

    struct Fixed(f64);

    impl UrgencySignal for Fixed {
        fn text_urgency(&self, _text: &str) -> f64 {
            self.0
        }
    }

    #[test]
    fn workspace_rules_file_matches_built_in_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/scoring.yaml");
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(ScoringRules::from_yaml(&text).unwrap(), ScoringRules::default());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut rules = ScoringRules::default();
        rules.weights.size = 0.5;
        assert!(rules.validate().is_err());
        assert!(ScoringRules::default().validate().is_ok());
    }

    #[test]
    fn rule_scores_outside_zero_to_hundred_are_rejected() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/scoring.yaml");
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("top: 100"));
        let err = ScoringRules::from_yaml(&text.replace("top: 100", "top: 150")).unwrap_err();
        assert!(format!("{err:#}").contains("size.top"));

        let mut rules = ScoringRules::default();
        rules.permit_type.tiers[0].score = 140.0;
        assert!(rules.validate().is_err());

        let mut rules = ScoringRules::default();
        rules.size.bands[0].score = -5.0;
        assert!(rules.validate().is_err());
    }

    #[test]
    fn sub_scores_stay_in_range_with_unchecked_rules() {
        let mut rules = ScoringRules::default();
        rules.size.top = 150.0;
        for tier in &mut rules.permit_type.tiers {
            tier.score = 140.0;
        }
        rules.permit_type.fallback = 140.0;
        let scorer = Scorer::new(rules);
        let breakdown = scorer.breakdown(&permit("Addition", "", 500_000.0));
        assert_eq!(breakdown.size, 100.0);
        assert_eq!(breakdown.permit_type, 100.0);
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let rules = ScoringRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules, ScoringRules::default());
    }

    #[test]
    fn weighted_sum_of_known_sub_scores() {
        let scorer = Scorer::default();
        let record = permit("Shed", "", 300_000.0);
        let scored = scorer.score(record);
        assert_eq!(
            scored.score_breakdown,
            ScoreBreakdown {
                size: 100.0,
                location: 50.0,
                urgency: 50.0,
                permit_type: 50.0,
            }
        );
        assert_eq!(scored.score, 67.5);
    }

    #[test]
    fn size_bands_step_upward_and_unknown_is_neutral() {
        let scorer = Scorer::default();
        let size = |v: f64| scorer.size_score(&permit("x", "", v));
        assert_eq!(size(0.0), 30.0);
        assert_eq!(size(f64::NAN), 30.0);
        assert_eq!(size(9_999.0), 20.0);
        assert_eq!(size(10_000.0), 40.0);
        assert_eq!(size(99_999.0), 60.0);
        assert_eq!(size(249_999.0), 80.0);
        assert_eq!(size(250_000.0), 100.0);
    }

    #[test]
    fn premium_area_and_jurisdiction_bonus_are_capped() {
        let scorer = Scorer::default();
        let mut r = permit("x", "", 0.0);
        r.address = "300 Main St, Franklin".into();
        r.jurisdiction = "Williamson County".into();
        assert_eq!(scorer.location_score(&r), 100.0);

        r.address = "1 Elm St".into();
        r.jurisdiction = "Davidson County".into();
        assert_eq!(scorer.location_score(&r), 60.0);

        r.jurisdiction = "Downtown District".into();
        assert_eq!(scorer.location_score(&r), 85.0);
    }

    #[test]
    fn type_tiers_are_checked_high_to_low() {
        let scorer = Scorer::default();
        let ty = |t: &str| scorer.type_score(&permit(t, "", 0.0));
        assert_eq!(ty("Commercial Sign"), 90.0);
        assert_eq!(ty("Roof Repair"), 60.0);
        assert_eq!(ty("FENCE"), 30.0);
        assert_eq!(ty("Grading"), 50.0);
    }

    #[test]
    fn urgency_mapping_is_asymmetric() {
        let r = permit("Residential", "long enough description", 0.0);
        let with = |p: f64| {
            Scorer::default()
                .with_urgency_signal(Arc::new(Fixed(p)))
                .urgency_score(&r)
        };
        assert_eq!(with(1.0), 100.0);
        assert_eq!(with(0.0), 50.0);
        assert_eq!(with(-1.0), 20.0);
        assert_eq!(with(-0.5), 35.0);
        assert_eq!(with(7.0), 100.0);
        assert_eq!(with(f64::NAN), 50.0);
    }

    #[test]
    fn short_text_is_neutral() {
        let scorer = Scorer::default().with_urgency_signal(Arc::new(Fixed(1.0)));
        assert_eq!(scorer.urgency_score(&permit("Pool", "", 0.0)), 50.0);
    }

    #[test]
    fn lexicon_matches_whole_words_and_phrases() {
        let lexicon = LexiconUrgency::new(&ScoringRules::default().urgency);
        assert_eq!(lexicon.text_urgency("Construct new mixed-use retail building"), 1.0);
        assert_eq!(lexicon.text_urgency("Minor fire damage repair"), -1.0);
        assert_eq!(lexicon.text_urgency("Renewal of signage"), 0.0);
        assert_eq!(lexicon.text_urgency("New custom build, remove old shed"), 0.5);
    }

    #[test]
    fn batch_is_ranked_and_stable() {
        let scorer = Scorer::default();
        let mut a = permit("Grading", "", 0.0);
        a.permit_number = "A".into();
        let mut b = permit("Commercial New Construction", "", 500_000.0);
        b.permit_number = "B".into();
        let mut c = a.clone();
        c.permit_number = "C".into();

        let ranked = scorer.score_batch(vec![a, b, c]);
        let order: Vec<&str> = ranked.iter().map(|s| s.record.permit_number.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
        assert_eq!(top_leads(&ranked, 1).len(), 1);
        assert_eq!(top_leads(&ranked, 10).len(), 3);
    }

    #[test]
    fn scores_are_deterministic_and_bounded() {
        let scorer = Scorer::default();
        let samples = [
            permit("New Construction - Restaurant", "Luxury custom build with retail suite", 9e12),
            permit("", "", -5.0),
            permit("Demolition", "Remove fire damaged garage", f64::INFINITY),
        ];
        for record in samples {
            let first = scorer.score(record.clone());
            let second = scorer.score(record);
            assert_eq!(first, second);
            assert!((0.0..=100.0).contains(&first.score));
        }
    }
}
