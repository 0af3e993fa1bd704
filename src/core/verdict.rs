use crate::core::image::ItemId;
use crate::core::sieve::SieveMatch;
use crate::core::vector_index::VectorMatch;
use serde::Serialize;
use std::fmt;

/// Which stage of the funnel produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sieve,
    Verifier,
    Unique,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Sieve => "sieve",
            Stage::Verifier => "verifier",
            Stage::Unique => "unique",
        };
        f.write_str(label)
    }
}

/// Best-match score, tagged with its unit. Hamming distances and cosine
/// similarities rank in opposite directions and are never compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Score {
    /// Differing fingerprint bits; lower is closer.
    Hamming(u32),
    /// Embedding cosine similarity; higher is closer.
    Cosine(f32),
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Hamming(d) => write!(f, "hamming {}", d),
            Score::Cosine(s) => write!(f, "cosine {:.4}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Sieve(SieveMatch),
    Verifier(VectorMatch),
    Unique,
}

/// Outcome of one funnel query. Built once per query and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    decision: Decision,
    sieve_matches: Vec<SieveMatch>,
    verifier_matches: Vec<VectorMatch>,
}

impl Verdict {
    /// `matches` must be non-empty and ranked nearest first.
    pub(crate) fn from_sieve(matches: Vec<SieveMatch>) -> Option<Self> {
        let best = matches.first()?.clone();
        Some(Self {
            decision: Decision::Sieve(best),
            sieve_matches: matches,
            verifier_matches: Vec::new(),
        })
    }

    /// Verifier outcome: duplicate when any survivor remains, unique otherwise.
    pub(crate) fn from_verifier(survivors: Vec<VectorMatch>) -> Self {
        let decision = match survivors.first() {
            Some(best) => Decision::Verifier(best.clone()),
            None => Decision::Unique,
        };
        Self {
            decision,
            sieve_matches: Vec::new(),
            verifier_matches: survivors,
        }
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn is_duplicate(&self) -> bool {
        !matches!(self.decision, Decision::Unique)
    }

    pub fn stage(&self) -> Stage {
        match self.decision {
            Decision::Sieve(_) => Stage::Sieve,
            Decision::Verifier(_) => Stage::Verifier,
            Decision::Unique => Stage::Unique,
        }
    }

    pub fn best_match(&self) -> Option<&ItemId> {
        match &self.decision {
            Decision::Sieve(m) => Some(&m.id),
            Decision::Verifier(m) => Some(&m.id),
            Decision::Unique => None,
        }
    }

    pub fn score(&self) -> Option<Score> {
        match &self.decision {
            Decision::Sieve(m) => Some(Score::Hamming(m.distance)),
            Decision::Verifier(m) => Some(Score::Cosine(m.score)),
            Decision::Unique => None,
        }
    }

    pub fn sieve_matches(&self) -> &[SieveMatch] {
        &self.sieve_matches
    }

    pub fn verifier_matches(&self) -> &[VectorMatch] {
        &self.verifier_matches
    }

    /// Flat shape consumed by UI layers.
    pub fn report(&self) -> VerdictReport {
        VerdictReport {
            is_duplicate: self.is_duplicate(),
            stage: self.stage(),
            matched: self.best_match().cloned(),
            score: self.score(),
            sieve_matches: self.sieve_matches.clone(),
            verifier_matches: self.verifier_matches.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerdictReport {
    pub is_duplicate: bool,
    pub stage: Stage,
    #[serde(rename = "match")]
    pub matched: Option<ItemId>,
    pub score: Option<Score>,
    pub sieve_matches: Vec<SieveMatch>,
    pub verifier_matches: Vec<VectorMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sieve_verdict_report() {
        let verdict = Verdict::from_sieve(vec![
            SieveMatch {
                id: ItemId::new("a.jpg"),
                distance: 2,
            },
            SieveMatch {
                id: ItemId::new("b.jpg"),
                distance: 4,
            },
        ])
        .unwrap();

        assert!(verdict.is_duplicate());
        assert_eq!(verdict.stage(), Stage::Sieve);
        assert_eq!(verdict.score(), Some(Score::Hamming(2)));

        let report = serde_json::to_value(verdict.report()).unwrap();
        assert_eq!(report["stage"], json!("sieve"));
        assert_eq!(report["match"], json!("a.jpg"));
        assert_eq!(report["score"], json!(2));
        assert_eq!(report["sieve_matches"][1]["distance"], json!(4));
        assert_eq!(report["verifier_matches"], json!([]));
    }

    #[test]
    fn test_empty_sieve_is_not_a_verdict() {
        assert!(Verdict::from_sieve(Vec::new()).is_none());
    }

    #[test]
    fn test_unique_report() {
        let verdict = Verdict::from_verifier(Vec::new());
        assert!(!verdict.is_duplicate());
        assert_eq!(verdict.best_match(), None);

        let report = serde_json::to_value(verdict.report()).unwrap();
        assert_eq!(report["is_duplicate"], json!(false));
        assert_eq!(report["stage"], json!("unique"));
        assert_eq!(report["match"], json!(null));
        assert_eq!(report["score"], json!(null));
    }

    #[test]
    fn test_verifier_report_score_is_float() {
        let verdict = Verdict::from_verifier(vec![VectorMatch {
            slot: 4,
            id: ItemId::new("c.jpg"),
            score: 0.5,
        }]);
        assert_eq!(verdict.stage(), Stage::Verifier);

        let report = serde_json::to_value(verdict.report()).unwrap();
        assert_eq!(report["score"], json!(0.5));
        assert_eq!(report["verifier_matches"][0]["slot"], json!(4));
    }
}
