use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use super::{GuessSource, RecognitionCandidate, ScoredGuess};
use crate::config::SolverConfig;

/// Merges the candidates of one capture into a single guess.
#[derive(Debug, Clone)]
pub struct CandidateAggregator {
    expected_length: Option<usize>,
    length_penalty: f64,
    score_floor: f64,
    arithmetic: bool,
}

impl CandidateAggregator {
    pub fn new(expected_length: Option<usize>) -> Self {
        let defaults = SolverConfig::default();
        Self {
            expected_length: expected_length.filter(|l| *l > 0),
            length_penalty: defaults.length_penalty,
            score_floor: defaults.score_floor,
            arithmetic: false,
        }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            expected_length: config.expected_length.filter(|l| *l > 0),
            length_penalty: config.length_penalty,
            score_floor: config.score_floor,
            arithmetic: config.arithmetic,
        }
    }

    pub fn with_arithmetic(mut self, enabled: bool) -> Self {
        self.arithmetic = enabled;
        self
    }

    /// `confidence - penalty * |len - expected|`, no penalty without an expected length.
    pub fn score(&self, candidate: &RecognitionCandidate) -> f64 {
        match self.expected_length {
            Some(expected) => {
                let len = candidate.text.chars().count();
                candidate.confidence - self.length_penalty * len.abs_diff(expected) as f64
            }
            None => candidate.confidence,
        }
    }

    /// Accumulated score per distinct text, in first-seen order.
    pub fn totals(&self, candidates: &[RecognitionCandidate]) -> Vec<(String, f64)> {
        let mut totals: Vec<(String, f64)> = Vec::new();
        for candidate in candidates {
            let contribution = self.score(candidate).max(self.score_floor);
            match totals.iter_mut().find(|(text, _)| *text == candidate.text) {
                Some((_, total)) => *total += contribution,
                None => totals.push((candidate.text.clone(), contribution)),
            }
        }
        totals
    }

    pub fn aggregate(&self, candidates: &[RecognitionCandidate]) -> ScoredGuess {
        let totals = self.totals(candidates);
        let Some((mut best_text, mut best_score)) = pick_max(totals.iter()) else {
            return ScoredGuess::empty();
        };

        if let Some(expected) = self.expected_length {
            if best_text.chars().count() != expected {
                let matching = totals
                    .iter()
                    .filter(|(text, _)| text.chars().count() == expected);
                if let Some((text, score)) = pick_max(matching) {
                    debug!(
                        "Preferring '{}' over '{}' for expected length {}",
                        text, best_text, expected
                    );
                    best_text = text;
                    best_score = score;
                }
            }
        }

        let confidence = candidates
            .iter()
            .filter(|c| c.text == best_text)
            .map(|c| c.confidence)
            .fold(0.0, f64::max);

        let text = if self.arithmetic {
            match evaluate_arithmetic(&best_text) {
                Some(value) => {
                    debug!("Interpreting '{}' as arithmetic = {}", best_text, value);
                    value.to_string()
                }
                None => best_text,
            }
        } else {
            best_text
        };

        ScoredGuess {
            text,
            aggregate_score: best_score,
            confidence,
            source: GuessSource::Local,
        }
    }
}

/// Highest score wins; ties keep the first-seen text.
fn pick_max<'a>(items: impl Iterator<Item = &'a (String, f64)>) -> Option<(String, f64)> {
    let mut best: Option<&(String, f64)> = None;
    for item in items {
        if best.map_or(true, |(_, score)| item.1 > *score) {
            best = Some(item);
        }
    }
    best.cloned()
}

fn arithmetic_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(\d+)\s*([+\-xX*])\s*(\d+)\s*=?\s*$").ok())
        .as_ref()
}

/// Evaluates `<int><+|-|x|X|*><int>[=]`.
pub fn evaluate_arithmetic(text: &str) -> Option<i64> {
    let caps = arithmetic_pattern()?.captures(text)?;
    let a: i64 = caps[1].parse().ok()?;
    let b: i64 = caps[3].parse().ok()?;
    match &caps[2] {
        "+" => a.checked_add(b),
        "-" => a.checked_sub(b),
        _ => a.checked_mul(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentationMode::{RawLine, SingleLine, SingleWord};

    fn candidate(
        text: &str,
        confidence: f64,
        mode: crate::config::SegmentationMode,
    ) -> RecognitionCandidate {
        RecognitionCandidate::new(text, confidence, mode, "test")
    }

    #[test]
    fn test_repeated_reads_outvote_single_confident_read() {
        let aggregator = CandidateAggregator::new(Some(5));
        let candidates = vec![
            candidate("AB3X7", 80.0, SingleLine),
            candidate("AB3X7", 60.0, SingleWord),
            candidate("ABZX7", 90.0, RawLine),
        ];

        let totals = aggregator.totals(&candidates);
        assert_eq!(totals, vec![("AB3X7".to_string(), 140.0), ("ABZX7".to_string(), 90.0)]);

        let guess = aggregator.aggregate(&candidates);
        assert_eq!(guess.text, "AB3X7");
        assert_eq!(guess.confidence, 80.0);
        assert_eq!(guess.aggregate_score, 140.0);
    }

    #[test]
    fn test_length_penalty() {
        let aggregator = CandidateAggregator::new(Some(5));
        assert_eq!(aggregator.score(&candidate("AB3", 70.0, SingleLine)), 66.0);
        assert_eq!(aggregator.score(&candidate("AB3X7QQ", 70.0, SingleLine)), 66.0);

        let no_length = CandidateAggregator::new(None);
        assert_eq!(no_length.score(&candidate("AB3", 70.0, SingleLine)), 70.0);
    }

    #[test]
    fn test_floor_bounds_bad_reads() {
        let config = SolverConfig {
            length_penalty: 40.0,
            ..SolverConfig::default()
        };
        let aggregator = CandidateAggregator::from_config(&config);
        // 10 - 40 * 4 = -150, floored to -50
        let totals = aggregator.totals(&[
            candidate("A", 10.0, SingleLine),
            candidate("A", 10.0, SingleWord),
        ]);
        assert_eq!(totals[0].1, -100.0);
    }

    #[test]
    fn test_prefers_expected_length_when_best_mismatches() {
        let aggregator = CandidateAggregator::new(Some(5));
        let candidates = vec![
            candidate("AB3X", 95.0, SingleLine),
            candidate("AB3X", 90.0, SingleWord),
            candidate("AB3X7", 70.0, RawLine),
        ];
        let guess = aggregator.aggregate(&candidates);
        assert_eq!(guess.text, "AB3X7");
        assert_eq!(guess.confidence, 70.0);
    }

    #[test]
    fn test_keeps_mismatched_best_without_alternative() {
        let aggregator = CandidateAggregator::new(Some(5));
        let candidates = vec![
            candidate("AB3X", 95.0, SingleLine),
            candidate("AB", 40.0, SingleWord),
        ];
        let guess = aggregator.aggregate(&candidates);
        assert_eq!(guess.text, "AB3X");
    }

    #[test]
    fn test_empty_candidates() {
        let guess = CandidateAggregator::new(Some(5)).aggregate(&[]);
        assert!(guess.is_empty());
        assert_eq!(guess.confidence, 0.0);
    }

    #[test]
    fn test_aggregation_is_deterministic_on_ties() {
        let aggregator = CandidateAggregator::new(None);
        let candidates = vec![
            candidate("QWE12", 70.0, SingleLine),
            candidate("QWE1Z", 70.0, SingleWord),
        ];
        for _ in 0..5 {
            assert_eq!(aggregator.aggregate(&candidates).text, "QWE12");
        }
    }

    #[test]
    fn test_arithmetic_answer() {
        let aggregator = CandidateAggregator::new(None).with_arithmetic(true);
        let guess = aggregator.aggregate(&[candidate("12+7", 75.0, SingleLine)]);
        assert_eq!(guess.text, "19");
        assert_eq!(guess.confidence, 75.0);

        let literal = CandidateAggregator::new(None);
        assert_eq!(literal.aggregate(&[candidate("12+7", 75.0, SingleLine)]).text, "12+7");
    }

    #[test]
    fn test_evaluate_arithmetic() {
        assert_eq!(evaluate_arithmetic("12+7"), Some(19));
        assert_eq!(evaluate_arithmetic(" 9 - 4 = "), Some(5));
        assert_eq!(evaluate_arithmetic("3x4"), Some(12));
        assert_eq!(evaluate_arithmetic("3X4="), Some(12));
        assert_eq!(evaluate_arithmetic("6*7"), Some(42));
        assert_eq!(evaluate_arithmetic("2-9"), Some(-7));
        assert_eq!(evaluate_arithmetic("AB3X7"), None);
        assert_eq!(evaluate_arithmetic("12+"), None);
    }
}
