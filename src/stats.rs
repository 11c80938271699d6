use std::collections::HashMap;

use crate::config::EvalConfig;
use crate::models::{AggregatedData, Comment, EvaluationRecord};

// Per-question averages and attributed comment lists for one target. None
// when no record matches. A missing score counts as 0 toward the mean;
// comment lists follow record order, and any non-empty text field counts as
// a comment, whitespace included.
pub fn aggregate(
    config: &EvalConfig,
    target: &str,
    records: &[EvaluationRecord],
) -> Option<AggregatedData> {
    let matching: Vec<&EvaluationRecord> =
        records.iter().filter(|r| r.target == target).collect();

    if matching.is_empty() {
        return None;
    }

    let count = matching.len();

    let mut pos_sums: HashMap<String, f64> = HashMap::new();
    let mut neg_sums: HashMap<String, f64> = HashMap::new();
    let mut comments_start = Vec::new();
    let mut comments_stop = Vec::new();
    let mut comments_continue = Vec::new();

    for record in &matching {
        for q in config.positive_questions() {
            *pos_sums.entry(q.to_string()).or_insert(0.0) +=
                record.pos_scores.get(q).copied().unwrap_or(0.0);
        }
        for q in config.negative_questions() {
            *neg_sums.entry(q.to_string()).or_insert(0.0) +=
                record.neg_scores.get(q).copied().unwrap_or(0.0);
        }

        for (field, list) in [
            (&record.text_start, &mut comments_start),
            (&record.text_stop, &mut comments_stop),
            (&record.text_continue, &mut comments_continue),
        ] {
            if !field.is_empty() {
                list.push(Comment {
                    text: field.clone(),
                    evaluator: record.evaluator.clone(),
                });
            }
        }
    }

    let avg_pos = pos_sums
        .into_iter()
        .map(|(q, sum)| (q, round1(sum / count as f64)))
        .collect();
    let avg_neg = neg_sums
        .into_iter()
        .map(|(q, sum)| (q, round1(sum / count as f64)))
        .collect();

    Some(AggregatedData {
        target: target.to_string(),
        avg_pos,
        avg_neg,
        comments_start,
        comments_stop,
        comments_continue,
        count,
    })
}

// One decimal place, half away from zero.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
