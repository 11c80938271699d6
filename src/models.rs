use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// At most one record exists per (evaluator, target) pair; the upsert in
// store::save_evaluation deletes prior matches before inserting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub evaluator: String,
    pub target: String,
    pub pos_scores: HashMap<String, f64>,
    pub neg_scores: HashMap<String, f64>,
    pub text_start: String,
    pub text_stop: String,
    pub text_continue: String,
}

// A record as received from the form, before the store assigns an id and
// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub evaluator: String,
    pub target: String,
    #[serde(default)]
    pub pos_scores: HashMap<String, f64>,
    #[serde(default)]
    pub neg_scores: HashMap<String, f64>,
    #[serde(default)]
    pub text_start: String,
    #[serde(default)]
    pub text_stop: String,
    #[serde(default)]
    pub text_continue: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    pub evaluator: String,
}

// Derived, never persisted; recomputed on demand by stats::aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedData {
    pub target: String,
    pub avg_pos: HashMap<String, f64>,
    pub avg_neg: HashMap<String, f64>,
    pub comments_start: Vec<Comment>,
    pub comments_stop: Vec<Comment>,
    pub comments_continue: Vec<Comment>,
    pub count: usize,
}
