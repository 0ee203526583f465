//! Matrix expansion for parallel job generation.

use conduit_core::JobKey;
use conduit_core::workflow::{JobDefinition, MatrixConfig};
use std::collections::BTreeMap;

type Combination = BTreeMap<String, serde_json::Value>;

/// A single job in an expanded matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixJob {
    pub key: JobKey,
    pub index: usize,
    pub values: BTreeMap<String, String>,
    pub display_name: String,
}

/// Result of matrix expansion.
#[derive(Debug, Clone)]
pub struct MatrixExpansion {
    pub job_id: String,
    pub jobs: Vec<MatrixJob>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job's matrix into individual jobs. Jobs without a matrix
    /// return `None`.
    pub fn expand(&self, job: &JobDefinition) -> Option<MatrixExpansion> {
        let matrix = job.matrix.as_ref()?;
        let combinations = self.combinations(matrix);

        let jobs = combinations
            .into_iter()
            .enumerate()
            .map(|(index, combo)| {
                let values: BTreeMap<String, String> = combo
                    .into_iter()
                    .map(|(k, v)| (k, value_to_string(&v)))
                    .collect();
                MatrixJob {
                    key: JobKey::expanded(&job.id, index),
                    index,
                    display_name: self.format_display_name(job.display_name(), &values),
                    values,
                }
            })
            .collect();

        Some(MatrixExpansion {
            job_id: job.id.clone(),
            jobs,
            fail_fast: matrix.fail_fast,
            max_parallel: matrix.max_parallel,
        })
    }

    /// Cartesian product of the dimensions, plus includes, minus excludes.
    pub fn combinations(&self, matrix: &MatrixConfig) -> Vec<Combination> {
        let mut combinations = self.generate_combinations(&matrix.dimensions);

        for include in &matrix.include {
            if !combinations.contains(include) {
                combinations.push(include.clone());
            }
        }

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        combinations
    }

    fn generate_combinations(
        &self,
        dimensions: &BTreeMap<String, Vec<serde_json::Value>>,
    ) -> Vec<Combination> {
        if dimensions.is_empty() {
            return Vec::new();
        }

        let mut result = vec![Combination::new()];

        for (key, values) in dimensions {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(key.clone(), value.clone());
                    next.push(extended);
                }
            }
            result = next;
        }

        result
    }

    fn matches_exclude(&self, combo: &Combination, exclude: &Combination) -> bool {
        !exclude.is_empty()
            && exclude
                .iter()
                .all(|(key, value)| combo.get(key) == Some(value))
    }

    fn format_display_name(&self, name: &str, values: &BTreeMap<String, String>) -> String {
        if values.is_empty() {
            return name.to_string();
        }

        let parts: Vec<String> = values.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{} ({})", name, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
