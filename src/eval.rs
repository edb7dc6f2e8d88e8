//! Sentiment accuracy over generated continuations

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::corpus::{Example, Label};
use crate::error::{Error, Result};
use crate::infer::InferenceRunner;
use crate::model::LanguageModel;
use crate::prompt::PromptFormatter;

/// Label id recorded when a continuation names neither class
pub const INVALID_LABEL_ID: i64 = -1;

/// Class read from a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Negative,
    Positive,
    Invalid,
}

impl Prediction {
    /// Case-insensitive keyword match; "positive" wins when both words appear
    pub fn classify(continuation: &str) -> Self {
        let text = continuation.to_lowercase();
        if text.contains(Label::Positive.as_str()) {
            Self::Positive
        } else if text.contains(Label::Negative.as_str()) {
            Self::Negative
        } else {
            Self::Invalid
        }
    }

    pub fn label(self) -> Option<Label> {
        match self {
            Self::Negative => Some(Label::Negative),
            Self::Positive => Some(Label::Positive),
            Self::Invalid => None,
        }
    }

    /// 0, 1, or [`INVALID_LABEL_ID`]
    pub fn label_id(self) -> i64 {
        self.label().map_or(INVALID_LABEL_ID, Label::id)
    }
}

/// One evaluated example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredExample {
    pub sentence: String,
    pub expected: Label,
    pub predicted: Prediction,
    pub continuation: String,
}

/// Accuracy over the examples that produced a valid prediction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub records: Vec<ScoredExample>,
}

impl EvaluationReport {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn valid(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.predicted != Prediction::Invalid)
            .count()
    }

    pub fn invalid(&self) -> usize {
        self.total() - self.valid()
    }

    pub fn correct(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.predicted.label() == Some(r.expected))
            .count()
    }

    /// Fraction of valid predictions that are correct; `None` when nothing is valid
    pub fn accuracy(&self) -> Option<f64> {
        match self.valid() {
            0 => None,
            valid => Some(self.correct() as f64 / valid as f64),
        }
    }

    /// Predicted label ids, with [`INVALID_LABEL_ID`] for unparseable outputs
    pub fn predicted_ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.predicted.label_id()).collect()
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accuracy() {
            Some(acc) => write!(
                f,
                "Accuracy: {:.4} ({}/{} valid, {} invalid)",
                acc,
                self.correct(),
                self.valid(),
                self.invalid()
            ),
            None => f.write_str("No valid predictions to evaluate."),
        }
    }
}

/// Runs inference over labeled examples and scores the outputs
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    formatter: PromptFormatter,
    limit: Option<usize>,
}

impl Evaluator {
    /// Evaluate at most `limit` examples (the first ones, in order)
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            formatter: PromptFormatter::default(),
            limit,
        }
    }

    pub fn with_formatter(mut self, formatter: PromptFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Generate for each example and compare against its label
    ///
    /// Every selected example must be labeled; this is checked before any
    /// generation runs.
    #[instrument(skip_all, fields(examples = examples.len(), limit = ?self.limit))]
    pub fn evaluate<M: LanguageModel>(
        &self,
        runner: &mut InferenceRunner<'_, M>,
        examples: &[Example],
    ) -> Result<EvaluationReport> {
        let take = self.limit.unwrap_or(examples.len()).min(examples.len());
        let selected = &examples[..take];
        let labels = selected
            .iter()
            .enumerate()
            .map(|(i, ex)| {
                ex.label().ok_or_else(|| {
                    Error::data(format!(
                        "evaluation example {i} ({:?}) has no label",
                        ex.sentence()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = EvaluationReport::default();
        for (example, expected) in selected.iter().zip(labels) {
            let generation = runner.generate(&self.formatter.render_example(example))?;
            let predicted = Prediction::classify(generation.continuation());
            if predicted == Prediction::Invalid {
                warn!(continuation = generation.continuation(), "Unparseable prediction");
            }
            report.records.push(ScoredExample {
                sentence: example.sentence().to_string(),
                expected,
                predicted,
                continuation: generation.continuation().to_string(),
            });
        }

        info!(
            total = report.total(),
            valid = report.valid(),
            correct = report.correct(),
            "{report}"
        );
        Ok(report)
    }
}

/// Score precomputed continuations against labels
pub fn score<'a>(pairs: impl IntoIterator<Item = (&'a str, Label)>) -> EvaluationReport {
    let records = pairs
        .into_iter()
        .map(|(continuation, expected)| ScoredExample {
            sentence: String::new(),
            expected,
            predicted: Prediction::classify(continuation),
            continuation: continuation.to_string(),
        })
        .collect();
    EvaluationReport { records }
}
