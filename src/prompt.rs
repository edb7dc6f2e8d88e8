//! Chat-template prompt rendering
//!
//! Both prompt variants are produced from the same prefix so that the inference
//! prompt is always a strict prefix of the training prompt, ending exactly where
//! the label is inserted.

use serde::{Deserialize, Serialize};

use crate::corpus::{Example, Label};
use crate::error::Result;

/// Begin-of-sequence marker
pub const BOS: &str = "<bos>";
/// End-of-sequence marker
pub const EOS: &str = "<eos>";
/// Start-of-turn marker
pub const START_OF_TURN: &str = "<start_of_turn>";
/// End-of-turn marker
pub const END_OF_TURN: &str = "<end_of_turn>";

/// Instruction placed before the sentence in the user turn
pub const DEFAULT_INSTRUCTION: &str = "The sentiment of the following text:";

/// Renders examples into the model's chat template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptFormatter {
    instruction: String,
}

impl Default for PromptFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_INSTRUCTION)
    }
}

impl PromptFormatter {
    /// Create a formatter with a custom instruction line
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }

    /// Prompt that ends right after the model-turn marker
    pub fn render_inference(&self, sentence: &str) -> String {
        format!(
            "{BOS}{START_OF_TURN}user\n{}\n\n{sentence}{END_OF_TURN}\n{START_OF_TURN}model\n",
            self.instruction
        )
    }

    /// Text the model is trained to produce after the inference prompt
    pub fn completion(label: Label) -> String {
        format!("{}{END_OF_TURN}{EOS}", label.as_str())
    }

    /// Full training prompt: inference prompt, label, closing markers
    pub fn render_training_with(&self, sentence: &str, label: Label) -> String {
        let mut prompt = self.render_inference(sentence);
        prompt.push_str(&Self::completion(label));
        prompt
    }

    /// Training prompt for a labeled example
    ///
    /// Fails with a data error when the example carries no label.
    pub fn render_training(&self, example: &Example) -> Result<String> {
        let label = example.require_label()?;
        Ok(self.render_training_with(example.sentence(), label))
    }

    /// Inference prompt for an example, ignoring its label
    pub fn render_example(&self, example: &Example) -> String {
        self.render_inference(example.sentence())
    }
}
