//! Labeled sentence corpus loading
//!
//! Examples come from a [`DatasetSource`] that returns named splits. Two sources
//! are provided: a local directory ([`LocalCorpus`]) holding either JSONL files
//! or the GLUE TSV layout, and a HuggingFace Hub dataset repository
//! ([`HubCorpus`]) whose files are downloaded and then parsed the same way.
//!
//! Records are validated eagerly: a missing sentence or an out-of-range label
//! rejects the whole split before anything downstream consumes it.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// Binary sentiment label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    /// Label id 0
    Negative,
    /// Label id 1
    Positive,
}

impl Label {
    /// Integer id used by the dataset (`0` negative, `1` positive)
    pub fn id(self) -> i64 {
        match self {
            Label::Negative => 0,
            Label::Positive => 1,
        }
    }

    /// Text embedded into training prompts
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Negative => "negative",
            Label::Positive => "positive",
        }
    }
}

impl TryFrom<i64> for Label {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Label::Negative),
            1 => Ok(Label::Positive),
            other => Err(Error::data(format!(
                "invalid label {other}: expected 0 (negative) or 1 (positive)"
            ))),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single labeled (or unlabeled) sentence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    sentence: String,
    label: Option<Label>,
}

impl Example {
    /// Create a labeled example
    pub fn labeled(sentence: impl Into<String>, label: Label) -> Self {
        Self {
            sentence: sentence.into(),
            label: Some(label),
        }
    }

    /// Create an example without a label (pure test split)
    pub fn unlabeled(sentence: impl Into<String>) -> Self {
        Self {
            sentence: sentence.into(),
            label: None,
        }
    }

    /// The sentence text
    pub fn sentence(&self) -> &str {
        &self.sentence
    }

    /// The label, if present
    pub fn label(&self) -> Option<Label> {
        self.label
    }

    /// The label, or a data error naming the offending sentence
    pub fn require_label(&self) -> Result<Label> {
        self.label.ok_or_else(|| {
            Error::data(format!("example has no label: {:?}", truncate(&self.sentence, 60)))
        })
    }
}

/// Dataset split names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training partition
    Train,
    /// Labeled held-out partition
    Validation,
    /// Test partition, possibly unlabeled
    Test,
}

impl Split {
    /// Canonical split name
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }

    /// File stem used by the GLUE TSV layout
    fn glue_stem(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "dev",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record as it comes out of a source, before validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// Sentence text
    pub sentence: Option<String>,
    /// Integer label; `-1` and missing both mean "absent"
    pub label: Option<i64>,
}

/// Field names for JSONL records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    /// Name of the sentence field
    pub sentence: String,
    /// Name of the label field
    pub label: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            sentence: "sentence".to_string(),
            label: "label".to_string(),
        }
    }
}

/// Pull-based dataset collaborator returning named splits
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Fetch every record of a split
    async fn fetch(&self, split: Split) -> Result<Vec<RawRecord>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Corpus stored in a local directory
///
/// For each split the directory may hold `<split>.jsonl` or, in the GLUE
/// layout, `train.tsv` / `dev.tsv` / `test.tsv`. JSONL is preferred when both exist.
#[derive(Debug, Clone)]
pub struct LocalCorpus {
    dir: PathBuf,
    fields: FieldNames,
}

impl LocalCorpus {
    /// Create a source over `dir`
    pub fn new(dir: impl Into<PathBuf>, fields: FieldNames) -> Self {
        Self {
            dir: dir.into(),
            fields,
        }
    }

    fn split_file(&self, split: Split) -> Result<PathBuf> {
        let jsonl = self.dir.join(format!("{}.jsonl", split.as_str()));
        if jsonl.exists() {
            return Ok(jsonl);
        }
        let tsv = self.dir.join(format!("{}.tsv", split.glue_stem()));
        if tsv.exists() {
            return Ok(tsv);
        }
        Err(Error::artifact(format!(
            "no {} split found in {} (looked for {} and {})",
            split,
            self.dir.display(),
            jsonl.display(),
            tsv.display()
        )))
    }
}

#[async_trait]
impl DatasetSource for LocalCorpus {
    async fn fetch(&self, split: Split) -> Result<Vec<RawRecord>> {
        let path = self.split_file(split)?;
        read_records(&path, &self.fields).await
    }

    fn describe(&self) -> String {
        format!("local corpus at {}", self.dir.display())
    }
}

/// Corpus hosted in a HuggingFace Hub dataset repository
#[derive(Debug, Clone)]
pub struct HubCorpus {
    repo_id: String,
    revision: Option<String>,
    files: SplitFiles,
    fields: FieldNames,
}

/// Per-split file names inside a hub dataset repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFiles {
    /// Training split file
    pub train: String,
    /// Validation split file
    pub validation: String,
    /// Test split file
    pub test: String,
}

impl Default for SplitFiles {
    fn default() -> Self {
        Self {
            train: "train.jsonl".to_string(),
            validation: "validation.jsonl".to_string(),
            test: "test.jsonl".to_string(),
        }
    }
}

impl SplitFiles {
    fn get(&self, split: Split) -> &str {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }
}

impl HubCorpus {
    /// Create a source over a hub dataset repository
    pub fn new(
        repo_id: impl Into<String>,
        revision: Option<String>,
        files: SplitFiles,
        fields: FieldNames,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision,
            files,
            fields,
        }
    }
}

#[async_trait]
impl DatasetSource for HubCorpus {
    async fn fetch(&self, split: Split) -> Result<Vec<RawRecord>> {
        let api = Api::new()?;
        let repo = match &self.revision {
            Some(rev) => Repo::with_revision(self.repo_id.clone(), RepoType::Dataset, rev.clone()),
            None => Repo::new(self.repo_id.clone(), RepoType::Dataset),
        };
        let file = self.files.get(split);
        info!(repo = %self.repo_id, file, "Downloading dataset split");
        let path = api.repo(repo).get(file).await?;
        read_records(&path, &self.fields).await
    }

    fn describe(&self) -> String {
        format!("hub dataset {}", self.repo_id)
    }
}

/// Train/test partitions of the corpus
#[derive(Debug, Clone)]
pub struct Corpus {
    /// Labeled training examples
    pub train: Vec<Example>,
    /// Held-out examples (labels may be absent)
    pub test: Vec<Example>,
}

/// Fetches and validates the train split and one held-out split
pub struct CorpusLoader {
    source: Box<dyn DatasetSource>,
    held_out: Split,
}

impl CorpusLoader {
    /// Create a loader over `source`, using `held_out` as the test partition
    pub fn new(source: Box<dyn DatasetSource>, held_out: Split) -> Self {
        Self { source, held_out }
    }

    /// Load and validate both partitions
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Corpus> {
        info!("Loading corpus from {}", self.source.describe());

        let train = self.load_split(Split::Train).await?;
        if let Some(pos) = train.iter().position(|e| e.label().is_none()) {
            return Err(Error::data(format!(
                "train split record {pos} has no label"
            )));
        }
        let test = self.load_split(self.held_out).await?;

        info!(
            train = train.len(),
            test = test.len(),
            held_out = %self.held_out,
            "Corpus loaded"
        );
        Ok(Corpus { train, test })
    }

    /// Load and validate a single split
    pub async fn load_split(&self, split: Split) -> Result<Vec<Example>> {
        let records = self.source.fetch(split).await?;
        let examples = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                validate_record(record)
                    .map_err(|e| Error::data(format!("{split} record {i}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(split = %split, count = examples.len(), "Split validated");
        Ok(examples)
    }
}

/// Turn a raw record into an [`Example`], rejecting malformed input
pub fn validate_record(record: RawRecord) -> Result<Example> {
    let sentence = record
        .sentence
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::data("missing or empty sentence"))?;
    let label = match record.label {
        None | Some(-1) => None,
        Some(id) => Some(Label::try_from(id)?),
    };
    Ok(Example { sentence, label })
}

async fn read_records(path: &Path, fields: &FieldNames) -> Result<Vec<RawRecord>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::artifact(format!("cannot read dataset file {}: {e}", path.display()))
    })?;
    let records = match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") => parse_tsv(&content)?,
        _ => parse_jsonl(&content, fields)?,
    };
    debug!(path = %path.display(), count = records.len(), "Read dataset file");
    Ok(records)
}

/// Parse JSONL content, one object per line
pub fn parse_jsonl(content: &str, fields: &FieldNames) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
            Error::data(format!("line {}: invalid JSON: {e}", line_no + 1))
        })?;
        let sentence = value
            .get(&fields.sentence)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let label = match value.get(&fields.label) {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                Error::data(format!("line {}: label is not an integer: {v}", line_no + 1))
            })?),
        };
        records.push(RawRecord { sentence, label });
    }
    Ok(records)
}

/// Parse GLUE TSV content with a header row
///
/// The header must name a `sentence` column; a `label` column is optional.
pub fn parse_tsv(content: &str) -> Result<Vec<RawRecord>> {
    let mut lines = content.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::data("empty TSV file"))?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let sentence_col = columns
        .iter()
        .position(|c| *c == "sentence")
        .ok_or_else(|| Error::data("TSV header has no 'sentence' column"))?;
    let label_col = columns.iter().position(|c| *c == "label");

    let mut records = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split('\t').collect();
        let sentence = cells.get(sentence_col).map(|s| s.trim().to_string());
        let label = match label_col.and_then(|c| cells.get(c)) {
            None => None,
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                Error::data(format!("row {}: label is not an integer: {raw:?}", line_no + 2))
            })?),
        };
        records.push(RawRecord { sentence, label });
    }
    Ok(records)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_conversion() {
        assert_eq!(Label::try_from(1).unwrap(), Label::Positive);
        assert_eq!(Label::try_from(0).unwrap(), Label::Negative);
        assert!(matches!(Label::try_from(2), Err(Error::Data(_))));
        assert_eq!(Label::Positive.id(), 1);
    }

    #[test]
    fn test_validate_record_rejects_missing_sentence() {
        let record = RawRecord {
            sentence: None,
            label: Some(1),
        };
        assert!(matches!(validate_record(record), Err(Error::Data(_))));

        let blank = RawRecord {
            sentence: Some("   ".to_string()),
            label: Some(0),
        };
        assert!(validate_record(blank).is_err());
    }

    #[test]
    fn test_glue_test_label_is_absent() {
        let record = RawRecord {
            sentence: Some("a fine film".to_string()),
            label: Some(-1),
        };
        let example = validate_record(record).unwrap();
        assert_eq!(example.label(), None);
        assert!(example.require_label().is_err());
    }

    #[test]
    fn test_parse_jsonl_custom_fields() {
        let content = "{\"text\": \"great movie\", \"y\": 1}\n\n{\"text\": \"bad movie\", \"y\": 0}\n";
        let fields = FieldNames {
            sentence: "text".to_string(),
            label: "y".to_string(),
        };
        let records = parse_jsonl(content, &fields).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sentence.as_deref(), Some("great movie"));
        assert_eq!(records[1].label, Some(0));
    }

    #[test]
    fn test_parse_jsonl_rejects_non_integer_label() {
        let content = "{\"sentence\": \"ok\", \"label\": \"yes\"}";
        assert!(parse_jsonl(content, &FieldNames::default()).is_err());
    }

    #[test]
    fn test_parse_glue_tsv() {
        let train = "sentence\tlabel\nhide new secretions \t0\nthe greatest musicians \t1\n";
        let records = parse_tsv(train).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label, Some(1));

        let test = "index\tsentence\n0\tuneasy mishmash of styles\n";
        let records = parse_tsv(test).unwrap();
        assert_eq!(records[0].label, None);
        assert_eq!(records[0].sentence.as_deref(), Some("uneasy mishmash of styles"));
    }

    #[tokio::test]
    async fn test_local_corpus_loads_splits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("train.jsonl"),
            "{\"sentence\": \"great movie\", \"label\": 1}\n{\"sentence\": \"bad movie\", \"label\": 0}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("dev.tsv"), "sentence\tlabel\nfine\t1\n").unwrap();

        let loader = CorpusLoader::new(
            Box::new(LocalCorpus::new(dir.path(), FieldNames::default())),
            Split::Validation,
        );
        let corpus = loader.load().await.unwrap();
        assert_eq!(corpus.train.len(), 2);
        assert_eq!(corpus.test, vec![Example::labeled("fine", Label::Positive)]);
    }

    #[tokio::test]
    async fn test_unlabeled_train_split_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.jsonl"), "{\"sentence\": \"no label here\"}\n").unwrap();
        std::fs::write(dir.path().join("test.jsonl"), "{\"sentence\": \"x\"}\n").unwrap();

        let loader = CorpusLoader::new(
            Box::new(LocalCorpus::new(dir.path(), FieldNames::default())),
            Split::Test,
        );
        assert!(matches!(loader.load().await, Err(Error::Data(_))));
    }
}
