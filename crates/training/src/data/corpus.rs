use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use super::{Result, SequenceCaps};
use crate::TrainingError;

/// Indexed source of `(prompt_ids, label_ids)` pairs. Implementations pad and
/// truncate to their [`SequenceCaps`] before handing samples out.
pub trait DialogueDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<(Vec<u32>, Vec<u32>)>;
}

pub trait Vocabulary {
    fn size(&self) -> usize;
    fn padding_index(&self) -> u32;
}

/// Samples held in memory, already tokenized.
#[derive(Debug, Clone, Default)]
pub struct PairDataset {
    pairs: Vec<(Vec<u32>, Vec<u32>)>,
}

impl PairDataset {
    pub fn new(pairs: Vec<(Vec<u32>, Vec<u32>)>) -> Self {
        Self { pairs }
    }
}

impl DialogueDataset for PairDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Result<(Vec<u32>, Vec<u32>)> {
        self.pairs.get(index).cloned().ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample {index} out of range for dataset of {}",
                self.pairs.len()
            ))
        })
    }
}

const PAD_TOKENS: &[&str] = &["<pad>", "[PAD]"];
const BOS_TOKENS: &[&str] = &["<bos>", "<s>", "[CLS]"];
const EOS_TOKENS: &[&str] = &["<eos>", "</s>", "[SEP]"];

pub struct TokenizerVocabulary {
    tokenizer: Tokenizer,
    pad_id: u32,
    bos_id: u32,
    eos_id: u32,
}

impl TokenizerVocabulary {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer {}: {err}",
                path.display()
            ))
        })?;
        Self::from_tokenizer(tokenizer)
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        let pad_id = tokenizer
            .get_padding()
            .map(|params| params.pad_id)
            .or_else(|| lookup(&tokenizer, PAD_TOKENS))
            .ok_or_else(|| missing_special("padding", PAD_TOKENS))?;
        let bos_id = lookup(&tokenizer, BOS_TOKENS)
            .ok_or_else(|| missing_special("start-of-sequence", BOS_TOKENS))?;
        let eos_id = lookup(&tokenizer, EOS_TOKENS)
            .ok_or_else(|| missing_special("end-of-sequence", EOS_TOKENS))?;

        Ok(Self {
            tokenizer,
            pad_id,
            bos_id,
            eos_id,
        })
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Prompt keeps its most recent tokens and is padded to the passage cap.
    /// The reply is framed by start and end markers, then cut and padded to
    /// the sentence cap.
    pub fn encode_pair(
        &self,
        prompt: &str,
        reply: &str,
        caps: SequenceCaps,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut prompt_ids = self.encode(prompt)?;
        if prompt_ids.len() > caps.max_passage_length {
            prompt_ids.drain(..prompt_ids.len() - caps.max_passage_length);
        }
        prompt_ids.resize(caps.max_passage_length, self.pad_id);

        let mut label_ids = Vec::with_capacity(caps.max_sentence_length);
        label_ids.push(self.bos_id);
        label_ids.extend(self.encode(reply)?);
        label_ids.push(self.eos_id);
        label_ids.truncate(caps.max_sentence_length);
        label_ids.resize(caps.max_sentence_length, self.pad_id);

        Ok((prompt_ids, label_ids))
    }
}

impl Vocabulary for TokenizerVocabulary {
    fn size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn padding_index(&self) -> u32 {
        self.pad_id
    }
}

fn lookup(tokenizer: &Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates
        .iter()
        .find_map(|token| tokenizer.token_to_id(token))
}

fn missing_special(role: &str, candidates: &[&str]) -> TrainingError {
    TrainingError::initialization(format!(
        "tokenizer has no {role} token (looked for {})",
        candidates.join(", ")
    ))
}

#[derive(Debug, Deserialize)]
struct DialogueRecord {
    prompt: String,
    reply: String,
}

/// Dialogue pairs read from a JSONL file, one `{"prompt", "reply"}` object
/// per line. Blank lines are skipped.
#[derive(Debug, Clone)]
pub struct JsonlDialogueCorpus {
    samples: PairDataset,
}

impl JsonlDialogueCorpus {
    pub fn load(
        path: impl AsRef<Path>,
        vocabulary: &TokenizerVocabulary,
        caps: SequenceCaps,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open corpus {}: {err}",
                path.display()
            ))
        })?;

        let mut pairs = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DialogueRecord = serde_json::from_str(&line).map_err(|err| {
                TrainingError::initialization(format!(
                    "{}:{}: malformed dialogue record: {err}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            pairs.push(vocabulary.encode_pair(&record.prompt, &record.reply, caps)?);
        }

        info!(path = %path.display(), pairs = pairs.len(), "loaded dialogue corpus");
        Ok(Self {
            samples: PairDataset::new(pairs),
        })
    }
}

impl DialogueDataset for JsonlDialogueCorpus {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<(Vec<u32>, Vec<u32>)> {
        self.samples.get(index)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    pub(crate) const WORDS: &[&str] = &[
        "<pad>", "<bos>", "<eos>", "<unk>", "hello", "there", "how", "are", "you", "fine",
        "thanks", "bye",
    ];

    pub(crate) fn write_tokenizer(dir: &Path) -> PathBuf {
        let vocab: serde_json::Map<String, serde_json::Value> = WORDS
            .iter()
            .enumerate()
            .map(|(id, word)| (word.to_string(), serde_json::json!(id)))
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        let path = dir.join("tokenizer.json");
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        path
    }

    #[test]
    fn pair_dataset_reports_out_of_range() {
        let dataset = PairDataset::new(vec![(vec![1], vec![2])]);
        assert_eq!(dataset.len(), 1);
        assert!(dataset.get(1).is_err());
    }

    #[test]
    fn tokenizer_vocabulary_finds_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = TokenizerVocabulary::from_file(write_tokenizer(dir.path())).unwrap();
        assert_eq!(vocab.padding_index(), 0);
        assert_eq!(vocab.bos_id(), 1);
        assert_eq!(vocab.eos_id(), 2);
        assert_eq!(vocab.size(), WORDS.len());
        assert_eq!(vocab.encode("hello there").unwrap(), vec![4, 5]);
    }

    #[test]
    fn encodes_prompt_tail_and_framed_reply() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = TokenizerVocabulary::from_file(write_tokenizer(dir.path())).unwrap();
        let caps = SequenceCaps::from_max_seq_len(4);

        let (prompt, label) = vocab
            .encode_pair("hello there how are you", "fine", caps)
            .unwrap();
        assert_eq!(prompt, vec![5, 6, 7, 8]);
        assert_eq!(label, vec![1]);

        let caps = SequenceCaps::from_max_seq_len(16);
        let (prompt, label) = vocab.encode_pair("hello", "fine thanks", caps).unwrap();
        assert_eq!(prompt.len(), 16);
        assert_eq!(&prompt[..2], &[4, 0]);
        assert_eq!(label, vec![1, 9, 10, 2]);
    }

    #[test]
    fn loads_jsonl_and_reports_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = TokenizerVocabulary::from_file(write_tokenizer(dir.path())).unwrap();
        let caps = SequenceCaps::from_max_seq_len(16);

        let good = dir.path().join("good.jsonl");
        fs::write(
            &good,
            "{\"prompt\": \"hello\", \"reply\": \"hello there\"}\n\n{\"prompt\": \"how are you\", \"reply\": \"fine\"}\n",
        )
        .unwrap();
        let corpus = JsonlDialogueCorpus::load(&good, &vocab, caps).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(1).unwrap().1, vec![1, 9, 2, 0]);

        let bad = dir.path().join("bad.jsonl");
        fs::write(&bad, "{\"prompt\": \"hello\"}\n").unwrap();
        let err = JsonlDialogueCorpus::load(&bad, &vocab, caps).unwrap_err();
        assert!(err.to_string().contains(":1:"), "{err}");
    }
}
