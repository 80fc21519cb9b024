use std::path::Path;

use tokenizers::{AddedToken, Tokenizer as HfTokenizer};
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_EOS_TOKEN: &str = "<|endoftext|>";
pub const DEFAULT_PAD_TOKEN: &str = "<|pad|>";

fn tokenizer_err(e: impl std::fmt::Display) -> Error {
    Error::Tokenizer(e.to_string())
}

/// Text <-> token id mapping with resolved EOS and padding ids.
///
/// GPT-2 vocabularies ship without a padding token; one is appended as a
/// special token when missing, growing the vocabulary by one.
pub struct Tokenizer {
    inner: HfTokenizer,
    pad_token_id: u32,
    eos_token_id: u32,
}

impl Tokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(tokenizer_err)?;
        Self::with_specials(inner, DEFAULT_EOS_TOKEN, DEFAULT_PAD_TOKEN)
    }

    pub fn from_pretrained(identifier: &str) -> Result<Self> {
        let inner = HfTokenizer::from_pretrained(identifier, None).map_err(tokenizer_err)?;
        Self::with_specials(inner, DEFAULT_EOS_TOKEN, DEFAULT_PAD_TOKEN)
    }

    /// Loads a serialized `tokenizer.json`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = HfTokenizer::from_bytes(bytes).map_err(tokenizer_err)?;
        Self::with_specials(inner, DEFAULT_EOS_TOKEN, DEFAULT_PAD_TOKEN)
    }

    /// Resolves `eos` (must exist) and `pad` (added if absent).
    pub fn with_specials(mut inner: HfTokenizer, eos: &str, pad: &str) -> Result<Self> {
        let eos_token_id = inner
            .token_to_id(eos)
            .ok_or_else(|| Error::Tokenizer(format!("EOS token {eos:?} not in vocabulary")))?;
        let pad_token_id = match inner.token_to_id(pad) {
            Some(id) => id,
            None => {
                inner.add_special_tokens(&[AddedToken::from(pad.to_string(), true)]);
                let id = inner.token_to_id(pad).ok_or_else(|| {
                    Error::Tokenizer(format!("failed to add padding token {pad:?}"))
                })?;
                info!("Added padding token {:?} with id {}", pad, id);
                id
            }
        };
        Ok(Self {
            inner,
            pad_token_id,
            eos_token_id,
        })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(tokenizer_err)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<Vec<Vec<u32>>> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), add_special_tokens)
            .map_err(tokenizer_err)?;
        Ok(encodings
            .into_iter()
            .map(|e| e.get_ids().to_vec())
            .collect())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(tokenizer_err)
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// Word-level tokenizer over `words`, with `<|endoftext|>` as id 0 and
/// `<unk>` as id 1. Whitespace pre-tokenization.
#[cfg(test)]
pub(crate) fn word_level_fixture(words: &[&str]) -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert(DEFAULT_EOS_TOKEN.to_string(), 0.into());
    vocab.insert("<unk>".to_string(), 1.into());
    for (i, w) in words.iter().enumerate() {
        vocab.insert(w.to_string(), (i + 2).into());
    }
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 0,
            "content": DEFAULT_EOS_TOKEN,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specials_resolved_and_pad_added() {
        let tokenizer = word_level_fixture(&["she", "first", "saw"]);
        assert_eq!(tokenizer.eos_token_id(), 0);
        // 5 base entries plus the appended pad token.
        assert_eq!(tokenizer.vocab_size(), 6);
        assert_eq!(tokenizer.pad_token_id(), 5);
    }

    #[test]
    fn test_encode_decode() {
        let tokenizer = word_level_fixture(&["she", "first", "saw"]);
        let ids = tokenizer.encode("<|endoftext|>she first", false).unwrap();
        assert_eq!(ids, vec![0, 2, 3]);
        assert_eq!(tokenizer.decode(&[4], false).unwrap(), "saw");
        assert_eq!(tokenizer.encode("nobody", false).unwrap(), vec![1]);
        assert_eq!(
            tokenizer.encode_batch(&["she", "saw"], false).unwrap(),
            vec![vec![2], vec![4]]
        );
    }

    #[test]
    fn test_missing_eos_is_an_error() {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": { "<unk>": 0 }, "unk_token": "<unk>" }
        });
        assert!(matches!(
            Tokenizer::from_bytes(json.to_string().as_bytes()),
            Err(Error::Tokenizer(_))
        ));
    }
}
