//! Mapping between text tokens and model class indices.
//!
//! Every mapping starts with the four control tokens `<B>` (blank), `<S>`
//! (start of sequence), `<E>` (end of sequence) and `<P>` (padding), followed
//! by the printable characters. The number of entries is the number of
//! classes a model predicts.

use crate::core::constants::{CONTROL_TOKENS, END_INDEX, PADDING_INDEX, START_INDEX};
use crate::core::{RecResult, RecognitionError};
use std::collections::HashMap;
use std::path::Path;

/// Ordered token vocabulary with reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterMapping {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
    start_index: u32,
    end_index: u32,
    padding_index: u32,
}

impl CharacterMapping {
    /// Creates a mapping from a sequence of printable characters.
    ///
    /// Control tokens are prepended. Characters already present are skipped
    /// so that each token maps to a single index. A single character can
    /// never be empty or spell a control token, so this cannot fail.
    pub fn new(characters: impl IntoIterator<Item = char>) -> Self {
        let mut mapping = Self::with_control_tokens();
        for c in characters {
            mapping.push(c.to_string());
        }
        mapping
    }

    /// Creates a mapping from printable tokens.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when a token is empty or is one of the control tokens.
    pub fn from_tokens(tokens: impl IntoIterator<Item = String>) -> RecResult<Self> {
        let mut mapping = Self::with_control_tokens();
        for token in tokens {
            if token.is_empty() {
                return Err(RecognitionError::invalid_configuration(
                    "mapping tokens cannot be empty",
                ));
            }
            if CONTROL_TOKENS.contains(&token.as_str()) {
                return Err(RecognitionError::invalid_configuration(format!(
                    "control token {} cannot appear in the character list",
                    token
                )));
            }
            mapping.push(token);
        }
        Ok(mapping)
    }

    fn with_control_tokens() -> Self {
        let tokens: Vec<String> = CONTROL_TOKENS.iter().map(|t| t.to_string()).collect();
        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            tokens,
            index,
            start_index: START_INDEX,
            end_index: END_INDEX,
            padding_index: PADDING_INDEX,
        }
    }

    /// Appends `token` unless it is already mapped.
    fn push(&mut self, token: String) {
        if self.index.contains_key(&token) {
            return;
        }
        self.index.insert(token.clone(), self.tokens.len() as u32);
        self.tokens.push(token);
    }

    /// Loads printable tokens from a file, one token per line.
    ///
    /// Blank lines are skipped. A line holding a single space is kept as the
    /// space token.
    pub fn from_file(path: impl AsRef<Path>) -> RecResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let tokens = contents
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(|line| {
                if line.trim().is_empty() {
                    " ".to_string()
                } else {
                    line.to_string()
                }
            });
        let mapping = Self::from_tokens(tokens)?;
        tracing::debug!(
            "loaded {} tokens from {}",
            mapping.len(),
            path.display()
        );
        Ok(mapping)
    }

    /// Number of classes, control tokens included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false: the control tokens are always present.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of a token, if present.
    pub fn index_of(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    /// Token at an index, if in range.
    pub fn token(&self, index: u32) -> Option<&str> {
        self.tokens.get(index as usize).map(String::as_str)
    }

    /// All tokens in class order.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Index of `<S>`.
    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    /// Index of `<E>`.
    pub fn end_index(&self) -> u32 {
        self.end_index
    }

    /// Index of `<P>`.
    pub fn padding_index(&self) -> u32 {
        self.padding_index
    }

    /// Tokens that metrics and decoding skip: `<S>`, `<E>` and `<P>`.
    pub fn ignore_tokens(&self) -> [u32; 3] {
        [self.start_index, self.end_index, self.padding_index]
    }

    /// Encodes a text line as `<S> chars… <E>` followed by `<P>` up to `max_length`.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` when a character is not in the mapping.
    /// * `InvalidInput` when the encoded line does not fit in `max_length`.
    pub fn encode(&self, text: &str, max_length: usize) -> RecResult<Vec<u32>> {
        let mut ids = Vec::with_capacity(max_length);
        ids.push(self.start_index);
        for ch in text.chars() {
            let mut buf = [0u8; 4];
            let id = self.index_of(ch.encode_utf8(&mut buf)).ok_or_else(|| {
                RecognitionError::invalid_input(format!("character {:?} is not in the mapping", ch))
            })?;
            ids.push(id);
        }
        ids.push(self.end_index);

        if ids.len() > max_length {
            return Err(RecognitionError::invalid_input(format!(
                "encoded line needs {} tokens but max_length is {}",
                ids.len(),
                max_length
            )));
        }
        ids.resize(max_length, self.padding_index);
        Ok(ids)
    }

    /// Decodes class indices into text.
    ///
    /// Control tokens are skipped and decoding stops at the first `<E>`.
    /// Indices outside the mapping are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        for &id in ids {
            if id == self.end_index {
                break;
            }
            if id == self.start_index || id == self.padding_index || id == 0 {
                continue;
            }
            if let Some(token) = self.token(id) {
                text.push_str(token);
            }
        }
        text
    }
}
