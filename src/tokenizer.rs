//! This module contains the [`Tokenizer`] trait, the only capability the guides require from the host model runtime.
use std::fmt::Debug;
use std::sync::Arc;

use crate::vocabulary::{Token, Vocabulary};

/// The tokenizer capability consumed by every guide.
///
/// Implementations wrap whatever tokenizer the host runtime uses. The guides only need a stable
/// vocabulary, the identity of the end-of-sequence token and a way to turn token IDs back into text.
pub trait Tokenizer: Debug + Send + Sync {
    /// The vocabulary of the tokenizer. It must not change during the lifetime of a guide.
    fn vocabulary(&self) -> &Vocabulary;
    /// The ID of the end-of-sequence token.
    fn eos_token_id(&self) -> u32;
    /// The text form of the end-of-sequence token.
    fn eos_token(&self) -> &str;
    /// Decodes every token ID into its text.
    fn decode(&self, token_ids: &[u32]) -> Vec<String>;
}

/// A shared, type-erased [`Tokenizer`].
pub type SharedTokenizer = Arc<dyn Tokenizer>;

/// A [`Tokenizer`] backed only by a [`Vocabulary`].
///
/// Decoding a token yields its vocabulary string, so this is suitable for tokenizers whose tokens
/// are plain text pieces.
#[derive(Debug, Clone)]
pub struct VocabularyTokenizer {
    vocabulary: Arc<Vocabulary>,
    eos_token_id: u32,
    eos_token: String,
}

#[derive(Debug, thiserror::Error)]
/// The error type for [`VocabularyTokenizer`] creation.
pub enum CreateTokenizerError {
    /// The end-of-sequence token is not part of the vocabulary.
    #[error("The end-of-sequence token ID {0} does not exist in the vocabulary.")]
    UnknownEosTokenID(u32),
}

impl VocabularyTokenizer {
    /// Creates a new [`VocabularyTokenizer`].
    ///
    /// # Errors
    ///
    /// Returns [`CreateTokenizerError::UnknownEosTokenID`] when `eos_token_id` is not in the vocabulary.
    pub fn new(
        vocabulary: Arc<Vocabulary>,
        eos_token_id: u32,
    ) -> Result<Self, CreateTokenizerError> {
        let eos_token = vocabulary
            .token_string(eos_token_id)
            .ok_or(CreateTokenizerError::UnknownEosTokenID(eos_token_id))?
            .to_string();
        Ok(Self {
            vocabulary,
            eos_token_id,
            eos_token,
        })
    }

    /// Wraps the tokenizer into a [`SharedTokenizer`].
    pub fn into_shared(self) -> SharedTokenizer {
        Arc::new(self)
    }
}

impl Tokenizer for VocabularyTokenizer {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn decode(&self, token_ids: &[u32]) -> Vec<String> {
        token_ids
            .iter()
            .map(|&token_id| match self.vocabulary.token_string(token_id) {
                Some(x) => x.to_string(),
                None => self
                    .vocabulary
                    .token(token_id)
                    .map(|Token(bytes)| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default(),
            })
            .collect()
    }
}
