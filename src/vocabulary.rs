//! This module contains the `Vocabulary` struct, which represents a language model's vocabulary.
use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use serde::Deserialize;
use std::array;
use std::collections::hash_map::Entry;
use std::fmt::Debug;

use crate::utils;
use crate::utils::ByteSet;

/// A wrapper struct that represents a token in bytes in a language model's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[repr(transparent)]
pub struct Token(pub Box<[u8]>);

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.as_bytes().to_vec().into_boxed_slice())
    }
}

/// The struct represents a language model's vocabulary.
///
/// Token ids are dense-ish non-negative integers assigned by the tokenizer. The mapping is immutable
/// once built, so a [`Vocabulary`] is usually wrapped in an [`Arc`](std::sync::Arc) and shared by every guide.
#[derive(Clone)]
pub struct Vocabulary {
    pub(crate) token_to_id: AHashMap<Token, u32>,
    pub(crate) id_to_token: AHashMap<u32, Token>,
    pub(crate) id_to_token_string: AHashMap<u32, String>,
    pub(crate) first_byte_to_token_ids: Vec<FixedBitSet>,
    vocab_size: usize,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("vocab_size", &self.vocab_size())
            .field(
                "id_to_token_string",
                &utils::get_deterministic_display_form_from_hash_map(
                    &self.id_to_token_string,
                    |(k, v)| (*k, utils::get_display_form_from_token_string(v)),
                ),
            )
            .field(
                "first_byte_to_token_ids",
                &self
                    .first_byte_to_token_ids
                    .iter()
                    .enumerate()
                    .filter(|(_, x)| !x.is_clear())
                    .map(|(byte, x)| (byte, utils::get_display_form_from_bitset(x)))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for [Vocabulary] creation.
pub enum CreateVocabularyError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("The vocabulary size is {0}, while the maximum supported is {1}.")]
    VocabularyTooLarge(usize, usize),
}

impl Vocabulary {
    /// Creates a new [Vocabulary] from the bytes and the text of every token.
    ///
    /// The text is kept separately because a token may hold a partial UTF-8 sequence, so its bytes
    /// and its text do not always round-trip. Guides match on bytes and report text.
    ///
    /// # Errors
    ///
    /// Returns [`CreateVocabularyError::VocabularyTooLarge`] when there are `2^24` tokens or more.
    pub fn new(
        id_to_token: AHashMap<u32, Token>,
        id_to_token_string: AHashMap<u32, String>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        if id_to_token.len() >= 0x1000000 {
            return Err(CreateVocabularyError::VocabularyTooLarge(
                id_to_token.len(),
                0x1000000,
            ));
        }
        let mut token_to_id = AHashMap::with_capacity(id_to_token.len());
        for (&token_id, token) in id_to_token.iter() {
            match token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "Token IDs {} and {} have the same bytes. Both can be generated, \
                        but looking the bytes up yields {}.",
                        entry.get(),
                        token_id,
                        entry.get()
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(token_id);
                }
            }
        }
        let vocab_size = id_to_token
            .keys()
            .copied()
            .max()
            .map(|x| x + 1)
            .unwrap_or(0) as usize;
        let mut temp: [Vec<u32>; 256] = array::from_fn(|_| (vec![]));
        for (&token_id, token) in id_to_token.iter() {
            if token.0.is_empty() {
                log::warn!(
                    "Token ID {} corresponds to an empty token. \
                    The token will never be admitted by any guide.",
                    token_id
                );
                continue;
            }
            temp[token.0[0] as usize].push(token_id);
        }
        let first_byte_to_token_ids = temp
            .into_iter()
            .map(|token_ids| {
                let mut set = FixedBitSet::with_capacity(vocab_size);
                for token_id in token_ids {
                    set.insert(token_id as usize);
                }
                set
            })
            .collect();
        Self::check_vocabulary_utf8_support(&token_to_id);
        Ok(Self {
            token_to_id,
            id_to_token,
            id_to_token_string,
            first_byte_to_token_ids,
            vocab_size,
        })
    }

    /// Creates a new instance of [Vocabulary] from token strings only.
    ///
    /// The bytes of every token are the UTF-8 bytes of its string,
    /// which is correct for tokenizers that do not emit partial UTF-8 sequences.
    pub fn from_token_strings(
        id_to_token_string: impl IntoIterator<Item = (u32, String)>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        let id_to_token_string: AHashMap<u32, String> = id_to_token_string.into_iter().collect();
        let id_to_token = id_to_token_string
            .iter()
            .map(|(&k, v)| (k, Token::from(v.as_str())))
            .collect();
        Self::new(id_to_token, id_to_token_string)
    }

    fn check_vocabulary_utf8_support(token_to_id: &AHashMap<Token, u32>) {
        let mut present_bytes = utils::new_byte_set();
        for token in token_to_id.keys() {
            for &byte in token.0.iter() {
                present_bytes.insert(byte as usize);
            }
        }
        let mut not_existing_bytes = utils::new_byte_set();
        for byte in 0..=247usize {
            if !present_bytes.contains(byte) {
                not_existing_bytes.insert(byte);
            }
        }
        // Small hand-written vocabularies never cover every byte.
        if !not_existing_bytes.is_clear() && token_to_id.len() > 256 {
            log::warn!(
                "No token contains the bytes {:?}. Patterns that need them cannot be generated. \
                Check that the vocabulary holds the raw token bytes rather than decoded text.",
                utils::get_display_form_from_bitset_on_stack(&not_existing_bytes)
            );
        }
    }

    /// The bytes of the token, or `None` for an unknown token ID.
    pub fn token(&self, token_id: u32) -> Option<&Token> {
        self.id_to_token.get(&token_id)
    }

    /// The text of the token as reported by the tokenizer, or `None` for an unknown token ID.
    pub fn token_string(&self, token_id: u32) -> Option<&str> {
        self.id_to_token_string.get(&token_id).map(|x| x.as_str())
    }

    /// The ID of the token. When several IDs share the same bytes, only one of them is returned.
    pub fn token_id(&self, token: &Token) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Retrieves the size of the vocabulary, i.e. the largest token ID plus one.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Iterates over all token IDs in ascending order.
    pub fn token_ids(&self) -> impl Iterator<Item = u32> + '_ {
        let mut ids: Vec<u32> = self.id_to_token.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
    }

    /// Iterates over the IDs of the tokens starting with any of the given bytes.
    pub(crate) fn token_ids_from_first_bytes<'a>(
        &'a self,
        first_bytes: &'a ByteSet,
    ) -> impl Iterator<Item = u32> + 'a {
        first_bytes.ones().flat_map(move |byte| {
            self.first_byte_to_token_ids[byte]
                .ones()
                .map(|token_id| token_id as u32)
        })
    }
}
