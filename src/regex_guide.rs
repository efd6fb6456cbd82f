//! The module that contains the [`RegexGuide`], which constrains generation to a regular language.
use std::sync::Arc;

use crate::automaton::{Automaton, PatternError};
use crate::config::Config;
use crate::guide_like::{sealed, GuideLike, GuideState};
use crate::index::{CreateIndexError, Index};
use crate::tokenizer::SharedTokenizer;

#[derive(Debug, thiserror::Error)]
/// The error type for [`RegexGuide`] creation.
pub enum CreateRegexGuideError {
    #[error("{0}")] // inherits the error message from the wrapped PatternError
    /// A wrapper for the [`PatternError`] error type.
    PatternError(#[from] PatternError),
    #[error(
        "The vocabulary of the tokenizer({vocab_size} tokens) \
        does not allow us to build a sequence that matches the regex {pattern:?}."
    )]
    /// No token sequence in the vocabulary reaches a final state of the regex.
    VocabularyInfeasible {
        /// The regex.
        pattern: String,
        /// The vocabulary size of the tokenizer.
        vocab_size: usize,
    },
}

/// A guide that wraps one compiled [`Automaton`] and its vocabulary [`Index`].
///
/// The automaton states are the guide states, with [`GuideState::END`] as an extra absorbing final state
/// reached by emitting the end-of-sequence token.
#[derive(Debug, Clone)]
pub struct RegexGuide {
    index: Arc<Index>,
    tokenizer: SharedTokenizer,
    max_tokens: Option<usize>,
    num_tokens_generated: usize,
}

impl RegexGuide {
    /// Creates a new [`RegexGuide`] with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateRegexGuideError`] when the pattern is malformed or the vocabulary cannot
    /// produce any string of the regular language.
    pub fn new(
        pattern: &str,
        tokenizer: SharedTokenizer,
        max_tokens: Option<usize>,
    ) -> Result<Self, CreateRegexGuideError> {
        Self::with_config(pattern, tokenizer, max_tokens, &Config::default())
    }

    /// Creates a new [`RegexGuide`] with the given [`Config`].
    ///
    /// # Arguments
    ///
    /// * `pattern` - The regular expression. The whole generated text must match it.
    /// * `tokenizer` - The tokenizer of the language model.
    /// * `max_tokens` - The token budget shared by all lanes. `None` means unlimited.
    /// * `config` - The configuration of the guide.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateRegexGuideError`] when the pattern is malformed or the vocabulary cannot
    /// produce any string of the regular language.
    pub fn with_config(
        pattern: &str,
        tokenizer: SharedTokenizer,
        max_tokens: Option<usize>,
        config: &Config,
    ) -> Result<Self, CreateRegexGuideError> {
        let index = Self::build_index(pattern, &tokenizer, config)?;
        Ok(Self::from_index(Arc::new(index), tokenizer, max_tokens))
    }

    /// Creates a new [`RegexGuide`] from an already built [`Index`].
    ///
    /// The index must have been built against the vocabulary and end-of-sequence token of `tokenizer`.
    pub fn from_index(
        index: Arc<Index>,
        tokenizer: SharedTokenizer,
        max_tokens: Option<usize>,
    ) -> Self {
        debug_assert_eq!(index.eos_token_id(), tokenizer.eos_token_id());
        Self {
            index,
            tokenizer,
            max_tokens,
            num_tokens_generated: 0,
        }
    }

    pub(crate) fn build_index(
        pattern: &str,
        tokenizer: &SharedTokenizer,
        config: &Config,
    ) -> Result<Index, CreateRegexGuideError> {
        let automaton = Automaton::compile_with_config(pattern, &config.regex_config)?;
        let vocabulary = tokenizer.vocabulary();
        Index::new(automaton, vocabulary, tokenizer.eos_token_id()).map_err(|e| match e {
            CreateIndexError::VocabularyInfeasible(pattern) => {
                CreateRegexGuideError::VocabularyInfeasible {
                    pattern,
                    vocab_size: vocabulary.vocab_size(),
                }
            }
        })
    }

    /// The vocabulary index of the guide. It can be shared with other guides through [`RegexGuide::from_index`].
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// The number of tokens generated so far, as counted on lane `0`.
    pub fn num_tokens_generated(&self) -> usize {
        self.num_tokens_generated
    }
}

impl sealed::Sealed for RegexGuide {}

impl GuideLike for RegexGuide {
    fn allowed_token_ids(&mut self, state: GuideState, _lane: usize) -> Vec<u32> {
        state
            .automaton_state()
            .and_then(|state| self.index.allowed_token_ids(state))
            .unwrap_or_else(|| vec![self.index.eos_token_id()])
    }

    fn next_state(&mut self, state: GuideState, token_id: u32, lane: usize) -> GuideState {
        if lane == 0 {
            self.num_tokens_generated += 1;
        }
        if token_id == self.index.eos_token_id() || state == GuideState::END {
            return GuideState::END;
        }
        if let Some(max_tokens) = self.max_tokens {
            if self.num_tokens_generated >= max_tokens {
                return GuideState::END;
            }
        }
        match state
            .automaton_state()
            .and_then(|state| self.index.next_state(state, token_id))
        {
            Some(next_state) => next_state.into(),
            None => {
                log::warn!(
                    "Token ID {} is not allowed in state {} of the regex {:?}. \
                    The lane is moved to the end state.",
                    token_id,
                    state,
                    self.index.automaton().pattern()
                );
                GuideState::END
            }
        }
    }

    fn is_final_state(&self, state: GuideState, _lane: usize) -> bool {
        state == GuideState::END
            || state
                .automaton_state()
                .is_some_and(|state| self.index.is_final(state))
    }

    fn reset(&mut self) {
        self.num_tokens_generated = 0;
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocabulary().vocab_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::VocabularyTokenizer;
    use crate::vocabulary::Vocabulary;

    fn tokenizer(tokens: &[&str], eos_token_id: u32) -> SharedTokenizer {
        let vocabulary = Vocabulary::from_token_strings(
            tokens
                .iter()
                .enumerate()
                .map(|(i, x)| (i as u32, x.to_string())),
        )
        .unwrap();
        VocabularyTokenizer::new(Arc::new(vocabulary), eos_token_id)
            .unwrap()
            .into_shared()
    }

    #[test]
    fn integer_regex() {
        let tokenizer = tokenizer(&["blah", "1a", "2", "0", "<eos>"], 4);
        let mut guide = RegexGuide::new("0|[1-9][0-9]*", tokenizer, None).unwrap();
        assert_eq!(guide.allowed_token_ids(GuideState::INITIAL, 0), vec![2, 3]);
        let state = guide.next_state(GuideState::INITIAL, 2, 0);
        assert!(guide.is_final_state(state, 0));
        assert_eq!(guide.allowed_token_ids(state, 0), vec![2, 3, 4]);
        let end = guide.next_state(state, 4, 0);
        assert_eq!(end, GuideState::END);
        assert!(guide.is_final_state(end, 0));
        assert_eq!(guide.allowed_token_ids(end, 0), vec![4]);
    }

    #[test]
    fn forced_token_leads_to_end() {
        let tokenizer = tokenizer(&["a", "b", "<eos>"], 2);
        let mut guide = RegexGuide::new("a+", tokenizer, None).unwrap();
        assert_eq!(
            guide.next_state(GuideState::INITIAL, 1, 0),
            GuideState::END
        );
        assert_eq!(
            guide.next_state(GuideState(1000), 0, 0),
            GuideState::END
        );
    }

    #[test]
    fn token_budget() {
        let tokenizer = tokenizer(&["a", "<eos>"], 1);
        let mut guide = RegexGuide::new("a+", tokenizer, Some(2)).unwrap();
        let state = guide.next_state(GuideState::INITIAL, 0, 0);
        assert_ne!(state, GuideState::END);
        // Other lanes never touch the budget.
        let other = guide.next_state(state, 0, 3);
        assert_ne!(other, GuideState::END);
        assert_eq!(guide.next_state(state, 0, 0), GuideState::END);
        guide.reset();
        assert_ne!(guide.next_state(GuideState::INITIAL, 0, 0), GuideState::END);
    }

    #[test]
    fn malformed_pattern() {
        let tokenizer = tokenizer(&["a", "<eos>"], 1);
        assert!(matches!(
            RegexGuide::new("a(", tokenizer, None),
            Err(CreateRegexGuideError::PatternError(_))
        ));
    }
}
