//! The module that contains the [`StopGuide`], which allows any token until a stop token or the token budget is reached.
use crate::guide_like::{sealed, GuideLike, GuideState};
use crate::tokenizer::SharedTokenizer;

/// A two-state guide.
///
/// In [`StopGuide::GENERATING`] every token of the vocabulary is allowed. The guide moves to
/// [`StopGuide::STOPPED`] once the stop token is emitted or the token budget is exhausted, after
/// which only the stop token is allowed.
#[derive(Debug, Clone)]
pub struct StopGuide {
    tokenizer: SharedTokenizer,
    stop_token_id: u32,
    max_tokens: Option<usize>,
    num_tokens_generated: usize,
    vocabulary_token_ids: Vec<u32>,
}

impl StopGuide {
    /// The state in which any token is allowed.
    pub const GENERATING: GuideState = GuideState(0);
    /// The state in which only the stop token is allowed.
    pub const STOPPED: GuideState = GuideState(1);

    /// Creates a new [`StopGuide`].
    ///
    /// # Arguments
    ///
    /// * `tokenizer` - The tokenizer whose vocabulary is allowed while generating.
    /// * `stop_token_id` - The token that stops the generation. It is usually the end-of-sequence token.
    /// * `max_tokens` - The token budget shared by all lanes. `None` means unlimited.
    pub fn new(tokenizer: SharedTokenizer, stop_token_id: u32, max_tokens: Option<usize>) -> Self {
        let vocabulary_token_ids = tokenizer.vocabulary().token_ids().collect();
        Self {
            tokenizer,
            stop_token_id,
            max_tokens,
            num_tokens_generated: 0,
            vocabulary_token_ids,
        }
    }

    /// The stop token ID.
    pub fn stop_token_id(&self) -> u32 {
        self.stop_token_id
    }

    /// The number of tokens generated so far, as counted on lane `0`.
    pub fn num_tokens_generated(&self) -> usize {
        self.num_tokens_generated
    }
}

impl sealed::Sealed for StopGuide {}

impl GuideLike for StopGuide {
    fn allowed_token_ids(&mut self, state: GuideState, _lane: usize) -> Vec<u32> {
        if state == Self::STOPPED {
            vec![self.stop_token_id]
        } else {
            self.vocabulary_token_ids.clone()
        }
    }

    fn next_state(&mut self, state: GuideState, token_id: u32, lane: usize) -> GuideState {
        if lane == 0 {
            self.num_tokens_generated += 1;
        }
        if state == Self::STOPPED || token_id == self.stop_token_id {
            return Self::STOPPED;
        }
        match self.max_tokens {
            Some(max_tokens) if self.num_tokens_generated >= max_tokens => Self::STOPPED,
            _ => Self::GENERATING,
        }
    }

    fn is_final_state(&self, state: GuideState, _lane: usize) -> bool {
        state == Self::STOPPED
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
    use std::sync::Arc;

    use super::*;
    use crate::tokenizer::VocabularyTokenizer;
    use crate::vocabulary::Vocabulary;

    fn tokenizer() -> SharedTokenizer {
        let vocabulary = Vocabulary::from_token_strings([
            (0, "a".to_string()),
            (1, "b".to_string()),
            (2, "</s>".to_string()),
        ])
        .unwrap();
        VocabularyTokenizer::new(Arc::new(vocabulary), 2)
            .unwrap()
            .into_shared()
    }

    #[test]
    fn stops_on_stop_token() {
        let mut guide = StopGuide::new(tokenizer(), 2, None);
        assert_eq!(guide.allowed_token_ids(GuideState::INITIAL, 0), vec![0, 1, 2]);
        let state = guide.next_state(GuideState::INITIAL, 0, 0);
        assert!(!guide.is_final_state(state, 0));
        let state = guide.next_state(state, 2, 0);
        assert!(guide.is_final_state(state, 0));
        assert_eq!(guide.allowed_token_ids(state, 0), vec![2]);
    }

    #[test]
    fn only_lane_zero_counts() {
        let mut guide = StopGuide::new(tokenizer(), 2, Some(2));
        let state = guide.next_state(GuideState::INITIAL, 0, 1);
        assert_eq!(state, StopGuide::GENERATING);
        let state = guide.next_state(state, 0, 0);
        assert_eq!(state, StopGuide::GENERATING);
        assert_eq!(guide.num_tokens_generated(), 1);
        let state = guide.next_state(state, 1, 0);
        assert_eq!(state, StopGuide::STOPPED);
        guide.reset();
        assert_eq!(guide.num_tokens_generated(), 0);
    }
}
