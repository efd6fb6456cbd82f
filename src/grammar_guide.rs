//! The module that contains the [`GrammarGuide`], which constrains generation to a context free language.
use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;

use crate::config::Config;
use crate::grammar::{CreateGrammarError, Grammar, TerminalID};
use crate::guide_like::{sealed, GuideLike, GuideState};
use crate::index::Index;
use crate::parser::{CreateParserError, Parser};
use crate::regex_guide::{CreateRegexGuideError, RegexGuide};
use crate::tokenizer::SharedTokenizer;

#[derive(Debug, thiserror::Error)]
/// The error type for [`GrammarGuide`] creation.
pub enum CreateGrammarGuideError {
    #[error("{0}")] // inherits the error message from the wrapped CreateGrammarError
    /// A wrapper for the [`CreateGrammarError`] error type.
    GrammarError(#[from] CreateGrammarError),
    #[error("{0}")] // inherits the error message from the wrapped CreateParserError
    /// A wrapper for the [`CreateParserError`] error type.
    ParserError(#[from] CreateParserError),
    #[error("{0}")] // inherits the error message from the wrapped CreateRegexGuideError
    /// A wrapper for the [`CreateRegexGuideError`] error type.
    RegexGuideError(#[from] CreateRegexGuideError),
}

/// The outer state of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum LanePhase {
    /// No slice has been selected yet.
    SelectingSlice,
    /// A regex guide is active.
    Delegating,
    /// Only the end-of-sequence token is allowed from now on.
    Done,
}

#[derive(Debug, Clone)]
struct Lane {
    generation: String,
    regex_guide: Option<RegexGuide>,
    pending_reset: bool,
    allow_eos: bool,
    phase: LanePhase,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            generation: String::new(),
            regex_guide: None,
            pending_reset: false,
            allow_eos: false,
            phase: LanePhase::SelectingSlice,
        }
    }
}

/// What the parser frontier allows after some text.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slice {
    /// Only the end of input is acceptable.
    End,
    /// The union of the patterns of the acceptable terminals.
    Pattern { pattern: String, allow_eos: bool },
}

fn select_slice(parser: &Parser, text: &str) -> Slice {
    let accepts = match parser.parse_prefix(text) {
        Ok(interactive) => interactive.accepts(),
        Err(e) => panic!(
            "The generated text {:?} is not a prefix of the grammar: {}. \
            This usually means the lexer resolves the grammar's terminals ambiguously.",
            text, e
        ),
    };
    if accepts.iter().all(|&x| x == TerminalID::END) {
        return Slice::End;
    }
    let grammar = parser.grammar();
    let mut options: BTreeSet<&str> = accepts
        .iter()
        .filter(|&&x| x != TerminalID::END)
        .map(|&x| grammar.terminal(x).pattern())
        .collect();
    let allow_eos = accepts.contains(&TerminalID::END);
    if allow_eos {
        options.insert("");
        assert!(
            options.len() > 1,
            "The frontier after {:?} has no terminal besides the end of input.",
            text
        );
    }
    let pattern = format!(
        "({})",
        options
            .iter()
            .map(|x| format!("({})", x))
            .collect::<Vec<_>>()
            .join("|")
    );
    Slice::Pattern { pattern, allow_eos }
}

/// A guide that drives a sequence of [`RegexGuide`]s, one per slice of the grammar's derivation.
///
/// For every lane, the text generated so far is lexed and parsed incrementally. The terminals the
/// parser accepts next form the slice: the union of their patterns becomes a fresh [`RegexGuide`]
/// which is followed until it can only end. When the end of input is among the acceptable
/// terminals, the end-of-sequence token is offered alongside the other terminals for exactly that step.
///
/// Compiled slices are cached by pattern when [`GuideConfig::cache_enabled`](crate::config::GuideConfig::cache_enabled)
/// is set, and the cache survives [`GuideLike::reset`].
#[derive(Debug, Clone)]
pub struct GrammarGuide {
    parser: Arc<Parser>,
    tokenizer: SharedTokenizer,
    config: Config,
    max_tokens: Option<usize>,
    num_tokens_generated: usize,
    lanes: Vec<Lane>,
    index_cache: AHashMap<String, Arc<Index>>,
}

impl GrammarGuide {
    /// Creates a new [`GrammarGuide`] with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarGuideError`] when the grammar is invalid, is not LALR(1) or its first
    /// slice cannot be produced by the vocabulary.
    pub fn new(
        grammar_str: &str,
        tokenizer: SharedTokenizer,
        max_tokens: Option<usize>,
    ) -> Result<Self, CreateGrammarGuideError> {
        Self::with_config(grammar_str, tokenizer, max_tokens, &Config::default())
    }

    /// Creates a new [`GrammarGuide`] with the given [`Config`].
    ///
    /// # Arguments
    ///
    /// * `grammar_str` - The grammar, see [`Grammar::with_config`] for the syntax.
    /// * `tokenizer` - The tokenizer of the language model.
    /// * `max_tokens` - The token budget shared by all lanes. `None` means unlimited.
    /// * `config` - The configuration of the guide.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarGuideError`] when the grammar is invalid, is not LALR(1) or its first
    /// slice cannot be produced by the vocabulary.
    pub fn with_config(
        grammar_str: &str,
        tokenizer: SharedTokenizer,
        max_tokens: Option<usize>,
        config: &Config,
    ) -> Result<Self, CreateGrammarGuideError> {
        let grammar = Grammar::with_config(grammar_str, config)?;
        let parser = Parser::new(grammar)?;
        let mut guide = Self {
            parser: Arc::new(parser),
            tokenizer,
            config: config.clone(),
            max_tokens,
            num_tokens_generated: 0,
            lanes: Vec::new(),
            index_cache: AHashMap::default(),
        };
        if let Slice::Pattern { pattern, .. } = select_slice(&guide.parser, "") {
            guide.slice_index(&pattern)?;
        }
        Ok(guide)
    }

    /// The parser of the grammar.
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// The text generated so far in the lane, if the lane has been addressed since the last reset.
    pub fn generation(&self, lane: usize) -> Option<&str> {
        self.lanes.get(lane).map(|x| x.generation.as_str())
    }

    /// The number of tokens generated so far, as counted on lane `0`.
    pub fn num_tokens_generated(&self) -> usize {
        self.num_tokens_generated
    }

    fn ensure_lane(&mut self, lane: usize) {
        if self.lanes.len() <= lane {
            self.lanes.resize_with(lane + 1, Lane::default);
        }
    }

    fn slice_index(&mut self, pattern: &str) -> Result<Arc<Index>, CreateRegexGuideError> {
        let cache_enabled = self.config.guide_config.cache_enabled;
        if cache_enabled {
            if let Some(index) = self.index_cache.get(pattern) {
                return Ok(index.clone());
            }
        }
        let index = Arc::new(RegexGuide::build_index(
            pattern,
            &self.tokenizer,
            &self.config,
        )?);
        if cache_enabled {
            self.index_cache.insert(pattern.to_string(), index.clone());
        }
        Ok(index)
    }

    fn set_next_regex_guide(&mut self, lane: usize) {
        match select_slice(&self.parser, &self.lanes[lane].generation) {
            Slice::End => {
                self.lanes[lane].phase = LanePhase::Done;
                log::debug!(
                    "Lane {} is {}, only {:?} is allowed from now on.",
                    lane,
                    LanePhase::Done,
                    self.tokenizer.eos_token()
                );
            }
            Slice::Pattern { pattern, allow_eos } => {
                let index = self.slice_index(&pattern).unwrap_or_else(|e| {
                    panic!(
                        "The generation {:?} cannot be continued: {}",
                        self.lanes[lane].generation, e
                    )
                });
                let remaining_tokens = self
                    .max_tokens
                    .map(|x| x.saturating_sub(self.num_tokens_generated));
                let guide = RegexGuide::from_index(index, self.tokenizer.clone(), remaining_tokens);
                let state = &mut self.lanes[lane];
                state.regex_guide = Some(guide);
                state.pending_reset = true;
                if allow_eos {
                    state.allow_eos = true;
                }
                state.phase = LanePhase::Delegating;
                log::debug!(
                    "Lane {} selected the slice {:?} after {:?}.",
                    lane,
                    pattern,
                    state.generation
                );
            }
        }
    }
}

impl sealed::Sealed for GrammarGuide {}

impl GuideLike for GrammarGuide {
    /// # Panics
    ///
    /// Panics when the generated text of the lane cannot be lexed by the grammar or the next slice
    /// cannot be produced by the vocabulary. Both indicate a grammar the guide cannot enforce.
    fn allowed_token_ids(&mut self, state: GuideState, lane: usize) -> Vec<u32> {
        let eos_token_id = self.tokenizer.eos_token_id();
        self.ensure_lane(lane);
        if self.lanes[lane].phase == LanePhase::Done {
            return vec![eos_token_id];
        }
        let lane_state = &mut self.lanes[lane];
        if let Some(guide) = lane_state.regex_guide.as_mut() {
            let state = if lane_state.pending_reset {
                GuideState::INITIAL
            } else {
                state
            };
            let proposal = guide.allowed_token_ids(state, lane);
            if !proposal.contains(&eos_token_id) {
                return proposal;
            }
        }
        self.set_next_regex_guide(lane);
        let lane_state = &mut self.lanes[lane];
        if lane_state.phase == LanePhase::Done {
            return vec![eos_token_id];
        }
        let state = if lane_state.pending_reset {
            GuideState::INITIAL
        } else {
            state
        };
        let Some(guide) = lane_state.regex_guide.as_mut() else {
            return vec![eos_token_id];
        };
        let mut proposal = guide.allowed_token_ids(state, lane);
        if lane_state.allow_eos {
            lane_state.allow_eos = false;
        } else {
            proposal.retain(|&x| x != eos_token_id);
            assert!(
                !proposal.is_empty(),
                "The slice after {:?} only allows the end-of-sequence token.",
                lane_state.generation
            );
        }
        proposal
    }

    fn next_state(&mut self, state: GuideState, token_id: u32, lane: usize) -> GuideState {
        self.ensure_lane(lane);
        if lane == 0 {
            self.num_tokens_generated += 1;
        }
        let budget_exhausted = self
            .max_tokens
            .is_some_and(|x| self.num_tokens_generated >= x);
        if budget_exhausted || token_id == self.tokenizer.eos_token_id() {
            self.lanes[lane].phase = LanePhase::Done;
            return GuideState::END;
        }
        let lane_state = &mut self.lanes[lane];
        let Some(guide) = lane_state.regex_guide.as_mut() else {
            log::warn!(
                "Token ID {} is emitted in lane {} before any token is allowed. \
                The lane is moved to the end state.",
                token_id,
                lane
            );
            lane_state.phase = LanePhase::Done;
            return GuideState::END;
        };
        let state = if lane_state.pending_reset {
            lane_state.pending_reset = false;
            GuideState::INITIAL
        } else {
            state
        };
        let next_state = guide.next_state(state, token_id, lane);
        if next_state == GuideState::END {
            // The token was not admissible, so it never becomes part of the parsed text.
            lane_state.phase = LanePhase::Done;
        } else {
            let text = self
                .tokenizer
                .decode(&[token_id])
                .into_iter()
                .next()
                .unwrap_or_default();
            lane_state.generation.push_str(&text);
        }
        next_state
    }

    /// # Panics
    ///
    /// Panics if the lane has never been addressed since construction or the last reset.
    fn is_final_state(&self, _state: GuideState, lane: usize) -> bool {
        match self.lanes.get(lane) {
            Some(x) => x.phase == LanePhase::Done,
            None => panic!("Lane {} has never been addressed.", lane),
        }
    }

    fn reset(&mut self) {
        self.num_tokens_generated = 0;
        self.lanes.clear();
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

    const NUMBERS: &str = "start: NUMBER (\",\" NUMBER)*\nNUMBER: /[0-9]+/";

    fn tokenizer() -> SharedTokenizer {
        let vocabulary = Vocabulary::from_token_strings(
            ["1", "2", ",", "12", "a", "<eos>"]
                .iter()
                .enumerate()
                .map(|(i, x)| (i as u32, x.to_string())),
        )
        .unwrap();
        VocabularyTokenizer::new(Arc::new(vocabulary), 5)
            .unwrap()
            .into_shared()
    }

    #[test]
    fn slice_selection() {
        let guide = GrammarGuide::new(NUMBERS, tokenizer(), None).unwrap();
        assert_eq!(
            select_slice(&guide.parser, ""),
            Slice::Pattern {
                pattern: "(([0-9]+))".to_string(),
                allow_eos: false
            }
        );
        assert_eq!(
            select_slice(&guide.parser, "12"),
            Slice::Pattern {
                pattern: "(()|(,))".to_string(),
                allow_eos: true
            }
        );
        assert_eq!(
            select_slice(&Parser::new(Grammar::new("start: \"a\"").unwrap()).unwrap(), "a"),
            Slice::End
        );
    }

    #[test]
    fn lane_phases() {
        let mut guide = GrammarGuide::new(NUMBERS, tokenizer(), None).unwrap();
        let mut state = GuideState::INITIAL;
        assert_eq!(guide.allowed_token_ids(state, 0), vec![0, 1, 3]);
        assert_eq!(guide.lanes[0].phase, LanePhase::Delegating);
        state = guide.next_state(state, 3, 0);
        assert_eq!(guide.allowed_token_ids(state, 0), vec![2, 5]);
        // Asking twice within a step does not move the lane.
        assert_eq!(guide.allowed_token_ids(state, 0), vec![2, 5]);
        state = guide.next_state(state, 2, 0);
        assert_eq!(guide.allowed_token_ids(state, 0), vec![0, 1, 3]);
        assert_eq!(guide.generation(0), Some("12,"));
        assert!(!guide.is_final_state(state, 0));
        state = guide.next_state(state, 5, 0);
        assert_eq!(state, GuideState::END);
        assert!(guide.is_final_state(state, 0));
        assert_eq!(guide.lanes[0].phase.to_string(), "Done");
        assert_eq!(guide.allowed_token_ids(state, 0), vec![5]);
    }

    #[test]
    fn inadmissible_tokens_end_the_lane() {
        let mut guide = GrammarGuide::new(NUMBERS, tokenizer(), None).unwrap();
        // No token has been allowed yet in lane 0.
        let state = guide.next_state(GuideState::INITIAL, 4, 0);
        assert_eq!(state, GuideState::END);
        assert!(guide.is_final_state(state, 0));
        assert_eq!(guide.generation(0), Some(""));
        assert_eq!(guide.allowed_token_ids(state, 0), vec![5]);
        // A token outside the allowed set of the active slice.
        assert_eq!(guide.allowed_token_ids(GuideState::INITIAL, 1), vec![0, 1, 3]);
        let state = guide.next_state(GuideState::INITIAL, 2, 1);
        assert_eq!(state, GuideState::END);
        assert!(guide.is_final_state(state, 1));
        assert_eq!(guide.generation(1), Some(""));
        assert_eq!(guide.allowed_token_ids(state, 1), vec![5]);
    }

    #[test]
    fn cache_survives_reset() {
        let mut guide = GrammarGuide::new(NUMBERS, tokenizer(), None).unwrap();
        assert_eq!(guide.index_cache.len(), 1);
        guide.allowed_token_ids(GuideState::INITIAL, 2);
        assert_eq!(guide.lanes.len(), 3);
        guide.reset();
        assert!(guide.lanes.is_empty());
        assert_eq!(guide.index_cache.len(), 1);
    }
}
