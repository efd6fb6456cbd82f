//! The vocabulary indexer that cross-references every token of a vocabulary with every state of an [`Automaton`].
use std::fmt::Debug;

use crate::automaton::{Automaton, StateId};
use crate::utils;
use crate::vocabulary::Vocabulary;

#[derive(Debug, thiserror::Error)]
/// The error type for [`Index`] creation.
pub enum CreateIndexError {
    #[error(
        "The vocabulary does not allow us to build a sequence that matches the pattern {0:?}."
    )]
    /// No token sequence in the vocabulary reaches a final state of the automaton.
    VocabularyInfeasible(String),
}

/// For every automaton state, the admissible token IDs and the state each of them leads to.
///
/// The index is immutable after construction and can be shared by any number of guides.
#[derive(Clone)]
pub struct Index {
    automaton: Automaton,
    // Sorted by token ID. An empty row means the state has no entry.
    states_to_token_maps: Vec<Box<[(u32, StateId)]>>,
    eos_token_id: u32,
}

impl Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("automaton", &self.automaton)
            .field(
                "states_to_token_maps",
                &self
                    .states_to_token_maps
                    .iter()
                    .enumerate()
                    .filter(|(_, x)| !x.is_empty())
                    .collect::<Vec<_>>(),
            )
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

impl Index {
    /// Builds the index of `automaton` against `vocabulary`.
    ///
    /// A token is admissible from a state if every byte of the token has a transition, starting
    /// from that state. Only tokens whose first byte leaves the state are simulated.
    /// The end-of-sequence token is never simulated; instead, every final state with at least one
    /// admissible token also admits `eos_token_id`, which leads back to the same state.
    ///
    /// # Errors
    ///
    /// Returns [`CreateIndexError::VocabularyInfeasible`] if no entry of the index leads to a
    /// final state.
    pub fn new(
        automaton: Automaton,
        vocabulary: &Vocabulary,
        eos_token_id: u32,
    ) -> Result<Self, CreateIndexError> {
        let mut states_to_token_maps = Vec::with_capacity(automaton.num_states());
        let mut feasible = false;
        for state in 0..automaton.num_states() as StateId {
            let mut map: Vec<(u32, StateId)> = Vec::new();
            for token_id in vocabulary.token_ids_from_first_bytes(automaton.first_bytes(state)) {
                if token_id == eos_token_id {
                    continue;
                }
                let Some(token) = vocabulary.token(token_id) else {
                    continue;
                };
                if let Some(next_state) = automaton.walk(state, &token.0) {
                    map.push((token_id, next_state));
                }
            }
            if !map.is_empty() && automaton.is_final(state) {
                map.push((eos_token_id, state));
            }
            map.sort_unstable_by_key(|x| x.0);
            feasible |= map
                .iter()
                .any(|&(_, next_state)| automaton.is_final(next_state));
            states_to_token_maps.push(map.into_boxed_slice());
        }
        if !feasible {
            return Err(CreateIndexError::VocabularyInfeasible(
                automaton.pattern().to_string(),
            ));
        }
        log::debug!(
            "Indexed {:?}: {} states, {} transitions.",
            automaton.pattern(),
            automaton.num_states(),
            states_to_token_maps.iter().map(|x| x.len()).sum::<usize>()
        );
        Ok(Self {
            automaton,
            states_to_token_maps,
            eos_token_id,
        })
    }

    /// The automaton this index was built from.
    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    /// The end-of-sequence token ID this index was built with.
    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// The admissible tokens of `state` with the states they lead to, sorted by token ID.
    ///
    /// Returns `None` if the state has no entry, i.e. no token is admissible from it.
    pub fn token_map(&self, state: StateId) -> Option<&[(u32, StateId)]> {
        self.states_to_token_maps
            .get(state as usize)
            .map(|x| x.as_ref())
            .filter(|x| !x.is_empty())
    }

    /// The admissible token IDs of `state` in ascending order.
    pub fn allowed_token_ids(&self, state: StateId) -> Option<Vec<u32>> {
        self.token_map(state)
            .map(|map| map.iter().map(|&(token_id, _)| token_id).collect())
    }

    /// The state reached by emitting `token_id` from `state`, if the token is admissible.
    pub fn next_state(&self, state: StateId, token_id: u32) -> Option<StateId> {
        let map = self.token_map(state)?;
        map.binary_search_by_key(&token_id, |&(token_id, _)| token_id)
            .ok()
            .map(|i| map[i].1)
    }

    /// Checks whether the state is final in the underlying automaton.
    pub fn is_final(&self, state: StateId) -> bool {
        self.automaton.is_final(state)
    }

    /// The display form of the admissible tokens of `state`, for debugging.
    pub fn token_strings(&self, state: StateId, vocabulary: &Vocabulary) -> Vec<String> {
        self.token_map(state)
            .unwrap_or_default()
            .iter()
            .map(|&(token_id, next_state)| {
                format!(
                    "{}[{}]->{}",
                    utils::get_display_form_from_token_string(
                        vocabulary.token_string(token_id).unwrap_or_default()
                    ),
                    token_id,
                    next_state
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::START_STATE;

    fn vocab(tokens: &[(u32, &str)]) -> Vocabulary {
        Vocabulary::from_token_strings(tokens.iter().map(|&(id, s)| (id, s.to_string()))).unwrap()
    }

    #[test]
    fn index_from_regex() {
        let vocabulary = vocab(&[(0, "blah"), (1, "1a"), (2, "2"), (3, "0"), (4, "<eos>")]);
        let automaton = Automaton::compile("0|[1-9][0-9]*").unwrap();
        let index = Index::new(automaton, &vocabulary, 4).unwrap();
        assert_eq!(index.allowed_token_ids(START_STATE), Some(vec![2, 3]));
        let zero = index.next_state(START_STATE, 3).unwrap();
        let two = index.next_state(START_STATE, 2).unwrap();
        assert!(index.is_final(zero));
        assert!(index.is_final(two));
        // "0" admits nothing after it, so it has no entry at all.
        assert_eq!(index.allowed_token_ids(zero), None);
        assert_eq!(index.allowed_token_ids(two), Some(vec![2, 3, 4]));
        assert_eq!(index.next_state(two, 4), Some(two));
        assert_eq!(index.next_state(START_STATE, 1), None);
    }

    #[test]
    fn multi_transition_tokens() {
        let vocabulary = vocab(&[(0, "a"), (1, "b"), (2, "ab"), (3, "<eos>")]);
        let automaton = Automaton::compile("ab").unwrap();
        let index = Index::new(automaton, &vocabulary, 3).unwrap();
        let a = index.next_state(START_STATE, 0).unwrap();
        assert_eq!(index.next_state(a, 1), index.next_state(START_STATE, 2));
        assert_eq!(
            index.token_strings(START_STATE, &vocabulary),
            vec!["a[0]->1".to_string(), "ab[2]->2".to_string()]
        );
    }

    #[test]
    fn multibyte_tokens() {
        let mut id_to_token = ahash::AHashMap::default();
        let mut id_to_token_string = ahash::AHashMap::default();
        for (id, bytes) in [
            (0u32, "😇".as_bytes().to_vec()),
            (1, "😇".as_bytes()[..2].to_vec()),
            (2, "😇".as_bytes()[2..].to_vec()),
            (3, b"x".to_vec()),
        ] {
            id_to_token.insert(id, crate::vocabulary::Token(bytes.into_boxed_slice()));
            id_to_token_string.insert(id, format!("<{}>", id));
        }
        let vocabulary = Vocabulary::new(id_to_token, id_to_token_string).unwrap();
        let automaton = Automaton::compile("😇+").unwrap();
        let index = Index::new(automaton, &vocabulary, 3).unwrap();
        assert_eq!(index.allowed_token_ids(START_STATE), Some(vec![0, 1]));
        let half = index.next_state(START_STATE, 1).unwrap();
        assert_eq!(index.allowed_token_ids(half), Some(vec![2]));
        let full = index.next_state(half, 2).unwrap();
        assert!(index.is_final(full));
    }

    #[test]
    fn infeasible_vocabulary() {
        let vocabulary = vocab(&[(0, "a"), (1, "b"), (2, "<eos>")]);
        let automaton = Automaton::compile("a*z").unwrap();
        assert!(matches!(
            Index::new(automaton, &vocabulary, 2),
            Err(CreateIndexError::VocabularyInfeasible(_))
        ));
    }
}
