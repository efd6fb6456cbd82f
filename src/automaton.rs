//! The automaton compiler that turns a regular expression into a trimmed, byte-level DFA.
use std::fmt::Debug;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use kbnf_regex_automata::dfa::{dense, Automaton as _, StartError};
use kbnf_regex_automata::util::primitives::StateID;
use kbnf_regex_automata::util::start;
use kbnf_regex_automata::Anchored;
use nonmax::NonMaxU32;

use crate::config::RegexConfig;
use crate::utils::{self, ByteSet};

/// The identifier of a state in an [`Automaton`].
pub type StateId = u32;
/// The start state of every [`Automaton`].
pub const START_STATE: StateId = 0;

#[derive(Debug, thiserror::Error)]
/// The error type for [`Automaton`] compilation.
pub enum PatternError {
    #[error("Regex compilation error in {pattern:?}: {source}")]
    /// The pattern is malformed or its DFA exceeds the configured memory limit.
    InvalidPattern {
        /// The pattern that failed to compile.
        pattern: String,
        /// The underlying error.
        #[source]
        source: Box<dense::BuildError>,
    },
    #[error("Regex initialization error: {0}")]
    /// Error when computing the start state for a DFA.
    DfaStartError(#[from] StartError),
    #[error("The automaton has {0} states, while the maximum supported is {1}.")]
    /// The automaton has more states than a [`StateId`] can address.
    TooManyStates(usize, usize),
}

/// A deterministic finite automaton over bytes.
///
/// The automaton only keeps states that are reachable from [`START_STATE`] and from which some
/// final state is reachable. A missing transition means "no edge"; there are no implicit dead states.
#[derive(Clone)]
pub struct Automaton {
    pattern: String,
    byte_to_class: [u8; 256],
    alphabet_len: usize,
    transitions: Vec<Option<NonMaxU32>>,
    finals: FixedBitSet,
    first_bytes: Vec<ByteSet>,
}

impl Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("pattern", &self.pattern)
            .field("num_states", &self.num_states())
            .field("finals", &utils::get_display_form_from_bitset(&self.finals))
            .field(
                "first_bytes",
                &self
                    .first_bytes
                    .iter()
                    .map(utils::get_display_form_from_bitset_on_stack)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Automaton {
    /// Compiles a regular expression into a minimal [`Automaton`] with the default [`RegexConfig`].
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern is malformed.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        Self::compile_with_config(pattern, &RegexConfig::default())
    }

    /// Compiles a regular expression into an [`Automaton`].
    ///
    /// The whole input must match the pattern: the search is anchored at the start and a state is
    /// final only if the end of input right after it completes a match.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern is malformed, the DFA is larger than
    /// [`RegexConfig::max_memory_usage`] or the automaton has too many states.
    pub fn compile_with_config(pattern: &str, config: &RegexConfig) -> Result<Self, PatternError> {
        let dfa = dense::Builder::new()
            .configure(config.dfa_config())
            .build(pattern)
            .map_err(|e| PatternError::InvalidPattern {
                pattern: pattern.to_string(),
                source: Box::new(e),
            })?;
        let start_state = dfa.start_state(&start::Config::new().anchored(Anchored::Yes))?;
        let classes = dfa.byte_classes();
        let alphabet_len = classes.alphabet_len();
        let mut byte_to_class = [0u8; 256];
        let mut representatives: Vec<Option<u8>> = vec![None; alphabet_len];
        for byte in 0..=u8::MAX {
            let class = classes.get(byte);
            byte_to_class[byte as usize] = class;
            representatives[class as usize].get_or_insert(byte);
        }
        // Breadth first discovery of every live DFA state reachable from the start.
        let mut dfa_state_to_index: AHashMap<StateID, usize> = AHashMap::default();
        let mut dfa_states = vec![start_state];
        dfa_state_to_index.insert(start_state, 0);
        let mut edges: Vec<Vec<(usize, usize)>> = Vec::new();
        let mut i = 0;
        while i < dfa_states.len() {
            let state = dfa_states[i];
            let mut out = Vec::new();
            for (class, byte) in representatives.iter().enumerate() {
                let Some(byte) = *byte else {
                    continue;
                };
                let next = dfa.next_state(state, byte);
                if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                    continue;
                }
                let target = *dfa_state_to_index.entry(next).or_insert_with(|| {
                    dfa_states.push(next);
                    dfa_states.len() - 1
                });
                out.push((class, target));
            }
            edges.push(out);
            i += 1;
        }
        let is_final: Vec<bool> = dfa_states
            .iter()
            .map(|&state| dfa.is_match_state(dfa.next_eoi_state(state)))
            .collect();
        // Keep only states that can still reach a final state.
        let mut reverse_edges: Vec<Vec<usize>> = vec![Vec::new(); dfa_states.len()];
        for (source, out) in edges.iter().enumerate() {
            for &(_, target) in out {
                reverse_edges[target].push(source);
            }
        }
        let mut live = vec![false; dfa_states.len()];
        let mut stack: Vec<usize> = (0..dfa_states.len()).filter(|&x| is_final[x]).collect();
        for &x in stack.iter() {
            live[x] = true;
        }
        while let Some(state) = stack.pop() {
            for &source in reverse_edges[state].iter() {
                if !live[source] {
                    live[source] = true;
                    stack.push(source);
                }
            }
        }
        let mut new_ids: Vec<Option<StateId>> = vec![None; dfa_states.len()];
        let mut num_states = 0usize;
        for (old, new_id) in new_ids.iter_mut().enumerate() {
            if old == 0 || live[old] {
                *new_id = Some(
                    StateId::try_from(num_states)
                        .map_err(|_| PatternError::TooManyStates(num_states, u32::MAX as usize))?,
                );
                num_states += 1;
            }
        }
        let mut transitions = vec![None; num_states * alphabet_len];
        let mut finals = FixedBitSet::with_capacity(num_states);
        for (old, out) in edges.iter().enumerate() {
            let Some(source) = new_ids[old] else {
                continue;
            };
            if is_final[old] {
                finals.insert(source as usize);
            }
            for &(class, target) in out {
                if !live[target] {
                    continue;
                }
                if let Some(target) = new_ids[target] {
                    transitions[source as usize * alphabet_len + class] = NonMaxU32::new(target);
                }
            }
        }
        let mut automaton = Self {
            pattern: pattern.to_string(),
            byte_to_class,
            alphabet_len,
            transitions,
            finals,
            first_bytes: Vec::with_capacity(num_states),
        };
        for state in 0..num_states as StateId {
            let mut set = utils::new_byte_set();
            for byte in 0..=u8::MAX {
                if automaton.next_state(state, byte).is_some() {
                    set.insert(byte as usize);
                }
            }
            automaton.first_bytes.push(set);
        }
        log::debug!(
            "Compiled {:?} into an automaton with {} states ({} DFA states before trimming).",
            pattern,
            num_states,
            dfa_states.len()
        );
        Ok(automaton)
    }

    /// The pattern this automaton was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The number of states.
    pub fn num_states(&self) -> usize {
        self.finals.len()
    }

    /// Checks whether the state is a final(accepting) state.
    #[inline]
    pub fn is_final(&self, state: StateId) -> bool {
        self.finals.contains(state as usize)
    }

    /// Iterates over the final states.
    pub fn finals(&self) -> impl Iterator<Item = StateId> + '_ {
        self.finals.ones().map(|x| x as StateId)
    }

    /// Follows the transition of `byte` from `state`, if any.
    #[inline]
    pub fn next_state(&self, state: StateId, byte: u8) -> Option<StateId> {
        let class = self.byte_to_class[byte as usize] as usize;
        self.transitions
            .get(state as usize * self.alphabet_len + class)
            .copied()
            .flatten()
            .map(|x| x.get())
    }

    /// Consumes all the bytes from `state` and returns the state reached,
    /// or `None` if some byte has no transition.
    #[inline]
    pub fn walk(&self, state: StateId, bytes: &[u8]) -> Option<StateId> {
        bytes
            .iter()
            .try_fold(state, |state, &byte| self.next_state(state, byte))
    }

    /// Returns the length of the longest prefix of `bytes` that belongs to the language.
    pub fn longest_match(&self, bytes: &[u8]) -> Option<usize> {
        let mut state = START_STATE;
        let mut longest = self.is_final(state).then_some(0);
        for (i, &byte) in bytes.iter().enumerate() {
            match self.next_state(state, byte) {
                Some(next) => state = next,
                None => break,
            }
            if self.is_final(state) {
                longest = Some(i + 1);
            }
        }
        longest
    }

    /// The bytes that have a transition out of `state`.
    #[inline]
    pub(crate) fn first_bytes(&self, state: StateId) -> &ByteSet {
        &self.first_bytes[state as usize]
    }
}
