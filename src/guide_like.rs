//! This module contains the [`GuideLike`] trait, which defines the behavior of a guide-like object.
use displaydoc::Display;
use fixedbitset_stack::FixedBitSet;
use serde::{Deserialize, Serialize};

use crate::automaton::StateId;

/// The state of a guide, produced and consumed by the sampling loop at every decoding step.
///
/// [`GuideState::INITIAL`] is the state of a freshly constructed or reset guide.
/// [`GuideState::END`] is an absorbing end state, distinct from any automaton-defined final state.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GuideState(pub i64);

impl GuideState {
    /// The initial state.
    pub const INITIAL: GuideState = GuideState(0);
    /// The absorbing end state, reached by emitting the end-of-sequence token,
    /// exhausting the token budget or forcing an inadmissible token.
    pub const END: GuideState = GuideState(-1);

    /// Converts the state to an automaton state, if it is one.
    pub(crate) fn automaton_state(self) -> Option<StateId> {
        StateId::try_from(self.0).ok()
    }
}

impl From<StateId> for GuideState {
    fn from(value: StateId) -> Self {
        GuideState(value as i64)
    }
}

impl std::fmt::Display for GuideState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`GuideLike`] tries to mask logits.
pub enum MaskLogitsError {
    /// The input logits array is not equal to the vocabulary size.
    InvalidLogitsLength,
}

impl std::error::Error for MaskLogitsError {}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A trait that defines the behavior of a guide.
///
/// The sampling loop drives a guide as follows: for each decoding step and each active lane, call
/// [`GuideLike::allowed_token_ids`] to mask the model's output distribution, sample one token from the
/// masked distribution, call [`GuideLike::next_state`] to obtain the new state and call
/// [`GuideLike::is_final_state`] to decide whether that lane has finished.
/// Call [`GuideLike::reset`] before starting an unrelated generation run on the same guide.
///
/// A lane is the index of one independently advancing sequence within a batch. Lane `0` drives the
/// token budget shared by the whole batch, so it must advance whenever the batch advances.
pub trait GuideLike: sealed::Sealed {
    /// Gets the token IDs that may legally come next, in ascending order.
    ///
    /// The result is never empty; when nothing else is admissible it is exactly the end-of-sequence token.
    fn allowed_token_ids(&mut self, state: GuideState, lane: usize) -> Vec<u32>;

    /// Computes the state reached by emitting `token_id` from `state` in `lane`.
    fn next_state(&mut self, state: GuideState, token_id: u32, lane: usize) -> GuideState;

    /// Checks whether `lane` has finished in `state`.
    fn is_final_state(&self, state: GuideState, lane: usize) -> bool;

    /// Resets the per-lane bookkeeping so the guide can be reused for an unrelated generation run.
    /// Compiled automata and vocabulary indices are preserved.
    fn reset(&mut self);

    /// Gets the size of the vocabulary the guide was built with.
    fn vocab_size(&self) -> usize;

    /// Sets the logits of every token not allowed from `state` in `lane` to negative infinity.
    ///
    /// # Errors
    ///
    /// Returns a [`MaskLogitsError`] when the input logits array is not of the expected length according to the vocabulary.
    /// The logits array is not updated in this case.
    fn mask_logits(
        &mut self,
        state: GuideState,
        lane: usize,
        logits: &mut [f32],
    ) -> Result<(), MaskLogitsError> {
        if logits.len() != self.vocab_size() {
            return Err(MaskLogitsError::InvalidLogitsLength);
        }
        let mut allowed = FixedBitSet::with_capacity(logits.len());
        for token_id in self.allowed_token_ids(state, lane) {
            if (token_id as usize) < logits.len() {
                allowed.insert(token_id as usize);
            }
        }
        for (token_id, logit) in logits.iter_mut().enumerate() {
            if !allowed.contains(token_id) {
                *logit = f32::NEG_INFINITY;
            }
        }
        Ok(())
    }

    /// Converts the guide to a boxed guide.
    fn into_boxed_guide(self) -> Box<dyn GuideLike>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}
