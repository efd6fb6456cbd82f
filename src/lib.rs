/*!
# guidefsm

This crate provides token-level finite state guides which ensure that a language model's output
stops at a stop token, matches a regular expression or is derivable from a context free grammar.
Here is a quick example of how this crate works:

```rust
use std::sync::Arc;
use guidefsm::{GuideLike, GuideState, RegexGuide, Vocabulary, VocabularyTokenizer};

fn greedy_decode(logits: &[f32]) -> u32 {
    logits.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).unwrap().0 as u32
}

let vocabulary = Vocabulary::from_token_strings(
    ["a", "b", "ab", "<eos>"]
        .iter()
        .enumerate()
        .map(|(i, x)| (i as u32, x.to_string())),
)
.unwrap();
let tokenizer = VocabularyTokenizer::new(Arc::new(vocabulary), 3)
    .unwrap()
    .into_shared();
let mut guide = RegexGuide::new("ab", tokenizer, None).unwrap();
let mut state = GuideState::INITIAL;
let mut logits = [0.0, 0.5, 1.0, 0.0]; // logits obtained from the language model
guide.mask_logits(state, 0, &mut logits).unwrap();
assert_eq!(&format!("{:?}", logits), "[0.0, -inf, 1.0, -inf]");
let token = greedy_decode(&logits);
state = guide.next_state(state, token, 0);
assert!(guide.is_final_state(state, 0));
assert_eq!(guide.allowed_token_ids(state, 0), vec![3]);
```

# Overview

The primary types in this crate are [GuideLike] and its three implementations:

- [StopGuide]: allows any token until the stop token is emitted or the token budget is exhausted.
- [RegexGuide]: constrains the output to the regular language of a pattern.
  The pattern is compiled into an [Automaton] and mapped against the vocabulary into an [Index] once.
- [GrammarGuide]: constrains the output to a context free grammar written in a subset of lark's syntax.
  The grammar is turned into an LALR(1) [Parser](parser::Parser), and the terminals the parser accepts
  next are enforced through a freshly selected [RegexGuide].

Every guide is driven by the same sampling loop. For each decoding step and each lane
(an independently advancing sequence within a batch):

1. call [GuideLike::allowed_token_ids] (or [GuideLike::mask_logits]) with the current state of the lane;
2. sample one token from the masked distribution;
3. call [GuideLike::next_state] to obtain the new state;
4. stop the lane once [GuideLike::is_final_state] holds.

Call [GuideLike::reset] before reusing a guide for an unrelated generation. Compiled automata,
vocabulary indices and the slice cache of [GrammarGuide] survive resets.

## Grammar guide

```rust
use std::sync::Arc;
use guidefsm::{GrammarGuide, GuideLike, GuideState, Vocabulary, VocabularyTokenizer};

let vocabulary = Vocabulary::from_token_strings(
    ["1", "2", ",", "12", "a", "<eos>"]
        .iter()
        .enumerate()
        .map(|(i, x)| (i as u32, x.to_string())),
)
.unwrap();
let tokenizer = VocabularyTokenizer::new(Arc::new(vocabulary), 5)
    .unwrap()
    .into_shared();
let grammar_str = r#"
start: NUMBER ("," NUMBER)*
NUMBER: /[0-9]+/
"#;
let mut guide = GrammarGuide::new(grammar_str, tokenizer, None).unwrap();
let mut state = GuideState::INITIAL;
assert_eq!(guide.allowed_token_ids(state, 0), vec![0, 1, 3]);
state = guide.next_state(state, 3, 0);
// The end of input is acceptable after "12", so the end-of-sequence token is offered.
assert_eq!(guide.allowed_token_ids(state, 0), vec![2, 5]);
state = guide.next_state(state, 5, 0);
assert!(guide.is_final_state(state, 0));
```

# Grammar syntax

See [Grammar::with_config] for the accepted lark subset. In short:

- Rules are lowercase, terminals are uppercase. By default generation starts from the rule `start`.
- Rule bodies support alternatives `|`, grouping `()`, optional items `[]` and `?`,
  and repetitions `*` and `+`.
- String literals `"..."` (optionally suffixed by `i`) and regular expressions `/.../flags`
  may appear both in rules and in terminal definitions.
- Terminals may carry a priority, e.g. `KEYWORD.2: "if"`.
- `%import common.NAME` and `%import common (A, B)` load the common terminals, and
  `%ignore` marks terminals that may appear anywhere between other terminals.

# Performance

## Reuse a guide for multiple generations with cache enabled

The slice cache of [GrammarGuide] is preserved between [GuideLike::reset] calls.
Hence, if your grammar and vocabulary are fixed, you should reuse the guide for multiple generations.

## Share regex indices

[RegexGuide::from_index] builds a guide around an already computed [Index], so several guides
for the same pattern and vocabulary only pay for index construction once.

## Bound the automata

**A regular expression is compiled into a DFA which, by its nature, has worst case exponential time and space complexity.**
If you are dealing with untrusted patterns or grammars, set
[RegexConfig::max_memory_usage](config::RegexConfig::max_memory_usage).
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod automaton;
pub mod config;
pub mod grammar;
pub mod grammar_guide;
pub mod guide_like;
pub mod index;
pub mod parser;
pub mod regex_guide;
pub mod stop_guide;
pub mod tokenizer;
mod utils;
pub mod vocabulary;
pub use automaton::Automaton;
pub use config::Config;
pub use grammar::Grammar;
pub use grammar_guide::GrammarGuide;
pub use guide_like::GuideLike;
pub use guide_like::GuideState;
pub use guide_like::MaskLogitsError;
pub use index::Index;
#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;
pub use regex_guide::RegexGuide;
pub use stop_guide::StopGuide;
pub use tokenizer::SharedTokenizer;
pub use tokenizer::Tokenizer;
pub use tokenizer::VocabularyTokenizer;
pub use vocabulary::Token;
pub use vocabulary::Vocabulary;
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
