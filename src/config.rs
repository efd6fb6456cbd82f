//! The configuration module of the guides.
use serde::{Deserialize, Serialize};

/// The configuration shared by [`RegexGuide`](crate::regex_guide::RegexGuide) and
/// [`GrammarGuide`](crate::grammar_guide::GrammarGuide). This should suffice most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Config {
    /// The configuration of the regular expressions.
    pub regex_config: RegexConfig,
    /// The configuration of the guides themselves.
    pub guide_config: GuideConfig,
    /// The start nonterminal of a grammar.
    /// The default is `start`.
    pub start_nonterminal: String,
}

/// The configuration of regular expressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy)]
pub struct RegexConfig {
    /// The maximum memory usage in bytes allowed when compiling the regex.
    /// If the memory usage exceeds this limit, an error will be returned.
    /// The default is `None`, which means no limit for dfa.
    pub max_memory_usage: Option<usize>,
    /// Whether the compiled DFA is minimized before it is indexed against the vocabulary.
    /// Minimization costs compile time but the vocabulary index is built per state,
    /// so fewer states means a cheaper index.
    /// The default is `true`.
    pub minimize: bool,
}

/// The specific config of the guides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy)]
pub struct GuideConfig {
    /// Whether the grammar guide caches the compiled automaton and vocabulary index of every
    /// slice pattern it has seen. The cache is preserved between
    /// [`reset`](crate::guide_like::GuideLike::reset) calls.
    /// It is enabled by default.
    pub cache_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regex_config: RegexConfig::default(),
            guide_config: GuideConfig::default(),
            start_nonterminal: "start".to_string(),
        }
    }
}

impl Default for RegexConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: None,
            minimize: true,
        }
    }
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
        }
    }
}

impl RegexConfig {
    /// Converts the configuration to the dense DFA configuration used by the automaton compiler.
    pub(crate) fn dfa_config(&self) -> kbnf_regex_automata::dfa::dense::Config {
        kbnf_regex_automata::dfa::dense::Config::new()
            .dfa_size_limit(self.max_memory_usage)
            .determinize_size_limit(self.max_memory_usage)
            .start_kind(kbnf_regex_automata::dfa::StartKind::Anchored)
            .match_kind(kbnf_regex_automata::MatchKind::All)
            .minimize(self.minimize)
    }
}
