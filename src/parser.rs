//! The parser module that contains the LALR(1) [`Parser`], its [`InteractiveParser`] and the contextual lexer.
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt::Debug;

use ahash::AHashMap;
use displaydoc::Display;
use fixedbitset_stack::FixedBitSet;

use crate::grammar::{Grammar, NonterminalID, Symbol, TerminalID};
use crate::utils;

/// An entry of the action table.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Action {
    /// Shift the terminal and go to the state.
    Shift(usize),
    /// Reduce by the production.
    Reduce(usize),
    /// The input is complete.
    Accept,
}

#[derive(Debug, thiserror::Error)]
/// The error type for [`Parser`] creation.
pub enum CreateParserError {
    #[error(
        "Reduce/reduce conflict in state {state} on terminal {terminal:?} \
        between `{first}` and `{second}`."
    )]
    /// Two productions can be reduced on the same lookahead.
    ReduceReduceConflict {
        /// The parser state.
        state: usize,
        /// The lookahead terminal.
        terminal: String,
        /// The production already in the table.
        first: String,
        /// The conflicting production.
        second: String,
    },
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
/// Represents the error when an [`InteractiveParser`] consumes input.
pub enum ParseError {
    /// The terminal {0} is not expected here.
    UnexpectedTerminal(String),
    /// No acceptable terminal matches the input at byte {0}.
    UnexpectedInput(usize),
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
struct Item {
    production: usize,
    dot: usize,
}

/// The LALR(1) parser of a [`Grammar`].
#[derive(Clone)]
pub struct Parser {
    grammar: Grammar,
    actions: Vec<AHashMap<TerminalID, Action>>,
    gotos: Vec<AHashMap<NonterminalID, usize>>,
}

impl Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("grammar", &self.grammar)
            .field("num_states", &self.num_states())
            .finish()
    }
}

struct TableBuilder<'a> {
    grammar: &'a Grammar,
    productions_by_lhs: Vec<Vec<usize>>,
    nullable: FixedBitSet,
    first: Vec<FixedBitSet>,
}

impl<'a> TableBuilder<'a> {
    fn new(grammar: &'a Grammar) -> Self {
        let num_nonterminals = grammar.num_nonterminals();
        let mut productions_by_lhs = vec![Vec::new(); num_nonterminals];
        for production in 0..grammar.num_productions() {
            productions_by_lhs[grammar.production_lhs(production).0 as usize].push(production);
        }
        let mut nullable = FixedBitSet::with_capacity(num_nonterminals);
        let mut first = vec![FixedBitSet::with_capacity(grammar.num_terminals()); num_nonterminals];
        let mut changed = true;
        while changed {
            changed = false;
            for production in 0..grammar.num_productions() {
                let lhs = grammar.production_lhs(production).0 as usize;
                let mut all_nullable = true;
                for symbol in grammar.production_rhs(production) {
                    match *symbol {
                        Symbol::Terminal(t) => {
                            if !first[lhs].contains(t.0 as usize) {
                                first[lhs].insert(t.0 as usize);
                                changed = true;
                            }
                            all_nullable = false;
                            break;
                        }
                        Symbol::Nonterminal(n) => {
                            let n = n.0 as usize;
                            if n != lhs {
                                let other = first[n].clone();
                                changed |= utils::union_grows(&mut first[lhs], &other);
                            }
                            if !nullable.contains(n) {
                                all_nullable = false;
                                break;
                            }
                        }
                    }
                }
                if all_nullable && !nullable.contains(lhs) {
                    nullable.insert(lhs);
                    changed = true;
                }
            }
        }
        Self {
            grammar,
            productions_by_lhs,
            nullable,
            first,
        }
    }

    fn first_of(&self, symbols: &[Symbol], lookahead: &FixedBitSet) -> FixedBitSet {
        let mut result = FixedBitSet::with_capacity(self.grammar.num_terminals());
        for symbol in symbols {
            match *symbol {
                Symbol::Terminal(t) => {
                    result.insert(t.0 as usize);
                    return result;
                }
                Symbol::Nonterminal(n) => {
                    result.union_with(&self.first[n.0 as usize]);
                    if !self.nullable.contains(n.0 as usize) {
                        return result;
                    }
                }
            }
        }
        result.union_with(lookahead);
        result
    }

    fn closure(&self, kernel: Vec<(Item, FixedBitSet)>) -> Vec<(Item, FixedBitSet)> {
        let mut items = kernel;
        let mut positions: AHashMap<Item, usize> = items
            .iter()
            .enumerate()
            .map(|(i, (item, _))| (*item, i))
            .collect();
        let mut worklist: VecDeque<usize> = (0..items.len()).collect();
        while let Some(i) = worklist.pop_front() {
            let item = items[i].0;
            let rhs = self.grammar.production_rhs(item.production);
            let Some(&Symbol::Nonterminal(next)) = rhs.get(item.dot) else {
                continue;
            };
            let lookahead = self.first_of(&rhs[item.dot + 1..], &items[i].1);
            for &production in self.productions_by_lhs[next.0 as usize].iter() {
                let new_item = Item { production, dot: 0 };
                match positions.get(&new_item) {
                    Some(&j) => {
                        if utils::union_grows(&mut items[j].1, &lookahead) {
                            worklist.push_back(j);
                        }
                    }
                    None => {
                        positions.insert(new_item, items.len());
                        items.push((new_item, lookahead.clone()));
                        worklist.push_back(items.len() - 1);
                    }
                }
            }
        }
        items
    }

    fn goto_groups(&self, closure: Vec<(Item, FixedBitSet)>) -> Vec<(Symbol, Vec<(Item, FixedBitSet)>)> {
        let mut groups: Vec<(Symbol, Vec<(Item, FixedBitSet)>)> = Vec::new();
        let mut group_of_symbol: AHashMap<Symbol, usize> = AHashMap::default();
        for (item, lookahead) in closure {
            let Some(&symbol) = self.grammar.production_rhs(item.production).get(item.dot) else {
                continue;
            };
            let advanced = Item {
                production: item.production,
                dot: item.dot + 1,
            };
            let group = *group_of_symbol.entry(symbol).or_insert_with(|| {
                groups.push((symbol, Vec::new()));
                groups.len() - 1
            });
            groups[group].1.push((advanced, lookahead));
        }
        for (_, items) in groups.iter_mut() {
            items.sort_unstable_by_key(|x| x.0);
        }
        groups
    }

    /// Builds the LR(1) automaton while merging states with the same core, which gives LALR(1) lookaheads.
    #[allow(clippy::type_complexity)]
    fn build_states(&self) -> (Vec<(Vec<Item>, Vec<FixedBitSet>)>, Vec<AHashMap<Symbol, usize>>) {
        let mut end = FixedBitSet::with_capacity(self.grammar.num_terminals());
        end.insert(TerminalID::END.0 as usize);
        let start = vec![Item {
            production: 0,
            dot: 0,
        }];
        let mut states: Vec<(Vec<Item>, Vec<FixedBitSet>)> = vec![(start.clone(), vec![end])];
        let mut core_to_state: AHashMap<Vec<Item>, usize> = AHashMap::default();
        core_to_state.insert(start, 0);
        let mut transitions: Vec<AHashMap<Symbol, usize>> = vec![AHashMap::default()];
        let mut queued = vec![true];
        let mut worklist = VecDeque::from([0usize]);
        while let Some(state) = worklist.pop_front() {
            queued[state] = false;
            let kernel = states[state]
                .0
                .iter()
                .copied()
                .zip(states[state].1.iter().cloned())
                .collect();
            for (symbol, items) in self.goto_groups(self.closure(kernel)) {
                let core: Vec<Item> = items.iter().map(|x| x.0).collect();
                let target = match core_to_state.get(&core) {
                    Some(&target) => {
                        let mut grew = false;
                        for (k, (_, lookahead)) in items.iter().enumerate() {
                            grew |= utils::union_grows(&mut states[target].1[k], lookahead);
                        }
                        if grew && !queued[target] {
                            queued[target] = true;
                            worklist.push_back(target);
                        }
                        target
                    }
                    None => {
                        let target = states.len();
                        core_to_state.insert(core.clone(), target);
                        states.push((core, items.into_iter().map(|x| x.1).collect()));
                        transitions.push(AHashMap::default());
                        queued.push(true);
                        worklist.push_back(target);
                        target
                    }
                };
                transitions[state].insert(symbol, target);
            }
        }
        (states, transitions)
    }
}

impl Parser {
    /// Builds the LALR(1) tables of the grammar.
    ///
    /// Shift/reduce conflicts are resolved in favor of shifting, with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`CreateParserError::ReduceReduceConflict`] when the grammar is not LALR(1) because of
    /// a reduce/reduce conflict.
    pub fn new(grammar: Grammar) -> Result<Self, CreateParserError> {
        let builder = TableBuilder::new(&grammar);
        let (states, transitions) = builder.build_states();
        let mut actions = Vec::with_capacity(states.len());
        let mut gotos = Vec::with_capacity(states.len());
        for (state, ((core, lookaheads), transitions)) in
            states.into_iter().zip(transitions).enumerate()
        {
            let mut row: AHashMap<TerminalID, Action> = AHashMap::default();
            let mut goto_row: AHashMap<NonterminalID, usize> = AHashMap::default();
            for (symbol, target) in transitions {
                match symbol {
                    Symbol::Terminal(t) => {
                        row.insert(t, Action::Shift(target));
                    }
                    Symbol::Nonterminal(n) => {
                        goto_row.insert(n, target);
                    }
                }
            }
            for (item, lookahead) in builder.closure(core.into_iter().zip(lookaheads).collect()) {
                if item.dot < grammar.production_rhs(item.production).len() {
                    continue;
                }
                let action = if item.production == 0 {
                    Action::Accept
                } else {
                    Action::Reduce(item.production)
                };
                for terminal in lookahead.ones().map(|x| TerminalID(x as u32)) {
                    match row.get(&terminal).copied() {
                        None => {
                            row.insert(terminal, action);
                        }
                        Some(Action::Shift(_)) => {
                            log::warn!(
                                "Shift/reduce conflict in state {} on terminal {}. \
                                Shifting is preferred over reducing `{}`.",
                                state,
                                terminal.to_display_form(&grammar),
                                grammar.format_production(item.production)
                            );
                        }
                        Some(existing) if existing == action => {}
                        Some(existing) => {
                            let first = match existing {
                                Action::Reduce(p) => grammar.format_production(p),
                                _ => grammar.format_production(0),
                            };
                            return Err(CreateParserError::ReduceReduceConflict {
                                state,
                                terminal: grammar.terminal_name(terminal).to_string(),
                                first,
                                second: grammar.format_production(item.production),
                            });
                        }
                    }
                }
            }
            actions.push(row);
            gotos.push(goto_row);
        }
        log::debug!("Built LALR(1) tables with {} states.", actions.len());
        Ok(Self {
            grammar,
            actions,
            gotos,
        })
    }

    /// The grammar of the parser.
    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// The number of parser states.
    pub fn num_states(&self) -> usize {
        self.actions.len()
    }

    /// Gets the action of the state on the terminal.
    pub fn action(&self, state: usize, terminal: TerminalID) -> Option<Action> {
        self.actions.get(state)?.get(&terminal).copied()
    }

    /// Creates an [`InteractiveParser`] at the start of the input.
    pub fn interactive(&self) -> InteractiveParser<'_> {
        InteractiveParser {
            parser: self,
            stack: vec![0],
        }
    }

    /// Lexes and parses `text`, which may be an incomplete input, and returns the parser positioned at its end.
    ///
    /// The lexer is contextual: at each position it only tries the terminals the parser can accept
    /// plus the ignored terminals. The terminal with the highest priority wins, even over a longer
    /// match of a lower priority terminal. Among equal priorities the longest match wins; ties go to
    /// string literals, then to the terminal declared first.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when `text` is not a prefix of any sentence of the grammar
    /// as seen by the lexer.
    pub fn parse_prefix(&self, text: &str) -> Result<InteractiveParser<'_>, ParseError> {
        let mut parser = self.interactive();
        let bytes = text.as_bytes();
        let mut position = 0;
        while position < bytes.len() {
            let (terminal, length) = parser
                .lex_next(&bytes[position..])
                .ok_or(ParseError::UnexpectedInput(position))?;
            if parser.expects(terminal) {
                parser.feed(terminal)?;
            }
            position += length;
        }
        Ok(parser)
    }
}

/// A parser that consumes terminals one at a time.
#[derive(Debug, Clone)]
pub struct InteractiveParser<'a> {
    parser: &'a Parser,
    stack: Vec<usize>,
}

impl<'a> InteractiveParser<'a> {
    /// The current parser state.
    pub fn state(&self) -> usize {
        self.stack.last().copied().unwrap_or_default()
    }

    /// Checks whether the action table of the current state has an entry for the terminal.
    ///
    /// Because of LALR(1) default reductions, feeding such a terminal may still fail; see [`InteractiveParser::accepts`].
    pub fn expects(&self, terminal: TerminalID) -> bool {
        self.parser.actions[self.state()].contains_key(&terminal)
    }

    /// Feeds a terminal to the parser, performing every reduction it triggers.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnexpectedTerminal`] when the terminal cannot follow the input consumed so far.
    /// The parser may be left in an intermediate state in this case.
    pub fn feed(&mut self, terminal: TerminalID) -> Result<(), ParseError> {
        let parser = self.parser;
        let unexpected =
            || ParseError::UnexpectedTerminal(parser.grammar.terminal_name(terminal).to_string());
        loop {
            match self.parser.action(self.state(), terminal) {
                None => return Err(unexpected()),
                Some(Action::Accept) => return Ok(()),
                Some(Action::Shift(next)) => {
                    self.stack.push(next);
                    return Ok(());
                }
                Some(Action::Reduce(production)) => {
                    let length = self.parser.grammar.production_rhs(production).len();
                    self.stack
                        .truncate(self.stack.len().saturating_sub(length).max(1));
                    let lhs = self.parser.grammar.production_lhs(production);
                    match self.parser.gotos[self.state()].get(&lhs) {
                        Some(&next) => self.stack.push(next),
                        None => return Err(unexpected()),
                    }
                }
            }
        }
    }

    /// Gets the terminals that can be fed next, in ascending order of their ids.
    ///
    /// [`TerminalID::END`] is included when the input consumed so far is a complete sentence.
    pub fn accepts(&self) -> Vec<TerminalID> {
        let mut accepts: Vec<TerminalID> = self.parser.actions[self.state()]
            .keys()
            .copied()
            .filter(|&terminal| self.clone().feed(terminal).is_ok())
            .collect();
        accepts.sort_unstable();
        accepts
    }

    /// Finds the terminal at the start of `bytes` and its length in bytes.
    pub(crate) fn lex_next(&self, bytes: &[u8]) -> Option<(TerminalID, usize)> {
        let grammar = &self.parser.grammar;
        self.parser.actions[self.state()]
            .keys()
            .copied()
            .chain(grammar.ignored_terminals().iter().copied())
            .filter_map(|terminal| {
                let automaton = grammar.terminal(terminal).automaton()?;
                let length = automaton.longest_match(bytes).filter(|&x| x > 0)?;
                Some((terminal, length))
            })
            .max_by_key(|&(terminal, length)| {
                let terminal = grammar.terminal(terminal);
                (
                    terminal.priority(),
                    length,
                    terminal.is_literal(),
                    Reverse(terminal.order()),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARITHMETIC: &str = "start: expr\n\
        expr: expr \"+\" term | term\n\
        term: NUMBER | \"(\" expr \")\"\n\
        %import common.NUMBER\n\
        %import common.WS\n\
        %ignore WS";

    fn accepts<'a>(parser: &'a Parser, text: &str) -> Vec<&'a str> {
        parser
            .parse_prefix(text)
            .unwrap()
            .accepts()
            .into_iter()
            .map(|x| parser.grammar().terminal_name(x))
            .collect()
    }

    #[test]
    fn arithmetic_frontier() {
        let parser = Parser::new(Grammar::new(ARITHMETIC).unwrap()).unwrap();
        assert_eq!(accepts(&parser, ""), vec!["NUMBER", "LPAR"]);
        assert_eq!(accepts(&parser, "1"), vec!["$END", "PLUS"]);
        assert_eq!(accepts(&parser, "1 +"), vec!["NUMBER", "LPAR"]);
        assert_eq!(accepts(&parser, "1 + (2"), vec!["PLUS", "RPAR"]);
        assert_eq!(accepts(&parser, "(1 + 2) "), vec!["$END", "PLUS"]);
    }

    #[test]
    fn invalid_prefix() {
        let parser = Parser::new(Grammar::new(ARITHMETIC).unwrap()).unwrap();
        assert_eq!(
            parser.parse_prefix("1 1").unwrap_err(),
            ParseError::UnexpectedInput(2)
        );
        assert!(parser.parse_prefix("1 )").is_err());
        assert!(parser.parse_prefix("+").is_err());
    }

    #[test]
    fn contextual_lexing() {
        let parser = Parser::new(
            Grammar::new("start: \"if\" NAME\nNAME: /[a-z]+/\n%ignore \" \"").unwrap(),
        )
        .unwrap();
        assert_eq!(accepts(&parser, "if ifx"), vec!["$END"]);
        assert_eq!(accepts(&parser, "if"), vec!["NAME"]);
    }

    #[test]
    fn literal_wins_ties() {
        let parser =
            Parser::new(Grammar::new("start: (NAME | \"if\")+\nNAME: /[a-z]+/").unwrap()).unwrap();
        let grammar = parser.grammar();
        let interactive = parser.interactive();
        assert_eq!(
            interactive.lex_next(b"if"),
            Some((grammar.terminal_id("IF").unwrap(), 2))
        );
        assert_eq!(
            interactive.lex_next(b"ifs"),
            Some((grammar.terminal_id("NAME").unwrap(), 3))
        );
        assert_eq!(interactive.lex_next(b"0"), None);
    }

    #[test]
    fn priority_beats_length() {
        let parser = Parser::new(
            Grammar::new("start: (KW | NAME)+\nKW.2: \"if\"\nNAME: /[a-z]+/").unwrap(),
        )
        .unwrap();
        let grammar = parser.grammar();
        let interactive = parser.interactive();
        assert_eq!(
            interactive.lex_next(b"ifx"),
            Some((grammar.terminal_id("KW").unwrap(), 2))
        );
        assert_eq!(
            interactive.lex_next(b"xif"),
            Some((grammar.terminal_id("NAME").unwrap(), 3))
        );
        // KW then NAME.
        assert!(accepts(&parser, "ifx").contains(&"$END"));
    }

    #[test]
    fn feed_and_accept() {
        let parser = Parser::new(Grammar::new("start: \"a\" \"b\"").unwrap()).unwrap();
        let grammar = parser.grammar();
        let a = grammar.terminal_id("A").unwrap();
        let b = grammar.terminal_id("B").unwrap();
        let mut interactive = parser.interactive();
        assert!(interactive.feed(b).is_err());
        let mut interactive2 = parser.interactive();
        interactive2.feed(a).unwrap();
        interactive2.feed(b).unwrap();
        assert_eq!(interactive2.accepts(), vec![TerminalID::END]);
        interactive2.feed(TerminalID::END).unwrap();
        interactive = interactive2;
        assert!(interactive.feed(a).is_err());
    }

    #[test]
    fn conflicts() {
        assert!(matches!(
            Parser::new(Grammar::new("start: a | b\na: \"x\"\nb: \"x\"").unwrap()),
            Err(CreateParserError::ReduceReduceConflict { .. })
        ));
        // Ambiguous but resolvable by shifting.
        let parser =
            Parser::new(Grammar::new("start: start \"+\" start | \"x\"").unwrap()).unwrap();
        assert_eq!(accepts(&parser, "x+x"), vec!["$END", "PLUS"]);
    }

    #[test]
    fn optional_and_repeated_items() {
        let parser = Parser::new(
            Grammar::new("start: [\"-\"] DIGITS \";\"*\nDIGITS: /[0-9]+/").unwrap(),
        )
        .unwrap();
        assert_eq!(accepts(&parser, ""), vec!["MINUS", "DIGITS"]);
        assert_eq!(accepts(&parser, "-1"), vec!["$END", "SEMICOLON"]);
        assert_eq!(accepts(&parser, "1;;"), vec!["$END", "SEMICOLON"]);
    }
}
