//! The grammar module that contains the grammar struct in BNF form and the front-end that builds it from
//! a lark-style EBNF grammar string.
use std::fmt::Debug;

use ahash::{AHashMap, AHashSet};
use jaggedarray::jagged_array::JaggedArray;
use jaggedarray::jagged_array::JaggedArrayViewTrait;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{anychar, char, digit1, multispace1, none_of, one_of, satisfy};
use nom::combinator::{all_consuming, map, map_res, not, opt, recognize, value};
use nom::error::{context, VerboseError};
use nom::multi::{many0, many0_count, many1_count, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;
use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::automaton::{Automaton, PatternError, START_STATE};
use crate::config::Config;

/// The name of the end-of-input terminal.
pub const END_TERMINAL_NAME: &str = "$END";
/// The name of the augmented root nonterminal.
pub const ROOT_NONTERMINAL_NAME: &str = "$root";

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents the terminal id in the grammar.
pub struct TerminalID(pub u32);

impl TerminalID {
    /// The end-of-input terminal, which every grammar has.
    pub const END: TerminalID = TerminalID(0);

    /// Get the display form of the terminal id.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!("{}[{}]", grammar.terminal_name(*self), self.0)
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents the nonterminal id in the grammar.
pub struct NonterminalID(pub u32);

impl NonterminalID {
    /// The augmented root nonterminal, whose only production derives the start rule.
    pub const ROOT: NonterminalID = NonterminalID(0);

    /// Get the display form of the nonterminal id.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!("{}[{}]", grammar.nonterminal_name(*self), self.0)
    }
}

/// A symbol on the right hand side of a production.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum Symbol {
    /// A terminal.
    Terminal(TerminalID),
    /// A nonterminal.
    Nonterminal(NonterminalID),
}

/// A terminal of the grammar, i.e. a lexer rule.
#[derive(Clone)]
pub struct Terminal {
    name: DefaultSymbol,
    pattern: String,
    priority: i32,
    is_literal: bool,
    order: usize,
    automaton: Option<Automaton>,
}

impl Terminal {
    /// The regular expression of the terminal. It is empty for the end-of-input terminal.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The lexing priority of the terminal.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether the terminal is defined by a string literal.
    pub fn is_literal(&self) -> bool {
        self.is_literal
    }

    pub(crate) fn order(&self) -> usize {
        self.order
    }

    pub(crate) fn automaton(&self) -> Option<&Automaton> {
        self.automaton.as_ref()
    }
}

/// The grammar struct that stores the grammar in BNF form.
///
/// Nonterminal `0` is the augmented root `$root` and production `0` is `$root -> start`.
/// Terminal `0` is the end-of-input terminal `$END`.
#[derive(Clone)]
pub struct Grammar {
    interned_strings: DefaultStringInterner,
    terminals: Vec<Terminal>,
    terminal_ids: AHashMap<String, TerminalID>,
    nonterminals: Vec<DefaultSymbol>,
    production_lhs: Vec<NonterminalID>,
    production_rhs: JaggedArray<Symbol, Vec<usize>, 2>,
    ignored_terminals: Vec<TerminalID>,
}

#[derive(Debug, thiserror::Error)]
/// The error type for errors in Grammar creation.
pub enum CreateGrammarError {
    #[error("Grammar parsing error: {0}")]
    /// Error due to parsing the grammar string.
    ParsingError(#[from] nom::Err<VerboseError<String>>), // The str is cloned to remove the lifetime
    #[error("The symbol {0:?} is used but never defined.")]
    /// A rule or terminal is referenced but not defined.
    UndefinedSymbol(String),
    #[error("The symbol {0:?} is defined more than once.")]
    /// A rule or terminal is defined more than once.
    DuplicateDefinition(String),
    #[error("The start rule {0:?} is not defined.")]
    /// The configured start rule does not exist.
    MissingStartRule(String),
    #[error("The terminal {0:?} is defined in terms of itself.")]
    /// A terminal refers to itself, directly or indirectly.
    RecursiveTerminal(String),
    #[error("The terminal {terminal:?} refers to the rule {rule:?}. Terminals can only refer to other terminals.")]
    /// A terminal refers to a rule.
    RuleInTerminal {
        /// The terminal.
        terminal: String,
        /// The rule.
        rule: String,
    },
    #[error("The terminal {name:?} has an invalid pattern: {source}")]
    /// The pattern of a terminal cannot be compiled.
    InvalidTerminalPattern {
        /// The terminal.
        name: String,
        /// The underlying error.
        #[source]
        source: PatternError,
    },
    #[error("The terminal {0:?} matches the empty string. Terminals cannot be empty.")]
    /// A terminal matches the empty string.
    EmptyTerminal(String),
    #[error("Cannot import {0:?}. Only the terminals of the `common` module are available.")]
    /// An import refers to an unknown module or terminal.
    UnsupportedImport(String),
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field(
                "terminals",
                &self
                    .terminal_ids()
                    .map(|id| {
                        format!(
                            "{} /{}/",
                            id.to_display_form(self),
                            self.terminal(id).pattern()
                        )
                    })
                    .collect::<Vec<_>>(),
            )
            .field(
                "productions",
                &(0..self.num_productions())
                    .map(|p| self.format_production(p))
                    .collect::<Vec<_>>(),
            )
            .field(
                "ignored_terminals",
                &self
                    .ignored_terminals
                    .iter()
                    .map(|x| x.to_display_form(self))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Grammar {
    /// Creates a new [`Grammar`] from a grammar string with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the grammar string is malformed or semantically invalid.
    pub fn new(grammar_str: &str) -> Result<Self, CreateGrammarError> {
        Self::with_config(grammar_str, &Config::default())
    }

    /// Creates a new [`Grammar`] from a grammar string.
    ///
    /// The grammar language is a subset of lark's:
    ///
    /// ```text
    /// // Rules are lowercase. `?` and `!` prefixes are accepted and have no effect.
    /// start: pair ("," pair)*
    /// ?pair: KEY "=" value
    ///      | KEY
    /// value: NUMBER | [SIGN] WORD+
    /// // Terminals are uppercase and may have a priority.
    /// KEY.2: /[a-z]+/
    /// SIGN: "+" | "-"
    /// %import common.NUMBER
    /// %import common (WORD, WS)
    /// %ignore WS
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the grammar string is malformed or semantically invalid.
    pub fn with_config(grammar_str: &str, config: &Config) -> Result<Self, CreateGrammarError> {
        let (_, statements) = parse_grammar(grammar_str).map_err(|e| match e {
            nom::Err::Error(e) => nom::Err::Error(VerboseError {
                errors: e
                    .errors
                    .into_iter()
                    .map(|(e, v)| (e.to_string(), v))
                    .collect::<Vec<_>>(),
            }),
            nom::Err::Failure(e) => nom::Err::Failure(VerboseError {
                errors: e
                    .errors
                    .into_iter()
                    .map(|(e, v)| (e.to_string(), v))
                    .collect::<Vec<_>>(),
            }),
            nom::Err::Incomplete(e) => nom::Err::Incomplete(e),
        })?;
        GrammarBuilder::build(&statements, config)
    }

    /// The number of terminals, including the end-of-input terminal.
    pub fn num_terminals(&self) -> usize {
        self.terminals.len()
    }

    /// The number of nonterminals, including the augmented root.
    pub fn num_nonterminals(&self) -> usize {
        self.nonterminals.len()
    }

    /// The number of productions, including the augmented root production.
    pub fn num_productions(&self) -> usize {
        self.production_lhs.len()
    }

    /// Iterates over all terminal ids.
    pub fn terminal_ids(&self) -> impl Iterator<Item = TerminalID> {
        (0..self.terminals.len() as u32).map(TerminalID)
    }

    /// Gets the terminal.
    ///
    /// # Panics
    ///
    /// Panics if the terminal id does not belong to this grammar.
    pub fn terminal(&self, terminal_id: TerminalID) -> &Terminal {
        &self.terminals[terminal_id.0 as usize]
    }

    /// Gets the name of the terminal.
    pub fn terminal_name(&self, terminal_id: TerminalID) -> &str {
        self.terminals
            .get(terminal_id.0 as usize)
            .and_then(|x| self.interned_strings.resolve(x.name))
            .unwrap_or_default()
    }

    /// Gets the terminal id from its name.
    pub fn terminal_id(&self, name: &str) -> Option<TerminalID> {
        self.terminal_ids.get(name).copied()
    }

    /// Gets the name of the nonterminal.
    pub fn nonterminal_name(&self, nonterminal_id: NonterminalID) -> &str {
        self.nonterminals
            .get(nonterminal_id.0 as usize)
            .and_then(|&x| self.interned_strings.resolve(x))
            .unwrap_or_default()
    }

    /// Gets the left hand side of the production.
    pub fn production_lhs(&self, production: usize) -> NonterminalID {
        self.production_lhs[production]
    }

    /// Gets the right hand side of the production.
    pub fn production_rhs(&self, production: usize) -> &[Symbol] {
        self.production_rhs.view([production]).as_slice()
    }

    /// The terminals skipped by the lexer wherever they appear.
    pub fn ignored_terminals(&self) -> &[TerminalID] {
        &self.ignored_terminals
    }

    /// Gets the display form of the production.
    pub fn format_production(&self, production: usize) -> String {
        let mut result = format!(
            "{} ->",
            self.nonterminal_name(self.production_lhs(production))
        );
        for symbol in self.production_rhs(production) {
            result.push(' ');
            match *symbol {
                Symbol::Terminal(x) => result.push_str(self.terminal_name(x)),
                Symbol::Nonterminal(x) => result.push_str(self.nonterminal_name(x)),
            }
        }
        result
    }
}

// lark's `common.lark`, flattened into regular expressions.
const COMMON_TERMINALS: &[(&str, &str)] = &[
    ("DIGIT", "[0-9]"),
    ("HEXDIGIT", "[a-fA-F0-9]"),
    ("INT", "[0-9]+"),
    ("SIGNED_INT", "[+-]?[0-9]+"),
    ("DECIMAL", "[0-9]+\\.[0-9]*|\\.[0-9]+"),
    ("FLOAT", "[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\\.[0-9]*|\\.[0-9]+)(?:[eE][+-]?[0-9]+)?"),
    ("SIGNED_FLOAT", "[+-]?(?:[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\\.[0-9]*|\\.[0-9]+)(?:[eE][+-]?[0-9]+)?)"),
    ("NUMBER", "[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\\.[0-9]*|\\.[0-9]+)(?:[eE][+-]?[0-9]+)?|[0-9]+"),
    ("SIGNED_NUMBER", "[+-]?(?:[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\\.[0-9]*|\\.[0-9]+)(?:[eE][+-]?[0-9]+)?|[0-9]+)"),
    ("ESCAPED_STRING", "\"(?:[^\"\\\\\\n]|\\\\.)*\""),
    ("LCASE_LETTER", "[a-z]"),
    ("UCASE_LETTER", "[A-Z]"),
    ("LETTER", "[a-zA-Z]"),
    ("WORD", "[a-zA-Z]+"),
    ("CNAME", "[_a-zA-Z][_a-zA-Z0-9]*"),
    ("WS_INLINE", "[ \\t]+"),
    ("WS", "[ \\t\\f\\r\\n]+"),
    ("CR", "\\r"),
    ("LF", "\\n"),
    ("NEWLINE", "(?:\\r?\\n)+"),
];

const PUNCTUATION_NAMES: &[(&str, &str)] = &[
    (".", "DOT"),
    (",", "COMMA"),
    (":", "COLON"),
    (";", "SEMICOLON"),
    ("+", "PLUS"),
    ("-", "MINUS"),
    ("*", "STAR"),
    ("/", "SLASH"),
    ("\\", "BACKSLASH"),
    ("|", "VBAR"),
    ("?", "QMARK"),
    ("!", "BANG"),
    ("@", "AT"),
    ("#", "HASH"),
    ("$", "DOLLAR"),
    ("%", "PERCENT"),
    ("^", "CIRCUMFLEX"),
    ("&", "AMPERSAND"),
    ("_", "UNDERSCORE"),
    ("<", "LESSTHAN"),
    (">", "MORETHAN"),
    ("=", "EQUAL"),
    ("\"", "DBLQUOTE"),
    ("'", "QUOTE"),
    ("`", "BACKQUOTE"),
    ("~", "TILDE"),
    ("(", "LPAR"),
    (")", "RPAR"),
    ("{", "LBRACE"),
    ("}", "RBRACE"),
    ("[", "LSQB"),
    ("]", "RSQB"),
    (" ", "SPACE"),
    ("\n", "NEWLINE"),
    ("\t", "TAB"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Literal {
        value: String,
        case_insensitive: bool,
    },
    Regex {
        pattern: String,
        flags: String,
    },
    Name(String),
    Sequence(Vec<Expr>),
    Alternatives(Vec<Expr>),
    Optional(Box<Expr>),
    ZeroOrMore(Box<Expr>),
    OneOrMore(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Definition {
        name: String,
        priority: Option<i32>,
        expansion: Expr,
    },
    Ignore(Expr),
    Import {
        module: String,
        // (name, alias)
        names: Vec<(String, String)>,
    },
}

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn is_terminal_name(name: &str) -> bool {
    name.trim_start_matches('_')
        .starts_with(|c: char| c.is_ascii_uppercase())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn comment(input: &str) -> ParseResult<&str> {
    recognize(pair(tag("//"), take_while(|c: char| c != '\n')))(input)
}

/// Skips spaces and comments within a line.
fn space(input: &str) -> ParseResult<()> {
    value(
        (),
        many0_count(alt((value((), one_of(" \t\r")), value((), comment)))),
    )(input)
}

/// Skips spaces, comments and line breaks.
fn blank(input: &str) -> ParseResult<()> {
    value(
        (),
        many0_count(alt((value((), multispace1), value((), comment)))),
    )(input)
}

fn line_breaks(input: &str) -> ParseResult<()> {
    value((), pair(space, many1_count(pair(char('\n'), space))))(input)
}

fn token<'a, O>(
    parser: impl FnMut(&'a str) -> ParseResult<'a, O>,
) -> impl FnMut(&'a str) -> ParseResult<'a, O> {
    preceded(space, parser)
}

fn name(input: &str) -> ParseResult<&str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_name_char),
    ))(input)
}

fn unescape_literal(body: &str) -> String {
    let mut result = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('f') => result.push('\x0C'),
            Some('0') => result.push('\0'),
            Some(c @ ('\\' | '"' | '\'')) => result.push(c),
            Some(c @ ('x' | 'u')) => {
                let width = if c == 'x' { 2 } else { 4 };
                let digits: String = chars.clone().take(width).collect();
                match u32::from_str_radix(&digits, 16)
                    .ok()
                    .filter(|_| digits.len() == width)
                    .and_then(char::from_u32)
                {
                    Some(decoded) => {
                        result.push(decoded);
                        chars.nth(width - 1);
                    }
                    None => {
                        result.push('\\');
                        result.push(c);
                    }
                }
            }
            Some(c) => {
                result.push('\\');
                result.push(c);
            }
            None => result.push('\\'),
        }
    }
    result
}

fn string_literal(input: &str) -> ParseResult<Expr> {
    let (input, body) = delimited(
        char('"'),
        recognize(many0_count(alt((
            recognize(pair(char('\\'), anychar)),
            recognize(none_of("\\\"\n")),
        )))),
        char('"'),
    )(input)?;
    let (input, flag) = opt(terminated(char('i'), not(satisfy(is_name_char))))(input)?;
    Ok((
        input,
        Expr::Literal {
            value: unescape_literal(body),
            case_insensitive: flag.is_some(),
        },
    ))
}

fn regex_literal(input: &str) -> ParseResult<Expr> {
    let (input, body) = delimited(
        char('/'),
        recognize(many1_count(alt((
            recognize(pair(char('\\'), none_of("\n"))),
            recognize(none_of("/\\\n")),
        )))),
        char('/'),
    )(input)?;
    let (input, flags) = take_while(|c: char| "imslux".contains(c))(input)?;
    Ok((
        input,
        Expr::Regex {
            pattern: body.replace("\\/", "/"),
            flags: flags.chars().filter(|c| "imsx".contains(*c)).collect(),
        },
    ))
}

fn sequence(items: Vec<Expr>) -> Expr {
    match <[Expr; 1]>::try_from(items) {
        Ok([item]) => item,
        Err(items) => Expr::Sequence(items),
    }
}

fn alternatives(items: Vec<Expr>) -> Expr {
    match <[Expr; 1]>::try_from(items) {
        Ok([item]) => item,
        Err(items) => Expr::Alternatives(items),
    }
}

fn atom(input: &str) -> ParseResult<Expr> {
    alt((
        delimited(token(char('(')), expansions, token(char(')'))),
        map(
            delimited(token(char('[')), expansions, token(char(']'))),
            |x| Expr::Optional(Box::new(x)),
        ),
        token(string_literal),
        token(regex_literal),
        map(token(name), |x| Expr::Name(x.to_string())),
    ))(input)
}

fn expr(input: &str) -> ParseResult<Expr> {
    let (input, atom) = atom(input)?;
    let (input, quantifier) = opt(preceded(space, one_of("?*+")))(input)?;
    let expr = match quantifier {
        Some('?') => Expr::Optional(Box::new(atom)),
        Some('*') => Expr::ZeroOrMore(Box::new(atom)),
        Some('+') => Expr::OneOrMore(Box::new(atom)),
        _ => atom,
    };
    Ok((input, expr))
}

fn expansion(input: &str) -> ParseResult<Expr> {
    // An alias only renames tree nodes, which no guide needs.
    map(
        terminated(many0(expr), opt(preceded(token(tag("->")), token(name)))),
        sequence,
    )(input)
}

fn expansions(input: &str) -> ParseResult<Expr> {
    map(
        separated_list1(preceded(opt(line_breaks), token(char('|'))), expansion),
        alternatives,
    )(input)
}

fn definition(input: &str) -> ParseResult<Statement> {
    let (input, _) = opt(one_of("?!"))(input)?;
    let (input, name) = name(input)?;
    let (input, priority) = opt(preceded(
        char('.'),
        map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i32>),
    ))(input)?;
    let (input, _) = token(char(':'))(input)?;
    let (input, expansion) = expansions(input)?;
    Ok((
        input,
        Statement::Definition {
            name: name.to_string(),
            priority,
            expansion,
        },
    ))
}

fn ignore(input: &str) -> ParseResult<Statement> {
    map(preceded(tag("%ignore"), expansions), Statement::Ignore)(input)
}

fn import(input: &str) -> ParseResult<Statement> {
    let (input, _) = tag("%import")(input)?;
    let (input, path) = token(recognize(separated_list1(char('.'), name)))(input)?;
    let (input, list) = opt(delimited(
        token(char('(')),
        separated_list1(token(char(',')), token(name)),
        token(char(')')),
    ))(input)?;
    if let Some(list) = list {
        return Ok((
            input,
            Statement::Import {
                module: path.to_string(),
                names: list
                    .into_iter()
                    .map(|x| (x.to_string(), x.to_string()))
                    .collect(),
            },
        ));
    }
    let (input, alias) = opt(preceded(token(tag("->")), token(name)))(input)?;
    let (module, name) = path.rsplit_once('.').unwrap_or(("", path));
    Ok((
        input,
        Statement::Import {
            module: module.to_string(),
            names: vec![(name.to_string(), alias.unwrap_or(name).to_string())],
        },
    ))
}

fn statement(input: &str) -> ParseResult<Statement> {
    preceded(
        space,
        alt((
            context("ignore", ignore),
            context("import", import),
            context("definition", definition),
        )),
    )(input)
}

fn parse_grammar(input: &str) -> ParseResult<Vec<Statement>> {
    all_consuming(delimited(
        blank,
        separated_list0(line_breaks, statement),
        blank,
    ))(input)
}

#[derive(Debug, Clone)]
struct TerminalPattern {
    regex: String,
    is_literal: bool,
    priority: i32,
    order: usize,
}

/// Flattens terminal definitions into regular expressions.
struct TerminalResolver<'a> {
    definitions: AHashMap<&'a str, (usize, i32, &'a Expr)>,
    resolved: AHashMap<String, TerminalPattern>,
    visiting: Vec<String>,
}

impl<'a> TerminalResolver<'a> {
    fn is_defined(&self, name: &str) -> bool {
        self.definitions.contains_key(name) || self.resolved.contains_key(name)
    }

    fn resolve(&mut self, name: &str) -> Result<TerminalPattern, CreateGrammarError> {
        if let Some(pattern) = self.resolved.get(name) {
            return Ok(pattern.clone());
        }
        let &(order, priority, expr) = self
            .definitions
            .get(name)
            .ok_or_else(|| CreateGrammarError::UndefinedSymbol(name.to_string()))?;
        if self.visiting.iter().any(|x| x == name) {
            return Err(CreateGrammarError::RecursiveTerminal(name.to_string()));
        }
        self.visiting.push(name.to_string());
        let (regex, is_literal) = self.pattern_of(name, expr)?;
        self.visiting.pop();
        let pattern = TerminalPattern {
            regex,
            is_literal,
            priority,
            order,
        };
        self.resolved.insert(name.to_string(), pattern.clone());
        Ok(pattern)
    }

    /// The pattern of a whole terminal and whether it is a string literal.
    fn pattern_of(&mut self, owner: &str, expr: &Expr) -> Result<(String, bool), CreateGrammarError> {
        Ok(match expr {
            Expr::Literal {
                value,
                case_insensitive: false,
            } => (regex_syntax::escape(value), true),
            Expr::Literal { .. } => (self.regex_of(owner, expr)?, true),
            Expr::Regex { pattern, flags } if flags.is_empty() => (pattern.clone(), false),
            Expr::Name(name) if is_terminal_name(name) => {
                let pattern = self.resolve(name)?;
                (pattern.regex, pattern.is_literal)
            }
            _ => (self.regex_of(owner, expr)?, false),
        })
    }

    /// A regular expression fragment that can be concatenated or quantified.
    fn regex_of(&mut self, owner: &str, expr: &Expr) -> Result<String, CreateGrammarError> {
        Ok(match expr {
            Expr::Literal {
                value,
                case_insensitive: false,
            } => format!("(?:{})", regex_syntax::escape(value)),
            Expr::Literal {
                value,
                case_insensitive: true,
            } => format!("(?i:{})", regex_syntax::escape(value)),
            Expr::Regex { pattern, flags } => format!("(?{}:{})", flags, pattern),
            Expr::Name(name) if is_terminal_name(name) => {
                format!("(?:{})", self.resolve(name)?.regex)
            }
            Expr::Name(name) => {
                return Err(CreateGrammarError::RuleInTerminal {
                    terminal: owner.to_string(),
                    rule: name.clone(),
                })
            }
            Expr::Sequence(items) => format!(
                "(?:{})",
                items
                    .iter()
                    .map(|x| self.regex_of(owner, x))
                    .collect::<Result<Vec<_>, _>>()?
                    .concat()
            ),
            Expr::Alternatives(items) => format!(
                "(?:{})",
                items
                    .iter()
                    .map(|x| self.regex_of(owner, x))
                    .collect::<Result<Vec<_>, _>>()?
                    .join("|")
            ),
            Expr::Optional(item) => format!("{}?", self.regex_of(owner, item)?),
            Expr::ZeroOrMore(item) => format!("{}*", self.regex_of(owner, item)?),
            Expr::OneOrMore(item) => format!("{}+", self.regex_of(owner, item)?),
        })
    }
}

/// Lowers the parsed statements into BNF, the way lark does:
/// optional items and groups are expanded inline, `x+` becomes a fresh left-recursive rule and
/// `x*` becomes an optional `x+`.
struct GrammarBuilder<'a> {
    config: &'a Config,
    resolver: TerminalResolver<'a>,
    pattern_to_name: AHashMap<(String, bool), String>,
    rule_ids: AHashMap<String, NonterminalID>,
    interned_strings: DefaultStringInterner,
    terminals: Vec<Terminal>,
    terminal_ids: AHashMap<String, TerminalID>,
    nonterminals: Vec<DefaultSymbol>,
    productions: Vec<(NonterminalID, Vec<Symbol>)>,
    num_anonymous_terminals: usize,
    num_generated_rules: usize,
}

fn dedup_alternatives(alternatives: Vec<Vec<Symbol>>) -> Vec<Vec<Symbol>> {
    let mut seen = AHashSet::with_capacity(alternatives.len());
    alternatives
        .into_iter()
        .filter(|x| seen.insert(x.clone()))
        .collect()
}

impl<'a> GrammarBuilder<'a> {
    fn build(statements: &'a [Statement], config: &'a Config) -> Result<Grammar, CreateGrammarError> {
        let mut terminal_definitions: Vec<(&str, i32, &Expr)> = Vec::new();
        let mut rule_definitions: Vec<(&str, &Expr)> = Vec::new();
        let mut ignores: Vec<&Expr> = Vec::new();
        let mut imported: Vec<(&str, Expr)> = Vec::new();
        let mut defined: AHashSet<&str> = AHashSet::default();
        for statement in statements {
            match statement {
                Statement::Definition {
                    name,
                    priority,
                    expansion,
                } => {
                    if !defined.insert(name.as_str()) {
                        return Err(CreateGrammarError::DuplicateDefinition(name.clone()));
                    }
                    if is_terminal_name(name) {
                        terminal_definitions.push((name.as_str(), priority.unwrap_or(0), expansion));
                    } else {
                        rule_definitions.push((name.as_str(), expansion));
                    }
                }
                Statement::Ignore(expr) => ignores.push(expr),
                Statement::Import { module, names } => {
                    for (name, alias) in names {
                        let pattern = COMMON_TERMINALS
                            .iter()
                            .find(|(x, _)| *x == name.as_str())
                            .filter(|_| module == "common")
                            .ok_or_else(|| {
                                CreateGrammarError::UnsupportedImport(format!("{module}.{name}"))
                            })?
                            .1;
                        if !defined.insert(alias.as_str()) {
                            return Err(CreateGrammarError::DuplicateDefinition(alias.clone()));
                        }
                        imported.push((
                            alias.as_str(),
                            Expr::Regex {
                                pattern: pattern.to_string(),
                                flags: String::new(),
                            },
                        ));
                    }
                }
            }
        }
        terminal_definitions.extend(imported.iter().map(|(name, expr)| (*name, 0, expr)));
        let mut resolver = TerminalResolver {
            definitions: terminal_definitions
                .iter()
                .enumerate()
                .map(|(order, &(name, priority, expr))| (name, (order, priority, expr)))
                .collect(),
            resolved: AHashMap::default(),
            visiting: Vec::new(),
        };
        let mut pattern_to_name = AHashMap::default();
        for &(name, _, _) in terminal_definitions.iter() {
            let pattern = resolver.resolve(name)?;
            pattern_to_name
                .entry((pattern.regex, pattern.is_literal))
                .or_insert_with(|| name.to_string());
        }
        let mut builder = GrammarBuilder {
            config,
            resolver,
            pattern_to_name,
            rule_ids: AHashMap::default(),
            interned_strings: DefaultStringInterner::default(),
            terminals: Vec::new(),
            terminal_ids: AHashMap::default(),
            nonterminals: Vec::new(),
            productions: Vec::new(),
            num_anonymous_terminals: 0,
            num_generated_rules: 0,
        };
        let end = builder.interned_strings.get_or_intern(END_TERMINAL_NAME);
        builder.terminals.push(Terminal {
            name: end,
            pattern: String::new(),
            priority: 0,
            is_literal: false,
            order: usize::MAX,
            automaton: None,
        });
        builder
            .terminal_ids
            .insert(END_TERMINAL_NAME.to_string(), TerminalID::END);
        let root = builder.new_nonterminal(ROOT_NONTERMINAL_NAME);
        for &(name, _) in rule_definitions.iter() {
            let id = builder.new_nonterminal(name);
            builder.rule_ids.insert(name.to_string(), id);
        }
        let start = *builder
            .rule_ids
            .get(&config.start_nonterminal)
            .ok_or_else(|| CreateGrammarError::MissingStartRule(config.start_nonterminal.clone()))?;
        builder
            .productions
            .push((root, vec![Symbol::Nonterminal(start)]));
        for &(name, expr) in rule_definitions.iter() {
            let lhs = builder.rule_ids[name];
            let alternatives = builder.expand(name, expr)?;
            for alternative in dedup_alternatives(alternatives) {
                builder.productions.push((lhs, alternative));
            }
        }
        let mut ignored_terminals = Vec::new();
        for expr in ignores {
            let terminal = match expr {
                Expr::Name(name) if is_terminal_name(name) => builder.use_terminal(name)?,
                Expr::Name(name) => {
                    return Err(CreateGrammarError::RuleInTerminal {
                        terminal: "%ignore".to_string(),
                        rule: name.clone(),
                    })
                }
                _ => builder.anonymous_terminal(expr)?,
            };
            if !ignored_terminals.contains(&terminal) {
                ignored_terminals.push(terminal);
            }
        }
        let num_unused = terminal_definitions
            .iter()
            .filter(|(name, _, _)| !builder.terminal_ids.contains_key(*name))
            .count();
        if num_unused > 0 {
            log::debug!(
                "{} terminal definitions are only used inside other terminals or not used at all.",
                num_unused
            );
        }
        let mut production_lhs = Vec::with_capacity(builder.productions.len());
        let mut production_rhs = JaggedArray::<Symbol, Vec<usize>, 2>::new();
        for (lhs, rhs) in builder.productions {
            production_lhs.push(lhs);
            production_rhs.new_row::<0>();
            production_rhs.extend_last_row_from_slice(&rhs);
        }
        log::debug!(
            "Built a grammar with {} terminals, {} nonterminals and {} productions.",
            builder.terminals.len(),
            builder.nonterminals.len(),
            production_lhs.len()
        );
        Ok(Grammar {
            interned_strings: builder.interned_strings,
            terminals: builder.terminals,
            terminal_ids: builder.terminal_ids,
            nonterminals: builder.nonterminals,
            production_lhs,
            production_rhs,
            ignored_terminals,
        })
    }

    fn new_nonterminal(&mut self, name: &str) -> NonterminalID {
        let id = NonterminalID(self.nonterminals.len() as u32);
        self.nonterminals
            .push(self.interned_strings.get_or_intern(name));
        id
    }

    fn use_terminal(&mut self, name: &str) -> Result<TerminalID, CreateGrammarError> {
        if let Some(&id) = self.terminal_ids.get(name) {
            return Ok(id);
        }
        let pattern = self.resolver.resolve(name)?;
        let automaton =
            Automaton::compile_with_config(&pattern.regex, &self.config.regex_config).map_err(
                |source| CreateGrammarError::InvalidTerminalPattern {
                    name: name.to_string(),
                    source,
                },
            )?;
        if automaton.is_final(START_STATE) {
            return Err(CreateGrammarError::EmptyTerminal(name.to_string()));
        }
        let id = TerminalID(self.terminals.len() as u32);
        self.terminals.push(Terminal {
            name: self.interned_strings.get_or_intern(name),
            pattern: pattern.regex,
            priority: pattern.priority,
            is_literal: pattern.is_literal,
            order: pattern.order,
            automaton: Some(automaton),
        });
        self.terminal_ids.insert(name.to_string(), id);
        Ok(id)
    }

    fn anonymous_terminal(&mut self, expr: &Expr) -> Result<TerminalID, CreateGrammarError> {
        let (regex, is_literal) = self.resolver.pattern_of("<anonymous>", expr)?;
        if let Some(name) = self.pattern_to_name.get(&(regex.clone(), is_literal)) {
            let name = name.clone();
            return self.use_terminal(&name);
        }
        let name = self.anonymous_name(expr);
        let order = self.resolver.definitions.len() + self.num_anonymous_terminals;
        self.num_anonymous_terminals += 1;
        self.resolver.resolved.insert(
            name.clone(),
            TerminalPattern {
                regex: regex.clone(),
                is_literal,
                priority: 0,
                order,
            },
        );
        self.pattern_to_name
            .insert((regex, is_literal), name.clone());
        self.use_terminal(&name)
    }

    fn anonymous_name(&self, expr: &Expr) -> String {
        if let Expr::Literal { value, .. } = expr {
            let upper = value.to_uppercase();
            if value.starts_with(|c: char| c.is_ascii_alphabetic())
                && value.chars().all(is_name_char)
                && !self.resolver.is_defined(&upper)
            {
                return upper;
            }
            if let Some(&(_, name)) = PUNCTUATION_NAMES.iter().find(|(x, _)| *x == value.as_str()) {
                if !self.resolver.is_defined(name) {
                    return name.to_string();
                }
            }
        }
        format!("__ANON_{}", self.num_anonymous_terminals)
    }

    fn expand(&mut self, rule: &str, expr: &Expr) -> Result<Vec<Vec<Symbol>>, CreateGrammarError> {
        Ok(match expr {
            Expr::Name(name) if is_terminal_name(name) => {
                vec![vec![Symbol::Terminal(self.use_terminal(name)?)]]
            }
            Expr::Name(name) => {
                let id = *self
                    .rule_ids
                    .get(name)
                    .ok_or_else(|| CreateGrammarError::UndefinedSymbol(name.clone()))?;
                vec![vec![Symbol::Nonterminal(id)]]
            }
            Expr::Literal { .. } | Expr::Regex { .. } => {
                vec![vec![Symbol::Terminal(self.anonymous_terminal(expr)?)]]
            }
            Expr::Sequence(items) => {
                let mut result = vec![vec![]];
                for item in items {
                    let alternatives = self.expand(rule, item)?;
                    result = result
                        .iter()
                        .flat_map(|prefix| {
                            alternatives.iter().map(move |x| {
                                let mut prefix: Vec<Symbol> = prefix.clone();
                                prefix.extend_from_slice(x);
                                prefix
                            })
                        })
                        .collect();
                }
                result
            }
            Expr::Alternatives(items) => {
                let mut result = Vec::new();
                for item in items {
                    result.extend(self.expand(rule, item)?);
                }
                result
            }
            Expr::Optional(item) => {
                let mut result = self.expand(rule, item)?;
                result.push(vec![]);
                result
            }
            Expr::OneOrMore(item) => {
                vec![vec![Symbol::Nonterminal(self.repetition(rule, item)?)]]
            }
            Expr::ZeroOrMore(item) => {
                vec![vec![Symbol::Nonterminal(self.repetition(rule, item)?)], vec![]]
            }
        })
    }

    fn repetition(&mut self, rule: &str, item: &Expr) -> Result<NonterminalID, CreateGrammarError> {
        let alternatives = dedup_alternatives(self.expand(rule, item)?);
        let id = self.new_nonterminal(&format!("__{}_plus_{}", rule, self.num_generated_rules));
        self.num_generated_rules += 1;
        for alternative in alternatives.iter() {
            self.productions.push((id, alternative.clone()));
        }
        for alternative in alternatives {
            // `x -> x` would only add conflicts.
            if alternative.is_empty() {
                continue;
            }
            let mut rhs = vec![Symbol::Nonterminal(id)];
            rhs.extend(alternative);
            self.productions.push((id, rhs));
        }
        Ok(id)
    }
}
