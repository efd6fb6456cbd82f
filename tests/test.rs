#[cfg(test)]

mod tests {
    use std::{fs::File, io::BufReader, path::Path, sync::Arc};

    use ahash::AHashMap;
    use guidefsm::{
        config::{Config, GuideConfig},
        grammar_guide::CreateGrammarGuideError,
        regex_guide::CreateRegexGuideError,
        GrammarGuide, GuideLike, GuideState, MaskLogitsError, RegexGuide, SharedTokenizer,
        StopGuide, Token, Vocabulary, VocabularyTokenizer,
    };
    use insta::assert_snapshot;

    const EOS: u32 = 3;
    const OBJECT_GRAMMAR: &str = r#"
start: "{" pair "}"
pair: NAME ":" NUMBER
NAME: /[a-z]+/
NUMBER: /[0-9]+/
"#;

    #[derive(Debug, thiserror::Error)]
    /// Error type when reading a JSON vocabulary file.
    pub enum ReadVocabError {
        #[error("IO error: {0}")]
        /// Error due to I/O operations like [Read], [Write], [Seek],
        IoError(#[from] std::io::Error),
        #[error("Serde json error: {0}")]
        JsonError(#[from] serde_json::Error),
    }

    /// Read a vocabulary that maps token IDs to either strings or byte arrays.
    pub fn read_vocab(path: impl AsRef<Path>) -> Result<Vocabulary, ReadVocabError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut id_to_token: AHashMap<u32, Token> = AHashMap::default();
        let mut id_to_token_string: AHashMap<u32, String> = AHashMap::default();
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_reader(reader)?;
        for (key, value) in data {
            let key = key.parse::<u32>().unwrap();
            match value {
                serde_json::Value::Array(x) => {
                    let token: Vec<u8> = x.iter().map(|x| x.as_u64().unwrap() as u8).collect();
                    id_to_token_string.insert(key, format!("{:?}", token));
                    id_to_token.insert(key, Token(token.into_boxed_slice()));
                }
                serde_json::Value::String(x) => {
                    id_to_token.insert(key, Token::from(x.as_str()));
                    id_to_token_string.insert(key, x);
                }
                _ => {
                    panic!("Unexpected value type")
                }
            };
        }
        Ok(Vocabulary::new(id_to_token, id_to_token_string).unwrap())
    }

    fn tokenizer() -> SharedTokenizer {
        let vocab = read_vocab("tests/fixtures/vocab.json").unwrap();
        VocabularyTokenizer::new(Arc::new(vocab), EOS)
            .unwrap()
            .into_shared()
    }

    fn allowed(guide: &mut impl GuideLike, state: GuideState, lane: usize) -> String {
        format!("{:?}", guide.allowed_token_ids(state, lane))
    }

    #[test]
    fn regex_round_trip() {
        let mut guide = RegexGuide::new("ab", tokenizer(), None).unwrap();
        let mut state = GuideState::INITIAL;
        assert_snapshot!(allowed(&mut guide, state, 0), @"[0, 2]");
        state = guide.next_state(state, 0, 0);
        assert!(!guide.is_final_state(state, 0));
        assert_snapshot!(allowed(&mut guide, state, 0), @"[1]");
        state = guide.next_state(state, 1, 0);
        assert!(guide.is_final_state(state, 0));
        assert_snapshot!(allowed(&mut guide, state, 0), @"[3]");
        state = guide.next_state(state, EOS, 0);
        assert_eq!(state, GuideState::END);
        assert!(guide.is_final_state(state, 0));
        assert_snapshot!(allowed(&mut guide, state, 0), @"[3]");
    }

    #[test]
    fn single_token_reaches_final_state() {
        let mut guide = RegexGuide::new("ab", tokenizer(), None).unwrap();
        let state = guide.next_state(GuideState::INITIAL, 0, 0);
        let two_steps = guide.next_state(state, 1, 0);
        let one_step = guide.next_state(GuideState::INITIAL, 2, 0);
        assert_eq!(one_step, two_steps);
        assert!(guide.is_final_state(one_step, 0));
        assert_eq!(guide.next_state(one_step, 0, 0), GuideState::END);
    }

    #[test]
    fn shared_index() {
        let guide = RegexGuide::new("[a-z]+", tokenizer(), None).unwrap();
        let mut other = RegexGuide::from_index(guide.index().clone(), tokenizer(), Some(1));
        assert_snapshot!(allowed(&mut other, GuideState::INITIAL, 0), @"[0, 1, 2, 7]");
        assert_eq!(other.next_state(GuideState::INITIAL, 7, 0), GuideState::END);
    }

    #[test]
    fn stop_guide_budget() {
        let mut guide = StopGuide::new(tokenizer(), EOS, Some(2));
        assert_snapshot!(
            allowed(&mut guide, StopGuide::GENERATING, 0),
            @"[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]"
        );
        let state = guide.next_state(StopGuide::GENERATING, 7, 0);
        assert!(!guide.is_final_state(state, 0));
        let state = guide.next_state(state, 7, 0);
        assert!(guide.is_final_state(state, 0));
        assert_snapshot!(allowed(&mut guide, state, 0), @"[3]");
        assert_eq!(guide.next_state(state, 0, 0), StopGuide::STOPPED);
    }

    #[test]
    fn infeasible_vocabulary() {
        assert!(matches!(
            RegexGuide::new("c+", tokenizer(), None),
            Err(CreateRegexGuideError::VocabularyInfeasible { .. })
        ));
        assert!(matches!(
            GrammarGuide::new("start: \"xyz\"", tokenizer(), None),
            Err(CreateGrammarGuideError::RegexGuideError(
                CreateRegexGuideError::VocabularyInfeasible { .. }
            ))
        ));
        assert!(matches!(
            GrammarGuide::new("start: undefined", tokenizer(), None),
            Err(CreateGrammarGuideError::GrammarError(_))
        ));
    }

    #[test]
    fn grammar_guide_offers_eos_only_at_the_end() {
        let mut guide = GrammarGuide::new(OBJECT_GRAMMAR, tokenizer(), None).unwrap();
        let mut state = GuideState::INITIAL;
        let mut steps = Vec::new();
        for token_id in [4, 7, 8, 12, 5] {
            let allowed = guide.allowed_token_ids(state, 0);
            assert!(!allowed.contains(&EOS));
            assert!(allowed.contains(&token_id));
            assert!(!guide.is_final_state(state, 0));
            steps.push(format!("{:?}", allowed));
            state = guide.next_state(state, token_id, 0);
        }
        assert_snapshot!(steps.join(" "), @"[4] [0, 1, 2, 7] [8] [10, 11, 12] [5]");
        assert_eq!(guide.generation(0), Some("{name:12}"));
        assert_snapshot!(allowed(&mut guide, state, 0), @"[3]");
        assert!(guide.is_final_state(state, 0));
        assert_eq!(guide.next_state(state, EOS, 0), GuideState::END);
    }

    #[test]
    fn grammar_guide_reset() {
        let mut guide = GrammarGuide::new(OBJECT_GRAMMAR, tokenizer(), None).unwrap();
        let initial = allowed(&mut guide, GuideState::INITIAL, 0);
        let state = guide.next_state(GuideState::INITIAL, 4, 0);
        assert_snapshot!(allowed(&mut guide, state, 0), @"[0, 1, 2, 7]");
        guide.reset();
        guide.reset();
        assert_eq!(guide.num_tokens_generated(), 0);
        assert_eq!(guide.generation(0), None);
        assert_eq!(allowed(&mut guide, GuideState::INITIAL, 0), initial);
    }

    #[test]
    fn grammar_guide_lanes() {
        let mut guide = GrammarGuide::new(OBJECT_GRAMMAR, tokenizer(), Some(2)).unwrap();
        assert_snapshot!(allowed(&mut guide, GuideState::INITIAL, 1), @"[4]");
        let lane_1 = guide.next_state(GuideState::INITIAL, 4, 1);
        assert_eq!(guide.num_tokens_generated(), 0);
        assert_snapshot!(allowed(&mut guide, GuideState::INITIAL, 0), @"[4]");
        let lane_0 = guide.next_state(GuideState::INITIAL, 4, 0);
        assert_eq!(guide.generation(0), Some("{"));
        assert_eq!(guide.generation(1), Some("{"));
        assert_snapshot!(allowed(&mut guide, lane_0, 0), @"[0, 1, 2, 7]");
        // The second token on lane 0 exhausts the budget.
        assert_eq!(guide.next_state(lane_0, 7, 0), GuideState::END);
        assert!(guide.is_final_state(GuideState::END, 0));
        assert_snapshot!(allowed(&mut guide, GuideState::END, 0), @"[3]");
        assert!(!guide.is_final_state(lane_1, 1));
    }

    #[test]
    fn grammar_guide_without_cache() {
        let config = Config {
            guide_config: GuideConfig {
                cache_enabled: false,
            },
            ..Default::default()
        };
        let mut guide =
            GrammarGuide::with_config(OBJECT_GRAMMAR, tokenizer(), None, &config).unwrap();
        assert_snapshot!(allowed(&mut guide, GuideState::INITIAL, 0), @"[4]");
        let state = guide.next_state(GuideState::INITIAL, 4, 0);
        assert_snapshot!(allowed(&mut guide, state, 0), @"[0, 1, 2, 7]");
        guide.reset();
        assert_snapshot!(allowed(&mut guide, GuideState::INITIAL, 0), @"[4]");
    }

    #[test]
    fn mask_logits() {
        let mut guide = RegexGuide::new("ab", tokenizer(), None).unwrap();
        let mut logits = vec![1.0f32; 13];
        guide
            .mask_logits(GuideState::INITIAL, 0, &mut logits)
            .unwrap();
        assert_snapshot!(
            format!("{:?}", logits),
            @"[1.0, -inf, 1.0, -inf, -inf, -inf, -inf, -inf, -inf, -inf, -inf, -inf, -inf]"
        );
        let mut logits = vec![1.0f32; 3];
        assert_eq!(
            guide.mask_logits(GuideState::INITIAL, 0, &mut logits),
            Err(MaskLogitsError::InvalidLogitsLength)
        );
        assert_eq!(logits, vec![1.0f32; 3]);
    }

    #[test]
    fn boxed_guides() {
        let tokenizer = tokenizer();
        let guides: Vec<Box<dyn GuideLike>> = vec![
            StopGuide::new(tokenizer.clone(), EOS, None).into_boxed_guide(),
            RegexGuide::new("ab", tokenizer.clone(), None)
                .unwrap()
                .into_boxed_guide(),
            GrammarGuide::new(OBJECT_GRAMMAR, tokenizer, None)
                .unwrap()
                .into_boxed_guide(),
        ];
        for mut guide in guides {
            assert_eq!(guide.vocab_size(), 13);
            let allowed = guide.allowed_token_ids(GuideState::INITIAL, 0);
            assert!(!allowed.is_empty());
            assert!(allowed.windows(2).all(|x| x[0] < x[1]));
        }
    }
}
