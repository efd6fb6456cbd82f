use std::{sync::Arc, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use guidefsm::{
    config::{Config, GuideConfig},
    GrammarGuide, GuideLike, GuideState, RegexGuide, SharedTokenizer, Vocabulary,
    VocabularyTokenizer,
};

/// Builds a vocabulary of every printable ASCII character and every pair of them,
/// followed by the end-of-sequence token.
fn ascii_tokenizer() -> SharedTokenizer {
    let printable: Vec<char> = (0x20u8..0x7f).map(char::from).collect();
    let mut token_strings: Vec<String> = printable.iter().map(|x| x.to_string()).collect();
    for a in printable.iter() {
        for b in printable.iter() {
            token_strings.push(format!("{a}{b}"));
        }
    }
    token_strings.push("<eos>".to_string());
    let eos_token_id = (token_strings.len() - 1) as u32;
    let vocab = Vocabulary::from_token_strings(
        token_strings
            .into_iter()
            .enumerate()
            .map(|(i, x)| (i as u32, x)),
    )
    .unwrap();
    VocabularyTokenizer::new(Arc::new(vocab), eos_token_id)
        .unwrap()
        .into_shared()
}

/// Greedily samples the smallest allowed token until the lane finishes or `iteration` steps pass.
fn run_a_guide(guide: &mut impl GuideLike, iteration: usize, logits: &mut [f32]) {
    let mut state = GuideState::INITIAL;
    for _ in 0..iteration {
        if guide.is_final_state(state, 0) {
            break;
        }
        guide.mask_logits(state, 0, logits).unwrap();
        let token_id = guide.allowed_token_ids(state, 0)[0];
        state = guide.next_state(state, token_id, 0);
    }
    guide.reset(); // reset the guide to its initial state while keeping the compiled indices
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut c = c.benchmark_group("Simple");
    c.measurement_time(Duration::from_secs(10)).sample_size(100);
    let tokenizer = ascii_tokenizer();
    let mut logits = vec![0.0f32; tokenizer.vocabulary().vocab_size()];
    c.bench_function("index construction of an integer regex", |b| {
        b.iter(|| RegexGuide::new(black_box("0|[1-9][0-9]*"), tokenizer.clone(), None).unwrap())
    });
    c.bench_function("index construction of an email-like regex", |b| {
        b.iter(|| {
            RegexGuide::new(
                black_box("[a-z0-9._]+@[a-z0-9]+\\.(com|org|net)"),
                tokenizer.clone(),
                None,
            )
            .unwrap()
        })
    });
    let mut guide = RegexGuide::new("[a-zA-Z0-9_ ]+\n", tokenizer.clone(), None).unwrap();
    c.bench_function("alphanumeric regex 20 iterations", |b| {
        b.iter(|| run_a_guide(black_box(&mut guide), 20, &mut logits))
    });
    let grammar_str = r#"
start: "[" [value ("," value)*] "]"
value: NUMBER | WORD | start
%import common (NUMBER, WORD)
"#;
    let mut guide = GrammarGuide::new(grammar_str, tokenizer.clone(), None).unwrap();
    c.bench_function("list grammar 20 iterations", |b| {
        b.iter(|| run_a_guide(black_box(&mut guide), 20, &mut logits))
    });
    let no_cache_config = Config {
        guide_config: GuideConfig {
            cache_enabled: false,
        },
        ..Default::default()
    };
    let mut guide =
        GrammarGuide::with_config(grammar_str, tokenizer.clone(), None, &no_cache_config).unwrap();
    c.bench_function("list grammar 20 iterations(no cache)", |b| {
        b.iter(|| run_a_guide(black_box(&mut guide), 20, &mut logits))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
