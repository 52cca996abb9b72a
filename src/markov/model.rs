//! Markov text generators
//!
//! [`MarkovModel`] chains words across a member's messages. [`Gibberish`]
//! chains the characters of a single text.

use crate::error::{Error, Result};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

const BEGIN: &str = "___BEGIN__";
const END: &str = "___END__";

/// Chance that gibberish identical to its input is kept anyway
const ECHO_CHANCE: f64 = 0.2;

type State = Vec<String>;

/// Weighted transitions from each state of `state_size` tokens
#[derive(Debug)]
struct Chain {
    state_size: usize,
    model: HashMap<State, Vec<(String, u32)>>,
}

impl Chain {
    fn build<'a, I>(runs: I, state_size: usize) -> Self
    where
        I: IntoIterator<Item = Vec<&'a str>>,
    {
        let mut counts: HashMap<State, BTreeMap<String, u32>> = HashMap::new();

        for tokens in runs {
            if tokens.is_empty() {
                continue;
            }
            let items: Vec<&str> = std::iter::repeat(BEGIN)
                .take(state_size)
                .chain(tokens)
                .chain(std::iter::once(END))
                .collect();

            for window in items.windows(state_size + 1) {
                let (state, follow) = window.split_at(state_size);
                *counts
                    .entry(state.iter().map(|s| s.to_string()).collect())
                    .or_default()
                    .entry(follow[0].to_string())
                    .or_insert(0) += 1;
            }
        }

        // BTreeMap keeps follow order stable, so a seeded walk is repeatable
        let model = counts
            .into_iter()
            .map(|(state, follows)| (state, follows.into_iter().collect()))
            .collect();

        Self { state_size, model }
    }

    fn is_empty(&self) -> bool {
        self.model.is_empty()
    }

    fn approx_size(&self) -> usize {
        self.model
            .iter()
            .map(|(state, follows)| {
                state.iter().map(String::len).sum::<usize>()
                    + follows.iter().map(|(f, _)| f.len()).sum::<usize>()
                    + follows.len() * 4
            })
            .sum()
    }

    fn pick<'a, R: Rng + ?Sized>(follows: &'a [(String, u32)], rng: &mut R) -> Option<&'a str> {
        let total: u32 = follows.iter().map(|(_, weight)| weight).sum();
        if total == 0 {
            return None;
        }
        let mut roll = rng.gen_range(0..total);
        for (follow, weight) in follows {
            if roll < *weight {
                return Some(follow.as_str());
            }
            roll -= weight;
        }
        None
    }

    /// One random walk from the start state. `None` if the walk grows past
    /// `max_tokens` or produces nothing.
    fn walk<R: Rng + ?Sized>(&self, rng: &mut R, max_tokens: usize) -> Option<Vec<String>> {
        let mut state: State = vec![BEGIN.to_string(); self.state_size];
        let mut output = Vec::new();

        loop {
            let follows = self.model.get(&state)?;
            let next = Self::pick(follows, rng)?;
            if next == END {
                break;
            }
            if output.len() == max_tokens {
                return None;
            }
            output.push(next.to_string());
            state.remove(0);
            state.push(next.to_string());
        }

        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }
}

/// Word-level Markov chain trained on one member's messages in one guild
#[derive(Debug)]
pub struct MarkovModel {
    chain: Chain,
}

impl MarkovModel {
    /// Train on a corpus of messages. Each message is one sentence. Fails if
    /// the corpus holds no words at all.
    pub fn train<S: AsRef<str>>(corpus: &[S], state_size: usize) -> Result<Self> {
        if state_size == 0 {
            return Err(Error::BuildFailure("state size must be at least 1".to_string()));
        }
        let chain = Chain::build(
            corpus
                .iter()
                .map(|text| text.as_ref().split_whitespace().collect()),
            state_size,
        );
        if chain.is_empty() {
            return Err(Error::BuildFailure("corpus contains no words".to_string()));
        }
        Ok(Self { chain })
    }

    pub fn state_size(&self) -> usize {
        self.chain.state_size
    }

    /// Approximate memory held by the chain in bytes
    pub fn approx_size(&self) -> usize {
        self.chain.approx_size()
    }

    /// Generate a sentence of at most `max_words` words, trying up to
    /// `max_attempts` walks.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        max_words: usize,
        max_attempts: usize,
    ) -> Option<String> {
        (0..max_attempts.max(1))
            .find_map(|_| self.chain.walk(rng, max_words))
            .map(|words| words.join(" "))
    }
}

/// Character-level chain over a single text, for scrambled echoes of it
#[derive(Debug)]
pub struct Gibberish {
    chain: Chain,
    original: String,
}

impl Gibberish {
    pub fn new(text: &str, state_size: usize) -> Result<Self> {
        if state_size == 0 {
            return Err(Error::BuildFailure("state size must be at least 1".to_string()));
        }
        let chars: Vec<&str> = text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
        let chain = Chain::build(std::iter::once(chars), state_size);
        if chain.is_empty() {
            return Err(Error::BuildFailure("nothing to scramble".to_string()));
        }
        Ok(Self {
            chain,
            original: text.to_string(),
        })
    }

    pub fn state_size(&self) -> usize {
        self.chain.state_size
    }

    /// Scramble the text. Output equal to the input is re-rolled, except
    /// that it is kept one time in five. After `max_attempts` re-rolls the
    /// last output is returned as-is.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R, max_attempts: usize) -> String {
        let max_chars = self.original.chars().count() * 4;
        let mut last = self.original.clone();

        for _ in 0..max_attempts.max(1) {
            let Some(chars) = self.chain.walk(rng, max_chars) else {
                continue;
            };
            let text = chars.concat();
            if text != self.original || rng.gen_bool(ECHO_CHANCE) {
                return text;
            }
            last = text;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn corpus() -> Vec<String> {
        vec![
            "the cat sat on the mat".to_string(),
            "the dog sat on the rug".to_string(),
            "a bird flew over the mat".to_string(),
        ]
    }

    #[test]
    fn test_train_rejects_empty_corpus() {
        let empty: Vec<String> = vec![];
        assert!(matches!(
            MarkovModel::train(&empty, 2),
            Err(Error::BuildFailure(_))
        ));
        assert!(matches!(
            MarkovModel::train(&["   ", ""][..], 1),
            Err(Error::BuildFailure(_))
        ));
    }

    #[test]
    fn test_train_rejects_zero_state_size() {
        assert!(MarkovModel::train(&corpus(), 0).is_err());
    }

    #[test]
    fn test_generate_uses_corpus_words() {
        let model = MarkovModel::train(&corpus(), 1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let vocabulary: Vec<String> = corpus()
            .iter()
            .flat_map(|s| s.split_whitespace())
            .map(String::from)
            .collect();

        for _ in 0..20 {
            let sentence = model.generate(&mut rng, 50, 10).unwrap();
            assert!(!sentence.is_empty());
            assert!(sentence.split(' ').all(|w| vocabulary.iter().any(|v| v == w)));
        }
    }

    #[test]
    fn test_single_message_reproduced() {
        let model = MarkovModel::train(&["hello there friend"][..], 2).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            model.generate(&mut rng, 10, 1).as_deref(),
            Some("hello there friend")
        );
    }

    #[test]
    fn test_max_words_enforced() {
        let model = MarkovModel::train(&["one two three four five six"][..], 1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(model.generate(&mut rng, 3, 5).is_none());
        assert!(model.generate(&mut rng, 6, 5).is_some());
    }

    #[test]
    fn test_seeded_generation_repeats() {
        let model = MarkovModel::train(&corpus(), 1).unwrap();
        let a = model.generate(&mut StdRng::seed_from_u64(42), 50, 10);
        let b = model.generate(&mut StdRng::seed_from_u64(42), 50, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_approx_size() {
        // States: [B] -> hi, [hi] -> E
        let model = MarkovModel::train(&["hi"][..], 1).unwrap();
        let expected = (BEGIN.len() + "hi".len() + 4) + ("hi".len() + END.len() + 4);
        assert_eq!(model.approx_size(), expected);
        assert_eq!(model.state_size(), 1);

        let bigger = MarkovModel::train(&corpus(), 1).unwrap();
        assert!(bigger.approx_size() > model.approx_size());
    }

    #[test]
    fn test_gibberish_keeps_characters() {
        let gibberish = Gibberish::new("banana bandana", 1).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..10 {
            let text = gibberish.generate(&mut rng, 10);
            assert!(!text.is_empty());
            assert!(text.chars().all(|c| "banana bandana".contains(c)));
        }
    }

    #[test]
    fn test_gibberish_handles_multibyte() {
        let gibberish = Gibberish::new("héllo wörld", 2).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let text = gibberish.generate(&mut rng, 10);
        assert!(text.chars().all(|c| "héllo wörld".contains(c)));
    }

    #[test]
    fn test_gibberish_echo_sometimes_kept() {
        // A chain with a single path can only echo its input
        let gibberish = Gibberish::new("abc", 2).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        assert_eq!(gibberish.generate(&mut rng, 3), "abc");
    }

    #[test]
    fn test_gibberish_rejects_empty_text() {
        assert!(Gibberish::new("", 1).is_err());
    }
}
