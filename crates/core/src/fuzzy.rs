//! Fuzzy subsequence matching over an indexed list of names.
//!
//! A candidate matches when every pattern character appears in it, in
//! order, ignoring case. Matches are scored so that hits on word starts
//! and runs of adjacent characters outrank scattered ones:
//!
//! - first character of the candidate: +10
//! - character following a separator (`/-_ .\`): +20
//! - camelCase boundary: +20
//! - character adjacent to the previous hit: +5
//! - unmatched characters before the first hit: -5 each, capped at -15
//! - every unmatched character in the candidate: -1
//!
//! A candidate equal to the pattern (ignoring case) always ranks first.
//! Results are sorted by descending score; equal scores keep source order.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const FIRST_CHAR_MATCH_BONUS: i64 = 10;
const MATCH_FOLLOWING_SEPARATOR_BONUS: i64 = 20;
const CAMEL_CASE_MATCH_BONUS: i64 = 20;
const ADJACENT_MATCH_BONUS: i64 = 5;
const UNMATCHED_LEADING_CHAR_PENALTY: i64 = -5;
const MAX_UNMATCHED_LEADING_CHAR_PENALTY: i64 = -15;
const EXACT_MATCH_BONUS: i64 = 1_000;

const SEPARATORS: &[char] = &['/', '-', '_', ' ', '.', '\\'];

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// An indexed collection of strings the matcher can iterate.
pub trait Source {
    /// The string at position `i`. Must not panic for `i < self.len()`.
    fn string(&self, i: usize) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: AsRef<str>> Source for [S] {
    fn string(&self, i: usize) -> &str {
        self[i].as_ref()
    }

    fn len(&self) -> usize {
        <[S]>::len(self)
    }
}

impl<S: AsRef<str>> Source for Vec<S> {
    fn string(&self, i: usize) -> &str {
        self[i].as_ref()
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// One candidate that contains the pattern as a subsequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Position of the candidate in the source.
    pub index: usize,
    pub score: i64,
    /// Character offsets (not byte offsets) of each matched pattern char.
    pub matched_indexes: Vec<usize>,
}

/// Score every candidate in `source` against `pattern`.
///
/// An empty pattern matches nothing.
pub fn find_from<S: Source + ?Sized>(pattern: &str, source: &S) -> Vec<Match> {
    let pattern: Vec<char> = pattern.chars().collect();
    if pattern.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<Match> = (0..source.len())
        .filter_map(|index| {
            score_candidate(&pattern, source.string(index)).map(|(score, matched_indexes)| {
                Match {
                    index,
                    score,
                    matched_indexes,
                }
            })
        })
        .collect();

    // `sort_by` is stable, so ties keep source order.
    matches.sort_by(|a, b| b.score.cmp(&a.score));
    matches
}

/// The single highest-scoring candidate, if any.
pub fn best_match<S: Source + ?Sized>(pattern: &str, source: &S) -> Option<Match> {
    find_from(pattern, source).into_iter().next()
}

fn score_candidate(pattern: &[char], candidate: &str) -> Option<(i64, Vec<usize>)> {
    let chars: Vec<char> = candidate.chars().collect();
    let mut matched: Vec<usize> = Vec::with_capacity(pattern.len());
    let mut score = 0i64;

    for (j, &c) in chars.iter().enumerate() {
        let Some(&wanted) = pattern.get(matched.len()) else {
            break;
        };
        if !eq_fold(c, wanted) {
            continue;
        }

        let mut char_score = 0;
        if j == 0 {
            char_score += FIRST_CHAR_MATCH_BONUS;
        } else {
            let prev = chars[j - 1];
            if SEPARATORS.contains(&prev) {
                char_score += MATCH_FOLLOWING_SEPARATOR_BONUS;
            }
            if prev.is_lowercase() && c.is_uppercase() {
                char_score += CAMEL_CASE_MATCH_BONUS;
            }
        }

        match matched.last() {
            Some(&last) if last + 1 == j => char_score += ADJACENT_MATCH_BONUS,
            Some(_) => {}
            None => {
                let penalty = j as i64 * UNMATCHED_LEADING_CHAR_PENALTY;
                char_score += penalty.max(MAX_UNMATCHED_LEADING_CHAR_PENALTY);
            }
        }

        score += char_score;
        matched.push(j);
    }

    if matched.len() < pattern.len() {
        return None;
    }

    score -= (chars.len() - matched.len()) as i64;

    if chars.len() == pattern.len() {
        score += EXACT_MATCH_BONUS;
    }

    Some((score, matched))
}

fn eq_fold(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
