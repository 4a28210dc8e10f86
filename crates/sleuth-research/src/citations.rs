//! Dense citation renumbering
//!
//! Citation markers are `[n]`, `[n, m, ...]` or ranges such as `[4-6]` and
//! `[4–6]`. Numbers are reassigned in order of first appearance so a text
//! always cites 1..=k with no gaps. Ranges come back as lists. Four-digit
//! brackets like `[2019]` are years, not citations.

use std::{collections::HashMap, sync::LazyLock};

use regex::{Captures, Regex};

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d{1,3}(?:\s*[-–]\s*\d{1,3})?(?:\s*,\s*\d{1,3}(?:\s*[-–]\s*\d{1,3})?)*)\]")
        .expect("valid citation regex")
});

/// Widest range expanded; anything wider is left as written
const MAX_RANGE: u64 = 50;

/// Numbers cited by one marker body, ranges expanded; `None` for a malformed range
fn marker_numbers(body: &str) -> Option<Vec<u64>> {
    let mut numbers = Vec::new();
    for item in body.split(',') {
        match item.split_once(['-', '–']) {
            Some((start, end)) => {
                let start: u64 = start.trim().parse().ok()?;
                let end: u64 = end.trim().parse().ok()?;
                if end < start || end - start > MAX_RANGE {
                    return None;
                }
                numbers.extend(start..=end);
            }
            None => numbers.push(item.trim().parse().ok()?),
        }
    }
    Some(numbers)
}

/// Renumber every citation marker in `text` densely from 1
pub fn renumber_citations(text: &str) -> String {
    let mut mapping: HashMap<u64, usize> = HashMap::new();

    CITATION
        .replace_all(text, |caps: &Captures| {
            let Some(numbers) = marker_numbers(&caps[1]) else {
                return caps[0].to_string();
            };
            let mut renumbered: Vec<String> = Vec::with_capacity(numbers.len());
            for n in numbers {
                let next = mapping.len() + 1;
                let n = mapping.entry(n).or_insert(next).to_string();
                if !renumbered.contains(&n) {
                    renumbered.push(n);
                }
            }
            format!("[{}]", renumbered.join(", "))
        })
        .into_owned()
}

/// Citation numbers in order of appearance, duplicates included
pub fn citation_numbers(text: &str) -> Vec<u64> {
    CITATION
        .captures_iter(text)
        .filter_map(|caps| marker_numbers(&caps[1]))
        .flatten()
        .collect()
}
