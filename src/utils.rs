use std::io::Write;
use std::time::Instant;

/// In-place stderr progress line for the two PBF passes. Each pass
/// owns its counter, so counts stay plain; `finish` adds the
/// primitives-per-second rate the long planet runs are judged by.
pub struct ProgressCounter {
    label: &'static str,
    every: u64,
    count: u64,
    next_report: u64,
    started: Instant,
}

impl ProgressCounter {
    pub fn new(label: &'static str, every: u64) -> ProgressCounter {
        let counter = ProgressCounter {
            label,
            every: every.max(1),
            count: 0,
            next_report: 0,
            started: Instant::now(),
        };
        counter.print();
        counter
    }

    pub fn inc(&mut self, delta: u64) {
        self.count += delta;
        if self.count >= self.next_report {
            self.print();
            self.next_report = self.count + self.every - self.count % self.every;
        }
    }

    pub fn finish(&self) {
        let secs = self.started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            (self.count as f64 / secs) as u64
        } else {
            0
        };
        eprintln!("\r{}: {} ({}/s)", self.label, self.count, rate);
    }

    fn print(&self) {
        eprint!("\r{}: {}", self.label, self.count);
        let _ = std::io::stderr().flush();
    }
}

/// Shell-style wildcard match: `*` spans any run, `?` any single char.
/// Only delete-flagged style entries may carry wildcards.
pub fn wild_match(pattern: &str, value: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let val: Vec<char> = value.chars().collect();
    wild_match_at(&pat, &val)
}

fn wild_match_at(pat: &[char], val: &[char]) -> bool {
    match pat.first() {
        None => val.is_empty(),
        Some('*') => (0..=val.len()).any(|skip| wild_match_at(&pat[1..], &val[skip..])),
        Some('?') => !val.is_empty() && wild_match_at(&pat[1..], &val[1..]),
        Some(c) => val.first() == Some(c) && wild_match_at(&pat[1..], &val[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wild_match_star_spans() {
        assert!(wild_match("*_link", "motorway_link"));
        assert!(!wild_match("*_link", "motorway"));
        assert!(wild_match("note*", "note:de"));
        assert!(wild_match("*", "anything"));
        assert!(wild_match("*", ""));
    }

    #[test]
    fn wild_match_question_is_single_char() {
        assert!(wild_match("name:??", "name:de"));
        assert!(!wild_match("name:??", "name:d"));
        assert!(!wild_match("name:??", "name:den"));
    }

    #[test]
    fn wild_match_literal() {
        assert!(wild_match("highway", "highway"));
        assert!(!wild_match("highway", "highways"));
    }
}
