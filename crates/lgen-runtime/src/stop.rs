//! Stop-sequence detection over streamed text.
//!
//! Text is released to the caller only once it can no longer be the start of
//! a stop sequence. When a stop sequence matches, everything from the match
//! onward is dropped.

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCheck {
    /// No match yet; `release` is safe to hand to the caller.
    Continue { release: String },
    /// A stop sequence matched; `release` is the remaining text before it.
    Matched { release: String },
}

#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    /// Generated text, truncated at the match once one is found.
    text: String,
    /// Bytes of `text` already released.
    released: usize,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            text: String::new(),
            released: 0,
        }
    }

    pub fn push(&mut self, fragment: &str) -> StopCheck {
        // Any new match must end inside the fragment.
        let longest = self.stops.iter().map(String::len).max().unwrap_or(0);
        let mut search_from = self.text.len().saturating_sub(longest.saturating_sub(1));
        while !self.text.is_char_boundary(search_from) {
            search_from -= 1;
        }
        self.text.push_str(fragment);

        let hit = self
            .stops
            .iter()
            .filter_map(|stop| self.text[search_from..].find(stop.as_str()))
            .min()
            .map(|pos| search_from + pos);

        if let Some(at) = hit {
            self.text.truncate(at);
            let start = self.released.min(at);
            let release = self.text[start..].to_string();
            self.released = self.text.len();
            return StopCheck::Matched { release };
        }

        let safe = self.text.len() - self.held_back();
        let release = self.text[self.released..safe].to_string();
        self.released = safe;
        StopCheck::Continue { release }
    }

    /// Release everything still held back.
    pub fn finish(&mut self) -> String {
        let release = self.text[self.released..].to_string();
        self.released = self.text.len();
        release
    }

    /// Full text accepted so far, including held-back bytes.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length of the longest tail of `text` that is a proper prefix of a stop.
    fn held_back(&self) -> usize {
        let pending = &self.text[self.released..];
        self.stops
            .iter()
            .filter_map(|stop| {
                (1..stop.len().min(pending.len() + 1))
                    .rev()
                    .filter(|&n| pending.is_char_boundary(pending.len() - n))
                    .find(|&n| stop.as_bytes().starts_with(&pending.as_bytes()[pending.len() - n..]))
            })
            .max()
            .unwrap_or(0)
    }
}
