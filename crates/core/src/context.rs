use std::collections::VecDeque;

/// Rolling window of the most recently narrated chunk texts, bounded by spoken duration.
#[derive(Debug, Clone)]
pub struct RecentContext {
    window_secs: u32,
    entries: VecDeque<(String, u32)>,
    total_secs: u32,
    text: String,
}

impl RecentContext {
    pub fn new(window_secs: u32) -> Self {
        Self {
            window_secs,
            entries: VecDeque::new(),
            total_secs: 0,
            text: String::new(),
        }
    }

    /// Append a narrated chunk and evict the oldest entries until the window fits again.
    pub fn record(&mut self, text: &str, approx_seconds: u32) {
        self.entries.push_back((text.to_string(), approx_seconds));
        self.total_secs += approx_seconds;
        while self.total_secs > self.window_secs {
            match self.entries.pop_front() {
                Some((_, secs)) => self.total_secs -= secs,
                None => break,
            }
        }
        self.text = self
            .entries
            .iter()
            .map(|(text, _)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn total_secs(&self) -> u32 {
        self.total_secs
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_secs = 0;
        self.text.clear();
    }
}
