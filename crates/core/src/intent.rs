/// Detects the spoken or typed phrase that tells the orchestrator to continue narration.
#[derive(Debug, Clone)]
pub struct ResumePhrase {
    normalized: String,
}

impl ResumePhrase {
    pub fn new(phrase: &str) -> Self {
        Self {
            normalized: normalize(phrase),
        }
    }

    /// True when the utterance contains the phrase as whole words, ignoring case,
    /// punctuation and extra whitespace.
    pub fn matches(&self, utterance: &str) -> bool {
        if self.normalized.is_empty() {
            return false;
        }
        let haystack = format!(" {} ", normalize(utterance));
        let needle = format!(" {} ", self.normalized);
        haystack.contains(&needle)
    }
}

fn normalize(text: &str) -> String {
    // apostrophes vanish so "let's" and "lets" compare equal
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_regardless_of_case_and_punctuation() {
        let phrase = ResumePhrase::new("forge ahead");
        assert!(phrase.matches("Forge ahead"));
        assert!(phrase.matches("okay,   FORGE... ahead!"));
        assert!(phrase.matches("thanks, let's forge ahead now"));
    }

    #[test]
    fn requires_whole_words() {
        let phrase = ResumePhrase::new("forge ahead");
        assert!(!phrase.matches("forge aheadwards"));
        assert!(!phrase.matches("what does a forge do"));
        assert!(!phrase.matches(""));
    }

    #[test]
    fn empty_phrase_never_matches() {
        assert!(!ResumePhrase::new("  ").matches("anything"));
    }
}
