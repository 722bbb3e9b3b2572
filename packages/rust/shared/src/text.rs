//! Query text helpers shared by retrieval and scoring.

/// Words that carry no retrieval signal in a technician's question.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "but", "by", "can", "do", "does", "for", "from", "get",
    "got", "has", "have", "help", "how", "i", "if", "in", "is", "it", "it's", "its", "keeps", "me",
    "my", "of", "on", "or", "our", "please", "so", "the", "there", "this", "to", "up", "was",
    "we", "what", "what's", "when", "where", "which", "why", "with", "you", "your",
];

/// True for a lowercase word in [`STOP_WORDS`].
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_are_lowercase_matches() {
        assert!(is_stop_word("to"));
        assert!(is_stop_word("what's"));
        assert!(!is_stop_word("To"));
        assert!(!is_stop_word("network"));
    }
}
