//! Incremental sentence segmentation of a token stream

use super::protocol::{is_protocol_line, may_become_protocol_line};

const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Accumulates streamed tokens and yields speakable sentences
///
/// A sentence is flushed at terminal punctuation or at the end of a line.
/// Lines that are (or may still become) protocol markers are held until the
/// line ends and then discarded instead of spoken.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token, returning any sentences completed by it
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let mut ready = Vec::new();

        for (i, part) in token.split('\n').enumerate() {
            if i > 0 {
                // Newline ends whatever line was being built
                if let Some(sentence) = self.take() {
                    ready.push(sentence);
                }
            }
            self.buffer.push_str(part);

            if self.buffer.trim_end().ends_with(SENTENCE_ENDINGS)
                && !may_become_protocol_line(&self.buffer)
            {
                if let Some(sentence) = self.take() {
                    ready.push(sentence);
                }
            }
        }

        ready
    }

    /// Flush whatever remains once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.buffer);
        let sentence = text.trim();
        if sentence.is_empty() || is_protocol_line(sentence) {
            None
        } else {
            Some(sentence.to_string())
        }
    }
}
