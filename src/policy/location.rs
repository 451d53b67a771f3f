use crate::policy::violation::Location;

/// Byte offset to line/column translation for one fragment
pub(crate) struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));
        Self { text, line_starts }
    }

    pub fn location(&self, offset: usize) -> Location {
        let offset = offset.min(self.text.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];
        let column = self
            .text
            .get(start..offset)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(0);

        Location {
            line: line + 1,
            column: column + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_character() {
        let index = LineIndex::new("abc\ndef");
        assert_eq!(index.location(0), Location { line: 1, column: 1 });
    }

    #[test]
    fn test_second_line() {
        let index = LineIndex::new("abc\ndef");
        assert_eq!(index.location(5), Location { line: 2, column: 2 });
        assert_eq!(index.location(4), Location { line: 2, column: 1 });
    }

    #[test]
    fn test_columns_count_characters() {
        let index = LineIndex::new("é = 1; x");
        // 'é' is two bytes
        assert_eq!(index.location(8), Location { line: 1, column: 8 });
    }

    #[test]
    fn test_offset_past_end_clamped() {
        let index = LineIndex::new("ab");
        assert_eq!(index.location(99), Location { line: 1, column: 3 });
    }
}
