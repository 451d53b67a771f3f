//! Fenced-region scanning
//!
//! Line-oriented and byte-offset based. Fence characters are ASCII, so byte
//! offsets found here are always valid `str` boundaries.

/// An opening fence and the region it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FencedRegion {
    /// Normalised language tag (first word of the info string)
    pub tag: Option<String>,
    /// Byte offset where the body starts (after the opener's line break)
    pub body_start: usize,
    /// Byte offset where the body ends (start of the closing line, or end of text)
    pub body_end: usize,
    /// Byte offset to resume scanning from
    pub resume: usize,
}

/// Byte offset of the end of the line starting at `from` (the `\n` or end of text)
fn line_end(text: &str, from: usize) -> usize {
    text[from..]
        .find('\n')
        .map(|idx| from + idx)
        .unwrap_or(text.len())
}

/// First run of three or more backticks or tildes in `line`: (column, fence byte, width)
fn fence_run(line: &str) -> Option<(usize, u8, usize)> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'`' || b == b'~' {
            let mut j = i;
            while j < bytes.len() && bytes[j] == b {
                j += 1;
            }
            if j - i >= 3 {
                return Some((i, b, j - i));
            }
            i = j;
        } else {
            i += 1;
        }
    }
    None
}

/// `"{.python title=x}"` -> `python`
pub(crate) fn language_tag(info: &str) -> Option<String> {
    let word = info.split_whitespace().next()?;
    let word = word.trim_matches(|c| c == '{' || c == '}');
    let word = word.strip_prefix('.').unwrap_or(word);
    if word.is_empty() {
        None
    } else {
        Some(word.to_lowercase())
    }
}

/// A fence after other text on its line opens a block only when its info
/// string is empty or a single tag word (`Sure! ```python`). Otherwise the
/// line is prose mentioning fences, or code with fences in a string.
fn opens_block(before: &str, info: &str) -> bool {
    if before.trim().is_empty() {
        return true;
    }
    let info = info.trim();
    info.is_empty()
        || info
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_+.{}-".contains(c))
}

/// True when an opener exists anywhere in `text`
pub(crate) fn has_opener(text: &str) -> bool {
    find_opener(text, 0).is_some()
}

struct Opener {
    fence: u8,
    width: usize,
    tag: Option<String>,
    body_start: usize,
}

fn find_opener(text: &str, mut line_start: usize) -> Option<Opener> {
    while line_start < text.len() {
        let end = line_end(text, line_start);
        let line = &text[line_start..end];

        if let Some((col, fence, width)) = fence_run(line) {
            let info = &line[col + width..];
            // ```foo``` on one line is inline code
            let inline = fence == b'`' && info.contains('`');
            if !inline && opens_block(&line[..col], info) {
                return Some(Opener {
                    fence,
                    width,
                    tag: language_tag(info),
                    body_start: (end + 1).min(text.len()),
                });
            }
        }

        line_start = end + 1;
    }
    None
}

/// Closing line for an opener: (body end, resume offset)
fn find_closer(text: &str, from: usize, fence: u8, width: usize) -> (usize, usize) {
    let mut line_start = from;
    while line_start < text.len() {
        let end = line_end(text, line_start);
        let line = text[line_start..end].trim_start();
        let run = line.bytes().take_while(|&b| b == fence).count();

        if run >= width && line[run..].trim().is_empty() {
            return (line_start, (end + 1).min(text.len()));
        }

        line_start = end + 1;
    }
    (text.len(), text.len())
}

/// Next fenced region at or after `from` (which must be a line start)
pub(crate) fn next_region(text: &str, from: usize) -> Option<FencedRegion> {
    let opener = find_opener(text, from)?;
    let (body_end, resume) = find_closer(text, opener.body_start, opener.fence, opener.width);

    Some(FencedRegion {
        tag: opener.tag,
        body_start: opener.body_start,
        body_end,
        resume,
    })
}
