//! Fragment extraction
//!
//! Locates Python code inside free-form model output. Fenced regions
//! (```` ``` ```` or `~~~`, optionally tagged) each become a [`Fragment`];
//! regions tagged with another language are skipped. When no fenced region
//! is Python or untagged, the whole text is used if it parses as Python.
//!
//! Extraction is pure: scanning the same text always yields the same
//! fragments, and an empty sequence is not an error at this stage.

mod fence;

use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};

/// Language tags accepted as Python
pub const PYTHON_TAGS: &[&str] = &["python", "py", "python3", "py3", "ipython"];

/// One candidate block of executable text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Normalised code text
    pub text: String,
    /// Byte range of the raw body inside the scanned text
    pub source_span: (usize, usize),
    /// Tag declared on the fence, if any
    pub language_tag: Option<String>,
    /// Ordinal among the fragments found
    pub index: usize,
}

/// Stateless extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    pub fn new() -> Self {
        Extractor
    }

    /// Lazily scan `text` for fragments
    pub fn scan<'a>(&self, text: &'a str) -> Fragments<'a> {
        Fragments {
            text,
            cursor: 0,
            next_index: 0,
            mode: Mode::Start,
            saw_python_region: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Start,
    Fenced,
    Done,
}

/// Ordered, restartable fragment sequence
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    text: &'a str,
    cursor: usize,
    next_index: usize,
    mode: Mode,
    saw_python_region: bool,
}

impl<'a> Fragments<'a> {
    fn emit(&mut self, text: String, span: (usize, usize), tag: Option<String>) -> Fragment {
        let fragment = Fragment {
            text,
            source_span: span,
            language_tag: tag,
            index: self.next_index,
        };
        self.next_index += 1;
        fragment
    }

    fn fallback(&mut self) -> Option<Fragment> {
        let (start, end) = fallback_span(self.text)?;
        let code = normalize(&self.text[start..end]);
        if code.trim().is_empty() || !parses(&code) {
            return None;
        }
        Some(self.emit(code, (start, end), None))
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        loop {
            match self.mode {
                Mode::Done => return None,
                Mode::Start => {
                    if fence::has_opener(self.text) {
                        self.mode = Mode::Fenced;
                    } else {
                        self.mode = Mode::Done;
                        return self.fallback();
                    }
                }
                Mode::Fenced => {
                    let region = match fence::next_region(self.text, self.cursor) {
                        Some(region) => region,
                        None => {
                            self.mode = Mode::Done;
                            // Only fences for other languages, e.g. inside a string
                            if self.saw_python_region {
                                return None;
                            }
                            return self.fallback();
                        }
                    };
                    self.cursor = region.resume;

                    if !is_python_tag(region.tag.as_deref()) {
                        log::debug!(
                            "skipping fenced region tagged {:?}",
                            region.tag.as_deref().unwrap_or("")
                        );
                        continue;
                    }
                    self.saw_python_region = true;

                    let code = normalize(&self.text[region.body_start..region.body_end]);
                    if code.trim().is_empty() {
                        continue;
                    }

                    return Some(self.emit(code, (region.body_start, region.body_end), region.tag));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for Fragments<'_> {}

/// Scan `text` with the default extractor
pub fn extract(text: &str) -> Fragments<'_> {
    Extractor::new().scan(text)
}

fn is_python_tag(tag: Option<&str>) -> bool {
    match tag {
        None => true,
        Some(tag) => PYTHON_TAGS.contains(&tag),
    }
}

/// Span of the unfenced candidate: leading `python` line dropped, whitespace trimmed
fn fallback_span(text: &str) -> Option<(usize, usize)> {
    let leading = text.len() - text.trim_start().len();
    let mut start = leading;

    let rest = &text[start..];
    if let Some(after) = rest.strip_prefix("python") {
        if after.starts_with('\n') || after.starts_with("\r\n") {
            start += "python".len();
        }
    }

    let body = &text[start..];
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let offset = start + (body.len() - body.trim_start().len());
    Some((offset, offset + trimmed.len()))
}

fn parses(code: &str) -> bool {
    ast::Suite::parse(code, "<fragment>").is_ok()
}

/// Drop control characters, strip common indentation and trailing whitespace
pub(crate) fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect();
    let cleaned = cleaned.replace("\r\n", "\n");
    dedent(&cleaned).trim_end().to_string()
}

fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    if indent == 0 {
        return text.to_string();
    }

    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                &line[indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
