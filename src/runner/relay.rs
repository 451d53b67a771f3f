//! Worker-to-host relay protocol
//!
//! The worker writes one JSON object per line on fd 3. Artifact bytes travel
//! base64-encoded. Lines that do not decode are counted and dropped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One record on the relay channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayRecord {
    Artifact {
        mime_type: String,
        data: String,
    },
    Return {
        summary: String,
    },
    Exception {
        #[serde(rename = "type")]
        exception_type: String,
        message: String,
        traceback: String,
    },
    MemoryExhausted,
    Stats {
        peak_rss_kb: u64,
    },
}

/// A binary artifact relayed out of the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Exception raised inside the worker, before sanitisation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedException {
    pub exception_type: String,
    pub message: String,
    pub traceback: String,
}

/// Everything decoded from the relay stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub artifacts: Vec<Artifact>,
    pub return_summary: Option<String>,
    pub exception: Option<RaisedException>,
    pub memory_exhausted: bool,
    pub peak_rss_kb: Option<u64>,
    pub malformed: usize,
    pub truncated: bool,
}

impl RelayReport {
    /// Decode the raw relay bytes
    pub fn parse(raw: &[u8], truncated: bool) -> Self {
        let mut report = RelayReport {
            truncated,
            ..RelayReport::default()
        };

        let text = String::from_utf8_lossy(raw);
        let mut lines = text.lines().peekable();
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            // A truncated stream ends mid-record
            if truncated && lines.peek().is_none() {
                report.malformed += 1;
                break;
            }

            match serde_json::from_str::<RelayRecord>(line) {
                Ok(record) => report.apply(record),
                Err(err) => {
                    log::debug!("dropping malformed relay record: {}", err);
                    report.malformed += 1;
                }
            }
        }

        report
    }

    fn apply(&mut self, record: RelayRecord) {
        match record {
            RelayRecord::Artifact { mime_type, data } => match STANDARD.decode(data.as_bytes()) {
                Ok(bytes) => self.artifacts.push(Artifact { mime_type, bytes }),
                Err(err) => {
                    log::debug!("dropping artifact with bad base64: {}", err);
                    self.malformed += 1;
                }
            },
            RelayRecord::Return { summary } => self.return_summary = Some(summary),
            RelayRecord::Exception {
                exception_type,
                message,
                traceback,
            } => {
                self.exception = Some(RaisedException {
                    exception_type,
                    message,
                    traceback,
                })
            }
            RelayRecord::MemoryExhausted => self.memory_exhausted = true,
            RelayRecord::Stats { peak_rss_kb } => self.peak_rss_kb = Some(peak_rss_kb),
        }
    }
}

/// Artifacts serialise their bytes as base64 text
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_stream() {
        let raw = concat!(
            r#"{"kind":"artifact","mime_type":"image/png","data":"iVBORw=="}"#,
            "\n",
            r#"{"kind":"return","summary":"42"}"#,
            "\n",
            r#"{"kind":"stats","peak_rss_kb":10240}"#,
            "\n"
        );
        let report = RelayReport::parse(raw.as_bytes(), false);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].mime_type, "image/png");
        assert_eq!(report.artifacts[0].bytes, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(report.return_summary.as_deref(), Some("42"));
        assert_eq!(report.peak_rss_kb, Some(10240));
        assert_eq!(report.malformed, 0);
    }

    #[test]
    fn test_exception_record() {
        let raw = r#"{"kind":"exception","type":"ZeroDivisionError","message":"division by zero","traceback":"Traceback"}"#;
        let report = RelayReport::parse(raw.as_bytes(), false);
        let exception = report.exception.unwrap();
        assert_eq!(exception.exception_type, "ZeroDivisionError");
        assert_eq!(exception.message, "division by zero");
    }

    #[test]
    fn test_malformed_lines_counted() {
        let raw = "not json\n{\"kind\":\"unknown\"}\n{\"kind\":\"memory_exhausted\"}\n";
        let report = RelayReport::parse(raw.as_bytes(), false);
        assert_eq!(report.malformed, 2);
        assert!(report.memory_exhausted);
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let raw = "{\"kind\":\"return\",\"summary\":\"1\"}\n{\"kind\":\"artifact\",\"mime_ty";
        let report = RelayReport::parse(raw.as_bytes(), true);
        assert_eq!(report.return_summary.as_deref(), Some("1"));
        assert!(report.artifacts.is_empty());
        assert_eq!(report.malformed, 1);
        assert!(report.truncated);
    }

    #[test]
    fn test_artifact_serialises_as_base64() {
        let artifact = Artifact {
            mime_type: "text/plain".to_string(),
            bytes: b"hi".to_vec(),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["bytes"], "aGk=");
    }
}
