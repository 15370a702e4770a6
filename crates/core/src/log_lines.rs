//! Turns raw subprocess output into typed log records.
//!
//! The external tool writes two shapes of output: JSON-per-line records
//! (`--use-json-log`) and human-readable transfer lines such as
//! `* a.zip: 10% /1 MiB, 1 MiB/s, 9s`. Progress bars redraw in place, so a
//! single read may carry several updates separated only by `\r`.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::format::parse_size;

/// Per-stream line buffer. Each output stream owns exactly one splitter so a
/// partial stdout line can never be completed by stderr bytes.
#[derive(Debug, Default)]
pub struct LineSplitter {
    remainder: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line terminated by a run of `\r`/`\n`.
    /// The trailing unterminated fragment is kept for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.remainder.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, b) in self.remainder.iter().enumerate() {
            if *b == b'\r' || *b == b'\n' {
                if i > start {
                    lines.push(String::from_utf8_lossy(&self.remainder[start..i]).into_owned());
                }
                start = i + 1;
            }
        }
        self.remainder.drain(..start);
        lines
    }

    /// Flushes the unterminated fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.remainder.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.remainder).into_owned();
        self.remainder.clear();
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.remainder.len()
    }
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"[\x1b\x{9b}][\[()#;?]*(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-ORZcf-nqry=><]",
        )
        .expect("ansi regex")
    })
}

/// Removes ANSI escape sequences and any remaining control characters (tabs survive).
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    let stripped = ansi_re().replace_all(line, "");
    if stripped.chars().any(|c| c.is_control() && c != '\t') {
        Cow::Owned(
            stripped
                .chars()
                .filter(|c| !c.is_control() || *c == '\t')
                .collect(),
        )
    } else {
        stripped
    }
}

/// A number or a preformatted string; the tool uses both for speed and eta.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Metric {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatsTransfer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub bytes: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsBlock {
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes: Option<f64>,
    #[serde(default)]
    pub errors: Option<u64>,
    #[serde(default)]
    pub transferring: Option<Vec<StatsTransfer>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    object_type: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    bytes: Option<f64>,
    #[serde(default)]
    speed: Option<Metric>,
    #[serde(default)]
    eta: Option<Metric>,
    #[serde(default)]
    stats: Option<StatsBlock>,
}

/// Single-file progress reported by a structured `Transferred` record.
#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub name: String,
    pub size: u64,
    pub bytes: u64,
    pub speed: Option<Metric>,
    pub eta: Option<Metric>,
}

/// Decoded structured record. Unknown shapes fall through to `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Stats {
        level: Option<String>,
        stats: StatsBlock,
    },
    Completed {
        object: String,
    },
    Transferred(FileProgress),
    /// A `Transferring: <name>: <pct>%…` message without a structured name.
    Transferring(LegacyTransfer),
    Message {
        level: Option<String>,
        msg: String,
    },
    Unknown,
}

impl ToolEvent {
    pub fn decode(value: serde_json::Value) -> Self {
        let raw: RawRecord = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(_) => return Self::Unknown,
        };

        if let Some(stats) = raw.stats {
            return Self::Stats {
                level: raw.level,
                stats,
            };
        }

        let msg = raw.msg.unwrap_or_default();
        if (msg.contains("Copied") || msg.contains("Moved"))
            && let Some(object) = raw.object.filter(|o| !o.is_empty())
        {
            return Self::Completed { object };
        }

        if (msg == "Transferred" || raw.object_type.as_deref() == Some("file"))
            && let Some(name) = raw.name.filter(|n| !n.is_empty())
        {
            return Self::Transferred(FileProgress {
                name,
                size: non_negative(raw.size),
                bytes: non_negative(raw.bytes),
                speed: raw.speed,
                eta: raw.eta,
            });
        }

        if let Some((_, line)) = msg.split_once("Transferring:")
            && let Some(transfer) = split_transfer(strip_bullet(line))
        {
            return Self::Transferring(transfer);
        }

        if !msg.is_empty() {
            return Self::Message {
                level: raw.level,
                msg,
            };
        }

        Self::Unknown
    }
}

/// One transfer line of the human-readable output.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTransfer {
    pub name: String,
    pub percentage: Option<f64>,
    pub size: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Structured(ToolEvent),
    Transfer(LegacyTransfer),
    Unrecognized(String),
}

/// Labels of the tool's own summary block; they look like transfer lines but are not files.
const SUMMARY_LABELS: [&str; 8] = [
    "Transferred",
    "Transferring",
    "Errors",
    "Checks",
    "Deleted",
    "Renamed",
    "Elapsed time",
    "Server Side Copies",
];

fn legacy_stats_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<pct>\d+(?:\.\d+)?)%\s*(?:/\s*(?P<size>[^,]+?))?\s*(?:,\s*(?P<speed>[^,]+?))?\s*(?:,\s*(?P<eta>[^,]+?))?\s*$",
        )
        .expect("legacy stats regex")
    })
}

fn strip_bullet(text: &str) -> &str {
    let text = text.trim_start();
    text.strip_prefix('*').unwrap_or(text)
}

fn is_placeholder(text: &str) -> bool {
    matches!(text.trim(), "" | "-" | "transferring")
}

/// Parses `* <filename>: <pct>% /<size>, <speed>, <eta>`; any stat may be absent or `-`.
pub fn parse_legacy_transfer(line: &str) -> Option<LegacyTransfer> {
    let body = line.trim_start().strip_prefix('*')?;
    split_transfer(body)
}

/// Splits `<name>: <stats>` at the last colon whose remainder reads as stats, so names may
/// contain `: ` themselves.
fn split_transfer(body: &str) -> Option<LegacyTransfer> {
    body.rmatch_indices(':').find_map(|(at, _)| {
        let name = body[..at].trim();
        if name.is_empty() || SUMMARY_LABELS.contains(&name) {
            return None;
        }
        transfer_stats(name, &body[at + 1..])
    })
}

fn transfer_stats(name: &str, rest: &str) -> Option<LegacyTransfer> {
    if is_placeholder(rest) {
        return Some(LegacyTransfer {
            name: name.to_string(),
            percentage: None,
            size: None,
            speed: None,
            eta: None,
        });
    }

    let stats = legacy_stats_re().captures(rest.trim())?;
    let percentage = stats.name("pct").and_then(|m| m.as_str().parse::<f64>().ok());
    let size = stats.name("size").and_then(|m| parse_size(m.as_str()));
    let speed = stats
        .name("speed")
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !is_placeholder(s));
    let eta = stats
        .name("eta")
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !is_placeholder(s));

    Some(LegacyTransfer {
        name: name.to_string(),
        percentage,
        size,
        speed,
        eta,
    })
}

/// Classifies one already-cleaned line. Returns `None` for blank lines.
pub fn classify(line: &str) -> Option<LogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
    {
        return Some(LogRecord::Structured(ToolEvent::decode(value)));
    }

    match parse_legacy_transfer(line) {
        Some(transfer) => Some(LogRecord::Transfer(transfer)),
        None => Some(LogRecord::Unrecognized(line.to_string())),
    }
}

fn non_negative(v: Option<f64>) -> u64 {
    match v {
        Some(v) if v.is_finite() && v > 0.0 => v as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carriage_returns_split_in_place_redraws() {
        let mut splitter = LineSplitter::new();
        let lines = splitter
            .push(b"* a.zip: 10% /1 MiB, 1 MiB/s, 9s\r* a.zip: 20% /1 MiB, 2 MiB/s, 8s\n");
        assert_eq!(
            lines,
            vec![
                "* a.zip: 10% /1 MiB, 1 MiB/s, 9s".to_string(),
                "* a.zip: 20% /1 MiB, 2 MiB/s, 8s".to_string(),
            ]
        );
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn partial_line_is_completed_by_next_read() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"{\"msg\":\"Cop").is_empty());
        let lines = splitter.push(b"ied (new)\",\"object\":\"a.zip\"}\r\n\r\n{\"x\"");
        assert_eq!(lines, vec![r#"{"msg":"Copied (new)","object":"a.zip"}"#.to_string()]);
        assert_eq!(splitter.finish().as_deref(), Some(r#"{"x""#));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn multibyte_characters_survive_a_split_read() {
        let text = "* 程序.zip: 5%\n".as_bytes();
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&text[..4]).is_empty());
        let lines = splitter.push(&text[4..]);
        assert_eq!(lines, vec!["* 程序.zip: 5%".to_string()]);
    }

    #[test]
    fn separate_splitters_never_mix_remainders() {
        let mut stdout = LineSplitter::new();
        let mut stderr = LineSplitter::new();
        assert!(stdout.push(b"* a.zip: 1").is_empty());
        assert_eq!(stderr.push(b"noise\n"), vec!["noise".to_string()]);
        assert_eq!(stdout.push(b"0%\n"), vec!["* a.zip: 10%".to_string()]);
    }

    #[test]
    fn strips_color_codes_and_control_characters() {
        assert_eq!(strip_ansi("\x1b[32m* a.zip\x1b[0m: 5%"), "* a.zip: 5%");
        assert_eq!(strip_ansi("\x1b[2Kplain\x07"), "plain");
        assert!(matches!(strip_ansi("untouched"), Cow::Borrowed(_)));
    }

    #[test]
    fn legacy_line_with_all_stats() {
        let t = parse_legacy_transfer("* a.zip: 10% /1 MiB, 1 MiB/s, 9s").unwrap();
        assert_eq!(t.name, "a.zip");
        assert_eq!(t.percentage, Some(10.0));
        assert_eq!(t.size, Some(1024 * 1024));
        assert_eq!(t.speed.as_deref(), Some("1 MiB/s"));
        assert_eq!(t.eta.as_deref(), Some("9s"));
    }

    #[test]
    fn legacy_line_with_placeholders() {
        let t = parse_legacy_transfer("* dir/b file.rar: transferring").unwrap();
        assert_eq!(t.name, "dir/b file.rar");
        assert_eq!(t.percentage, None);

        let t = parse_legacy_transfer("* c.7z: 100% /2.5Ki, 0/s, -").unwrap();
        assert_eq!(t.percentage, Some(100.0));
        assert_eq!(t.size, Some(2560));
        assert_eq!(t.eta, None);
    }

    #[test]
    fn placeholder_speed_and_eta_still_parse() {
        let t = parse_legacy_transfer("* a.zip: 100% /1Mi, -, -").unwrap();
        assert_eq!(t.percentage, Some(100.0));
        assert_eq!(t.size, Some(1024 * 1024));
        assert_eq!(t.speed, None);
        assert_eq!(t.eta, None);

        let t = parse_legacy_transfer("* a.zip: 10% /1Mi, -, 9s").unwrap();
        assert_eq!(t.percentage, Some(10.0));
        assert_eq!(t.speed, None);
        assert_eq!(t.eta.as_deref(), Some("9s"));
    }

    #[test]
    fn names_may_contain_colons() {
        let t = parse_legacy_transfer("* dir/a: b.zip: 10% /1Mi, 1 MiB/s, 9s").unwrap();
        assert_eq!(t.name, "dir/a: b.zip");
        assert_eq!(t.percentage, Some(10.0));
        assert_eq!(t.speed.as_deref(), Some("1 MiB/s"));

        let t = parse_legacy_transfer("* x:y.rar: transferring").unwrap();
        assert_eq!(t.name, "x:y.rar");
        assert_eq!(t.percentage, None);
    }

    #[test]
    fn summary_block_lines_are_not_transfers() {
        assert_eq!(
            parse_legacy_transfer("*        Transferred:   1.000 MiB / 10.000 MiB, 10%, 1.0 MiB/s, ETA 9s"),
            None
        );
        assert!(matches!(
            classify("Files:   1 / 10, 10%"),
            Some(LogRecord::Unrecognized(_))
        ));
        assert_eq!(classify("   "), None);
    }

    #[test]
    fn decodes_structured_shapes() {
        let copied = classify(r#"{"level":"info","msg":"Copied (new)","object":"a.zip"}"#);
        assert_eq!(
            copied,
            Some(LogRecord::Structured(ToolEvent::Completed {
                object: "a.zip".to_string()
            }))
        );

        let moved = classify(r#"{"level":"info","msg":"Moved (server-side)","object":"b.zip"}"#);
        assert!(matches!(
            moved,
            Some(LogRecord::Structured(ToolEvent::Completed { .. }))
        ));

        let transferred = classify(
            r#"{"msg":"Transferred","name":"c.zip","size":100,"bytes":50,"speed":"1 MiB/s"}"#,
        );
        match transferred {
            Some(LogRecord::Structured(ToolEvent::Transferred(p))) => {
                assert_eq!(p.name, "c.zip");
                assert_eq!(p.size, 100);
                assert_eq!(p.bytes, 50);
                assert_eq!(p.speed, Some(Metric::Text("1 MiB/s".to_string())));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let stats = classify(
            r#"{"level":"info","msg":"stats","stats":{"percentage":40,"speed":1024,"eta":3,"bytes":40,"totalBytes":100,"errors":1,"transferring":[{"name":"d.zip","size":100,"bytes":40,"speed":1024,"eta":3}]}}"#,
        );
        match stats {
            Some(LogRecord::Structured(ToolEvent::Stats { stats, .. })) => {
                assert_eq!(stats.percentage, Some(40.0));
                assert_eq!(stats.total_bytes, Some(100.0));
                assert_eq!(stats.errors, Some(1));
                let transferring = stats.transferring.unwrap_or_default();
                assert_eq!(transferring.len(), 1);
                assert_eq!(transferring[0].name, "d.zip");
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn transferring_message_without_name_carries_progress() {
        let record =
            classify(r#"{"level":"info","msg":"Transferring: sub/a.zip: 40% /1Mi, 1 MiB/s, 2s"}"#);
        match record {
            Some(LogRecord::Structured(ToolEvent::Transferring(t))) => {
                assert_eq!(t.name, "sub/a.zip");
                assert_eq!(t.percentage, Some(40.0));
                assert_eq!(t.size, Some(1024 * 1024));
                assert_eq!(t.eta.as_deref(), Some("2s"));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let bulleted = classify(r#"{"msg":"Transferring:\n * b.zip: 100% /2Ki, -, -"}"#);
        assert!(matches!(
            bulleted,
            Some(LogRecord::Structured(ToolEvent::Transferring(LegacyTransfer { ref name, .. }))) if name == "b.zip"
        ));

        assert!(matches!(
            classify(r#"{"level":"info","msg":"Transferring:"}"#),
            Some(LogRecord::Structured(ToolEvent::Message { .. }))
        ));
    }

    #[test]
    fn unknown_json_shapes_are_noops() {
        assert_eq!(
            classify(r#"{"time":"2024-01-01T00:00:00Z"}"#),
            Some(LogRecord::Structured(ToolEvent::Unknown))
        );
        assert_eq!(
            classify("[1,2,3]"),
            Some(LogRecord::Unrecognized("[1,2,3]".to_string()))
        );
        assert!(matches!(
            classify(r#"{"level":"error","msg":"401 Unauthorized"}"#),
            Some(LogRecord::Structured(ToolEvent::Message { .. }))
        ));
    }
}
