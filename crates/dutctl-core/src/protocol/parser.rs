//! Line-level framing of `@dutctl` directives inside device output.
//!
//! The parser never drops text: for every line, `passthrough` followed by
//! `directive` reproduces the input exactly. Only a `report` whose text ends
//! in `\` carries state across lines; each following line is taken whole as
//! part of the value until one does not end in `\`.

use super::command::{Command, Directive, MARKER, Verb};
use super::error::ProtocolError;
use super::legacy;

/// What a single line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Ordinary device output.
    Plain,
    /// A complete, validated command.
    Command(Command),
    /// Part of a directive that continues on the next line.
    Continued,
    /// A directive that failed validation.
    Error(ProtocolError),
}

/// The parser's view of one line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// 1-based line number in the stream.
    pub line: u64,
    /// Text preceding the marker (the whole line for plain output).
    pub passthrough: Option<String>,
    /// Marker and everything after it.
    pub directive: Option<String>,
    pub outcome: LineOutcome,
}

impl ParsedLine {
    /// Concatenation of passthrough and directive text; equals the input line.
    pub fn reassemble(&self) -> String {
        let mut out = self.passthrough.clone().unwrap_or_default();
        if let Some(d) = &self.directive {
            out.push_str(d);
        }
        out
    }

    pub fn command(&self) -> Option<&Command> {
        match &self.outcome {
            LineOutcome::Command(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    start_line: u64,
    raw: String,
    body: String,
}

/// Stream parser. Feed it lines without their terminator, in order.
#[derive(Debug)]
pub struct Parser {
    next_line: u64,
    pending: Option<Pending>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            next_line: 1,
            pending: None,
        }
    }

    /// Number of lines fed so far.
    pub fn lines_seen(&self) -> u64 {
        self.next_line - 1
    }

    /// Whether a continued directive is waiting for more lines.
    pub fn in_continuation(&self) -> bool {
        self.pending.is_some()
    }

    pub fn feed(&mut self, line: &str) -> ParsedLine {
        let number = self.next_line;
        self.next_line += 1;

        if let Some(mut pending) = self.pending.take() {
            pending.raw.push('\n');
            pending.raw.push_str(line);
            let text = line.trim();
            let outcome = match text.strip_suffix('\\') {
                Some(part) => {
                    push_word(&mut pending.body, part);
                    self.pending = Some(pending);
                    LineOutcome::Continued
                }
                None => {
                    push_word(&mut pending.body, text);
                    complete(&pending.body, pending.raw, pending.start_line)
                }
            };
            return ParsedLine {
                line: number,
                passthrough: None,
                directive: Some(line.to_string()),
                outcome,
            };
        }

        let Some(at) = find_marker(line) else {
            return ParsedLine {
                line: number,
                passthrough: non_empty(line),
                directive: None,
                outcome: LineOutcome::Plain,
            };
        };

        let directive = &line[at..];
        let rest = &directive[MARKER.len()..];
        let outcome = if let Some(body) = rest.strip_prefix(':') {
            match legacy::decode(body) {
                Ok(decoded) => LineOutcome::Command(Command {
                    verb: decoded.verb,
                    args: decoded.args,
                    directive: decoded.directive,
                    raw: directive.to_string(),
                    line: number,
                    delay: decoded.delay,
                }),
                Err(e) => LineOutcome::Error(e),
            }
        } else {
            let body = rest.trim();
            let is_report = body.split_whitespace().next() == Some(Verb::Report.as_str());
            match body.strip_suffix('\\') {
                Some(head) if is_report => {
                    let mut text = String::new();
                    push_word(&mut text, head);
                    self.pending = Some(Pending {
                        start_line: number,
                        raw: directive.to_string(),
                        body: text,
                    });
                    LineOutcome::Continued
                }
                _ => complete(body, directive.to_string(), number),
            }
        };

        ParsedLine {
            line: number,
            passthrough: non_empty(&line[..at]),
            directive: Some(directive.to_string()),
            outcome,
        }
    }

    /// Signal end of stream. Returns an error if a continued directive was
    /// left incomplete; its partial text is discarded.
    pub fn finish(&mut self) -> Option<ProtocolError> {
        self.pending.take().map(|p| ProtocolError::Truncated {
            verb: Verb::Report,
            line: p.start_line,
        })
    }
}

fn complete(body: &str, raw: String, line: u64) -> LineOutcome {
    match build(body, raw, line) {
        Ok(command) => LineOutcome::Command(command),
        Err(e) => LineOutcome::Error(e),
    }
}

fn build(body: &str, raw: String, line: u64) -> Result<Command, ProtocolError> {
    let mut tokens = body.split_whitespace();
    let verb: Verb = tokens.next().ok_or(ProtocolError::Empty)?.parse()?;
    let args: Vec<String> = tokens.map(str::to_string).collect();
    let directive = Directive::parse(verb, &args)?;
    Ok(Command {
        verb,
        args,
        directive,
        raw,
        line,
        delay: Default::default(),
    })
}

/// Position of the first marker that is followed by whitespace, `:`, or
/// the end of the line.
fn find_marker(line: &str) -> Option<usize> {
    line.match_indices(MARKER).map(|(i, _)| i).find(|&i| {
        line[i + MARKER.len()..]
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == ':')
    })
}

fn push_word(buf: &mut String, part: &str) {
    let part = part.trim();
    if part.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(part);
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}
