//! Incremental scanner for the tag language embedded in model output (§6).
//!
//! Model text arrives in arbitrary-sized chunks; a tag's opening delimiter,
//! attributes, body, and closing delimiter can each land in different
//! chunks. The parser buffers everything it cannot yet decide about and
//! only emits plain text once it is sure no tag starts inside it, per the
//! "no regex-only approach on unbuffered text" note in §9.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::data::FileOperation;

use super::errors::StreamError;

const TAG_PREFIX: &str = "<dyad-";

/// One piece of output from feeding the parser more model text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Plain text to forward verbatim as a `chat:chunk` fragment.
    Text(String),
    /// A fully-parsed, actionable operation, queued for execution at stream
    /// completion (§4.6 step 5 — tags are parsed eagerly but not applied).
    Operation(FileOperation),
}

static ATTR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w[\w-]*)\s*=\s*"([^"]*)"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Write,
    Rename,
    Delete,
    SearchReplace,
    AddDependency,
    /// `<dyad-execute-sql>` and `type="pip"` dependency tags are recognized
    /// so the parser does not choke on them, but are out-of-scope hooks:
    /// they are consumed and dropped rather than queued as an operation.
    Hook,
}

fn tag_kind(name: &str) -> Option<TagKind> {
    match name {
        "dyad-write" => Some(TagKind::Write),
        "dyad-rename" => Some(TagKind::Rename),
        "dyad-delete" => Some(TagKind::Delete),
        "dyad-search-replace" => Some(TagKind::SearchReplace),
        "dyad-add-dependency" => Some(TagKind::AddDependency),
        "dyad-execute-sql" => Some(TagKind::Hook),
        _ => None,
    }
}

/// Self-closing-only tags never carry a body, regardless of whether the
/// model happens to close them with `/>` or a bare `>`.
fn always_self_closing(kind: TagKind) -> bool {
    matches!(kind, TagKind::Rename | TagKind::Delete)
}

pub struct TagParser {
    buffer: String,
}

impl Default for TagParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TagParser {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feeds more model text in, returning every event that can now be
    /// decided. Incomplete trailing tags stay buffered for the next call.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<ParseEvent>, StreamError> {
        self.buffer.push_str(chunk);
        self.drain()
    }

    /// Call once the model stream ends. Flushes any trailing plain text and
    /// errors if a tag was left open (boundary behavior in §8).
    pub fn finish(mut self) -> Result<Vec<ParseEvent>, StreamError> {
        let events = self.drain()?;
        let mut events = events;
        if self.buffer.starts_with(TAG_PREFIX) {
            return Err(StreamError::TagParse(format!(
                "unterminated tag at stream end: {}",
                truncate(&self.buffer, 80)
            )));
        }
        if !self.buffer.is_empty() {
            events.push(ParseEvent::Text(std::mem::take(&mut self.buffer)));
        }
        Ok(events)
    }

    fn drain(&mut self) -> Result<Vec<ParseEvent>, StreamError> {
        let mut events = Vec::new();

        loop {
            match self.buffer.find(TAG_PREFIX) {
                None => {
                    // No tag start in the buffer. Hold back a suffix that
                    // could still grow into "<dyad-" once more text arrives.
                    let hold = partial_prefix_len(&self.buffer, TAG_PREFIX);
                    let emit_len = self.buffer.len() - hold;
                    if emit_len > 0 {
                        events.push(ParseEvent::Text(self.buffer[..emit_len].to_string()));
                        self.buffer.drain(..emit_len);
                    }
                    break;
                }
                Some(tag_start) => {
                    if tag_start > 0 {
                        events.push(ParseEvent::Text(self.buffer[..tag_start].to_string()));
                        self.buffer.drain(..tag_start);
                    }

                    match self.try_consume_tag()? {
                        Some(event) => {
                            if let Some(event) = event {
                                events.push(event);
                            }
                            // loop again from the front of the buffer
                        }
                        None => break, // incomplete tag, wait for more input
                    }
                }
            }
        }

        Ok(events)
    }

    /// Attempts to consume one complete tag from the front of `self.buffer`.
    /// Returns `Ok(Some(None))` for a hook tag consumed with no emitted
    /// operation, `Ok(Some(Some(event)))` for an actionable tag, and
    /// `Ok(None)` when the buffer does not yet hold a complete tag.
    #[allow(clippy::type_complexity)]
    fn try_consume_tag(&mut self) -> Result<Option<Option<ParseEvent>>, StreamError> {
        debug_assert!(self.buffer.starts_with(TAG_PREFIX));

        let Some(open_end) = self.buffer.find('>') else {
            return Ok(None);
        };
        let header = &self.buffer[..=open_end];
        let self_closing_delim = header.ends_with("/>");
        let name_end = header[1..].find(|c: char| c.is_whitespace() || c == '/' || c == '>').map(|i| i + 1);
        let Some(name_end) = name_end else {
            return Ok(None);
        };
        let name = &header[1..name_end];

        let Some(kind) = tag_kind(name) else {
            return Err(StreamError::TagParse(format!("unknown tag: {}", name)));
        };

        let attrs_src = &header[name_end..header.len() - if self_closing_delim { 2 } else { 1 }];
        let attrs = parse_attrs(attrs_src);

        if self_closing_delim || always_self_closing(kind) {
            if !self_closing_delim && !header.ends_with('>') {
                return Ok(None);
            }
            let event = build_self_closing(kind, &attrs)?;
            self.buffer.drain(..=open_end);
            return Ok(Some(event));
        }

        // Needs a body and a closing tag.
        let closing = format!("</{}>", name);
        let body_start = open_end + 1;
        let Some(rel_close) = self.buffer[body_start..].find(closing.as_str()) else {
            return Ok(None);
        };
        let body = self.buffer[body_start..body_start + rel_close].to_string();
        let consume_to = body_start + rel_close + closing.len();

        let event = build_with_body(kind, &attrs, body)?;
        self.buffer.drain(..consume_to);
        Ok(Some(event))
    }
}

fn build_self_closing(kind: TagKind, attrs: &[(String, String)]) -> Result<Option<ParseEvent>, StreamError> {
    match kind {
        TagKind::Rename => {
            let from = attr(attrs, "from").ok_or_else(|| StreamError::TagParse("dyad-rename missing from".into()))?;
            let to = attr(attrs, "to").ok_or_else(|| StreamError::TagParse("dyad-rename missing to".into()))?;
            Ok(Some(ParseEvent::Operation(FileOperation::Rename { from, to })))
        }
        TagKind::Delete => {
            let path = attr(attrs, "path").ok_or_else(|| StreamError::TagParse("dyad-delete missing path".into()))?;
            Ok(Some(ParseEvent::Operation(FileOperation::Delete { path })))
        }
        TagKind::AddDependency => Ok(build_add_dependency(attrs)),
        TagKind::Hook => Ok(None),
        TagKind::Write | TagKind::SearchReplace => {
            Err(StreamError::TagParse(format!("{:?} tag cannot be self-closing", kind)))
        }
    }
}

fn build_with_body(kind: TagKind, attrs: &[(String, String)], body: String) -> Result<Option<ParseEvent>, StreamError> {
    match kind {
        TagKind::Write => {
            let path = attr(attrs, "path").ok_or_else(|| StreamError::TagParse("dyad-write missing path".into()))?;
            Ok(Some(ParseEvent::Operation(FileOperation::Write {
                path,
                content: strip_code_fence(&body),
            })))
        }
        TagKind::SearchReplace => {
            let path = attr(attrs, "path")
                .ok_or_else(|| StreamError::TagParse("dyad-search-replace missing path".into()))?;
            let mut parts = body.splitn(2, "|||");
            let find = parts.next().unwrap_or_default().to_string();
            let replace = parts
                .next()
                .ok_or_else(|| StreamError::TagParse("dyad-search-replace missing ||| delimiter".into()))?
                .to_string();
            Ok(Some(ParseEvent::Operation(FileOperation::SearchReplace { path, find, replace })))
        }
        TagKind::AddDependency => Ok(build_add_dependency(attrs)),
        TagKind::Hook => Ok(None),
        TagKind::Rename | TagKind::Delete => {
            Err(StreamError::TagParse(format!("{:?} tag must be self-closing", kind)))
        }
    }
}

fn build_add_dependency(attrs: &[(String, String)]) -> Option<ParseEvent> {
    // `type="pip"` dependencies are an out-of-scope hook (§6); only the
    // default (npm-family) form is queued as an actionable operation.
    if attr(attrs, "type").as_deref() == Some("pip") {
        return None;
    }
    let packages = attr(attrs, "packages")
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect::<Vec<_>>();
    if packages.is_empty() {
        return None;
    }
    Some(ParseEvent::Operation(FileOperation::AddDependencies { packages }))
}

fn attr(attrs: &[(String, String)], key: &str) -> Option<String> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn parse_attrs(src: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(src)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Strips a leading/trailing markdown code fence (```` ``` ```` optionally
/// followed by a language tag) that models sometimes wrap write bodies in.
fn strip_code_fence(body: &str) -> String {
    let trimmed = body.trim_matches('\n');
    let mut lines: Vec<&str> = trimmed.split('\n').collect();

    if let Some(first) = lines.first() {
        if first.trim_start().starts_with("```") {
            lines.remove(0);
        }
    }
    if let Some(last) = lines.last() {
        if last.trim() == "```" {
            lines.pop();
        }
    }
    lines.join("\n")
}

/// Length of the longest suffix of `buf` that is itself a non-empty prefix
/// of `needle`, so a split tag delimiter is never split again across calls.
fn partial_prefix_len(buf: &str, needle: &str) -> usize {
    let max = needle.len().min(buf.len());
    for len in (1..=max).rev() {
        if needle.starts_with(&buf[buf.len() - len..]) {
            return len;
        }
    }
    0
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(events: Vec<ParseEvent>) -> Vec<FileOperation> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ParseEvent::Operation(op) => Some(op),
                ParseEvent::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn parses_write_tag_in_one_chunk() {
        let mut p = TagParser::new();
        let events = p
            .feed("before <dyad-write path=\"src/index.html\">hello</dyad-write> after")
            .unwrap();
        assert_eq!(
            ops(events.clone()),
            vec![FileOperation::Write { path: "src/index.html".into(), content: "hello".into() }]
        );
        assert!(events.iter().any(|e| matches!(e, ParseEvent::Text(t) if t.contains("before"))));
    }

    #[test]
    fn handles_tag_split_across_chunks() {
        let mut p = TagParser::new();
        let mut all = Vec::new();
        all.extend(p.feed("<dyad-wr").unwrap());
        all.extend(p.feed("ite path=\"a.txt\">hel").unwrap());
        all.extend(p.feed("lo</dyad-write>").unwrap());
        assert_eq!(ops(all), vec![FileOperation::Write { path: "a.txt".into(), content: "hello".into() }]);
    }

    #[test]
    fn strips_code_fence_from_write_body() {
        let mut p = TagParser::new();
        let events = p
            .feed("<dyad-write path=\"a.js\">```js\nconsole.log(1)\n```</dyad-write>")
            .unwrap();
        assert_eq!(
            ops(events),
            vec![FileOperation::Write { path: "a.js".into(), content: "console.log(1)".into() }]
        );
    }

    #[test]
    fn parses_self_closing_rename_and_delete() {
        let mut p = TagParser::new();
        let events = p
            .feed(r#"<dyad-rename from="a.txt" to="b.txt" /><dyad-delete path="c.txt" />"#)
            .unwrap();
        assert_eq!(
            ops(events),
            vec![
                FileOperation::Rename { from: "a.txt".into(), to: "b.txt".into() },
                FileOperation::Delete { path: "c.txt".into() },
            ]
        );
    }

    #[test]
    fn parses_search_replace_delimiter() {
        let mut p = TagParser::new();
        let events = p
            .feed(r#"<dyad-search-replace path="a.txt">old|||new</dyad-search-replace>"#)
            .unwrap();
        assert_eq!(
            ops(events),
            vec![FileOperation::SearchReplace { path: "a.txt".into(), find: "old".into(), replace: "new".into() }]
        );
    }

    #[test]
    fn parses_add_dependency_space_separated() {
        let mut p = TagParser::new();
        let events = p
            .feed(r#"<dyad-add-dependency packages="left-pad lodash"></dyad-add-dependency>"#)
            .unwrap();
        assert_eq!(ops(events), vec![FileOperation::AddDependencies { packages: vec!["left-pad".into(), "lodash".into()] }]);
    }

    #[test]
    fn ignores_pip_dependency_and_execute_sql_hooks() {
        let mut p = TagParser::new();
        let events = p
            .feed(r#"<dyad-add-dependency type="pip" packages="requests"></dyad-add-dependency><dyad-execute-sql>select 1</dyad-execute-sql>"#)
            .unwrap();
        assert!(ops(events).is_empty());
    }

    #[test]
    fn unterminated_tag_at_stream_end_is_an_error() {
        let mut p = TagParser::new();
        p.feed("<dyad-write path=\"a.txt\">partial").unwrap();
        assert!(matches!(p.finish(), Err(StreamError::TagParse(_))));
    }

    #[test]
    fn plain_text_with_no_tags_passes_through() {
        let mut p = TagParser::new();
        let events = p.feed("just some text").unwrap();
        assert_eq!(events, vec![ParseEvent::Text("just some text".into())]);
        assert!(p.finish().unwrap().is_empty());
    }
}
