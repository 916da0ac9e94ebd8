// src/core/pipeline/minify.rs

//! Content-type-gated minification.
//!
//! The minifiers are deliberately conservative: they strip comments and
//! collapse whitespace with full string/escape awareness, and whenever a
//! construct cannot be tracked safely (an unterminated comment, a regex
//! candidate spanning lines) they give up and the original bytes pass
//! through. A content-level problem never fails the pipeline.

use crate::core::errors::CacheError;
use crate::core::pipeline::Transform;
use crate::core::storage::meta::CacheMeta;
use crate::core::storage::{BodyReader, read_body, reader_from_bytes};
use async_trait::async_trait;

/// Elements whose text content must never be reflowed.
const RAW_TEXT_ELEMENTS: [&str; 4] = ["script", "style", "pre", "textarea"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Html,
    Css,
    Js,
    Json,
    Svg,
    Xml,
}

/// Strips parameters and normalizes the media type token of a
/// `Content-Type` header value.
pub fn media_type_of(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub struct MinifyTransform {
    html: bool,
    css: bool,
    js: bool,
    json: bool,
    svg: bool,
    xml: bool,
}

impl MinifyTransform {
    pub fn new(html: bool, css: bool, js: bool, json: bool, svg: bool, xml: bool) -> Self {
        Self {
            html,
            css,
            js,
            json,
            svg,
            xml,
        }
    }

    fn kind_for(&self, media_type: &str) -> Option<MediaKind> {
        match media_type {
            "text/html" if self.html => Some(MediaKind::Html),
            "text/css" if self.css => Some(MediaKind::Css),
            "text/javascript" | "application/javascript" | "application/x-javascript"
                if self.js =>
            {
                Some(MediaKind::Js)
            }
            "application/json" if self.json => Some(MediaKind::Json),
            "image/svg+xml" if self.svg => Some(MediaKind::Svg),
            "text/xml" | "application/xml" if self.xml => Some(MediaKind::Xml),
            _ => None,
        }
    }
}

#[async_trait]
impl Transform for MinifyTransform {
    fn name(&self) -> &'static str {
        "minify"
    }

    async fn apply(
        &self,
        body: BodyReader,
        meta: &CacheMeta,
    ) -> Result<(BodyReader, CacheMeta), CacheError> {
        // Encoded bytes are opaque; leave them to the decompress transform.
        if meta.is_encoded() {
            return Ok((body, meta.clone()));
        }
        let Some(kind) = self.kind_for(&media_type_of(&meta.content_type)) else {
            return Ok((body, meta.clone()));
        };

        let data = read_body(body, None).await?;
        let minified = match minify(kind, &data) {
            Some(out) => out,
            None => data,
        };

        let mut new_meta = meta.clone();
        new_meta.size = minified.len() as u64;
        Ok((reader_from_bytes(minified), new_meta))
    }
}

fn minify(kind: MediaKind, data: &[u8]) -> Option<Vec<u8>> {
    match kind {
        MediaKind::Html => minify_html(data),
        MediaKind::Css => minify_css(data),
        MediaKind::Js => minify_js(data),
        MediaKind::Json => minify_json(data),
        MediaKind::Svg | MediaKind::Xml => minify_xml(data),
    }
}

/// Finds `needle` at or after `from`, tolerating out-of-range starts.
fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    let hay = haystack.get(from..)?;
    hay.windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Copies a quoted string literal (including both quotes) verbatim,
/// honoring backslash escapes. Returns the index just past the close quote.
fn copy_string(input: &[u8], start: usize, out: &mut Vec<u8>) -> Option<usize> {
    let quote = input[start];
    out.push(quote);
    let mut i = start + 1;
    while i < input.len() {
        let b = input[i];
        out.push(b);
        if b == b'\\' {
            let escaped = *input.get(i + 1)?;
            out.push(escaped);
            i += 2;
            continue;
        }
        if b == quote {
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Copies one markup tag verbatim from `<` through `>`, respecting quoted
/// attribute values. Returns the index just past the `>`.
fn copy_tag(input: &[u8], start: usize, out: &mut Vec<u8>) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut i = start;
    while i < input.len() {
        let b = input[i];
        out.push(b);
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'>' {
                    return Some(i + 1);
                }
            }
        }
        i += 1;
    }
    None
}

/// The element name of an opening tag, lowercased; `None` for closing tags,
/// comments and directives.
fn tag_name(tag: &[u8]) -> Option<String> {
    let first = *tag.get(1)?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    let mut end = 1;
    while end < tag.len() && tag[end].is_ascii_alphanumeric() {
        end += 1;
    }
    Some(String::from_utf8_lossy(&tag[1..end]).to_ascii_lowercase())
}

/// Copies raw-text element content verbatim through its closing tag.
fn copy_raw_text(input: &[u8], from: usize, name: &str, out: &mut Vec<u8>) -> Option<usize> {
    let close = format!("</{name}");
    let lower = input.get(from..)?.to_ascii_lowercase();
    let close_at = find(&lower, 0, close.as_bytes())? + from;
    let gt = input.get(close_at..)?.iter().position(|&b| b == b'>')? + close_at;
    out.extend_from_slice(&input[from..=gt]);
    Some(gt + 1)
}

fn minify_html(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b == b'<' {
            if input[i..].starts_with(b"<!--") {
                i = find(input, i + 4, b"-->")? + 3;
                continue;
            }
            if input[i..].starts_with(b"<![CDATA[") {
                let end = find(input, i + 9, b"]]>")? + 3;
                out.extend_from_slice(&input[i..end]);
                i = end;
                continue;
            }
            let tag_start = i;
            i = copy_tag(input, i, &mut out)?;
            if let Some(name) = tag_name(&input[tag_start..i]) {
                if RAW_TEXT_ELEMENTS.contains(&name.as_str())
                    && !input[tag_start..i].ends_with(b"/>")
                {
                    i = copy_raw_text(input, i, &name, &mut out)?;
                }
            }
            continue;
        }
        if b.is_ascii_whitespace() {
            let mut j = i;
            while j < input.len() && input[j].is_ascii_whitespace() {
                j += 1;
            }
            // Runs strictly between tags vanish; runs touching text collapse
            // to a single space.
            let keep = match (out.last().copied(), input.get(j).copied()) {
                (None, _) | (_, None) => false,
                (Some(b'>'), Some(b'<')) => false,
                _ => true,
            };
            if keep {
                out.push(b' ');
            }
            i = j;
            continue;
        }
        out.push(b);
        i += 1;
    }
    Some(out)
}

fn minify_css(input: &[u8]) -> Option<Vec<u8>> {
    // Whitespace next to these is never significant. `+` stays out: calc()
    // requires spaces around it.
    const DROP_AFTER: &[u8] = b"{};,(:>~";
    const DROP_BEFORE: &[u8] = b"{};,)>~";

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b == b'"' || b == b'\'' {
            i = copy_string(input, i, &mut out)?;
            continue;
        }
        if b == b'/' && input.get(i + 1) == Some(&b'*') {
            i = find(input, i + 2, b"*/")? + 2;
            continue;
        }
        if b.is_ascii_whitespace() {
            let mut j = i;
            while j < input.len() && input[j].is_ascii_whitespace() {
                j += 1;
            }
            let prev = out.last().copied();
            let next = input.get(j).copied();
            let drop = match (prev, next) {
                (None, _) | (_, None) => true,
                (Some(p), Some(n)) => DROP_AFTER.contains(&p) || DROP_BEFORE.contains(&n),
            };
            if !drop {
                out.push(b' ');
            }
            i = j;
            continue;
        }
        if b == b'}' && out.last() == Some(&b';') {
            out.pop();
        }
        out.push(b);
        i += 1;
    }
    Some(out)
}

/// Whether a `/` at the current position starts a regex literal rather than
/// a division, judged from the last significant byte and the last word.
fn regex_position(prev: Option<u8>, last_word: &[u8]) -> bool {
    const REGEX_KEYWORDS: [&[u8]; 14] = [
        b"return",
        b"typeof",
        b"instanceof",
        b"in",
        b"of",
        b"new",
        b"delete",
        b"void",
        b"throw",
        b"case",
        b"do",
        b"else",
        b"yield",
        b"await",
    ];
    match prev {
        None => true,
        Some(c) if is_ident_char(c) => REGEX_KEYWORDS.contains(&last_word),
        Some(c) => matches!(
            c,
            b'(' | b','
                | b'='
                | b':'
                | b'['
                | b'!'
                | b'&'
                | b'|'
                | b'?'
                | b'{'
                | b'}'
                | b';'
                | b'<'
                | b'>'
                | b'+'
                | b'-'
                | b'*'
                | b'%'
                | b'^'
                | b'~'
        ),
    }
}

/// Copies a regex literal (with flags) verbatim. Bails out on anything that
/// looks wrong, which makes a misjudged division fall back to the original.
fn copy_regex(input: &[u8], start: usize, out: &mut Vec<u8>) -> Option<usize> {
    out.push(b'/');
    let mut i = start + 1;
    let mut in_class = false;
    while i < input.len() {
        let b = input[i];
        match b {
            b'\\' => {
                out.push(b);
                let escaped = *input.get(i + 1)?;
                out.push(escaped);
                i += 2;
                continue;
            }
            b'\n' => return None,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => {
                out.push(b);
                i += 1;
                while i < input.len() && is_ident_char(input[i]) {
                    out.push(input[i]);
                    i += 1;
                }
                return Some(i);
            }
            _ => {}
        }
        out.push(b);
        i += 1;
    }
    None
}

/// Copies a template literal verbatim, descending into `${}` expressions.
fn copy_template(input: &[u8], start: usize, out: &mut Vec<u8>) -> Option<usize> {
    out.push(b'`');
    let mut i = start + 1;
    while i < input.len() {
        let b = input[i];
        if b == b'\\' {
            out.push(b);
            let escaped = *input.get(i + 1)?;
            out.push(escaped);
            i += 2;
            continue;
        }
        if b == b'`' {
            out.push(b);
            return Some(i + 1);
        }
        if b == b'$' && input.get(i + 1) == Some(&b'{') {
            out.extend_from_slice(b"${");
            i += 2;
            let mut depth = 1usize;
            while i < input.len() && depth > 0 {
                let c = input[i];
                match c {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    b'"' | b'\'' => {
                        i = copy_string(input, i, out)?;
                        continue;
                    }
                    b'`' => {
                        i = copy_template(input, i, out)?;
                        continue;
                    }
                    _ => {}
                }
                out.push(c);
                i += 1;
            }
            if depth != 0 {
                return None;
            }
            continue;
        }
        out.push(b);
        i += 1;
    }
    None
}

fn minify_js(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    // Last emitted significant byte and last identifier-ish word, for the
    // regex-vs-division call.
    let mut prev_significant: Option<u8> = None;
    let mut last_word: Vec<u8> = Vec::new();
    let mut word_boundary = false;

    while i < input.len() {
        let b = input[i];

        if b == b'"' || b == b'\'' {
            i = copy_string(input, i, &mut out)?;
            prev_significant = Some(b);
            last_word.clear();
            continue;
        }
        if b == b'`' {
            i = copy_template(input, i, &mut out)?;
            prev_significant = Some(b'`');
            last_word.clear();
            continue;
        }
        if b == b'/' && input.get(i + 1) == Some(&b'/') {
            while i < input.len() && input[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if b == b'/' && input.get(i + 1) == Some(&b'*') {
            let end = find(input, i + 2, b"*/")?;
            // A multi-line comment can terminate a statement; keep one
            // newline so automatic semicolon insertion still applies.
            if input[i..end].contains(&b'\n') && out.last().is_some_and(|&c| c != b'\n') {
                out.push(b'\n');
            }
            i = end + 2;
            continue;
        }
        if b == b'/' && regex_position(prev_significant, &last_word) {
            i = copy_regex(input, i, &mut out)?;
            prev_significant = Some(b'/');
            last_word.clear();
            continue;
        }
        if b.is_ascii_whitespace() {
            let mut j = i;
            let mut has_newline = false;
            while j < input.len() && input[j].is_ascii_whitespace() {
                if input[j] == b'\n' || input[j] == b'\r' {
                    has_newline = true;
                }
                j += 1;
            }
            let (Some(&prev), Some(&next)) = (out.last(), input.get(j)) else {
                i = j;
                continue;
            };
            if has_newline {
                // Newlines survive (collapsed) so semicolon insertion is
                // never disturbed.
                if prev != b'\n' {
                    out.push(b'\n');
                }
            } else {
                let joins_idents = is_ident_char(prev) && is_ident_char(next);
                let forms_increment = prev == next && (prev == b'+' || prev == b'-');
                if joins_idents || forms_increment {
                    out.push(b' ');
                }
            }
            word_boundary = true;
            i = j;
            continue;
        }

        out.push(b);
        prev_significant = Some(b);
        if is_ident_char(b) {
            if word_boundary {
                last_word.clear();
            }
            last_word.push(b);
        } else {
            last_word.clear();
        }
        word_boundary = false;
        i += 1;
    }
    Some(out)
}

fn minify_json(input: &[u8]) -> Option<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(input).ok()?;
    serde_json::to_vec(&value).ok()
}

fn minify_xml(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b == b'<' {
            if input[i..].starts_with(b"<!--") {
                i = find(input, i + 4, b"-->")? + 3;
                continue;
            }
            if input[i..].starts_with(b"<![CDATA[") {
                let end = find(input, i + 9, b"]]>")? + 3;
                out.extend_from_slice(&input[i..end]);
                i = end;
                continue;
            }
            i = copy_tag(input, i, &mut out)?;
            continue;
        }
        if b.is_ascii_whitespace() {
            let mut j = i;
            while j < input.len() && input[j].is_ascii_whitespace() {
                j += 1;
            }
            // Only runs strictly between tags go away; text whitespace may
            // be significant in XML, so it is kept verbatim.
            let drop = match (out.last().copied(), input.get(j).copied()) {
                (None, _) | (_, None) => true,
                (Some(b'>'), Some(b'<')) => true,
                _ => false,
            };
            if !drop {
                out.extend_from_slice(&input[i..j]);
            }
            i = j;
            continue;
        }
        out.push(b);
        i += 1;
    }
    Some(out)
}
