//! Lifts `$$...$$` and `$...$` math out of raw markdown.
//!
//! Math is swapped for sentinel-wrapped placeholders before comrak sees the
//! document, so emphasis, escapes and smart punctuation cannot mangle the
//! LaTeX source. Block math is extracted first; otherwise a `$$` pair would be
//! split into two inline matches. Fenced code blocks and inline code spans are
//! copied through untouched.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::application::render::types::{MathBlock, MathKind};

static BLOCK_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\$(.+?)\$\$").expect("block math pattern must compile"));

/// Markdown with math replaced by placeholders, plus the lifted expressions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedMarkdown {
    pub text: String,
    /// Block expressions first, then inline, each in source order.
    pub blocks: Vec<MathBlock>,
}

pub fn extract_math(markdown: &str) -> ExtractedMarkdown {
    let segments = split_code_segments(markdown);

    let mut block_math = Vec::new();
    let staged: Vec<Segment<Cow<'_, str>>> = segments
        .into_iter()
        .map(|segment| match segment {
            Segment::Prose(text) => Segment::Prose(extract_block_math(text, &mut block_math)),
            Segment::Code(text) => Segment::Code(Cow::Borrowed(text)),
        })
        .collect();

    let mut inline_math = Vec::new();
    let mut text = String::with_capacity(markdown.len());
    for segment in &staged {
        match segment {
            Segment::Prose(prose) => text.push_str(&extract_inline_math(prose, &mut inline_math)),
            Segment::Code(code) => text.push_str(code),
        }
    }

    block_math.extend(inline_math);
    ExtractedMarkdown {
        text,
        blocks: block_math,
    }
}

fn extract_block_math<'a>(text: &'a str, out: &mut Vec<MathBlock>) -> Cow<'a, str> {
    BLOCK_MATH.replace_all(text, |caps: &Captures<'_>| {
        let content = caps[1].trim();
        if content.is_empty() {
            return caps[0].to_string();
        }
        push_math(out, MathKind::Block, content)
    })
}

fn extract_inline_math<'a>(text: &'a str, out: &mut Vec<MathBlock>) -> Cow<'a, str> {
    let bytes = text.as_bytes();
    let mut rewritten: Option<String> = None;
    let mut copied_until = 0;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('$') {
        let open = cursor + offset;
        cursor = open + 1;

        if is_escaped(bytes, open) {
            continue;
        }
        let Some(close) = find_inline_close(bytes, open + 1) else {
            continue;
        };
        let content = &text[open + 1..close];
        if !is_inline_content(content) {
            continue;
        }

        let buffer = rewritten.get_or_insert_with(|| String::with_capacity(text.len()));
        buffer.push_str(&text[copied_until..open]);
        buffer.push_str(&push_math(out, MathKind::Inline, content.trim()));
        copied_until = close + 1;
        cursor = close + 1;
    }

    match rewritten {
        Some(mut buffer) => {
            buffer.push_str(&text[copied_until..]);
            Cow::Owned(buffer)
        }
        None => Cow::Borrowed(text),
    }
}

fn push_math(out: &mut Vec<MathBlock>, kind: MathKind, content: &str) -> String {
    let placeholder = kind.placeholder(out.len());
    out.push(MathBlock {
        kind,
        raw_content: content.to_string(),
        placeholder: placeholder.clone(),
    });
    placeholder
}

/// Next unescaped `$` on the same line.
fn find_inline_close(bytes: &[u8], from: usize) -> Option<usize> {
    for (index, byte) in bytes.iter().enumerate().skip(from) {
        match byte {
            b'\n' => return None,
            b'$' if !is_escaped(bytes, index) => return Some(index),
            _ => {}
        }
    }
    None
}

/// Preceded by an odd number of backslashes.
fn is_escaped(bytes: &[u8], index: usize) -> bool {
    let backslashes = bytes[..index]
        .iter()
        .rev()
        .take_while(|byte| **byte == b'\\')
        .count();
    backslashes % 2 == 1
}

fn is_inline_content(content: &str) -> bool {
    let starts_solid = content.chars().next().is_some_and(|ch| !ch.is_whitespace());
    let ends_solid = content.chars().last().is_some_and(|ch| !ch.is_whitespace());
    starts_solid && ends_solid
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<T> {
    Prose(T),
    Code(T),
}

/// Split markdown into prose and code (fenced blocks, backtick spans).
fn split_code_segments(text: &str) -> Vec<Segment<&str>> {
    let mut segments = Vec::new();
    let mut prose_start = 0;
    let mut fence_start = 0;
    let mut open_fence: Option<(u8, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = strip_container_markers(line);

        match open_fence {
            None => {
                if let Some(fence) = fence_opening(trimmed) {
                    push_prose(&mut segments, &text[prose_start..line_start]);
                    open_fence = Some(fence);
                    fence_start = line_start;
                }
            }
            Some((marker, length)) => {
                if closes_fence(trimmed, marker, length) {
                    segments.push(Segment::Code(&text[fence_start..offset]));
                    open_fence = None;
                    prose_start = offset;
                }
            }
        }
    }

    if open_fence.is_some() {
        segments.push(Segment::Code(&text[fence_start..]));
    } else {
        push_prose(&mut segments, &text[prose_start..]);
    }

    segments
}

/// Drop leading indentation plus any blockquote (`>`) and list item
/// (`-`, `*`, `+`, `1.`, `1)`) markers, so fences nested in containers are
/// still recognised.
fn strip_container_markers(line: &str) -> &str {
    let mut rest = line.trim_start_matches([' ', '\t']);
    loop {
        let bytes = rest.as_bytes();
        let marker_len = match bytes.first() {
            Some(b'>') => 1,
            Some(b'-' | b'*' | b'+') if matches!(bytes.get(1), Some(b' ' | b'\t')) => 1,
            Some(b'0'..=b'9') => {
                let digits = bytes.iter().take_while(|byte| byte.is_ascii_digit()).count();
                let delimited = matches!(bytes.get(digits), Some(b'.' | b')'));
                let spaced = matches!(bytes.get(digits + 1), Some(b' ' | b'\t'));
                if digits <= 9 && delimited && spaced {
                    digits + 1
                } else {
                    return rest;
                }
            }
            _ => return rest,
        };
        rest = rest[marker_len..].trim_start_matches([' ', '\t']);
    }
}

fn fence_opening(line: &str) -> Option<(u8, usize)> {
    let marker = *line.as_bytes().first()?;
    if marker != b'`' && marker != b'~' {
        return None;
    }
    let length = run_length(line.as_bytes(), 0, marker);
    if length < 3 {
        return None;
    }
    // A backtick fence's info string may not itself contain backticks.
    if marker == b'`' && line[length..].contains('`') {
        return None;
    }
    Some((marker, length))
}

fn closes_fence(line: &str, marker: u8, length: usize) -> bool {
    let run = run_length(line.as_bytes(), 0, marker);
    run >= length && line[run..].trim().is_empty()
}

fn push_prose<'a>(segments: &mut Vec<Segment<&'a str>>, prose: &'a str) {
    let bytes = prose.as_bytes();
    let mut copied_until = 0;
    let mut cursor = 0;

    while let Some(offset) = prose[cursor..].find('`') {
        let start = cursor + offset;
        if is_escaped(bytes, start) {
            cursor = start + 1;
            continue;
        }
        let run = run_length(bytes, start, b'`');
        match find_closing_run(bytes, start + run, run) {
            Some(end) => {
                if start > copied_until {
                    segments.push(Segment::Prose(&prose[copied_until..start]));
                }
                segments.push(Segment::Code(&prose[start..end]));
                copied_until = end;
                cursor = end;
            }
            None => cursor = start + run,
        }
    }

    if copied_until < prose.len() {
        segments.push(Segment::Prose(&prose[copied_until..]));
    }
}

/// End offset of the next backtick run of exactly `run` characters.
fn find_closing_run(bytes: &[u8], from: usize, run: usize) -> Option<usize> {
    let mut index = from;
    while index < bytes.len() {
        if bytes[index] == b'`' {
            let length = run_length(bytes, index, b'`');
            if length == run {
                return Some(index + length);
            }
            index += length;
        } else {
            index += 1;
        }
    }
    None
}

fn run_length(bytes: &[u8], start: usize, marker: u8) -> usize {
    bytes[start..].iter().take_while(|byte| **byte == marker).count()
}
