//! Surgical edits of a service's `image:` value.
//!
//! The document is never re-serialized. We locate the byte range of the
//! value with a line scanner and splice the new reference in, so quoting,
//! comments, anchors and key order stay exactly as the operator wrote them.

use std::ops::Range;

use super::ComposeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePatch {
    pub text: String,
    pub previous: PreviousImage,
    pub changed: bool,
}

/// The service's `image:` before an edit, enough to undo it exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousImage {
    Value(String),
    /// `image:` with no value.
    Empty,
    /// No `image:` key. `newline_added` when the file lacked a final newline
    /// and one was added before the inserted line.
    Missing { newline_added: bool },
}

impl PreviousImage {
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Value(value) => Some(value),
            Self::Empty | Self::Missing { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Existing value, quotes excluded. `after_key` is the offset right
    /// after the colon and `line` spans the whole line with its terminator.
    Value {
        range: Range<usize>,
        after_key: usize,
        line: Range<usize>,
    },
    /// `image:` with nothing after it; the value goes at `at`.
    Empty { at: usize },
    /// No `image:` key; a whole line goes at `at`.
    Missing { at: usize, indent: usize },
}

struct Line<'a> {
    start: usize,
    /// Offset after the line terminator.
    end: usize,
    /// Without the line terminator.
    content: &'a str,
}

impl Line<'_> {
    fn indent(&self) -> usize {
        self.content.len() - self.content.trim_start_matches(' ').len()
    }

    fn is_blank_or_comment(&self) -> bool {
        let trimmed = self.content.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    }
}

fn lines(text: &str) -> Vec<Line<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let content = raw.strip_suffix('\n').unwrap_or(raw);
        let content = content.strip_suffix('\r').unwrap_or(content);
        out.push(Line {
            start,
            end: start + raw.len(),
            content,
        });
        start += raw.len();
    }
    out
}

/// Split `key: rest` at the start of `s`. Returns the key and the offset of
/// the text after the colon.
fn split_key(s: &str) -> Option<(&str, usize)> {
    if let Some(quote) = s.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let close = s[1..].find(quote)? + 1;
        let after = &s[close + 1..];
        let colon = after.find(|c: char| c != ' ')?;
        if !after[colon..].starts_with(':') {
            return None;
        }
        return Some((&s[1..close], close + 1 + colon + 1));
    }
    let colon = s
        .char_indices()
        .find(|(i, c)| *c == ':' && s[i + 1..].chars().next().is_none_or(|n| n == ' ' || n == '\t'))
        .map(|(i, _)| i)?;
    Some((s[..colon].trim_end(), colon + 1))
}

/// Whether the text after a key's colon leaves the value to the next lines.
fn opens_block(rest: &str) -> bool {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        return true;
    }
    // An anchor on a block mapping: `web: &web`.
    match rest.strip_prefix('&') {
        Some(anchor) => anchor
            .split_once(char::is_whitespace)
            .is_none_or(|(_, tail)| tail.trim_start().starts_with('#')),
        None => false,
    }
}

fn locate(text: &str, service: &str) -> Result<Slot, ComposeError> {
    let lines = lines(text);

    let services = lines
        .iter()
        .position(|l| {
            l.indent() == 0
                && split_key(l.content)
                    .is_some_and(|(key, rest)| key == "services" && opens_block(&l.content[rest..]))
        })
        .ok_or_else(|| ComposeError::Patch("no top-level services mapping".to_string()))?;

    let mut service_indent = None;
    let mut found = None;
    for (i, line) in lines.iter().enumerate().skip(services + 1) {
        if line.is_blank_or_comment() {
            continue;
        }
        let indent = line.indent();
        if indent == 0 {
            break;
        }
        let expected = *service_indent.get_or_insert(indent);
        if indent != expected {
            continue;
        }
        if let Some((key, rest)) = split_key(&line.content[indent..]) {
            if key == service {
                if !opens_block(&line.content[indent + rest..]) {
                    return Err(ComposeError::Patch(format!(
                        "service {service} is not a block mapping"
                    )));
                }
                found = Some((i, indent));
                break;
            }
        }
    }
    let (key_line, service_indent) =
        found.ok_or_else(|| ComposeError::Patch(format!("service {service} not found")))?;

    let body: Vec<&Line> = lines[key_line + 1..]
        .iter()
        .take_while(|l| l.is_blank_or_comment() || l.indent() > service_indent)
        .collect();
    let child_indent = body
        .iter()
        .find(|l| !l.is_blank_or_comment())
        .map(|l| l.indent());

    let Some(child_indent) = child_indent else {
        return Ok(Slot::Missing {
            at: lines
                .get(key_line + 1)
                .map(|l| l.start)
                .unwrap_or(text.len()),
            indent: service_indent + 2,
        });
    };

    for line in body.iter().filter(|l| !l.is_blank_or_comment()) {
        if line.indent() != child_indent {
            continue;
        }
        let Some((key, rest)) = split_key(&line.content[child_indent..]) else {
            continue;
        };
        if key != "image" {
            continue;
        }
        let value_start = line.start + child_indent + rest;
        let after = &line.content[child_indent + rest..];
        let leading = after.len() - after.trim_start().len();
        let value = &after[leading..];
        if value.is_empty() || value.starts_with('#') {
            return Ok(Slot::Empty { at: value_start });
        }
        let start = value_start + leading;
        if let Some(quote) = value.chars().next().filter(|c| *c == '"' || *c == '\'') {
            let close = value[1..].find(quote).ok_or_else(|| {
                ComposeError::Patch(format!("unterminated quote in image of {service}"))
            })?;
            return Ok(Slot::Value {
                range: start + 1..start + 1 + close,
                after_key: value_start,
                line: line.start..line.end,
            });
        }
        let end = value.find(" #").unwrap_or(value.len());
        let len = value[..end].trim_end().len();
        return Ok(Slot::Value {
            range: start..start + len,
            after_key: value_start,
            line: line.start..line.end,
        });
    }

    let first_child = body
        .iter()
        .find(|l| !l.is_blank_or_comment())
        .map(|l| l.start)
        .unwrap_or(text.len());
    Ok(Slot::Missing {
        at: first_child,
        indent: child_indent,
    })
}

/// The current `image:` value of `service`.
pub fn service_image(text: &str, service: &str) -> Result<Option<String>, ComposeError> {
    Ok(match locate(text, service)? {
        Slot::Value { range, .. } => Some(text[range].to_string()),
        Slot::Empty { .. } | Slot::Missing { .. } => None,
    })
}

fn splice(text: &str, range: Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..range.start]);
    out.push_str(replacement);
    out.push_str(&text[range.end..]);
    out
}

/// Point `service` at `image`, touching nothing but that value.
pub fn set_service_image(
    text: &str,
    service: &str,
    image: &str,
) -> Result<ImagePatch, ComposeError> {
    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let (range, replacement, previous) = match locate(text, service)? {
        Slot::Value { range, .. } => {
            let previous = text[range.clone()].to_string();
            if previous == image {
                return Ok(ImagePatch {
                    text: text.to_string(),
                    previous: PreviousImage::Value(previous),
                    changed: false,
                });
            }
            (range, image.to_string(), PreviousImage::Value(previous))
        }
        Slot::Empty { at } => (at..at, format!(" {image}"), PreviousImage::Empty),
        Slot::Missing { at, indent } => {
            let mut line = String::new();
            let newline_added = at == text.len() && !text.is_empty() && !text.ends_with('\n');
            if newline_added {
                line.push_str(newline);
            }
            line.push_str(&" ".repeat(indent));
            line.push_str("image: ");
            line.push_str(image);
            line.push_str(newline);
            (at..at, line, PreviousImage::Missing { newline_added })
        }
    };

    Ok(ImagePatch {
        text: splice(text, range, &replacement),
        previous,
        changed: true,
    })
}

/// Undo [`set_service_image`]: put `previous` back, removing the value or
/// the whole line when the edit had added them.
pub fn restore_service_image(
    text: &str,
    service: &str,
    previous: &PreviousImage,
) -> Result<ImagePatch, ComposeError> {
    if let PreviousImage::Value(value) = previous {
        return set_service_image(text, service, value);
    }
    let Slot::Value {
        range,
        after_key,
        line,
    } = locate(text, service)?
    else {
        return Ok(ImagePatch {
            text: text.to_string(),
            previous: previous.clone(),
            changed: false,
        });
    };
    let current = PreviousImage::Value(text[range.clone()].to_string());
    let removed = match previous {
        PreviousImage::Missing { newline_added: true } => {
            let terminator = if text[..line.start].ends_with("\r\n") { 2 } else { 1 };
            line.start.saturating_sub(terminator)..line.end
        }
        PreviousImage::Missing { newline_added: false } => line,
        _ => {
            let quoted = text[range.end..].starts_with(['"', '\'']);
            after_key..range.end + usize::from(quoted)
        }
    };
    Ok(ImagePatch {
        text: splice(text, removed, ""),
        previous: current,
        changed: true,
    })
}
