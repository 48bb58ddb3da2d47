//! Pre-parsed field paths.
//!
//! A path such as `rel.evidence[study_type='rct'].paper_id` is parsed once by
//! the validator into a root and a list of segments; the resolver walks the
//! segments without touching the original string again.

use std::fmt;

/// Equality predicate embedded in a segment: `[key='value']`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPredicate {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub predicate: Option<SegmentPredicate>,
}

/// A dotted field reference rooted at a variable or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    root: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse `root(.segment([key='value'])?)*`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts = split_segments(raw)?;
        let mut parts = parts.into_iter();
        let root = match parts.next() {
            Some(first) => first,
            None => return Err("empty field path".into()),
        };
        if root.predicate.is_some() {
            return Err("a predicate cannot apply to the root variable".into());
        }
        Ok(Self {
            raw: raw.to_string(),
            root: root.name,
            segments: parts.collect(),
        })
    }

    /// Parse a path with no root variable, as used inside `property_filters`.
    /// Every part becomes a segment.
    pub fn parse_relative(raw: &str) -> Result<Self, String> {
        let segments = split_segments(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            root: String::new(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Name of the first segment after the root, if any.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(|s| s.name.as_str())
    }

    /// Whether any segment carries an embedded predicate.
    pub fn has_predicate(&self) -> bool {
        self.segments.iter().any(|s| s.predicate.is_some())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_segments(raw: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if !(c.is_alphanumeric() || c == '_' || c == '-') {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            return Err(format!("empty segment in \"{raw}\""));
        }

        let mut predicate = None;
        if chars.peek() == Some(&'[') {
            chars.next();
            let mut body = String::new();
            let mut quote: Option<char> = None;
            loop {
                match chars.next() {
                    None => return Err(format!("unterminated '[' in \"{raw}\"")),
                    Some(']') if quote.is_none() => break,
                    Some(c @ ('\'' | '"')) if quote.is_none() => {
                        quote = Some(c);
                        body.push(c);
                    }
                    Some(c) => {
                        if Some(c) == quote {
                            quote = None;
                        }
                        body.push(c);
                    }
                }
            }
            predicate = Some(parse_predicate(&body, raw)?);
        }
        segments.push(Segment { name, predicate });

        match chars.next() {
            None => break,
            Some('.') => {}
            Some(c) => return Err(format!("unexpected character '{c}' in \"{raw}\"")),
        }
    }
    Ok(segments)
}

fn parse_predicate(body: &str, raw: &str) -> Result<SegmentPredicate, String> {
    let Some((key, value)) = body.split_once('=') else {
        return Err(format!("predicate must be key='value' in \"{raw}\""));
    };
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("bad predicate key in \"{raw}\""));
    }
    let value = value.trim();
    let unquoted = ['\'', '"']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value);
    if unquoted.is_empty() {
        return Err(format!("empty predicate value in \"{raw}\""));
    }
    Ok(SegmentPredicate {
        key: key.to_string(),
        value: unquoted.to_string(),
    })
}
