//! `<head>` reordering.
//!
//! Children of `<head>` are kept as their exact source text so that entities
//! and attribute quoting survive untouched. Reordering only moves children
//! around; the set of children before and after must be identical.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Id of the inline script that picks the color scheme before first paint.
pub const DARK_MODE_SCRIPT_ID: &str = "detect-dark-mode";

/// Id of the `<style>` element holding the critical CSS.
pub const CRITICAL_CSS_ID: &str = "critical-css";

const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: [&str; 5] = ["script", "style", "title", "textarea", "noscript"];

/// Errors raised while parsing or reordering a `<head>`.
#[derive(Debug, thiserror::Error)]
pub enum HeadIntegrityError {
    #[error("Document has no <head> element")]
    MissingHead,

    #[error("Unterminated <{tag}> in <head>")]
    Unterminated { tag: String },

    #[error("Head reordering added {count} element(s)")]
    ElementsAdded { count: usize },

    #[error(
        "Head reordering lost elements [{}] ({before} before, {after} after)",
        tags.join(", ")
    )]
    ElementsLost {
        tags: Vec<String>,
        before: usize,
        after: usize,
    },
}

/// Identity of a head child within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element { tag: String, id: Option<String> },
    Comment,
    Text,
}

/// A child of `<head>` with its original source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadNode {
    id: NodeId,
    kind: NodeKind,
    raw: String,
}

impl HeadNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Lowercase tag name for elements.
    pub fn tag(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Value of the `id` attribute for elements.
    pub fn element_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Element { id, .. } => id.as_deref(),
            _ => None,
        }
    }

    fn label(&self) -> String {
        match &self.kind {
            NodeKind::Element { tag, .. } => tag.clone(),
            NodeKind::Comment => "#comment".to_string(),
            NodeKind::Text => "#text".to_string(),
        }
    }
}

/// Position of a head child in the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadSlot {
    DarkModeScript,
    MetaOrTitle,
    CriticalStyle,
    Link,
    Other,
}

impl HeadSlot {
    /// Slots from first to last.
    pub const CANONICAL_ORDER: [HeadSlot; 5] = [
        HeadSlot::DarkModeScript,
        HeadSlot::MetaOrTitle,
        HeadSlot::CriticalStyle,
        HeadSlot::Link,
        HeadSlot::Other,
    ];

    /// Assign a node to exactly one slot. The first matching rule wins.
    pub fn classify(node: &HeadNode) -> Self {
        match (node.tag(), node.element_id()) {
            (Some("script"), Some(DARK_MODE_SCRIPT_ID)) => HeadSlot::DarkModeScript,
            (Some("meta" | "title"), _) => HeadSlot::MetaOrTitle,
            (Some("style"), Some(CRITICAL_CSS_ID)) => HeadSlot::CriticalStyle,
            // Links go before other scripts; WebKit shows unstyled content otherwise
            (Some("link"), _) => HeadSlot::Link,
            _ => HeadSlot::Other,
        }
    }

    fn rank(self) -> usize {
        match self {
            HeadSlot::DarkModeScript => 0,
            HeadSlot::MetaOrTitle => 1,
            HeadSlot::CriticalStyle => 2,
            HeadSlot::Link => 3,
            HeadSlot::Other => 4,
        }
    }
}

/// An HTML document split around its `<head>` children.
#[derive(Debug, Clone)]
pub struct HeadDocument {
    /// Everything up to and including the `<head>` open tag
    prefix: String,
    children: Vec<HeadNode>,
    /// Everything from `</head>` on
    suffix: String,
    next_id: usize,
}

impl HeadDocument {
    /// Split `html` into the text around `<head>` and the head's children.
    ///
    /// Whitespace between children is formatting and is not kept.
    pub fn parse(html: &str) -> Result<Self, HeadIntegrityError> {
        let lower = html.to_ascii_lowercase();

        let head_start = find_head_open(html, &lower).ok_or(HeadIntegrityError::MissingHead)?;
        let open_end = tag_end(html, head_start).ok_or_else(|| unterminated("head"))?;

        let mut children = Vec::new();
        let mut pos = open_end;

        loop {
            if pos >= html.len() {
                return Err(unterminated("head"));
            }
            if tag_at(&lower, pos, "</head") {
                break;
            }

            let (end, kind) = scan_node(html, &lower, pos)?;
            let raw = &html[pos..end];

            if !(kind == NodeKind::Text && raw.trim().is_empty()) {
                children.push(HeadNode {
                    id: NodeId(children.len()),
                    kind,
                    raw: raw.to_string(),
                });
            }
            pos = end;
        }

        Ok(Self {
            prefix: html[..open_end].to_string(),
            next_id: children.len(),
            children,
            suffix: html[pos..].to_string(),
        })
    }

    pub fn children(&self) -> &[HeadNode] {
        &self.children
    }

    /// Replace any critical CSS `<style>` with a fresh one at the end of `<head>`.
    pub fn set_critical_css(&mut self, css: &str) {
        self.children
            .retain(|node| HeadSlot::classify(node) != HeadSlot::CriticalStyle);

        let raw = format!(
            "<style id=\"{}\">{}</style>",
            CRITICAL_CSS_ID,
            css.replace("</", "<\\/")
        );
        self.push_element("style", Some(CRITICAL_CSS_ID), raw);
    }

    fn push_element(&mut self, tag: &str, id: Option<&str>, raw: String) {
        self.children.push(HeadNode {
            id: NodeId(self.next_id),
            kind: NodeKind::Element {
                tag: tag.to_string(),
                id: id.map(str::to_string),
            },
            raw,
        });
        self.next_id += 1;
    }

    /// Rearrange children into canonical order.
    ///
    /// Leaves the document untouched if the result would not contain exactly
    /// the same children.
    pub fn reorder(&mut self) -> Result<(), HeadIntegrityError> {
        let mut buckets: [Vec<HeadNode>; 5] = Default::default();
        for node in &self.children {
            buckets[HeadSlot::classify(node).rank()].push(node.clone());
        }

        let ordered: Vec<HeadNode> = buckets.into_iter().flatten().collect();
        verify_children(&self.children, &ordered)?;

        self.children = ordered;
        Ok(())
    }

    /// Serialize the document.
    pub fn render(&self) -> String {
        let children_len: usize = self.children.iter().map(|n| n.raw.len()).sum();
        let mut html =
            String::with_capacity(self.prefix.len() + children_len + self.suffix.len());

        html.push_str(&self.prefix);
        for node in &self.children {
            html.push_str(&node.raw);
        }
        html.push_str(&self.suffix);
        html
    }
}

/// Check that `after` holds exactly the nodes of `before`.
pub fn verify_children(before: &[HeadNode], after: &[HeadNode]) -> Result<(), HeadIntegrityError> {
    let before_ids: HashSet<NodeId> = before.iter().map(HeadNode::id).collect();
    let after_ids: HashSet<NodeId> = after.iter().map(HeadNode::id).collect();

    let lost: Vec<String> = before
        .iter()
        .filter(|node| !after_ids.contains(&node.id))
        .map(HeadNode::label)
        .collect();
    if !lost.is_empty() {
        return Err(HeadIntegrityError::ElementsLost {
            tags: lost,
            before: before.len(),
            after: after.len(),
        });
    }

    let foreign = after
        .iter()
        .filter(|node| !before_ids.contains(&node.id))
        .count();
    let duplicated = after.len() - after_ids.len();
    if foreign + duplicated > 0 {
        return Err(HeadIntegrityError::ElementsAdded {
            count: foreign + duplicated,
        });
    }

    Ok(())
}

fn unterminated(tag: &str) -> HeadIntegrityError {
    HeadIntegrityError::Unterminated {
        tag: tag.to_string(),
    }
}

/// Offset of the `<head` open tag. Comments and declarations before it are
/// skipped so a `<head>` mentioned inside them doesn't count.
fn find_head_open(html: &str, lower: &str) -> Option<usize> {
    let mut pos = 0;
    while let Some(i) = lower.get(pos..)?.find('<') {
        let at = pos + i;
        if lower[at..].starts_with("<!--") {
            pos = at + 4 + lower[at + 4..].find("-->")? + 3;
        } else if lower[at..].starts_with("<!") || lower[at..].starts_with("<?") {
            pos = tag_end(html, at)?;
        } else if tag_at(lower, at, "<head") {
            return Some(at);
        } else {
            pos = at + 1;
        }
    }
    None
}

/// Scan one head child starting at `pos`. Returns its end offset and kind.
fn scan_node(html: &str, lower: &str, pos: usize) -> Result<(usize, NodeKind), HeadIntegrityError> {
    let bytes = html.as_bytes();

    if bytes[pos] != b'<' {
        let end = html[pos..].find('<').map_or(html.len(), |i| pos + i);
        return Ok((end, NodeKind::Text));
    }

    if lower[pos..].starts_with("<!--") {
        let end = lower[pos + 4..]
            .find("-->")
            .map(|i| pos + 4 + i + 3)
            .ok_or_else(|| unterminated("#comment"))?;
        return Ok((end, NodeKind::Comment));
    }

    let next = bytes.get(pos + 1).copied().unwrap_or(b' ');

    if !next.is_ascii_alphabetic() {
        // Doctype, stray end tag, or a literal '<'
        if next == b'!' || next == b'/' {
            let end = tag_end(html, pos).ok_or_else(|| unterminated("#text"))?;
            return Ok((end, NodeKind::Text));
        }
        let end = html[pos + 1..].find('<').map_or(html.len(), |i| pos + 1 + i);
        return Ok((end, NodeKind::Text));
    }

    let name_len = lower[pos + 1..]
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b':')
        .count();
    let tag = lower[pos + 1..pos + 1 + name_len].to_string();

    let open_end = tag_end(html, pos).ok_or_else(|| unterminated(&tag))?;
    let open_tag = &html[pos..open_end];
    let self_closing = open_tag[..open_tag.len() - 1].trim_end().ends_with('/');
    let id = extract_id(open_tag);

    let end = if VOID_ELEMENTS.contains(&tag.as_str()) || self_closing {
        open_end
    } else {
        let close_start = if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            find_tag(lower, &format!("</{}", tag), open_end)
        } else {
            find_matching_close(lower, &tag, open_end)
        }
        .ok_or_else(|| unterminated(&tag))?;

        tag_end(html, close_start).ok_or_else(|| unterminated(&tag))?
    };

    Ok((end, NodeKind::Element { tag, id }))
}

/// Offset just past the `>` closing the tag that starts at `start`.
fn tag_end(html: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut after_equals = false;

    for (i, &b) in html.as_bytes().iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'>' => return Some(i + 1),
                b'"' | b'\'' if after_equals => quote = Some(b),
                b'=' => {
                    after_equals = true;
                    continue;
                }
                b if b.is_ascii_whitespace() && after_equals => continue,
                _ => {}
            },
        }
        after_equals = false;
    }

    None
}

/// Find `needle` (a lowercase `<tag` or `</tag`) as a whole tag name.
fn find_tag(lower: &str, needle: &str, from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(i) = lower.get(pos..)?.find(needle) {
        let at = pos + i;
        match lower.as_bytes().get(at + needle.len()) {
            None | Some(b'>') | Some(b'/') => return Some(at),
            Some(b) if b.is_ascii_whitespace() => return Some(at),
            _ => pos = at + 1,
        }
    }
    None
}

/// Whether `needle` starts a whole tag name at `pos`.
fn tag_at(lower: &str, pos: usize, needle: &str) -> bool {
    lower[pos..].starts_with(needle)
        && match lower.as_bytes().get(pos + needle.len()) {
            None | Some(b'>') | Some(b'/') => true,
            Some(b) => b.is_ascii_whitespace(),
        }
}

/// Find the close tag matching an already-open `tag`, allowing nesting.
fn find_matching_close(lower: &str, tag: &str, from: usize) -> Option<usize> {
    let open = format!("<{}", tag);
    let close = format!("</{}", tag);
    let mut depth = 1;
    let mut pos = from;

    loop {
        let next_close = find_tag(lower, &close, pos)?;
        match find_tag(lower, &open, pos) {
            Some(next_open) if next_open < next_close => {
                depth += 1;
                pos = next_open + open.len();
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    return Some(next_close);
                }
                pos = next_close + close.len();
            }
        }
    }
}

fn extract_id(open_tag: &str) -> Option<String> {
    static ID_ATTR: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)\sid\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
            .expect("Invalid id attribute regex")
    });

    let caps = ID_ATTR.captures(open_tag)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().to_string())
}
