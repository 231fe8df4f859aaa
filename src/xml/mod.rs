//! Minimal tag-and-attribute documents for index metadata.
//!
//! The pack index can be persisted as a small structured document for human
//! inspection. This module is a self-contained builder/parser for that
//! dialect: elements with ordered attributes and children, optional text,
//! entity escapes, and two print modes. All nodes live in one arena owned
//! by the [`Document`]; dropping the document frees the whole tree at once.
//!
//! The parser accepts `"`- or `'`-quoted attribute values and skips
//! processing instructions and comments. Strict parsing (the default)
//! rejects mismatched open/close tags, text alongside child elements, empty
//! tags, and orphan close tags; [`Document::parse_fast`] skips the first two
//! checks.

use std::fmt;
use std::io::{self, Write};

/// Maximum element nesting the parser accepts.
const MAX_DEPTH: usize = 256;

/// What went wrong while parsing or printing a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// General syntax violation.
    Syntax,
    /// Open and close tags do not match.
    TagMismatch,
    /// Unknown entity escape.
    BadSpecial,
    /// Input ended in the middle of a node.
    IncompleteNode,
    /// Close tag with no matching open tag, or a missing root.
    Root,
    /// Nesting deeper than the supported limit.
    Level,
    /// Arena exhausted (element id space overflow).
    Alloc,
}

impl ErrorKind {
    fn describe(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax error",
            ErrorKind::TagMismatch => "begin/end tag mismatch",
            ErrorKind::BadSpecial => "invalid special character",
            ErrorKind::IncompleteNode => "incomplete node",
            ErrorKind::Root => "invalid root",
            ErrorKind::Level => "nesting too deep",
            ErrorKind::Alloc => "document too large",
        }
    }
}

/// Structured document error: a kind plus the offending fragment, when one
/// is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    /// Error category.
    pub kind: ErrorKind,
    /// Offending fragment or location hint.
    pub context: Option<String>,
}

impl XmlError {
    fn new(kind: ErrorKind) -> Self {
        XmlError {
            kind,
            context: None,
        }
    }

    fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        XmlError {
            kind,
            context: Some(context.into()),
        }
    }
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{} ({ctx})", self.kind.describe()),
            None => f.write_str(self.kind.describe()),
        }
    }
}

impl std::error::Error for XmlError {}

/// Specialized result for document operations.
pub type XmlResult<T> = std::result::Result<T, XmlError>;

/// Handle to an element inside a [`Document`] arena.
///
/// Ids are only meaningful for the document that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElemId(u32);

struct Elem {
    tag: String,
    text: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<ElemId>,
}

/// How [`Document::print`] lays out its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// No whitespace at all.
    Compact,
    /// XML declaration, one element per line, two spaces per depth.
    Formatted,
}

/// A tag/attribute tree with a single arena behind it.
#[derive(Default)]
pub struct Document {
    elems: Vec<Elem>,
    root: Option<ElemId>,
}

impl Document {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Building ─────────────────────────────────────────────────────────

    /// Allocate a new, unattached element.
    ///
    /// # Errors
    /// Returns [`ErrorKind::Alloc`] if the id space is exhausted.
    pub fn create_element(&mut self, tag: impl Into<String>) -> XmlResult<ElemId> {
        if self.elems.len() >= u32::MAX as usize {
            return Err(XmlError::new(ErrorKind::Alloc));
        }
        let id = ElemId(self.elems.len() as u32);
        self.elems.push(Elem {
            tag: tag.into(),
            text: None,
            attrs: Vec::new(),
            children: Vec::new(),
        });
        Ok(id)
    }

    /// Make `id` the document root.
    pub fn set_root(&mut self, id: ElemId) {
        self.root = Some(id);
    }

    /// Append `child` to `parent`'s ordered child list.
    pub fn append_child(&mut self, parent: ElemId, child: ElemId) {
        self.elems[parent.0 as usize].children.push(child);
    }

    /// Set an attribute, replacing an existing one of the same name or
    /// appending to the ordered list.
    pub fn set_attr(&mut self, id: ElemId, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let attrs = &mut self.elems[id.0 as usize].attrs;
        match attrs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => attrs.push((name, value)),
        }
    }

    /// Set or clear the text content of an element.
    pub fn set_text(&mut self, id: ElemId, text: impl Into<String>) {
        let text = text.into();
        self.elems[id.0 as usize].text = if text.is_empty() { None } else { Some(text) };
    }

    // ── Reading ──────────────────────────────────────────────────────────

    /// The document root, if one has been set or parsed.
    #[must_use]
    pub fn root(&self) -> Option<ElemId> {
        self.root
    }

    /// Tag of an element.
    #[must_use]
    pub fn tag(&self, id: ElemId) -> &str {
        &self.elems[id.0 as usize].tag
    }

    /// Text content of an element.
    #[must_use]
    pub fn text(&self, id: ElemId) -> Option<&str> {
        self.elems[id.0 as usize].text.as_deref()
    }

    /// Look up an attribute value by name.
    #[must_use]
    pub fn attr(&self, id: ElemId, name: &str) -> Option<&str> {
        self.elems[id.0 as usize]
            .attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Ordered attribute list.
    #[must_use]
    pub fn attrs(&self, id: ElemId) -> &[(String, String)] {
        &self.elems[id.0 as usize].attrs
    }

    /// Ordered children.
    #[must_use]
    pub fn children(&self, id: ElemId) -> &[ElemId] {
        &self.elems[id.0 as usize].children
    }

    /// First child with the given tag.
    #[must_use]
    pub fn find_child(&self, id: ElemId, tag: &str) -> Option<ElemId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.tag(*c) == tag)
    }

    /// Number of elements in the arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.elems.len()
    }

    // ── Parsing ──────────────────────────────────────────────────────────

    /// Parse a document, enforcing every structural check.
    ///
    /// # Errors
    /// Returns an [`XmlError`] describing the first violation.
    pub fn parse(input: &str) -> XmlResult<Self> {
        Self::parse_impl(input, true)
    }

    /// Parse without the tag-match and text-with-children checks.
    ///
    /// Error messages from malformed input are less precise in this mode.
    ///
    /// # Errors
    /// Returns an [`XmlError`] describing the first violation.
    pub fn parse_fast(input: &str) -> XmlResult<Self> {
        Self::parse_impl(input, false)
    }

    fn parse_impl(input: &str, strict: bool) -> XmlResult<Self> {
        let mut doc = Document::new();
        let mut parser = Parser {
            src: input.as_bytes(),
            pos: 0,
            strict,
        };
        parser.skip_misc();
        if parser.at_end() {
            return Err(XmlError::new(ErrorKind::IncompleteNode));
        }
        if parser.looking_at(b"</") {
            return Err(XmlError::with_context(ErrorKind::Root, "orphan close tag"));
        }
        if parser.peek() != Some(b'<') {
            return Err(XmlError::with_context(ErrorKind::Syntax, parser.context()));
        }
        let root = parser.parse_element(&mut doc, 0)?;
        doc.root = Some(root);
        parser.skip_misc();
        if strict && !parser.at_end() {
            return Err(XmlError::with_context(
                ErrorKind::Syntax,
                "content after root element",
            ));
        }
        Ok(doc)
    }

    // ── Printing ─────────────────────────────────────────────────────────

    /// Render the document to a string.
    ///
    /// # Errors
    /// Returns [`ErrorKind::Root`] if no root element is set.
    pub fn print(&self, mode: PrintMode) -> XmlResult<String> {
        if self.root.is_none() {
            return Err(XmlError::new(ErrorKind::Root));
        }
        let mut out = Vec::new();
        self.write_to(&mut out, mode)
            .map_err(|e| XmlError::with_context(ErrorKind::Syntax, e.to_string()))?;
        Ok(String::from_utf8(out).expect("printer emits UTF-8"))
    }

    /// Render the document into a writer.
    ///
    /// # Errors
    /// Returns the writer's I/O error, or `InvalidData` if no root is set.
    pub fn write_to<W: Write>(&self, w: &mut W, mode: PrintMode) -> io::Result<()> {
        let root = self.root.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, XmlError::new(ErrorKind::Root))
        })?;
        if mode == PrintMode::Formatted {
            w.write_all(b"<?xml version=\"1.0\" encoding=\"utf-8\"?>\n")?;
        }
        self.print_elem(w, root, mode, 0, true)
    }

    fn print_elem<W: Write>(
        &self,
        w: &mut W,
        id: ElemId,
        mode: PrintMode,
        level: usize,
        is_root: bool,
    ) -> io::Result<()> {
        let elem = &self.elems[id.0 as usize];
        let formatted = mode == PrintMode::Formatted;
        if formatted {
            for _ in 0..level {
                w.write_all(b"  ")?;
            }
        }
        w.write_all(b"<")?;
        w.write_all(elem.tag.as_bytes())?;
        for (name, value) in &elem.attrs {
            w.write_all(b" ")?;
            w.write_all(name.as_bytes())?;
            w.write_all(b"=\"")?;
            write_escaped(w, value)?;
            w.write_all(b"\"")?;
        }

        if elem.text.is_none() && elem.children.is_empty() && !is_root {
            w.write_all(b"/>")?;
        } else {
            w.write_all(b">")?;
            if let Some(text) = &elem.text {
                write_escaped(w, text)?;
            } else if !elem.children.is_empty() {
                if formatted {
                    w.write_all(b"\n")?;
                }
                for child in &elem.children {
                    self.print_elem(w, *child, mode, level + 1, false)?;
                }
                if formatted {
                    for _ in 0..level {
                        w.write_all(b"  ")?;
                    }
                }
            }
            w.write_all(b"</")?;
            w.write_all(elem.tag.as_bytes())?;
            w.write_all(b">")?;
        }
        if formatted {
            w.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.elems.len())
            .field("root", &self.root)
            .finish()
    }
}

fn write_escaped<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let mut start = 0;
    let bytes = s.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let esc: &[u8] = match b {
            b'<' => b"&lt;",
            b'>' => b"&gt;",
            b'&' => b"&amp;",
            b'\'' => b"&apos;",
            b'"' => b"&quot;",
            _ => continue,
        };
        w.write_all(&bytes[start..i])?;
        w.write_all(esc)?;
        start = i + 1;
    }
    w.write_all(&bytes[start..])
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    strict: bool,
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'.' | b'-')
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn looking_at(&self, pat: &[u8]) -> bool {
        self.src[self.pos..].starts_with(pat)
    }

    fn context(&self) -> String {
        let end = (self.pos + 24).min(self.src.len());
        String::from_utf8_lossy(&self.src[self.pos..end]).into_owned()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace, processing instructions, comments and declarations.
    fn skip_misc(&mut self) {
        loop {
            self.skip_ws();
            if self.looking_at(b"<?") {
                self.skip_until(b"?>");
            } else if self.looking_at(b"<!--") {
                self.skip_until(b"-->");
            } else if self.looking_at(b"<!") {
                self.skip_until(b">");
            } else {
                return;
            }
        }
    }

    fn skip_until(&mut self, terminator: &[u8]) {
        while self.pos < self.src.len() && !self.looking_at(terminator) {
            self.pos += 1;
        }
        self.pos = (self.pos + terminator.len()).min(self.src.len());
    }

    fn parse_name(&mut self) -> XmlResult<&'a str> {
        let start = self.pos;
        while self.peek().is_some_and(is_name_byte) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(XmlError::with_context(ErrorKind::Syntax, self.context()));
        }
        // Name bytes are ASCII, so the slice is valid UTF-8.
        Ok(std::str::from_utf8(&self.src[start..self.pos]).unwrap())
    }

    /// Decode text up to (not including) `stop`, expanding entities.
    fn parse_text(&mut self, stop: u8) -> XmlResult<String> {
        let mut out = String::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(XmlError::new(ErrorKind::IncompleteNode));
            };
            if b == stop {
                return Ok(out);
            }
            if b == b'&' {
                out.push(self.parse_entity()?);
            } else {
                // Copy a run of plain bytes verbatim.
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == stop || b == b'&' {
                        break;
                    }
                    self.pos += 1;
                }
                out.push_str(&String::from_utf8_lossy(&self.src[start..self.pos]));
            }
        }
    }

    fn parse_entity(&mut self) -> XmlResult<char> {
        let rest = &self.src[self.pos..];
        for (pat, ch) in [
            (&b"&lt;"[..], '<'),
            (&b"&gt;"[..], '>'),
            (&b"&amp;"[..], '&'),
            (&b"&apos;"[..], '\''),
            (&b"&quot;"[..], '"'),
        ] {
            if rest.starts_with(pat) {
                self.pos += pat.len();
                return Ok(ch);
            }
        }
        Err(XmlError::with_context(ErrorKind::BadSpecial, self.context()))
    }

    fn parse_attr(&mut self, doc: &mut Document, id: ElemId) -> XmlResult<()> {
        let name = self.parse_name()?.to_owned();
        if self.peek() != Some(b'=') {
            return Err(XmlError::with_context(ErrorKind::Syntax, self.context()));
        }
        self.pos += 1;
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(XmlError::with_context(ErrorKind::Syntax, self.context())),
        };
        self.pos += 1;
        let value = self.parse_text(quote)?;
        self.pos += 1; // closing quote
        doc.elems[id.0 as usize].attrs.push((name, value));
        Ok(())
    }

    fn parse_element(&mut self, doc: &mut Document, depth: usize) -> XmlResult<ElemId> {
        if depth >= MAX_DEPTH {
            return Err(XmlError::with_context(
                ErrorKind::Level,
                format!("depth {depth}"),
            ));
        }
        debug_assert_eq!(self.peek(), Some(b'<'));
        self.pos += 1;
        let tag = self.parse_name()?;
        let id = doc.create_element(tag)?;

        // Attributes until '>' or '/>'.
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') => {
                    if !self.looking_at(b"/>") {
                        return Err(XmlError::with_context(ErrorKind::Syntax, self.context()));
                    }
                    self.pos += 2;
                    return Ok(id);
                }
                Some(b) if is_name_byte(b) => self.parse_attr(doc, id)?,
                Some(_) => {
                    return Err(XmlError::with_context(ErrorKind::Syntax, self.context()))
                }
                None => return Err(XmlError::new(ErrorKind::IncompleteNode)),
            }
        }

        // Content: text and/or children until the close tag.
        let mut text = String::new();
        loop {
            let chunk = self.parse_text(b'<')?;
            text.push_str(&chunk);
            if self.looking_at(b"</") {
                self.pos += 2;
                let close = self.parse_name()?;
                if self.strict && close != doc.tag(id) {
                    return Err(XmlError::with_context(
                        ErrorKind::TagMismatch,
                        format!("{}/{}", doc.tag(id), close),
                    ));
                }
                self.skip_ws();
                if self.peek() != Some(b'>') {
                    return Err(XmlError::with_context(ErrorKind::Syntax, self.context()));
                }
                self.pos += 1;
                break;
            }
            if self.looking_at(b"<?") {
                self.skip_until(b"?>");
                continue;
            }
            if self.looking_at(b"<!--") {
                self.skip_until(b"-->");
                continue;
            }
            let child = self.parse_element(doc, depth + 1)?;
            doc.append_child(id, child);
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            if self.strict && !doc.children(id).is_empty() {
                return Err(XmlError::with_context(
                    ErrorKind::Syntax,
                    format!("text content on <{}> with child elements", doc.tag(id)),
                ));
            }
            doc.elems[id.0 as usize].text = Some(trimmed.to_owned());
        }
        Ok(id)
    }
}
