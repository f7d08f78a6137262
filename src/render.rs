//! Terminal rendering of assistant replies
//!
//! Markdown is turned into ANSI-styled, word-wrapped lines. Plain mode
//! only wraps. Nothing here is wider than [`MAX_WIDTH`] columns.

use crossterm::style::{Attribute, Color, ContentStyle, StyledContent};
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

pub const MAX_WIDTH: usize = 100;
const MIN_CONTENT_WIDTH: usize = 20;
const RULE_WIDTH: usize = 40;
const QUOTE_PREFIX: &str = "│ ";
const CODE_INDENT: &str = "    ";

/// Current terminal width, capped at [`MAX_WIDTH`]
pub fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(cols, _)| cols as usize)
        .unwrap_or(MAX_WIDTH)
        .clamp(MIN_CONTENT_WIDTH, MAX_WIDTH)
}

/// Render a reply for display, as markdown or as plain wrapped text
pub fn render_reply(text: &str, markdown: bool, width: usize) -> String {
    if markdown {
        render_markdown(text, width)
    } else {
        render_plain(text, width)
    }
}

/// `Assistant` on the left, `model • timestamp` on the right
pub fn render_header(model: &str, timestamp: &str, width: usize, styled: bool) -> String {
    let left = "Assistant";
    let right = format!("{} • {}", model, timestamp);
    let pad = " ".repeat(width.saturating_sub(left.width() + right.width()).max(1));

    if !styled {
        return format!("{}{}{}", left, pad, right);
    }
    let bold = SpanStyle {
        bold: true,
        ..SpanStyle::default()
    };
    let dim = SpanStyle {
        dim: true,
        ..SpanStyle::default()
    };
    format!("{}{}{}", bold.paint(left), pad, dim.paint(&right))
}

/// Word-wrap plain text, keeping blank lines and leading indentation
pub fn render_plain(text: &str, width: usize) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let content = line.trim_start();
        if content.is_empty() {
            lines.push(String::new());
            continue;
        }
        let indent = &line[..line.len() - content.len()];
        let spans = [Span::Text(content.to_string(), SpanStyle::default())];
        lines.extend(wrap_spans(&spans, width, indent, indent));
    }
    lines.join("\n")
}

/// Render markdown as ANSI-styled lines
pub fn render_markdown(text: &str, width: usize) -> String {
    let mut renderer = Renderer::new(width);
    for event in Parser::new_ext(text, Options::ENABLE_STRIKETHROUGH) {
        renderer.handle(event);
    }
    renderer.finish()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SpanStyle {
    bold: bool,
    italic: bool,
    strike: bool,
    underline: bool,
    dim: bool,
    code: bool,
}

impl SpanStyle {
    fn paint(&self, text: &str) -> String {
        if *self == Self::default() {
            return text.to_string();
        }
        let mut style = ContentStyle::new();
        if self.bold {
            style.attributes.set(Attribute::Bold);
        }
        if self.italic {
            style.attributes.set(Attribute::Italic);
        }
        if self.strike {
            style.attributes.set(Attribute::CrossedOut);
        }
        if self.underline {
            style.attributes.set(Attribute::Underlined);
        }
        if self.dim {
            style.attributes.set(Attribute::Dim);
        }
        if self.code {
            style.foreground_color = Some(Color::Cyan);
        }
        StyledContent::new(style, text).to_string()
    }
}

#[derive(Debug, Clone)]
enum Span {
    Text(String, SpanStyle),
    Break,
}

/// Open container, popped on the matching end event
#[derive(Debug)]
enum Block {
    Paragraph,
    Heading,
    Quote,
    CodeBlock,
    List,
    Item,
    Emphasis,
    Strong,
    Strikethrough,
    Link { url: String, first_span: usize },
    Other,
}

struct Renderer {
    width: usize,
    lines: Vec<String>,
    spans: Vec<Span>,
    stack: Vec<Block>,
    /// Next number per open list, `None` for bullets
    lists: Vec<Option<u64>>,
    /// Marker width of each open list item
    markers: Vec<usize>,
    pending_marker: Option<String>,
    quote_depth: usize,
    strong: usize,
    emphasis: usize,
    strike: usize,
    heading: Option<HeadingLevel>,
    code: Option<String>,
}

impl Renderer {
    fn new(width: usize) -> Self {
        Self {
            width,
            lines: Vec::new(),
            spans: Vec::new(),
            stack: Vec::new(),
            lists: Vec::new(),
            markers: Vec::new(),
            pending_marker: None,
            quote_depth: 0,
            strong: 0,
            emphasis: 0,
            strike: 0,
            heading: None,
            code: None,
        }
    }

    fn style(&self) -> SpanStyle {
        SpanStyle {
            bold: self.strong > 0 || self.heading.is_some(),
            italic: self.emphasis > 0,
            strike: self.strike > 0,
            underline: self.heading == Some(HeadingLevel::H1),
            ..SpanStyle::default()
        }
    }

    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(_) => self.end(),
            Event::Text(text) => {
                if let Some(code) = self.code.as_mut() {
                    code.push_str(&text);
                } else {
                    let style = self.style();
                    self.push_text(&text, style);
                }
            }
            Event::Code(code) => {
                let style = SpanStyle {
                    code: true,
                    ..self.style()
                };
                self.push_text(&code, style);
            }
            Event::SoftBreak => {
                let style = self.style();
                self.push_text(" ", style);
            }
            Event::HardBreak => self.spans.push(Span::Break),
            Event::Rule => {
                self.flush();
                self.gap();
                let dim = SpanStyle {
                    dim: true,
                    ..SpanStyle::default()
                };
                self.lines
                    .push(dim.paint(&"─".repeat(self.width.min(RULE_WIDTH))));
            }
            Event::Html(html) | Event::InlineHtml(html) => {
                self.push_text(&html, SpanStyle::default());
            }
            Event::TaskListMarker(done) => {
                let marker = if done { "[x] " } else { "[ ] " };
                self.push_text(marker, SpanStyle::default());
            }
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        let block = match tag {
            Tag::Paragraph | Tag::HtmlBlock => {
                self.gap();
                Block::Paragraph
            }
            Tag::Heading { level, .. } => {
                self.flush();
                self.gap();
                self.heading = Some(level);
                Block::Heading
            }
            Tag::BlockQuote(_) => {
                self.flush();
                self.gap();
                self.quote_depth += 1;
                Block::Quote
            }
            Tag::CodeBlock(_) => {
                self.flush();
                self.gap();
                self.code = Some(String::new());
                Block::CodeBlock
            }
            Tag::List(start) => {
                self.flush();
                self.gap();
                self.lists.push(start);
                Block::List
            }
            Tag::Item => {
                self.flush();
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{}. ", n);
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                self.markers.push(marker.width());
                self.pending_marker = Some(marker);
                Block::Item
            }
            Tag::Emphasis => {
                self.emphasis += 1;
                Block::Emphasis
            }
            Tag::Strong => {
                self.strong += 1;
                Block::Strong
            }
            Tag::Strikethrough => {
                self.strike += 1;
                Block::Strikethrough
            }
            Tag::Link { dest_url, .. } => Block::Link {
                url: dest_url.to_string(),
                first_span: self.spans.len(),
            },
            _ => Block::Other,
        };
        self.stack.push(block);
    }

    fn end(&mut self) {
        let Some(block) = self.stack.pop() else {
            return;
        };
        match block {
            Block::Paragraph => self.flush(),
            Block::Heading => {
                self.flush();
                self.heading = None;
            }
            Block::Quote => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            Block::CodeBlock => {
                if let Some(code) = self.code.take() {
                    self.emit_code(&code);
                }
            }
            Block::List => {
                self.flush();
                self.lists.pop();
            }
            Block::Item => {
                self.flush();
                self.markers.pop();
                self.pending_marker = None;
            }
            Block::Emphasis => self.emphasis = self.emphasis.saturating_sub(1),
            Block::Strong => self.strong = self.strong.saturating_sub(1),
            Block::Strikethrough => self.strike = self.strike.saturating_sub(1),
            Block::Link { url, first_span } => {
                let label: String = self.spans[first_span.min(self.spans.len())..]
                    .iter()
                    .filter_map(|span| match span {
                        Span::Text(text, _) => Some(text.as_str()),
                        Span::Break => None,
                    })
                    .collect();
                if !url.is_empty() && label != url {
                    let dim = SpanStyle {
                        dim: true,
                        ..SpanStyle::default()
                    };
                    self.push_text(&format!(" ({})", url), dim);
                }
            }
            Block::Other => {}
        }
    }

    fn push_text(&mut self, text: &str, style: SpanStyle) {
        self.spans.push(Span::Text(text.to_string(), style));
    }

    /// Blank line between top-level blocks
    fn gap(&mut self) {
        if self.lists.is_empty() && self.lines.last().is_some_and(|line| !line.is_empty()) {
            self.lines.push(String::new());
        }
    }

    /// First-line and continuation prefixes for the current block
    fn prefixes(&mut self) -> (String, String) {
        let mut base = QUOTE_PREFIX.repeat(self.quote_depth);
        let outer: usize = self.markers.iter().rev().skip(1).sum();
        base.push_str(&" ".repeat(outer));
        let hang = format!(
            "{}{}",
            base,
            " ".repeat(self.markers.last().copied().unwrap_or(0))
        );
        match self.pending_marker.take() {
            Some(marker) => (format!("{}{}", base, marker), hang),
            None => (hang.clone(), hang),
        }
    }

    fn flush(&mut self) {
        if self.spans.is_empty() {
            return;
        }
        let spans = std::mem::take(&mut self.spans);
        let (first, rest) = self.prefixes();
        self.lines
            .extend(wrap_spans(&spans, self.width, &first, &rest));
    }

    fn emit_code(&mut self, code: &str) {
        let (_, prefix) = self.prefixes();
        let style = SpanStyle {
            code: true,
            ..SpanStyle::default()
        };
        for line in code.lines() {
            self.lines
                .push(format!("{}{}{}", prefix, CODE_INDENT, style.paint(line)));
        }
    }

    fn finish(mut self) -> String {
        self.flush();
        while self.lines.last().is_some_and(|line| line.is_empty()) {
            self.lines.pop();
        }
        self.lines.join("\n")
    }
}

fn wrap_spans(spans: &[Span], width: usize, first_prefix: &str, rest_prefix: &str) -> Vec<String> {
    let mut wrapper = LineWrapper::new(width, first_prefix, rest_prefix);
    for span in spans {
        match span {
            Span::Break => wrapper.break_line(),
            Span::Text(text, style) => {
                let mut word = String::new();
                for c in text.chars() {
                    if c.is_whitespace() {
                        wrapper.word(&word, *style);
                        word.clear();
                        wrapper.space();
                    } else {
                        word.push(c);
                    }
                }
                wrapper.word(&word, *style);
            }
        }
    }
    wrapper.finish()
}

/// Greedy word wrapper measuring display width, not bytes
struct LineWrapper<'a> {
    width: usize,
    first_prefix: &'a str,
    rest_prefix: &'a str,
    lines: Vec<String>,
    current: String,
    current_width: usize,
    pending_space: bool,
}

impl<'a> LineWrapper<'a> {
    fn new(width: usize, first_prefix: &'a str, rest_prefix: &'a str) -> Self {
        Self {
            width,
            first_prefix,
            rest_prefix,
            lines: Vec::new(),
            current: String::new(),
            current_width: 0,
            pending_space: false,
        }
    }

    fn prefix(&self) -> &'a str {
        if self.lines.is_empty() {
            self.first_prefix
        } else {
            self.rest_prefix
        }
    }

    fn available(&self) -> usize {
        self.width
            .saturating_sub(self.prefix().width())
            .max(MIN_CONTENT_WIDTH.min(self.width))
    }

    fn space(&mut self) {
        if self.current_width > 0 {
            self.pending_space = true;
        }
    }

    fn word(&mut self, word: &str, style: SpanStyle) {
        if word.is_empty() {
            return;
        }
        let word_width = word.width();
        let gap = usize::from(self.pending_space);
        if self.current_width > 0 && self.current_width + gap + word_width > self.available() {
            self.break_line();
        } else if self.pending_space {
            self.current.push(' ');
            self.current_width += 1;
        }
        self.pending_space = false;

        if word_width <= self.available() {
            self.current.push_str(&style.paint(word));
            self.current_width += word_width;
            return;
        }

        for piece in split_to_width(word, self.available()) {
            if self.current_width > 0 {
                self.break_line();
            }
            self.current.push_str(&style.paint(&piece));
            self.current_width += piece.width();
        }
    }

    fn break_line(&mut self) {
        let line = format!("{}{}", self.prefix(), self.current);
        self.lines.push(line);
        self.current.clear();
        self.current_width = 0;
        self.pending_space = false;
    }

    fn finish(mut self) -> Vec<String> {
        if self.current_width > 0 || self.lines.is_empty() {
            self.break_line();
        }
        self.lines
    }
}

/// Hard-split a single word that is wider than a line
fn split_to_width(text: &str, max_width: usize) -> Vec<String> {
    if max_width == 0 || text.width() <= max_width {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_width = 0;

    for c in text.chars() {
        let char_width = c.width().unwrap_or(1);

        if current_width + char_width > max_width && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_width = 0;
        }

        current.push(c);
        current_width += char_width;
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}
