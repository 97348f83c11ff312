//! Rendering of a reply into HTML and the frame throttle that paces it.

use crate::client::consumer::{StreamStatus, ViewState};
use std::time::Duration;
use tokio::time::Instant;

/// Everything a view needs to draw one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedView {
    pub html: String,
    pub streaming: bool,
    pub error: Option<String>,
}

/// Renders the state. Pure: equal states render to equal views.
pub fn render(state: &ViewState) -> RenderedView {
    RenderedView {
        html: render_text(&state.text),
        streaming: state.status.is_streaming(),
        error: match &state.status {
            StreamStatus::Failed(message) => Some(message.clone()),
            _ => None,
        },
    }
}

enum Block<'a> {
    Paragraph(Vec<&'a str>),
    Code {
        language: &'a str,
        lines: Vec<&'a str>,
        closed: bool,
    },
}

fn blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if let Some(fence) = line.trim_start().strip_prefix("```") {
            if !paragraph.is_empty() {
                blocks.push(Block::Paragraph(std::mem::take(&mut paragraph)));
            }

            let mut code = Vec::new();
            let mut closed = false;
            for line in lines.by_ref() {
                if line.trim() == "```" {
                    closed = true;
                    break;
                }
                code.push(line);
            }

            blocks.push(Block::Code {
                language: fence.trim(),
                lines: code,
                closed,
            });
        } else if line.trim().is_empty() {
            if !paragraph.is_empty() {
                blocks.push(Block::Paragraph(std::mem::take(&mut paragraph)));
            }
        } else {
            paragraph.push(line);
        }
    }

    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph(paragraph));
    }

    blocks
}

fn render_text(text: &str) -> String {
    let mut html = String::with_capacity(text.len() + 32);

    for block in blocks(text) {
        match block {
            Block::Paragraph(lines) => {
                html.push_str("<p>");
                for (i, line) in lines.iter().enumerate() {
                    if i > 0 {
                        html.push_str("<br>");
                    }
                    push_inline(&mut html, line);
                }
                html.push_str("</p>");
            }
            Block::Code {
                language,
                lines,
                closed,
            } => {
                html.push_str(if closed { "<pre>" } else { "<pre class=\"open\">" });
                if language.is_empty() {
                    html.push_str("<code>");
                } else {
                    html.push_str("<code class=\"language-");
                    push_escaped(&mut html, language);
                    html.push_str("\">");
                }
                push_escaped(&mut html, &lines.join("\n"));
                html.push_str("</code></pre>");
            }
        }
    }

    html
}

/// Inline code spans and `**bold**`. Unbalanced markers are kept as text.
fn push_inline(html: &mut String, line: &str) {
    let mut rest = line;

    while !rest.is_empty() {
        let code = rest.find('`');
        let bold = rest.find("**");

        let (start, marker, tag) = match (code, bold) {
            (Some(c), Some(b)) if b < c => (b, "**", "strong"),
            (Some(c), _) => (c, "`", "code"),
            (None, Some(b)) => (b, "**", "strong"),
            (None, None) => break,
        };

        let after = &rest[start + marker.len()..];
        let Some(end) = after.find(marker).filter(|end| *end > 0) else {
            push_escaped(html, &rest[..start + marker.len()]);
            rest = after;
            continue;
        };

        push_escaped(html, &rest[..start]);
        html.push('<');
        html.push_str(tag);
        html.push('>');
        push_escaped(html, &after[..end]);
        html.push_str("</");
        html.push_str(tag);
        html.push('>');
        rest = &after[end + marker.len()..];
    }

    push_escaped(html, rest);
}

fn push_escaped(html: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => html.push_str("&amp;"),
            '<' => html.push_str("&lt;"),
            '>' => html.push_str("&gt;"),
            '"' => html.push_str("&quot;"),
            '\'' => html.push_str("&#39;"),
            c => html.push(c),
        }
    }
}

/// About one display refresh.
pub const FRAME: Duration = Duration::from_millis(16);

/// Allows at most one render per frame. Requests inside a frame are
/// coalesced into one render at the frame's end.
#[derive(Debug)]
pub struct FrameThrottle {
    interval: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl FrameThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            pending: false,
        }
    }

    /// Asks for a render at `now`. Returns `true` when it may happen right
    /// away; otherwise the request is remembered until [`Self::deadline`].
    pub fn request(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = true;
                false
            }
            _ => {
                self.rendered(now);
                true
            }
        }
    }

    /// When the remembered request is due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match self.last {
            Some(last) if self.pending => Some(last + self.interval),
            _ => None,
        }
    }

    pub fn rendered(&mut self, now: Instant) {
        self.last = Some(now);
        self.pending = false;
    }
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(FRAME)
    }
}
