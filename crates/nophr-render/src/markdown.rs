//! Markdown to protocol text conversion.
//!
//! Event content is parsed once into a flat block list; the plain and
//! gemtext renderers serialize that list under their own line-level
//! contracts (reference footnotes for plain text, `=>` link lines for
//! gemtext).

use pulldown_cmark::{CodeBlockKind, Event as MdEvent, HeadingLevel, Parser, Tag};

use crate::wrap_text;

/// Placeholder inserted where a link's footnote marker belongs.
const LINK_MARKER: char = '\u{1}';

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Heading(u8),
    Paragraph,
    Preformatted,
    ListItem { prefix: String },
    Quote,
    Rule,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    /// Text with [`LINK_MARKER`] placeholders where footnotes go.
    text: String,
    /// Link destinations, in marker order.
    links: Vec<String>,
}

/// What the parser is currently inside of; popped on every `End`.
enum Open {
    Block,
    Link(String),
    Image(String),
    Quote,
    List(Option<u64>),
    Inline,
}

fn heading_depth(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn parse_blocks(input: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut current: Option<Block> = None;
    let mut quote_depth = 0usize;
    let mut list_counters: Vec<Option<u64>> = Vec::new();

    let mut begin = |current: &mut Option<Block>, blocks: &mut Vec<Block>, kind: BlockKind| {
        if let Some(block) = current.take() {
            blocks.push(block);
        }
        *current = Some(Block {
            kind,
            text: String::new(),
            links: Vec::new(),
        });
    };

    let flush = |current: &mut Option<Block>, blocks: &mut Vec<Block>| {
        if let Some(block) = current.take() {
            blocks.push(block);
        }
    };

    for event in Parser::new(input) {
        match event {
            MdEvent::Start(tag) => match tag {
                Tag::Paragraph => {
                    let kind = if quote_depth > 0 {
                        BlockKind::Quote
                    } else {
                        BlockKind::Paragraph
                    };
                    begin(&mut current, &mut blocks, kind);
                    stack.push(Open::Block);
                }
                Tag::Heading { level, .. } => {
                    begin(
                        &mut current,
                        &mut blocks,
                        BlockKind::Heading(heading_depth(level)),
                    );
                    stack.push(Open::Block);
                }
                Tag::CodeBlock(kind) => {
                    let _lang = match kind {
                        CodeBlockKind::Fenced(lang) => Some(lang.to_string()),
                        CodeBlockKind::Indented => None,
                    };
                    begin(&mut current, &mut blocks, BlockKind::Preformatted);
                    stack.push(Open::Block);
                }
                Tag::BlockQuote(_) => {
                    quote_depth += 1;
                    stack.push(Open::Quote);
                }
                Tag::List(start) => {
                    list_counters.push(start);
                    stack.push(Open::List(start));
                }
                Tag::Item => {
                    let prefix = match list_counters.last_mut() {
                        Some(Some(counter)) => {
                            let prefix = format!("{counter}. ");
                            *counter += 1;
                            prefix
                        }
                        _ => "- ".to_owned(),
                    };
                    begin(&mut current, &mut blocks, BlockKind::ListItem { prefix });
                    stack.push(Open::Block);
                }
                Tag::Link { dest_url, .. } => {
                    stack.push(Open::Link(dest_url.to_string()));
                }
                Tag::Image { dest_url, .. } => {
                    stack.push(Open::Image(dest_url.to_string()));
                }
                _ => stack.push(Open::Inline),
            },
            MdEvent::End(_) => match stack.pop() {
                Some(Open::Block) => flush(&mut current, &mut blocks),
                Some(Open::Quote) => {
                    quote_depth = quote_depth.saturating_sub(1);
                }
                Some(Open::List(_)) => {
                    list_counters.pop();
                }
                Some(Open::Link(url)) => {
                    if let Some(block) = current.as_mut() {
                        block.text.push(LINK_MARKER);
                        block.links.push(url);
                    }
                }
                Some(Open::Image(url)) => {
                    if let Some(block) = current.as_mut() {
                        block.text.push(LINK_MARKER);
                        block.links.push(url);
                    }
                }
                _ => {}
            },
            MdEvent::Text(text) | MdEvent::Html(text) | MdEvent::InlineHtml(text) => {
                if let Some(block) = current.as_mut() {
                    block.text.push_str(&text);
                } else {
                    // Bare text outside any block (loose markdown).
                    current = Some(Block {
                        kind: BlockKind::Paragraph,
                        text: text.to_string(),
                        links: Vec::new(),
                    });
                }
            }
            MdEvent::Code(code) => {
                if let Some(block) = current.as_mut() {
                    block.text.push('`');
                    block.text.push_str(&code);
                    block.text.push('`');
                }
            }
            MdEvent::SoftBreak => {
                if let Some(block) = current.as_mut() {
                    match block.kind {
                        BlockKind::Preformatted => block.text.push('\n'),
                        _ => block.text.push(' '),
                    }
                }
            }
            MdEvent::HardBreak => {
                if let Some(block) = current.as_mut() {
                    block.text.push('\n');
                }
            }
            MdEvent::Rule => {
                flush(&mut current, &mut blocks);
                blocks.push(Block {
                    kind: BlockKind::Rule,
                    text: String::new(),
                    links: Vec::new(),
                });
            }
            _ => {}
        }
    }
    flush(&mut current, &mut blocks);
    blocks
}

/// Plain-text rendering output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainText {
    pub lines: Vec<String>,
    /// Footnoted link targets, 1-indexed in reading order.
    pub links: Vec<String>,
}

/// Markdown to plain text with reference-footnoted links.
pub fn to_plain(input: &str, width: usize) -> PlainText {
    let blocks = parse_blocks(input);
    let mut lines = Vec::new();
    let mut links = Vec::new();

    for block in blocks {
        let mut text = String::with_capacity(block.text.len());
        let mut block_links = block.links.iter();
        for c in block.text.chars() {
            if c == LINK_MARKER {
                if let Some(url) = block_links.next() {
                    links.push(url.clone());
                    text.push_str(&format!("[{}]", links.len()));
                }
            } else {
                text.push(c);
            }
        }

        if !lines.is_empty() {
            lines.push(String::new());
        }
        match block.kind {
            BlockKind::Heading(_) => {
                let text = text.trim().to_owned();
                let underline = "-".repeat(text.chars().count().min(40));
                lines.push(text);
                lines.push(underline);
            }
            BlockKind::Paragraph => lines.extend(wrap_text(&text, width)),
            BlockKind::Quote => {
                for line in wrap_text(&text, width.saturating_sub(2).min(width)) {
                    lines.push(format!("> {line}"));
                }
            }
            BlockKind::ListItem { prefix } => {
                let mut first = true;
                // The blank separator between list items reads poorly;
                // drop the one just pushed.
                if lines.last().is_some_and(String::is_empty) {
                    lines.pop();
                }
                for line in wrap_text(&text, width.saturating_sub(prefix.len())) {
                    if first {
                        lines.push(format!("{prefix}{line}"));
                        first = false;
                    } else {
                        lines.push(format!("{}{line}", " ".repeat(prefix.len())));
                    }
                }
            }
            BlockKind::Preformatted => {
                for line in text.trim_end_matches('\n').lines() {
                    lines.push(format!("  {line}"));
                }
            }
            BlockKind::Rule => lines.push("----".to_owned()),
        }
    }

    // Leading blank line can appear when content starts with a rule.
    while lines.first().is_some_and(String::is_empty) {
        lines.remove(0);
    }

    PlainText { lines, links }
}

/// Markdown to gemtext: `#` headings, `=>` link lines after their
/// block, fenced preformatted sections.
pub fn to_gemtext(input: &str) -> String {
    let blocks = parse_blocks(input);
    let mut out = String::new();

    for block in blocks {
        let text: String = block
            .text
            .chars()
            .filter(|c| *c != LINK_MARKER)
            .collect();

        if !out.is_empty() {
            out.push('\n');
        }
        match block.kind {
            BlockKind::Heading(level) => {
                let hashes = "#".repeat(usize::from(level.min(3)));
                out.push_str(&format!("{hashes} {}\n", text.trim()));
            }
            BlockKind::Paragraph => {
                out.push_str(text.trim_end());
                out.push('\n');
            }
            BlockKind::Quote => {
                for line in text.lines() {
                    out.push_str(&format!("> {line}\n"));
                }
            }
            BlockKind::ListItem { prefix } => {
                // Gemtext has one list form.
                if out.ends_with("\n\n") {
                    out.pop();
                }
                let body = if prefix == "- " {
                    text.trim_end().to_owned()
                } else {
                    format!("{prefix}{}", text.trim_end())
                };
                out.push_str(&format!("* {body}\n"));
            }
            BlockKind::Preformatted => {
                out.push_str("```\n");
                out.push_str(text.trim_end_matches('\n'));
                out.push_str("\n```\n");
            }
            BlockKind::Rule => out.push_str("---\n"),
        }
        for url in &block.links {
            out.push_str(&format!("=> {url}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_footnotes_links() {
        let plain = to_plain(
            "See [the docs](https://example.org/docs) and [more](https://example.org/more).",
            0,
        );
        assert_eq!(plain.links.len(), 2);
        let text = plain.lines.join("\n");
        assert!(text.contains("the docs[1]"));
        assert!(text.contains("more[2]"));
    }

    #[test]
    fn plain_headings_are_underlined() {
        let plain = to_plain("# Title\n\nBody text.", 0);
        assert_eq!(plain.lines[0], "Title");
        assert_eq!(plain.lines[1], "-----");
        assert!(plain.lines.contains(&"Body text.".to_owned()));
    }

    #[test]
    fn plain_wraps_to_width() {
        let plain = to_plain(
            "a paragraph that is quite long and certainly exceeds a narrow width limit",
            20,
        );
        assert!(plain.lines.iter().all(|line| line.chars().count() <= 20));
    }

    #[test]
    fn gemtext_links_on_their_own_lines() {
        let gemtext = to_gemtext("Read [the docs](gemini://example.org/docs) today.");
        let lines: Vec<&str> = gemtext.lines().collect();
        assert!(lines.contains(&"Read the docs today."));
        assert!(lines.contains(&"=> gemini://example.org/docs"));
    }

    #[test]
    fn gemtext_headings_and_pre() {
        let gemtext = to_gemtext("## Section\n\n```\ncode here\n```\n");
        assert!(gemtext.contains("## Section\n"));
        assert!(gemtext.contains("```\ncode here\n```\n"));
    }

    #[test]
    fn lists_render_in_both_forms() {
        let plain = to_plain("- one\n- two\n", 0);
        assert!(plain.lines.contains(&"- one".to_owned()));
        assert!(plain.lines.contains(&"- two".to_owned()));

        let gemtext = to_gemtext("1. first\n2. second\n");
        assert!(gemtext.contains("* 1. first"));
        assert!(gemtext.contains("* 2. second"));
    }

    #[test]
    fn quotes_carry_their_marker() {
        let plain = to_plain("> quoted words\n", 0);
        assert!(plain.lines.iter().any(|line| line.starts_with("> ")));
        let gemtext = to_gemtext("> quoted words\n");
        assert!(gemtext.lines().any(|line| line.starts_with("> ")));
    }

    #[test]
    fn plain_text_of_plain_content_is_identity() {
        let plain = to_plain("just words, no markup", 0);
        assert_eq!(plain.lines, vec!["just words, no markup".to_owned()]);
        assert!(plain.links.is_empty());
    }
}
