//! Chapter page cleanup: keeps the entry title and the paragraphs and scene breaks of the
//! entry body, serialized as an XHTML fragment that embeds cleanly in a chapter document.

use crate::model::escape_text;
use crate::scraper::error::ScraperError;
use crate::scraper::parse_selector;
use scraper::{ElementRef, Html, Node};

const TITLE_SELECTOR: &str = "h1.entry-title";
const CONTENT_SELECTOR: &str = "div.entry-content";

/// Anchor texts of the previous/next links the site puts around every chapter.
const NAV_LINK_TEXTS: [&str; 2] = ["Last Chapter", "Next Chapter"];

/// The site's scene-break paragraph.
const SCENE_BREAK: &str = "\u{25A0}";

/// Template artifacts stripped from every element.
const STRIPPED_ATTRIBUTES: [&str; 3] = ["align", "draggable", "id"];

const VOID_ELEMENTS: [&str; 6] = ["br", "hr", "wbr", "col", "source", "track"];

/// Title and cleaned body of one chapter page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedChapter {
    pub title: String,
    /// `<p>` and `<hr/>` elements in document order, one per line.
    pub content: String,
}

/// Clean a raw chapter page. Pure: the same bytes always give the same output.
pub fn sanitize(bytes: &[u8]) -> Result<SanitizedChapter, ScraperError> {
    let html = String::from_utf8_lossy(bytes);
    let doc = Html::parse_document(&html);

    let title_sel = parse_selector(TITLE_SELECTOR)?;
    let title = doc
        .select(&title_sel)
        .next()
        .map(|h| h.text().collect::<String>().trim().to_string())
        .ok_or(ScraperError::MissingTitle)?;

    let content_sel = parse_selector(CONTENT_SELECTOR)?;
    let container = doc
        .select(&content_sel)
        .next()
        .ok_or(ScraperError::MissingContent)?;

    let mut blocks = Vec::new();
    collect_blocks(container, &mut blocks);
    Ok(SanitizedChapter {
        title,
        content: blocks.join("\n"),
    })
}

/// Walk the container and keep paragraphs and rules. Nested `div`s are layout and are
/// dropped with everything inside them; other wrappers are looked through.
fn collect_blocks(el: ElementRef<'_>, out: &mut Vec<String>) {
    for child in el.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "div" => {}
            "p" => {
                if let Some(block) = clean_paragraph(child) {
                    out.push(block);
                }
            }
            "hr" => out.push("<hr/>".to_string()),
            _ => collect_blocks(child, out),
        }
    }
}

fn clean_paragraph(p: ElementRef<'_>) -> Option<String> {
    if is_nav_paragraph(p) {
        return None;
    }
    if visible_text(p).trim() == SCENE_BREAK {
        return Some("<hr/>".to_string());
    }
    let mut out = String::new();
    write_element(p, &mut out);
    Some(out)
}

fn is_nav_paragraph(p: ElementRef<'_>) -> bool {
    p.descendants().filter_map(ElementRef::wrap).any(|el| {
        el.value().name() == "a" && {
            let text = el.text().collect::<String>();
            NAV_LINK_TEXTS.contains(&text.trim())
        }
    })
}

/// Text as it will read after images become their alt text.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut s = String::new();
    for node in el.descendants() {
        match node.value() {
            Node::Text(t) => s.push_str(t),
            Node::Element(e) if e.name() == "img" => s.push_str(e.attr("alt").unwrap_or("")),
            _ => {}
        }
    }
    s
}

fn write_element(el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name();
    out.push('<');
    out.push_str(name);

    // Sorted so output does not depend on attribute map iteration order.
    let mut attrs: Vec<(&str, &str)> = el
        .value()
        .attrs()
        .filter(|(k, _)| !STRIPPED_ATTRIBUTES.contains(k))
        .collect();
    attrs.sort_unstable();
    for (k, v) in attrs {
        out.push_str(&format!(" {}=\"{}\"", k, escape_attr(v)));
    }

    if VOID_ELEMENTS.contains(&name) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(&escape_text(t)),
            Node::Element(e) if e.name() == "img" => {
                out.push_str(&escape_text(e.attr("alt").unwrap_or("")))
            }
            Node::Element(e) if e.name() == "div" => {}
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    write_element(child_el, out);
                }
            }
            _ => {}
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}
