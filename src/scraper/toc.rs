//! Table of contents: nested `ul`/`li`/`a` markup to a generic tree, then to ordered arcs.
//!
//! The site groups arcs under "Stories (Arcs ...)" superheadings, with the epilogue as the
//! last top-level entry:
//!
//! ```text
//! Stories (Arcs 1-10)
//!   Arc 1 (Gestation)
//!     1.01 -> https://...
//! ...
//! Epilogue (Teneral e.1)
//!   e.1 -> https://...
//! ```

use crate::model::{ArcDescriptor, Chapter, ChapterDescriptor, SequenceGenerator, StoryArc};
use crate::scraper::error::ScraperError;
use crate::scraper::parse_selector;
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::LazyLock;

/// Selector for the category list on the serial's front page.
pub const TOC_SELECTOR: &str = "#categories-2 ul";

/// Arc number given to a trailing group whose heading carries no number.
pub const EPILOGUE_ARC_INDEX: u32 = 31;

const SOFT_HYPHEN: char = '\u{00AD}';

const NUMBERED_ARC_PATTERN: &str = r"([0-9]+)\s*\(([^)]*)\)";
const UNNUMBERED_ARC_PATTERN: &str = r"\(([^)]*)\)";

static NUMBERED_ARC: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(NUMBERED_ARC_PATTERN));
static UNNUMBERED_ARC: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(UNNUMBERED_ARC_PATTERN));

/// Compiled pattern, or an error naming it (avoids panics inside the lazy static).
fn compiled<'a>(
    re: &'a LazyLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'a Regex, ScraperError> {
    (**re).as_ref().map_err(|e| ScraperError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Parsed table-of-contents node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocNode {
    Leaf { label: String, url: String },
    /// Never empty. Unlabeled groups (bare nested lists) have an empty label.
    Group { label: String, children: Vec<TocNode> },
}

impl TocNode {
    pub fn label(&self) -> &str {
        match self {
            TocNode::Leaf { label, .. } | TocNode::Group { label, .. } => label,
        }
    }

    /// Number of chapter links under this node.
    pub fn leaf_count(&self) -> usize {
        match self {
            TocNode::Leaf { .. } => 1,
            TocNode::Group { children, .. } => children.iter().map(TocNode::leaf_count).sum(),
        }
    }
}

/// Find the category list on a front page and parse it.
pub fn parse_toc_page(html: &str) -> Result<Vec<TocNode>, ScraperError> {
    let doc = Html::parse_document(html);
    let sel = parse_selector(TOC_SELECTOR)?;
    let root = doc
        .select(&sel)
        .next()
        .ok_or_else(|| ScraperError::TocParse {
            node: TOC_SELECTOR.to_string(),
            reason: "no table of contents list on page".to_string(),
        })?;
    parse_list(root)
}

/// Map a list element's items, in document order.
pub fn parse_list(list: ElementRef<'_>) -> Result<Vec<TocNode>, ScraperError> {
    let name = list.value().name();
    if name != "ul" && name != "ol" {
        return Err(malformed(list, "expected a list"));
    }
    let children = significant_children(list);
    if children.is_empty() {
        return Err(malformed(list, "empty list"));
    }
    children
        .into_iter()
        .map(|child| match child {
            Child::Element(el) => map_node(el),
            Child::Text(_) => Err(malformed(list, "stray text inside list")),
        })
        .collect()
}

fn map_node(el: ElementRef<'_>) -> Result<TocNode, ScraperError> {
    match el.value().name() {
        "ul" | "ol" => Ok(TocNode::Group {
            label: String::new(),
            children: parse_list(el)?,
        }),
        "li" => {
            let kids = significant_children(el);
            match kids.as_slice() {
                [Child::Element(only)] => map_node(*only),
                [first, Child::Element(list)] => Ok(TocNode::Group {
                    label: clean_label(&first.text()),
                    children: parse_list(*list)?,
                }),
                _ => Err(malformed(
                    el,
                    &format!("list item has {} children", kids.len()),
                )),
            }
        }
        "a" => {
            let url = el
                .value()
                .attr("href")
                .ok_or_else(|| malformed(el, "link has no href"))?;
            Ok(TocNode::Leaf {
                label: el.text().collect::<String>().trim().to_string(),
                url: url.trim().to_string(),
            })
        }
        _ => Err(malformed(el, "unexpected element")),
    }
}

#[derive(Clone, Copy)]
enum Child<'a> {
    Element(ElementRef<'a>),
    Text(&'a str),
}

impl Child<'_> {
    fn text(&self) -> String {
        match self {
            Child::Element(el) => el.text().collect(),
            Child::Text(t) => t.to_string(),
        }
    }
}

/// Element children plus non-blank text; whitespace and comments are ignored.
fn significant_children(el: ElementRef<'_>) -> Vec<Child<'_>> {
    el.children()
        .filter_map(|node| match node.value() {
            Node::Element(_) => ElementRef::wrap(node).map(Child::Element),
            Node::Text(t) if !t.trim().is_empty() => Some(Child::Text(&t[..])),
            _ => None,
        })
        .collect()
}

fn clean_label(s: &str) -> String {
    s.replace(SOFT_HYPHEN, "").trim().to_string()
}

fn malformed(el: ElementRef<'_>, reason: &str) -> ScraperError {
    let text: String = el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
    let snippet: String = text.chars().take(40).collect();
    ScraperError::TocParse {
        node: format!("<{}> {:?}", el.value().name(), snippet),
        reason: reason.to_string(),
    }
}

/// Drop the superheading level and return one descriptor per arc.
///
/// Every top-level group except the last is unwrapped, promoting its child arcs; the last
/// group is the epilogue and is kept as an arc of its own.
pub fn flatten(mut root: Vec<TocNode>) -> Result<Vec<ArcDescriptor>, ScraperError> {
    let epilogue = root.pop().ok_or_else(|| ScraperError::TocParse {
        node: "root".to_string(),
        reason: "table of contents is empty".to_string(),
    })?;
    let mut arcs = Vec::new();
    for grouping in root {
        match grouping {
            TocNode::Group { children, .. } => arcs.extend(children),
            TocNode::Leaf { label, .. } => {
                return Err(ScraperError::TocParse {
                    node: label,
                    reason: "expected a group of arcs, found a chapter link".to_string(),
                })
            }
        }
    }
    arcs.push(epilogue);
    arcs.into_iter().map(arc_descriptor).collect()
}

fn arc_descriptor(node: TocNode) -> Result<ArcDescriptor, ScraperError> {
    let (label, children) = match node {
        TocNode::Group { label, children } => (label, children),
        TocNode::Leaf { label, .. } => {
            return Err(ScraperError::TocParse {
                node: label,
                reason: "expected an arc, found a chapter link".to_string(),
            })
        }
    };
    let chapters = children
        .into_iter()
        .map(|child| match child {
            TocNode::Leaf { label, url } => Ok(ChapterDescriptor { label, url }),
            TocNode::Group { label: inner, .. } => Err(ScraperError::TocParse {
                node: inner,
                reason: format!("arc {:?} contains a nested group", label),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ArcDescriptor { label, chapters })
}

/// Split an arc heading into its number and name.
///
/// `"Arc 21 (Imago)"` gives `(21, "Imago")`; a heading with only a parenthetical,
/// such as `"(Epilogue)"`, gives [`EPILOGUE_ARC_INDEX`].
pub fn parse_arc_label(label: &str) -> Result<(u32, String), ScraperError> {
    if let Some(caps) = compiled(&NUMBERED_ARC, NUMBERED_ARC_PATTERN)?.captures(label) {
        let index = caps[1].parse::<u32>().map_err(|_| ScraperError::ArcLabel {
            label: label.to_string(),
        })?;
        return Ok((index, caps[2].to_string()));
    }
    if let Some(caps) = compiled(&UNNUMBERED_ARC, UNNUMBERED_ARC_PATTERN)?.captures(label) {
        return Ok((EPILOGUE_ARC_INDEX, caps[1].to_string()));
    }
    Err(ScraperError::ArcLabel {
        label: label.to_string(),
    })
}

/// Build the book's arcs, numbering chapters 1..=N in table-of-contents order.
pub fn build_arcs(descriptors: Vec<ArcDescriptor>) -> Result<Vec<StoryArc>, ScraperError> {
    let mut seq = SequenceGenerator::new();
    descriptors
        .into_iter()
        .map(|desc| {
            let (index, name) = parse_arc_label(&desc.label)?;
            let chapters = desc
                .chapters
                .into_iter()
                .map(|d| Chapter::new(seq.next_index(), d))
                .collect();
            Ok(StoryArc {
                index,
                name,
                chapters,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::chapter_count;

    const PAGE: &str = r#"<html><body>
<div id="categories-2"><ul>
  <li><a href="/stories-arcs-1-10/">Stories (Arcs 1-10)</a>
    <ul>
      <li><a href="/arc-1/">Arc 1 (Gesta&shy;tion)</a>
        <ul>
          <li><a href="https://example.com/1-01/">1.01</a></li>
          <li><a href="https://example.com/1-02/">1.02</a></li>
        </ul>
      </li>
      <li><a href="/arc-2/">Arc 2 (Insinuation)</a>
        <ul>
          <li><a href="https://example.com/2-01/"> 2.01 </a></li>
        </ul>
      </li>
    </ul>
  </li>
  <li><a href="/stories-arcs-21/">Stories (Arcs 21+)</a>
    <ul>
      <li><a href="/arc-21/">Arc 21 (Imago)</a>
        <ul>
          <li><a href="https://example.com/21-01/">21.01</a></li>
        </ul>
      </li>
    </ul>
  </li>
  <li><a href="/epilogue/">(Epilogue)</a>
    <ul>
      <li><a href="https://example.com/e-1/">e.1</a></li>
      <li><a href="https://example.com/e-2/">e.2</a></li>
    </ul>
  </li>
</ul></div>
</body></html>"#;

    #[test]
    fn parses_nested_lists_in_document_order() -> Result<(), ScraperError> {
        let toc = parse_toc_page(PAGE)?;
        assert_eq!(toc.len(), 3);
        assert_eq!(toc[0].label(), "Stories (Arcs 1-10)");
        match &toc[0] {
            TocNode::Group { children, .. } => {
                assert_eq!(children[0].label(), "Arc 1 (Gestation)");
                assert_eq!(children[1].label(), "Arc 2 (Insinuation)");
            }
            other => panic!("expected group, got {:?}", other),
        }
        assert_eq!(toc.iter().map(TocNode::leaf_count).sum::<usize>(), 6);
        Ok(())
    }

    #[test]
    fn flatten_promotes_arcs_and_keeps_epilogue_last() -> Result<(), ScraperError> {
        let arcs = flatten(parse_toc_page(PAGE)?)?;
        let labels: Vec<&str> = arcs.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Arc 1 (Gestation)",
                "Arc 2 (Insinuation)",
                "Arc 21 (Imago)",
                "(Epilogue)"
            ]
        );
        assert_eq!(arcs[1].chapters[0].label, "2.01");
        assert_eq!(arcs[1].chapters[0].url, "https://example.com/2-01/");
        Ok(())
    }

    #[test]
    fn chapter_count_and_order_match_links() -> Result<(), ScraperError> {
        let arcs = build_arcs(flatten(parse_toc_page(PAGE)?)?)?;
        assert_eq!(chapter_count(&arcs), 6);
        let labels: Vec<&str> = arcs
            .iter()
            .flat_map(|a| a.chapters.iter().map(|c| c.short_label.as_str()))
            .collect();
        assert_eq!(labels, ["1.01", "1.02", "2.01", "21.01", "e.1", "e.2"]);
        Ok(())
    }

    #[test]
    fn sequence_indices_are_contiguous_from_one() -> Result<(), ScraperError> {
        let arcs = build_arcs(flatten(parse_toc_page(PAGE)?)?)?;
        let indices: Vec<u32> = arcs
            .iter()
            .flat_map(|a| a.chapters.iter().map(|c| c.index))
            .collect();
        assert_eq!(indices, (1..=6).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn arc_label_numbered() -> Result<(), ScraperError> {
        assert_eq!(parse_arc_label("Arc 21 (Imago)")?, (21, "Imago".to_string()));
        assert_eq!(parse_arc_label("Arc 1 (Gestation)")?, (1, "Gestation".to_string()));
        Ok(())
    }

    #[test]
    fn arc_label_epilogue() -> Result<(), ScraperError> {
        assert_eq!(
            parse_arc_label("(Epilogue)")?,
            (EPILOGUE_ARC_INDEX, "Epilogue".to_string())
        );
        Ok(())
    }

    #[test]
    fn arc_label_without_parenthetical_fails() {
        assert!(matches!(
            parse_arc_label("Arc Foo"),
            Err(ScraperError::ArcLabel { label }) if label == "Arc Foo"
        ));
    }

    #[test]
    fn broken_pattern_is_error_not_panic() {
        static BROKEN: LazyLock<Result<Regex, regex::Error>> =
            LazyLock::new(|| Regex::new("(unclosed"));
        assert!(matches!(
            compiled(&BROKEN, "(unclosed"),
            Err(ScraperError::Pattern { pattern, .. }) if pattern == "(unclosed"
        ));
        assert!(compiled(&NUMBERED_ARC, NUMBERED_ARC_PATTERN).is_ok());
        assert!(compiled(&UNNUMBERED_ARC, UNNUMBERED_ARC_PATTERN).is_ok());
    }

    #[test]
    fn bad_arc_label_aborts_build() -> Result<(), ScraperError> {
        let descs = vec![ArcDescriptor {
            label: "Interlude".to_string(),
            chapters: vec![],
        }];
        assert!(matches!(build_arcs(descs), Err(ScraperError::ArcLabel { .. })));
        Ok(())
    }

    #[test]
    fn list_item_with_three_children_is_malformed() {
        let html = r#"<div id="categories-2"><ul>
            <li><a href="/a">A</a><a href="/b">B</a><ul><li><a href="/c">C</a></li></ul></li>
        </ul></div>"#;
        match parse_toc_page(html) {
            Err(ScraperError::TocParse { node, reason }) => {
                assert!(node.starts_with("<li>"));
                assert!(reason.contains("3 children"));
            }
            other => panic!("expected TocParse, got {:?}", other),
        }
    }

    #[test]
    fn missing_list_is_parse_error() {
        assert!(matches!(
            parse_toc_page("<html><body><p>nothing</p></body></html>"),
            Err(ScraperError::TocParse { .. })
        ));
    }

    #[test]
    fn flatten_rejects_chapter_link_at_top_level() {
        let root = vec![
            TocNode::Leaf {
                label: "1.01".into(),
                url: "u".into(),
            },
            TocNode::Group {
                label: "(Epilogue)".into(),
                children: vec![TocNode::Leaf {
                    label: "e.1".into(),
                    url: "u".into(),
                }],
            },
        ];
        assert!(matches!(flatten(root), Err(ScraperError::TocParse { .. })));
    }

    #[test]
    fn flatten_empty_is_error() {
        assert!(flatten(Vec::new()).is_err());
    }
}
