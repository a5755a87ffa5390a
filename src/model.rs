//! Document model for a bound serial: chapters grouped into arcs, arcs sliced into volumes.
//!
//! Chapter and arc order is fixed when the table of contents is flattened and is never
//! changed afterwards; it is the reading order of every packaged volume.

use crate::epub::EpubVersion;
use serde::Serialize;
use std::ops::RangeInclusive;

/// One chapter link from the table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterDescriptor {
    pub label: String,
    pub url: String,
}

/// One arc heading from the flattened table of contents, with its chapter links in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArcDescriptor {
    pub label: String,
    pub chapters: Vec<ChapterDescriptor>,
}

/// Where a chapter is in the fetch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    /// At least one attempt failed and the fetch has been re-issued.
    Retrying,
    Done,
}

/// Hands out book-wide chapter numbers, starting at 1.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: u32,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&mut self) -> u32 {
        let idx = self.next;
        self.next += 1;
        idx
    }
}

/// A single chapter of the book.
#[derive(Debug, Clone)]
pub struct Chapter {
    /// 1-based position across the whole book, assigned before any fetch starts.
    pub index: u32,
    /// Label from the table of contents (e.g. "1.01").
    pub short_label: String,
    pub url: String,
    /// Heading of the fetched page. Empty until the chapter is done.
    pub title: String,
    /// Sanitized XHTML fragment (paragraphs and rules only).
    pub content: String,
    pub state: FetchState,
}

impl Chapter {
    pub fn new(index: u32, descriptor: ChapterDescriptor) -> Self {
        Self {
            index,
            short_label: descriptor.label,
            url: descriptor.url,
            title: String::new(),
            content: String::new(),
            state: FetchState::Pending,
        }
    }

    /// Record a failed attempt. A finished chapter stays finished.
    pub fn mark_retrying(&mut self) {
        if self.state != FetchState::Done {
            self.state = FetchState::Retrying;
        }
    }

    /// Attach the sanitized page and mark the chapter done.
    pub fn complete(&mut self, title: String, content: String) {
        self.title = title;
        self.content = content;
        self.state = FetchState::Done;
    }

    pub fn is_done(&self) -> bool {
        self.state == FetchState::Done
    }

    /// Path of this chapter's document inside the package.
    pub fn document_path(&self) -> String {
        format!("text/chapter{}.xhtml", self.index)
    }

    /// Standalone XHTML document for this chapter.
    pub fn render(&self, version: EpubVersion) -> String {
        let body = format!(
            "      <h1 style=\"text-align:center\">{}</h1>\n      {}",
            escape_text(&self.title),
            self.content
        );
        render_document(&format!("c{}", self.index), "chapter", &body, version)
    }
}

/// A named run of consecutive chapters, rendered as its own divider page.
#[derive(Debug, Clone)]
pub struct StoryArc {
    /// Arc number from the heading; 31 for the epilogue.
    pub index: u32,
    pub name: String,
    /// Table-of-contents order. This is spine order.
    pub chapters: Vec<Chapter>,
}

impl StoryArc {
    pub fn document_path(&self) -> String {
        format!("text/part{}.xhtml", self.index)
    }

    /// Navigation label used for the arc's top-level TOC entry.
    pub fn toc_label(&self) -> String {
        format!("Arc {}: {}", self.index, self.name)
    }

    /// Divider page with the arc name as a centered heading.
    pub fn render(&self, version: EpubVersion) -> String {
        let body = format!(
            "      <h1 style=\"text-align:center\">{}</h1>",
            escape_text(&self.name)
        );
        render_document(&format!("p{}", self.index), "part", &body, version)
    }
}

/// One packaged archive covering a contiguous range of arcs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    /// 1-based position in the saga; 0 for the single combined volume.
    pub number: u32,
    /// Indices into the book's arc sequence.
    pub arcs: RangeInclusive<usize>,
    pub cover_url: String,
}

/// Total chapters across all arcs.
pub fn chapter_count(arcs: &[StoryArc]) -> usize {
    arcs.iter().map(|a| a.chapters.len()).sum()
}

const DOCTYPE_XHTML11: &str = r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.1//EN" "http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd">"#;
const DOCTYPE_HTML5: &str = "<!DOCTYPE html>";

pub(crate) fn doctype(version: EpubVersion) -> &'static str {
    match version {
        EpubVersion::Epub2 => DOCTYPE_XHTML11,
        EpubVersion::Epub3 => DOCTYPE_HTML5,
    }
}

/// Wraps `body` in a full XHTML document. EPUB 2 forbids `<section>`, so the
/// sectioning wrapper is only emitted for EPUB 3.
fn render_document(head_title: &str, section_type: &str, body: &str, version: EpubVersion) -> String {
    let (open, close) = match version {
        EpubVersion::Epub3 => (
            format!("    <section epub:type=\"{}\">\n", section_type),
            "    </section>\n".to_string(),
        ),
        EpubVersion::Epub2 => (String::new(), String::new()),
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
{doctype}
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="en">
  <head><title>{head_title}</title></head>
  <body>
{open}{body}
{close}  </body>
</html>
"#,
        doctype = doctype(version),
        head_title = head_title,
        open = open,
        body = body,
        close = close,
    )
}

pub(crate) fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
