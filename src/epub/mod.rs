//! EPUB writer. Collects ordered documents, a cover image, and table-of-contents entries,
//! then writes EPUB 2 or EPUB 3 (mimetype, container, OPF, NCX, nav, documents, image).

use chrono::{DateTime, Utc};
use std::io::{Seek, Write};
use std::path::Path;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// EPUB format version.
///
/// Default is EPUB 3 (OPF 3.0, nav.xhtml, HTML5 documents). Use `Epub2` for legacy readers
/// (OPF 2.0, NCX only, XHTML 1.1 documents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubVersion {
    #[default]
    Epub3,
    Epub2,
}

/// Errors from the EPUB writer.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: book title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: book has no documents.")]
    NoDocuments,

    #[error("Cannot write EPUB: document path {0} is used twice.")]
    DuplicatePath(String),

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Refinement type of an additional title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleType {
    /// Series the book belongs to.
    Collection,
    Extended,
    Subtitle,
}

impl TitleType {
    fn as_str(self) -> &'static str {
        match self {
            TitleType::Collection => "collection",
            TitleType::Extended => "extended",
            TitleType::Subtitle => "subtitle",
        }
    }
}

/// A title beyond the main one, e.g. the saga a volume belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraTitle {
    pub text: String,
    pub title_type: TitleType,
    pub group_position: Option<u32>,
}

/// Book-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub identifier: String,
    pub title: String,
    pub language: String,
    pub creator: Option<String>,
    pub extra_titles: Vec<ExtraTitle>,
    /// Written as `dcterms:modified` in EPUB 3 packages; the write time when unset.
    pub modified: Option<DateTime<Utc>>,
}

/// Navigation entry for a document. Depth 1 is top level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub label: String,
    pub depth: u32,
}

/// One spine document. `path` is relative to the package directory.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub content: String,
    pub toc: Option<TocEntry>,
    is_cover: bool,
}

#[derive(Debug, Clone)]
struct CoverImage {
    data: Vec<u8>,
    ext: String,
}

/// Assembles one EPUB. Documents are added in reading order.
#[derive(Debug, Clone)]
pub struct EpubBuilder {
    version: EpubVersion,
    metadata: Metadata,
    cover: Option<CoverImage>,
    documents: Vec<Document>,
    nav: bool,
}

impl EpubBuilder {
    pub fn new(version: EpubVersion) -> Self {
        Self {
            version,
            metadata: Metadata::default(),
            cover: None,
            documents: Vec::new(),
            nav: false,
        }
    }

    pub fn version(&self) -> EpubVersion {
        self.version
    }

    pub fn set_metadata(&mut self, metadata: Metadata) -> &mut Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Attach the cover image; `ext` is the file extension without a dot.
    pub fn set_cover_image(&mut self, data: Vec<u8>, ext: &str) -> &mut Self {
        self.cover = Some(CoverImage {
            data,
            ext: ext.trim_start_matches('.').to_ascii_lowercase(),
        });
        self
    }

    /// Package path of the cover image, if one is set.
    pub fn cover_image_path(&self) -> Option<String> {
        self.cover
            .as_ref()
            .map(|c| format!("img/cover_image.{}", c.ext))
    }

    /// Add the cover page. It goes in the spine like any document and is the guide's cover.
    pub fn add_cover_page(&mut self, path: &str, content: String) -> &mut Self {
        self.documents.push(Document {
            path: path.to_string(),
            content,
            toc: None,
            is_cover: true,
        });
        self
    }

    pub fn add_document(&mut self, path: &str, content: String, toc: Option<TocEntry>) -> &mut Self {
        self.documents.push(Document {
            path: path.to_string(),
            content,
            toc,
            is_cover: false,
        });
        self
    }

    /// Include an EPUB 3 navigation document. EPUB 2 carries its TOC in the NCX only.
    pub fn generate_nav(&mut self) -> &mut Self {
        self.nav = true;
        self
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Write the archive to `path`.
    pub fn write(&self, path: &Path) -> Result<(), EpubError> {
        self.validate()?;
        let file = std::fs::File::create(path).map_err(|e| EpubError::CreateFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.write_to(file)?;
        Ok(())
    }

    /// Write the archive to any seekable sink and hand it back.
    pub fn write_to<W: Write + Seek>(&self, sink: W) -> Result<W, EpubError> {
        self.validate()?;
        let mut zip = ZipWriter::new(sink);

        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        let options_deflate = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // Mimetype first, uncompressed (OCF container requirement)
        zip.start_file("mimetype", options_stored)?;
        zip.write_all(MIMETYPE)?;

        zip.start_file("META-INF/container.xml", options_deflate)?;
        zip.write_all(CONTAINER_XML)?;

        write_entry(&mut zip, "content.opf", self.opf().as_bytes(), options_deflate)?;
        write_entry(&mut zip, "toc.ncx", self.ncx().as_bytes(), options_deflate)?;
        if self.includes_nav() {
            write_entry(&mut zip, "nav.xhtml", self.nav_xhtml().as_bytes(), options_deflate)?;
        }
        for doc in &self.documents {
            write_entry(&mut zip, &doc.path, doc.content.as_bytes(), options_deflate)?;
        }
        if let (Some(cover), Some(path)) = (&self.cover, self.cover_image_path()) {
            write_entry(&mut zip, &path, &cover.data, options_deflate)?;
        }

        Ok(zip.finish()?)
    }

    fn validate(&self) -> Result<(), EpubError> {
        if self.metadata.title.trim().is_empty() {
            return Err(EpubError::EmptyTitle);
        }
        if self.documents.is_empty() {
            return Err(EpubError::NoDocuments);
        }
        let mut seen = std::collections::HashSet::new();
        for doc in &self.documents {
            if !seen.insert(doc.path.as_str()) {
                return Err(EpubError::DuplicatePath(doc.path.clone()));
            }
        }
        Ok(())
    }

    fn includes_nav(&self) -> bool {
        self.nav && self.version == EpubVersion::Epub3
    }

    fn opf(&self) -> String {
        let epub3 = self.version == EpubVersion::Epub3;
        let meta = &self.metadata;

        let mut metadata = format!(
            "    <dc:identifier id=\"book-id\">{}</dc:identifier>\n    <dc:title id=\"title-main\">{}</dc:title>\n    <dc:language>{}</dc:language>\n",
            xml_escape(&meta.identifier),
            xml_escape(&meta.title),
            xml_escape(&meta.language)
        );
        if epub3 {
            metadata.push_str(
                "    <meta refines=\"#title-main\" property=\"title-type\">main</meta>\n",
            );
            let modified = meta.modified.unwrap_or_else(Utc::now);
            metadata.push_str(&format!(
                "    <meta property=\"dcterms:modified\">{}</meta>\n",
                modified.format(MODIFIED_FORMAT)
            ));
        }
        if let Some(creator) = &meta.creator {
            metadata.push_str(&format!(
                "    <dc:creator>{}</dc:creator>\n",
                xml_escape(creator)
            ));
        }
        for (i, extra) in meta.extra_titles.iter().enumerate() {
            if epub3 {
                let id = format!("title-{}", i + 1);
                metadata.push_str(&format!(
                    "    <dc:title id=\"{id}\">{}</dc:title>\n    <meta refines=\"#{id}\" property=\"title-type\">{}</meta>\n",
                    xml_escape(&extra.text),
                    extra.title_type.as_str(),
                    id = id
                ));
                if let Some(pos) = extra.group_position {
                    metadata.push_str(&format!(
                        "    <meta refines=\"#{}\" property=\"group-position\">{}</meta>\n",
                        id, pos
                    ));
                }
            } else if extra.title_type == TitleType::Collection {
                // EPUB 2 has no title refinements; readers understand the calibre series pair.
                metadata.push_str(&format!(
                    "    <meta name=\"calibre:series\" content=\"{}\"/>\n",
                    xml_escape(&extra.text)
                ));
                if let Some(pos) = extra.group_position {
                    metadata.push_str(&format!(
                        "    <meta name=\"calibre:series_index\" content=\"{}\"/>\n",
                        pos
                    ));
                }
            }
        }
        if self.cover.is_some() {
            metadata.push_str("    <meta name=\"cover\" content=\"cover-image\"/>\n");
        }

        let mut manifest = String::from(
            "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
        );
        if self.includes_nav() {
            manifest.push_str(
                "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
            );
        }
        if let (Some(cover), Some(path)) = (&self.cover, self.cover_image_path()) {
            let properties = if epub3 { " properties=\"cover-image\"" } else { "" };
            manifest.push_str(&format!(
                "    <item id=\"cover-image\" href=\"{}\" media-type=\"{}\"{}/>\n",
                path,
                image_media_type(&cover.ext),
                properties
            ));
        }
        for (i, doc) in self.documents.iter().enumerate() {
            let properties = if epub3 && doc.content.contains("<svg") {
                " properties=\"svg\""
            } else {
                ""
            };
            manifest.push_str(&format!(
                "    <item id=\"doc-{}\" href=\"{}\" media-type=\"application/xhtml+xml\"{}/>\n",
                i + 1,
                xml_escape(&doc.path),
                properties
            ));
        }

        // Spine: documents in the order they were added. Nav is not in spine.
        let spine = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, _)| format!("    <itemref idref=\"doc-{}\"/>", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let guide = self
            .documents
            .iter()
            .find(|d| d.is_cover)
            .map(|d| {
                format!(
                    "    <reference type=\"cover\" href=\"{}\" title=\"Cover\"/>\n",
                    xml_escape(&d.path)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="{version}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}
  </spine>
  <guide>
{guide}  </guide>
</package>
"#,
            version = if epub3 { "3.0" } else { "2.0" },
            metadata = metadata,
            manifest = manifest,
            spine = spine,
            guide = guide
        )
    }

    fn toc_tree(&self) -> Vec<NavNode<'_>> {
        let mut roots = Vec::new();
        for doc in &self.documents {
            if let Some(entry) = &doc.toc {
                let node = NavNode {
                    label: &entry.label,
                    href: &doc.path,
                    children: Vec::new(),
                };
                insert_at_depth(&mut roots, node, entry.depth);
            }
        }
        roots
    }

    fn ncx(&self) -> String {
        let tree = self.toc_tree();
        let mut nav_points = String::new();
        let mut play_order = 0;
        write_nav_points(&tree, 2, &mut play_order, &mut nav_points);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{uid}"/>
    <meta name="dtb:depth" content="{depth}"/>
    <meta name="dtb:totalPageCount" content="0"/>
    <meta name="dtb:maxPageNumber" content="0"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#,
            uid = xml_escape(&self.metadata.identifier),
            depth = tree_depth(&tree).max(1),
            title = xml_escape(&self.metadata.title),
            nav_points = nav_points
        )
    }

    fn nav_xhtml(&self) -> String {
        let tree = self.toc_tree();
        let mut list = String::new();
        write_nav_list(&tree, 2, &mut list);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>Table of Contents</title>
</head>
<body>
  <nav epub:type="toc" id="toc">
    <h1>Contents</h1>
{list}  </nav>
</body>
</html>
"#,
            lang = xml_escape(&self.metadata.language),
            list = list
        )
    }
}

#[derive(Debug)]
struct NavNode<'a> {
    label: &'a str,
    href: &'a str,
    children: Vec<NavNode<'a>>,
}

/// Attach `node` under the most recent entry one level up. An entry deeper than anything
/// before it is attached as deep as possible.
fn insert_at_depth<'a>(nodes: &mut Vec<NavNode<'a>>, node: NavNode<'a>, depth: u32) {
    match nodes.last_mut() {
        Some(parent) if depth > 1 => insert_at_depth(&mut parent.children, node, depth - 1),
        _ => nodes.push(node),
    }
}

fn tree_depth(nodes: &[NavNode<'_>]) -> usize {
    nodes
        .iter()
        .map(|n| 1 + tree_depth(&n.children))
        .max()
        .unwrap_or(0)
}

fn write_nav_points(nodes: &[NavNode<'_>], indent: usize, play_order: &mut usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    for node in nodes {
        *play_order += 1;
        out.push_str(&format!(
            "{pad}<navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n{pad}  <navLabel><text>{label}</text></navLabel>\n{pad}  <content src=\"{href}\"/>\n",
            pad = pad,
            n = play_order,
            label = xml_escape(node.label),
            href = xml_escape(node.href)
        ));
        write_nav_points(&node.children, indent + 1, play_order, out);
        out.push_str(&format!("{}</navPoint>\n", pad));
    }
}

fn write_nav_list(nodes: &[NavNode<'_>], indent: usize, out: &mut String) {
    if nodes.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{}<ol>\n", pad));
    for node in nodes {
        out.push_str(&format!(
            "{}  <li><a href=\"{}\">{}</a>",
            pad,
            xml_escape(node.href),
            xml_escape(node.label)
        ));
        if node.children.is_empty() {
            out.push_str("</li>\n");
        } else {
            out.push('\n');
            write_nav_list(&node.children, indent + 2, out);
            out.push_str(&format!("{}  </li>\n", pad));
        }
    }
    out.push_str(&format!("{}</ol>\n", pad));
}

fn write_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    path: &str,
    data: &[u8],
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    zip.start_file(format!("{}{}", OEBPS_PREFIX, path), options)?;
    zip.write_all(data)?;
    Ok(())
}

/// Media type for an image file extension.
pub fn image_media_type(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
