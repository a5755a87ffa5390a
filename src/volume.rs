//! Binding: slice the arcs into volumes and package each volume as an EPUB.

use chrono::{DateTime, Utc};
use crate::epub::{EpubBuilder, EpubError, EpubVersion, ExtraTitle, Metadata, TitleType, TocEntry};
use crate::model::{doctype, StoryArc, Volume};
use crate::scraper::{ScraperError, Transport};
use reqwest::Url;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const BOOK_TITLE: &str = "Worm";
pub const AUTHOR: &str = "J.C. McCrae";
pub const LANGUAGE: &str = "en";
const IDENTIFIER_BASE: &str = "https://parahumans.wordpress.com/";
const SAGA_TITLE: &str = "Parahumans Saga";
const SINGLE_SAGA_TITLE: &str = "The Parahumans Saga";

/// Volume name and first arc (zero-indexed) of each book of the saga.
pub const DIVISIONS: [(&str, usize); 3] = [("Skitter", 0), ("Weaver", 8), ("Taylor", 24)];

// The TyrialFrost covers are courtesy of TyrialFrost on reddit.com
const TYRIALFROST_COVERS: [&str; 3] = [
    "http://i.imgur.com/r7upMSQ.jpg",
    "http://i.imgur.com/zJXE2oq.jpg",
    "http://i.imgur.com/Z9KSlxo.jpg",
];

// The Endbringers covers are the sole property of Sandara
const SANDARA_COVERS: [&str; 3] = [
    "http://pre05.deviantart.net/1395/th/pre/f/2016/104/c/e/worm___endbringer_leviathan_by_sandara-d9yuupd.jpg",
    "http://orig04.deviantart.net/8738/f/2016/006/a/a/worm___endbringer_behemoth_by_sandara-d9n1huj.jpg",
    "http://orig10.deviantart.net/ea69/f/2016/103/6/e/worm___the_simurgh_by_sandara-d9nzjkl.jpg",
];

// The monolithic cover is the sole property of cactusfantastico
pub const SINGLE_VOLUME_COVER: &str =
    "http://orig08.deviantart.net/9cea/f/2015/051/7/8/worm_cover_by_cactusfantastico-d8ivj4b.png";

/// Artist whose covers are used for the per-book volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverSet {
    #[default]
    Sandara,
    TyrialFrost,
}

impl CoverSet {
    pub fn urls(self) -> &'static [&'static str] {
        match self {
            CoverSet::Sandara => &SANDARA_COVERS,
            CoverSet::TyrialFrost => &TYRIALFROST_COVERS,
        }
    }
}

/// Errors while planning or binding volumes. Each volume fails on its own.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("No arcs to bind")]
    NoArcs,

    #[error("Volume {volume} starts at arc {start}, but the book has only {arc_count} arcs")]
    NotEnoughArcs {
        volume: String,
        start: usize,
        arc_count: usize,
    },

    #[error("Volume {volume} covers arcs {start}..={end}, outside the book's {arc_count} arcs")]
    ArcRange {
        volume: String,
        start: usize,
        end: usize,
        arc_count: usize,
    },

    #[error("Chapter {label} has not been fetched; refusing to bind a partial book")]
    Unfinished { label: String },

    #[error("Could not fetch cover for {volume} ({url}): {source}")]
    CoverFetch {
        volume: String,
        url: String,
        #[source]
        source: ScraperError,
    },

    #[error("Could not package {volume}: {source}")]
    Epub {
        volume: String,
        #[source]
        source: EpubError,
    },
}

/// Options shared by every volume of a run.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub version: EpubVersion,
    /// One combined volume instead of the per-book split.
    pub single: bool,
    pub covers: CoverSet,
    pub output_dir: PathBuf,
    /// Stamped into every volume as its modification time.
    pub modified: DateTime<Utc>,
}

/// Turn a division table into inclusive arc ranges; each volume ends where the next begins.
pub fn slice_divisions(
    divisions: &[(&str, usize)],
    arc_count: usize,
) -> Result<Vec<(String, RangeInclusive<usize>)>, VolumeError> {
    if arc_count == 0 {
        return Err(VolumeError::NoArcs);
    }
    divisions
        .iter()
        .enumerate()
        .map(|(i, (name, start))| {
            let end = divisions
                .get(i + 1)
                .map(|(_, next)| next.saturating_sub(1))
                .unwrap_or(arc_count - 1);
            if *start >= arc_count || end < *start {
                return Err(VolumeError::NotEnoughArcs {
                    volume: name.to_string(),
                    start: *start,
                    arc_count,
                });
            }
            Ok((name.to_string(), *start..=end.min(arc_count - 1)))
        })
        .collect()
}

/// Decide which volumes to emit for a book of `arc_count` arcs.
pub fn plan_volumes(
    arc_count: usize,
    single: bool,
    covers: CoverSet,
) -> Result<Vec<Volume>, VolumeError> {
    if arc_count == 0 {
        return Err(VolumeError::NoArcs);
    }
    if single {
        return Ok(vec![Volume {
            name: BOOK_TITLE.to_string(),
            number: 0,
            arcs: 0..=arc_count - 1,
            cover_url: SINGLE_VOLUME_COVER.to_string(),
        }]);
    }
    let urls = covers.urls();
    Ok(slice_divisions(&DIVISIONS, arc_count)?
        .into_iter()
        .enumerate()
        .map(|(i, (name, arcs))| Volume {
            name,
            number: i as u32 + 1,
            arcs,
            cover_url: urls
                .get(i)
                .or(urls.last())
                .map(|u| u.to_string())
                .unwrap_or_default(),
        })
        .collect())
}

/// `"Worm 02 - Weaver.epub"`.
pub fn volume_filename(volume: &Volume) -> String {
    format!("{} {:02} - {}.epub", BOOK_TITLE, volume.number, volume.name)
}

/// Book-level metadata for one volume.
pub fn volume_metadata(volume: &Volume, single: bool, modified: DateTime<Utc>) -> Metadata {
    let extra_titles = if single {
        vec![ExtraTitle {
            text: SINGLE_SAGA_TITLE.to_string(),
            title_type: TitleType::Subtitle,
            group_position: Some(volume.number),
        }]
    } else {
        vec![
            ExtraTitle {
                text: SAGA_TITLE.to_string(),
                title_type: TitleType::Collection,
                group_position: Some(volume.number),
            },
            ExtraTitle {
                text: format!("WORM, Book {}: {}", volume.number, volume.name),
                title_type: TitleType::Extended,
                group_position: None,
            },
        ]
    };
    Metadata {
        identifier: format!("{}{}", IDENTIFIER_BASE, volume.name),
        title: volume.name.clone(),
        language: LANGUAGE.to_string(),
        creator: Some(AUTHOR.to_string()),
        extra_titles,
        modified: Some(modified),
    }
}

/// Image extension from the cover URL's path, e.g. `jpg`. Falls back to `jpg`.
pub fn cover_extension(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            let last = u.path_segments()?.next_back()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| "jpg".to_string())
}

/// Cover page showing the image full-bleed. `image_href` is relative to the page.
pub fn cover_page(image_href: &str, version: EpubVersion) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
{doctype}
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en">
  <head>
    <meta http-equiv="Content-Type" content="text/html; charset=UTF-8"/>
    <title>Cover</title>
    <style type="text/css" title="override_css">
      @page {{ padding: 0pt; margin: 0pt }}
      body {{ text-align: center; padding: 0pt; margin: 0pt; }}
    </style>
  </head>
  <body>
    <svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" version="1.1" width="100%" height="100%" preserveAspectRatio="xMidYMid meet">
      <image width="100%" height="100%" xlink:href="{href}"></image>
    </svg>
  </body>
</html>
"#,
        doctype = doctype(version),
        href = image_href
    )
}

/// Lay out one volume: metadata, cover, then each arc's divider followed by its chapters.
///
/// Refuses to build if any chapter in range is not done.
pub fn assemble(
    volume: &Volume,
    arcs: &[StoryArc],
    cover: Vec<u8>,
    options: &BindOptions,
) -> Result<EpubBuilder, VolumeError> {
    let (start, end) = (*volume.arcs.start(), *volume.arcs.end());
    let selected = arcs.get(start..=end).ok_or_else(|| VolumeError::ArcRange {
        volume: volume.name.clone(),
        start,
        end,
        arc_count: arcs.len(),
    })?;
    if let Some(ch) = selected
        .iter()
        .flat_map(|a| &a.chapters)
        .find(|c| !c.is_done())
    {
        return Err(VolumeError::Unfinished {
            label: ch.short_label.clone(),
        });
    }

    let version = options.version;
    let mut book = EpubBuilder::new(version);
    book.set_metadata(volume_metadata(volume, options.single, options.modified));
    book.set_cover_image(cover, &cover_extension(&volume.cover_url));
    let image_href = book
        .cover_image_path()
        .map(|p| format!("../{}", p))
        .unwrap_or_default();
    book.add_cover_page("text/cover.xhtml", cover_page(&image_href, version));

    for arc in selected {
        book.add_document(
            &arc.document_path(),
            arc.render(version),
            Some(TocEntry {
                label: arc.toc_label(),
                depth: 1,
            }),
        );
        for chapter in &arc.chapters {
            book.add_document(
                &chapter.document_path(),
                chapter.render(version),
                Some(TocEntry {
                    label: chapter.title.clone(),
                    depth: 2,
                }),
            );
        }
    }

    if version == EpubVersion::Epub3 {
        book.generate_nav();
    }
    Ok(book)
}

/// Fetch the cover, assemble, and write one volume into `options.output_dir`.
pub async fn bind_volume(
    volume: &Volume,
    arcs: &[StoryArc],
    transport: &dyn Transport,
    options: &BindOptions,
) -> Result<PathBuf, VolumeError> {
    info!(volume = %volume.name, arcs = ?volume.arcs, "Binding... {}", volume.name);
    let cover = transport
        .fetch(&volume.cover_url)
        .await
        .map_err(|source| VolumeError::CoverFetch {
            volume: volume.name.clone(),
            url: volume.cover_url.clone(),
            source,
        })?;
    let book = assemble(volume, arcs, cover, options)?;
    let path = output_path(&options.output_dir, volume);
    book.write(&path).map_err(|source| VolumeError::Epub {
        volume: volume.name.clone(),
        source,
    })?;
    Ok(path)
}

/// Bind every volume. A failed volume does not stop the others.
pub async fn bind_all(
    volumes: &[Volume],
    arcs: &[StoryArc],
    transport: &dyn Transport,
    options: &BindOptions,
) -> Vec<Result<PathBuf, VolumeError>> {
    let mut results = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let result = bind_volume(volume, arcs, transport, options).await;
        if let Err(e) = &result {
            warn!(volume = %volume.name, error = %e, "volume failed");
        }
        results.push(result);
    }
    results
}

fn output_path(dir: &Path, volume: &Volume) -> PathBuf {
    dir.join(volume_filename(volume))
}
