//! Rendering plain text into a paginated PDF (last strategy of the PMC chain).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use tracing::{info, instrument};

use super::{Artifact, RenderError, ResolutionState, Strategy, StrategyOutcome};
use crate::record::BibliographicRecord;

// US Letter in points, one-inch margins, 12pt Helvetica.
const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN: i64 = 72;
const FONT_SIZE: i64 = 12;
// Leading is 1.3 x the font size, expressed in tenths of a point.
const LINE_HEIGHT_TENTHS: i64 = 156;
const WRAP_COLUMNS: usize = 78;

fn lines_per_page() -> usize {
    usize::try_from((PAGE_HEIGHT - 2 * MARGIN) * 10 / LINE_HEIGHT_TENTHS).unwrap_or(1).max(1)
}

/// Greedy word wrap. Paragraphs (blank-line separated) stay separated by one
/// empty line; words longer than a line are split.
fn wrap(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !lines.is_empty() {
            lines.push(String::new());
        }
        for source_line in paragraph.lines() {
            let mut current = String::new();
            for word in source_line.split_whitespace() {
                let mut word: Vec<char> = word.chars().collect();
                while word.len() > columns {
                    if !current.is_empty() {
                        lines.push(std::mem::take(&mut current));
                    }
                    lines.push(word.drain(..columns).collect());
                }
                let word: String = word.into_iter().collect();
                if word.is_empty() {
                    continue;
                }
                let needed = if current.is_empty() { 0 } else { 1 } + word.chars().count();
                if current.chars().count() + needed > columns {
                    lines.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(&word);
            }
            if !current.is_empty() {
                lines.push(current);
            }
        }
    }
    lines
}

/// Latin-1 bytes for the standard font; other characters become `?`.
fn latin1(line: &str) -> Vec<u8> {
    line.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn page_content(lines: &[String]) -> Result<Vec<u8>, RenderError> {
    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), Object::Integer(FONT_SIZE)]),
        Operation::new("TL", vec![Object::Real(15.6)]),
        Operation::new(
            "Td",
            vec![Object::Integer(MARGIN), Object::Integer(PAGE_HEIGHT - MARGIN - FONT_SIZE)],
        ),
    ];
    for line in lines {
        if !line.is_empty() {
            operations.push(Operation::new("Tj", vec![Object::string_literal(latin1(line))]));
        }
        operations.push(Operation::new("T*", vec![]));
    }
    operations.push(Operation::new("ET", vec![]));
    Content { operations }
        .encode()
        .map_err(|e| RenderError::Pdf(e.to_string()))
}

/// Writes `text` to `dest` as a word-wrapped, paginated PDF.
///
/// # Errors
///
/// [`RenderError::Empty`] for blank text, otherwise encoding or IO failures.
pub fn render_text_pdf(text: &str, dest: &Path) -> Result<(), RenderError> {
    let lines = wrap(text, WRAP_COLUMNS);
    if lines.is_empty() {
        return Err(RenderError::Empty);
    }

    let mut doc = Document::with_version("1.5");
    let pages_id: ObjectId = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for chunk in lines.chunks(lines_per_page()) {
        let content_id = doc.add_object(Stream::new(Dictionary::new(), page_content(chunk)?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let page_count = i64::try_from(kids.len()).map_err(|e| RenderError::Pdf(e.to_string()))?;
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(page_count),
        "Resources" => resources_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(PAGE_WIDTH),
            Object::Integer(PAGE_HEIGHT),
        ],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RenderError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    doc.save(dest).map_err(|e| RenderError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Renders the BioC text collected earlier in the chain.
#[derive(Debug)]
pub struct RenderedTextStrategy {
    doc_dir: PathBuf,
}

impl RenderedTextStrategy {
    #[must_use]
    pub fn new(doc_dir: PathBuf) -> Self {
        Self { doc_dir }
    }
}

#[async_trait]
impl Strategy for RenderedTextStrategy {
    fn name(&self) -> &'static str {
        "rendered_text"
    }

    #[instrument(skip(self, record, state), fields(id = record.ids.pmc_lookup_id()))]
    async fn attempt(&self, record: &BibliographicRecord, state: &mut ResolutionState) -> StrategyOutcome {
        if !state.empty_package {
            return StrategyOutcome::SoftFailure("no empty package to stand in for".to_string());
        }
        let Some(text) = state.structured_text.clone() else {
            return StrategyOutcome::SoftFailure("no structured text to render".to_string());
        };
        let Some(id) = record.ids.pmc_lookup_id() else {
            return StrategyOutcome::HardFailure("record has no PMID or PMCID".to_string());
        };
        let dest = self.doc_dir.join(format!("{id}.pdf"));

        let target = dest.clone();
        let rendered = tokio::task::spawn_blocking(move || render_text_pdf(&text, &target))
            .await
            .map_err(|e| RenderError::Task(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = rendered {
            return StrategyOutcome::SoftFailure(e.to_string());
        }

        info!(path = %dest.display(), "package was empty, rendered structured text instead");
        StrategyOutcome::Resolved(Artifact {
            paths: vec![dest],
            license: state.text_license.clone().or_else(|| state.license.clone()),
            is_open_access: true,
        })
    }
}
