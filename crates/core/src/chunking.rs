use crate::error::IngestError;
use crate::models::{Chunk, IngestionOptions, Page};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const SYNTHETIC_TITLE_WORDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLevel {
    pub depth: usize,
    pub name: String,
}

impl HeaderLevel {
    pub fn new(depth: usize, name: impl Into<String>) -> Self {
        Self {
            depth,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub headers: Vec<HeaderLevel>,
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig::from(&IngestionOptions::default())
    }
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            headers: vec![
                HeaderLevel::new(1, "title"),
                HeaderLevel::new(2, "header 2"),
                HeaderLevel::new(3, "header 3"),
            ],
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
        }
    }
}

impl ChunkingConfig {
    fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max_chars {}",
                self.overlap_chars, self.max_chars
            )));
        }
        if let Some(header) = self
            .headers
            .iter()
            .find(|header| header.depth == 0 || header.depth > 6)
        {
            return Err(IngestError::InvalidChunkConfig(format!(
                "heading depth {} for '{}' is outside 1..=6",
                header.depth, header.name
            )));
        }
        Ok(())
    }
}

/// Splits pages along markdown headings, carrying the enclosing heading path
/// and a bounded overlap between neighbouring chunks.
#[derive(Debug, Clone)]
pub struct MarkdownChunker {
    config: ChunkingConfig,
}

#[derive(Debug, Default)]
struct Section {
    stack: Vec<(usize, String)>,
    text: String,
    has_body: bool,
}

impl MarkdownChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk_page(&self, page: &Page) -> Vec<Chunk> {
        if page.text.trim().is_empty() {
            return Vec::new();
        }

        let sections = self.sections(&page.text);

        if char_len(&page.text) <= self.config.overlap_chars {
            let stack = sections
                .iter()
                .rev()
                .find(|section| section.has_body)
                .or_else(|| sections.last())
                .map(|section| section.stack.clone())
                .unwrap_or_default();
            return vec![self.make_chunk(page, 0, &stack, page.text.clone())];
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        for section in &sections {
            for piece in self.split_to_fit(section.text.trim()) {
                let ordinal = chunks.len() as u32;
                let text = match chunks.last() {
                    Some(previous) => {
                        let tail = self.overlap_tail(&previous.text);
                        if tail.is_empty() {
                            piece
                        } else {
                            format!("{tail}\n{piece}")
                        }
                    }
                    None => piece,
                };
                chunks.push(self.make_chunk(page, ordinal, &section.stack, text));
            }
        }

        chunks
    }

    fn make_chunk(&self, page: &Page, ordinal: u32, stack: &[(usize, String)], text: String) -> Chunk {
        let heading_path = stack.iter().map(|(_, title)| title.clone()).collect();
        let headings = stack
            .iter()
            .filter_map(|(depth, title)| {
                self.header_name(*depth)
                    .map(|name| (name.to_string(), title.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        let title = stack
            .iter()
            .find(|(depth, _)| *depth == 1)
            .or_else(|| stack.last())
            .map(|(_, title)| title.clone())
            .unwrap_or_else(|| synthesize_title(&text));

        Chunk {
            chunk_id: make_chunk_id(&page.file_name, page.page_number, ordinal),
            text,
            heading_path,
            headings,
            title,
            file_name: page.file_name.clone(),
            page_number: page.page_number,
            year_of_publish: page.year_of_publish,
            ordinal,
        }
    }

    fn header_name(&self, depth: usize) -> Option<&str> {
        self.config
            .headers
            .iter()
            .find(|header| header.depth == depth)
            .map(|header| header.name.as_str())
    }

    fn heading<'a>(&self, line: &'a str) -> Option<(usize, &'a str)> {
        let indent = line.len() - line.trim_start_matches(' ').len();
        if indent > 3 {
            return None;
        }
        let rest = line.trim_start_matches(' ');
        let depth = rest.len() - rest.trim_start_matches('#').len();
        if depth == 0 || self.header_name(depth).is_none() {
            return None;
        }
        let after = &rest[depth..];
        if !after.is_empty() && !after.starts_with([' ', '\t']) {
            return None;
        }
        let title = after.trim().trim_end_matches('#').trim();
        Some((depth, title))
    }

    fn sections(&self, text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut current = Section::default();
        let mut in_fence = false;

        for line in text.split_inclusive('\n') {
            let bare = line.trim_end_matches(['\n', '\r']);
            let fence = bare.trim_start();
            if fence.starts_with("```") || fence.starts_with("~~~") {
                in_fence = !in_fence;
            }

            let heading = if in_fence { None } else { self.heading(bare) };
            match heading {
                Some((depth, title)) => {
                    stack.retain(|(existing, _)| *existing < depth);
                    stack.push((depth, title.to_string()));

                    if current.has_body {
                        sections.push(std::mem::take(&mut current));
                    }
                    current.stack = stack.clone();
                    current.text.push_str(line);
                }
                None => {
                    if !bare.trim().is_empty() {
                        current.has_body = true;
                    }
                    current.text.push_str(line);
                }
            }
        }

        if !current.text.trim().is_empty() {
            sections.push(current);
        }

        sections
    }

    fn split_to_fit(&self, text: &str) -> Vec<String> {
        let max = self.config.max_chars;
        if text.is_empty() {
            return Vec::new();
        }
        if char_len(text) <= max {
            return vec![text.to_string()];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();
        for paragraph in text
            .split("\n\n")
            .map(str::trim)
            .filter(|paragraph| !paragraph.is_empty())
        {
            if char_len(paragraph) <= max {
                push_packed(&mut pieces, &mut current, paragraph, "\n\n", max);
                continue;
            }

            let mut separator = "\n\n";
            for line in paragraph.lines() {
                if self.heading(line).is_some() || char_len(line) <= max {
                    push_packed(&mut pieces, &mut current, line, separator, max);
                } else {
                    fill_windows(&mut pieces, &mut current, line, separator, max);
                }
                separator = "\n";
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }

        pieces
    }

    /// Trailing slice of `text`, at most `overlap_chars` long, that starts on
    /// a word and never inside a heading line.
    fn overlap_tail<'a>(&self, text: &'a str) -> &'a str {
        let limit = self.config.overlap_chars;
        if limit == 0 {
            return "";
        }
        let total = char_len(text);
        let mut start = if total <= limit {
            0
        } else {
            text.char_indices()
                .nth(total - limit)
                .map(|(offset, _)| offset)
                .unwrap_or(0)
        };

        if start > 0 && !starts_word(text, start) {
            if let Some(space) = text[start..].find(char::is_whitespace) {
                start += space;
            }
        }

        let line_start = text[..start].rfind('\n').map(|at| at + 1).unwrap_or(0);
        if line_start < start {
            let line_end = text[start..]
                .find('\n')
                .map(|at| start + at)
                .unwrap_or(text.len());
            if self.heading(&text[line_start..line_end]).is_some() {
                start = line_end;
            }
        }

        text[start..].trim_start()
    }
}

fn starts_word(text: &str, offset: usize) -> bool {
    text[..offset]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace)
}

fn push_packed(pieces: &mut Vec<String>, current: &mut String, unit: &str, separator: &str, max: usize) {
    if current.is_empty() {
        current.push_str(unit);
        return;
    }
    if char_len(current) + separator.len() + char_len(unit) <= max {
        current.push_str(separator);
        current.push_str(unit);
    } else {
        pieces.push(std::mem::take(current));
        current.push_str(unit);
    }
}

// Hard split for a single line longer than a chunk.
fn fill_windows(pieces: &mut Vec<String>, current: &mut String, line: &str, separator: &str, max: usize) {
    let mut rest = line;
    let mut separator = separator;
    while !rest.is_empty() {
        let used = if current.is_empty() {
            0
        } else {
            char_len(current) + separator.len()
        };
        if used >= max {
            pieces.push(std::mem::take(current));
            continue;
        }

        let room = (max - used).min(char_len(rest));
        let cut = rest
            .char_indices()
            .nth(room)
            .map(|(offset, _)| offset)
            .unwrap_or(rest.len());
        if !current.is_empty() {
            current.push_str(separator);
        }
        current.push_str(&rest[..cut]);
        rest = &rest[cut..];
        separator = "";
        if !rest.is_empty() {
            pieces.push(std::mem::take(current));
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn synthesize_title(text: &str) -> String {
    text.split_whitespace()
        .take(SYNTHETIC_TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable identity for a chunk: reruns over an unchanged corpus map every
/// chunk to the same record.
pub fn make_chunk_id(file_name: &str, page: u32, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(ordinal.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> Page {
        Page {
            text: text.to_string(),
            page_number: 1,
            year_of_publish: 2008,
            file_name: "2008letter.md".to_string(),
        }
    }

    fn chunker(max_chars: usize, overlap_chars: usize) -> MarkdownChunker {
        let options = IngestionOptions {
            chunk_max_chars: max_chars,
            chunk_overlap_chars: overlap_chars,
            ..IngestionOptions::default()
        };
        MarkdownChunker::new(ChunkingConfig::from(&options)).expect("config should be valid")
    }

    fn paragraph(word: &str, count: usize) -> String {
        vec![word; count].join(" ")
    }

    #[test]
    fn short_page_is_a_single_chunk_equal_to_the_page() {
        let text = "# Letter\n\n## Insurance\n\nFloat grew again.";
        let chunks = chunker(4_000, 512).chunk_page(&page(text));

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].heading_path, vec!["Letter", "Insurance"]);
        assert_eq!(chunks[0].title, "Letter");
        assert_eq!(chunks[0].headings.get("header 2").map(String::as_str), Some("Insurance"));
    }

    #[test]
    fn page_without_headings_has_empty_path_and_synthetic_title() {
        let text = paragraph("value", 40);
        let chunks = chunker(4_000, 16).chunk_page(&page(&text));

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].heading_path.is_empty());
        assert_eq!(chunks[0].title, paragraph("value", 8));
    }

    #[test]
    fn headings_open_sections_with_nested_paths() {
        let text = format!(
            "# Letter\n\n## Insurance\n\n{}\n\n### GEICO\n\n{}\n\n## Railroads\n\n{}",
            paragraph("float", 30),
            paragraph("auto", 30),
            paragraph("rail", 30)
        );
        let chunks = chunker(4_000, 20).chunk_page(&page(&text));

        let paths: Vec<Vec<String>> = chunks.iter().map(|chunk| chunk.heading_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["Letter".to_string(), "Insurance".to_string()],
                vec!["Letter".to_string(), "Insurance".to_string(), "GEICO".to_string()],
                vec!["Letter".to_string(), "Railroads".to_string()],
            ]
        );
        assert!(chunks.iter().all(|chunk| chunk.title == "Letter"));
        let ordinals: Vec<u32> = chunks.iter().map(|chunk| chunk.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn adjacent_chunks_share_an_overlap_prefix() {
        let text = format!(
            "# Letter\n\n{}\n\n## Acquisitions\n\n{}\n\n## Buybacks\n\n{}",
            paragraph("moat", 200),
            paragraph("price", 200),
            paragraph("intrinsic", 200)
        );
        let chunks = chunker(4_000, 512).chunk_page(&page(&text));
        assert!(chunks.len() >= 3);

        for pair in chunks.windows(2) {
            let previous = &pair[0].text;
            let next = &pair[1].text;
            let shared = (1..=512.min(previous.chars().count()))
                .rev()
                .map(|n| {
                    let start = previous.char_indices().nth(previous.chars().count() - n).map(|(at, _)| at).unwrap_or(0);
                    &previous[start..]
                })
                .find(|tail| !tail.trim().is_empty() && next.starts_with(tail));
            assert!(shared.is_some(), "chunk does not start with the tail of its predecessor");
        }
    }

    #[test]
    fn overlap_never_starts_inside_a_heading_line() {
        let text = "body text\n## Insurance Operations\nmore";
        assert_eq!(chunker(400, 16).overlap_tail(text), "more");
        assert_eq!(chunker(400, 7).overlap_tail("one two three"), "three");
        assert_eq!(chunker(400, 5).overlap_tail("one two three"), "three");
    }

    #[test]
    fn long_sections_are_split_to_max_chars_plus_overlap() {
        let text = format!("# Letter\n\n{}", paragraph("compounding", 1_000));
        let chunker = chunker(1_000, 100);
        let chunks = chunker.chunk_page(&page(&text));

        assert!(chunks.len() > 5);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 1_000 + 100 + 1);
            assert_eq!(chunk.heading_path, vec!["Letter"]);
        }
        assert!(chunks[0].text.starts_with("# Letter\n\ncompounding"));
        assert_eq!(chunks[0].text.chars().count(), 1_000);
    }

    #[test]
    fn headings_inside_code_fences_are_ignored() {
        let text = format!("# Letter\n\n```\n# not a heading\n```\n\n{}", paragraph("cash", 150));
        let chunks = chunker(4_000, 16).chunk_page(&page(&text));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, vec!["Letter"]);
    }

    #[test]
    fn untracked_heading_levels_stay_in_the_body() {
        let text = format!("## Section\n\n#### Detail\n\n{}", paragraph("bond", 150));
        let chunks = chunker(4_000, 16).chunk_page(&page(&text));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, vec!["Section"]);
        assert_eq!(chunks[0].title, "Section");
    }

    #[test]
    fn chunk_ids_are_stable_across_runs() {
        let text = format!("# Letter\n\n{}", paragraph("float", 400));
        let first = chunker(1_000, 64).chunk_page(&page(&text));
        let second = chunker(1_000, 64).chunk_page(&page(&text));
        let first_ids: Vec<_> = first.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        assert_eq!(first_ids, second_ids);
        assert_ne!(first_ids[0], first_ids[1]);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = ChunkingConfig {
            max_chars: 100,
            overlap_chars: 100,
            ..ChunkingConfig::default()
        };
        assert!(matches!(
            MarkdownChunker::new(config),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }
}
