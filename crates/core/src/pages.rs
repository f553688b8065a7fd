use crate::error::IngestError;
use crate::models::{Document, Page};
use regex::Regex;

const PAGE_BREAK_PATTERN: &str = r"(?im)^[ \t]*-{3,}[ \t]*page[ \t]+break[ \t]*-{3,}[ \t\r]*$";
const YEAR_PATTERN: &str = r"\d{4}";

/// Splits letter text into pages and derives per-page metadata.
#[derive(Debug, Clone)]
pub struct PageSplitter {
    page_break: Regex,
    year: Regex,
}

impl PageSplitter {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            page_break: Regex::new(PAGE_BREAK_PATTERN)?,
            year: Regex::new(YEAR_PATTERN)?,
        })
    }

    /// Splits raw text on `---- page break ----` lines.
    ///
    /// Segments are trimmed and blank ones dropped, so the result keeps
    /// document order and every entry carries text.
    pub fn split_pages(&self, text: &str) -> Vec<String> {
        self.page_break
            .split(text)
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// First run of four digits in the file name, `0` when there is none.
    pub fn year_of_publish(&self, file_name: &str) -> u32 {
        self.year
            .find(file_name)
            .and_then(|found| found.as_str().parse().ok())
            .unwrap_or(0)
    }

    pub fn pages(&self, document: &Document) -> Vec<Page> {
        let year = self.year_of_publish(&document.file_name);

        self.split_pages(&document.text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Page {
                text,
                page_number: (index + 1) as u32,
                year_of_publish: year,
                file_name: document.file_name.clone(),
            })
            .collect()
    }
}

pub fn split_pages(text: &str) -> Result<Vec<String>, IngestError> {
    Ok(PageSplitter::new()?.split_pages(text))
}

pub fn year_of_publish(file_name: &str) -> Result<u32, IngestError> {
    Ok(PageSplitter::new()?.year_of_publish(file_name))
}

pub fn pages_from_document(document: &Document) -> Result<Vec<Page>, IngestError> {
    Ok(PageSplitter::new()?.pages(document))
}
