use crate::chunking::{ChunkingConfig, MarkdownChunker};
use crate::embeddings::{validate_embeddings, Embedder};
use crate::models::{Chunk, Document, IngestionOptions, Metadata};
use crate::pages::PageSplitter;
use crate::store::ensure_index;
use crate::traits::IndexStore;
use crate::{IngestError, StoreError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// All `.md` files below `root`, sorted. Unreadable sub-directories are
/// skipped with a warning; a missing root is an error.
pub fn discover_markdown_files(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if !root.is_dir() {
        return Err(IngestError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("documents directory not found: {}", root.display()),
        )));
    }

    let mut files = Vec::new();
    for item in WalkDir::new(root) {
        let entry = match item {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let is_markdown = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));

        if is_markdown {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    Ok(files)
}

pub async fn load_document(path: &Path) -> Result<Document, IngestError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
        .to_string();
    let text = tokio::fs::read_to_string(path).await?;

    Ok(Document {
        source_path: path.to_path_buf(),
        file_name,
        text,
    })
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub index_name: String,
    pub files_found: usize,
    pub files_ingested: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub chunks_indexed: usize,
    pub index_created: bool,
}

/// State of one ingestion run. Chunks from every file are gathered here and
/// indexed together.
pub struct IngestionRun {
    options: IngestionOptions,
    splitter: Arc<PageSplitter>,
    chunker: Arc<MarkdownChunker>,
    files_found: usize,
    files_ingested: usize,
    chunks: Vec<Chunk>,
    skipped_files: Vec<SkippedFile>,
}

impl IngestionRun {
    pub fn new(options: IngestionOptions) -> Result<Self, IngestError> {
        let chunker = MarkdownChunker::new(ChunkingConfig::from(&options))?;
        Ok(Self {
            options,
            splitter: Arc::new(PageSplitter::new()?),
            chunker: Arc::new(chunker),
            files_found: 0,
            files_ingested: 0,
            chunks: Vec::new(),
            skipped_files: Vec::new(),
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn skipped_files(&self) -> &[SkippedFile] {
        &self.skipped_files
    }

    /// Reads and chunks `files` concurrently. Results are appended in the
    /// order of `files`; a file that cannot be read is recorded and skipped.
    pub async fn collect(&mut self, files: &[PathBuf]) -> Result<(), IngestError> {
        self.files_found += files.len();

        let mut tasks = JoinSet::new();
        for (position, path) in files.iter().enumerate() {
            let path = path.clone();
            let splitter = Arc::clone(&self.splitter);
            let chunker = Arc::clone(&self.chunker);
            tasks.spawn(async move {
                let chunks = chunk_file(&path, &splitter, &chunker).await;
                (position, path, chunks)
            });
        }

        let mut results: Vec<Option<(PathBuf, Result<Vec<Chunk>, IngestError>)>> =
            (0..files.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (position, path, chunks) = joined?;
            results[position] = Some((path, chunks));
        }

        for (path, chunks) in results.into_iter().flatten() {
            match chunks {
                Ok(chunks) => {
                    info!(file = %path.display(), chunks = chunks.len(), "chunked file");
                    self.files_ingested += 1;
                    self.chunks.extend(chunks);
                }
                Err(error) => {
                    warn!(file = %path.display(), %error, "skipping file");
                    self.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Embeds every collected chunk, makes sure the index exists, then
    /// writes all records in one upsert. Nothing is written if embedding fails.
    pub async fn index(
        self,
        embedder: &dyn Embedder,
        store: &dyn IndexStore,
    ) -> Result<IngestionReport, IngestError> {
        let index_name = self.options.index_name.clone();
        let total = self.chunks.len();
        info!(chunks = total, index = %index_name, "embedding chunks");

        let vectors = if total == 0 {
            Vec::new()
        } else {
            let texts: Vec<String> = self.chunks.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;
            validate_embeddings(&vectors, total, embedder.dimensions())?;
            vectors
        };

        let index_created = ensure_index(store, &index_name, embedder.dimensions()).await?;

        if total > 0 {
            let ids: Vec<String> = self.chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect();
            let metadata = self
                .chunks
                .iter()
                .enumerate()
                .map(|(sequence, chunk)| chunk.metadata(sequence as u64).to_map())
                .collect::<Result<Vec<Metadata>, _>>()
                .map_err(StoreError::from)?;

            store.upsert(&index_name, &ids, &vectors, &metadata).await?;
            info!(records = total, index = %index_name, "upserted chunks");
        } else {
            warn!(index = %index_name, "no chunks to index");
        }

        Ok(IngestionReport {
            index_name,
            files_found: self.files_found,
            files_ingested: self.files_ingested,
            skipped_files: self.skipped_files,
            chunks_indexed: total,
            index_created,
        })
    }
}

async fn chunk_file(
    path: &Path,
    splitter: &PageSplitter,
    chunker: &MarkdownChunker,
) -> Result<Vec<Chunk>, IngestError> {
    let document = load_document(path).await?;
    let pages = splitter.pages(&document);
    debug!(file = %document.file_name, pages = pages.len(), "split pages");

    Ok(pages.iter().flat_map(|page| chunker.chunk_page(page)).collect())
}

/// Loads, splits, chunks, embeds and indexes every letter below `root`.
pub async fn ingest_documents(
    root: &Path,
    options: IngestionOptions,
    embedder: &dyn Embedder,
    store: &dyn IndexStore,
) -> Result<IngestionReport, IngestError> {
    let files = discover_markdown_files(root)?;
    info!(root = %root.display(), files = files.len(), "found markdown files");

    let mut run = IngestionRun::new(options)?;
    run.collect(&files).await?;
    run.index(embedder, store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::ChunkMetadata;
    use crate::store::QueryFilter;
    use crate::stores::MemoryIndexStore;
    use crate::EmbeddingError;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::tempdir;

    const BREAK: &str = "\n-------------------- page break --------------------\n";

    fn embedder() -> CharacterNgramEmbedder {
        CharacterNgramEmbedder { dimensions: 64 }
    }

    fn letter_1999() -> String {
        format!(
            "# Berkshire Hathaway 1999\n\n## Insurance\n\nFloat grew again this year.{BREAK}## Investments\n\nWe bought no new stocks."
        )
    }

    #[test]
    fn discover_markdown_files_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("2001letter.md"), "a")?;
        fs::write(nested.join("1999letter.MD"), "b")?;
        fs::write(dir.path().join("notes.txt"), "c")?;

        let files = discover_markdown_files(dir.path())?;
        let names: Vec<String> = files
            .iter()
            .map(|path| path.strip_prefix(dir.path()).map(|p| p.display().to_string()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["2001letter.md", "nested/1999letter.MD"]);
        Ok(())
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let result = discover_markdown_files(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(IngestError::Io(error)) if error.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn letter_is_split_into_pages_with_year_and_headings() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("1999letter.md"), letter_1999())?;

        let store = MemoryIndexStore::new();
        let report = ingest_documents(dir.path(), IngestionOptions::default(), &embedder(), &store).await?;

        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.chunks_indexed, 2);
        assert!(report.index_created);
        assert_eq!(store.count("papers").await?, 2);

        let query = embedder().embed_text("Float grew");
        let hits = store.query("papers", &query, 10, &QueryFilter::default()).await?;
        let mut chunks: Vec<ChunkMetadata> = hits
            .iter()
            .map(|hit| ChunkMetadata::from_map(&hit.metadata))
            .collect::<Result<_, _>>()?;
        chunks.sort_by_key(|chunk| chunk.page_number);

        assert!(chunks.iter().all(|chunk| chunk.year_of_publish == 1999));
        assert_eq!(chunks[0].page_number, 1);
        assert_eq!(chunks[0].heading_path, vec!["Berkshire Hathaway 1999", "Insurance"]);
        assert_eq!(chunks[0].title, "Berkshire Hathaway 1999");
        assert_eq!(chunks[0].headings.get("title").map(String::as_str), Some("Berkshire Hathaway 1999"));
        assert_eq!(chunks[0].headings.get("header 2").map(String::as_str), Some("Insurance"));
        assert_eq!(
            hits.iter()
                .find(|hit| hit.metadata.get("page_number") == Some(&serde_json::json!(2)))
                .and_then(|hit| hit.metadata.get("headings"))
                .and_then(|headings| headings.get("header 2")),
            Some(&serde_json::json!("Investments"))
        );
        assert_eq!(chunks[1].page_number, 2);
        assert_eq!(chunks[1].heading_path, vec!["Investments"]);
        assert!(chunks[1].text.contains("We bought no new stocks."));
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_the_same_letters_does_not_duplicate() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("1999letter.md"), letter_1999())?;
        fs::write(dir.path().join("2008letter.md"), "Price is what you pay.")?;

        let store = MemoryIndexStore::new();
        let first = ingest_documents(dir.path(), IngestionOptions::default(), &embedder(), &store).await?;
        let before = store.count("papers").await?;
        let second = ingest_documents(dir.path(), IngestionOptions::default(), &embedder(), &store).await?;

        assert!(first.index_created);
        assert!(!second.index_created);
        assert_eq!(before, 3);
        assert_eq!(store.count("papers").await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("2008letter.md"), "Price is what you pay.")?;
        fs::write(dir.path().join("broken.md"), [0xff, 0xfe, 0x00, 0x80])?;

        let store = MemoryIndexStore::new();
        let report = ingest_documents(dir.path(), IngestionOptions::default(), &embedder(), &store).await?;

        assert_eq!(report.files_found, 2);
        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.skipped_files.len(), 1);
        assert!(report.skipped_files[0].path.ends_with("broken.md"));
        assert_eq!(store.count("papers").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn chunks_keep_file_order_across_concurrent_reads() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for year in [2003, 2001, 2002] {
            fs::write(dir.path().join(format!("{year}letter.md")), format!("Letter for {year}."))?;
        }

        let files = discover_markdown_files(dir.path())?;
        let mut run = IngestionRun::new(IngestionOptions::default())?;
        run.collect(&files).await?;

        let years: Vec<u32> = run.chunks().iter().map(|chunk| chunk.year_of_publish).collect();
        assert_eq!(years, vec![2001, 2002, 2003]);
        Ok(())
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn dimensions(&self) -> usize {
            64
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Provider {
                status: 429,
                body: "rate limited".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn embedding_failure_aborts_before_any_write() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("2008letter.md"), "Price is what you pay.")?;

        let store = MemoryIndexStore::new();
        let result = ingest_documents(dir.path(), IngestionOptions::default(), &FailingEmbedder, &store).await;

        assert!(matches!(result, Err(IngestError::Embedding(_))));
        assert!(matches!(store.count("papers").await, Err(StoreError::IndexNotFound(_))));
        Ok(())
    }
}
