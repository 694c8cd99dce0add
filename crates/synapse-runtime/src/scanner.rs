//! Unindexed Knowledge Scanner — walks the filesystem for documentation,
//! configuration, source, and service-unit files that are either missing
//! from the vector index or indexed from a stale copy, and turns the worst
//! offenders into [`CuriosityQuestion`]s.
//!
//! Grounded on the same idea as [`VectorIndex::is_stale`] and
//! [`VectorIndex::get_indexed_files`](synapse_memory::VectorIndex): the
//! filesystem is the source of truth, the index is a cache over it, and a
//! scan is just a diff between the two. No crate in this workspace walks
//! directories recursively elsewhere, so this scanner does its own
//! `std::fs::read_dir` recursion rather than pull in a new dependency for a
//! single use site.

use std::path::{Path, PathBuf};

use synapse_memory::VectorIndex;
use synapse_types::CuriosityQuestion;

/// Maximum curiosity questions emitted by a single scan, across both
/// unindexed and stale findings.
const MAX_QUESTIONS_PER_SCAN: usize = 10;

/// How stale an indexed file may be considered relevant without reindexing
/// is not decided here — that is [`VectorIndex::is_stale`]'s job; this
/// scanner just asks it per candidate path.
const STALE_PRIORITY: &str = "low";

/// Directory components that mark a subtree as noise, never descended into.
const SKIP_PATTERNS: &[&str] = &["target", ".git", "node_modules", ".cache", ".venv", "__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileCategory {
    Documentation,
    Configuration,
    SourceCode,
    Service,
}

impl FileCategory {
    /// Priority weight used to sort candidate files before the
    /// [`MAX_QUESTIONS_PER_SCAN`] cap is applied — documentation ranks
    /// highest since undocumented behavior is the costliest kind of unindexed
    /// knowledge to rediscover later.
    fn weight(self) -> u8 {
        match self {
            FileCategory::Documentation => 3,
            FileCategory::Configuration => 2,
            FileCategory::Service => 2,
            FileCategory::SourceCode => 1,
        }
    }

    fn label(self) -> &'static str {
        match self {
            FileCategory::Documentation => "documentation",
            FileCategory::Configuration => "configuration",
            FileCategory::SourceCode => "source_code",
            FileCategory::Service => "service",
        }
    }

    fn classify(path: &Path) -> Option<Self> {
        let ext = path.extension().and_then(|e| e.to_str())?;
        match ext {
            "md" | "txt" => Some(FileCategory::Documentation),
            "yaml" | "yml" | "json" | "toml" => Some(FileCategory::Configuration),
            "service" => Some(FileCategory::Service),
            "rs" | "py" | "go" | "ts" | "js" => Some(FileCategory::SourceCode),
            _ => None,
        }
    }
}

fn should_skip_dir(name: &str) -> bool {
    SKIP_PATTERNS.iter().any(|p| name == *p || name.ends_with(".backup") || name.ends_with(".bak"))
}

/// Recursively collect every candidate file under `root`, skipping noisy
/// subtrees. Symlinks are not followed (matches `std::fs::read_dir`'s
/// default, which reports but does not traverse through them).
fn collect_candidate_files(root: &Path) -> Vec<(PathBuf, FileCategory)> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };

            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                if !should_skip_dir(file_name) {
                    stack.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if let Some(category) = FileCategory::classify(&path) {
                found.push((path, category));
            }
        }
    }
    found
}

/// Walks `scan_paths` for documentation, configuration, source, and
/// service-unit files and reports which ones the knowledge index is missing
/// or holding a stale copy of.
pub struct UnindexedKnowledgeScanner {
    scan_paths: Vec<PathBuf>,
    index: VectorIndex,
    collection: String,
}

impl UnindexedKnowledgeScanner {
    pub fn new(scan_paths: Vec<PathBuf>, index: VectorIndex, collection: impl Into<String>) -> Self {
        Self { scan_paths, index, collection: collection.into() }
    }

    /// Run one scan: find unindexed files first (up to the cap), then fill
    /// any remaining slots with stale files, highest category-priority
    /// first within each group.
    pub async fn scan(&self) -> Result<Vec<CuriosityQuestion>, synapse_types::MemoryErrorKind> {
        let mut candidates: Vec<(PathBuf, FileCategory)> =
            self.scan_paths.iter().flat_map(|p| collect_candidate_files(p)).collect();
        candidates.sort_by(|a, b| b.1.weight().cmp(&a.1.weight()));

        let indexed = self.index.get_indexed_files(&self.collection).await?;

        let mut unindexed = Vec::new();
        let mut maybe_stale = Vec::new();
        for (path, category) in candidates {
            let Some(path_str) = path.to_str() else { continue };
            if indexed.contains(path_str) {
                maybe_stale.push((path, category));
            } else {
                unindexed.push((path, category));
            }
        }

        let mut questions = Vec::new();
        for (path, category) in unindexed.into_iter().take(MAX_QUESTIONS_PER_SCAN) {
            questions.push(question_for_file(&path, category, false));
        }

        let remaining = MAX_QUESTIONS_PER_SCAN.saturating_sub(questions.len());
        if remaining > 0 {
            for (path, category) in maybe_stale {
                if questions.len() >= MAX_QUESTIONS_PER_SCAN {
                    break;
                }
                let Some(path_str) = path.to_str() else { continue };
                if self.index.is_stale(&self.collection, path_str).await? {
                    questions.push(question_for_file(&path, category, true));
                }
            }
        }

        Ok(questions)
    }
}

fn sanitize_filename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn question_for_file(path: &Path, category: FileCategory, is_stale: bool) -> CuriosityQuestion {
    let sanitized = sanitize_filename(path);
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_else(|_| chrono::Utc::now());

    let evidence = vec![
        format!("file_path: {}", path.display()),
        format!("file_type: {}", category.label()),
        format!("size: {size}"),
        format!("mtime: {}", mtime.to_rfc3339()),
    ];

    if is_stale {
        CuriosityQuestion::new(
            format!("STALE_KNOWLEDGE_{sanitized}"),
            format!("the indexed copy of {} is older than the file on disk", path.display()),
            format!("has {} changed in ways the index should know about?", path.display()),
            evidence,
            STALE_PRIORITY,
            format!("knowledge.{}.{sanitized}", category.label()),
        )
    } else {
        CuriosityQuestion::new(
            format!("UNINDEXED_KNOWLEDGE_{sanitized}"),
            format!("{} exists but is not in the knowledge index", path.display()),
            format!("what does {} document or implement, and should it be indexed?", path.display()),
            evidence,
            "medium",
            format!("knowledge.{}.{sanitized}", category.label()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("synapse-scanner-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn classifies_known_extensions() {
        assert_eq!(FileCategory::classify(Path::new("README.md")), Some(FileCategory::Documentation));
        assert_eq!(FileCategory::classify(Path::new("config.yaml")), Some(FileCategory::Configuration));
        assert_eq!(FileCategory::classify(Path::new("synapse.service")), Some(FileCategory::Service));
        assert_eq!(FileCategory::classify(Path::new("main.rs")), Some(FileCategory::SourceCode));
        assert_eq!(FileCategory::classify(Path::new("image.png")), None);
    }

    #[test]
    fn collect_skips_noisy_directories() {
        let dir = tmp_dir("skip");
        std::fs::create_dir_all(dir.join("target/debug")).unwrap();
        std::fs::write(dir.join("target/debug/notes.md"), "ignored").unwrap();
        std::fs::write(dir.join("README.md"), "kept").unwrap();

        let found = collect_candidate_files(&dir);
        assert_eq!(found.len(), 1);
        assert!(found[0].0.ends_with("README.md"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn scan_finds_unindexed_file_before_stale() {
        let dir = tmp_dir("scan");
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        let index = VectorIndex::open_in_memory().unwrap();
        let scanner = UnindexedKnowledgeScanner::new(vec![dir.clone()], index, "knowledge");

        let questions = scanner.scan().await.unwrap();
        assert_eq!(questions.len(), 1);
        assert!(questions[0].id.starts_with("UNINDEXED_KNOWLEDGE_"));
        assert_eq!(questions[0].priority, "medium");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn scan_finds_stale_file_when_indexed_mtime_is_older() {
        let dir = tmp_dir("stale");
        let file_path = dir.join("README.md");
        std::fs::write(&file_path, "hello").unwrap();
        let index = VectorIndex::open_in_memory().unwrap();

        index
            .upsert(
                "knowledge",
                vec![synapse_types::VectorDoc {
                    collection: "knowledge".to_string(),
                    id: "readme".to_string(),
                    payload: serde_json::json!({}),
                    embedding: vec![1.0],
                    content_hash: "old-hash".to_string(),
                    mtime: chrono::Utc::now() - chrono::Duration::days(30),
                    source_path: Some(file_path.to_str().unwrap().to_string()),
                }],
            )
            .await
            .unwrap();

        let scanner = UnindexedKnowledgeScanner::new(vec![dir.clone()], index, "knowledge");
        let questions = scanner.scan().await.unwrap();
        assert_eq!(questions.len(), 1);
        assert!(questions[0].id.starts_with("STALE_KNOWLEDGE_"));
        assert_eq!(questions[0].priority, "low");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn scan_caps_at_ten_questions() {
        let dir = tmp_dir("cap");
        for i in 0..15 {
            std::fs::write(dir.join(format!("doc{i}.md")), "content").unwrap();
        }
        let index = VectorIndex::open_in_memory().unwrap();
        let scanner = UnindexedKnowledgeScanner::new(vec![dir.clone()], index, "knowledge");

        let questions = scanner.scan().await.unwrap();
        assert_eq!(questions.len(), MAX_QUESTIONS_PER_SCAN);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn sanitize_filename_replaces_non_alphanumeric() {
        assert_eq!(sanitize_filename(Path::new("my-notes v2.md")), "my_notes_v2_md");
    }
}
