// Units module - 仓库拆分为扫描单元

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::analyzer::ScanUnit;
use crate::config::UnitSourceConfig;
use crate::error::{CoreError, Result};
use crate::job::JobId;
use crate::store::Repository;

/// Decomposes a repository into independently analyzable units.
#[async_trait]
pub trait UnitSource: Send + Sync {
    async fn decompose(&self, repository: &Repository, job_id: JobId) -> Result<Vec<ScanUnit>>;
}

/// One unit per source file under the repository checkout, honoring
/// `.gitignore` and friends.
pub struct DirectoryUnitSource {
    config: UnitSourceConfig,
}

impl DirectoryUnitSource {
    pub fn new(config: UnitSourceConfig) -> Self {
        Self { config }
    }

    fn wants(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    fn walk(&self, root: &Path, repository_id: &str, job_id: JobId) -> Result<Vec<ScanUnit>> {
        if !root.is_dir() {
            return Err(CoreError::Decomposition(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut units = Vec::new();
        for result in ignore::WalkBuilder::new(root).build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().map_or(false, |ft| ft.is_file()) || !self.wants(entry.path()) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size == 0 || size > self.config.max_file_bytes {
                tracing::debug!(path = %entry.path().display(), size, "skipping file by size");
                continue;
            }

            // 非 UTF-8 文件直接跳过
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(_) => continue,
            };

            let relative = relative_id(root, entry.path());
            units.push(ScanUnit {
                id: relative.clone(),
                job_id,
                repository_id: repository_id.to_string(),
                location: relative,
                language: detect_language(entry.path()).map(String::from),
                content,
            });
        }

        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }
}

#[async_trait]
impl UnitSource for DirectoryUnitSource {
    async fn decompose(&self, repository: &Repository, job_id: JobId) -> Result<Vec<ScanUnit>> {
        let root = PathBuf::from(&repository.source);
        let repository_id = repository.id.clone();
        let source = DirectoryUnitSource::new(self.config.clone());

        let units = tokio::task::spawn_blocking(move || source.walk(&root, &repository_id, job_id))
            .await
            .map_err(|e| CoreError::Decomposition(format!("walker task failed: {}", e)))??;

        tracing::info!(repository = %repository.id, units = units.len(), "repository decomposed");
        Ok(units)
    }
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let language = match ext.as_str() {
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "py" => "python",
        "java" => "java",
        "rs" => "rust",
        "go" => "go",
        "php" => "php",
        "rb" => "ruby",
        "cs" => "csharp",
        "html" | "htm" => "html",
        "vue" => "vue",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" => "cpp",
        _ => return None,
    };
    Some(language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn checkout() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src/api")).unwrap();
        fs::write(dir.path().join("src/api/users.py"), "def get(uid): pass\n").unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
        fs::write(dir.path().join("empty.js"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn walks_source_files_in_order() {
        let dir = checkout();
        let repo = Repository::new("r1", "demo", dir.path().to_string_lossy());
        let job_id = Uuid::new_v4();

        let units = DirectoryUnitSource::new(UnitSourceConfig::default())
            .decompose(&repo, job_id)
            .await
            .unwrap();

        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["src/api/users.py", "src/main.rs"]);
        assert_eq!(units[0].language.as_deref(), Some("python"));
        assert_eq!(units[0].job_id, job_id);
        assert_eq!(units[1].content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let dir = checkout();
        fs::write(dir.path().join("big.js"), "x".repeat(64)).unwrap();
        let config = UnitSourceConfig {
            max_file_bytes: 32,
            ..UnitSourceConfig::default()
        };
        let repo = Repository::new("r1", "demo", dir.path().to_string_lossy());

        let units = DirectoryUnitSource::new(config)
            .decompose(&repo, Uuid::new_v4())
            .await
            .unwrap();
        assert!(units.iter().all(|u| u.id != "big.js"));
    }

    #[tokio::test]
    async fn missing_checkout_fails_decomposition() {
        let repo = Repository::new("r1", "demo", "/definitely/not/here");
        let err = DirectoryUnitSource::new(UnitSourceConfig::default())
            .decompose(&repo, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Decomposition(_)));
    }
}
