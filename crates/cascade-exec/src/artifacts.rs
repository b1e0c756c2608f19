//! Output-spec evaluation and content hashing.
//!
//! After a step's command succeeds, the executor asks this module what the
//! step produced: every file under the working directory matching one of the
//! step's glob patterns, with a combined digest that changes when any file's
//! content, name, or the set of files changes.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};

use cascade_types::{CascadeError, Fingerprint, Result, StepOutput};

/// Digest a file's bytes at read time.
///
/// Fails with `InputUnavailable` when the file cannot be read, which callers
/// surface as a fingerprinting failure for the step that declared the input.
pub async fn hash_file(path: &Path) -> Result<Fingerprint> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CascadeError::InputUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(Fingerprint::from_bytes(&bytes))
}

/// Collect the artifact a step produced: all files under `root` matching
/// `patterns`, sorted by relative path.
///
/// The combined digest folds in each file's relative path as well as its
/// content, so a rename is as much of a change as an edit. An empty match set
/// yields a stable "empty" digest rather than an error: a step is allowed to
/// produce nothing.
pub async fn collect_artifacts(root: &Path, patterns: &[String]) -> Result<StepOutput> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            CascadeError::Other(format!("invalid output pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| CascadeError::Other(format!("invalid output spec: {e}")))?;

    let mut files = Vec::new();
    if !patterns.is_empty() && tokio::fs::try_exists(root).await? {
        collect_matches(root, root, &set, &mut files).await?;
    }
    files.sort();

    let mut file_digests = Vec::with_capacity(files.len());
    for rel in &files {
        let bytes = tokio::fs::read(root.join(rel)).await?;
        let name_fp = Fingerprint::from_bytes(rel.to_string_lossy().as_bytes());
        let content_fp = Fingerprint::from_bytes(&bytes);
        file_digests.push(Fingerprint::combine([&name_fp, &content_fp]));
    }

    tracing::debug!(
        root = %root.display(),
        matched = files.len(),
        "Collected artifacts"
    );

    Ok(StepOutput {
        digest: Fingerprint::combine(file_digests.iter()),
        root: root.to_path_buf(),
        files,
    })
}

/// Recursively gather files whose root-relative path matches the globset.
async fn collect_matches(
    base: &Path,
    current: &Path,
    set: &globset::GlobSet,
    matches: &mut Vec<PathBuf>,
) -> Result<()> {
    let meta = tokio::fs::metadata(current).await?;
    if meta.is_file() {
        if let Ok(rel) = current.strip_prefix(base) {
            if set.is_match(rel) {
                matches.push(rel.to_path_buf());
            }
        }
    } else if meta.is_dir() {
        let mut read_dir = tokio::fs::read_dir(current).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            Box::pin(collect_matches(base, &entry.path(), set, matches)).await?;
        }
    }
    Ok(())
}
