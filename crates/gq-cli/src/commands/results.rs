//! Result commands: list, delete, rate, favorite, download

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use gq_orchestrator::{Orchestrator, ResultsFilter};

use crate::output::{format_results, print_error, print_success};

/// Options for the results listing
#[derive(Debug, Clone, Default)]
pub struct ResultsArgs {
    pub limit: usize,
    pub search: Option<String>,
    pub favorites: bool,
    pub long: bool,
}

impl ResultsArgs {
    fn filter(&self) -> ResultsFilter {
        ResultsFilter {
            search: self.search.clone(),
            favorites_only: self.favorites,
        }
        .normalized()
    }
}

/// Execute the results command
///
/// The orchestrator was initialized with `args.limit` as its history
/// limit; a filter triggers one more fetch with the filter applied.
pub async fn results_command(orchestrator: &Orchestrator, args: &ResultsArgs) -> Result<()> {
    let filter = args.filter();
    if filter.is_active() {
        orchestrator.apply_results_filter(filter)?;
        orchestrator
            .refresh()
            .await
            .context("Failed to fetch filtered results")?;
    }

    let snapshot = orchestrator.snapshot();
    let shown = snapshot.results.len().min(args.limit);
    println!("{}", format_results(&snapshot.results[..shown], args.long));

    Ok(())
}

/// Execute the delete command
pub async fn delete_command(orchestrator: &Orchestrator, ids: &[String]) -> Result<()> {
    let mut failed = 0;

    for id in ids {
        if let Err(e) = orchestrator.delete_result(id).await {
            print_error(&format!("Failed to delete result {}: {}", id, e));
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("Failed to delete {} result(s)", failed);
    }

    Ok(())
}

/// Execute the rate command
pub async fn rate_command(orchestrator: &Orchestrator, id: &str, rating: u8) -> Result<()> {
    orchestrator.rate_result(id, rating).await?;
    print_success(&format!("Rated {} with {} star(s)", id, rating));
    Ok(())
}

/// Execute the favorite command
pub async fn favorite_command(
    orchestrator: &Orchestrator,
    id: &str,
    favorite: bool,
) -> Result<()> {
    orchestrator.set_favorite(id, favorite).await?;
    if favorite {
        print_success(&format!("Marked {} as favorite", id));
    } else {
        print_success(&format!("Removed {} from favorites", id));
    }
    Ok(())
}

/// Execute the download command
///
/// `output` may name a file or an existing directory; by default the
/// server-provided filename is used in the current directory.
pub async fn download_command(
    orchestrator: &Orchestrator,
    id: &str,
    output: Option<&Path>,
) -> Result<PathBuf> {
    let download = orchestrator.download_result(id).await?;
    let path = download_target(output, &download.filename);

    tokio::fs::write(&path, &download.bytes)
        .await
        .with_context(|| format!("Failed to write image to {:?}", path))?;

    print_success(&format!(
        "Saved {} ({} bytes) to {}",
        id,
        download.bytes.len(),
        path.display()
    ));
    Ok(path)
}

fn download_target(output: Option<&Path>, filename: &str) -> PathBuf {
    // The name comes from a response header; keep only its last component
    let filename = Path::new(filename)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("image.png"));

    match output {
        Some(path) if path.is_dir() => path.join(filename),
        Some(path) => path.to_path_buf(),
        None => filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_target() {
        assert_eq!(download_target(None, "r1.png"), PathBuf::from("r1.png"));
        assert_eq!(
            download_target(Some(Path::new("out/cat.png")), "r1.png"),
            PathBuf::from("out/cat.png")
        );

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            download_target(Some(dir.path()), "r1.png"),
            dir.path().join("r1.png")
        );
    }

    #[test]
    fn test_download_target_strips_directories_from_header_name() {
        assert_eq!(
            download_target(None, "../../etc/passwd"),
            PathBuf::from("passwd")
        );
        assert_eq!(download_target(None, ".."), PathBuf::from("image.png"));
    }

    #[test]
    fn test_results_filter_from_args() {
        let args = ResultsArgs {
            limit: 10,
            search: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(!args.filter().is_active());

        let args = ResultsArgs {
            limit: 10,
            search: Some("cat".to_string()),
            favorites: true,
            long: false,
        };
        let filter = args.filter();
        assert_eq!(filter.search.as_deref(), Some("cat"));
        assert!(filter.favorites_only);
    }
}
