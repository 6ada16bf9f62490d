//! Local file system queries used by the directory picker.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};

use crate::util::{expand_tilde, home_dir};

use super::routes::AppState;
use super::types::{FsEntry, HomeResponse, PathQuery};

pub async fn home(State(_state): State<Arc<AppState>>) -> Json<HomeResponse> {
    Json(HomeResponse { path: home_dir() })
}

/// List a directory: hidden entries skipped, directories first, then names
/// in case-insensitive order.
pub async fn list(
    State(_state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Vec<FsEntry>>, (StatusCode, String)> {
    let raw = q.path.unwrap_or_else(home_dir);
    let path = expand_tilde(&raw);
    if !path.is_dir() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Not a directory: {}", path.display()),
        ));
    }
    let entries = list_directory(&path)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(entries))
}

async fn list_directory(path: &std::path::Path) -> std::io::Result<Vec<FsEntry>> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;

    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        // Follows symlinks, so a link to a directory lists as a directory.
        let is_dir = match tokio::fs::metadata(entry.path()).await {
            Ok(m) => m.is_dir(),
            Err(_) => false,
        };
        entries.push(FsEntry {
            name,
            path: entry.path().to_string_lossy().to_string(),
            is_dir,
        });
    }

    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_orders_dirs_first_and_hides_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        std::fs::create_dir(dir.path().join("Alpha")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("A.md"), "").unwrap();
        std::fs::write(dir.path().join(".env"), "").unwrap();

        let names: Vec<_> = list_directory(dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Alpha".to_string(), true),
                ("zeta".to_string(), true),
                ("A.md".to_string(), false),
                ("b.txt".to_string(), false),
            ]
        );
    }
}
