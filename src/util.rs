//! Shared utility functions used across the codebase.

use std::path::PathBuf;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Return the value of `$HOME`, falling back to `/root`.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

/// Expand a leading `~` or `~/` to the home directory.
///
/// `~user` forms are left untouched.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return PathBuf::from(home_dir());
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        return PathBuf::from(home_dir()).join(rest);
    }
    PathBuf::from(trimmed)
}

/// Resolve an optional working directory, expanding `~` and checking that it
/// exists. `None` and blank strings resolve to `None` (inherit the cwd).
pub fn resolve_working_dir(dir: Option<&str>) -> Result<Option<PathBuf>, PathBuf> {
    let Some(raw) = dir.filter(|d| !d.trim().is_empty()) else {
        return Ok(None);
    };
    let path = expand_tilde(raw);
    if path.is_dir() {
        Ok(Some(path))
    } else {
        Err(path)
    }
}

/// Keep only the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

/// Sanitize a string for use as a filename.
pub fn sanitize_filename(value: &str) -> String {
    let out: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "default".to_string()
    } else {
        out
    }
}

/// Shorten a line for log output.
pub fn preview(line: &str, max: usize) -> String {
    if line.chars().count() > max {
        let head: String = line.chars().take(max).collect();
        format!("{}...", head)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_handles_home_forms() {
        let home = PathBuf::from(home_dir());
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/projects/app"), home.join("projects/app"));
        assert_eq!(expand_tilde("/tmp"), PathBuf::from("/tmp"));
        assert_eq!(expand_tilde("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn resolve_working_dir_rejects_missing_directory() {
        assert_eq!(resolve_working_dir(None), Ok(None));
        assert_eq!(resolve_working_dir(Some("   ")), Ok(None));
        assert_eq!(
            resolve_working_dir(Some("/tmp")),
            Ok(Some(PathBuf::from("/tmp")))
        );
        assert!(resolve_working_dir(Some("/definitely/not/a/dir/here")).is_err());
    }

    #[test]
    fn tail_chars_keeps_the_end() {
        assert_eq!(tail_chars("hello", 10), "hello");
        assert_eq!(tail_chars("hello world", 5), "world");
        // Multi-byte characters are counted as characters, not bytes.
        assert_eq!(tail_chars("ééééé", 2), "éé");
    }

    #[test]
    fn sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("conv-1_a"), "conv-1_a");
        assert_eq!(sanitize_filename("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_filename(""), "default");
    }

    #[test]
    fn preview_truncates_long_lines() {
        assert_eq!(preview("abc", 5), "abc");
        assert_eq!(preview("abcdefgh", 3), "abc...");
    }
}
