use std::path::{Component, Path, PathBuf};

use conclave_types::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    pub allow_hidden: bool,
    /// Lowercased extensions without the dot. `None` allows any.
    pub allowed_extensions: Option<Vec<String>>,
}

/// Validate an untrusted path against a set of allowed roots.
///
/// Fail-closed: any ambiguity (null bytes, traversal components, escape via
/// symlink, unresolvable root) is rejected. The hidden-entry and extension
/// policies apply to the path relative to its allowed root. The returned
/// path is the real (symlink-resolved) location.
pub fn validate_path(input: &str, allowed_roots: &[PathBuf], policy: &PathPolicy) -> Result<PathBuf> {
    if input.is_empty() {
        return Err(Error::InvalidInput("empty path".to_string()));
    }
    if input.contains('\0') {
        return Err(Error::InvalidInput("path contains null byte".to_string()));
    }
    let candidate = Path::new(input);
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(Error::InvalidInput(
            "path traversal is not allowed".to_string(),
        ));
    }

    if let Some(allowed) = &policy.allowed_extensions {
        let extension = candidate
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        match extension {
            Some(ext) if allowed.iter().any(|a| a == &ext) => {}
            _ => {
                return Err(Error::Forbidden(format!(
                    "extension not permitted for `{input}`"
                )))
            }
        }
    }

    let resolved = resolve_real_path(candidate)?;
    for root in allowed_roots {
        let Ok(real_root) = root.canonicalize() else {
            continue;
        };
        let Ok(relative) = resolved.strip_prefix(&real_root) else {
            continue;
        };
        if !policy.allow_hidden {
            for component in relative.components() {
                if let Component::Normal(part) = component {
                    let part = part.to_string_lossy();
                    if part.starts_with('.') {
                        return Err(Error::Forbidden(format!(
                            "hidden entry `{part}` rejected"
                        )));
                    }
                }
            }
        }
        return Ok(resolved);
    }
    Err(Error::Forbidden(format!(
        "`{input}` is outside the allowed roots"
    )))
}

/// Canonicalize, tolerating a not-yet-created final component by resolving
/// its parent instead.
fn resolve_real_path(path: &Path) -> Result<PathBuf> {
    if let Ok(real) = path.canonicalize() {
        return Ok(real);
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("cannot resolve `{}`", path.display())))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("cannot resolve `{}`", path.display())))?;
    let real_parent = parent
        .canonicalize()
        .map_err(|_| Error::InvalidInput(format!("cannot resolve `{}`", path.display())))?;
    Ok(real_parent.join(file_name))
}
