//! Mapping request paths onto the output directory.
//!
//! Pages are written either as `name.html` or `name/index.html`. A request
//! is served from whichever exists, redirecting so that `name/` always means
//! `name/index.html` and `name` always means `name.html`.

use std::borrow::Cow;
use std::path::Path;

use percent_encoding::percent_decode_str;

/// How to answer a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve the file at this URL path, relative to the output directory
    Serve(String),

    /// Redirect (302) to this location, base dir included
    Redirect(String),

    /// The path is not under the base dir
    OutsideBase,
}

/// Normalize a configured base dir: leading `/` unless empty, no trailing `/`.
pub fn normalize_base_dir(base_dir: &str) -> String {
    let trimmed = base_dir.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Decide how to answer a request for `path` (without query) under `root`.
pub fn resolve(root: &Path, base_dir: &str, path: &str, query: Option<&str>) -> Resolution {
    let Some(filepath) = strip_base(base_dir, path) else {
        return Resolution::OutsideBase;
    };

    let redirect = |target: &str| {
        let mut location = format!("{}{}", base_dir, target);
        if let Some(query) = query {
            location.push('?');
            location.push_str(query);
        }
        Resolution::Redirect(location)
    };

    if let Some(dir) = filepath.strip_suffix('/') {
        let index = format!("{}index.html", filepath);
        if exists(root, &index) {
            return Resolution::Serve(index);
        }

        if !dir.is_empty() {
            let page = with_html_extension(dir);
            if exists(root, &page) {
                return redirect(dir);
            }
        }
    } else {
        let page = with_html_extension(filepath);
        if exists(root, &page) {
            return Resolution::Serve(page.into_owned());
        }

        if exists(root, &format!("{}/index.html", filepath)) {
            return redirect(&format!("{}/", filepath));
        }
    }

    Resolution::Serve(filepath.to_string())
}

/// The path with the base dir removed, or None if outside it.
fn strip_base<'a>(base_dir: &str, path: &'a str) -> Option<&'a str> {
    if base_dir.is_empty() {
        return Some(path);
    }

    let rest = path.strip_prefix(base_dir)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Append `.html` when the last segment has no extension.
fn with_html_extension(path: &str) -> Cow<'_, str> {
    let last = path.rsplit('/').next().unwrap_or(path);
    if Path::new(last).extension().is_some() {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("{}.html", path))
    }
}

/// Whether the URL path names a file under `root`.
fn exists(root: &Path, url_path: &str) -> bool {
    let decoded = percent_decode_str(url_path).decode_utf8_lossy();
    if decoded.split(['/', '\\']).any(|segment| segment == "..") {
        return false;
    }
    root.join(decoded.trim_start_matches('/')).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn site() -> TempDir {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("index.html"), "home").unwrap();
        fs::write(root.join("contact.html"), "contact").unwrap();
        fs::create_dir_all(root.join("about")).unwrap();
        fs::write(root.join("about/index.html"), "about").unwrap();
        fs::create_dir_all(root.join("static/styles")).unwrap();
        fs::write(root.join("static/styles/site.css"), "").unwrap();
        fs::write(root.join("hello world.html"), "spaces").unwrap();
        temp
    }

    #[test]
    fn normalizes_base_dir() {
        assert_eq!(normalize_base_dir(""), "");
        assert_eq!(normalize_base_dir("/"), "");
        assert_eq!(normalize_base_dir("blog"), "/blog");
        assert_eq!(normalize_base_dir("/blog/"), "/blog");
        assert_eq!(normalize_base_dir("/docs/v2"), "/docs/v2");
    }

    #[test]
    fn serves_root_index() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/", None),
            Resolution::Serve("/index.html".into())
        );
    }

    #[test]
    fn serves_directory_index_with_trailing_slash() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/about/", None),
            Resolution::Serve("/about/index.html".into())
        );
    }

    #[test]
    fn redirects_directory_without_trailing_slash() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/about", None),
            Resolution::Redirect("/about/".into())
        );
    }

    #[test]
    fn serves_page_without_extension() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/contact", None),
            Resolution::Serve("/contact.html".into())
        );
    }

    #[test]
    fn redirects_page_with_trailing_slash() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/contact/", Some("ref=nav")),
            Resolution::Redirect("/contact?ref=nav".into())
        );
    }

    #[test]
    fn serves_assets_as_is() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/static/styles/site.css", None),
            Resolution::Serve("/static/styles/site.css".into())
        );
    }

    #[test]
    fn missing_paths_fall_through() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/missing", None),
            Resolution::Serve("/missing".into())
        );
        assert_eq!(
            resolve(temp.path(), "", "/missing/", None),
            Resolution::Serve("/missing/".into())
        );
    }

    #[test]
    fn decodes_percent_escapes() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/hello%20world", None),
            Resolution::Serve("/hello%20world.html".into())
        );
    }

    #[test]
    fn never_resolves_parent_segments() {
        let temp = site();
        assert_eq!(
            resolve(temp.path(), "", "/about/../contact", None),
            Resolution::Serve("/about/../contact".into())
        );
        assert_eq!(
            resolve(temp.path(), "", "/about/%2e%2e/contact", None),
            Resolution::Serve("/about/%2e%2e/contact".into())
        );
    }

    #[test]
    fn applies_base_dir() {
        let temp = site();
        let root = temp.path();

        assert_eq!(resolve(root, "/blog", "/other", None), Resolution::OutsideBase);
        assert_eq!(resolve(root, "/blog", "/blogger", None), Resolution::OutsideBase);
        assert_eq!(
            resolve(root, "/blog", "/blog", None),
            Resolution::Serve("/index.html".into())
        );
        assert_eq!(
            resolve(root, "/blog", "/blog/contact", None),
            Resolution::Serve("/contact.html".into())
        );
        assert_eq!(
            resolve(root, "/blog", "/blog/about", None),
            Resolution::Redirect("/blog/about/".into())
        );
        assert_eq!(
            resolve(root, "/blog", "/blog/contact/", None),
            Resolution::Redirect("/blog/contact".into())
        );
    }
}
