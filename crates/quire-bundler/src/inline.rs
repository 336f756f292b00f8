//! Inline script handling.
//!
//! Files named `*.inline.ts` are browser scripts that the site builder embeds
//! verbatim into pages. Their `export` statements only exist so editors can
//! type-check them, so they are stripped before the file is bundled on its
//! own as a minified browser script. Wherever the site builder imports the
//! file, by its path or through `@inline/<stem>`, it gets that script as a
//! string.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::context::BundlerError;

/// File name suffixes marking an inline script.
pub const INLINE_SUFFIXES: [&str; 2] = [".inline.ts", ".inline.js"];

/// Import specifier prefix naming an inline script by its stem.
pub const INLINE_SPECIFIER_PREFIX: &str = "@inline/";

/// Directories never scanned for inline scripts.
const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".git"];

/// Remove export syntax from an inline script.
///
/// `export default <expr>` keeps the expression, `export <declaration>` keeps
/// the declaration, and export lists are dropped entirely.
pub fn strip_exports(source: &str) -> String {
    static EXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r#"(?m)^[ \t]*export[ \t]*(?:type[ \t]*)?(?:\{[^}]*\}|\*(?:[ \t]*as[ \t]+\w+)?)[ \t]*(?:from[ \t]*["'][^"']*["'])?[ \t]*;?[ \t]*\r?\n?"#,
        )
        .expect("Invalid export list regex")
    });
    static EXPORT_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^([ \t]*)export[ \t]+default[ \t]+").expect("Invalid export default regex")
    });
    static EXPORT_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?m)^([ \t]*)export[ \t]+((?:declare[ \t]+)?(?:async[ \t]+)?(?:const|let|var|function|class|abstract|type|interface|enum)\b)",
        )
        .expect("Invalid export declaration regex")
    });

    let without_lists = EXPORT_LIST.replace_all(source, "");
    let without_default = EXPORT_DEFAULT.replace_all(&without_lists, "$1");
    EXPORT_DECLARATION
        .replace_all(&without_default, "$1$2")
        .into_owned()
}

/// The `@inline/<stem>` specifier for an inline script path.
pub fn specifier_for(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    INLINE_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .map(|stem| format!("{}{}", INLINE_SPECIFIER_PREFIX, stem))
}

/// JavaScript module exporting `text` as its default export.
pub fn module_source(text: &str) -> Result<String, serde_json::Error> {
    Ok(format!("export default {};\n", serde_json::to_string(text)?))
}

/// A generated module standing in for an inline script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineModule {
    /// Original `*.inline.ts` file, canonicalized
    pub source: PathBuf,

    /// Specifier the site builder imports
    pub specifier: String,

    /// Generated module on disk
    pub generated: PathBuf,

    /// Size of the minified script
    pub bytes: usize,
}

/// Bundles inline scripts into standalone browser scripts.
#[derive(Debug, Clone)]
pub struct InlineScriptPlugin {
    bundler: PathBuf,
}

impl InlineScriptPlugin {
    /// Create a plugin that runs the given bundler executable.
    pub fn new(bundler: impl Into<PathBuf>) -> Self {
        Self {
            bundler: bundler.into(),
        }
    }

    /// Find every inline script below `source_dir`, sorted by path.
    pub fn discover(source_dir: &Path) -> Vec<PathBuf> {
        if !source_dir.exists() {
            return Vec::new();
        }

        let mut scripts: Vec<PathBuf> = WalkDir::new(source_dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_str().unwrap_or("");
                !(entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name))
            })
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| specifier_for(path).is_some())
            .collect();

        scripts.sort();
        scripts
    }

    /// Bundle every inline script and write its generated module into
    /// `cache_dir/inline`.
    pub async fn prepare(
        &self,
        root: &Path,
        source_dir: &Path,
        cache_dir: &Path,
    ) -> Result<Vec<InlineModule>, BundlerError> {
        let scripts = Self::discover(source_dir);
        if scripts.is_empty() {
            return Ok(Vec::new());
        }

        let out_dir = cache_dir.join("inline");
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| BundlerError::Io {
                path: out_dir.clone(),
                source,
            })?;

        let mut modules: Vec<InlineModule> = Vec::with_capacity(scripts.len());

        for path in scripts {
            let Some(specifier) = specifier_for(&path) else {
                continue;
            };

            if let Some(existing) = modules.iter().find(|m| m.specifier == specifier) {
                return Err(BundlerError::DuplicateInlineScript {
                    specifier,
                    first: existing.source.clone(),
                    second: path,
                });
            }

            let source = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| BundlerError::Io {
                    path: path.clone(),
                    source,
                })?;

            let minified = self
                .bundle_standalone(root, &path, &strip_exports(&source))
                .await?;

            let stem = &specifier[INLINE_SPECIFIER_PREFIX.len()..];
            let generated = out_dir.join(format!("{}.js", stem));
            let module = module_source(&minified).map_err(|e| BundlerError::InlineScript {
                path: path.clone(),
                message: e.to_string(),
            })?;

            tokio::fs::write(&generated, module)
                .await
                .map_err(|source| BundlerError::Io {
                    path: generated.clone(),
                    source,
                })?;

            tracing::debug!("Inlined {} as {}", path.display(), specifier);

            // The bundler reports loaded files by their real path
            let source = tokio::fs::canonicalize(&path).await.unwrap_or(path);
            modules.push(InlineModule {
                source,
                specifier,
                generated,
                bytes: minified.len(),
            });
        }

        Ok(modules)
    }

    /// Run the bundler on a single script fed through stdin.
    async fn bundle_standalone(
        &self,
        root: &Path,
        path: &Path,
        contents: &str,
    ) -> Result<String, BundlerError> {
        let loader = if path.extension().is_some_and(|ext| ext == "js") {
            "js"
        } else {
            "ts"
        };
        let sourcefile = path.strip_prefix(root).unwrap_or(path);
        let resolve_dir = path.parent().unwrap_or(root);

        let mut child = Command::new(&self.bundler)
            .arg("--bundle")
            .arg("--minify")
            .arg("--platform=browser")
            .arg("--format=iife")
            .arg(format!("--loader={}", loader))
            .arg(format!("--sourcefile={}", sourcefile.display()))
            .arg("--log-level=warning")
            .current_dir(resolve_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BundlerError::Spawn {
                program: self.bundler.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .await
                .map_err(|source| BundlerError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| BundlerError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(BundlerError::InlineScript {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn strips_default_export() {
        let source = "const theme = detect();\nexport default theme\n";
        assert_eq!(strip_exports(source), "const theme = detect();\ntheme\n");
    }

    #[test]
    fn strips_export_keyword_from_declarations() {
        let source = "export const a = 1;\nexport async function load() {}\n  export class Foo {}\n";
        assert_eq!(
            strip_exports(source),
            "const a = 1;\nasync function load() {}\n  class Foo {}\n"
        );
    }

    #[test]
    fn drops_export_lists() {
        let source = "const a = 1;\nexport { a };\nexport * from \"./x\";\nexport type { T } from './t'\nrun(a);\n";
        assert_eq!(strip_exports(source), "const a = 1;\nrun(a);\n");
    }

    #[test]
    fn leaves_other_code_untouched() {
        let source = "const exported = 'export default';\nfunction exportAll() {}\n";
        assert_eq!(strip_exports(source), source);
    }

    #[test]
    fn derives_specifiers() {
        assert_eq!(
            specifier_for(Path::new("quire/scripts/darkmode.inline.ts")).as_deref(),
            Some("@inline/darkmode")
        );
        assert_eq!(
            specifier_for(Path::new("spa.inline.js")).as_deref(),
            Some("@inline/spa")
        );
        assert_eq!(specifier_for(Path::new("darkmode.ts")), None);
        assert_eq!(specifier_for(Path::new(".inline.ts")), None);
    }

    #[test]
    fn generates_string_module() {
        let module = module_source("document.documentElement.dataset.theme=\"dark\"").unwrap();
        assert_eq!(
            module,
            "export default \"document.documentElement.dataset.theme=\\\"dark\\\"\";\n"
        );
    }

    #[test]
    fn discovers_inline_scripts() {
        let temp = tempdir().unwrap();
        let scripts = temp.path().join("scripts");
        let modules = temp.path().join("node_modules");
        fs::create_dir_all(&scripts).unwrap();
        fs::create_dir_all(&modules).unwrap();

        fs::write(scripts.join("spa.inline.ts"), "").unwrap();
        fs::write(scripts.join("darkmode.inline.ts"), "").unwrap();
        fs::write(scripts.join("util.ts"), "").unwrap();
        fs::write(modules.join("vendor.inline.ts"), "").unwrap();

        let found = InlineScriptPlugin::discover(temp.path());
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();

        assert_eq!(names, vec!["darkmode.inline.ts", "spa.inline.ts"]);
    }

    #[test]
    fn missing_source_dir_has_no_scripts() {
        let temp = tempdir().unwrap();
        assert!(InlineScriptPlugin::discover(&temp.path().join("missing")).is_empty());
    }

    #[cfg(unix)]
    fn echo_bundler(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-bundler.sh");
        fs::write(&path, "#!/bin/sh\ncat\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prepares_generated_modules() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        let source_dir = root.join("quire");
        let cache_dir = root.join(".quire-cache");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(
            source_dir.join("darkmode.inline.ts"),
            "export const x = 1\nexport default \"\"\n",
        )
        .unwrap();

        let plugin = InlineScriptPlugin::new(echo_bundler(root));
        let modules = plugin.prepare(root, &source_dir, &cache_dir).await.unwrap();

        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].specifier, "@inline/darkmode");

        let generated = fs::read_to_string(&modules[0].generated).unwrap();
        assert_eq!(generated, "export default \"const x = 1\\n\\\"\\\"\";\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_duplicate_stems() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        let source_dir = root.join("quire");
        fs::create_dir_all(source_dir.join("a")).unwrap();
        fs::create_dir_all(source_dir.join("b")).unwrap();
        fs::write(source_dir.join("a/spa.inline.ts"), "").unwrap();
        fs::write(source_dir.join("b/spa.inline.ts"), "").unwrap();

        let plugin = InlineScriptPlugin::new(echo_bundler(root));
        let err = plugin
            .prepare(root, &source_dir, &root.join(".quire-cache"))
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::DuplicateInlineScript { .. }));
    }
}
