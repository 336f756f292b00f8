//! Build metadata read from the bundler's metafile.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, MetaInput>,
    #[serde(default)]
    outputs: BTreeMap<String, MetaOutput>,
}

#[derive(Debug, Deserialize)]
struct MetaInput {
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct MetaOutput {
    bytes: u64,
    #[serde(default)]
    inputs: BTreeMap<String, MetaOutputInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaOutputInput {
    bytes_in_output: u64,
}

/// A single file written by the bundler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    /// Output path as reported by the bundler
    pub path: String,

    /// Size of the output file
    pub bytes: u64,

    /// Bytes each input contributed, largest first
    pub inputs: Vec<(String, u64)>,
}

/// Metadata describing one successful rebuild.
#[derive(Debug, Clone, Default)]
pub struct BuildMetadata {
    /// Output files
    pub outputs: Vec<OutputInfo>,

    /// Source size of every input
    pub inputs: BTreeMap<String, u64>,

    /// Number of inline scripts substituted
    pub inline_scripts: usize,

    /// Wall time of the rebuild
    pub duration: Duration,
}

impl BuildMetadata {
    /// Parse an esbuild metafile.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let meta: Metafile = serde_json::from_str(json)?;

        let outputs = meta
            .outputs
            .into_iter()
            .map(|(path, output)| {
                let mut inputs: Vec<(String, u64)> = output
                    .inputs
                    .into_iter()
                    .map(|(input, info)| (input, info.bytes_in_output))
                    .collect();
                inputs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

                OutputInfo {
                    path,
                    bytes: output.bytes,
                    inputs,
                }
            })
            .collect();

        let inputs = meta
            .inputs
            .into_iter()
            .map(|(path, input)| (path, input.bytes))
            .collect();

        Ok(Self {
            outputs,
            inputs,
            ..Default::default()
        })
    }

    /// Find the output entry for a file on disk.
    pub fn output_for(&self, path: &Path) -> Option<&OutputInfo> {
        let wanted = normalize(&path.to_string_lossy());
        self.outputs
            .iter()
            .find(|output| normalize(&output.path) == wanted)
    }

    /// One-line summary: "N files (size)".
    pub fn summary(&self, outfile: &Path) -> String {
        match self.output_for(outfile) {
            Some(output) => format!(
                "{} files ({})",
                output.inputs.len(),
                format_bytes(output.bytes)
            ),
            None => format!("{} files", self.inputs.len()),
        }
    }

    /// Per-output breakdown of what went into the bundle.
    pub fn analyze(&self) -> String {
        let mut report = String::new();

        for output in &self.outputs {
            report.push_str(&format!(
                "\n  {}  {}\n",
                output.path,
                format_bytes(output.bytes)
            ));

            for (input, bytes) in &output.inputs {
                let share = if output.bytes == 0 {
                    0.0
                } else {
                    *bytes as f64 * 100.0 / output.bytes as f64
                };
                report.push_str(&format!(
                    "   ├ {:<60} {:>9} {:>5.1}%\n",
                    input,
                    format_bytes(*bytes),
                    share
                ));
            }
        }

        report
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Human-readable byte size (`1.5 kB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];

    if bytes < 1000 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = next;
    }

    if value >= 100.0 {
        format!("{:.0} {}", value, unit)
    } else if value >= 10.0 {
        format!("{:.1} {}", value, unit)
    } else {
        format!("{:.2} {}", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METAFILE: &str = r#"{
        "inputs": {
            "quire/build.ts": { "bytes": 4200, "imports": [] },
            "quire/util/path.ts": { "bytes": 900, "imports": [] }
        },
        "outputs": {
            ".quire-cache/transpiled-build.mjs": {
                "bytes": 3100,
                "inputs": {
                    "quire/util/path.ts": { "bytesInOutput": 600 },
                    "quire/build.ts": { "bytesInOutput": 2500 }
                }
            }
        }
    }"#;

    #[test]
    fn parses_metafile() {
        let meta = BuildMetadata::from_json(METAFILE).unwrap();

        assert_eq!(meta.inputs.len(), 2);
        assert_eq!(meta.inputs["quire/build.ts"], 4200);
        assert_eq!(meta.outputs.len(), 1);

        let output = &meta.outputs[0];
        assert_eq!(output.bytes, 3100);
        assert_eq!(output.inputs[0], ("quire/build.ts".to_string(), 2500));
    }

    #[test]
    fn summarizes_output() {
        let meta = BuildMetadata::from_json(METAFILE).unwrap();
        let summary = meta.summary(Path::new("./.quire-cache/transpiled-build.mjs"));

        assert_eq!(summary, "2 files (3.10 kB)");
    }

    #[test]
    fn analysis_lists_largest_inputs_first() {
        let meta = BuildMetadata::from_json(METAFILE).unwrap();
        let report = meta.analyze();

        let build = report.find("quire/build.ts").unwrap();
        let path = report.find("quire/util/path.ts").unwrap();
        assert!(build < path);
        assert!(report.contains("80.6%"));
    }

    #[test]
    fn rejects_malformed_metafile() {
        assert!(BuildMetadata::from_json("{ not json").is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1500), "1.50 kB");
        assert_eq!(format_bytes(25_000), "25.0 kB");
        assert_eq!(format_bytes(3_400_000), "3.40 MB");
    }
}
