use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::data::{GeneratedTestFragment, OutputMapping};

/// Written once at the top of every generated test file.
pub const PYTEST_PREAMBLE: &str = "import os
import sys

import pytest

sys.path.insert(0, os.path.abspath(os.path.join(os.path.dirname(__file__), \"..\")))
";

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    // An unterminated fence (truncated model output) runs to the end.
    Regex::new(r"(?s)```[^\n`]*\n(.*?)(?:```|\z)").expect("code fence pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to write {}: {source}", path.display())]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A rendered test file that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Groups fragments by destination file and writes each file whole.
pub struct ResultAggregator<'a, O: OutputMapping> {
    mapping: &'a O,
}

impl<'a, O: OutputMapping> ResultAggregator<'a, O> {
    pub fn new(mapping: &'a O) -> Self {
        Self { mapping }
    }

    /// Renders one file per destination. Destinations appear in order of
    /// their first fragment; bodies keep input order.
    pub fn render(&self, fragments: &[GeneratedTestFragment]) -> Vec<OutputFile> {
        let mut groups: Vec<(PathBuf, Vec<String>)> = Vec::new();

        for fragment in fragments {
            let body = strip_code_fences(&fragment.test_content);
            if body.is_empty() {
                warn!(
                    function = %fragment.function_name,
                    error = fragment.error.as_deref().unwrap_or("empty test content"),
                    "skipping fragment without test code"
                );
                continue;
            }

            let destination = self.mapping.resolve_test_path(Path::new(&fragment.file_path));
            match groups.iter_mut().find(|(path, _)| *path == destination) {
                Some((_, bodies)) => bodies.push(body),
                None => groups.push((destination, vec![body])),
            }
        }

        groups
            .into_iter()
            .map(|(path, bodies)| OutputFile {
                path,
                contents: format!("{}\n{}\n", PYTEST_PREAMBLE, bodies.join("\n\n")),
            })
            .collect()
    }

    /// Writes every rendered file and returns their paths.
    ///
    /// Files are not written transactionally: when one write fails, files
    /// written before it stay on disk.
    pub fn write(&self, fragments: &[GeneratedTestFragment]) -> Result<Vec<PathBuf>, AggregateError> {
        let mut written = Vec::new();

        for file in self.render(fragments) {
            if let Some(parent) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                self.mapping
                    .ensure_directory(parent)
                    .map_err(|source| AggregateError::FileWriteFailed {
                        path: file.path.clone(),
                        source,
                    })?;
            }

            write_whole(&file.path, &file.contents).map_err(|source| {
                AggregateError::FileWriteFailed {
                    path: file.path.clone(),
                    source,
                }
            })?;
            info!(path = %file.path.display(), "wrote test file");
            written.push(file.path);
        }

        Ok(written)
    }
}

/// Returns the body of the first fenced code block, or the trimmed text when
/// there is none.
pub fn strip_code_fences(raw: &str) -> String {
    let code = match CODE_FENCE.captures(raw) {
        Some(captures) => captures.get(1).map_or("", |m| m.as_str()),
        None => raw,
    };
    code.trim_start_matches(['\n', '\r']).trim_end().to_string()
}

/// Writes through a temp file in the same directory, then renames it into
/// place, so readers never see a partial file.
fn write_whole(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FlatLayout {
        root: PathBuf,
    }

    impl OutputMapping for FlatLayout {
        fn resolve_test_path(&self, source_file_path: &Path) -> PathBuf {
            let stem = source_file_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.root.join(format!("test_{}.py", stem))
        }

        fn ensure_directory(&self, path: &Path) -> io::Result<()> {
            fs::create_dir_all(path)
        }
    }

    fn fragment(name: &str, content: &str, file: &str) -> GeneratedTestFragment {
        GeneratedTestFragment {
            function_name: name.to_string(),
            test_content: content.to_string(),
            file_path: file.to_string(),
            error: None,
        }
    }

    #[test]
    fn test_strip_python_fence() {
        let raw = "```python\ndef test_add():\n    assert add(1, 2) == 3\n```";
        assert_eq!(strip_code_fences(raw), "def test_add():\n    assert add(1, 2) == 3");
    }

    #[test]
    fn test_strip_fence_with_surrounding_chatter() {
        let raw = "Here you go:\n\n```\ndef test_x():\n    pass\n```\nHope this helps!";
        assert_eq!(strip_code_fences(raw), "def test_x():\n    pass");
    }

    #[test]
    fn test_strip_unterminated_fence() {
        let raw = "```python\ndef test_cut():\n    assert";
        assert_eq!(strip_code_fences(raw), "def test_cut():\n    assert");
    }

    #[test]
    fn test_plain_content_is_trimmed() {
        assert_eq!(strip_code_fences("\n\ndef test_a():\n    pass\n\n"), "def test_a():\n    pass");
    }

    #[test]
    fn test_same_destination_shares_one_file() {
        let layout = FlatLayout { root: PathBuf::from("out") };
        let aggregator = ResultAggregator::new(&layout);

        let files = aggregator.render(&[
            fragment("sub", "```python\ndef test_sub():\n    pass\n```", "src/calc.py"),
            fragment("add", "def test_add():\n    pass", "src/calc.py"),
        ]);

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("out/test_calc.py"));
        let expected = format!(
            "{}\ndef test_sub():\n    pass\n\ndef test_add():\n    pass\n",
            PYTEST_PREAMBLE
        );
        assert_eq!(files[0].contents, expected);
        assert_eq!(files[0].contents.matches("import pytest").count(), 1);
    }

    #[test]
    fn test_destinations_follow_first_appearance() {
        let layout = FlatLayout { root: PathBuf::from("out") };
        let aggregator = ResultAggregator::new(&layout);

        let files = aggregator.render(&[
            fragment("b1", "def test_b1(): pass", "b.py"),
            fragment("a1", "def test_a1(): pass", "a.py"),
            fragment("b2", "def test_b2(): pass", "b.py"),
        ]);

        let paths: Vec<_> = files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("out/test_b.py"), PathBuf::from("out/test_a.py")]);
        assert!(files[0].contents.ends_with("def test_b1(): pass\n\ndef test_b2(): pass\n"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let layout = FlatLayout { root: PathBuf::from("out") };
        let aggregator = ResultAggregator::new(&layout);
        let fragments = vec![
            fragment("x", "def test_x(): pass", "m.py"),
            fragment("y", "```python\ndef test_y(): pass\n```", "m.py"),
        ];

        assert_eq!(aggregator.render(&fragments), aggregator.render(&fragments));
    }

    #[test]
    fn test_empty_fragments_are_skipped() {
        let layout = FlatLayout { root: PathBuf::from("out") };
        let aggregator = ResultAggregator::new(&layout);

        let mut failed = fragment("broken", "", "only.py");
        failed.error = Some("model timeout".to_string());

        assert!(aggregator.render(&[failed]).is_empty());
    }

    #[test]
    fn test_write_creates_directory_and_files() {
        let temp = tempfile::tempdir().unwrap();
        let layout = FlatLayout { root: temp.path().join("nested").join("tests") };
        let aggregator = ResultAggregator::new(&layout);

        let written = aggregator
            .write(&[
                fragment("f", "def test_f(): pass", "pkg/one.py"),
                fragment("g", "def test_g(): pass", "pkg/two.py"),
            ])
            .unwrap();

        assert_eq!(written.len(), 2);
        for path in &written {
            let contents = fs::read_to_string(path).unwrap();
            assert!(contents.starts_with(PYTEST_PREAMBLE));
        }
        assert!(temp.path().join("nested/tests/test_one.py").exists());
    }

    #[test]
    fn test_write_failure_reports_path() {
        let temp = tempfile::tempdir().unwrap();
        // A regular file where the output directory should be.
        let blocker = temp.path().join("blocked");
        fs::write(&blocker, "").unwrap();
        let layout = FlatLayout { root: blocker.clone() };
        let aggregator = ResultAggregator::new(&layout);

        let err = aggregator
            .write(&[fragment("f", "def test_f(): pass", "a.py")])
            .unwrap_err();

        let AggregateError::FileWriteFailed { path, .. } = err;
        assert_eq!(path, blocker.join("test_a.py"));
    }
}
