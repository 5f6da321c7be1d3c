//! Interface to the embedded test-parser library plus the inventory model it
//! produces. The fleet consumes the parser through [`TestParser`] only;
//! [`FsTestScanner`] is the thin filesystem adapter wired in by the container.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// Structured output of a parse run: files → suites → tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub files: Vec<TestFile>,
}

impl Inventory {
    pub fn test_count(&self) -> usize {
        self.files
            .iter()
            .flat_map(|file| &file.suites)
            .map(|suite| suite.tests.len())
            .sum()
    }

    /// Flattened view used by the spec-view pipeline.
    pub fn tests(&self) -> impl Iterator<Item = (&TestFile, &TestSuite, &Test)> {
        self.files.iter().flat_map(|file| {
            file.suites
                .iter()
                .flat_map(move |suite| suite.tests.iter().map(move |test| (file, suite, test)))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    pub path: String,
    pub language: String,
    pub suites: Vec<TestSuite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub tests: Vec<Test>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub name: String,
    pub line: Option<u32>,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TestStatus {
    Active,
    Skipped,
    Todo,
}

#[async_trait]
pub trait TestParser: Send + Sync {
    /// Bumped when extraction semantics change; part of the
    /// already-completed identity of an analysis.
    fn version(&self) -> i32;

    async fn parse(&self, root: &Path) -> AppResult<Inventory>;
}

const PARSER_VERSION: i32 = 1;
const MAX_FILE_BYTES: u64 = 256 * 1024;
const MAX_FILES: usize = 10_000;
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "__pycache__",
];

/// Filename-and-line-scan stand-in for the full parser library. Good enough
/// to exercise the pipeline end to end; not a test-framework parser.
#[derive(Debug, Clone, Default)]
pub struct FsTestScanner;

#[async_trait]
impl TestParser for FsTestScanner {
    fn version(&self) -> i32 {
        PARSER_VERSION
    }

    async fn parse(&self, root: &Path) -> AppResult<Inventory> {
        let root = root.to_path_buf();
        let inventory = tokio::task::spawn_blocking(move || scan_tree(&root))
            .await
            .map_err(|err| anyhow::anyhow!("parser task panicked: {err}"))??;
        Ok(inventory)
    }
}

fn scan_tree(root: &Path) -> AppResult<Inventory> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    let mut seen = 0usize;

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if file_type.is_dir() {
                if !SKIP_DIRS.contains(&name.as_str()) {
                    stack.push(path);
                }
                continue;
            }

            seen += 1;
            if seen > MAX_FILES {
                return Ok(Inventory { files });
            }

            let Some(language) = test_file_language(&name) else {
                continue;
            };
            if entry.metadata()?.len() > MAX_FILE_BYTES {
                continue;
            }

            let content = std::fs::read_to_string(&path).unwrap_or_default();
            let tests = extract_tests(language, &content);
            if tests.is_empty() {
                continue;
            }

            let rel = path
                .strip_prefix(root)
                .map(PathBuf::from)
                .unwrap_or_else(|_| path.clone());
            let suite = rel
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            files.push(TestFile {
                path: rel.to_string_lossy().into_owned(),
                language: language.to_owned(),
                suites: vec![TestSuite { name: suite, tests }],
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Inventory { files })
}

fn test_file_language(name: &str) -> Option<&'static str> {
    if name.ends_with("_test.go") {
        Some("go")
    } else if name.ends_with(".rs") {
        Some("rust")
    } else if name.ends_with(".test.ts")
        || name.ends_with(".test.js")
        || name.ends_with(".spec.ts")
        || name.ends_with(".spec.js")
    {
        Some("javascript")
    } else if (name.starts_with("test_") || name.ends_with("_test.py")) && name.ends_with(".py") {
        Some("python")
    } else if name.ends_with("_spec.rb") {
        Some("ruby")
    } else {
        None
    }
}

fn extract_tests(language: &str, content: &str) -> Vec<Test> {
    let mut tests = Vec::new();
    let mut pending_rust_attr: Option<u32> = None;

    for (idx, line) in content.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let trimmed = line.trim();
        match language {
            "rust" => {
                if trimmed.starts_with("#[test]")
                    || trimmed.starts_with("#[tokio::test")
                    || trimmed.starts_with("#[rstest")
                {
                    pending_rust_attr = Some(line_no);
                } else if let Some(attr_line) = pending_rust_attr {
                    if let Some(name) = fn_name(trimmed) {
                        tests.push(Test {
                            name,
                            line: Some(attr_line),
                            status: TestStatus::Active,
                        });
                        pending_rust_attr = None;
                    } else if trimmed.starts_with("#[ignore") {
                        // attribute stack continues; the fn is still a test
                    } else if !trimmed.starts_with("#[") && !trimmed.is_empty() {
                        pending_rust_attr = None;
                    }
                }
            }
            "go" => {
                if let Some(rest) = trimmed.strip_prefix("func Test") {
                    if let Some(name) = rest.split('(').next() {
                        if !name.is_empty() {
                            tests.push(Test {
                                name: format!("Test{name}"),
                                line: Some(line_no),
                                status: TestStatus::Active,
                            });
                        }
                    }
                }
            }
            "javascript" => {
                for (prefix, status) in [
                    ("it.skip(", TestStatus::Skipped),
                    ("test.skip(", TestStatus::Skipped),
                    ("xit(", TestStatus::Skipped),
                    ("it.todo(", TestStatus::Todo),
                    ("test.todo(", TestStatus::Todo),
                    ("it(", TestStatus::Active),
                    ("test(", TestStatus::Active),
                ] {
                    if let Some(name) = quoted_arg(trimmed, prefix) {
                        tests.push(Test {
                            name,
                            line: Some(line_no),
                            status,
                        });
                        break;
                    }
                }
            }
            "python" => {
                if let Some(rest) = trimmed.strip_prefix("def test_") {
                    if let Some(name) = rest.split('(').next() {
                        tests.push(Test {
                            name: format!("test_{name}"),
                            line: Some(line_no),
                            status: TestStatus::Active,
                        });
                    }
                }
            }
            "ruby" => {
                if let Some(name) =
                    quoted_arg(trimmed, "it ").or_else(|| quoted_arg(trimmed, "it("))
                {
                    tests.push(Test {
                        name,
                        line: Some(line_no),
                        status: TestStatus::Active,
                    });
                }
            }
            _ => {}
        }
    }

    tests
}

fn fn_name(line: &str) -> Option<String> {
    let rest = line
        .strip_prefix("async fn ")
        .or_else(|| line.strip_prefix("fn "))
        .or_else(|| line.strip_prefix("pub fn "))
        .or_else(|| line.strip_prefix("pub async fn "))?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

/// Extracts the first quoted argument after `prefix`, e.g.
/// `it("does the thing", ...)` → `does the thing`.
fn quoted_arg(line: &str, prefix: &str) -> Option<String> {
    let rest = line.strip_prefix(prefix)?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    let name = &body[..end];
    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("queue_test.go", Some("go"))]
    #[case("store.rs", Some("rust"))]
    #[case("widget.test.ts", Some("javascript"))]
    #[case("widget.spec.js", Some("javascript"))]
    #[case("test_decay.py", Some("python"))]
    #[case("decay_test.py", Some("python"))]
    #[case("scheduler_spec.rb", Some("ruby"))]
    #[case("main.go", None)]
    #[case("readme.md", None)]
    fn detects_test_files(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(test_file_language(name), expected);
    }

    #[test]
    fn extracts_go_tests() {
        let content = "package q\n\nfunc TestClaimSkipsLocked(t *testing.T) {}\nfunc helper() {}\n";
        let tests = extract_tests("go", content);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "TestClaimSkipsLocked");
        assert_eq!(tests[0].line, Some(3));
    }

    #[test]
    fn extracts_rust_tests_with_attributes() {
        let content = r#"
fn helper() {}

#[test]
fn claims_one_job() {}

#[tokio::test]
async fn drains_on_stop() {}
"#;
        let tests = extract_tests("rust", content);
        let names: Vec<_> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["claims_one_job", "drains_on_stop"]);
    }

    #[test]
    fn extracts_js_tests_with_status() {
        let content = r#"
it("enqueues once", () => {});
it.skip("flaky path", () => {});
test.todo("cover retries");
"#;
        let tests = extract_tests("javascript", content);
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[0].status, TestStatus::Active);
        assert_eq!(tests[1].status, TestStatus::Skipped);
        assert_eq!(tests[2].status, TestStatus::Todo);
        assert_eq!(tests[1].name, "flaky path");
    }

    #[tokio::test]
    async fn scans_a_tree_and_counts_tests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(
            dir.path().join("pkg/queue_test.go"),
            "func TestA(t *testing.T) {}\nfunc TestB(t *testing.T) {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.md"), "no tests here").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        std::fs::write(
            dir.path().join("node_modules/dep/x.test.js"),
            "it(\"ignored\", () => {});\n",
        )
        .unwrap();

        let scanner = FsTestScanner;
        let inventory = scanner.parse(dir.path()).await.unwrap();
        assert_eq!(inventory.files.len(), 1);
        assert_eq!(inventory.test_count(), 2);
        assert_eq!(inventory.files[0].language, "go");
    }
}
