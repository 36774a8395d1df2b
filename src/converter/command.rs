//! Local-executable converter.
//!
//! The input is written to a private `TempDir` as `input.<source ext>`, the
//! program is run with an argument template, and the result is read back
//! from `<tempdir>/out/input.<target ext>`. The directory is removed when the
//! call returns or is cancelled.
//!
//! Argument placeholders:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{input}`   | path of the written input file |
//! | `{outdir}`  | directory the tool must write into |
//! | `{output}`  | full expected output path (for tools that take one) |
//! | `{source}`  | source extension, e.g. `docx` |
//! | `{target}`  | target extension, e.g. `pdf` |

use super::{tail, Converter};
use crate::error::ToolError;
use crate::format::Format;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// Converter backed by a local program.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    /// `program` is looked up on `PATH` unless it is a path.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Headless LibreOffice: office ⇄ PDF.
    pub fn libreoffice() -> Self {
        Self::new(
            "soffice",
            ["--headless", "--convert-to", "{target}", "--outdir", "{outdir}", "{input}"]
                .map(String::from)
                .to_vec(),
        )
    }

    /// Parse a whitespace-separated argument template.
    pub fn with_arg_template(program: impl Into<String>, template: &str) -> Self {
        Self::new(program, template.split_whitespace().map(String::from).collect())
    }

    fn render_args(
        &self,
        input: &Path,
        outdir: &Path,
        output: &Path,
        source: Format,
        target: Format,
    ) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{outdir}", &outdir.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{source}", source.extension())
                    .replace("{target}", target.extension())
            })
            .collect()
    }

    fn io_err(&self, source: std::io::Error) -> ToolError {
        ToolError::Io {
            tool: self.program.clone(),
            source,
        }
    }

    fn failed(&self, detail: impl Into<String>) -> ToolError {
        ToolError::Failed {
            tool: self.program.clone(),
            detail: detail.into(),
        }
    }

    /// Find the produced file: the expected name first, then any single file
    /// with the target extension (some tools keep their own naming).
    async fn locate_output(
        &self,
        outdir: &Path,
        expected: &Path,
        target: Format,
    ) -> Result<PathBuf, ToolError> {
        if tokio::fs::try_exists(expected).await.unwrap_or(false) {
            return Ok(expected.to_path_buf());
        }

        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(outdir).await.map_err(|e| self.io_err(e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_err(e))? {
            let path = entry.path();
            if Format::from_file_name(&path) == Some(target) {
                candidates.push(path);
            }
        }

        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(self.failed(format!("produced no .{} output", target.extension()))),
            n => Err(self.failed(format!(
                "produced {n} .{} files; cannot tell which is the result",
                target.extension()
            ))),
        }
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn convert(
        &self,
        input: Bytes,
        source: Format,
        target: Format,
        timeout: Duration,
    ) -> Result<Bytes, ToolError> {
        let workdir = TempDir::new().map_err(|e| self.io_err(e))?;
        let input_path = workdir.path().join(format!("input.{}", source.extension()));
        let outdir = workdir.path().join("out");
        let expected = outdir.join(format!("input.{}", target.extension()));

        tokio::fs::write(&input_path, &input)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::create_dir_all(&outdir)
            .await
            .map_err(|e| self.io_err(e))?;

        let args = self.render_args(&input_path, &outdir, &expected, source, target);
        info!("Running {} for {} → {}", self.program, source, target);
        debug!("{} {:?}", self.program, args);

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    self.failed(format!("program '{}' not found on PATH", self.program))
                } else {
                    self.io_err(e)
                }
            })?;

        // Dropping `child` on timeout kills the process (kill_on_drop).
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.io_err(e))?,
            Err(_) => {
                return Err(ToolError::TimedOut {
                    tool: self.program.clone(),
                    secs: timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(self.failed(format!("exit status {code}: {}", tail(&stderr, 500))));
        }

        let produced = self.locate_output(&outdir, &expected, target).await?;
        let bytes = tokio::fs::read(&produced)
            .await
            .map_err(|e| self.io_err(e))?;

        if bytes.is_empty() {
            return Err(self.failed(format!("wrote an empty {}", produced.display())));
        }

        debug!("{} produced {} bytes", self.program, bytes.len());
        Ok(Bytes::from(bytes))
    }
}
