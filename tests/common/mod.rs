#![allow(dead_code)]

use async_trait::async_trait;
use media_sweep::tools::{Invocation, ToolError, ToolOutput, ToolRunner};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub const JPEG_MAGIC: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// JPEG-looking bytes of exactly `len` bytes.
pub fn jpeg_bytes(len: usize, seed: u8) -> Vec<u8> {
    let mut bytes = JPEG_MAGIC.to_vec();
    bytes.extend((0..len.saturating_sub(JPEG_MAGIC.len())).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)));
    bytes
}

/// In-process stand-in for the external tools. Archives are "expanded" from
/// fixtures registered by file name; every other tool acts on the
/// filesystem the way the real one would.
#[derive(Default)]
pub struct FakeToolbox {
    available: HashSet<String>,
    fixtures: HashMap<String, Vec<(PathBuf, Vec<u8>)>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeToolbox {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            available: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self::with_tools(&["zip", "unzip", "magick", "exiftool"])
    }

    /// Contents that appear when the archive named `name` is expanded.
    pub fn archive(mut self, name: &str, entries: Vec<(&str, Vec<u8>)>) -> Self {
        self.fixtures.insert(
            name.to_string(),
            entries.into_iter().map(|(p, b)| (PathBuf::from(p), b)).collect(),
        );
        self
    }

    /// Makes every invocation of `tool` exit with status 1.
    pub fn failing(mut self, tool: &str) -> Self {
        self.failing.insert(tool.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.program.clone())
            .collect()
    }

    fn fail(tool: &str, stderr: &str) -> ToolError {
        ToolError::Failed {
            tool: tool.to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn run(&self, inv: &Invocation) -> Result<ToolOutput, ToolError> {
        let args: Vec<PathBuf> = inv.args.iter().map(PathBuf::from).collect();
        let io = |e: std::io::Error| Self::fail(&inv.program, &e.to_string());
        match inv.program.as_str() {
            "zip" => {
                let archive = inv.cwd.clone().unwrap_or_default().join(&args[3]);
                fs::write(&archive, b"PK\x05\x06 fake archive").map_err(io)?;
            }
            "unzip" => {
                let archive = &args[2];
                let dir = &args[4];
                let name = archive.file_name().unwrap().to_string_lossy().into_owned();
                let entries = self
                    .fixtures
                    .get(&name)
                    .ok_or_else(|| Self::fail("unzip", "End-of-central-directory signature not found"))?;
                for (path, bytes) in entries {
                    let target = dir.join(path);
                    fs::create_dir_all(target.parent().unwrap()).map_err(io)?;
                    fs::write(target, bytes).map_err(io)?;
                }
            }
            "magick" | "convert" => {
                let mut bytes = PNG_MAGIC.to_vec();
                bytes.extend(fs::read(&args[0]).map_err(io)?);
                fs::write(&args[1], bytes).map_err(io)?;
            }
            "exiftool" => {
                return Ok(ToolOutput {
                    status_code: Some(0),
                    stdout: "    1 directories scanned\n    1 image files updated\n".into(),
                    stderr: String::new(),
                });
            }
            other => return Err(ToolError::NotFound { tool: other.to_string() }),
        }
        Ok(ToolOutput {
            status_code: Some(0),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ToolRunner for FakeToolbox {
    fn is_available(&self, tool: &str) -> bool {
        self.available.contains(tool)
    }

    async fn invoke(&self, invocation: Invocation) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if self.failing.contains(&invocation.program) {
            return Err(Self::fail(&invocation.program, "simulated failure"));
        }
        self.run(&invocation)
    }
}

/// Every regular file under `dir`, relative to it, with its bytes.
pub fn snapshot_tree(dir: &std::path::Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(dir).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}
