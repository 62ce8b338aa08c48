//! Content-type detection from file contents rather than file names.
//!
//! Two sniffers implement [`ContentSniffer`]:
//! - [`MagicSniffer`] matches well-known leading byte signatures in-process.
//! - [`FileCommandSniffer`] asks `file --brief --mime-type` through the
//!   [`ToolRunner`].

use crate::tools::{Invocation, ToolError, ToolRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// Content types the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Tiff,
    Heic,
    Pdf,
    Zip,
    Gzip,
    Bzip2,
    Xz,
    SevenZip,
    Rar,
    Mp4,
    Mp3,
    Text,
}

impl ContentType {
    /// Canonical file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ContentType::Jpeg => "jpg",
            ContentType::Png => "png",
            ContentType::Gif => "gif",
            ContentType::Webp => "webp",
            ContentType::Bmp => "bmp",
            ContentType::Tiff => "tif",
            ContentType::Heic => "heic",
            ContentType::Pdf => "pdf",
            ContentType::Zip => "zip",
            ContentType::Gzip => "gz",
            ContentType::Bzip2 => "bz2",
            ContentType::Xz => "xz",
            ContentType::SevenZip => "7z",
            ContentType::Rar => "rar",
            ContentType::Mp4 => "mp4",
            ContentType::Mp3 => "mp3",
            ContentType::Text => "txt",
        }
    }

    /// Whether ImageMagick can write this type.
    pub fn is_raster_image(self) -> bool {
        matches!(
            self,
            ContentType::Jpeg
                | ContentType::Png
                | ContentType::Gif
                | ContentType::Webp
                | ContentType::Bmp
                | ContentType::Tiff
                | ContentType::Heic
        )
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        let kind = match mime.as_str() {
            "image/jpeg" => ContentType::Jpeg,
            "image/png" => ContentType::Png,
            "image/gif" => ContentType::Gif,
            "image/webp" => ContentType::Webp,
            "image/bmp" | "image/x-ms-bmp" => ContentType::Bmp,
            "image/tiff" => ContentType::Tiff,
            "image/heic" | "image/heif" => ContentType::Heic,
            "application/pdf" => ContentType::Pdf,
            "application/zip" => ContentType::Zip,
            "application/gzip" | "application/x-gzip" => ContentType::Gzip,
            "application/x-bzip2" => ContentType::Bzip2,
            "application/x-xz" => ContentType::Xz,
            "application/x-7z-compressed" => ContentType::SevenZip,
            "application/x-rar" | "application/vnd.rar" | "application/x-rar-compressed" => {
                ContentType::Rar
            }
            "video/mp4" => ContentType::Mp4,
            "audio/mpeg" => ContentType::Mp3,
            other if other.starts_with("text/") => ContentType::Text,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentType::Jpeg => "jpeg",
            ContentType::SevenZip => "7z",
            other => other.extension(),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown content type `{0}`")]
pub struct UnknownContentType(pub String);

impl FromStr for ContentType {
    type Err = UnknownContentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => ContentType::Jpeg,
            "png" => ContentType::Png,
            "gif" => ContentType::Gif,
            "webp" => ContentType::Webp,
            "bmp" => ContentType::Bmp,
            "tiff" | "tif" => ContentType::Tiff,
            "heic" | "heif" => ContentType::Heic,
            "pdf" => ContentType::Pdf,
            "zip" => ContentType::Zip,
            "gzip" | "gz" => ContentType::Gzip,
            "bzip2" | "bz2" => ContentType::Bzip2,
            "xz" => ContentType::Xz,
            "7z" | "sevenzip" => ContentType::SevenZip,
            "rar" => ContentType::Rar,
            "mp4" => ContentType::Mp4,
            "mp3" => ContentType::Mp3,
            "text" | "txt" => ContentType::Text,
            other => return Err(UnknownContentType(other.to_string())),
        };
        Ok(kind)
    }
}

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Detects the content type of a file. `Ok(None)` means unrecognised.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ContentSniffer: Send + Sync {
    async fn sniff(&self, path: &Path) -> Result<Option<ContentType>, SniffError>;
}

/// Which sniffer the pipeline uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SnifferKind {
    /// Built-in leading-byte signatures.
    #[default]
    Builtin,
    /// External `file --brief --mime-type`.
    File,
}

const HEADER_LEN: usize = 8192;

/// Signature-based sniffer that reads at most the first 8 KiB of a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicSniffer;

impl MagicSniffer {
    pub fn detect(header: &[u8]) -> Option<ContentType> {
        let starts = |sig: &[u8]| header.starts_with(sig);
        if starts(&[0xFF, 0xD8, 0xFF]) {
            return Some(ContentType::Jpeg);
        }
        if starts(b"\x89PNG\r\n\x1a\n") {
            return Some(ContentType::Png);
        }
        if starts(b"GIF87a") || starts(b"GIF89a") {
            return Some(ContentType::Gif);
        }
        if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            return Some(ContentType::Webp);
        }
        if starts(b"BM") && header.len() >= 14 && header[6..10] == [0, 0, 0, 0] {
            return Some(ContentType::Bmp);
        }
        if starts(b"II*\0") || starts(b"MM\0*") {
            return Some(ContentType::Tiff);
        }
        if header.len() >= 12 && &header[4..8] == b"ftyp" {
            return match &header[8..12] {
                b"heic" | b"heix" | b"mif1" | b"msf1" | b"hevc" => Some(ContentType::Heic),
                _ => Some(ContentType::Mp4),
            };
        }
        if starts(b"%PDF-") {
            return Some(ContentType::Pdf);
        }
        if starts(b"PK\x03\x04") || starts(b"PK\x05\x06") {
            return Some(ContentType::Zip);
        }
        if starts(&[0x1F, 0x8B]) {
            return Some(ContentType::Gzip);
        }
        if starts(b"BZh") {
            return Some(ContentType::Bzip2);
        }
        if starts(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
            return Some(ContentType::Xz);
        }
        if starts(&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]) {
            return Some(ContentType::SevenZip);
        }
        if starts(b"Rar!\x1a\x07") {
            return Some(ContentType::Rar);
        }
        if starts(b"ID3") || (header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0) {
            return Some(ContentType::Mp3);
        }
        if looks_like_text(header) {
            return Some(ContentType::Text);
        }
        None
    }
}

/// Non-empty, NUL-free and valid UTF-8, allowing a sequence cut off by the
/// end of the sampled header.
fn looks_like_text(header: &[u8]) -> bool {
    if header.is_empty() || header.contains(&0) {
        return false;
    }
    match std::str::from_utf8(header) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header)?;
    Ok(header)
}

#[async_trait]
impl ContentSniffer for MagicSniffer {
    async fn sniff(&self, path: &Path) -> Result<Option<ContentType>, SniffError> {
        let io_err = |source| SniffError::Io {
            path: path.display().to_string(),
            source,
        };
        let owned = path.to_path_buf();
        let header = tokio::task::spawn_blocking(move || read_header(&owned))
            .await
            .map_err(|e| io_err(std::io::Error::other(e)))?
            .map_err(io_err)?;
        Ok(Self::detect(&header))
    }
}

/// Delegates to the `file` utility.
pub struct FileCommandSniffer {
    tools: Arc<dyn ToolRunner>,
}

impl FileCommandSniffer {
    pub const TOOL: &'static str = "file";

    pub fn new(tools: Arc<dyn ToolRunner>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl ContentSniffer for FileCommandSniffer {
    async fn sniff(&self, path: &Path) -> Result<Option<ContentType>, SniffError> {
        let output = self
            .tools
            .invoke(
                Invocation::new(Self::TOOL)
                    .args(["--brief", "--mime-type"])
                    .arg(path),
            )
            .await?;
        Ok(ContentType::from_mime(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{MockToolRunner, ToolOutput};

    #[test]
    fn detects_common_signatures() {
        assert_eq!(MagicSniffer::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ContentType::Jpeg));
        assert_eq!(MagicSniffer::detect(b"\x89PNG\r\n\x1a\nrest"), Some(ContentType::Png));
        assert_eq!(MagicSniffer::detect(b"GIF89a...."), Some(ContentType::Gif));
        assert_eq!(MagicSniffer::detect(b"RIFF\0\0\0\0WEBPVP8 "), Some(ContentType::Webp));
        assert_eq!(MagicSniffer::detect(b"\0\0\0\x18ftypheic"), Some(ContentType::Heic));
        assert_eq!(MagicSniffer::detect(b"\0\0\0\x18ftypisom"), Some(ContentType::Mp4));
        assert_eq!(MagicSniffer::detect(b"PK\x03\x04\x14\0"), Some(ContentType::Zip));
        assert_eq!(MagicSniffer::detect(b"%PDF-1.7"), Some(ContentType::Pdf));
        assert_eq!(MagicSniffer::detect(b"hello world\n"), Some(ContentType::Text));
    }

    #[test]
    fn binary_and_empty_content_is_unrecognised() {
        assert_eq!(MagicSniffer::detect(b""), None);
        assert_eq!(MagicSniffer::detect(&[0x00, 0x01, 0x02, 0x03]), None);
    }

    #[test]
    fn text_cut_mid_character_is_still_text() {
        let mut header = "héllo".as_bytes().to_vec();
        header.push(0xC3);
        assert_eq!(MagicSniffer::detect(&header), Some(ContentType::Text));
    }

    #[test]
    fn parses_type_names_and_mime_types() {
        assert_eq!("JPG".parse::<ContentType>().unwrap(), ContentType::Jpeg);
        assert_eq!("webp".parse::<ContentType>().unwrap(), ContentType::Webp);
        assert!("exe".parse::<ContentType>().is_err());
        assert_eq!(ContentType::from_mime("image/png\n"), Some(ContentType::Png));
        assert_eq!(ContentType::from_mime("text/x-shellscript"), Some(ContentType::Text));
        assert_eq!(ContentType::from_mime("application/octet-stream"), None);
        assert_eq!(ContentType::Jpeg.to_string(), "jpeg");
    }

    #[tokio::test]
    async fn magic_sniffer_reads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("photo");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE1, 0, 0]).unwrap();
        let found = MagicSniffer.sniff(&path).await.unwrap();
        assert_eq!(found, Some(ContentType::Jpeg));
        assert!(MagicSniffer.sniff(&tmp.path().join("nope")).await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn magic_sniffer_reads_off_the_async_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..16)
            .map(|i| {
                let path = tmp.path().join(format!("{i}"));
                std::fs::write(&path, b"\x89PNG\r\n\x1a\n").unwrap();
                path
            })
            .collect();
        let found = futures::future::join_all(paths.iter().map(|p| MagicSniffer.sniff(p))).await;
        assert!(found.into_iter().all(|r| r.unwrap() == Some(ContentType::Png)));
    }

    #[tokio::test]
    async fn file_command_sniffer_maps_mime_output() {
        let mut tools = MockToolRunner::new();
        tools
            .expect_invoke()
            .withf(|inv| inv.program == "file" && inv.arg_position("--mime-type").is_some())
            .returning(|_| {
                Ok(ToolOutput {
                    status_code: Some(0),
                    stdout: "image/gif\n".into(),
                    stderr: String::new(),
                })
            });
        let sniffer = FileCommandSniffer::new(Arc::new(tools));
        let found = sniffer.sniff(Path::new("/any")).await.unwrap();
        assert_eq!(found, Some(ContentType::Gif));
    }
}
