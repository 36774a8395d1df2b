//! Document formats and the format pair a cache tracks.
//!
//! Classification is always *declared*: by the caller, or by the extension of
//! the file name the caller supplied. Content is only hashed, never used to
//! decide which side of a pair a blob belongs to. [`Format::matches_magic`]
//! exists so the pipeline can log a warning when a declaration looks wrong,
//! but the declaration still wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A concrete document format, identified by its canonical file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Doc,
    Docx,
    Odt,
    Rtf,
    Xls,
    Xlsx,
    Ods,
    Ppt,
    Pptx,
    Odp,
    Pdf,
    Mp4,
    Mp3,
}

impl Format {
    pub const ALL: [Format; 13] = [
        Format::Doc,
        Format::Docx,
        Format::Odt,
        Format::Rtf,
        Format::Xls,
        Format::Xlsx,
        Format::Ods,
        Format::Ppt,
        Format::Pptx,
        Format::Odp,
        Format::Pdf,
        Format::Mp4,
        Format::Mp3,
    ];

    /// Canonical extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Doc => "doc",
            Format::Docx => "docx",
            Format::Odt => "odt",
            Format::Rtf => "rtf",
            Format::Xls => "xls",
            Format::Xlsx => "xlsx",
            Format::Ods => "ods",
            Format::Ppt => "ppt",
            Format::Pptx => "pptx",
            Format::Odp => "odp",
            Format::Pdf => "pdf",
            Format::Mp4 => "mp4",
            Format::Mp3 => "mp3",
        }
    }

    /// MIME type used for attachments and HTTP bodies.
    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Doc => "application/msword",
            Format::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Format::Odt => "application/vnd.oasis.opendocument.text",
            Format::Rtf => "application/rtf",
            Format::Xls => "application/vnd.ms-excel",
            Format::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Format::Ods => "application/vnd.oasis.opendocument.spreadsheet",
            Format::Ppt => "application/vnd.ms-powerpoint",
            Format::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            Format::Odp => "application/vnd.oasis.opendocument.presentation",
            Format::Pdf => "application/pdf",
            Format::Mp4 => "video/mp4",
            Format::Mp3 => "audio/mpeg",
        }
    }

    /// Infer a format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: impl AsRef<Path>) -> Option<Self> {
        let ext = name.as_ref().extension()?.to_str()?;
        ext.parse().ok()
    }

    /// Loose magic-byte check. Advisory only.
    pub fn matches_magic(self, bytes: &[u8]) -> bool {
        const ZIP: &[u8] = b"PK\x03\x04";
        const OLE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
        match self {
            Format::Pdf => bytes.starts_with(b"%PDF"),
            Format::Docx
            | Format::Xlsx
            | Format::Pptx
            | Format::Odt
            | Format::Ods
            | Format::Odp => bytes.starts_with(ZIP),
            Format::Doc | Format::Xls | Format::Ppt => bytes.starts_with(OLE),
            Format::Rtf => bytes.starts_with(b"{\\rtf"),
            Format::Mp4 => bytes.len() >= 8 && &bytes[4..8] == b"ftyp",
            Format::Mp3 => {
                bytes.starts_with(b"ID3")
                    || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
            }
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Error returned for an unknown format name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown format '{0}' (expected one of: doc, docx, odt, rtf, xls, xlsx, ods, ppt, pptx, odp, pdf, mp4, mp3)")]
pub struct UnknownFormat(pub String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().trim_start_matches('.').to_ascii_lowercase();
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.extension() == lower)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

/// Which side of a [`FormatPair`] a blob sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// The two formats a conversion store tracks: every record holds one blob of
/// each. Format A is the "original" family (office by default), format B its
/// converted counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPair {
    pub a: Format,
    pub b: Format,
}

impl Default for FormatPair {
    fn default() -> Self {
        Self {
            a: Format::Docx,
            b: Format::Pdf,
        }
    }
}

impl FormatPair {
    pub fn new(a: Format, b: Format) -> Self {
        Self { a, b }
    }

    /// Side `format` occupies, if it is part of the pair.
    pub fn side_of(&self, format: Format) -> Option<Side> {
        if format == self.a {
            Some(Side::A)
        } else if format == self.b {
            Some(Side::B)
        } else {
            None
        }
    }

    pub fn format_of(&self, side: Side) -> Format {
        match side {
            Side::A => self.a,
            Side::B => self.b,
        }
    }

    /// The side the source sits on when `source → target` crosses the pair,
    /// or `None` when the request does not fit this pair.
    pub fn classify(&self, source: Format, target: Format) -> Option<Side> {
        let side = self.side_of(source)?;
        (self.format_of(side.other()) == target).then_some(side)
    }
}

impl fmt::Display for FormatPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ⇄ {}", self.a, self.b)
    }
}

impl FromStr for FormatPair {
    type Err = UnknownFormat;

    /// Parse `"docx:pdf"` (also accepts `,` or `/` as separator).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once([':', ',', '/'])
            .ok_or_else(|| UnknownFormat(s.to_string()))?;
        Ok(FormatPair::new(a.parse()?, b.parse()?))
    }
}
