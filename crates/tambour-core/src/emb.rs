//! EMB decoder.
//!
//! Reads a header, a color table of fixed-width records, and a stream of
//! fixed-width stitch command records, all placed according to an
//! [`EmbLayout`]. Vendor extension blocks and extra header bytes are skipped
//! by length, never interpreted.
//!
//! Decoding is strict about structure (the header, and every region it
//! points at, must lie inside the input) and lenient about content: odd
//! records are clamped, skipped or repaired and reported as [`Diagnostic`]s
//! alongside the design.

use crate::error::{FormatError, Region};
use crate::layout::EmbLayout;
use crate::model::{Design, Rgb, Stitch};
use serde::Serialize;
use std::fmt;

/// Header values as declared by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbHeader {
    pub version: u16,
    pub header_len: u16,
    pub stitch_count: u32,
    pub color_count: u16,
    pub extension_count: u16,
    pub color_table_offset: u32,
    pub stitch_data_offset: u32,
    pub stitch_data_len: u32,
    pub extension_table_offset: u32,
}

/// A non-fatal problem found while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The header's stitch count disagrees with the records present.
    CountMismatch { declared: u32, actual: u32 },
    /// A record offset exceeded the format's maximum magnitude.
    ClampedOffset {
        record: usize,
        original: (i16, i16),
        clamped: (i16, i16),
    },
    /// A record with an unrecognized command byte was skipped.
    UnknownCommand { record: usize, code: u8 },
    /// A color change or End record carried a displacement, which was dropped.
    DiscardedOffset { record: usize, offset: (i16, i16) },
    /// The stream had no End record; one was appended.
    MissingEnd,
    /// Records after the End record were ignored.
    TrailingRecords { count: usize },
    /// The stitch region ended with an incomplete record.
    PartialRecord { bytes: usize },
    /// A color change advanced past the end of the color table.
    UndeclaredColor { record: usize },
    /// An extension block ran past the end of the input; the rest were not read.
    TruncatedExtension { index: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::CountMismatch { declared, actual } => write!(
                f,
                "header declares {declared} stitches but {actual} were found"
            ),
            Diagnostic::ClampedOffset {
                record,
                original,
                clamped,
            } => write!(
                f,
                "record {record}: offset {original:?} clamped to {clamped:?}"
            ),
            Diagnostic::UnknownCommand { record, code } => {
                write!(f, "record {record}: unknown command {code:#04x} skipped")
            }
            Diagnostic::DiscardedOffset { record, offset } => {
                write!(f, "record {record}: offset {offset:?} on a non-moving record dropped")
            }
            Diagnostic::MissingEnd => f.write_str("stitch data has no End record"),
            Diagnostic::TrailingRecords { count } => {
                write!(f, "{count} records after End ignored")
            }
            Diagnostic::PartialRecord { bytes } => {
                write!(f, "{bytes} trailing bytes do not form a whole record")
            }
            Diagnostic::UndeclaredColor { record } => {
                write!(f, "record {record}: color change past the end of the color table")
            }
            Diagnostic::TruncatedExtension { index } => {
                write!(f, "extension block {index} is truncated")
            }
        }
    }
}

/// A region that was skipped without being parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRegion {
    /// Extension tag; `None` for vendor header bytes.
    pub tag: Option<u32>,
    /// Known name of the tag, from the layout.
    pub name: Option<String>,
    pub offset: usize,
    pub len: usize,
}

/// Result of a successful decode.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub header: EmbHeader,
    pub design: Design,
    pub diagnostics: Vec<Diagnostic>,
    pub skipped: Vec<SkippedRegion>,
}

/// Decode with the default layout.
pub fn decode_default(bytes: &[u8]) -> Result<Decoded, FormatError> {
    decode(bytes, &EmbLayout::default())
}

/// Decode an EMB byte stream.
#[tracing::instrument(skip(bytes, layout), fields(len = bytes.len()))]
pub fn decode(bytes: &[u8], layout: &EmbLayout) -> Result<Decoded, FormatError> {
    layout.validate()?;

    let header = read_header(bytes, layout)?;
    tracing::debug!(?header, "decoded EMB header");

    let mut diagnostics = Vec::new();
    let mut skipped = Vec::new();

    let min_len = layout.header.min_len;
    let header_len = usize::from(header.header_len);
    if header_len < min_len {
        return Err(FormatError::MalformedHeader(format!(
            "declared header length {header_len} is below the minimum {min_len}"
        )));
    }
    region(bytes, Region::Header, 0, header_len)?;
    if header_len > min_len {
        skipped.push(SkippedRegion {
            tag: None,
            name: None,
            offset: min_len,
            len: header_len - min_len,
        });
    }

    let colors = read_colors(bytes, layout, &header)?;

    let stitch_bytes = stitch_region(bytes, &header)?;
    let stitches = read_stitches(stitch_bytes, layout, &header, colors.len(), &mut diagnostics);

    read_extensions(bytes, layout, &header, &mut skipped, &mut diagnostics);

    for diagnostic in &diagnostics {
        tracing::warn!(%diagnostic, "EMB decode");
    }

    let design = Design::from_parts(stitches, colors)?;
    Ok(Decoded {
        header,
        design,
        diagnostics,
        skipped,
    })
}

fn read_header(bytes: &[u8], layout: &EmbLayout) -> Result<EmbHeader, FormatError> {
    let h = &layout.header;
    if bytes.len() < h.min_len {
        return Err(FormatError::Truncated {
            needed: h.min_len,
            available: bytes.len(),
        });
    }

    let magic = layout.magic.as_bytes();
    if &bytes[..magic.len()] != magic {
        return Err(FormatError::BadMagic {
            found: bytes[..magic.len()].to_vec(),
        });
    }

    let order = layout.byte_order;
    let truncated = || FormatError::Truncated {
        needed: h.min_len,
        available: bytes.len(),
    };
    let u16_at = |at| order.read_u16(bytes, at).ok_or_else(truncated);
    let u32_at = |at| order.read_u32(bytes, at).ok_or_else(truncated);

    let version = u16_at(h.version)?;
    if !layout.versions.contains(&version) {
        return Err(FormatError::UnsupportedVersion(version));
    }

    Ok(EmbHeader {
        version,
        header_len: u16_at(h.header_len)?,
        stitch_count: u32_at(h.stitch_count)?,
        color_count: u16_at(h.color_count)?,
        extension_count: u16_at(h.extension_count)?,
        color_table_offset: u32_at(h.color_table_offset)?,
        stitch_data_offset: u32_at(h.stitch_data_offset)?,
        stitch_data_len: u32_at(h.stitch_data_len)?,
        extension_table_offset: u32_at(h.extension_table_offset)?,
    })
}

/// Bounds-checked slice of `bytes`.
fn region(bytes: &[u8], region: Region, offset: usize, len: usize) -> Result<&[u8], FormatError> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(FormatError::RegionOutOfBounds {
            region,
            offset,
            len,
            size: bytes.len(),
        })
}

fn read_colors(
    bytes: &[u8],
    layout: &EmbLayout,
    header: &EmbHeader,
) -> Result<Vec<(Rgb, Option<String>)>, FormatError> {
    let record = &layout.color_record;
    let count = usize::from(header.color_count);
    if count == 0 {
        return Ok(Vec::new());
    }

    let offset = header.color_table_offset as usize;
    let len = count.saturating_mul(record.len);
    let table = region(bytes, Region::ColorTable, offset, len)?;

    Ok(table
        .chunks_exact(record.len)
        .map(|rec| {
            let rgb = Rgb::new(rec[record.rgb], rec[record.rgb + 1], rec[record.rgb + 2]);
            let raw = &rec[record.catalog..record.catalog + record.catalog_len];
            (rgb, padded_string(raw))
        })
        .collect())
}

/// Decode a NUL- or space-padded string field; all padding means absent.
fn padded_string(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Locate the stitch data. A zero declared length runs to the next region.
fn stitch_region<'a>(bytes: &'a [u8], header: &EmbHeader) -> Result<&'a [u8], FormatError> {
    let offset = header.stitch_data_offset as usize;
    let len = if header.stitch_data_len != 0 {
        header.stitch_data_len as usize
    } else {
        let mut boundary = bytes.len();
        let mut starts = Vec::with_capacity(2);
        if header.color_count > 0 {
            starts.push(header.color_table_offset as usize);
        }
        if header.extension_table_offset != 0 {
            starts.push(header.extension_table_offset as usize);
        }
        for start in starts {
            if start > offset {
                boundary = boundary.min(start);
            }
        }
        boundary.saturating_sub(offset)
    };
    region(bytes, Region::StitchData, offset, len)
}

fn read_stitches(
    data: &[u8],
    layout: &EmbLayout,
    header: &EmbHeader,
    palette_len: usize,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<Stitch> {
    let record = &layout.stitch_record;
    let codes = &record.codes;
    let order = layout.byte_order;
    let max = layout.max_offset;

    let records = data.chunks_exact(record.len);
    let remainder = records.remainder().len();
    let total = data.len() / record.len;

    let mut stitches = Vec::with_capacity(total + 1);
    let mut actual: u32 = 0;
    let mut color_changes = 0usize;
    let mut ended = false;

    for (index, rec) in records.enumerate() {
        let command = rec[record.command];
        let dx = order.read_i16(rec, record.dx).unwrap_or(0);
        let dy = order.read_i16(rec, record.dy).unwrap_or(0);

        if command == codes.stitch || command == codes.jump {
            let clamped = (dx.clamp(-max, max), dy.clamp(-max, max));
            if clamped != (dx, dy) {
                diagnostics.push(Diagnostic::ClampedOffset {
                    record: index,
                    original: (dx, dy),
                    clamped,
                });
            }
            stitches.push(if command == codes.stitch {
                Stitch::move_by(clamped.0, clamped.1)
            } else {
                Stitch::jump_by(clamped.0, clamped.1)
            });
            actual = actual.saturating_add(1);
        } else if command == codes.color_change || command == codes.end {
            if (dx, dy) != (0, 0) {
                diagnostics.push(Diagnostic::DiscardedOffset {
                    record: index,
                    offset: (dx, dy),
                });
            }
            if command == codes.end {
                stitches.push(Stitch::End);
                let count = total - index - 1;
                if count > 0 {
                    diagnostics.push(Diagnostic::TrailingRecords { count });
                }
                ended = true;
                break;
            }
            color_changes += 1;
            if color_changes >= palette_len {
                diagnostics.push(Diagnostic::UndeclaredColor { record: index });
            }
            stitches.push(Stitch::ColorChange);
        } else {
            diagnostics.push(Diagnostic::UnknownCommand {
                record: index,
                code: command,
            });
        }
    }

    if !ended {
        if remainder > 0 {
            diagnostics.push(Diagnostic::PartialRecord { bytes: remainder });
        }
        diagnostics.push(Diagnostic::MissingEnd);
        stitches.push(Stitch::End);
    }

    if actual != header.stitch_count {
        diagnostics.push(Diagnostic::CountMismatch {
            declared: header.stitch_count,
            actual,
        });
    }

    stitches
}

fn read_extensions(
    bytes: &[u8],
    layout: &EmbLayout,
    header: &EmbHeader,
    skipped: &mut Vec<SkippedRegion>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if header.extension_table_offset == 0 || header.extension_count == 0 {
        return;
    }

    let frame = &layout.extension;
    let order = layout.byte_order;
    let mut cursor = header.extension_table_offset as usize;

    for index in 0..usize::from(header.extension_count) {
        let Some(head) = cursor
            .checked_add(frame.header_len)
            .and_then(|end| bytes.get(cursor..end))
        else {
            diagnostics.push(Diagnostic::TruncatedExtension { index });
            return;
        };
        let (Some(tag), Some(len)) = (
            order.read_u32(head, frame.tag),
            order.read_u32(head, frame.len),
        ) else {
            diagnostics.push(Diagnostic::TruncatedExtension { index });
            return;
        };

        let payload = cursor + frame.header_len;
        let len = len as usize;
        if payload.checked_add(len).is_none_or(|end| end > bytes.len()) {
            diagnostics.push(Diagnostic::TruncatedExtension { index });
            return;
        }

        let name = layout.extension_name(tag).map(str::to_string);
        tracing::debug!(tag = %format!("{tag:#010x}"), ?name, len, "skipping extension block");
        skipped.push(SkippedRegion {
            tag: Some(tag),
            name,
            offset: payload,
            len,
        });
        cursor = payload + len;
    }
}
