//! Tajima DST encoder.
//!
//! A DST file is a 512-byte ASCII header followed by 3-byte stitch records.
//! Each record moves the needle by at most ±121 units per axis, spread over
//! balanced-ternary bit fields (weights 1, 3, 9, 27, 81). Longer moves are
//! split into several records of the same kind whose deltas sum exactly to
//! the original offset.
//!
//! [`replay`] reads an encoded stream back, for verification.

use crate::error::{Axis, EncodeError, FormatError, ModelError};
use crate::model::{Design, Stitch};
use serde::Serialize;

/// Size of the fixed ASCII header.
pub const HEADER_LEN: usize = 512;

/// Largest per-axis displacement of a single record.
pub const MAX_RECORD_DELTA: i32 = 121;

/// Largest absolute coordinate the five-digit extent fields can hold.
pub const MAX_EXTENT: i64 = 99_999;

/// Largest record count the seven-digit `ST` field can hold.
pub const MAX_RECORDS: usize = 9_999_999;

const DEFAULT_LABEL: &str = "Untitled";
const LABEL_LEN: usize = 16;
const END_OF_HEADER: u8 = 0x1A;

/// (weight, byte, plus bit, minus bit), largest weight first.
type BitField = (i32, usize, u8, u8);

const X_FIELDS: [BitField; 5] = [
    (81, 2, 0x04, 0x08),
    (27, 1, 0x04, 0x08),
    (9, 0, 0x04, 0x08),
    (3, 1, 0x01, 0x02),
    (1, 0, 0x01, 0x02),
];

const Y_FIELDS: [BitField; 5] = [
    (81, 2, 0x20, 0x10),
    (27, 1, 0x20, 0x10),
    (9, 0, 0x20, 0x10),
    (3, 1, 0x80, 0x40),
    (1, 0, 0x80, 0x40),
];

const FLAGS: u8 = 0x03;
const JUMP: u8 = 0x80;
const STOP: u8 = 0xC3;
const END: u8 = 0xF3;

/// Encoder options.
#[derive(Debug, Clone, Default)]
pub struct DstOptions {
    /// Overrides the design label in the `LA` field.
    pub label: Option<String>,
}

/// One 3-byte DST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Stitch { dx: i8, dy: i8 },
    Jump { dx: i8, dy: i8 },
    /// Color change; the machine halts for a thread swap.
    Stop,
    End,
}

impl Record {
    pub fn offset(&self) -> (i8, i8) {
        match *self {
            Record::Stitch { dx, dy } | Record::Jump { dx, dy } => (dx, dy),
            Record::Stop | Record::End => (0, 0),
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        match self {
            Record::Stop => [0, 0, STOP],
            Record::End => [0, 0, END],
            Record::Stitch { dx, dy } => displacement(dx, dy, FLAGS),
            Record::Jump { dx, dy } => displacement(dx, dy, FLAGS | JUMP),
        }
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        let flags = bytes[2];
        if flags & END == END {
            return Record::End;
        }
        if flags & STOP == STOP {
            return Record::Stop;
        }
        let dx = read_axis(&bytes, &X_FIELDS);
        let dy = read_axis(&bytes, &Y_FIELDS);
        if flags & JUMP != 0 {
            Record::Jump { dx, dy }
        } else {
            Record::Stitch { dx, dy }
        }
    }
}

fn displacement(dx: i8, dy: i8, flags: u8) -> [u8; 3] {
    let mut bytes = [0, 0, flags];
    write_axis(&mut bytes, i32::from(dx), &X_FIELDS);
    write_axis(&mut bytes, i32::from(dy), &Y_FIELDS);
    bytes
}

/// Greedy balanced-ternary decomposition; exact for |value| ≤ 121.
fn write_axis(bytes: &mut [u8; 3], mut value: i32, fields: &[BitField; 5]) {
    for &(weight, byte, plus, minus) in fields {
        let half = weight / 2;
        if value > half {
            bytes[byte] |= plus;
            value -= weight;
        } else if value < -half {
            bytes[byte] |= minus;
            value += weight;
        }
    }
    debug_assert_eq!(value, 0);
}

fn read_axis(bytes: &[u8; 3], fields: &[BitField; 5]) -> i8 {
    let mut value = 0i32;
    for &(weight, byte, plus, minus) in fields {
        if bytes[byte] & plus != 0 {
            value += weight;
        }
        if bytes[byte] & minus != 0 {
            value -= weight;
        }
    }
    value as i8
}

/// Extents of the needle path relative to the start point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Extents {
    pub max_x: i64,
    pub min_x: i64,
    pub max_y: i64,
    pub min_y: i64,
}

impl Extents {
    fn include(&mut self, x: i64, y: i64) {
        self.max_x = self.max_x.max(x);
        self.min_x = self.min_x.min(x);
        self.max_y = self.max_y.max(y);
        self.min_y = self.min_y.min(y);
    }
}

/// Split a displacement into records of at most [`MAX_RECORD_DELTA`] per axis.
///
/// Piece `i` of `n` is `floor(d * i / n) - floor(d * (i - 1) / n)`; the
/// pieces telescope to exactly `d`.
fn split(dx: i16, dy: i16) -> impl Iterator<Item = (i8, i8)> {
    let (dx, dy) = (i32::from(dx), i32::from(dy));
    let span = dx.abs().max(dy.abs());
    let n = ((span + MAX_RECORD_DELTA - 1) / MAX_RECORD_DELTA).max(1);
    let at = move |d: i32, i: i32| (d * i).div_euclid(n);
    (1..=n).map(move |i| {
        (
            (at(dx, i) - at(dx, i - 1)) as i8,
            (at(dy, i) - at(dy, i - 1)) as i8,
        )
    })
}

/// Map a design onto DST records, checking the coordinate range.
fn plan(design: &Design) -> Result<(Vec<Record>, Extents), EncodeError> {
    let mut records = Vec::with_capacity(design.stitches().len());
    let mut extents = Extents::default();

    for (index, (stitch, x, y)) in design.walk().enumerate() {
        for (axis, value) in [(Axis::X, x), (Axis::Y, y)] {
            if value.abs() > MAX_EXTENT {
                return Err(EncodeError::CoordinateOverflow {
                    stitch: index,
                    axis,
                    value,
                    limit: MAX_EXTENT,
                });
            }
        }

        match *stitch {
            Stitch::Move { dx, dy } => {
                records.extend(split(dx, dy).map(|(dx, dy)| Record::Stitch { dx, dy }));
            }
            Stitch::Jump { dx, dy } => {
                records.extend(split(dx, dy).map(|(dx, dy)| Record::Jump { dx, dy }));
            }
            Stitch::ColorChange => records.push(Record::Stop),
            Stitch::End => records.push(Record::End),
        }
        extents.include(x, y);
    }

    if records.len() > MAX_RECORDS {
        return Err(EncodeError::TooManyRecords(records.len()));
    }
    Ok((records, extents))
}

/// Encoded output with the record count, for reporting.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub records: usize,
}

/// Encode a design as a DST byte stream.
///
/// All-or-nothing: an empty design or an unrepresentable coordinate fails
/// before any bytes are produced.
#[tracing::instrument(skip_all, fields(stitches = design.stitches().len()))]
pub fn encode(design: &Design, options: &DstOptions) -> Result<Encoded, EncodeError> {
    if design.needle_move_count() == 0 {
        return Err(EncodeError::EmptyDesign);
    }
    design.validate()?;

    let (records, extents) = plan(design)?;
    let (end_x, end_y) = design
        .walk()
        .last()
        .map(|(_, x, y)| (x, y))
        .unwrap_or_default();

    let label = options.label.as_deref().or(design.label());
    let color_changes = design.color_change_count();
    if color_changes > 999 {
        tracing::warn!(color_changes, "CO field saturated at 999");
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + records.len() * 3);
    write_header(
        &mut bytes,
        &HeaderFields {
            label: sanitize_label(label),
            records: records.len(),
            color_changes: color_changes.min(999),
            extents,
            end: (end_x, end_y),
        },
    );
    for record in &records {
        bytes.extend_from_slice(&record.to_bytes());
    }

    tracing::debug!(records = records.len(), len = bytes.len(), "encoded DST");
    Ok(Encoded {
        bytes,
        records: records.len(),
    })
}

struct HeaderFields {
    label: String,
    records: usize,
    color_changes: usize,
    extents: Extents,
    end: (i64, i64),
}

fn signed(value: i64) -> String {
    let sign = if value < 0 { '-' } else { '+' };
    format!("{sign}{:>5}", value.abs())
}

fn write_header(out: &mut Vec<u8>, fields: &HeaderFields) {
    let e = &fields.extents;
    let text = format!(
        "LA:{:<16}\rST:{:>7}\rCO:{:>3}\r+X:{:>5}\r-X:{:>5}\r+Y:{:>5}\r-Y:{:>5}\r\
         AX:{}\rAY:{}\rMX:{}\rMY:{}\rPD:******\r",
        fields.label,
        fields.records,
        fields.color_changes,
        e.max_x,
        -e.min_x,
        e.max_y,
        -e.min_y,
        signed(fields.end.0),
        signed(fields.end.1),
        signed(0),
        signed(0),
    );
    let start = out.len();
    out.extend_from_slice(text.as_bytes());
    out.push(END_OF_HEADER);
    out.resize(start + HEADER_LEN, b' ');
}

/// Printable ASCII, at most 16 characters; anything else becomes `_`.
fn sanitize_label(label: Option<&str>) -> String {
    match label.map(str::trim) {
        Some(text) if !text.is_empty() => text
            .chars()
            .take(LABEL_LEN)
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
            .collect(),
        _ => DEFAULT_LABEL.to_string(),
    }
}

/// Header fields read back from a DST stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DstHeader {
    pub label: String,
    pub record_count: usize,
    pub color_changes: usize,
    pub extents: Extents,
    pub end: (i64, i64),
}

/// A decoded DST stream.
#[derive(Debug, Clone)]
pub struct Replay {
    pub header: DstHeader,
    pub records: Vec<Record>,
    /// Needle position after the last record.
    pub end: (i64, i64),
    /// Extents recomputed from the records.
    pub extents: Extents,
}

/// Read a DST stream back into records and replay the needle path.
pub fn replay(bytes: &[u8]) -> Result<Replay, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let header = parse_header(&bytes[..HEADER_LEN])?;

    let body = &bytes[HEADER_LEN..];
    let chunks = body.chunks_exact(3);
    if !chunks.remainder().is_empty() {
        return Err(FormatError::Truncated {
            needed: bytes.len() + 3 - chunks.remainder().len(),
            available: bytes.len(),
        });
    }

    let mut records = Vec::with_capacity(body.len() / 3);
    let mut extents = Extents::default();
    let (mut x, mut y) = (0i64, 0i64);
    for chunk in chunks {
        let record = Record::from_bytes([chunk[0], chunk[1], chunk[2]]);
        let (dx, dy) = record.offset();
        x += i64::from(dx);
        y += i64::from(dy);
        extents.include(x, y);
        records.push(record);
        if record == Record::End {
            break;
        }
    }
    if records.last() != Some(&Record::End) {
        return Err(ModelError::MissingEnd.into());
    }

    Ok(Replay {
        header,
        records,
        end: (x, y),
        extents,
    })
}

fn parse_header(raw: &[u8]) -> Result<DstHeader, FormatError> {
    let text_end = raw
        .iter()
        .position(|&b| b == END_OF_HEADER)
        .ok_or_else(|| FormatError::MalformedHeader("no end-of-header marker".into()))?;
    let text = String::from_utf8_lossy(&raw[..text_end]);

    let field = |key: &str| -> Result<String, FormatError> {
        text.split('\r')
            .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
            .map(str::to_string)
            .ok_or_else(|| FormatError::MalformedHeader(format!("missing {key} field")))
    };
    let number = |key: &str| -> Result<i64, FormatError> {
        let value = field(key)?;
        value
            .replace(' ', "")
            .parse::<i64>()
            .map_err(|_| FormatError::MalformedHeader(format!("{key} is not a number: {value:?}")))
    };

    Ok(DstHeader {
        label: field("LA")?.trim_end().to_string(),
        record_count: number("ST")?.max(0) as usize,
        color_changes: number("CO")?.max(0) as usize,
        extents: Extents {
            max_x: number("+X")?,
            min_x: -number("-X")?,
            max_y: number("+Y")?,
            min_y: -number("-Y")?,
        },
        end: (number("AX")?, number("AY")?),
    })
}
