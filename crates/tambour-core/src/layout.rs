//! EMB layout table.
//!
//! EMB producers disagree on exact field placement, so the decoder reads
//! every offset, width and command code from an [`EmbLayout`] instead of
//! hard-coding them. Layouts are plain serde data and can be kept in TOML,
//! YAML or JSON files next to the sample files they were validated against.

use crate::error::FormatError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Byte order of multi-byte integer fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// Read a `u16` at `at`, or `None` if it runs past the end of `buf`.
    pub fn read_u16(self, buf: &[u8], at: usize) -> Option<u16> {
        let bytes: [u8; 2] = buf.get(at..at.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_i16(self, buf: &[u8], at: usize) -> Option<i16> {
        self.read_u16(buf, at).map(|v| v as i16)
    }

    pub fn read_u32(self, buf: &[u8], at: usize) -> Option<u32> {
        let bytes: [u8; 4] = buf.get(at..at.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }
}

/// Byte offsets of header fields.
///
/// `version`, `header_len`, `color_count` and `extension_count` are `u16`;
/// the rest are `u32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderFields {
    /// Minimum header size; shorter inputs are rejected outright.
    pub min_len: usize,
    pub version: usize,
    /// Declared header length. Bytes past `min_len` are vendor data.
    pub header_len: usize,
    pub stitch_count: usize,
    pub color_count: usize,
    pub extension_count: usize,
    pub color_table_offset: usize,
    pub stitch_data_offset: usize,
    /// Stitch data length in bytes; zero means "up to the next region".
    pub stitch_data_len: usize,
    /// Extension table offset; zero means no extension blocks.
    pub extension_table_offset: usize,
}

impl Default for HeaderFields {
    fn default() -> Self {
        Self {
            min_len: 32,
            version: 4,
            header_len: 6,
            stitch_count: 8,
            color_count: 12,
            extension_count: 14,
            color_table_offset: 16,
            stitch_data_offset: 20,
            stitch_data_len: 24,
            extension_table_offset: 28,
        }
    }
}

impl HeaderFields {
    fn u16_fields(&self) -> [(&'static str, usize); 4] {
        [
            ("version", self.version),
            ("header_len", self.header_len),
            ("color_count", self.color_count),
            ("extension_count", self.extension_count),
        ]
    }

    fn u32_fields(&self) -> [(&'static str, usize); 5] {
        [
            ("stitch_count", self.stitch_count),
            ("color_table_offset", self.color_table_offset),
            ("stitch_data_offset", self.stitch_data_offset),
            ("stitch_data_len", self.stitch_data_len),
            ("extension_table_offset", self.extension_table_offset),
        ]
    }
}

/// Fixed-width color table record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorRecordLayout {
    pub len: usize,
    /// Offset of the 3 RGB bytes.
    pub rgb: usize,
    /// Offset of the padded catalog identifier.
    pub catalog: usize,
    pub catalog_len: usize,
}

impl Default for ColorRecordLayout {
    fn default() -> Self {
        Self {
            len: 20,
            rgb: 0,
            catalog: 4,
            catalog_len: 16,
        }
    }
}

/// Command byte values of a stitch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandCodes {
    pub stitch: u8,
    pub jump: u8,
    pub color_change: u8,
    pub end: u8,
}

impl Default for CommandCodes {
    fn default() -> Self {
        Self {
            stitch: 0,
            jump: 1,
            color_change: 2,
            end: 3,
        }
    }
}

/// Fixed-width stitch command record. `dx` and `dy` are `i16`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StitchRecordLayout {
    pub len: usize,
    pub command: usize,
    pub dx: usize,
    pub dy: usize,
    pub codes: CommandCodes,
}

impl Default for StitchRecordLayout {
    fn default() -> Self {
        Self {
            len: 6,
            command: 0,
            dx: 2,
            dy: 4,
            codes: CommandCodes::default(),
        }
    }
}

/// Extension block framing: a tag and a payload length ahead of each payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionLayout {
    pub tag: usize,
    pub len: usize,
    pub header_len: usize,
}

impl Default for ExtensionLayout {
    fn default() -> Self {
        Self {
            tag: 0,
            len: 4,
            header_len: 8,
        }
    }
}

/// Complete description of an EMB variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbLayout {
    /// Signature at offset 0.
    pub magic: String,
    /// Accepted format versions.
    pub versions: Vec<u16>,
    pub byte_order: ByteOrder,
    /// Largest accepted offset magnitude per axis, in 0.1 mm units.
    pub max_offset: i16,
    pub header: HeaderFields,
    pub color_record: ColorRecordLayout,
    pub stitch_record: StitchRecordLayout,
    pub extension: ExtensionLayout,
    /// Names for vendor extension tags, used only for log output.
    pub known_extensions: IndexMap<String, u32>,
}

impl Default for EmbLayout {
    fn default() -> Self {
        let mut known_extensions = IndexMap::new();
        known_extensions.insert("preview".to_string(), 0x5057_4552);
        known_extensions.insert("hoop".to_string(), 0x504f_4f48);
        Self {
            magic: "#EMB".to_string(),
            versions: vec![1, 2],
            byte_order: ByteOrder::Little,
            max_offset: 1270,
            header: HeaderFields::default(),
            color_record: ColorRecordLayout::default(),
            stitch_record: StitchRecordLayout::default(),
            extension: ExtensionLayout::default(),
            known_extensions,
        }
    }
}

impl EmbLayout {
    /// Check that every field fits inside its record and codes are distinct.
    pub fn validate(&self) -> Result<(), FormatError> {
        let invalid = |msg: String| Err(FormatError::InvalidLayout(msg));

        if self.magic.is_empty() || self.magic.len() > self.header.min_len {
            return invalid(format!(
                "magic must be 1..={} bytes, got {}",
                self.header.min_len,
                self.magic.len()
            ));
        }
        if self.versions.is_empty() {
            return invalid("at least one version must be accepted".into());
        }
        if self.max_offset <= 0 {
            return invalid(format!("max_offset must be positive, got {}", self.max_offset));
        }

        let h = &self.header;
        for (name, at) in h.u16_fields() {
            if at < self.magic.len() || !fits(at, 2, h.min_len) {
                return invalid(format!("header field '{name}' at {at} does not fit"));
            }
        }
        for (name, at) in h.u32_fields() {
            if at < self.magic.len() || !fits(at, 4, h.min_len) {
                return invalid(format!("header field '{name}' at {at} does not fit"));
            }
        }

        let c = &self.color_record;
        if c.len == 0 || !fits(c.rgb, 3, c.len) || !fits(c.catalog, c.catalog_len, c.len) {
            return invalid(format!("color record fields do not fit in {} bytes", c.len));
        }

        let s = &self.stitch_record;
        if s.len == 0 || s.command >= s.len || !fits(s.dx, 2, s.len) || !fits(s.dy, 2, s.len) {
            return invalid(format!("stitch record fields do not fit in {} bytes", s.len));
        }
        let codes = [
            s.codes.stitch,
            s.codes.jump,
            s.codes.color_change,
            s.codes.end,
        ];
        for (i, code) in codes.iter().enumerate() {
            if codes[i + 1..].contains(code) {
                return invalid(format!("command code {code} is assigned twice"));
            }
        }

        let e = &self.extension;
        if !fits(e.tag, 4, e.header_len) || !fits(e.len, 4, e.header_len) {
            return invalid(format!(
                "extension framing does not fit in {} bytes",
                e.header_len
            ));
        }

        Ok(())
    }

    /// Name of a known extension tag.
    pub fn extension_name(&self, tag: u32) -> Option<&str> {
        self.known_extensions
            .iter()
            .find(|(_, t)| **t == tag)
            .map(|(name, _)| name.as_str())
    }

    /// Parse a layout from bytes, picking the format from the path extension.
    pub fn from_bytes(data: &[u8], path: Option<&str>) -> Result<Self, FormatError> {
        let format = path
            .and_then(detect_format)
            .unwrap_or_else(|| "toml".to_string());

        Self::from_bytes_format(data, &format)
    }

    /// Parse a layout from bytes with an explicit format, then validate it.
    pub fn from_bytes_format(data: &[u8], format: &str) -> Result<Self, FormatError> {
        let parse = |e: String| FormatError::InvalidLayout(e);
        let layout: Self = match format {
            "json" => serde_json::from_slice(data).map_err(|e| parse(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_slice(data).map_err(|e| parse(e.to_string()))?,
            "toml" => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| parse(format!("Invalid UTF-8: {}", e)))?;
                toml::from_str(s).map_err(|e| parse(e.to_string()))?
            }
            _ => {
                return Err(parse(format!("Unsupported layout format: {}", format)));
            }
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Serialize the layout.
    pub fn to_bytes(&self, format: &str) -> Result<Vec<u8>, FormatError> {
        let parse = |e: String| FormatError::InvalidLayout(e);
        match format {
            "json" => serde_json::to_vec_pretty(self).map_err(|e| parse(e.to_string())),
            "yaml" | "yml" => serde_yaml::to_string(self)
                .map(|s| s.into_bytes())
                .map_err(|e| parse(e.to_string())),
            "toml" => toml::to_string_pretty(self)
                .map(|s| s.into_bytes())
                .map_err(|e| parse(e.to_string())),
            _ => Err(parse(format!("Unsupported layout format: {}", format))),
        }
    }
}

/// Whether `width` bytes at `at` end within `limit`.
fn fits(at: usize, width: usize, limit: usize) -> bool {
    at.checked_add(width).is_some_and(|end| end <= limit)
}

/// Detect a layout file format from its extension.
fn detect_format(path: &str) -> Option<String> {
    let ext = path.rsplit('.').next()?;
    match ext.to_lowercase().as_str() {
        "json" => Some("json".into()),
        "yaml" | "yml" => Some("yaml".into()),
        "toml" => Some("toml".into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        assert!(EmbLayout::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
magic = "EMBX"
versions = [3]

[stitch_record]
len = 8
"#;
        let layout = EmbLayout::from_bytes(toml.as_bytes(), Some("vendor.toml")).unwrap();
        assert_eq!(layout.magic, "EMBX");
        assert_eq!(layout.versions, vec![3]);
        assert_eq!(layout.stitch_record.len, 8);
        assert_eq!(layout.stitch_record.dx, 2);
        assert_eq!(layout.header, HeaderFields::default());
    }

    #[test]
    fn test_json_roundtrip() {
        let layout = EmbLayout::default();
        let bytes = layout.to_bytes("json").unwrap();
        let parsed = EmbLayout::from_bytes(&bytes, Some("layout.json")).unwrap();
        assert_eq!(parsed, layout);
    }

    #[test]
    fn test_rejects_field_outside_header() {
        let mut layout = EmbLayout::default();
        layout.header.extension_table_offset = 30;
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("extension_table_offset"));
    }

    #[test]
    fn test_rejects_duplicate_command_codes() {
        let mut layout = EmbLayout::default();
        layout.stitch_record.codes.jump = layout.stitch_record.codes.stitch;
        assert!(matches!(
            layout.validate(),
            Err(FormatError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_rejects_overflowing_offsets() {
        let json = br#"{"color_record":{"rgb":18446744073709551615}}"#;
        assert!(matches!(
            EmbLayout::from_bytes(json, Some("layout.json")),
            Err(FormatError::InvalidLayout(_))
        ));

        let mut layout = EmbLayout::default();
        layout.stitch_record.dx = usize::MAX;
        assert!(layout.validate().is_err());

        let mut layout = EmbLayout::default();
        layout.header.stitch_count = usize::MAX - 1;
        assert!(layout.validate().is_err());

        let mut layout = EmbLayout::default();
        layout.extension.tag = usize::MAX;
        assert!(layout.validate().is_err());

        let mut layout = EmbLayout::default();
        layout.color_record.catalog_len = usize::MAX;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_rejects_misspelled_keys() {
        let toml = "byteorder = \"big\"\n";
        assert!(EmbLayout::from_bytes(toml.as_bytes(), Some("vendor.toml")).is_err());

        let nested = "[stitch_record]\nlength = 8\n";
        assert!(EmbLayout::from_bytes(nested.as_bytes(), Some("vendor.toml")).is_err());
    }

    #[test]
    fn test_unknown_format() {
        assert!(EmbLayout::from_bytes_format(b"", "ini").is_err());
    }

    #[test]
    fn test_byte_order_reads() {
        let buf = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(ByteOrder::Little.read_u16(&buf, 0), Some(0x0201));
        assert_eq!(ByteOrder::Big.read_u16(&buf, 0), Some(0x0102));
        assert_eq!(ByteOrder::Little.read_u32(&buf, 0), Some(0x0403_0201));
        assert_eq!(ByteOrder::Little.read_u32(&buf, 1), None);
        assert_eq!(ByteOrder::Little.read_u16(&buf, usize::MAX), None);
    }

    #[test]
    fn test_extension_names() {
        let layout = EmbLayout::default();
        assert_eq!(layout.extension_name(0x5057_4552), Some("preview"));
        assert_eq!(layout.extension_name(7), None);
    }
}
