//! Synthetic EMB buffers for tests, laid out per the default layout.

/// One stitch record.
#[derive(Debug, Clone, Copy)]
pub enum Rec {
    Stitch(i16, i16),
    Jump(i16, i16),
    ColorChange,
    End,
    Raw(u8, i16, i16),
}

impl Rec {
    fn fields(self) -> (u8, i16, i16) {
        match self {
            Rec::Stitch(dx, dy) => (0, dx, dy),
            Rec::Jump(dx, dy) => (1, dx, dy),
            Rec::ColorChange => (2, 0, 0),
            Rec::End => (3, 0, 0),
            Rec::Raw(code, dx, dy) => (code, dx, dy),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbBuilder {
    version: u16,
    colors: Vec<([u8; 3], String)>,
    records: Vec<Rec>,
    vendor_header: Vec<u8>,
    extensions: Vec<(u32, Vec<u8>)>,
    stitch_tail: Vec<u8>,
    declared_stitches: Option<u32>,
    declared_colors: Option<u16>,
    stitch_data_offset: Option<u32>,
    stitch_data_len: Option<u32>,
    big_endian: bool,
}

impl EmbBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            colors: Vec::new(),
            records: Vec::new(),
            vendor_header: Vec::new(),
            extensions: Vec::new(),
            stitch_tail: Vec::new(),
            declared_stitches: None,
            declared_colors: None,
            stitch_data_offset: None,
            stitch_data_len: None,
            big_endian: false,
        }
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn color(mut self, rgb: [u8; 3], catalog: &str) -> Self {
        self.colors.push((rgb, catalog.to_string()));
        self
    }

    pub fn record(mut self, rec: Rec) -> Self {
        self.records.push(rec);
        self
    }

    pub fn records(mut self, recs: impl IntoIterator<Item = Rec>) -> Self {
        self.records.extend(recs);
        self
    }

    pub fn vendor_header(mut self, bytes: Vec<u8>) -> Self {
        self.vendor_header = bytes;
        self
    }

    pub fn extension(mut self, tag: u32, payload: Vec<u8>) -> Self {
        self.extensions.push((tag, payload));
        self
    }

    pub fn stitch_tail(mut self, bytes: Vec<u8>) -> Self {
        self.stitch_tail = bytes;
        self
    }

    pub fn declared_stitches(mut self, count: u32) -> Self {
        self.declared_stitches = Some(count);
        self
    }

    pub fn declared_colors(mut self, count: u16) -> Self {
        self.declared_colors = Some(count);
        self
    }

    pub fn stitch_data_offset(mut self, offset: u32) -> Self {
        self.stitch_data_offset = Some(offset);
        self
    }

    pub fn stitch_data_len(mut self, len: u32) -> Self {
        self.stitch_data_len = Some(len);
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    fn u16(&self, v: u16) -> [u8; 2] {
        if self.big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    fn u32(&self, v: u32) -> [u8; 4] {
        if self.big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let header_len = 32 + self.vendor_header.len();
        let color_offset = header_len;
        let stitch_offset = color_offset + self.colors.len() * 20;

        let mut stitch_data = Vec::new();
        for rec in &self.records {
            let (code, dx, dy) = rec.fields();
            stitch_data.push(code);
            stitch_data.push(0);
            stitch_data.extend_from_slice(&self.u16(dx as u16));
            stitch_data.extend_from_slice(&self.u16(dy as u16));
        }
        stitch_data.extend_from_slice(&self.stitch_tail);

        let extension_offset = if self.extensions.is_empty() {
            0
        } else {
            stitch_offset + stitch_data.len()
        };

        let declared_stitches = self.declared_stitches.unwrap_or_else(|| {
            self.records
                .iter()
                .filter(|r| matches!(r, Rec::Stitch(..) | Rec::Jump(..)))
                .count() as u32
        });

        let mut out = Vec::new();
        out.extend_from_slice(b"#EMB");
        out.extend_from_slice(&self.u16(self.version));
        out.extend_from_slice(&self.u16(header_len as u16));
        out.extend_from_slice(&self.u32(declared_stitches));
        out.extend_from_slice(&self.u16(
            self.declared_colors.unwrap_or(self.colors.len() as u16),
        ));
        out.extend_from_slice(&self.u16(self.extensions.len() as u16));
        out.extend_from_slice(&self.u32(color_offset as u32));
        out.extend_from_slice(
            &self.u32(self.stitch_data_offset.unwrap_or(stitch_offset as u32)),
        );
        out.extend_from_slice(
            &self.u32(self.stitch_data_len.unwrap_or(stitch_data.len() as u32)),
        );
        out.extend_from_slice(&self.u32(extension_offset as u32));
        out.extend_from_slice(&self.vendor_header);

        for (rgb, catalog) in &self.colors {
            out.extend_from_slice(rgb);
            out.push(0);
            let mut name = [0u8; 16];
            let bytes = catalog.as_bytes();
            let n = bytes.len().min(16);
            name[..n].copy_from_slice(&bytes[..n]);
            out.extend_from_slice(&name);
        }

        out.extend_from_slice(&stitch_data);

        for (tag, payload) in &self.extensions {
            out.extend_from_slice(&self.u32(*tag));
            out.extend_from_slice(&self.u32(payload.len() as u32));
            out.extend_from_slice(payload);
        }

        out
    }
}

/// The 10x10 square: three moves, one color change, End; two colors.
pub fn square_emb() -> Vec<u8> {
    EmbBuilder::new()
        .color([255, 0, 0], "Madeira 1147")
        .color([0, 0, 255], "")
        .record(Rec::Stitch(10, 0))
        .record(Rec::Stitch(0, 10))
        .record(Rec::ColorChange)
        .record(Rec::Stitch(-10, 0))
        .record(Rec::End)
        .build()
}
