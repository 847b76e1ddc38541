//! Stitch model: the decoded, in-memory form of an embroidery design.
//!
//! Offsets are relative and measured in 0.1 mm units. Absolute positions are
//! never stored; they are recomputed by walking the stitch sequence from the
//! origin, so nothing derived can go stale.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One needle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stitch {
    /// Normal stitch to a relative offset.
    Move { dx: i16, dy: i16 },
    /// Needle-up move to a relative offset.
    Jump { dx: i16, dy: i16 },
    /// Advance to the next palette entry.
    ColorChange,
    /// Terminal marker.
    End,
}

impl Stitch {
    pub fn move_by(dx: i16, dy: i16) -> Self {
        Stitch::Move { dx, dy }
    }

    pub fn jump_by(dx: i16, dy: i16) -> Self {
        Stitch::Jump { dx, dy }
    }

    /// Relative displacement; zero for color changes and End.
    pub fn offset(&self) -> (i16, i16) {
        match *self {
            Stitch::Move { dx, dy } | Stitch::Jump { dx, dy } => (dx, dy),
            Stitch::ColorChange | Stitch::End => (0, 0),
        }
    }

    /// True for Move and Jump, the stitches that displace the needle.
    pub fn is_needle_move(&self) -> bool {
        matches!(self, Stitch::Move { .. } | Stitch::Jump { .. })
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Stitch::End)
    }
}

/// Display color of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// A palette entry. Index is the position in the color table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColorEntry {
    pub index: usize,
    pub rgb: Rgb,
    /// Thread catalog or brand identifier, if the producer recorded one.
    pub catalog: Option<String>,
}

/// A decoded design: an ordered stitch sequence and its color table.
///
/// Appending is the only mutation; entries are never edited in place.
/// A finished design holds exactly one [`Stitch::End`], positioned last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Design {
    label: Option<String>,
    stitches: Vec<Stitch>,
    colors: Vec<ColorEntry>,
}

impl Design {
    /// Create an empty, unterminated design.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a design from a complete stitch sequence, checking the End invariant.
    pub fn from_parts(
        stitches: Vec<Stitch>,
        colors: Vec<(Rgb, Option<String>)>,
    ) -> Result<Self, ModelError> {
        if let Some(index) = stitches.iter().position(Stitch::is_end) {
            if index + 1 != stitches.len() {
                return Err(ModelError::MisplacedEnd { index });
            }
        } else {
            return Err(ModelError::MissingEnd);
        }

        let mut design = Self::new();
        for (rgb, catalog) in colors {
            design.push_color(rgb, catalog);
        }
        design.stitches = stitches;
        Ok(design)
    }

    /// Set the design label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Append a palette entry, returning its index.
    pub fn push_color(&mut self, rgb: Rgb, catalog: Option<String>) -> usize {
        let index = self.colors.len();
        self.colors.push(ColorEntry {
            index,
            rgb,
            catalog,
        });
        index
    }

    /// Append a stitch. Fails once the design has been terminated.
    pub fn push(&mut self, stitch: Stitch) -> Result<(), ModelError> {
        if self.is_terminated() {
            return Err(ModelError::StitchAfterEnd);
        }
        self.stitches.push(stitch);
        Ok(())
    }

    /// Append the End marker unless it is already present.
    ///
    /// Returns `true` if a marker had to be added.
    pub fn finish(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.stitches.push(Stitch::End);
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.stitches.last().is_some_and(Stitch::is_end)
    }

    /// Check the End invariant of a finished design.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self.stitches.iter().position(Stitch::is_end) {
            None => Err(ModelError::MissingEnd),
            Some(index) if index + 1 != self.stitches.len() => {
                Err(ModelError::MisplacedEnd { index })
            }
            Some(_) => Ok(()),
        }
    }

    pub fn stitches(&self) -> &[Stitch] {
        &self.stitches
    }

    pub fn colors(&self) -> &[ColorEntry] {
        &self.colors
    }

    /// Number of Move and Jump stitches.
    pub fn needle_move_count(&self) -> usize {
        self.stitches.iter().filter(|s| s.is_needle_move()).count()
    }

    /// Number of ColorChange stitches.
    pub fn color_change_count(&self) -> usize {
        self.stitches
            .iter()
            .filter(|s| matches!(s, Stitch::ColorChange))
            .count()
    }

    /// Walk the stitches with the absolute needle position after each one.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stitches: self.stitches.iter(),
            x: 0,
            y: 0,
        }
    }
}

/// Iterator over stitches paired with absolute positions, starting at (0, 0).
///
/// Positions accumulate in `i64`, which no sequence of `i16` offsets that
/// fits in memory can overflow.
pub struct Walk<'a> {
    stitches: std::slice::Iter<'a, Stitch>,
    x: i64,
    y: i64,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (&'a Stitch, i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let stitch = self.stitches.next()?;
        let (dx, dy) = stitch.offset();
        self.x += i64::from(dx);
        self.y += i64::from(dy);
        Some((stitch, self.x, self.y))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stitches.size_hint()
    }
}
