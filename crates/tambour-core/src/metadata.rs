//! Summary statistics derived from a design.

use crate::model::Design;
use serde::Serialize;
use std::fmt;

/// Bounding box in 0.1 mm units, absolute from the origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl Bounds {
    pub fn width(&self) -> i64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> i64 {
        self.max_y - self.min_y
    }
}

/// Counts and physical size of a design.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Move and Jump stitches; color changes and End are not counted.
    pub stitch_count: usize,
    /// Size of the color table, whether or not every color is used.
    pub color_count: usize,
    pub width_mm: f64,
    pub height_mm: f64,
    pub bounds: Bounds,
}

/// Derive metadata from a design. Never fails; an empty design yields zeros.
pub fn derive(design: &Design) -> DesignMetadata {
    let mut bounds: Option<Bounds> = None;
    for (stitch, x, y) in design.walk() {
        if !stitch.is_needle_move() {
            continue;
        }
        let b = bounds.get_or_insert(Bounds {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        });
        b.min_x = b.min_x.min(x);
        b.min_y = b.min_y.min(y);
        b.max_x = b.max_x.max(x);
        b.max_y = b.max_y.max(y);
    }
    let bounds = bounds.unwrap_or_default();

    DesignMetadata {
        label: design.label().map(str::to_string),
        stitch_count: design.needle_move_count(),
        color_count: design.colors().len(),
        width_mm: bounds.width() as f64 / 10.0,
        height_mm: bounds.height() as f64 / 10.0,
        bounds,
    }
}

impl fmt::Display for DesignMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = &self.label {
            writeln!(f, "Design:       {label}")?;
        }
        writeln!(f, "Stitches:     {}", self.stitch_count)?;
        writeln!(f, "Colors:       {}", self.color_count)?;
        writeln!(f, "Width (mm):   {:.2}", self.width_mm)?;
        writeln!(f, "Height (mm):  {:.2}", self.height_mm)?;
        let b = &self.bounds;
        write!(
            f,
            "Bounds:       ({}, {}) to ({}, {})",
            b.min_x, b.min_y, b.max_x, b.max_y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emb;
    use crate::fixtures::square_emb;
    use crate::model::{Rgb, Stitch};

    #[test]
    fn test_square_end_to_end() {
        let decoded = emb::decode_default(&square_emb()).unwrap();
        let meta = derive(&decoded.design);

        assert_eq!(meta.stitch_count, 3);
        assert_eq!(meta.color_count, 2);
        assert_eq!(
            meta.bounds,
            Bounds {
                min_x: 0,
                min_y: 0,
                max_x: 10,
                max_y: 10
            }
        );
        assert_eq!(meta.width_mm, 1.0);
        assert_eq!(meta.height_mm, 1.0);
    }

    #[test]
    fn test_stitch_count_ignores_palette_size() {
        let stitches = vec![
            Stitch::move_by(3, 4),
            Stitch::jump_by(100, 0),
            Stitch::ColorChange,
            Stitch::ColorChange,
            Stitch::End,
        ];
        let few = Design::from_parts(stitches.clone(), vec![]).unwrap();
        let many = Design::from_parts(stitches, vec![(Rgb::new(0, 0, 0), None); 12]).unwrap();

        assert_eq!(derive(&few).stitch_count, 2);
        assert_eq!(derive(&many).stitch_count, 2);
        assert_eq!(derive(&many).color_count, 12);
    }

    #[test]
    fn test_empty_design_is_degenerate() {
        let meta = derive(&Design::new());
        assert_eq!(meta.stitch_count, 0);
        assert_eq!(meta.bounds, Bounds::default());
        assert_eq!(meta.width_mm, 0.0);
    }

    #[test]
    fn test_bounds_exclude_origin() {
        let design = Design::from_parts(
            vec![Stitch::jump_by(50, 50), Stitch::move_by(25, -5), Stitch::End],
            vec![],
        )
        .unwrap();
        let meta = derive(&design);

        assert_eq!(
            meta.bounds,
            Bounds {
                min_x: 50,
                min_y: 45,
                max_x: 75,
                max_y: 50
            }
        );
        assert_eq!(meta.width_mm, 2.5);
        assert_eq!(meta.height_mm, 0.5);
    }

    #[test]
    fn test_report_format() {
        let decoded = emb::decode_default(&square_emb()).unwrap();
        let report = derive(&decoded.design).to_string();
        assert!(report.contains("Stitches:     3"));
        assert!(report.contains("Width (mm):   1.00"));
        assert!(report.contains("Bounds:       (0, 0) to (10, 10)"));
    }
}
