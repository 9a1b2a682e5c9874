//! Splits a canvas into per-unit sub-images.
//!
//! Units are stacked vertically in order of their configured position; each
//! unit receives the canvas rows `[offset, offset + height)`.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::canvas::Canvas;
use crate::unit::{Unit, UnitId};
use crate::{Error, Result};

/// The slice of the canvas assigned to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubImage {
    pub unit: UnitId,
    /// Canvas rows covered by this unit.
    pub rows: Range<u32>,
    pub width: u32,
    pub height: u32,
    /// RGB888 pixel bytes, row-major.
    pub pixels: Vec<u8>,
}

/// Checks that the canvas matches the stacked unit geometry.
pub fn validate(canvas: &Canvas, units: &[Unit]) -> Result<()> {
    if units.is_empty() {
        return Err(Error::Config("no units configured".to_string()));
    }

    for unit in units {
        if unit.width() != canvas.width() {
            return Err(Error::Config(format!(
                "unit {} is {} px wide but canvas is {} px wide",
                unit.id,
                unit.width(),
                canvas.width()
            )));
        }
    }

    let total: u64 = units.iter().map(|u| u64::from(u.height())).sum();
    if total != u64::from(canvas.height()) {
        return Err(Error::Config(format!(
            "units stack to {} px but canvas is {} px tall",
            total,
            canvas.height()
        )));
    }
    Ok(())
}

/// Splits the canvas across units ordered by stacking position.
pub fn split(canvas: &Canvas, units: &[Unit]) -> Result<BTreeMap<UnitId, SubImage>> {
    validate(canvas, units)?;

    let mut ordered: Vec<&Unit> = units.iter().collect();
    ordered.sort_by_key(|u| u.position);

    let mut parts = BTreeMap::new();
    let mut offset = 0u32;
    for unit in ordered {
        let rows = offset..offset + unit.height();
        let pixels = canvas
            .rows(rows.clone())
            .ok_or_else(|| Error::Config(format!("rows {:?} outside canvas", rows)))?
            .to_vec();
        parts.insert(
            unit.id,
            SubImage {
                unit: unit.id,
                rows: rows.clone(),
                width: unit.width(),
                height: unit.height(),
                pixels,
            },
        );
        offset = rows.end;
    }

    Ok(parts)
}
