//! Cell parsing for dates, ore markers and leyline labels

use crate::error::ParseError;
use crate::models::{DateTriple, SENTINEL};
use crate::remote::DATE_FORMAT;
use chrono::{Datelike, NaiveDate};

/// Ore cell meaning "shown on the map"
pub const SHOWN: &str = "1";
/// Ore cell meaning "hidden, found by mining"
pub const HIDDEN: &str = "2";

/// Parse an `MM/DD/YY` cell into `[year, month, day]`
pub fn parse_date(row: usize, cell: &str) -> Result<DateTriple, ParseError> {
    let date = NaiveDate::parse_from_str(cell.trim(), DATE_FORMAT).map_err(|_| ParseError::Date {
        row,
        value: cell.to_string(),
    })?;
    Ok(date_triple(date))
}

pub fn date_triple(date: NaiveDate) -> DateTriple {
    [date.year(), date.month() as i32, date.day() as i32]
}

pub fn triple_to_date(triple: DateTriple) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(triple[0], u32::try_from(triple[1]).ok()?, u32::try_from(triple[2]).ok()?)
}

/// 0-based positions of cells equal to `marker`, or `[SENTINEL]` when none
pub fn ore_positions(cells: &[String], marker: &str) -> Vec<i32> {
    let positions: Vec<i32> = cells
        .iter()
        .enumerate()
        .filter(|(_, c)| c.trim() == marker)
        .map(|(i, _)| i as i32)
        .collect();
    if positions.is_empty() {
        vec![SENTINEL]
    } else {
        positions
    }
}

/// Split ore cells into `(shown, hidden)` index sets.
///
/// Blank cells are ignored; any other non-empty value makes the row ambiguous.
pub fn parse_ores(row: usize, cells: &[String]) -> Result<(Vec<i32>, Vec<i32>), ParseError> {
    if let Some(bad) = cells
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty() && *c != SHOWN && *c != HIDDEN)
    {
        return Err(ParseError::AmbiguousOre {
            row,
            value: bad.to_string(),
        });
    }
    Ok((ore_positions(cells, SHOWN), ore_positions(cells, HIDDEN)))
}

/// Locate the `'y'` and `'b'` cells; `[SENTINEL, SENTINEL]` unless both exist
pub fn parse_labels(cells: &[String]) -> [i32; 2] {
    let find = |mark: &str| cells.iter().position(|c| c.trim() == mark);
    match (find("y"), find("b")) {
        (Some(y), Some(b)) => [y as i32, b as i32],
        _ => [SENTINEL, SENTINEL],
    }
}

/// Strict form of `parse_labels` for history rows
pub fn parse_label_pair(row: usize, cells: &[String]) -> Result<[i32; 2], ParseError> {
    match parse_labels(cells) {
        [SENTINEL, SENTINEL] => Err(ParseError::MissingLabels { row }),
        pair => Ok(pair),
    }
}
