//! Named color entries and the table that owns them.
//!
//! A [`ColorEntry`] is the unit of work for the calibration orchestrator: one
//! named color with its nominal monitor stimulus value, the measured monitor
//! color, the resolved tube voltages, and the measured tube color. Entries
//! are created once per named color and mutated in place as each calibration
//! stage completes; a stage that fails leaves the earlier fields populated
//! and the later ones `None`, visible to the caller.
//!
//! [`ColorTable`] owns its entries, keeps them in insertion order, and also
//! offers name lookup. Lookup uses first-match semantics; duplicate names
//! are allowed but warned about at insertion, since they make name lookup
//! ambiguous.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::color::ColorTriple;
use crate::core::ControlVector;
use crate::error::AppResult;

/// All calibration data for one named color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorEntry {
    /// Unique-by-convention name, e.g. "color21".
    pub name: String,
    /// Nominal stimulus value shown on the monitor for this color.
    pub patch_stim_value: f64,
    /// Mean measured monitor color.
    pub monitor_xyy: Option<ColorTriple>,
    /// Per-component spread of the repeated monitor readings (uncorrected
    /// population variance, kept in the units downstream analysis expects).
    pub monitor_xyy_sd: Option<ColorTriple>,
    /// Resolved tube voltages.
    pub voltages: Option<ControlVector>,
    /// Mean measured tube color at those voltages.
    pub tubes_xyy: Option<ColorTriple>,
    /// Per-component spread of the repeated tube readings.
    pub tubes_xyy_sd: Option<ColorTriple>,
}

impl ColorEntry {
    /// Creates an entry with only the nominal stimulus value set.
    pub fn new(name: impl Into<String>, patch_stim_value: f64) -> Self {
        Self {
            name: name.into(),
            patch_stim_value,
            monitor_xyy: None,
            monitor_xyy_sd: None,
            voltages: None,
            tubes_xyy: None,
            tubes_xyy_sd: None,
        }
    }

    /// Creates an entry with known starting voltages (from an earlier run).
    pub fn with_voltages(
        name: impl Into<String>,
        patch_stim_value: f64,
        voltages: ControlVector,
    ) -> Self {
        Self {
            voltages: Some(voltages),
            ..Self::new(name, patch_stim_value)
        }
    }

    /// True once both the monitor side and the tube side have been measured.
    pub fn is_calibrated(&self) -> bool {
        self.monitor_xyy.is_some() && self.tubes_xyy.is_some()
    }
}

/// Insertion-ordered collection of color entries with name lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorTable {
    entries: Vec<ColorEntry>,
}

impl ColorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, warning if its name is already taken (lookup stays
    /// first-match, so the new entry would be shadowed by name).
    pub fn push(&mut self, entry: ColorEntry) {
        if self.get_by_name(&entry.name).is_some() {
            log::warn!(
                "duplicate color name '{}': name lookup will keep returning the first entry",
                entry.name
            );
        }
        self.entries.push(entry);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[ColorEntry] {
        &self.entries
    }

    /// Mutable access in insertion order.
    pub fn entries_mut(&mut self) -> &mut [ColorEntry] {
        &mut self.entries
    }

    /// First entry with the given name, if any.
    pub fn get_by_name(&self, name: &str) -> Option<&ColorEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Mutable first entry with the given name, if any.
    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut ColorEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    /// Saves the table as CSV.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            "name",
            "patch_stim_value",
            "monitor_x",
            "monitor_y",
            "monitor_Y",
            "monitor_sd_x",
            "monitor_sd_y",
            "monitor_sd_Y",
            "volR",
            "volG",
            "volB",
            "tubes_x",
            "tubes_y",
            "tubes_Y",
            "tubes_sd_x",
            "tubes_sd_y",
            "tubes_sd_Y",
        ])?;
        for e in &self.entries {
            let mut record = vec![e.name.clone(), e.patch_stim_value.to_string()];
            push_triple(&mut record, &e.monitor_xyy);
            push_triple(&mut record, &e.monitor_xyy_sd);
            match &e.voltages {
                Some(v) => record.extend(v.0.iter().map(|x| x.to_string())),
                None => record.extend([String::new(), String::new(), String::new()]),
            }
            push_triple(&mut record, &e.tubes_xyy);
            push_triple(&mut record, &e.tubes_xyy_sd);
            writer.write_record(&record)?;
        }
        writer.flush()?;
        log::info!(
            "Saved color table ({} entries) to {}",
            self.entries.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Loads a table previously written by [`Self::save_csv`]. Replaces the
    /// current contents entirely.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = csv::Reader::from_reader(file);
        let mut table = ColorTable::new();
        for record in reader.records() {
            let record = record?;
            let get = |i: usize| record.get(i).unwrap_or("").trim().to_string();
            let stim = match get(1).parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!(
                        "entry '{}': unreadable patch_stim_value '{}', using 0.0",
                        get(0),
                        get(1)
                    );
                    0.0
                }
            };
            let mut entry = ColorEntry::new(get(0), stim);
            entry.monitor_xyy = parse_triple(&get(2), &get(3), &get(4));
            entry.monitor_xyy_sd = parse_triple(&get(5), &get(6), &get(7));
            entry.voltages = match (
                get(8).parse::<i32>(),
                get(9).parse::<i32>(),
                get(10).parse::<i32>(),
            ) {
                (Ok(r), Ok(g), Ok(b)) => Some(ControlVector::new(r, g, b)),
                _ => None,
            };
            entry.tubes_xyy = parse_triple(&get(11), &get(12), &get(13));
            entry.tubes_xyy_sd = parse_triple(&get(14), &get(15), &get(16));
            table.push(entry);
        }
        log::info!(
            "Loaded color table ({} entries) from {}",
            table.len(),
            path.as_ref().display()
        );
        Ok(table)
    }
}

fn push_triple(record: &mut Vec<String>, triple: &Option<ColorTriple>) {
    match triple {
        Some(c) => {
            record.push(c.x.to_string());
            record.push(c.y.to_string());
            record.push(c.yy.to_string());
        }
        None => record.extend([String::new(), String::new(), String::new()]),
    }
}

fn parse_triple(x: &str, y: &str, yy: &str) -> Option<ColorTriple> {
    match (x.parse::<f64>(), y.parse::<f64>(), yy.parse::<f64>()) {
        (Ok(x), Ok(y), Ok(yy)) => Some(ColorTriple::new(x, y, yy)),
        _ => None,
    }
}
