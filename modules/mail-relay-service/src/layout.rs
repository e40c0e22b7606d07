//! Column layout of a sink.
//!
//! Column letters from the sheet configuration are converted once into
//! 1-based indices (`A=1 .. Z=26, AA=27`) and cached per sink for the life
//! of the process. A built layout is never mutated.

use crate::config::SheetConfig;
use crate::error::ConfigError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Convert column letters to a 1-based column index (base-26, no zero digit)
pub fn column_index(letters: &str) -> Result<u32, ConfigError> {
    let letters = letters.trim();
    if letters.is_empty() {
        return Err(ConfigError::InvalidColumn(letters.to_string()));
    }

    let mut index: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return Err(ConfigError::InvalidColumn(letters.to_string()));
        }
        let digit = (c.to_ascii_uppercase() as u32) - ('A' as u32) + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .ok_or_else(|| ConfigError::InvalidColumn(letters.to_string()))?;
    }
    Ok(index)
}

/// Convert a 1-based column index back to letters
pub fn column_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Field name → 1-based column index for one sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutMap {
    columns: HashMap<String, u32>,
    width: u32,
}

impl LayoutMap {
    pub fn build(config: &SheetConfig) -> Result<Self, ConfigError> {
        let mut columns = HashMap::with_capacity(config.columns.len());
        for (name, letters) in &config.columns {
            columns.insert(name.clone(), column_index(letters)?);
        }
        let width = columns.values().copied().max().unwrap_or(0);
        Ok(Self { columns, width })
    }

    pub fn column(&self, name: &str) -> Option<u32> {
        self.columns.get(name).copied()
    }

    /// Letters of the rightmost column a placed row reaches
    pub fn last_column(&self) -> String {
        column_letters(self.width.max(1))
    }

    /// Place named values into a row as wide as the layout.
    /// Columns the layout does not name stay empty.
    pub fn place(&self, values: &[(&str, String)]) -> Result<Vec<String>, ConfigError> {
        let mut row = vec![String::new(); self.width as usize];
        for (name, value) in values {
            let col = self
                .column(name)
                .ok_or_else(|| ConfigError::Missing(format!("column for field '{}'", name)))?;
            row[(col - 1) as usize] = value.clone();
        }
        Ok(row)
    }
}

/// Lazily built, process-wide layouts keyed by sink identity
#[derive(Default)]
pub struct LayoutCache {
    layouts: DashMap<String, Arc<LayoutMap>>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached layout for this sheet, building it on first use
    pub fn get_or_build(&self, config: &SheetConfig) -> Result<Arc<LayoutMap>, ConfigError> {
        if let Some(layout) = self.layouts.get(&config.name) {
            return Ok(layout.clone());
        }
        let built = Arc::new(LayoutMap::build(config)?);
        // A concurrent builder may have won; keep whichever landed first.
        let entry = self
            .layouts
            .entry(config.name.clone())
            .or_insert(built)
            .clone();
        Ok(entry)
    }
}
