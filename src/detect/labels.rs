use std::path::Path;

use anyhow::{Context, Result};

/// Class-index to label mapping for one trained model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassCatalog {
    names: Vec<String>,
}

impl ClassCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// One label per line; blank lines and surrounding whitespace are ignored.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
        )
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read label file {}", path.display()))?;
        let catalog = Self::parse(&text);
        log::debug!("loaded {} labels from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Label for `index`, or the index itself when the catalog has no entry.
    pub fn resolve(&self, index: u32) -> String {
        self.names
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
