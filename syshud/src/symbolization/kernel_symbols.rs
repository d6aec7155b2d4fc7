//! Kernel symbol table from `/proc/kallsyms`
//!
//! The snapshot is taken once per resolver and sorted by address. Only text
//! symbols are kept. When `kptr_restrict` hides addresses every entry reads
//! as zero and the table is treated as empty.

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct KernelSymbols {
    symbols: Vec<(u64, String)>,
}

impl KernelSymbols {
    /// Load and parse a kallsyms file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table = Self::parse(&content);
        info!("Loaded {} kernel symbols from {}", table.len(), path.display());
        Ok(table)
    }

    /// Parse kallsyms text: `<hex address> <type letter> <name>[\t[module]]` per line
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut symbols = Vec::new();
        let mut all_zero = true;

        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            if !matches!(kind, "t" | "T" | "w" | "W") {
                continue;
            }

            let Ok(address) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            all_zero &= address == 0;
            symbols.push((address, name.to_string()));
        }

        if all_zero && !symbols.is_empty() {
            warn!(
                "Kernel symbol addresses are hidden (kptr_restrict); kernel frames will be unnamed"
            );
            symbols.clear();
        }

        symbols.sort_by_key(|(address, _)| *address);
        Self { symbols }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Name of the symbol with the greatest address not above `address`
    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<&str> {
        let index = self.symbols.partition_point(|(start, _)| *start <= address);
        index.checked_sub(1).map(|i| self.symbols[i].1.as_str())
    }
}
