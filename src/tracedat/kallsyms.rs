//! Kernel symbol table from the capture's kallsyms part.

use std::collections::BTreeMap;

/// Function start addresses mapped to their names.
#[derive(Debug, Default, Clone)]
pub struct KernelSymbols {
    symbols: BTreeMap<u64, String>,
}

impl KernelSymbols {
    /// Parses `/proc/kallsyms` text: `addr type name [\t[module]]` per line.
    /// Absolute (`A`) symbols are per-cpu offsets and never match an ip.
    pub fn parse(text: &str) -> Self {
        let mut symbols = BTreeMap::new();
        for line in text.lines() {
            let mut parts = line.splitn(3, ' ');
            let (Some(addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            if kind.len() != 1 || kind == "A" {
                continue;
            }
            let name = match name.split_once('\t') {
                Some((func, module)) if module.starts_with('[') => func,
                _ => name,
            };
            if !name.is_empty() {
                symbols.insert(addr, name.to_string());
            }
        }
        KernelSymbols { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The function containing `addr`: the closest symbol at or below it.
    pub fn find(&self, addr: u64) -> Option<&str> {
        self.symbols.range(..=addr).next_back().map(|(_, name)| name.as_str())
    }
}
