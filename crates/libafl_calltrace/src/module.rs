//! Which module owns an address, and what is it called.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::linker::{Linker, ModuleInfo};

/// Memory interval occupied by a module, both bounds inclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRange {
    /// First byte
    pub base: u64,
    /// Last byte
    pub end: u64,
}

impl ModuleRange {
    /// A range from its inclusive bounds, `None` if `base > end`
    #[must_use]
    pub fn new(base: u64, end: u64) -> Option<Self> {
        (base <= end).then_some(Self { base, end })
    }

    /// The range a module of `size` bytes loaded at `base` occupies
    #[must_use]
    pub fn from_base_size(base: u64, size: u64) -> Self {
        Self {
            base,
            end: base.saturating_add(size.max(1) - 1),
        }
    }

    /// `base <= address <= end`
    #[inline]
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.base <= address && address <= self.end
    }
}

/// A module's range together with its exported symbols
#[derive(Clone, Debug, Default)]
pub struct ModuleSymbols {
    name: String,
    range: Option<ModuleRange>,
    symbols: HashMap<u64, Vec<String>>,
}

impl ModuleSymbols {
    /// An empty registry for the module `name` occupying `range`
    #[must_use]
    pub fn new(name: &str, range: ModuleRange) -> Self {
        Self {
            name: name.to_string(),
            range: Some(range),
            symbols: HashMap::new(),
        }
    }

    /// Enumerates the exports of `module` once, through `linker`
    #[must_use]
    pub fn from_linker(linker: &dyn Linker, module: &ModuleInfo) -> Self {
        let mut symbols = Self::new(
            &module.name,
            ModuleRange::from_base_size(module.base, module.size),
        );
        linker.enumerate_exports(module, &mut |name, address| {
            symbols.insert(address, name);
            true
        });
        log::debug!(
            "{}: {} symbols in {:#x}-{:#x}",
            module.name,
            symbols.len(),
            module.base,
            module.base + module.size
        );
        symbols
    }

    /// Adds a symbol. Aliases of an address are kept in the order they were seen.
    pub fn insert(&mut self, address: u64, name: &str) {
        let names = self.symbols.entry(address).or_default();
        if !names.iter().any(|known| known == name) {
            names.push(name.to_string());
        }
    }

    /// Makes `name` the name `address` resolves to, if it is one of its aliases
    pub fn prefer(&mut self, address: u64, name: &str) {
        if let Some(names) = self.symbols.get_mut(&address) {
            if let Some(position) = names.iter().position(|known| known == name) {
                names[..=position].rotate_right(1);
            }
        }
    }

    /// The same module with every symbol `rename` knows a better name for renamed
    #[must_use]
    pub fn renamed(&self, rename: impl Fn(&str) -> Option<String>) -> Self {
        let symbols = self
            .symbols
            .iter()
            .map(|(address, names)| {
                let names = names
                    .iter()
                    .map(|name| rename(name).unwrap_or_else(|| name.clone()))
                    .collect();
                (*address, names)
            })
            .collect();
        Self {
            name: self.name.clone(),
            range: self.range,
            symbols,
        }
    }

    /// The module name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module's interval
    #[must_use]
    pub fn range(&self) -> Option<ModuleRange> {
        self.range
    }

    /// Whether `address` lies inside the module
    #[must_use]
    pub fn is_owned(&self, address: u64) -> bool {
        self.range.is_some_and(|range| range.contains(address))
    }

    /// The symbol exported at exactly `address`, the preferred one among aliases
    #[must_use]
    pub fn resolve_symbol(&self, address: u64) -> Option<&str> {
        self.aliases(address).first().map(String::as_str)
    }

    /// Every name exported at exactly `address`
    #[must_use]
    pub fn aliases(&self, address: u64) -> &[String] {
        self.symbols
            .get(&address)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All symbol addresses with their names, unordered
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[String])> {
        self.symbols.iter().map(|(a, n)| (*a, n.as_slice()))
    }

    /// Number of addresses with a symbol
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// No symbols known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ModuleRange, ModuleSymbols};

    #[test]
    fn bounds_are_inclusive() {
        let range = ModuleRange::new(0x1000, 0x1fff).unwrap();
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0xfff));
        assert!(!range.contains(0x2000));
        assert!(ModuleRange::new(2, 1).is_none());
        assert_eq!(ModuleRange::from_base_size(0x1000, 0x1000), range);
    }

    #[test]
    fn ownership_matches_interval_everywhere() {
        let range = ModuleRange::new(0x40, 0x80).unwrap();
        for address in 0..0x100u64 {
            assert_eq!(range.contains(address), (0x40..=0x80).contains(&address));
        }
    }

    #[test]
    fn exact_symbol_lookup() {
        let mut symbols = ModuleSymbols::new("libc.so", ModuleRange::from_base_size(0x1000, 0x100));
        symbols.insert(0x1010, "strlen");
        symbols.insert(0x1010, "__strlen_alias");
        symbols.insert(0x1010, "strlen");
        assert_eq!(symbols.resolve_symbol(0x1010), Some("strlen"));
        assert_eq!(symbols.aliases(0x1010), ["strlen", "__strlen_alias"]);
        assert_eq!(symbols.resolve_symbol(0x1011), None);
        assert!(symbols.aliases(0x1011).is_empty());
        assert!(symbols.is_owned(0x10ff));
        assert!(!symbols.is_owned(0x1100));
        assert_eq!(symbols.len(), 1);
    }

    #[test]
    fn preferred_alias_resolves_first() {
        let mut symbols = ModuleSymbols::new("libc.so", ModuleRange::from_base_size(0x1000, 0x200));
        symbols.insert(0x1100, "__libc_malloc");
        symbols.insert(0x1100, "__malloc_impl");
        symbols.insert(0x1100, "malloc");
        symbols.prefer(0x1100, "malloc");
        assert_eq!(symbols.resolve_symbol(0x1100), Some("malloc"));
        assert_eq!(
            symbols.aliases(0x1100),
            ["malloc", "__libc_malloc", "__malloc_impl"]
        );
        symbols.prefer(0x1100, "calloc");
        assert_eq!(symbols.resolve_symbol(0x1100), Some("malloc"));
    }
}
