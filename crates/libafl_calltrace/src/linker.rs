//! Finding loaded modules and their exports.

use std::{fs, path::PathBuf};

use goblin::elf::{header::EM_ARM, program_header::PT_LOAD, sym, Elf};

use crate::Error;

/// A loaded module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// File name, e.g. `libc.so.6`
    pub name: String,
    /// Full path of the backing file, if any
    pub path: Option<PathBuf>,
    /// Lowest mapped address
    pub base: u64,
    /// Mapped size in bytes
    pub size: u64,
}

impl ModuleInfo {
    /// Whether `address` lies in `[base, base + size)`
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.base <= address && address - self.base < self.size
    }

    /// Whether this module is the one requested as `name`: same file name, or `name`
    /// followed by a version suffix (`libc.so` matches `libc.so.6`)
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name
            || self
                .name
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// The dynamic linker, as far as the tracer needs it
pub trait Linker {
    /// Finds a module by file name
    fn find_module_by_name(&self, name: &str) -> Option<ModuleInfo>;

    /// Finds the module containing `address`
    fn find_module_by_address(&self, address: u64) -> Option<ModuleInfo>;

    /// Calls `f(name, address)` for every exported symbol of `module` until it returns `false`
    fn enumerate_exports(&self, module: &ModuleInfo, f: &mut dyn FnMut(&str, u64) -> bool);

    /// Address of the export `symbol` in `module`
    fn find_export(&self, module: &ModuleInfo, symbol: &str) -> Option<u64> {
        let mut found = None;
        self.enumerate_exports(module, &mut |name, address| {
            if name == symbol {
                found = Some(address);
                false
            } else {
                true
            }
        });
        found
    }
}

/// The modules of the current process, read from `/proc/self/maps`
#[derive(Debug, Default)]
pub struct ProcessLinker {
    modules: Vec<ModuleInfo>,
}

impl ProcessLinker {
    /// Snapshot of the modules currently mapped into this process
    pub fn new() -> Result<Self, Error> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        Ok(Self {
            modules: parse_maps(&maps),
        })
    }

    /// All modules, ordered by base address
    #[must_use]
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    fn exports(module: &ModuleInfo) -> Result<Vec<(String, u64)>, Error> {
        let path = module
            .path
            .as_ref()
            .ok_or_else(|| Error::key_not_found(format!("no file backs {}", module.name)))?;
        let bytes = fs::read(path)?;
        let elf = Elf::parse(&bytes)?;

        let lowest_vaddr = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| ph.p_vaddr & !0xfff)
            .min()
            .unwrap_or(0);
        let bias = module.base.wrapping_sub(lowest_vaddr);
        let thumb_bit = if elf.header.e_machine == EM_ARM { !1 } else { !0 };

        let mut exports = Vec::new();
        let tables = [(&elf.dynsyms, &elf.dynstrtab), (&elf.syms, &elf.strtab)];
        for (symbols, strings) in tables {
            for symbol in symbols.iter() {
                let kind = symbol.st_type();
                if symbol.st_value == 0
                    || symbol.st_shndx == 0
                    || !matches!(kind, sym::STT_FUNC | sym::STT_OBJECT | sym::STT_GNU_IFUNC)
                {
                    continue;
                }
                let Some(name) = strings.get_at(symbol.st_name) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let value = if kind == sym::STT_OBJECT {
                    symbol.st_value
                } else {
                    symbol.st_value & thumb_bit
                };
                exports.push((name.to_string(), bias.wrapping_add(value)));
            }
        }
        Ok(exports)
    }
}

/// Groups the file-backed mappings of a `/proc/<pid>/maps` dump into modules
#[must_use]
pub fn parse_maps(maps: &str) -> Vec<ModuleInfo> {
    let mut modules: Vec<ModuleInfo> = Vec::new();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(_perms), Some(_offset), Some(_dev), Some(_inode)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let path = fields.collect::<Vec<_>>().join(" ");
        if !path.starts_with('/') {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
        ) else {
            continue;
        };

        let path = PathBuf::from(path);
        if let Some(module) = modules
            .iter_mut()
            .find(|m| m.path.as_ref() == Some(&path))
        {
            let module_end = (module.base + module.size).max(end);
            module.base = module.base.min(start);
            module.size = module_end - module.base;
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            modules.push(ModuleInfo {
                name,
                path: Some(path),
                base: start,
                size: end - start,
            });
        }
    }
    modules.sort_by_key(|m| m.base);
    modules
}

impl Linker for ProcessLinker {
    fn find_module_by_name(&self, name: &str) -> Option<ModuleInfo> {
        self.modules.iter().find(|m| m.matches_name(name)).cloned()
    }

    fn find_module_by_address(&self, address: u64) -> Option<ModuleInfo> {
        self.modules.iter().find(|m| m.contains(address)).cloned()
    }

    fn enumerate_exports(&self, module: &ModuleInfo, f: &mut dyn FnMut(&str, u64) -> bool) {
        match Self::exports(module) {
            Ok(exports) => {
                for (name, address) in exports {
                    if !f(&name, address) {
                        break;
                    }
                }
            }
            Err(err) => log::warn!("Could not enumerate exports of {}: {err}", module.name),
        }
    }
}

/// A fixed set of modules and exports, for replaying traces and for tests
#[derive(Clone, Debug, Default)]
pub struct StaticLinker {
    modules: Vec<(ModuleInfo, Vec<(String, u64)>)>,
}

impl StaticLinker {
    /// No modules
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module with exports given as offsets from its base
    #[must_use]
    pub fn with_module(mut self, name: &str, base: u64, size: u64, exports: &[(&str, u64)]) -> Self {
        let info = ModuleInfo {
            name: name.to_string(),
            path: None,
            base,
            size,
        };
        let exports = exports
            .iter()
            .map(|(symbol, offset)| ((*symbol).to_string(), base + offset))
            .collect();
        self.modules.push((info, exports));
        self
    }
}

impl Linker for StaticLinker {
    fn find_module_by_name(&self, name: &str) -> Option<ModuleInfo> {
        self.modules
            .iter()
            .find(|(m, _)| m.matches_name(name))
            .map(|(m, _)| m.clone())
    }

    fn find_module_by_address(&self, address: u64) -> Option<ModuleInfo> {
        self.modules
            .iter()
            .find(|(m, _)| m.contains(address))
            .map(|(m, _)| m.clone())
    }

    fn enumerate_exports(&self, module: &ModuleInfo, f: &mut dyn FnMut(&str, u64) -> bool) {
        let Some((_, exports)) = self.modules.iter().find(|(m, _)| m == module) else {
            return;
        };
        for (name, address) in exports {
            if !f(name, *address) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_maps, Linker, ProcessLinker, StaticLinker};

    const MAPS: &str = "\
7f0000000000-7f0000028000 r--p 00000000 fd:01 1234  /usr/lib/aarch64-linux-gnu/libc.so.6
7f0000028000-7f00001b0000 r-xp 00028000 fd:01 1234  /usr/lib/aarch64-linux-gnu/libc.so.6
7f00001b0000-7f00001c0000 rw-p 001b0000 fd:01 1234  /usr/lib/aarch64-linux-gnu/libc.so.6
7f00001c0000-7f00001d0000 rw-p 00000000 00:00 0
7f0000200000-7f0000210000 r-xp 00000000 fd:01 99    /usr/lib/libz.so.1.2.13
7ffff0000000-7ffff0021000 rw-p 00000000 00:00 0     [stack]
";

    #[test]
    fn maps_are_grouped_per_file() {
        let modules = parse_maps(MAPS);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "libc.so.6");
        assert_eq!(modules[0].base, 0x7f00_0000_0000);
        assert_eq!(modules[0].size, 0x1c_0000);
        assert!(modules[0].matches_name("libc.so"));
        assert!(!modules[0].matches_name("libc"));
        assert!(modules[1].matches_name("libz.so"));
    }

    #[test]
    fn static_linker_lookups() {
        let linker = StaticLinker::new().with_module("libc.so", 0x1000, 0x1000, &[("strlen", 0x10)]);
        let libc = linker.find_module_by_name("libc.so").unwrap();
        assert_eq!(linker.find_export(&libc, "strlen"), Some(0x1010));
        assert_eq!(linker.find_export(&libc, "strcmp"), None);
        assert_eq!(linker.find_module_by_address(0x1fff), Some(libc));
        assert_eq!(linker.find_module_by_address(0x2000), None);
    }

    #[test]
    fn process_linker_sees_itself() {
        let linker = ProcessLinker::new().unwrap();
        let here = process_linker_sees_itself as usize as u64;
        let module = linker.find_module_by_address(here).unwrap();
        assert!(module.contains(here));
        assert!(module.path.is_some());
        assert!(linker.modules().contains(&module));
        assert!(linker
            .modules()
            .windows(2)
            .all(|pair| pair[0].base <= pair[1].base));
    }
}
