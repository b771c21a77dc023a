//! Nearest-symbol resolution of instruction pointers.
//!
//! Symbol information is best effort, an address with nothing known about
//! it resolves to [`Resolution::Unknown`], it is never an error.

use crate::Error;
use std::ffi::CStr;

/// A symbol an address resolved to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SymbolRef<'r> {
    pub name: &'r str,
    /// Start address of the symbol
    pub address: usize,
    /// How far into the symbol the resolved address is
    pub offset: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution<'r> {
    Known {
        symbol: Option<SymbolRef<'r>>,
        /// Path of the image that contains the address
        image: Option<&'r str>,
    },
    Unknown,
}

impl<'r> Resolution<'r> {
    #[inline]
    pub fn symbol(&self) -> Option<SymbolRef<'r>> {
        match self {
            Self::Known { symbol, .. } => *symbol,
            Self::Unknown => None,
        }
    }

    #[inline]
    pub fn image(&self) -> Option<&'r str> {
        match self {
            Self::Known { image, .. } => *image,
            Self::Unknown => None,
        }
    }
}

/// A walked frame together with what is known about its address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFrame<'r> {
    /// 0 for the frame that trapped
    pub index: usize,
    pub ip: usize,
    pub symbol: Option<SymbolRef<'r>>,
    pub image: Option<&'r str>,
}

impl<'r> ResolvedFrame<'r> {
    #[inline]
    pub fn new(index: usize, ip: usize, resolution: Resolution<'r>) -> Self {
        Self {
            index,
            ip,
            symbol: resolution.symbol(),
            image: resolution.image(),
        }
    }
}

/// Maps instruction pointers to the nearest preceding symbol.
///
/// Implementations used from the dispatcher must not allocate or lock.
pub trait SymbolResolver {
    fn resolve(&self, ip: usize) -> Resolution<'_>;
}

#[derive(Clone, Debug)]
struct Symbol {
    name: Box<str>,
    start: usize,
    /// 0 if the size is unknown
    size: usize,
}

/// A sorted table of the function symbols of a single image, built up front
/// so that lookups are a binary search without any allocation.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    image: Box<str>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into().into_boxed_str(),
            symbols: Vec::new(),
        }
    }

    /// Adds a symbol, a `size` of 0 means the symbol extends up to the next
    /// one
    pub fn push(&mut self, name: impl Into<String>, start: usize, size: usize) -> &mut Self {
        self.symbols.push(Symbol {
            name: name.into().into_boxed_str(),
            start,
            size,
        });
        self
    }

    /// Sorts the table, must be called after the last [`Self::push`]
    pub fn finish(mut self) -> Self {
        // Sized entries sort ahead of unsized ones at the same address, so
        // the dedup below keeps a symbol with a known extent
        self.symbols.sort_by_key(|sym| (sym.start, sym.size == 0));
        self.symbols.dedup_by_key(|sym| sym.start);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    #[inline]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Builds a table from the `.symtab` and `.dynsym` function symbols of an
    /// ELF image that was loaded with `load_bias` added to its addresses.
    /// Names are demangled.
    pub fn from_elf(bytes: &[u8], image: impl Into<String>, load_bias: usize) -> Result<Self, Error> {
        use goblin::elf::{header::ET_DYN, Elf};

        let elf = Elf::parse(bytes)?;

        // Only position independent images are relocated by the loader
        let bias = if elf.header.e_type == ET_DYN { load_bias } else { 0 };

        let mut table = Self::new(image);

        let symtab = elf.syms.iter().map(|sym| (sym, &elf.strtab));
        let dynsym = elf.dynsyms.iter().map(|sym| (sym, &elf.dynstrtab));

        for (sym, strtab) in symtab.chain(dynsym) {
            if !sym.is_function() || sym.st_value == 0 {
                continue;
            }

            let Some(name) = strtab.get_at(sym.st_name).filter(|name| !name.is_empty()) else {
                continue;
            };

            table.push(
                format!("{:#}", rustc_demangle::demangle(name)),
                (sym.st_value as usize).wrapping_add(bias),
                sym.st_size as usize,
            );
        }

        Ok(table.finish())
    }

    /// Builds a table for the executable of the current process
    pub fn from_current_exe() -> Result<Self, Error> {
        let path = std::env::current_exe()?;
        let bytes = std::fs::read("/proc/self/exe")?;

        let load_bias = image_base(Self::from_current_exe as *const libc::c_void).unwrap_or(0);

        let table = Self::from_elf(&bytes, path.to_string_lossy(), load_bias)?;
        log::debug!(
            "loaded {} symbols for {} (bias {:#x})",
            table.len(),
            table.image(),
            load_bias
        );

        Ok(table)
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, ip: usize) -> Resolution<'_> {
        let following = self.symbols.partition_point(|sym| sym.start <= ip);

        let Some(sym) = following.checked_sub(1).and_then(|i| self.symbols.get(i)) else {
            return Resolution::Unknown;
        };

        let offset = ip - sym.start;

        let within = if sym.size != 0 {
            offset < sym.size
        } else {
            // Without a size only accept the address if it isn't past the
            // last symbol, nothing is known about what follows it
            following < self.symbols.len()
        };

        if !within {
            return Resolution::Unknown;
        }

        Resolution::Known {
            symbol: Some(SymbolRef {
                name: &sym.name,
                address: sym.start,
                offset,
            }),
            image: Some(&self.image),
        }
    }
}

/// Base address of the loaded image containing `addr`
fn image_base(addr: *const libc::c_void) -> Option<usize> {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        (libc::dladdr(addr, &mut info) != 0 && !info.dli_fbase.is_null())
            .then(|| info.dli_fbase as usize)
    }
}

/// Resolves through the dynamic loader's own symbol tables.
///
/// This only sees exported symbols and `dladdr` is not guaranteed to be
/// async-signal-safe, so prefer a [`SymbolTable`] for the fault path.
#[derive(Copy, Clone, Debug, Default)]
pub struct DladdrResolver;

impl SymbolResolver for DladdrResolver {
    fn resolve(&self, ip: usize) -> Resolution<'_> {
        if ip == 0 {
            return Resolution::Unknown;
        }

        unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(ip as *const libc::c_void, &mut info) == 0 {
                return Resolution::Unknown;
            }

            // The strings are owned by the loader and live as long as the
            // image stays loaded
            let as_str = |ptr: *const libc::c_char| {
                (!ptr.is_null())
                    .then(|| CStr::from_ptr(ptr).to_str().ok())
                    .flatten()
            };

            let symbol = as_str(info.dli_sname).map(|name| SymbolRef {
                name,
                address: info.dli_saddr as usize,
                offset: ip.wrapping_sub(info.dli_saddr as usize),
            });

            Resolution::Known {
                symbol,
                image: as_str(info.dli_fname),
            }
        }
    }
}

/// The resolver the dispatcher is configured with
#[derive(Clone, Default)]
pub enum Symbolizer {
    #[default]
    Disabled,
    Table(SymbolTable),
    Dladdr(DladdrResolver),
    /// A resolver supplied by the application, it runs inside the signal
    /// handler and must be async-signal-safe
    Custom(&'static (dyn SymbolResolver + Send + Sync)),
}

impl std::fmt::Debug for Symbolizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Table(table) => f.debug_tuple("Table").field(table).finish(),
            Self::Dladdr(dladdr) => f.debug_tuple("Dladdr").field(dladdr).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl SymbolResolver for Symbolizer {
    fn resolve(&self, ip: usize) -> Resolution<'_> {
        match self {
            Self::Disabled => Resolution::Unknown,
            Self::Table(table) => table.resolve(ip),
            Self::Dladdr(dladdr) => dladdr.resolve(ip),
            Self::Custom(resolver) => resolver.resolve(ip),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn table() -> SymbolTable {
        let mut table = SymbolTable::new("/usr/bin/app");
        table
            .push("megafunc", 0x3000, 0x3c)
            .push("superfunc", 0x1000, 0x10)
            .push("awesomefunc", 0x2000, 0)
            .push("alias", 0x1000, 0x10);
        table.finish()
    }

    #[rstest]
    #[case(0x1000, Some(("superfunc", 0)))]
    #[case(0x100f, Some(("superfunc", 0xf)))]
    #[case(0x1010, None)]
    #[case(0x2fff, Some(("awesomefunc", 0xfff)))]
    #[case(0x303b, Some(("megafunc", 0x3b)))]
    #[case(0x303c, None)]
    #[case(0xfff, None)]
    fn nearest(#[case] ip: usize, #[case] expected: Option<(&str, usize)>) {
        let table = table();
        let res = table.resolve(ip);

        assert_eq!(
            res.symbol().map(|sym| (sym.name, sym.offset)),
            expected,
            "{:#x}",
            ip
        );

        if expected.is_some() {
            assert_eq!(res.image(), Some("/usr/bin/app"));
        } else {
            assert_eq!(res, Resolution::Unknown);
        }
    }

    #[test]
    fn dedups_aliases() {
        assert_eq!(table().len(), 3);

        let mut table = SymbolTable::new("/usr/bin/app");
        table
            .push("unsized", 0x1000, 0)
            .push("sized", 0x1000, 0x20)
            .push("after", 0x2000, 0x10);
        let table = table.finish();

        assert_eq!(table.len(), 2);
        let sym = table.resolve(0x1008).symbol().unwrap();
        assert_eq!((sym.name, sym.offset), ("sized", 8));
        // Outside of the sized symbol, nothing is claimed
        assert_eq!(table.resolve(0x1800), Resolution::Unknown);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(0xdead_beef)]
    #[case(usize::MAX)]
    #[case(usize::MAX - 0xfff)]
    fn resolution_is_total(#[case] ip: usize) {
        // Nothing is mapped at these addresses, none of the resolvers may
        // fail on them
        let _ = table().resolve(ip);
        let _ = DladdrResolver.resolve(ip);
        assert_eq!(Symbolizer::Disabled.resolve(ip), Resolution::Unknown);
        assert_eq!(SymbolTable::new("empty").finish().resolve(ip), Resolution::Unknown);
    }

    #[inline(never)]
    #[no_mangle]
    pub extern "C" fn capture_handler_symbol_probe() -> usize {
        std::hint::black_box(42)
    }

    #[test]
    fn current_exe() {
        let table = SymbolTable::from_current_exe().unwrap();
        assert!(!table.is_empty());

        let addr = capture_handler_symbol_probe as usize;
        let sym = table.resolve(addr + 1).symbol().unwrap();
        assert_eq!(sym.name, "capture_handler_symbol_probe");
        assert_eq!(sym.address, addr);
        assert_eq!(sym.offset, 1);
    }

    #[test]
    fn dladdr_finds_libc() {
        let res = DladdrResolver.resolve(libc::getpid as usize);
        assert!(res.image().is_some());
    }
}
