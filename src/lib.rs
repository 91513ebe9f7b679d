//! A small library for building ELF32/ELF64 object and executable images in
//! memory, plus a minimal x86-64 instruction encoder to feed `.text`
//! payloads into it.
//!
//! This is a specialized utility library focused on that singular task. It
//! isn't a generic linker or a reader for arbitrary ELF files; it only
//! produces images, and only the subset of ELF this crate's callers need:
//! no relocations, no dynamic-linking tables, no DWARF.
//!
//! ```
//! use elfasm::format::{EM_X86_64, STB_GLOBAL, STB_LOCAL, STT_NOTYPE, STT_SECTION};
//! use elfasm::format::{ProgramFlags, SectionFlags, SectionType, PT_LOAD};
//! use elfasm::model::Builder;
//! use elfasm::x86;
//!
//! let mut b = Builder::new(EM_X86_64);
//! let strtab = b.strtab;
//! let symtab = b.new_symtab(strtab, ".symtab");
//!
//! let text = b.new_data();
//! x86::mov32_imm32(b.data_mut(text), x86::Reg::Bx, 42);
//! x86::mov32_imm32(b.data_mut(text), x86::Reg::Ax, 1);
//! b.data_mut(text).append(&[0xcd, 0x80]); // int 0x80
//!
//! let flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
//! let text_section = b.new_section(".text", SectionType::PROGBITS, Some(text), flags);
//! b.new_program(PT_LOAD, ProgramFlags::R | ProgramFlags::X, 0x200000, Some(text));
//!
//! b.symtab_add(symtab, Some(text_section), "", STB_LOCAL, STT_SECTION, 0x400078);
//! b.symtab_add(symtab, Some(text_section), "_start", STB_GLOBAL, STT_NOTYPE, 0x400078);
//!
//! let image = elfasm::assembler::assemble(&b);
//! assert_eq!(&image[0..4], b"\x7fELF");
//! ```

pub mod assembler;
pub mod buffer;
pub mod format;
pub mod model;
pub mod x86;

pub use assembler::assemble;
pub use buffer::ByteBuffer;
pub use model::{Builder, DataId, ElfClass, ProgramId, SectionId, SymbolId};

#[cfg(test)]
mod tests;
