//! Raw ELF constants and on-disk header layouts.
//!
//! Everything here is a direct transcription of the Portable Formats
//! Specification / AMD64 psABI: numeric values, field order and widths.
//! Nothing in this module knows about the builder's in-memory model; it only
//! packs and unpacks the fixed-size records that go in and out of an
//! [`ByteBuffer`](crate::buffer::ByteBuffer).

use bitflags::bitflags;

pub const EI_NIDENT: usize = 16;
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;

pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const EV_CURRENT: u8 = 1;
pub const ELFOSABI_NONE: u8 = 0;

pub const ET_NONE: u16 = 0;
pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const EM_386: u16 = 3;
pub const EM_X86_64: u16 = 62;
pub const EM_ARM: u16 = 40;
pub const EM_AARCH64: u16 = 183;
pub const EM_RISCV: u16 = 243;

pub const SHN_UNDEF: u32 = 0;
pub const SHN_ABS: u32 = 0xfff1;
pub const SHN_COMMON: u32 = 0xfff2;
pub const SHN_XINDEX: u32 = 0xffff;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_SHLIB: u32 = 5;
pub const PT_PHDR: u32 = 6;
pub const PT_TLS: u32 = 7;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;
pub const STT_COMMON: u8 = 5;

pub const fn st_info(bind: u8, kind: u8) -> u8 {
    (bind << 4) | (kind & 0xf)
}

pub const fn st_bind(info: u8) -> u8 {
    info >> 4
}

pub const fn st_type(info: u8) -> u8 {
    info & 0xf
}

bitflags! {
    /// `PF_*` program-header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProgramFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

bitflags! {
    /// `SHF_*` section flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        const WRITE = 0x1;
        const ALLOC = 0x2;
        const EXECINSTR = 0x4;
        const MERGE = 0x10;
        const STRINGS = 0x20;
        const INFO_LINK = 0x40;
        const LINK_ORDER = 0x80;
        const TLS = 0x400;
    }
}

/// `SHT_*` section type codes. Kept as a transparent wrapper, not a closed
/// enum, because OS/processor/user-defined ranges are legal values the
/// builder must pass through unexamined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionType(pub u32);

impl SectionType {
    pub const NULL: Self = Self(0);
    pub const PROGBITS: Self = Self(1);
    pub const SYMTAB: Self = Self(2);
    pub const STRTAB: Self = Self(3);
    pub const RELA: Self = Self(4);
    pub const HASH: Self = Self(5);
    pub const DYNAMIC: Self = Self(6);
    pub const NOTE: Self = Self(7);
    pub const NOBITS: Self = Self(8);
    pub const REL: Self = Self(9);
    pub const SHLIB: Self = Self(10);
    pub const DYNSYM: Self = Self(11);
    pub const INIT_ARRAY: Self = Self(14);
    pub const FINI_ARRAY: Self = Self(15);
    pub const PREINIT_ARRAY: Self = Self(16);
    pub const GROUP: Self = Self(17);
    pub const SYMTAB_SHNDX: Self = Self(18);

    /// Whether a section of this type must, must not, or may optionally
    /// carry a [`Data`](crate::model::DataId).
    pub fn data_requirement(self) -> DataRequirement {
        match self {
            Self::NULL | Self::NOBITS | Self::GROUP => DataRequirement::Forbidden,
            Self::PROGBITS
            | Self::SYMTAB
            | Self::STRTAB
            | Self::RELA
            | Self::REL
            | Self::HASH
            | Self::DYNSYM
            | Self::INIT_ARRAY
            | Self::FINI_ARRAY
            | Self::PREINIT_ARRAY
            | Self::SYMTAB_SHNDX => DataRequirement::Required,
            _ => DataRequirement::Optional,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRequirement {
    Forbidden,
    Required,
    Optional,
}

/// Returns the mode (32 or 64) and default encoding (always 2LSB, per the
/// resolved Open Question) for a machine code.
pub fn machine_mode(machine: u16) -> u8 {
    match machine {
        EM_386 | EM_ARM => 32,
        EM_X86_64 | EM_AARCH64 | EM_RISCV => 64,
        _ => 32,
    }
}

pub const EHDR32_SIZE: usize = 52;
pub const EHDR64_SIZE: usize = 64;
pub const PHDR32_SIZE: usize = 32;
pub const PHDR64_SIZE: usize = 56;
pub const SHDR32_SIZE: usize = 40;
pub const SHDR64_SIZE: usize = 64;
pub const SYM32_SIZE: usize = 16;
pub const SYM64_SIZE: usize = 24;

/// Raw fields of an ELF header, independent of word size. Packing fills in
/// `e_ehsize`/`e_phentsize`/`e_shentsize` from the target mode itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EhdrFields {
    pub class: u8,
    pub data: u8,
    pub osabi: u8,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

pub fn pack_ehdr32(f: &EhdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), EHDR32_SIZE);
    pack_ident(f, out);
    out[16..18].copy_from_slice(&f.e_type.to_le_bytes());
    out[18..20].copy_from_slice(&f.e_machine.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..28].copy_from_slice(&(f.e_entry as u32).to_le_bytes());
    out[28..32].copy_from_slice(&(f.e_phoff as u32).to_le_bytes());
    out[32..36].copy_from_slice(&(f.e_shoff as u32).to_le_bytes());
    out[36..40].copy_from_slice(&f.e_flags.to_le_bytes());
    out[40..42].copy_from_slice(&(EHDR32_SIZE as u16).to_le_bytes());
    out[42..44].copy_from_slice(&(PHDR32_SIZE as u16).to_le_bytes());
    out[44..46].copy_from_slice(&f.e_phnum.to_le_bytes());
    out[46..48].copy_from_slice(&(SHDR32_SIZE as u16).to_le_bytes());
    out[48..50].copy_from_slice(&f.e_shnum.to_le_bytes());
    out[50..52].copy_from_slice(&f.e_shstrndx.to_le_bytes());
}

pub fn pack_ehdr64(f: &EhdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), EHDR64_SIZE);
    pack_ident(f, out);
    out[16..18].copy_from_slice(&f.e_type.to_le_bytes());
    out[18..20].copy_from_slice(&f.e_machine.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&f.e_entry.to_le_bytes());
    out[32..40].copy_from_slice(&f.e_phoff.to_le_bytes());
    out[40..48].copy_from_slice(&f.e_shoff.to_le_bytes());
    out[48..52].copy_from_slice(&f.e_flags.to_le_bytes());
    out[52..54].copy_from_slice(&(EHDR64_SIZE as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR64_SIZE as u16).to_le_bytes());
    out[56..58].copy_from_slice(&f.e_phnum.to_le_bytes());
    out[58..60].copy_from_slice(&(SHDR64_SIZE as u16).to_le_bytes());
    out[60..62].copy_from_slice(&f.e_shnum.to_le_bytes());
    out[62..64].copy_from_slice(&f.e_shstrndx.to_le_bytes());
}

fn pack_ident(f: &EhdrFields, out: &mut [u8]) {
    out[0..4].copy_from_slice(&ELFMAG);
    out[4] = f.class;
    out[5] = f.data;
    out[6] = EV_CURRENT;
    out[7] = f.osabi;
    for b in &mut out[8..EI_NIDENT] {
        *b = 0;
    }
}

/// Fields of a program header, independent of word size.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhdrFields {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub fn pack_phdr32(f: &PhdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), PHDR32_SIZE);
    out[0..4].copy_from_slice(&f.p_type.to_le_bytes());
    out[4..8].copy_from_slice(&(f.p_offset as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(f.p_vaddr as u32).to_le_bytes());
    out[12..16].copy_from_slice(&(f.p_paddr as u32).to_le_bytes());
    out[16..20].copy_from_slice(&(f.p_filesz as u32).to_le_bytes());
    out[20..24].copy_from_slice(&(f.p_memsz as u32).to_le_bytes());
    out[24..28].copy_from_slice(&f.p_flags.to_le_bytes());
    out[28..32].copy_from_slice(&(f.p_align as u32).to_le_bytes());
}

pub fn pack_phdr64(f: &PhdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), PHDR64_SIZE);
    out[0..4].copy_from_slice(&f.p_type.to_le_bytes());
    out[4..8].copy_from_slice(&f.p_flags.to_le_bytes());
    out[8..16].copy_from_slice(&f.p_offset.to_le_bytes());
    out[16..24].copy_from_slice(&f.p_vaddr.to_le_bytes());
    out[24..32].copy_from_slice(&f.p_paddr.to_le_bytes());
    out[32..40].copy_from_slice(&f.p_filesz.to_le_bytes());
    out[40..48].copy_from_slice(&f.p_memsz.to_le_bytes());
    out[48..56].copy_from_slice(&f.p_align.to_le_bytes());
}

/// Fields of a section header, independent of word size.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShdrFields {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

pub fn pack_shdr32(f: &ShdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), SHDR32_SIZE);
    out[0..4].copy_from_slice(&f.sh_name.to_le_bytes());
    out[4..8].copy_from_slice(&f.sh_type.to_le_bytes());
    out[8..12].copy_from_slice(&(f.sh_flags as u32).to_le_bytes());
    out[12..16].copy_from_slice(&(f.sh_addr as u32).to_le_bytes());
    out[16..20].copy_from_slice(&(f.sh_offset as u32).to_le_bytes());
    out[20..24].copy_from_slice(&(f.sh_size as u32).to_le_bytes());
    out[24..28].copy_from_slice(&f.sh_link.to_le_bytes());
    out[28..32].copy_from_slice(&f.sh_info.to_le_bytes());
    out[32..36].copy_from_slice(&(f.sh_addralign as u32).to_le_bytes());
    out[36..40].copy_from_slice(&(f.sh_entsize as u32).to_le_bytes());
}

pub fn pack_shdr64(f: &ShdrFields, out: &mut [u8]) {
    assert_eq!(out.len(), SHDR64_SIZE);
    out[0..4].copy_from_slice(&f.sh_name.to_le_bytes());
    out[4..8].copy_from_slice(&f.sh_type.to_le_bytes());
    out[8..16].copy_from_slice(&f.sh_flags.to_le_bytes());
    out[16..24].copy_from_slice(&f.sh_addr.to_le_bytes());
    out[24..32].copy_from_slice(&f.sh_offset.to_le_bytes());
    out[32..40].copy_from_slice(&f.sh_size.to_le_bytes());
    out[40..44].copy_from_slice(&f.sh_link.to_le_bytes());
    out[44..48].copy_from_slice(&f.sh_info.to_le_bytes());
    out[48..56].copy_from_slice(&f.sh_addralign.to_le_bytes());
    out[56..64].copy_from_slice(&f.sh_entsize.to_le_bytes());
}

/// Fields of a symbol record, independent of word size. Field order in the
/// packed form differs between ELF32 and ELF64 (`st_value`/`st_size` come
/// before `st_info`/`st_other`/`st_shndx` in ELF32, after in ELF64); this
/// struct is the word-size-agnostic intermediate the assembler reads and
/// writes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymFields {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u32,
    pub st_value: u64,
    pub st_size: u64,
}

pub fn pack_sym32(f: &SymFields, out: &mut [u8]) {
    assert_eq!(out.len(), SYM32_SIZE);
    out[0..4].copy_from_slice(&f.st_name.to_le_bytes());
    out[4..8].copy_from_slice(&(f.st_value as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(f.st_size as u32).to_le_bytes());
    out[12] = f.st_info;
    out[13] = f.st_other;
    out[14..16].copy_from_slice(&(f.st_shndx as u16).to_le_bytes());
}

pub fn unpack_sym32(buf: &[u8]) -> SymFields {
    assert_eq!(buf.len(), SYM32_SIZE);
    SymFields {
        st_name: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        st_value: u32::from_le_bytes(buf[4..8].try_into().unwrap()) as u64,
        st_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()) as u64,
        st_info: buf[12],
        st_other: buf[13],
        st_shndx: u16::from_le_bytes(buf[14..16].try_into().unwrap()) as u32,
    }
}

pub fn pack_sym64(f: &SymFields, out: &mut [u8]) {
    assert_eq!(out.len(), SYM64_SIZE);
    out[0..4].copy_from_slice(&f.st_name.to_le_bytes());
    out[4] = f.st_info;
    out[5] = f.st_other;
    out[6..8].copy_from_slice(&(f.st_shndx as u16).to_le_bytes());
    out[8..16].copy_from_slice(&f.st_value.to_le_bytes());
    out[16..24].copy_from_slice(&f.st_size.to_le_bytes());
}

pub fn unpack_sym64(buf: &[u8]) -> SymFields {
    assert_eq!(buf.len(), SYM64_SIZE);
    SymFields {
        st_name: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        st_info: buf[4],
        st_other: buf[5],
        st_shndx: u16::from_le_bytes(buf[6..8].try_into().unwrap()) as u32,
        st_value: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        st_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
    }
}
