//! The in-memory object model: `Data`, `Section`, `Program`, `Symbol` and the
//! `Builder` that owns them.
//!
//! Entities are arena-indexed rather than linked by owning pointer, per the
//! translation this crate settled on for the original's pervasive
//! pointer-sharing: a `Builder` holds `Vec`s of `Data`/`Section`/`Program`,
//! and cross-references are small `Copy` ids into those vecs. This sidesteps
//! the aliasing the original relied on raw pointers for, and makes the
//! provisional-to-final section index remap the assembler performs an
//! explicit, typed operation instead of an in-place pointer mutation.

use crate::buffer::ByteBuffer;
use crate::format::{
    self, pack_sym32, pack_sym64, st_info, DataRequirement, SectionFlags, SectionType,
    SymFields, SHN_UNDEF, STB_LOCAL, STT_NOTYPE, SYM32_SIZE, SYM64_SIZE,
};

/// Target word size, derived from the machine code passed to [`Builder::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// Handle to a [`Data`] payload owned by a [`Builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(pub(crate) usize);

/// Handle to a [`Section`] owned by a [`Builder`]. Holds its *provisional*
/// position in the builder's section array until assembly renumbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub(crate) usize);

/// Handle to a [`Program`] owned by a [`Builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub(crate) usize);

/// A handle to a symbol record inside a symtab's `Data` buffer. Valid only
/// until the next append into the same buffer — after that the backing
/// storage may have moved or the offset may now point at different bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolId {
    pub(crate) data: DataId,
    pub(crate) offset: usize,
}

/// A unit of raw payload bytes, shared by reference between sections and
/// program segments.
pub struct Data {
    pub buf: ByteBuffer,
    pub(crate) sections: Vec<SectionId>,
    pub(crate) programs: Vec<ProgramId>,
}

/// An ELF section header plus an optional backing [`Data`].
pub struct Section {
    pub data: Option<DataId>,
    /// Provisional index (position at add-time) until assembly; final index
    /// afterwards.
    pub(crate) index: u32,
    pub sh_type: SectionType,
    pub name: u32,
    pub flags: SectionFlags,
    pub link: Option<SectionId>,
}

/// An ELF program header plus an optional backing [`Data`].
pub struct Program {
    pub p_type: u32,
    pub flags: format::ProgramFlags,
    pub align: u64,
    pub data: Option<DataId>,
}

/// The root aggregate: owns every `Data`, `Section` and `Program`, and
/// tracks the three distinguished special sections.
pub struct Builder {
    pub class: ElfClass,
    pub machine: u16,
    pub(crate) datas: Vec<Data>,
    pub(crate) sections: Vec<Section>,
    pub(crate) programs: Vec<Program>,
    pub shstrtab: SectionId,
    pub strtab: SectionId,
    pub symtab: Option<SectionId>,
}

impl Builder {
    /// Allocates a builder for `machine` (an `EM_*` code). Mode and encoding
    /// follow from the machine code; encoding is always 2LSB. Seeds the
    /// section array with the null section, `.shstrtab` and `.strtab`, in
    /// that order, per the ELF bootstrap sequence.
    pub fn new(machine: u16) -> Self {
        let class = if format::machine_mode(machine) == 64 {
            ElfClass::Elf64
        } else {
            ElfClass::Elf32
        };
        let mut b = Builder {
            class,
            machine,
            datas: Vec::new(),
            sections: Vec::new(),
            programs: Vec::new(),
            shstrtab: SectionId(0),
            strtab: SectionId(0),
            symtab: None,
        };

        b.new_section_impl(0, SectionType::NULL, None, SectionFlags::empty(), None);

        let shstrtab_data = b.new_data();
        let shstrtab_id =
            b.new_section_impl(0, SectionType::STRTAB, Some(shstrtab_data), SectionFlags::empty(), None);
        b.shstrtab = shstrtab_id;
        let name_off = b.strtab_append(shstrtab_id, ".shstrtab");
        b.sections[shstrtab_id.0].name = name_off;

        let strtab_data = b.new_data();
        let strtab_id = b.new_section(".strtab", SectionType::STRTAB, Some(strtab_data), SectionFlags::empty());
        b.strtab = strtab_id;

        b
    }

    /// Allocates a new, empty `Data` payload.
    pub fn new_data(&mut self) -> DataId {
        let id = DataId(self.datas.len());
        self.datas.push(Data {
            buf: ByteBuffer::new(),
            sections: Vec::new(),
            programs: Vec::new(),
        });
        id
    }

    pub fn data(&self, id: DataId) -> &ByteBuffer {
        &self.datas[id.0].buf
    }

    pub fn data_mut(&mut self, id: DataId) -> &mut ByteBuffer {
        &mut self.datas[id.0].buf
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn program(&self, id: ProgramId) -> &Program {
        &self.programs[id.0]
    }

    /// Creates a section named `name`, of type `sh_type`, optionally backed
    /// by `data`. Panics if `sh_type`'s data requirement is violated. `name`
    /// is appended into `.shstrtab`. If `sh_type` is `STRTAB`, a leading NUL
    /// byte is written into `data`'s buffer.
    pub fn new_section(
        &mut self,
        name: &str,
        sh_type: SectionType,
        data: Option<DataId>,
        flags: SectionFlags,
    ) -> SectionId {
        let name_off = self.strtab_append(self.shstrtab, name);
        self.new_section_impl(name_off, sh_type, data, flags, None)
    }

    fn new_section_impl(
        &mut self,
        name: u32,
        sh_type: SectionType,
        data: Option<DataId>,
        flags: SectionFlags,
        link: Option<SectionId>,
    ) -> SectionId {
        match sh_type.data_requirement() {
            DataRequirement::Forbidden => assert!(
                data.is_none(),
                "section type {:?} must not carry Data",
                sh_type
            ),
            DataRequirement::Required => assert!(
                data.is_some(),
                "section type {:?} requires Data",
                sh_type
            ),
            DataRequirement::Optional => {}
        }

        let id = SectionId(self.sections.len());
        if sh_type == SectionType::STRTAB {
            if let Some(d) = data {
                self.datas[d.0].buf.append(&[0]);
            }
        }
        self.sections.push(Section {
            data,
            index: id.0 as u32,
            sh_type,
            name,
            flags,
            link,
        });
        if let Some(d) = data {
            self.datas[d.0].sections.push(id);
        }
        id
    }

    /// Appends to the program array. `data`, if present, is bound for the
    /// assembler to derive `p_offset`/`p_vaddr`/`p_filesz`/`p_memsz` from.
    pub fn new_program(
        &mut self,
        p_type: u32,
        flags: format::ProgramFlags,
        align: u64,
        data: Option<DataId>,
    ) -> ProgramId {
        let id = ProgramId(self.programs.len());
        self.programs.push(Program {
            p_type,
            flags,
            align,
            data,
        });
        if let Some(d) = data {
            self.datas[d.0].programs.push(id);
        }
        id
    }

    /// Creates a `SYMTAB` section linked to `strtab_section`, seeded with
    /// the mandatory all-zero symbol #0. If `name == ".symtab"` and the
    /// builder has no primary symtab yet, records this one as it.
    pub fn new_symtab(&mut self, strtab_section: SectionId, name: &str) -> SectionId {
        assert_eq!(
            self.sections[strtab_section.0].sh_type,
            SectionType::STRTAB,
            "new_symtab's strtab_section argument must be a STRTAB section"
        );
        let data = self.new_data();
        let id = self.new_section(name, SectionType::SYMTAB, Some(data), SectionFlags::empty());
        self.sections[id.0].link = Some(strtab_section);
        self.symtab_add(id, None, "", STB_LOCAL, STT_NOTYPE, 0);
        if name == ".symtab" && self.symtab.is_none() {
            self.symtab = Some(id);
        }
        id
    }

    /// Appends a symbol record to `symtab`'s `Data` buffer. `name` is
    /// written into the linked strtab. The section reference is stored as
    /// the *provisional* index of `defining_section` (or `SHN_UNDEF` if
    /// `None`) and is remapped to the final index during assembly.
    pub fn symtab_add(
        &mut self,
        symtab: SectionId,
        defining_section: Option<SectionId>,
        name: &str,
        bind: u8,
        kind: u8,
        value: u64,
    ) -> SymbolId {
        assert_eq!(
            self.sections[symtab.0].sh_type,
            SectionType::SYMTAB,
            "symtab_add called on a non-SYMTAB section"
        );
        let strtab_id = self.sections[symtab.0]
            .link
            .expect("symtab section must be linked to a strtab");
        let data_id = self.sections[symtab.0]
            .data
            .expect("symtab section must have Data");
        let name_off = self.strtab_append(strtab_id, name);
        let st_shndx = match defining_section {
            Some(s) => self.sections[s.0].index,
            None => SHN_UNDEF,
        };
        let fields = SymFields {
            st_name: name_off,
            st_info: st_info(bind, kind),
            st_other: 0,
            st_shndx,
            st_value: value,
            st_size: 0,
        };
        let class = self.class;
        let data = &mut self.datas[data_id.0];
        let offset = data.buf.len();
        let sym_size = match class {
            ElfClass::Elf32 => SYM32_SIZE,
            ElfClass::Elf64 => SYM64_SIZE,
        };
        let region = data.buf.alloc(sym_size);
        match class {
            ElfClass::Elf32 => pack_sym32(&fields, region),
            ElfClass::Elf64 => pack_sym64(&fields, region),
        }
        SymbolId {
            data: data_id,
            offset,
        }
    }

    /// Reads the current fields of the symbol record at `id`.
    pub fn symbol(&self, id: SymbolId) -> SymFields {
        let sym_size = match self.class {
            ElfClass::Elf32 => SYM32_SIZE,
            ElfClass::Elf64 => SYM64_SIZE,
        };
        let bytes = self.datas[id.data.0].buf.as_slice();
        let region = &bytes[id.offset..id.offset + sym_size];
        match self.class {
            ElfClass::Elf32 => format::unpack_sym32(region),
            ElfClass::Elf64 => format::unpack_sym64(region),
        }
    }

    /// Re-packs `fields` into the symbol record at `id`, overwriting it in
    /// place. Mirrors the original's `Elf64_Sym*`/`Elf32_Sym*` return value,
    /// which the caller could write through directly once later facts (a
    /// function's final size, say) are known; here the borrow checker
    /// enforces that no stale `SymbolId` survives a reallocating append,
    /// since mutating through it requires `&mut Builder`.
    pub fn symbol_mut(&mut self, id: SymbolId, fields: SymFields) {
        let class = self.class;
        let sym_size = match class {
            ElfClass::Elf32 => SYM32_SIZE,
            ElfClass::Elf64 => SYM64_SIZE,
        };
        let bytes = self.datas[id.data.0].buf.as_mut_slice();
        let region = &mut bytes[id.offset..id.offset + sym_size];
        match class {
            ElfClass::Elf32 => pack_sym32(&fields, region),
            ElfClass::Elf64 => pack_sym64(&fields, region),
        }
    }

    /// Overwrites just `st_size` on an already-added symbol, for the common
    /// case of learning a function or object's size after the fact.
    pub fn symbol_set_size(&mut self, id: SymbolId, st_size: u64) {
        let mut fields = self.symbol(id);
        fields.st_size = st_size;
        self.symbol_mut(id, fields);
    }

    /// Overwrites just `st_value` on an already-added symbol.
    pub fn symbol_set_value(&mut self, id: SymbolId, st_value: u64) {
        let mut fields = self.symbol(id);
        fields.st_value = st_value;
        self.symbol_mut(id, fields);
    }

    /// Appends `name` to `section` (which must be `STRTAB`), returning the
    /// byte offset at which it starts. Returns 0 without writing for the
    /// empty string, and also returns 0 (without writing) if the tentative
    /// length would reach `2^32`.
    pub fn strtab_append(&mut self, section: SectionId, name: &str) -> u32 {
        assert_eq!(
            self.sections[section.0].sh_type,
            SectionType::STRTAB,
            "strtab_append called on a non-STRTAB section"
        );
        let data_id = self.sections[section.0]
            .data
            .expect("STRTAB section must have Data");
        if name.is_empty() {
            return 0;
        }
        let buf = &mut self.datas[data_id.0].buf;
        let tentative = buf.len() as u64 + name.len() as u64 + 1;
        if tentative >= 1u64 << 32 {
            return 0;
        }
        let offset = buf.len() as u32;
        buf.append(name.as_bytes());
        buf.append(&[0]);
        offset
    }

    /// Looks up the NUL-terminated string starting at `index` in `section`.
    pub fn strtab_lookup(&self, section: SectionId, index: u32) -> &str {
        let data_id = self.sections[section.0]
            .data
            .expect("STRTAB section must have Data");
        let bytes = self.datas[data_id.0].buf.as_slice();
        let start = index as usize;
        let end = bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[start..end]).expect("strtab entries are valid utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::EM_X86_64;

    #[test]
    fn new_builder_seeds_three_standard_sections() {
        let b = Builder::new(EM_X86_64);
        assert_eq!(b.sections.len(), 3);
        assert_eq!(b.sections[0].sh_type, SectionType::NULL);
        assert_eq!(b.sections[1].sh_type, SectionType::STRTAB);
        assert_eq!(b.sections[2].sh_type, SectionType::STRTAB);
    }

    #[test]
    fn shstrtab_starts_with_nul_then_its_own_name() {
        let b = Builder::new(EM_X86_64);
        let data_id = b.sections[b.shstrtab.0].data.unwrap();
        let bytes = b.data(data_id).as_slice();
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..11], b".shstrtab\0");
    }

    #[test]
    fn strtab_append_of_empty_string_returns_zero_and_does_not_grow() {
        let mut b = Builder::new(EM_X86_64);
        let shstrtab = b.shstrtab;
        let data_id = b.sections[shstrtab.0].data.unwrap();
        let before = b.data(data_id).len();
        assert_eq!(b.strtab_append(shstrtab, ""), 0);
        assert_eq!(b.data(data_id).len(), before);
    }

    #[test]
    fn strtab_append_offsets_are_contiguous() {
        let mut b = Builder::new(EM_X86_64);
        let strtab = b.strtab;
        let off_a = b.strtab_append(strtab, "alpha");
        let off_b = b.strtab_append(strtab, "beta");
        assert_eq!(off_b, off_a + "alpha".len() as u32 + 1);
        assert_eq!(b.strtab_lookup(strtab, off_a), "alpha");
        assert_eq!(b.strtab_lookup(strtab, off_b), "beta");
    }

    #[test]
    fn symtab_add_with_no_defining_section_records_shn_undef() {
        let mut b = Builder::new(EM_X86_64);
        let strtab = b.strtab;
        let symtab = b.new_symtab(strtab, ".symtab");
        b.symtab_add(symtab, None, "undef_sym", crate::format::STB_GLOBAL, STT_NOTYPE, 0);
        let data_id = b.sections[symtab.0].data.unwrap();
        let bytes = b.data(data_id).as_slice();
        let second = &bytes[SYM64_SIZE..SYM64_SIZE * 2];
        let fields = crate::format::unpack_sym64(second);
        assert_eq!(fields.st_shndx, SHN_UNDEF);
    }

    #[test]
    fn symbol_set_size_overwrites_just_that_field() {
        let mut b = Builder::new(EM_X86_64);
        let strtab = b.strtab;
        let symtab = b.new_symtab(strtab, ".symtab");
        let sym = b.symtab_add(symtab, None, "fn_with_size_known_later", crate::format::STB_GLOBAL, crate::format::STT_FUNC, 0x1000);
        assert_eq!(b.symbol(sym).st_size, 0);

        b.symbol_set_size(sym, 42);
        let fields = b.symbol(sym);
        assert_eq!(fields.st_size, 42);
        assert_eq!(fields.st_value, 0x1000, "unrelated fields are untouched");

        b.symbol_set_value(sym, 0x2000);
        assert_eq!(b.symbol(sym).st_value, 0x2000);
        assert_eq!(b.symbol(sym).st_size, 42, "still untouched by the value write");
    }

    #[test]
    #[should_panic]
    fn new_section_panics_when_progbits_has_no_data() {
        let mut b = Builder::new(EM_X86_64);
        b.new_section(".text", SectionType::PROGBITS, None, SectionFlags::empty());
    }

    #[test]
    #[should_panic]
    fn new_section_panics_when_null_type_has_data() {
        let mut b = Builder::new(EM_X86_64);
        let d = b.new_data();
        b.new_section("", SectionType::NULL, Some(d), SectionFlags::empty());
    }
}
