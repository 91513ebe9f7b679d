//! The two-phase emitter: takes a [`Builder`] and produces a byte-exact ELF
//! image in a fresh [`ByteBuffer`].
//!
//! This is a straight translation of `asm64`/`asm32` from the original: the
//! nine numbered phases below correspond to the nine steps there (reserve
//! header space, snapshot section order, reorder, build section-header
//! skeletons and sort/remap symtabs, emit data payloads, record `shoff`,
//! emit section headers, patch program headers, patch the ELF header).
//! `assemble` takes `&Builder` rather than consuming or mutating it: the
//! reordering happens over local copies of the section/data order, so a
//! `Builder` can be assembled more than once.

use crate::buffer::ByteBuffer;
use crate::format::{
    self, pack_ehdr32, pack_ehdr64, pack_phdr32, pack_phdr64, pack_shdr32, pack_shdr64,
    pack_sym32, pack_sym64, st_bind, unpack_sym32, unpack_sym64, EhdrFields, PhdrFields,
    SectionType, ShdrFields, STB_LOCAL, SHN_UNDEF, SYM32_SIZE, SYM64_SIZE,
};
use crate::model::{Builder, ElfClass};

/// The virtual address at which the first loadable segment is mapped for
/// EXEC output. The original only specifies this for ELF64; this
/// implementation reuses it for ELF32 EXEC output too, since nothing else
/// in the source constrains a 32-bit load address and 32-bit output is not
/// required to be runnable (see the crate's design notes on the Open
/// Question about completing the 32-bit path).
pub const VIRTUAL_BASE: u64 = 0x0040_0000;

/// Assembles `b` into a byte-exact ELF image, dispatching on its class.
///
/// Panics if there is no program header backed by `Data` to supply
/// `e_entry` from. That's a precondition violation, not a recoverable
/// error: well-formed caller code always adds a LOAD program over its
/// entry point's `Data` before assembling.
pub fn assemble(b: &Builder) -> Vec<u8> {
    match b.class {
        ElfClass::Elf32 => assemble32(b),
        ElfClass::Elf64 => assemble64(b),
    }
}

/// Final position (after reordering) of every original section index, and
/// the reordered list of original section indices.
struct SectionOrder {
    order: Vec<usize>,
    final_index: Vec<u32>,
}

fn reorder_sections(b: &Builder) -> SectionOrder {
    let symtab = b.symtab.map(|s| s.0);
    let specials: Vec<usize> = [symtab, Some(b.strtab.0), Some(b.shstrtab.0)]
        .into_iter()
        .flatten()
        .collect();
    let mut order = Vec::with_capacity(b.sections.len());
    for i in 0..b.sections.len() {
        if !specials.contains(&i) {
            order.push(i);
        }
    }
    order.extend(specials);

    let mut final_index = vec![0u32; b.sections.len()];
    for (pos, &orig) in order.iter().enumerate() {
        final_index[orig] = pos as u32;
    }
    SectionOrder { order, final_index }
}

/// Reordered list of original data indices: user Datas first (stable
/// relative order), then the symtab's, strtab's and shstrtab's Data, in
/// that fixed order, skipping any that don't exist.
fn reorder_datas(b: &Builder) -> Vec<usize> {
    let symtab_data = b.symtab.and_then(|s| b.sections[s.0].data).map(|d| d.0);
    let strtab_data = b.sections[b.strtab.0].data.map(|d| d.0);
    let shstrtab_data = b.sections[b.shstrtab.0].data.map(|d| d.0);
    let specials: Vec<usize> = [symtab_data, strtab_data, shstrtab_data]
        .into_iter()
        .flatten()
        .collect();

    let mut order = Vec::with_capacity(b.datas.len());
    for i in 0..b.datas.len() {
        if !specials.contains(&i) {
            order.push(i);
        }
    }
    order.extend(specials);
    order
}

/// Per-type default `sh_addralign`, per spec.md phase 4.
fn section_align(sh_type: SectionType, class: ElfClass) -> u64 {
    if sh_type == SectionType::PROGBITS {
        4
    } else if sh_type == SectionType::SYMTAB {
        match class {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    } else {
        1
    }
}

/// Sorts a symtab's raw bytes so LOCAL-binding symbols precede all others
/// (stable beyond that split), remaps each symbol's `st_shndx` from its
/// provisional section index to its final one via `final_index`, and
/// returns the rewritten bytes plus the count of LOCAL symbols.
fn sort_and_remap_symtab(raw: &[u8], class: ElfClass, final_index: &[u32]) -> (Vec<u8>, u32) {
    let sym_size = match class {
        ElfClass::Elf32 => SYM32_SIZE,
        ElfClass::Elf64 => SYM64_SIZE,
    };
    let count = raw.len() / sym_size;
    let mut syms: Vec<_> = (0..count)
        .map(|i| {
            let chunk = &raw[i * sym_size..(i + 1) * sym_size];
            match class {
                ElfClass::Elf32 => unpack_sym32(chunk),
                ElfClass::Elf64 => unpack_sym64(chunk),
            }
        })
        .collect();

    syms.sort_by_key(|s| st_bind(s.st_info) != STB_LOCAL);

    let mut locals = 0u32;
    for s in syms.iter_mut() {
        if st_bind(s.st_info) == STB_LOCAL {
            locals += 1;
        }
        if s.st_shndx != SHN_UNDEF {
            s.st_shndx = final_index[s.st_shndx as usize];
        }
    }

    let mut out = vec![0u8; raw.len()];
    for (i, s) in syms.iter().enumerate() {
        let chunk = &mut out[i * sym_size..(i + 1) * sym_size];
        match class {
            ElfClass::Elf32 => pack_sym32(s, chunk),
            ElfClass::Elf64 => pack_sym64(s, chunk),
        }
    }
    (out, locals)
}

fn assemble64(b: &Builder) -> Vec<u8> {
    let phnum = b.programs.len();
    assert!(
        phnum > 0 && b.programs[0].data.is_some(),
        "EXEC output requires at least one program header backed by Data"
    );

    let headers_size = format::EHDR64_SIZE + phnum * format::PHDR64_SIZE;

    let mut out = ByteBuffer::new();
    out.append_fill(0, headers_size);

    let SectionOrder { order, final_index } = reorder_sections(b);
    let data_order = reorder_datas(b);

    let mut sh_links = vec![SHN_UNDEF; order.len()];
    let mut sh_entsize = vec![0u64; order.len()];
    let mut sh_info = vec![0u32; order.len()];
    let mut sh_addralign = vec![0u64; order.len()];
    let mut overridden_symtab_bytes: Option<(usize, Vec<u8>)> = None;

    for (pos, &orig) in order.iter().enumerate() {
        let sec = &b.sections[orig];
        sh_links[pos] = match sec.link {
            Some(l) => final_index[l.0],
            None => SHN_UNDEF,
        };
        sh_addralign[pos] = section_align(sec.sh_type, b.class);

        if sec.sh_type == SectionType::SYMTAB {
            let data_id = sec.data.expect("SYMTAB section must have Data");
            let raw = b.datas[data_id.0].buf.as_slice();
            let (sorted, locals) = sort_and_remap_symtab(raw, b.class, &final_index);
            sh_info[pos] = locals;
            sh_entsize[pos] = SYM64_SIZE as u64;
            sh_addralign[pos] = 8;
            overridden_symtab_bytes = Some((data_id.0, sorted));
        }
    }

    let mut data_offsets = vec![0u64; b.datas.len()];
    for &d in &data_order {
        let referring_align = b.datas[d]
            .sections
            .iter()
            .map(|s| section_align(b.sections[s.0].sh_type, b.class))
            .max()
            .unwrap_or(1);
        let pad = align_up(out.len() as u64, referring_align) - out.len() as u64;
        out.append_fill(0, pad as usize);
        data_offsets[d] = out.len() as u64;

        match &overridden_symtab_bytes {
            Some((sym_data_id, bytes)) if *sym_data_id == d => out.append(bytes),
            _ => out.append(b.datas[d].buf.as_slice()),
        }
    }

    let shoff = out.len() as u64;

    let mut shdrs = Vec::with_capacity(order.len());
    for (pos, &orig) in order.iter().enumerate() {
        let sec = &b.sections[orig];
        let (sh_offset, sh_size, sh_addr) = match sec.data {
            Some(d) => {
                let offset = data_offsets[d.0];
                let size = b.datas[d.0].buf.len() as u64;
                let addr = if !b.datas[d.0].programs.is_empty() {
                    VIRTUAL_BASE + offset
                } else {
                    0
                };
                (offset, size, addr)
            }
            None => (0, 0, 0),
        };
        shdrs.push(ShdrFields {
            sh_name: sec.name,
            sh_type: sec.sh_type.0,
            sh_flags: sec.flags.bits(),
            sh_addr,
            sh_offset,
            sh_size,
            sh_link: sh_links[pos],
            sh_info: sh_info[pos],
            sh_addralign: sh_addralign[pos],
            sh_entsize: sh_entsize[pos],
        });
    }
    for f in &shdrs {
        let mut bytes = [0u8; format::SHDR64_SIZE];
        pack_shdr64(f, &mut bytes);
        out.append(&bytes);
    }

    for (i, prog) in b.programs.iter().enumerate() {
        let mut fields = PhdrFields {
            p_type: prog.p_type,
            p_flags: prog.flags.bits(),
            p_align: prog.align,
            ..Default::default()
        };
        if let Some(d) = prog.data {
            let p_offset = data_offsets[d.0] - headers_size as u64;
            fields.p_offset = p_offset;
            fields.p_vaddr = VIRTUAL_BASE + p_offset;
            fields.p_paddr = fields.p_vaddr;
            fields.p_filesz = headers_size as u64 + b.datas[d.0].buf.len() as u64;
            fields.p_memsz = fields.p_filesz;
        }
        let mut bytes = [0u8; format::PHDR64_SIZE];
        pack_phdr64(&fields, &mut bytes);
        let at = format::EHDR64_SIZE + i * format::PHDR64_SIZE;
        out.as_mut_slice()[at..at + format::PHDR64_SIZE].copy_from_slice(&bytes);
    }

    let entry_data = b.programs[0].data.expect("checked above");
    let e_entry = VIRTUAL_BASE + data_offsets[entry_data.0];

    let ehdr = EhdrFields {
        class: format::ELFCLASS64,
        data: format::ELFDATA2LSB,
        osabi: format::ELFOSABI_NONE,
        e_type: format::ET_EXEC,
        e_machine: b.machine,
        e_entry,
        e_phoff: format::EHDR64_SIZE as u64,
        e_shoff: shoff,
        e_flags: 0,
        e_phnum: phnum as u16,
        e_shnum: order.len() as u16,
        e_shstrndx: final_index[b.shstrtab.0] as u16,
    };
    let mut bytes = [0u8; format::EHDR64_SIZE];
    pack_ehdr64(&ehdr, &mut bytes);
    out.as_mut_slice()[0..format::EHDR64_SIZE].copy_from_slice(&bytes);

    out.into_vec()
}

fn assemble32(b: &Builder) -> Vec<u8> {
    let phnum = b.programs.len();
    assert!(
        phnum > 0 && b.programs[0].data.is_some(),
        "EXEC output requires at least one program header backed by Data"
    );

    let headers_size = format::EHDR32_SIZE + phnum * format::PHDR32_SIZE;

    let mut out = ByteBuffer::new();
    out.append_fill(0, headers_size);

    let SectionOrder { order, final_index } = reorder_sections(b);
    let data_order = reorder_datas(b);

    let mut sh_links = vec![SHN_UNDEF; order.len()];
    let mut sh_entsize = vec![0u64; order.len()];
    let mut sh_info = vec![0u32; order.len()];
    let mut sh_addralign = vec![0u64; order.len()];
    let mut overridden_symtab_bytes: Option<(usize, Vec<u8>)> = None;

    for (pos, &orig) in order.iter().enumerate() {
        let sec = &b.sections[orig];
        sh_links[pos] = match sec.link {
            Some(l) => final_index[l.0],
            None => SHN_UNDEF,
        };
        sh_addralign[pos] = section_align(sec.sh_type, b.class);

        if sec.sh_type == SectionType::SYMTAB {
            let data_id = sec.data.expect("SYMTAB section must have Data");
            let raw = b.datas[data_id.0].buf.as_slice();
            let (sorted, locals) = sort_and_remap_symtab(raw, b.class, &final_index);
            sh_info[pos] = locals;
            sh_entsize[pos] = SYM32_SIZE as u64;
            sh_addralign[pos] = 4;
            overridden_symtab_bytes = Some((data_id.0, sorted));
        }
    }

    let mut data_offsets = vec![0u64; b.datas.len()];
    for &d in &data_order {
        let referring_align = b.datas[d]
            .sections
            .iter()
            .map(|s| section_align(b.sections[s.0].sh_type, b.class))
            .max()
            .unwrap_or(1);
        let pad = align_up(out.len() as u64, referring_align) - out.len() as u64;
        out.append_fill(0, pad as usize);
        data_offsets[d] = out.len() as u64;

        match &overridden_symtab_bytes {
            Some((sym_data_id, bytes)) if *sym_data_id == d => out.append(bytes),
            _ => out.append(b.datas[d].buf.as_slice()),
        }
    }

    let shoff = out.len() as u64;

    let mut shdrs = Vec::with_capacity(order.len());
    for (pos, &orig) in order.iter().enumerate() {
        let sec = &b.sections[orig];
        let (sh_offset, sh_size, sh_addr) = match sec.data {
            Some(d) => {
                let offset = data_offsets[d.0];
                let size = b.datas[d.0].buf.len() as u64;
                let addr = if !b.datas[d.0].programs.is_empty() {
                    VIRTUAL_BASE + offset
                } else {
                    0
                };
                (offset, size, addr)
            }
            None => (0, 0, 0),
        };
        shdrs.push(ShdrFields {
            sh_name: sec.name,
            sh_type: sec.sh_type.0,
            sh_flags: sec.flags.bits(),
            sh_addr,
            sh_offset,
            sh_size,
            sh_link: sh_links[pos],
            sh_info: sh_info[pos],
            sh_addralign: sh_addralign[pos],
            sh_entsize: sh_entsize[pos],
        });
    }
    for f in &shdrs {
        let mut bytes = [0u8; format::SHDR32_SIZE];
        pack_shdr32(f, &mut bytes);
        out.append(&bytes);
    }

    for (i, prog) in b.programs.iter().enumerate() {
        let mut fields = PhdrFields {
            p_type: prog.p_type,
            p_flags: prog.flags.bits(),
            p_align: prog.align,
            ..Default::default()
        };
        if let Some(d) = prog.data {
            let p_offset = data_offsets[d.0] - headers_size as u64;
            fields.p_offset = p_offset;
            fields.p_vaddr = VIRTUAL_BASE + p_offset;
            fields.p_paddr = fields.p_vaddr;
            fields.p_filesz = headers_size as u64 + b.datas[d.0].buf.len() as u64;
            fields.p_memsz = fields.p_filesz;
        }
        let mut bytes = [0u8; format::PHDR32_SIZE];
        pack_phdr32(&fields, &mut bytes);
        let at = format::EHDR32_SIZE + i * format::PHDR32_SIZE;
        out.as_mut_slice()[at..at + format::PHDR32_SIZE].copy_from_slice(&bytes);
    }

    let entry_data = b.programs[0].data.expect("checked above");
    let e_entry = VIRTUAL_BASE + data_offsets[entry_data.0];

    let ehdr = EhdrFields {
        class: format::ELFCLASS32,
        data: format::ELFDATA2LSB,
        osabi: format::ELFOSABI_NONE,
        e_type: format::ET_EXEC,
        e_machine: b.machine,
        e_entry,
        e_phoff: format::EHDR32_SIZE as u64,
        e_shoff: shoff,
        e_flags: 0,
        e_phnum: phnum as u16,
        e_shnum: order.len() as u16,
        e_shstrndx: final_index[b.shstrtab.0] as u16,
    };
    let mut bytes = [0u8; format::EHDR32_SIZE];
    pack_ehdr32(&ehdr, &mut bytes);
    out.as_mut_slice()[0..format::EHDR32_SIZE].copy_from_slice(&bytes);

    out.into_vec()
}

fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}
