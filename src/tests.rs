use super::*;
use crate::format::{
    self, ProgramFlags, SectionFlags, SectionType, EM_386, EM_X86_64, PT_LOAD, STB_GLOBAL,
    STB_LOCAL, STT_NOTYPE, STT_SECTION,
};
use crate::model::Builder;
use crate::x86;

fn u32le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().unwrap())
}

fn u64le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().unwrap())
}

/// Builds the canonical "exit(42)" EXEC from the original demo: a `.text`
/// section holding `mov $42, %ebx; mov $1, %eax; int $0x80`, one LOAD
/// program segment over it, and five symbols (the mandatory #0 plus a
/// section symbol, `_start`, `__bss_start`, `_edata`, `_end`).
fn build_scenario_a() -> Builder {
    let mut b = Builder::new(EM_X86_64);
    let strtab = b.strtab;
    let symtab = b.new_symtab(strtab, ".symtab");

    let text = b.new_data();
    x86::mov32_imm32(b.data_mut(text), x86::Reg::Bx, 42);
    x86::mov32_imm32(b.data_mut(text), x86::Reg::Ax, 1);
    b.data_mut(text).append(&[0xcd, 0x80]);

    let flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
    let text_section = b.new_section(".text", SectionType::PROGBITS, Some(text), flags);
    b.new_program(PT_LOAD, ProgramFlags::R | ProgramFlags::X, 0x200000, Some(text));

    b.symtab_add(symtab, Some(text_section), "", STB_LOCAL, STT_SECTION, 0x400078);
    b.symtab_add(symtab, Some(text_section), "_start", STB_GLOBAL, STT_NOTYPE, 0x400078);
    b.symtab_add(symtab, Some(text_section), "__bss_start", STB_GLOBAL, STT_NOTYPE, 0x600084);
    b.symtab_add(symtab, Some(text_section), "_edata", STB_GLOBAL, STT_NOTYPE, 0x600084);
    b.symtab_add(symtab, Some(text_section), "_end", STB_GLOBAL, STT_NOTYPE, 0x600088);

    b
}

#[test]
fn scenario_a_minimal_exit_42() {
    let b = build_scenario_a();
    let image = assemble(&b);

    assert_eq!(&image[0..4], b"\x7fELF");
    assert_eq!(image[4], format::ELFCLASS64);
    assert_eq!(image[5], format::ELFDATA2LSB);
    assert_eq!(&image[18..20], &[0x3e, 0x00], "e_machine is EM_X86_64");
    assert_eq!(
        &image[24..32],
        &[0x78, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00],
        "e_entry is 0x400078"
    );
    assert_eq!(u64le(&image[32..40]), 0x40, "e_phoff");
    let shoff = u64le(&image[40..48]);
    assert_eq!(u16::from_le_bytes(image[60..62].try_into().unwrap()), 5, "e_shnum");
    assert_eq!(
        u16::from_le_bytes(image[62..64].try_into().unwrap()),
        4,
        "e_shstrndx is shnum - 1"
    );

    let shdr = |i: usize| -> &[u8] { &image[(shoff as usize + i * format::SHDR64_SIZE)..][..format::SHDR64_SIZE] };

    let text_hdr = shdr(1);
    assert_eq!(u64le(&text_hdr[24..32]), 0x78, ".text sh_offset");
    assert_eq!(u64le(&text_hdr[32..40]), 12, ".text sh_size");
    assert_eq!(u64le(&text_hdr[16..24]), 0x400078, ".text sh_addr");

    let symtab_hdr = shdr(2);
    assert_eq!(u32le(&symtab_hdr[40..44]), 3, ".symtab sh_link");
    assert_eq!(u32le(&symtab_hdr[44..48]), 2, ".symtab sh_info (two locals)");
    assert_eq!(u64le(&symtab_hdr[56..64]), 24, ".symtab sh_entsize");
}

#[test]
fn scenario_b_empty_strtab_append() {
    let mut b = Builder::new(EM_X86_64);
    let shstrtab = b.shstrtab;
    assert_eq!(b.strtab_append(shstrtab, ""), 0);
    let data_id = b.section(shstrtab).data.unwrap();
    assert_eq!(b.data(data_id).len(), 11, "NUL + \".shstrtab\\0\"");
    assert_eq!(b.strtab_append(shstrtab, ""), 0, "a second empty append also returns 0");
    assert_eq!(b.data(data_id).len(), 11, "the table did not grow");
}

#[test]
fn scenario_c_symbol_section_index_remap() {
    let mut b = Builder::new(EM_X86_64);
    let strtab = b.strtab;

    let data_a = b.new_data();
    let sec_a = b.new_section(".a", SectionType::PROGBITS, Some(data_a), SectionFlags::empty());
    let data_b = b.new_data();
    let sec_b = b.new_section(".b", SectionType::PROGBITS, Some(data_b), SectionFlags::empty());
    let _ = sec_a;
    // provisional indices: null=0, shstrtab=1, strtab=2, A=3, B=4

    let symtab = b.new_symtab(strtab, ".symtab");
    b.symtab_add(symtab, Some(sec_b), "in_b", STB_GLOBAL, STT_NOTYPE, 0);

    // B needs a LOAD program so EXEC assembly succeeds.
    b.new_program(PT_LOAD, ProgramFlags::R, 0, Some(data_b));

    let image = assemble(&b);

    let e_shoff = u64le(&image[40..48]);
    let e_shnum = u16::from_le_bytes(image[60..62].try_into().unwrap()) as usize;
    assert_eq!(e_shnum, 6, "null, A, B, symtab, strtab, shstrtab");

    let symtab_final_index = 3u32;
    let symtab_hdr_off = e_shoff as usize + symtab_final_index as usize * format::SHDR64_SIZE;
    let symtab_data_off = u64le(&image[symtab_hdr_off + 24..symtab_hdr_off + 32]);
    let symtab_data_size = u64le(&image[symtab_hdr_off + 32..symtab_hdr_off + 40]);
    let symtab_bytes = &image[symtab_data_off as usize..(symtab_data_off + symtab_data_size) as usize];
    // symbol #0 then "in_b"; "in_b" is global so it sorts after symbol #0.
    let in_b = format::unpack_sym64(&symtab_bytes[format::SYM64_SIZE..format::SYM64_SIZE * 2]);
    assert_eq!(in_b.st_shndx, 2, "B's final index, after A and null precede it");
}

#[test]
fn scenario_d_symbol_sort() {
    let mut b = Builder::new(EM_X86_64);
    let strtab = b.strtab;
    let symtab = b.new_symtab(strtab, ".symtab");

    let data = b.new_data();
    b.data_mut(data).append(&[0u8; 4]);
    let sec = b.new_section(".data", SectionType::PROGBITS, Some(data), SectionFlags::ALLOC);
    b.new_program(PT_LOAD, ProgramFlags::R, 0, Some(data));

    b.symtab_add(symtab, Some(sec), "g1", STB_GLOBAL, STT_NOTYPE, 0);
    b.symtab_add(symtab, Some(sec), "l1", STB_LOCAL, STT_NOTYPE, 0);
    b.symtab_add(symtab, Some(sec), "g2", STB_GLOBAL, STT_NOTYPE, 0);
    b.symtab_add(symtab, Some(sec), "l2", STB_LOCAL, STT_NOTYPE, 0);
    b.symtab_add(symtab, Some(sec), "g3", STB_GLOBAL, STT_NOTYPE, 0);

    let image = assemble(&b);
    let e_shoff = u64le(&image[40..48]);
    // null, .data, symtab, strtab, shstrtab -> symtab is final index 2
    let symtab_hdr_off = e_shoff as usize + 2 * format::SHDR64_SIZE;
    let info = u32le(&image[symtab_hdr_off + 44..symtab_hdr_off + 48]);
    assert_eq!(info, 3, "symbol #0 plus l1, l2 are LOCAL");

    let data_off = u64le(&image[symtab_hdr_off + 24..symtab_hdr_off + 32]);
    let size = u64le(&image[symtab_hdr_off + 32..symtab_hdr_off + 40]);
    let bytes = &image[data_off as usize..(data_off + size) as usize];
    let count = bytes.len() / format::SYM64_SIZE;
    assert_eq!(count, 6);
    for i in 0..3 {
        let sym = format::unpack_sym64(&bytes[i * format::SYM64_SIZE..(i + 1) * format::SYM64_SIZE]);
        assert_eq!(format::st_bind(sym.st_info), STB_LOCAL, "symbol {i} should be local");
    }
    for i in 3..6 {
        let sym = format::unpack_sym64(&bytes[i * format::SYM64_SIZE..(i + 1) * format::SYM64_SIZE]);
        assert_eq!(format::st_bind(sym.st_info), STB_GLOBAL, "symbol {i} should be global");
    }
}

#[test]
fn scenario_f_multi_program_data_layout() {
    let mut b = Builder::new(EM_X86_64);
    let data1 = b.new_data();
    b.data_mut(data1).append(&[1u8; 4]);
    let sec1 = b.new_section(".one", SectionType::PROGBITS, Some(data1), SectionFlags::ALLOC);
    b.new_program(PT_LOAD, ProgramFlags::R, 0, Some(data1));

    let data2 = b.new_data();
    b.data_mut(data2).append(&[2u8; 5]);
    let sec2 = b.new_section(".two", SectionType::PROGBITS, Some(data2), SectionFlags::ALLOC);
    b.new_program(PT_LOAD, ProgramFlags::R, 0, Some(data2));

    let _ = (sec1, sec2);

    let image = assemble(&b);

    let phdr_at = |i: usize| -> &[u8] {
        &image[(format::EHDR64_SIZE + i * format::PHDR64_SIZE)..][..format::PHDR64_SIZE]
    };
    let p0_offset = u64le(&phdr_at(0)[8..16]);
    let p1_offset = u64le(&phdr_at(1)[8..16]);
    assert!(p1_offset >= p0_offset, "offsets are monotonically non-decreasing");
    assert_eq!(p0_offset, 0, "first Data sits directly at headers_size");
    assert_eq!(p1_offset, 4, "second Data (4-byte aligned already) follows immediately after the first");
}

#[test]
fn round_trip_minimal_exec_via_independent_reader() {
    let b = build_scenario_a();
    let image = assemble(&b);
    let mut cursor = std::io::Cursor::new(image);

    let ef = elf::File::open_stream(&mut cursor).unwrap();
    assert_eq!(ef.ehdr.class, elf::types::ELFCLASS64);
    assert_eq!(ef.ehdr.data, elf::types::ELFDATA2LSB);
    assert_eq!(ef.ehdr.elftype, elf::types::ET_EXEC);
    assert_eq!(ef.ehdr.machine, elf::types::EM_X86_64);
    assert_eq!(ef.ehdr.entry, 0x400078);
    assert_eq!(ef.phdrs.len(), 1);
    assert_eq!(ef.sections.len(), 5);

    let text = ef.get_section(".text").unwrap();
    assert_eq!(
        text.data,
        vec![0xbb, 0x2a, 0x00, 0x00, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xcd, 0x80]
    );

    let symtab = ef.get_section(".symtab").unwrap();
    let syms = ef.get_symbols(symtab).unwrap();
    assert_eq!(syms.len(), 6, "symbol 0 plus the five added symbols");
    let names: Vec<&str> = syms.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"_start"));
    assert!(names.contains(&"__bss_start"));
    assert!(names.contains(&"_edata"));
    assert!(names.contains(&"_end"));
}

/// The EM_386 analog of `build_scenario_a`: same shape, same `.text`
/// bytes, but a 32-bit `Builder` all the way through, exercising
/// `assemble32` and the `Elf32_*` packers instead of the 64-bit ones.
fn build_scenario_a32() -> Builder {
    let mut b = Builder::new(EM_386);
    let strtab = b.strtab;
    let symtab = b.new_symtab(strtab, ".symtab");

    let text = b.new_data();
    x86::mov32_imm32(b.data_mut(text), x86::Reg::Bx, 42);
    x86::mov32_imm32(b.data_mut(text), x86::Reg::Ax, 1);
    b.data_mut(text).append(&[0xcd, 0x80]);

    let flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
    let text_section = b.new_section(".text", SectionType::PROGBITS, Some(text), flags);
    b.new_program(PT_LOAD, ProgramFlags::R | ProgramFlags::X, 0x200000, Some(text));

    b.symtab_add(symtab, Some(text_section), "", STB_LOCAL, STT_SECTION, 0x400054);
    b.symtab_add(symtab, Some(text_section), "_start", STB_GLOBAL, STT_NOTYPE, 0x400054);

    b
}

#[test]
fn scenario_a32_elf32_exec() {
    let b = build_scenario_a32();
    assert_eq!(b.class, crate::model::ElfClass::Elf32);
    let image = assemble(&b);

    assert_eq!(&image[0..4], b"\x7fELF");
    assert_eq!(image[4], format::ELFCLASS32, "e_ident[EI_CLASS]");
    assert_eq!(image[5], format::ELFDATA2LSB);
    assert_eq!(
        u16::from_le_bytes(image[18..20].try_into().unwrap()),
        EM_386,
        "e_machine"
    );
    assert_eq!(u32le(&image[28..32]), format::EHDR32_SIZE as u32, "e_phoff");

    let headers_size = format::EHDR32_SIZE + format::PHDR32_SIZE;
    assert_eq!(
        u32le(&image[24..28]),
        0x400000 + headers_size as u32,
        "e_entry: text's Data sits directly at headers_size, no padding needed"
    );

    let shoff = u32le(&image[32..36]) as usize;
    assert_eq!(
        u16::from_le_bytes(image[48..50].try_into().unwrap()),
        5,
        "e_shnum"
    );
    assert_eq!(
        u16::from_le_bytes(image[50..52].try_into().unwrap()),
        4,
        "e_shstrndx is shnum - 1"
    );

    let shdr = |i: usize| -> &[u8] { &image[(shoff + i * format::SHDR32_SIZE)..][..format::SHDR32_SIZE] };

    let text_hdr = shdr(1);
    assert_eq!(u32le(&text_hdr[16..20]), headers_size as u32, ".text sh_offset");
    assert_eq!(u32le(&text_hdr[20..24]), 12, ".text sh_size");
    assert_eq!(u32le(&text_hdr[12..16]), 0x400000 + headers_size as u32, ".text sh_addr");

    let symtab_hdr = shdr(2);
    assert_eq!(u32le(&symtab_hdr[24..28]), 3, ".symtab sh_link");
    assert_eq!(u32le(&symtab_hdr[28..32]), 1, ".symtab sh_info (one local: symbol #0)");
    assert_eq!(u32le(&symtab_hdr[36..40]), format::SYM32_SIZE as u32, ".symtab sh_entsize");

    let mut cursor = std::io::Cursor::new(image);
    let ef = elf::File::open_stream(&mut cursor).unwrap();
    assert_eq!(ef.ehdr.class, elf::types::ELFCLASS32);
    assert_eq!(ef.ehdr.data, elf::types::ELFDATA2LSB);
    assert_eq!(ef.ehdr.elftype, elf::types::ET_EXEC);
    assert_eq!(ef.ehdr.machine, elf::types::EM_386);
    assert_eq!(ef.phdrs.len(), 1);
    assert_eq!(ef.sections.len(), 5);

    let text = ef.get_section(".text").unwrap();
    assert_eq!(
        text.data,
        vec![0xbb, 0x2a, 0x00, 0x00, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xcd, 0x80]
    );

    let symtab = ef.get_section(".symtab").unwrap();
    let syms = ef.get_symbols(symtab).unwrap();
    assert_eq!(syms.len(), 2, "symbol 0 plus _start");
    assert!(syms.iter().any(|s| s.name == "_start"));
}

#[test]
#[should_panic]
fn assemble_without_any_program_data_panics() {
    let b = Builder::new(EM_X86_64);
    assemble(&b);
}

#[test]
fn assembled_sh_addr_is_zero_for_data_with_no_referring_program() {
    let mut b = Builder::new(EM_X86_64);
    let loaded = b.new_data();
    b.data_mut(loaded).append(&[0xaa]);
    b.new_section(".text", SectionType::PROGBITS, Some(loaded), SectionFlags::ALLOC);
    b.new_program(PT_LOAD, ProgramFlags::R, 0, Some(loaded));

    let debugish = b.new_data();
    b.data_mut(debugish).append(&[0xbb]);
    b.new_section(".debugish", SectionType::PROGBITS, Some(debugish), SectionFlags::empty());

    let image = assemble(&b);
    let shoff = u64le(&image[40..48]);
    // null, .text, .debugish, strtab, shstrtab -> .debugish is final index 2
    let hdr = &image[(shoff as usize + 2 * format::SHDR64_SIZE)..][..format::SHDR64_SIZE];
    assert_eq!(u64le(&hdr[16..24]), 0, "sh_addr stays 0 for Data no Program refers to");
}
