// Story-file assembly and the single global link pass.
//
// Memory map of a produced story file:
//
//   Dynamic  0x0000  header (64 bytes)
//                    object table (defaults, entries, property tables)
//                    global variables
//                    data arrays
//   Static           dictionary
//                    data tables
//   High             main routine code
//                    other routines, word-aligned behind their locals header
//
// Section start addresses are patched directly into fixed header fields at
// placement time; everything symbolic resolves in one `extract` at the end.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::{debug, info};

use crate::buffer::{Label, LabelAllocator, ZBuffer};
use crate::dictionary;
use crate::error::CodeGenError;
use crate::instruction::Operand;
use crate::routine::{Routine, VarTable};
use crate::zobject::{self, PropertyDefault, ZObject};

/// Target story-file version. Other versions are out of scope.
pub const STORY_VERSION: u8 = 3;

const HEADER_BYTES: usize = 0x40;
const HDR_HIGH_MEMORY: usize = 0x04;
const HDR_INITIAL_PC: usize = 0x06;
const HDR_DICTIONARY: usize = 0x08;
const HDR_OBJECTS: usize = 0x0A;
const HDR_GLOBALS: usize = 0x0C;
const HDR_STATIC_MEMORY: usize = 0x0E;

/// One whole story under construction: named sections, the global-variable
/// table, the main routine, and the header image.
///
/// `finalize` consumes the program, so a story is finalized exactly once and
/// mutation after finalizing cannot be expressed.
#[derive(Debug)]
pub struct Program {
    labels: LabelAllocator,
    arrays: IndexMap<Label, ZBuffer>,
    tables: IndexMap<Label, ZBuffer>,
    routines: IndexMap<Label, Routine>,
    main: Routine,
    section_labels: HashSet<Label>,
    main_label: Label,
    globals_label: Label,
    objects_label: Label,
    dictionary_label: Label,
}

impl Default for Program {
    fn default() -> Program {
        Program::new()
    }
}

impl Program {
    pub fn new() -> Program {
        let mut labels = LabelAllocator::new();
        let main_label = labels.fresh("main");
        let globals_label = labels.fresh("globals");
        let objects_label = labels.fresh("objects");
        let dictionary_label = labels.fresh("dictionary");

        let main = Routine::main(main_label, globals_label);

        let mut section_labels = HashSet::new();
        section_labels.insert(main_label);
        section_labels.insert(globals_label);

        Program {
            labels,
            arrays: IndexMap::new(),
            tables: IndexMap::new(),
            routines: IndexMap::new(),
            main,
            section_labels,
            main_label,
            globals_label,
            objects_label,
            dictionary_label,
        }
    }

    /// Creates a fresh label for routines, data, and control flow.
    pub fn new_label(&mut self, name: &str) -> Label {
        self.labels.fresh(name)
    }

    /// The distinguished main routine. Its variables are the global table
    /// and its code starts at the story's initial program counter.
    pub fn main_routine(&mut self) -> &mut Routine {
        &mut self.main
    }

    /// Allocates a global variable (slots 16-255), optionally initialized.
    pub fn global(&mut self, initial: Option<i16>) -> Result<Operand, CodeGenError> {
        self.main.alloc_var(initial)
    }

    /// Registers an empty routine and returns its label - the call target
    /// that resolves to the routine's locals header. Emit its body through
    /// [`Program::routine_mut`].
    pub fn routine(&mut self, name: &str) -> Label {
        let label = self.labels.fresh(name);
        let code = self.labels.fresh(format!("{} code", name));
        self.section_labels.insert(label);
        self.routines.insert(label, Routine::subroutine(label, code));
        label
    }

    /// The routine registered under `label`.
    ///
    /// Panics if `label` does not name a routine of this program.
    pub fn routine_mut(&mut self, label: Label) -> &mut Routine {
        if label == self.main_label {
            return &mut self.main;
        }
        &mut self.routines[&label]
    }

    /// Creates a data-array section (dynamic memory) named `name`.
    pub fn array(&mut self, name: Label) -> Result<&mut ZBuffer, CodeGenError> {
        if !self.section_labels.insert(name) {
            return Err(CodeGenError::DuplicateSection(self.labels.name(name)));
        }
        Ok(self
            .arrays
            .entry(name)
            .or_insert_with(|| ZBuffer::new(name)))
    }

    /// Creates a data-table section (static memory) named `name`.
    pub fn table(&mut self, name: Label) -> Result<&mut ZBuffer, CodeGenError> {
        if !self.section_labels.insert(name) {
            return Err(CodeGenError::DuplicateSection(self.labels.name(name)));
        }
        Ok(self
            .tables
            .entry(name)
            .or_insert_with(|| ZBuffer::new(name)))
    }

    /// Builds the dictionary from `separators` and word entries, each word
    /// paired with its fixed-width data bytes. At most one per program.
    pub fn vocabulary(
        &mut self,
        separators: &str,
        entries: &[(&str, &[u8])],
    ) -> Result<(), CodeGenError> {
        let name = self.dictionary_label;
        if !self.section_labels.insert(name) {
            return Err(CodeGenError::DuplicateSection(self.labels.name(name)));
        }
        let buf = dictionary::encode_vocabulary(name, separators, entries)?;
        self.tables.insert(name, buf);
        Ok(())
    }

    /// Encodes the object tree as the object-table section. At most one per
    /// program.
    pub fn objects(
        &mut self,
        objects: &[ZObject],
        attributes: &[&str],
        defaults: &[PropertyDefault],
    ) -> Result<(), CodeGenError> {
        let name = self.objects_label;
        if !self.section_labels.insert(name) {
            return Err(CodeGenError::DuplicateSection(self.labels.name(name)));
        }
        let buf = zobject::encode_objects(name, &mut self.labels, objects, attributes, defaults)?;
        self.arrays.insert(name, buf);
        Ok(())
    }

    /// Lays every section out in the fixed format order, patches the header
    /// fields, and runs the single global link pass.
    pub fn finalize(mut self) -> Result<Vec<u8>, CodeGenError> {
        // Required tables get minimal well-formed defaults: some interpreters
        // fault on a missing dictionary or object table.
        if !self.tables.contains_key(&self.dictionary_label) {
            self.vocabulary("Z", &[])?;
        }
        if !self.arrays.contains_key(&self.objects_label) {
            self.objects(&[], &[], &[])?;
        }

        let Program {
            mut labels,
            mut arrays,
            mut tables,
            routines,
            main,
            globals_label,
            objects_label,
            dictionary_label,
            ..
        } = self;

        let (main_vars, main_code) = main.into_parts();
        if let VarTable::Globals { table, .. } = main_vars {
            arrays.insert(globals_label, table);
        }

        let mut image = ZBuffer::new(labels.fresh("story image"));
        image.u8(STORY_VERSION);
        image.zeros_until(HEADER_BYTES);

        info!(
            "layout: {} arrays, {} tables, {} routines",
            arrays.len(),
            tables.len(),
            routines.len() + 1
        );

        // Dynamic memory: object table, globals, then remaining arrays in
        // insertion order.
        place(&mut image, &labels, arrays.shift_remove(&objects_label), Some(HDR_OBJECTS))?;
        place(&mut image, &labels, arrays.shift_remove(&globals_label), Some(HDR_GLOBALS))?;
        for (_, section) in arrays {
            place(&mut image, &labels, Some(section), None)?;
        }

        // Static memory starts here: dictionary, then remaining tables.
        let static_base = image.len();
        set_header_addr(&mut image, HDR_STATIC_MEMORY, static_base)?;
        place(&mut image, &labels, tables.shift_remove(&dictionary_label), Some(HDR_DICTIONARY))?;
        for (_, section) in tables {
            place(&mut image, &labels, Some(section), None)?;
        }

        // High memory: main routine code first, then every other routine
        // word-aligned behind its locals header. Alignment keeps packed call
        // addresses exact.
        let high_base = image.len();
        set_header_addr(&mut image, HDR_HIGH_MEMORY, high_base)?;
        place(&mut image, &labels, Some(main_code), Some(HDR_INITIAL_PC))?;

        for (_, routine) in routines {
            let (vars, code) = routine.into_parts();
            if let VarTable::Locals { header, .. } = vars {
                image.align_to(2, 0);
                image.append(header)?;
            }
            place(&mut image, &labels, Some(code), None)?;
        }

        // The single global relocation pass. Name every unresolved label
        // before handing the buffer error back.
        let undefined = image.undefined_labels();
        if !undefined.is_empty() {
            return Err(CodeGenError::UnresolvedReferences(
                undefined.iter().map(|label| labels.name(*label)).collect(),
            ));
        }
        let bytes = image.extract()?;
        info!("story image: {} bytes", bytes.len());
        Ok(bytes)
    }
}

/// Appends a non-empty section and records its start address in a header
/// field when one is assigned. Empty sections vanish, leaving their header
/// field zero and their label undefined.
fn place(
    image: &mut ZBuffer,
    labels: &LabelAllocator,
    section: Option<ZBuffer>,
    header_offset: Option<usize>,
) -> Result<(), CodeGenError> {
    let section = match section {
        Some(section) if !section.is_empty() => section,
        _ => return Ok(()),
    };

    let name = section.name();
    let address = image.append(section)?;
    debug!("placed {} at {:#06x}", labels.name(name), address);

    if let Some(offset) = header_offset {
        if image.get_u16(offset) != 0 {
            return Err(CodeGenError::DuplicateSection(labels.name(name)));
        }
        set_header_addr(image, offset, address)?;
    }
    Ok(())
}

fn set_header_addr(image: &mut ZBuffer, offset: usize, address: usize) -> Result<(), CodeGenError> {
    if address > 0xFFFF {
        return Err(CodeGenError::AddressOverflow(address));
    }
    image.set_u16(offset, address as u16);
    Ok(())
}
