// Relocatable byte buffers.
//
// A `ZBuffer` grows monotonically and keeps two pieces of bookkeeping next to
// its bytes: local labels (offsets that are already known) and fixups (16-bit
// fields whose value depends on a label that may not be defined yet). Buffers
// merge into a parent with `append`, which shifts the child's labels and
// fixups by the insertion address. The outermost buffer becomes the
// relocation root: its `extract` is the second pass of a classic two-pass
// assembler, patching every reference now that all addresses are numeric.

use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::error::CodeGenError;

/// Byte written into reserved fixup fields. Every resolved fixup overwrites
/// it; the value itself never survives into a valid story file.
pub const PLACEHOLDER: u8 = 0xF1;

/// Opaque identifier for an address that may not be known yet.
///
/// A label is a plain arena index used as a hash key - never a pointer. Any
/// number of buffers may reference one; exactly one buffer may define it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out unique labels and remembers their debug names for error
/// messages.
#[derive(Debug, Default)]
pub struct LabelAllocator {
    next: u32,
    names: HashMap<Label, String>,
}

impl LabelAllocator {
    pub fn new() -> LabelAllocator {
        LabelAllocator::default()
    }

    pub fn fresh(&mut self, name: impl Into<String>) -> Label {
        let label = Label(self.next);
        self.next += 1;
        self.names.insert(label, name.into());
        label
    }

    /// Debug name recorded for `label`, or its raw index if it came from a
    /// different allocator.
    pub fn name(&self, label: Label) -> String {
        match self.names.get(&label) {
            Some(name) => name.clone(),
            None => label.to_string(),
        }
    }
}

/// How a pending 16-bit patch turns a resolved absolute offset into bytes.
///
/// A closed set of kinds keeps the link pass enumerable: every fixup carries
/// only the data needed to compute its final bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// The label's absolute byte address.
    Absolute,
    /// `((address - field_start) & mask) | flags`. Branch and jump offsets
    /// are relative to the byte just past the patched field, minus two, so
    /// the stored offset works out to exactly this difference.
    Relative { mask: u16, flags: u16 },
    /// The label's absolute address divided by two. The target must sit on
    /// an even boundary; the program layer aligns routines to guarantee it.
    Packed,
}

/// One pending patch: a reserved 16-bit field waiting for a label's address.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    start: usize,
    kind: FixupKind,
}

/// Growable byte sequence with local labels and deferred patches.
#[derive(Debug)]
pub struct ZBuffer {
    name: Label,
    bytes: Vec<u8>,
    labels: HashMap<Label, usize>,
    fixups: HashMap<Label, Vec<Fixup>>,
}

impl ZBuffer {
    pub fn new(name: Label) -> ZBuffer {
        ZBuffer {
            name,
            bytes: Vec::new(),
            labels: HashMap::new(),
            fixups: HashMap::new(),
        }
    }

    pub fn name(&self) -> Label {
        self.name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn i8(&mut self, value: i8) {
        self.bytes.push(value as u8);
    }

    pub fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn i16(&mut self, value: i16) {
        self.u16(value as u16);
    }

    pub fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    /// Appends raw bytes, returning their start offset.
    pub fn bytes(&mut self, bytes: &[u8]) -> usize {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(bytes);
        start
    }

    /// Appends `count` zero bytes, returning their start offset.
    pub fn zeros(&mut self, count: usize) -> usize {
        let start = self.bytes.len();
        self.bytes.resize(start + count, 0);
        start
    }

    /// Zero-fills up to `address`; a no-op when the buffer already reaches it.
    pub fn zeros_until(&mut self, address: usize) {
        while self.bytes.len() < address {
            self.bytes.push(0);
        }
    }

    /// Pads with `pad` until the length is a multiple of `size`.
    pub fn align_to(&mut self, size: usize, pad: u8) {
        while self.bytes.len() % size != 0 {
            self.bytes.push(pad);
        }
    }

    pub fn get_u8(&self, address: usize) -> u8 {
        self.bytes[address]
    }

    pub fn set_u8(&mut self, address: usize, value: u8) {
        self.bytes[address] = value;
    }

    pub fn get_u16(&self, address: usize) -> u16 {
        (self.bytes[address] as u16) << 8 | self.bytes[address + 1] as u16
    }

    pub fn set_u16(&mut self, address: usize, value: u16) {
        self.bytes[address] = (value >> 8) as u8;
        self.bytes[address + 1] = value as u8;
    }

    /// Records the current end offset under `name`.
    pub fn label(&mut self, name: Label) -> Result<(), CodeGenError> {
        if self.labels.contains_key(&name) {
            return Err(CodeGenError::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name, self.bytes.len());
        Ok(())
    }

    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Reserves a 16-bit placeholder field at the current end and registers a
    /// pending patch against `label`. Multiple fixups may target one label.
    pub fn fixup_u16(&mut self, label: Label, kind: FixupKind) {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(&[PLACEHOLDER, PLACEHOLDER]);
        self.add_fixup(label, Fixup { start, kind });
    }

    /// Registers a patch over two already-written bytes at `start`.
    pub fn fixup_u16_at(&mut self, label: Label, kind: FixupKind, start: usize) {
        self.bytes[start] = PLACEHOLDER;
        self.bytes[start + 1] = PLACEHOLDER;
        self.add_fixup(label, Fixup { start, kind });
    }

    fn add_fixup(&mut self, label: Label, fixup: Fixup) {
        self.fixups.entry(label).or_default().push(fixup);
    }

    /// Labels that pending fixups reference but this buffer does not define.
    pub fn undefined_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self
            .fixups
            .keys()
            .filter(|label| !self.labels.contains_key(label))
            .copied()
            .collect();
        labels.sort();
        labels
    }

    /// Inserts `child` at the current end: its bytes, its labels shifted by
    /// the insertion address, and its pending fixups re-homed onto `self`.
    /// The child's own name labels the insertion point. A child is consumed
    /// by the append and cannot be used again.
    pub fn append(&mut self, child: ZBuffer) -> Result<usize, CodeGenError> {
        let address = self.bytes.len();
        self.label(child.name)?;
        self.bytes.extend_from_slice(&child.bytes);

        for (label, offset) in child.labels {
            if self.labels.contains_key(&label) {
                return Err(CodeGenError::DuplicateLabel(label.to_string()));
            }
            self.labels.insert(label, offset + address);
        }
        for (label, fixups) in child.fixups {
            let homed = self.fixups.entry(label).or_default();
            for fixup in fixups {
                homed.push(Fixup {
                    start: fixup.start + address,
                    kind: fixup.kind,
                });
            }
        }
        Ok(address)
    }

    /// Treats this buffer as the absolute address space (base 0) and applies
    /// every pending fixup. Any fixup whose label is still undefined is a
    /// fatal undefined-reference error.
    pub fn extract(mut self) -> Result<Vec<u8>, CodeGenError> {
        let labels = std::mem::take(&mut self.labels);
        let fixups = std::mem::take(&mut self.fixups);
        let mut unresolved: Vec<Label> = Vec::new();
        let mut applied = 0usize;

        for (label, pending) in fixups {
            match labels.get(&label) {
                Some(&address) => {
                    for fixup in pending {
                        let value = resolve(label, address, fixup)?;
                        self.bytes[fixup.start] = (value >> 8) as u8;
                        self.bytes[fixup.start + 1] = value as u8;
                        applied += 1;
                    }
                }
                None => unresolved.push(label),
            }
        }

        if !unresolved.is_empty() {
            unresolved.sort();
            return Err(CodeGenError::UnresolvedReferences(
                unresolved.iter().map(Label::to_string).collect(),
            ));
        }

        debug!("buffer {}: applied {} fixups", self.name, applied);
        Ok(self.bytes)
    }
}

fn resolve(label: Label, address: usize, fixup: Fixup) -> Result<u16, CodeGenError> {
    match fixup.kind {
        FixupKind::Absolute => {
            if address > 0xFFFF {
                return Err(CodeGenError::AddressOverflow(address));
            }
            Ok(address as u16)
        }
        FixupKind::Relative { mask, flags } => {
            let offset = address as i64 - fixup.start as i64;
            Ok((offset as u16 & mask) | flags)
        }
        FixupKind::Packed => {
            if address % 2 != 0 {
                return Err(CodeGenError::MisalignedPackedAddress(
                    label.to_string(),
                    address,
                ));
            }
            if address / 2 > 0xFFFF {
                return Err(CodeGenError::AddressOverflow(address));
            }
            Ok((address / 2) as u16)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn allocator() -> LabelAllocator {
        LabelAllocator::new()
    }

    #[test]
    fn labels_record_the_current_end() {
        let mut labels = allocator();
        let name = labels.fresh("buf");
        let here = labels.fresh("here");

        let mut buf = ZBuffer::new(name);
        buf.u16(0x1234);
        buf.label(here).unwrap();
        buf.u8(0x56);

        assert_eq!(buf.offset_of(here), Some(2));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let mut labels = allocator();
        let name = labels.fresh("buf");
        let here = labels.fresh("here");

        let mut buf = ZBuffer::new(name);
        buf.label(here).unwrap();
        assert!(matches!(
            buf.label(here),
            Err(CodeGenError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn absolute_fixup_patches_the_resolved_address() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.fixup_u16(target, FixupKind::Absolute);
        buf.u8(0xAA);
        buf.label(target).unwrap();

        let bytes = buf.extract().unwrap();
        assert_eq!(bytes, vec![0x00, 0x03, 0xAA]);
    }

    #[test]
    fn relative_fixup_is_measured_from_the_field_start() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.zeros(4);
        buf.fixup_u16(
            target,
            FixupKind::Relative {
                mask: 0x3FFF,
                flags: 0x8000,
            },
        );
        buf.zeros(2);
        buf.label(target).unwrap();

        // target offset 8, field start 4 -> stored 4, with the flag bit.
        let bytes = buf.extract().unwrap();
        assert_eq!(bytes[4], 0x80);
        assert_eq!(bytes[5], 0x04);
    }

    #[test]
    fn backward_relative_fixup_wraps_as_twos_complement() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.label(target).unwrap();
        buf.zeros(6);
        buf.fixup_u16(
            target,
            FixupKind::Relative {
                mask: 0xFFFF,
                flags: 0,
            },
        );

        // target offset 0, field start 6 -> stored -6.
        let bytes = buf.extract().unwrap();
        assert_eq!(bytes[6], 0xFF);
        assert_eq!(bytes[7], 0xFA);
    }

    #[test]
    fn packed_fixup_halves_the_address() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.fixup_u16(target, FixupKind::Packed);
        buf.zeros(2);
        buf.label(target).unwrap();

        let bytes = buf.extract().unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x02);
    }

    #[test]
    fn packed_fixup_rejects_odd_addresses() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.fixup_u16(target, FixupKind::Packed);
        buf.u8(0);
        buf.label(target).unwrap();

        assert!(matches!(
            buf.extract(),
            Err(CodeGenError::MisalignedPackedAddress(_, 3))
        ));
    }

    #[test]
    fn append_shifts_labels_and_rehomes_fixups() {
        let mut labels = allocator();
        let parent_name = labels.fresh("parent");
        let child_name = labels.fresh("child");
        let inner = labels.fresh("inner");
        let outer = labels.fresh("outer");

        let mut child = ZBuffer::new(child_name);
        child.u8(0x11);
        child.label(inner).unwrap();
        child.fixup_u16(outer, FixupKind::Absolute);

        let mut parent = ZBuffer::new(parent_name);
        parent.zeros(4);
        parent.label(outer).unwrap();
        let address = parent.append(child).unwrap();

        assert_eq!(address, 4);
        assert_eq!(parent.offset_of(child_name), Some(4));
        assert_eq!(parent.offset_of(inner), Some(5));

        // The re-homed fixup resolves against the parent's address space.
        let bytes = parent.extract().unwrap();
        assert_eq!(&bytes[5..7], &[0x00, 0x04]);
    }

    #[test]
    fn append_label_collision_is_fatal() {
        let mut labels = allocator();
        let shared = labels.fresh("shared");

        let mut child = ZBuffer::new(labels.fresh("child"));
        child.label(shared).unwrap();

        let mut parent = ZBuffer::new(labels.fresh("parent"));
        parent.label(shared).unwrap();

        assert!(matches!(
            parent.append(child),
            Err(CodeGenError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn extract_with_unresolved_fixups_is_fatal() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let missing = labels.fresh("missing");

        buf.fixup_u16(missing, FixupKind::Absolute);

        match buf.extract() {
            Err(CodeGenError::UnresolvedReferences(names)) => {
                assert_eq!(names.len(), 1);
            }
            other => panic!("expected unresolved-reference error, got {:?}", other),
        }
    }

    #[test]
    fn extract_resolves_multiple_fixups_per_label() {
        let mut labels = allocator();
        let mut buf = ZBuffer::new(labels.fresh("buf"));
        let target = labels.fresh("target");

        buf.fixup_u16(target, FixupKind::Absolute);
        buf.fixup_u16(target, FixupKind::Absolute);
        buf.label(target).unwrap();

        let bytes = buf.extract().unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0x00, 0x04]);
    }
}
