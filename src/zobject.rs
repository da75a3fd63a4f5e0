// Object table encoding.
//
// Section layout: 31 property-default words, one 9-byte entry per object in
// index order (4 attribute bytes, parent/sibling/child indices, property
// table pointer), then each object's property table, then the shared string
// pool for text-valued properties. Indices are assigned in pre-order, so a
// parent always precedes its children and siblings keep declaration order.

use std::collections::HashMap;

use log::debug;

use crate::buffer::{FixupKind, Label, LabelAllocator, ZBuffer};
use crate::error::CodeGenError;
use crate::text::{self, StringPool};

const MAX_OBJECTS: usize = 255;
const MAX_PROPERTIES: usize = 31;
const MAX_ATTRIBUTES: usize = 32;

/// One game object; `children` nest to form the object tree.
#[derive(Debug, Clone, Default)]
pub struct ZObject {
    /// Display name, stored as a compressed string at the head of the
    /// object's property table.
    pub name: String,
    pub attributes: Vec<String>,
    pub properties: Vec<(String, PropertyValue)>,
    pub children: Vec<ZObject>,
}

/// A property payload.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    /// One to eight inline bytes.
    Bytes(Vec<u8>),
    /// A compressed string in the shared pool, referenced by address.
    Text(String),
}

/// Declares a property name and the value objects inherit when they do not
/// set it. Declaration order assigns property numbers, starting at 1.
#[derive(Debug, Clone)]
pub struct PropertyDefault {
    pub name: String,
    pub value: u16,
}

/// Encodes an object forest into the object-table section named `section`.
pub fn encode_objects(
    section: Label,
    labels: &mut LabelAllocator,
    objects: &[ZObject],
    attributes: &[&str],
    defaults: &[PropertyDefault],
) -> Result<ZBuffer, CodeGenError> {
    let total = count_forest(objects);
    if total > MAX_OBJECTS {
        return Err(CodeGenError::TooManyObjects(total));
    }
    if defaults.len() > MAX_PROPERTIES {
        return Err(CodeGenError::TooManyPropertyDefaults(defaults.len()));
    }
    if attributes.len() > MAX_ATTRIBUTES {
        return Err(CodeGenError::TooManyAttributes(attributes.len()));
    }

    let mut encoder = Encoder {
        entries: ZBuffer::new(section),
        prop_tables: ZBuffer::new(labels.fresh("object property tables")),
        strings: StringPool::new(labels.fresh("object strings")),
        property_numbers: HashMap::new(),
        attribute_bits: HashMap::new(),
    };

    let defaults_start = encoder.entries.zeros(MAX_PROPERTIES * 2);
    for (index, entry) in defaults.iter().enumerate() {
        encoder
            .property_numbers
            .insert(entry.name.clone(), (index + 1) as u8);
        encoder
            .entries
            .set_u16(defaults_start + 2 * index, entry.value);
    }
    for (index, attribute) in attributes.iter().enumerate() {
        encoder
            .attribute_bits
            .insert((*attribute).to_string(), index as u8);
    }

    encoder.walk(labels, objects, 0, 1)?;

    debug!(
        "object table: {} objects, {} defaults, {} attributes",
        total,
        defaults.len(),
        attributes.len()
    );

    let Encoder {
        mut entries,
        prop_tables,
        strings,
        ..
    } = encoder;
    entries.append(prop_tables)?;
    entries.append(strings.into_buffer())?;
    Ok(entries)
}

fn subtree_size(object: &ZObject) -> usize {
    1 + object.children.iter().map(subtree_size).sum::<usize>()
}

fn count_forest(objects: &[ZObject]) -> usize {
    objects.iter().map(subtree_size).sum()
}

struct Encoder {
    entries: ZBuffer,
    prop_tables: ZBuffer,
    strings: StringPool,
    property_numbers: HashMap<String, u8>,
    attribute_bits: HashMap<String, u8>,
}

impl Encoder {
    /// Emits entries for `siblings` (the first one takes index `first`) and
    /// recurses into their subtrees, keeping entry order pre-order.
    fn walk(
        &mut self,
        labels: &mut LabelAllocator,
        siblings: &[ZObject],
        parent: usize,
        first: usize,
    ) -> Result<(), CodeGenError> {
        let mut index = first;
        for (position, object) in siblings.iter().enumerate() {
            let size = subtree_size(object);
            let sibling = if position + 1 < siblings.len() {
                index + size
            } else {
                0
            };
            let child = if object.children.is_empty() {
                0
            } else {
                index + 1
            };

            let mut attribs: u32 = 0;
            for attribute in &object.attributes {
                match self.attribute_bits.get(attribute) {
                    Some(&bit) => attribs |= 1 << (31 - bit as u32),
                    None => return Err(CodeGenError::UndeclaredAttribute(attribute.clone())),
                }
            }

            self.entries.u32(attribs);
            self.entries.u8(parent as u8);
            self.entries.u8(sibling as u8);
            self.entries.u8(child as u8);

            let table = labels.fresh(format!("object #{} properties", index));
            self.entries.fixup_u16(table, FixupKind::Absolute);
            self.property_table(labels, table, object)?;

            self.walk(labels, &object.children, index, index + 1)?;
            index += size;
        }
        Ok(())
    }

    fn property_table(
        &mut self,
        labels: &mut LabelAllocator,
        table: Label,
        object: &ZObject,
    ) -> Result<(), CodeGenError> {
        self.prop_tables.label(table)?;

        let name_words = text::words(&object.name)?;
        self.prop_tables.u8(name_words.len() as u8);
        for word in name_words {
            self.prop_tables.u16(word);
        }

        let mut properties = Vec::with_capacity(object.properties.len());
        for (name, value) in &object.properties {
            match self.property_numbers.get(name) {
                Some(&number) => properties.push((number, name, value)),
                None => return Err(CodeGenError::UndeclaredProperty(name.clone())),
            }
        }
        // The format requires descending property numbers.
        properties.sort_by(|left, right| right.0.cmp(&left.0));

        for (number, name, value) in properties {
            match value {
                PropertyValue::Bytes(bytes) => {
                    self.size_and_number(name, bytes.len(), number)?;
                    self.prop_tables.bytes(bytes);
                }
                PropertyValue::Text(string) => {
                    self.size_and_number(name, 2, number)?;
                    let label = labels.fresh(format!("string {:?}", string));
                    self.strings.add(label, string)?;
                    self.prop_tables.fixup_u16(label, FixupKind::Absolute);
                }
            }
        }
        self.prop_tables.u8(0);
        Ok(())
    }

    fn size_and_number(&mut self, name: &str, size: usize, number: u8) -> Result<(), CodeGenError> {
        if !(1..=8).contains(&size) {
            return Err(CodeGenError::PropertyTooLarge {
                property: name.to_string(),
                len: size,
            });
        }
        self.prop_tables.u8(((size as u8 - 1) << 5) | number);
        Ok(())
    }
}
