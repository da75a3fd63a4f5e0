// Code generation errors.

use std::fmt;

/// Fatal failure while building or linking a story image.
///
/// There is no recovery path: a partially linked image is never valid output,
/// so the first violation aborts the whole compilation. Variants fall into
/// three groups: structural violations (a defect in the caller or in the
/// backend itself), range violations (the source program is too large for
/// the format), and unsupported input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeGenError {
    // Structural violations
    DuplicateLabel(String),
    UnresolvedReferences(Vec<String>),
    DuplicateSection(String),
    InstructionShape(String),
    MisalignedPackedAddress(String, usize),

    // Range violations
    ValueOutOfRange {
        what: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
    AddressOverflow(usize),
    TooManyLocals,
    TooManyGlobals,
    TooManyObjects(usize),
    TooManyAttributes(usize),
    TooManyPropertyDefaults(usize),
    PropertyTooLarge { property: String, len: usize },
    DuplicateWord(String, String),
    WordTooLong(String),
    DictionaryDataMismatch {
        word: String,
        len: usize,
        expected: usize,
    },

    // Unsupported input
    UnsupportedCharacter(char),
    UndeclaredProperty(String),
    UndeclaredAttribute(String),
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodeGenError::DuplicateLabel(label) => {
                write!(f, "Label {} is already defined", label)
            }
            CodeGenError::UnresolvedReferences(labels) => {
                write!(f, "Unresolved references after linking: {}", labels.join(", "))
            }
            CodeGenError::DuplicateSection(name) => {
                write!(f, "Section '{}' was already placed", name)
            }
            CodeGenError::InstructionShape(msg) => {
                write!(f, "Invalid instruction: {}", msg)
            }
            CodeGenError::MisalignedPackedAddress(label, address) => {
                write!(
                    f,
                    "Packed-address target {} resolved to odd address {:#06x}",
                    label, address
                )
            }
            CodeGenError::ValueOutOfRange {
                what,
                value,
                min,
                max,
            } => {
                write!(f, "{} {} is outside {}..={}", what, value, min, max)
            }
            CodeGenError::AddressOverflow(address) => {
                write!(
                    f,
                    "Address {:#x} does not fit a 16-bit field - program too large",
                    address
                )
            }
            CodeGenError::TooManyLocals => {
                write!(f, "A routine may declare at most 15 local variables")
            }
            CodeGenError::TooManyGlobals => {
                write!(f, "A program may declare at most 240 global variables")
            }
            CodeGenError::TooManyObjects(count) => {
                write!(f, "Too many objects for the object table: {} (max 255)", count)
            }
            CodeGenError::TooManyAttributes(count) => {
                write!(f, "Too many attributes declared: {} (max 32)", count)
            }
            CodeGenError::TooManyPropertyDefaults(count) => {
                write!(f, "Too many property defaults declared: {} (max 31)", count)
            }
            CodeGenError::PropertyTooLarge { property, len } => {
                write!(
                    f,
                    "Property {} has a {}-byte payload (must be 1 to 8 bytes)",
                    property, len
                )
            }
            CodeGenError::DuplicateWord(first, second) => {
                write!(
                    f,
                    "Vocabulary words '{}' and '{}' collide after truncation",
                    first, second
                )
            }
            CodeGenError::WordTooLong(word) => {
                write!(
                    f,
                    "Vocabulary word '{}' does not fit a 4-byte dictionary entry",
                    word
                )
            }
            CodeGenError::DictionaryDataMismatch {
                word,
                len,
                expected,
            } => {
                write!(
                    f,
                    "Dictionary entry '{}' carries {} data bytes, expected {}",
                    word, len, expected
                )
            }
            CodeGenError::UnsupportedCharacter(ch) => {
                write!(f, "Unsupported character '{}' ({:#04x})", ch, *ch as u32)
            }
            CodeGenError::UndeclaredProperty(name) => {
                write!(f, "Undeclared property '{}'", name)
            }
            CodeGenError::UndeclaredAttribute(name) => {
                write!(f, "Undeclared attribute '{}'", name)
            }
        }
    }
}

impl std::error::Error for CodeGenError {}
