// Instruction operands and the instruction encoder.
//
// Encoding always picks the most compact legal form: byte constants over
// word constants, the two-operand compact form unless an operand needs a
// full word, and the single-byte branch field whenever a numeric offset
// fits six bits. Symbolic targets reserve the two-byte form up front - an
// in-place fixup cannot shrink an instruction later.

use crate::buffer::{FixupKind, Label, ZBuffer};
use crate::error::CodeGenError;
use crate::opcodes::{OpcodeKind, OpcodeMeta};

/// Operand type bits as they appear in encoded instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    Word = 0b00,
    Byte = 0b01,
    Variable = 0b10,
}

/// Type-field value marking an unused operand slot in the variable form.
const TYPE_NONE: u8 = 0b11;

/// An immutable operand value: a byte or word constant, or a variable
/// reference (0 = evaluation stack, 1-15 = local slot, 16-255 = global
/// slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    kind: OperandType,
    value: u16,
}

impl Operand {
    /// The evaluation stack: reading pops, writing pushes.
    pub fn stack() -> Operand {
        Operand {
            kind: OperandType::Variable,
            value: 0,
        }
    }

    /// A raw variable slot (0 = stack, 1-15 = local, 16-255 = global).
    pub fn variable(slot: u8) -> Operand {
        Operand {
            kind: OperandType::Variable,
            value: slot as u16,
        }
    }

    /// Local variable by 0-based index; slots 1-15.
    pub fn local(index: u8) -> Result<Operand, CodeGenError> {
        if index > 14 {
            return Err(CodeGenError::ValueOutOfRange {
                what: "local variable index",
                value: index as i32,
                min: 0,
                max: 14,
            });
        }
        Ok(Operand::variable(index + 1))
    }

    /// Global variable by 0-based index; slots 16-255.
    pub fn global(index: u8) -> Result<Operand, CodeGenError> {
        if index > 239 {
            return Err(CodeGenError::ValueOutOfRange {
                what: "global variable index",
                value: index as i32,
                min: 0,
                max: 239,
            });
        }
        Ok(Operand::variable(index + 16))
    }

    /// A constant in its most compact encoding: one byte when the value fits
    /// unsigned 8 bits, a word otherwise.
    pub fn constant(value: i32) -> Result<Operand, CodeGenError> {
        if (0..=255).contains(&value) {
            Ok(Operand::byte(value as u8))
        } else {
            Operand::word(value)
        }
    }

    /// An 8-bit constant.
    pub fn byte(value: u8) -> Operand {
        Operand {
            kind: OperandType::Byte,
            value: value as u16,
        }
    }

    /// A 16-bit constant; negative values are stored as two's complement.
    pub fn word(value: i32) -> Result<Operand, CodeGenError> {
        if !(-0x8000..=0xFFFF).contains(&value) {
            return Err(CodeGenError::ValueOutOfRange {
                what: "word constant",
                value,
                min: -0x8000,
                max: 0xFFFF,
            });
        }
        Ok(Operand {
            kind: OperandType::Word,
            value: value as u16,
        })
    }

    pub fn is_stack(self) -> bool {
        self.kind == OperandType::Variable && self.value == 0
    }

    pub fn kind(self) -> OperandType {
        self.kind
    }

    pub fn value(self) -> u16 {
        self.value
    }
}

/// A variable slot named as data, for instructions that mutate the slot in
/// place (inc, dec, store, load, pull). The direct form carries the slot
/// number as a byte constant; the deref form reads the slot number out of
/// another variable at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    kind: OperandType,
    value: u8,
}

impl Variable {
    /// The top of the evaluation stack, in place.
    pub fn top() -> Variable {
        Variable {
            kind: OperandType::Byte,
            value: 0,
        }
    }

    pub fn local(index: u8) -> Result<Variable, CodeGenError> {
        Operand::local(index).and_then(Variable::from_operand)
    }

    pub fn global(index: u8) -> Result<Variable, CodeGenError> {
        Operand::global(index).and_then(Variable::from_operand)
    }

    /// Names the slot of a variable operand.
    pub fn from_operand(operand: Operand) -> Result<Variable, CodeGenError> {
        Variable::of_kind(operand, OperandType::Byte)
    }

    /// Indirect form: the slot to mutate is read from `operand`'s slot at
    /// run time.
    pub fn deref(operand: Operand) -> Result<Variable, CodeGenError> {
        Variable::of_kind(operand, OperandType::Variable)
    }

    fn of_kind(operand: Operand, kind: OperandType) -> Result<Variable, CodeGenError> {
        if operand.kind() != OperandType::Variable {
            return Err(CodeGenError::InstructionShape(
                "a variable operand is required to name a slot".into(),
            ));
        }
        Ok(Variable {
            kind,
            value: operand.value() as u8,
        })
    }

    pub fn is_direct(self) -> bool {
        self.kind == OperandType::Byte
    }

    pub(crate) fn as_operand(self) -> Operand {
        match self.kind {
            OperandType::Byte => Operand::byte(self.value),
            _ => Operand::variable(self.value),
        }
    }

    /// The mutated slot as a readable operand; only direct targets name one.
    pub(crate) fn slot_operand(self) -> Option<Operand> {
        if self.is_direct() {
            Some(Operand::variable(self.value))
        } else {
            None
        }
    }
}

/// Destination slot for an instruction that stores a result. Encodes
/// exactly like a variable reference, but is a write target, never a value
/// to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTarget {
    slot: u8,
}

impl StoreTarget {
    /// Push the result onto the evaluation stack.
    pub fn stack() -> StoreTarget {
        StoreTarget { slot: 0 }
    }

    pub fn local(index: u8) -> Result<StoreTarget, CodeGenError> {
        Operand::local(index).and_then(StoreTarget::from_operand)
    }

    pub fn global(index: u8) -> Result<StoreTarget, CodeGenError> {
        Operand::global(index).and_then(StoreTarget::from_operand)
    }

    pub fn from_operand(operand: Operand) -> Result<StoreTarget, CodeGenError> {
        if operand.kind() != OperandType::Variable {
            return Err(CodeGenError::InstructionShape(
                "a variable operand is required as a result destination".into(),
            ));
        }
        Ok(StoreTarget {
            slot: operand.value() as u8,
        })
    }

    pub fn slot(self) -> u8 {
        self.slot
    }
}

/// An instruction argument: a concrete operand, or the eventual absolute
/// address of a label, emitted as a word operand and patched at link time.
#[derive(Debug, Clone, Copy)]
pub enum Arg {
    Op(Operand),
    Ref(Label),
}

impl Arg {
    fn operand_type(&self) -> OperandType {
        match self {
            Arg::Op(operand) => operand.kind(),
            Arg::Ref(_) => OperandType::Word,
        }
    }
}

impl From<Operand> for Arg {
    fn from(operand: Operand) -> Arg {
        Arg::Op(operand)
    }
}

impl From<Variable> for Arg {
    fn from(variable: Variable) -> Arg {
        Arg::Op(variable.as_operand())
    }
}

impl From<Label> for Arg {
    fn from(label: Label) -> Arg {
        Arg::Ref(label)
    }
}

/// Where a conditional instruction goes when its test matches the branch
/// polarity. Numeric offsets are raw branch-field values: 0 and 1 do not
/// branch but return false/true from the enclosing routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    To(Label),
    Offset(u16),
}

impl BranchTarget {
    pub const RETURN_FALSE: BranchTarget = BranchTarget::Offset(0);
    pub const RETURN_TRUE: BranchTarget = BranchTarget::Offset(1);
}

impl ZBuffer {
    /// 0OP form: one opcode byte, then store/branch as the opcode demands.
    pub fn op0(
        &mut self,
        op: &OpcodeMeta,
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        require_kind(op, OpcodeKind::Op0)?;
        self.u8(0xB0 | op.code);
        self.store_and_branch(op, result, branch)
    }

    /// 1OP form: the operand's type packed into the opcode byte.
    pub fn op1(
        &mut self,
        op: &OpcodeMeta,
        operand: Operand,
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        require_kind(op, OpcodeKind::Op1)?;
        self.u8(0x80 | (operand.kind() as u8) << 4 | op.code);
        match operand.kind() {
            OperandType::Byte | OperandType::Variable => self.u8(operand.value() as u8),
            OperandType::Word => self.u16(operand.value()),
        }
        self.store_and_branch(op, result, branch)
    }

    /// 2OP: the compact form when exactly two operands are given and neither
    /// needs a full word; otherwise the general variable-operand form.
    pub fn op2(
        &mut self,
        op: &OpcodeMeta,
        operands: &[Arg],
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        require_kind(op, OpcodeKind::Op2)?;
        if operands.len() < 2 {
            return Err(CodeGenError::InstructionShape(format!(
                "{} requires at least two operands",
                op.mnemonic
            )));
        }

        let first = operands[0].operand_type();
        let second = operands[1].operand_type();
        if operands.len() != 2 || first == OperandType::Word || second == OperandType::Word {
            return self.var_or_op2(op, operands, result, branch);
        }

        // Compact form: one type bit per operand (0 = byte, 1 = variable).
        let bit = |kind: OperandType| if kind == OperandType::Byte { 0u8 } else { 1u8 };
        self.u8(bit(first) << 6 | bit(second) << 5 | op.code);
        for arg in &operands[..2] {
            if let Arg::Op(operand) = arg {
                self.u8(operand.value() as u8);
            }
        }
        self.store_and_branch(op, result, branch)
    }

    /// VAR form: up to four operands with explicit type bits.
    pub fn op_var(
        &mut self,
        op: &OpcodeMeta,
        operands: &[Arg],
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        require_kind(op, OpcodeKind::Var)?;
        self.var_or_op2(op, operands, result, branch)
    }

    fn var_or_op2(
        &mut self,
        op: &OpcodeMeta,
        operands: &[Arg],
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        if operands.len() > 4 {
            return Err(CodeGenError::InstructionShape(format!(
                "{} takes at most four operands, got {}",
                op.mnemonic,
                operands.len()
            )));
        }

        let kind_bit = if op.kind == OpcodeKind::Var { 1u8 } else { 0u8 };
        self.u8(0xC0 | kind_bit << 5 | op.code);

        // Two type bits per slot, filled from the top; unused slots read
        // "none" (0b11).
        let mut types = (TYPE_NONE << 6) | (TYPE_NONE << 4) | (TYPE_NONE << 2) | TYPE_NONE;
        for arg in operands.iter().rev() {
            types >>= 2;
            types |= (arg.operand_type() as u8) << 6;
        }
        self.u8(types);

        for arg in operands {
            match arg {
                Arg::Op(operand) => match operand.kind() {
                    OperandType::Byte | OperandType::Variable => self.u8(operand.value() as u8),
                    OperandType::Word => self.u16(operand.value()),
                },
                Arg::Ref(label) => self.fixup_u16(*label, FixupKind::Absolute),
            }
        }
        self.store_and_branch(op, result, branch)
    }

    fn store_and_branch(
        &mut self,
        op: &OpcodeMeta,
        result: Option<StoreTarget>,
        branch: Option<(BranchTarget, bool)>,
    ) -> Result<(), CodeGenError> {
        if op.store != result.is_some() {
            return Err(CodeGenError::InstructionShape(format!(
                "{} {} a result destination",
                op.mnemonic,
                if op.store { "requires" } else { "does not take" }
            )));
        }
        if let Some(target) = result {
            self.u8(target.slot());
        }

        if op.branch != branch.is_some() {
            return Err(CodeGenError::InstructionShape(format!(
                "{} {} a branch target",
                op.mnemonic,
                if op.branch { "requires" } else { "does not take" }
            )));
        }
        if let Some((target, branch_when)) = branch {
            match target {
                // Offsets 0-63 fit the single-byte form (bit 6 set).
                BranchTarget::Offset(offset) if offset <= 0x3F => {
                    let polarity = if branch_when { 0x80 } else { 0x00 };
                    self.u8(polarity | 0x40 | offset as u8);
                }
                BranchTarget::Offset(offset) => {
                    let polarity = if branch_when { 0x8000 } else { 0x0000 };
                    self.u16(polarity | (offset & 0x3FFF));
                }
                BranchTarget::To(label) => {
                    let flags = if branch_when { 0x8000 } else { 0x0000 };
                    self.fixup_u16(label, FixupKind::Relative { mask: 0x3FFF, flags });
                }
            }
        }
        Ok(())
    }
}

fn require_kind(op: &OpcodeMeta, kind: OpcodeKind) -> Result<(), CodeGenError> {
    if op.kind != kind {
        return Err(CodeGenError::InstructionShape(format!(
            "{} is not a {:?} opcode",
            op.mnemonic, kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LabelAllocator;
    use crate::opcodes;
    use test_log::test;

    fn buffer(labels: &mut LabelAllocator) -> ZBuffer {
        ZBuffer::new(labels.fresh("code"))
    }

    #[test]
    fn constants_pick_the_narrowest_width() {
        assert_eq!(Operand::constant(0).unwrap().kind(), OperandType::Byte);
        assert_eq!(Operand::constant(255).unwrap().kind(), OperandType::Byte);
        assert_eq!(Operand::constant(256).unwrap().kind(), OperandType::Word);
        assert_eq!(Operand::constant(-1).unwrap().kind(), OperandType::Word);
        assert_eq!(Operand::constant(-1).unwrap().value(), 0xFFFF);
    }

    #[test]
    fn out_of_range_constants_are_fatal() {
        assert!(Operand::word(0x10000).is_err());
        assert!(Operand::word(-0x8001).is_err());
        assert!(Operand::local(15).is_err());
        assert!(Operand::global(240).is_err());
    }

    #[test]
    fn variable_slots_are_offset_by_one_and_sixteen() {
        assert_eq!(Operand::local(0).unwrap().value(), 1);
        assert_eq!(Operand::local(14).unwrap().value(), 15);
        assert_eq!(Operand::global(0).unwrap().value(), 16);
        assert_eq!(Operand::global(239).unwrap().value(), 255);
    }

    #[test]
    fn op0_emits_a_single_byte() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        buf.op0(&opcodes::QUIT, None, None).unwrap();
        assert_eq!(buf.extract().unwrap(), vec![0xBA]);
    }

    #[test]
    fn op1_packs_the_operand_type_into_the_opcode_byte() {
        let mut labels = LabelAllocator::new();

        let mut buf = buffer(&mut labels);
        buf.op1(&opcodes::RET, Operand::byte(5), None, None).unwrap();
        assert_eq!(buf.extract().unwrap(), vec![0x9B, 0x05]);

        let mut buf = buffer(&mut labels);
        buf.op1(&opcodes::RET, Operand::stack(), None, None).unwrap();
        assert_eq!(buf.extract().unwrap(), vec![0xAB, 0x00]);

        let mut buf = buffer(&mut labels);
        buf.op1(&opcodes::RET, Operand::word(0x1234).unwrap(), None, None)
            .unwrap();
        assert_eq!(buf.extract().unwrap(), vec![0x8B, 0x12, 0x34]);
    }

    #[test]
    fn op2_compact_form_for_byte_and_variable_operands() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::ADD,
            &[Operand::byte(1).into(), Operand::stack().into()],
            Some(StoreTarget::stack()),
            None,
        )
        .unwrap();
        // 0tt10100: t0 = byte (0), t1 = variable (1).
        assert_eq!(buf.extract().unwrap(), vec![0x34, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn op2_with_a_word_operand_falls_back_to_the_variable_form() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::ADD,
            &[
                Operand::word(0x0300).unwrap().into(),
                Operand::byte(2).into(),
            ],
            Some(StoreTarget::stack()),
            None,
        )
        .unwrap();
        // 2OP in variable form: bit 5 clear. Types: word, byte, none, none.
        assert_eq!(
            buf.extract().unwrap(),
            vec![0xD4, 0x1F, 0x03, 0x00, 0x02, 0x00]
        );
    }

    #[test]
    fn var_form_marks_unused_operand_slots() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        buf.op_var(
            &opcodes::PRINT_NUM,
            &[Operand::byte(42).into()],
            None,
            None,
        )
        .unwrap();
        assert_eq!(buf.extract().unwrap(), vec![0xE6, 0x7F, 0x2A]);
    }

    #[test]
    fn label_argument_becomes_an_absolute_word_fixup() {
        let mut labels = LabelAllocator::new();
        let table = labels.fresh("table");
        let mut buf = buffer(&mut labels);
        buf.op_var(&opcodes::PUSH, &[table.into()], None, None)
            .unwrap();
        buf.label(table).unwrap();
        // push <table>: opcode, types (word), patched address 0x0004.
        assert_eq!(buf.extract().unwrap(), vec![0xE8, 0x3F, 0x00, 0x04]);
    }

    #[test]
    fn short_branch_form_is_chosen_when_the_offset_fits() {
        let mut labels = LabelAllocator::new();

        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::JE,
            &[Operand::byte(1).into(), Operand::byte(1).into()],
            None,
            Some((BranchTarget::Offset(0x3F), true)),
        )
        .unwrap();
        let bytes = buf.extract().unwrap();
        assert_eq!(bytes[3], 0x80 | 0x40 | 0x3F);
        assert_eq!(bytes.len(), 4);

        // One past the 6-bit range needs the two-byte form.
        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::JE,
            &[Operand::byte(1).into(), Operand::byte(1).into()],
            None,
            Some((BranchTarget::Offset(0x40), true)),
        )
        .unwrap();
        let bytes = buf.extract().unwrap();
        assert_eq!(&bytes[3..], &[0x80, 0x40]);
    }

    #[test]
    fn return_branches_use_the_reserved_offsets() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::JE,
            &[Operand::byte(1).into(), Operand::byte(2).into()],
            None,
            Some((BranchTarget::RETURN_TRUE, false)),
        )
        .unwrap();
        let bytes = buf.extract().unwrap();
        assert_eq!(bytes[3], 0x41);
    }

    #[test]
    fn symbolic_branch_reserves_the_long_form_and_links_exactly() {
        let mut labels = LabelAllocator::new();
        let target = labels.fresh("target");
        let mut buf = buffer(&mut labels);
        buf.op2(
            &opcodes::JE,
            &[Operand::byte(1).into(), Operand::byte(1).into()],
            None,
            Some((BranchTarget::To(target), true)),
        )
        .unwrap();
        buf.zeros(6);
        buf.label(target).unwrap();

        let bytes = buf.extract().unwrap();
        // Field at 3..5, target at 11: stored offset 8 plus the polarity bit.
        assert_eq!(&bytes[3..5], &[0x80, 0x08]);

        // Decoding recomputes the target: after-field + offset - 2.
        let offset = ((bytes[3] as u16 & 0x3F) << 8 | bytes[4] as u16) as usize;
        assert_eq!(5 + offset - 2, 11);
    }

    #[test]
    fn store_and_branch_metadata_are_enforced() {
        let mut labels = LabelAllocator::new();

        let mut buf = buffer(&mut labels);
        assert!(matches!(
            buf.op2(
                &opcodes::ADD,
                &[Operand::byte(1).into(), Operand::byte(2).into()],
                None,
                None
            ),
            Err(CodeGenError::InstructionShape(_))
        ));

        let mut buf = buffer(&mut labels);
        assert!(matches!(
            buf.op0(&opcodes::QUIT, Some(StoreTarget::stack()), None),
            Err(CodeGenError::InstructionShape(_))
        ));

        let mut buf = buffer(&mut labels);
        assert!(matches!(
            buf.op0(&opcodes::QUIT, None, Some((BranchTarget::Offset(0), true))),
            Err(CodeGenError::InstructionShape(_))
        ));
    }

    #[test]
    fn wrong_opcode_family_is_rejected() {
        let mut labels = LabelAllocator::new();
        let mut buf = buffer(&mut labels);
        assert!(matches!(
            buf.op0(&opcodes::ADD, Some(StoreTarget::stack()), None),
            Err(CodeGenError::InstructionShape(_))
        ));
    }
}
