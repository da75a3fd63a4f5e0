// Routine builders: one method per version-3 instruction mnemonic.
//
// A routine owns its variable table and one relocatable buffer of encoded
// instructions. Each mnemonic validates its arguments and delegates to the
// instruction encoder with the opcode's canonical metadata. Instruction
// descriptions follow the Z-Machine Standards Document, section 15.

use crate::buffer::{FixupKind, Label, ZBuffer};
use crate::error::CodeGenError;
use crate::instruction::{Arg, BranchTarget, Operand, StoreTarget, Variable};
use crate::opcodes::{self, OpcodeKind, OpcodeMeta};
use crate::text;

const MAX_LOCALS: u8 = 15;
const FIRST_GLOBAL_SLOT: u16 = 16;
const LAST_GLOBAL_SLOT: u16 = 255;

/// Storage backing a routine's variables: the per-routine locals header, or
/// the shared global table for the distinguished main routine.
#[derive(Debug)]
pub(crate) enum VarTable {
    /// Header bytes: locals count, then one initial-value word per local.
    Locals { header: ZBuffer, count: u8 },
    /// The globals section: one initial-value word per allocated global.
    Globals { table: ZBuffer, count: u16 },
}

impl VarTable {
    fn alloc(&mut self, initial: Option<i16>) -> Result<Operand, CodeGenError> {
        match self {
            VarTable::Locals { header, count } => {
                if *count == MAX_LOCALS {
                    return Err(CodeGenError::TooManyLocals);
                }
                *count += 1;
                header.i16(initial.unwrap_or(0));
                // The locals-count byte always equals the allocated count.
                header.set_u8(0, *count);
                Ok(Operand::variable(*count))
            }
            VarTable::Globals { table, count } => {
                let slot = FIRST_GLOBAL_SLOT + *count;
                if slot > LAST_GLOBAL_SLOT {
                    return Err(CodeGenError::TooManyGlobals);
                }
                *count += 1;
                table.i16(initial.unwrap_or(0));
                Ok(Operand::variable(slot as u8))
            }
        }
    }
}

/// Builds one routine's instruction stream. Instances come from
/// [`crate::program::Program::routine`] and
/// [`crate::program::Program::main_routine`].
#[derive(Debug)]
pub struct Routine {
    name: Label,
    vars: VarTable,
    ops: ZBuffer,
}

impl Routine {
    pub(crate) fn subroutine(name: Label, code: Label) -> Routine {
        let mut header = ZBuffer::new(name);
        header.u8(0); // locals count, kept current by alloc_var
        Routine {
            name,
            vars: VarTable::Locals { header, count: 0 },
            ops: ZBuffer::new(code),
        }
    }

    pub(crate) fn main(name: Label, globals: Label) -> Routine {
        Routine {
            name,
            vars: VarTable::Globals {
                table: ZBuffer::new(globals),
                count: 0,
            },
            ops: ZBuffer::new(name),
        }
    }

    pub fn name(&self) -> Label {
        self.name
    }

    pub(crate) fn into_parts(self) -> (VarTable, ZBuffer) {
        (self.vars, self.ops)
    }

    /// Allocates the next free variable slot: a local here, or a global on
    /// the main routine. The initial value lands in the table's header bytes.
    pub fn alloc_var(&mut self, initial: Option<i16>) -> Result<Operand, CodeGenError> {
        self.vars.alloc(initial)
    }

    /// Defines `name` at the current end of this routine's code.
    pub fn label(&mut self, name: Label) -> Result<(), CodeGenError> {
        self.ops.label(name)
    }

    /// Signed 16-bit addition.
    pub fn add(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:20 add a b -> (result)
        self.store_op2(&opcodes::ADD, left, right, result)
    }

    /// Bitwise AND.
    pub fn and(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:9 and a b -> (result)
        self.store_op2(&opcodes::AND, left, right, result)
    }

    /// Calls `routine` with up to three arguments, storing its return value.
    /// The leading operand word is reserved by the instruction set; the link
    /// pass patches it with the callee's packed address, which is why every
    /// routine must start on an even boundary.
    pub fn call(
        &mut self,
        routine: Label,
        args: &[Arg],
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // VAR:224 call routine ...0 to 3 args... -> (result)
        if args.len() > 3 {
            return Err(CodeGenError::InstructionShape(format!(
                "call takes at most three arguments, got {}",
                args.len()
            )));
        }
        let mut operands = vec![Arg::Op(Operand::word(0x7FFF)?)];
        operands.extend_from_slice(args);

        let start = self.ops.len();
        self.ops
            .op_var(&opcodes::CALL, &operands, Some(result), None)?;
        self.ops.fixup_u16_at(routine, FixupKind::Packed, start + 2);
        Ok(Operand::variable(result.slot()))
    }

    /// Clears the numbered attribute on the object.
    pub fn clear_attr(&mut self, object: Operand, attribute: Operand) -> Result<(), CodeGenError> {
        // 2OP:12 clear_attr object attribute
        self.plain_op2(&opcodes::CLEAR_ATTR, object, attribute)
    }

    /// Decrements the slot in place (signed, so 0 becomes -1). Returns the
    /// slot as a readable operand for direct targets; a dereferenced target
    /// yields nothing.
    pub fn dec(&mut self, variable: Variable) -> Result<Option<Operand>, CodeGenError> {
        // 1OP:134 dec (variable)
        self.ops.op1(&opcodes::DEC, variable.as_operand(), None, None)?;
        Ok(variable.slot_operand())
    }

    /// Decrements the slot, branching if it is now less than `value`.
    pub fn dec_chk(
        &mut self,
        variable: Variable,
        value: Operand,
        target: Label,
        branch_when: bool,
    ) -> Result<(), CodeGenError> {
        // 2OP:4 dec_chk (variable) value ?(label)
        self.ops.op2(
            &opcodes::DEC_CHK,
            &[variable.into(), value.into()],
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }

    /// Signed 16-bit division; division by zero halts the interpreter.
    pub fn div(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:23 div a b -> (result)
        self.store_op2(&opcodes::DIV, left, right, result)
    }

    /// Duplicates the top of the stack without consuming it (load STACK into
    /// STACK).
    pub fn dup(&mut self) -> Result<Operand, CodeGenError> {
        self.load(Variable::top(), StoreTarget::stack())
    }

    /// First child of the object, branching when one exists. Without an
    /// explicit target the branch defaults to polarity false with offset 0
    /// (return false from the routine), so the instruction can be used
    /// purely for its stored result.
    pub fn get_child(
        &mut self,
        object: Operand,
        result: StoreTarget,
        branch: Option<(Label, bool)>,
    ) -> Result<Operand, CodeGenError> {
        // 1OP:130 get_child object -> (result) ?(label)
        let branch = match branch {
            Some((target, branch_when)) => (BranchTarget::To(target), branch_when),
            None => (BranchTarget::Offset(0), false),
        };
        self.ops
            .op1(&opcodes::GET_CHILD, object, Some(result), Some(branch))?;
        Ok(Operand::variable(result.slot()))
    }

    /// Number of the next property after `property` (0 picks the first; the
    /// result 0 marks the end of the list).
    pub fn get_next_prop(
        &mut self,
        object: Operand,
        property: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:19 get_next_prop object property -> (result)
        self.store_op2(&opcodes::GET_NEXT_PROP, object, property, result)
    }

    /// Parent of the object; no branch clause exists for this one.
    pub fn get_parent(
        &mut self,
        object: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 1OP:131 get_parent object -> (result)
        self.ops
            .op1(&opcodes::GET_PARENT, object, Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    /// Reads a property value, falling back to its declared default.
    pub fn get_prop(
        &mut self,
        object: Operand,
        property: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:17 get_prop object property -> (result)
        self.store_op2(&opcodes::GET_PROP, object, property, result)
    }

    /// Byte address of the property data, or 0 when the object lacks it.
    pub fn get_prop_addr(
        &mut self,
        object: Operand,
        property: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:18 get_prop_addr object property -> (result)
        self.store_op2(&opcodes::GET_PROP_ADDR, object, property, result)
    }

    /// Length in bytes of the property data at `property_address`.
    pub fn get_prop_len(
        &mut self,
        property_address: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 1OP:132 get_prop_len property-address -> (result)
        self.ops
            .op1(&opcodes::GET_PROP_LEN, property_address, Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    /// Next sibling of the object, branching when one exists. The default
    /// branch matches [`Routine::get_child`].
    pub fn get_sibling(
        &mut self,
        object: Operand,
        result: StoreTarget,
        branch: Option<(Label, bool)>,
    ) -> Result<Operand, CodeGenError> {
        // 1OP:129 get_sibling object -> (result) ?(label)
        let branch = match branch {
            Some((target, branch_when)) => (BranchTarget::To(target), branch_when),
            None => (BranchTarget::Offset(0), false),
        };
        self.ops
            .op1(&opcodes::GET_SIBLING, object, Some(result), Some(branch))?;
        Ok(Operand::variable(result.slot()))
    }

    /// Emits an undefined 2OP opcode; conformant interpreters fault on it.
    pub fn illegal(&mut self) -> Result<(), CodeGenError> {
        const ILLEGAL: OpcodeMeta = OpcodeMeta {
            mnemonic: "illegal",
            kind: OpcodeKind::Op2,
            code: 0x1F,
            store: false,
            branch: false,
        };
        self.ops.op2(
            &ILLEGAL,
            &[Operand::byte(0xFA).into(), Operand::byte(0x17).into()],
            None,
            None,
        )
    }

    /// Increments the slot in place (signed, so -1 becomes 0). Returns like
    /// [`Routine::dec`].
    pub fn inc(&mut self, variable: Variable) -> Result<Option<Operand>, CodeGenError> {
        // 1OP:133 inc (variable)
        self.ops.op1(&opcodes::INC, variable.as_operand(), None, None)?;
        Ok(variable.slot_operand())
    }

    /// Increments the slot, branching if it is now greater than `value`.
    pub fn inc_chk(
        &mut self,
        variable: Variable,
        value: Operand,
        target: Label,
        branch_when: bool,
    ) -> Result<(), CodeGenError> {
        // 2OP:5 inc_chk (variable) value ?(label)
        self.ops.op2(
            &opcodes::INC_CHK,
            &[variable.into(), value.into()],
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }

    /// Moves the object to become the first child of the destination; its
    /// own children move with it.
    pub fn insert_obj(&mut self, object: Operand, destination: Operand) -> Result<(), CodeGenError> {
        // 2OP:14 insert_obj object destination
        self.plain_op2(&opcodes::INSERT_OBJ, object, destination)
    }

    /// Branches if the operands are equal.
    pub fn je(
        &mut self,
        branch_when: bool,
        left: Operand,
        right: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:1 je a b ?(label)
        self.branch_op2(&opcodes::JE, branch_when, left, right, target)
    }

    /// Branches if `left > right` (signed).
    pub fn jg(
        &mut self,
        branch_when: bool,
        left: Operand,
        right: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:3 jg a b ?(label)
        self.branch_op2(&opcodes::JG, branch_when, left, right, target)
    }

    /// Branches if `child`'s parent is `maybe_parent`.
    pub fn jin(
        &mut self,
        branch_when: bool,
        child: Operand,
        maybe_parent: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:6 jin obj1 obj2 ?(label)
        self.branch_op2(&opcodes::JIN, branch_when, child, maybe_parent, target)
    }

    /// Branches if `left < right` (signed).
    pub fn jl(
        &mut self,
        branch_when: bool,
        left: Operand,
        right: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:2 jl a b ?(label)
        self.branch_op2(&opcodes::JL, branch_when, left, right, target)
    }

    /// Unconditional jump. Not a branch instruction: the operand is a full
    /// 16-bit signed offset, so it is always emitted as a word and patched
    /// relative to the operand's own position.
    pub fn jump(&mut self, target: Label) -> Result<(), CodeGenError> {
        // 1OP:140 jump ?(label)
        self.ops
            .op1(&opcodes::JUMP, Operand::word(0xF1F1)?, None, None)?;
        let start = self.ops.len() - 2;
        self.ops.fixup_u16_at(
            target,
            FixupKind::Relative {
                mask: 0xFFFF,
                flags: 0,
            },
            start,
        );
        Ok(())
    }

    /// Branches if the value is zero.
    pub fn jz(
        &mut self,
        branch_when: bool,
        value: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 1OP:128 jz a ?(label)
        self.ops.op1(
            &opcodes::JZ,
            value,
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }

    /// Stores the value of the referenced slot.
    pub fn load(
        &mut self,
        variable: Variable,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 1OP:142 load (variable) -> (result)
        self.ops
            .op1(&opcodes::LOAD, variable.as_operand(), Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    /// Stores the byte at `array + index`.
    pub fn loadb(
        &mut self,
        array: impl Into<Arg>,
        index: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:16 loadb array byte-index -> (result)
        self.ops.op2(
            &opcodes::LOADB,
            &[array.into(), index.into()],
            Some(result),
            None,
        )?;
        Ok(Operand::variable(result.slot()))
    }

    /// Stores the word at `array + 2 * index`.
    pub fn loadw(
        &mut self,
        array: impl Into<Arg>,
        index: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:15 loadw array word-index -> (result)
        self.ops.op2(
            &opcodes::LOADW,
            &[array.into(), index.into()],
            Some(result),
            None,
        )?;
        Ok(Operand::variable(result.slot()))
    }

    /// Remainder after signed 16-bit division.
    pub fn modulo(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:24 mod a b -> (result)
        self.store_op2(&opcodes::MOD, left, right, result)
    }

    /// Signed 16-bit multiplication.
    pub fn mul(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:22 mul a b -> (result)
        self.store_op2(&opcodes::MUL, left, right, result)
    }

    /// Prints a carriage return.
    pub fn new_line(&mut self) -> Result<(), CodeGenError> {
        // 0OP:187 new_line
        self.ops.op0(&opcodes::NEW_LINE, None, None)
    }

    pub fn nop(&mut self) -> Result<(), CodeGenError> {
        // 0OP:180 nop
        self.ops.op0(&opcodes::NOP, None, None)
    }

    /// Bitwise NOT, all sixteen bits reversed.
    pub fn not(&mut self, value: Operand, result: StoreTarget) -> Result<Operand, CodeGenError> {
        // 1OP:143 not value -> (result)
        self.ops.op1(&opcodes::NOT, value, Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    /// Bitwise OR.
    pub fn or(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:8 or a b -> (result)
        self.store_op2(&opcodes::OR, left, right, result)
    }

    /// Throws away the top of the stack.
    pub fn pop(&mut self) -> Result<(), CodeGenError> {
        // 0OP:185 pop
        self.ops.op0(&opcodes::POP, None, None)
    }

    /// Prints the literal text, compressed inline after the opcode.
    pub fn print(&mut self, text: &str) -> Result<(), CodeGenError> {
        // 0OP:178 print (literal-string)
        self.ops.op0(&opcodes::PRINT, None, None)?;
        text::encode(&mut self.ops, text)
    }

    /// Prints the compressed string at a byte address.
    pub fn print_addr(&mut self, address: Operand) -> Result<(), CodeGenError> {
        // 1OP:135 print_addr byte-address-of-string
        self.ops.op1(&opcodes::PRINT_ADDR, address, None, None)
    }

    /// Prints one ZSCII character.
    pub fn print_char(&mut self, code: Operand) -> Result<(), CodeGenError> {
        // VAR:229 print_char output-character-code
        self.ops.op_var(&opcodes::PRINT_CHAR, &[code.into()], None, None)
    }

    /// Prints a signed number in decimal.
    pub fn print_num(&mut self, value: Operand) -> Result<(), CodeGenError> {
        // VAR:230 print_num value
        self.ops.op_var(&opcodes::PRINT_NUM, &[value.into()], None, None)
    }

    /// Prints the object's short name from its property table.
    pub fn print_object(&mut self, object: Operand) -> Result<(), CodeGenError> {
        // 1OP:138 print_obj object
        self.ops.op1(&opcodes::PRINT_OBJ, object, None, None)
    }

    /// Prints the compressed string at a packed address in high memory.
    pub fn print_paddr(&mut self, address: Operand) -> Result<(), CodeGenError> {
        // 1OP:141 print_paddr packed-address-of-string
        self.ops.op1(&opcodes::PRINT_PADDR, address, None, None)
    }

    /// Prints the literal text, then a new-line, then returns true.
    pub fn print_ret(&mut self, text: &str) -> Result<(), CodeGenError> {
        // 0OP:179 print_ret (literal-string)
        self.ops.op0(&opcodes::PRINT_RET, None, None)?;
        text::encode(&mut self.ops, text)
    }

    /// Pops the stack into the referenced slot.
    pub fn pull(&mut self, variable: Variable) -> Result<(), CodeGenError> {
        // VAR:233 pull (variable)
        self.ops
            .op_var(&opcodes::PULL, &[variable.into()], None, None)
    }

    /// Pushes a value onto the stack.
    pub fn push(&mut self, value: impl Into<Arg>) -> Result<(), CodeGenError> {
        // VAR:232 push value
        self.ops.op_var(&opcodes::PUSH, &[value.into()], None, None)
    }

    /// Writes a property value; the object must define the property and its
    /// length must be 1 or 2.
    pub fn put_prop(
        &mut self,
        object: Operand,
        property: Operand,
        value: Operand,
    ) -> Result<(), CodeGenError> {
        // VAR:227 put_prop object property value
        self.ops.op_var(
            &opcodes::PUT_PROP,
            &[object.into(), property.into(), value.into()],
            None,
            None,
        )
    }

    /// Exits the game immediately. The main routine must end this way: it is
    /// illegal to return from it.
    pub fn quit(&mut self) -> Result<(), CodeGenError> {
        // 0OP:186 quit
        self.ops.op0(&opcodes::QUIT, None, None)
    }

    /// Uniform random number in 1..=range, or reseeds on a negative range.
    pub fn random(&mut self, range: Operand, result: StoreTarget) -> Result<Operand, CodeGenError> {
        // VAR:231 random range -> (result)
        self.ops
            .op_var(&opcodes::RANDOM, &[range.into()], Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    /// Detaches the object from its parent; its children stay with it.
    pub fn remove_obj(&mut self, object: Operand) -> Result<(), CodeGenError> {
        // 1OP:137 remove_obj object
        self.ops.op1(&opcodes::REMOVE_OBJ, object, None, None)
    }

    /// Restarts the game from the beginning.
    pub fn restart(&mut self) -> Result<(), CodeGenError> {
        // 0OP:183 restart
        self.ops.op0(&opcodes::RESTART, None, None)
    }

    /// Restores a saved game, branching on success (in practice control is
    /// already elsewhere when a restore succeeds).
    pub fn restore(&mut self, branch_when: bool, target: Label) -> Result<(), CodeGenError> {
        // 0OP:182 restore ?(label)
        self.ops.op0(
            &opcodes::RESTORE,
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }

    /// Returns from the current routine with the given value.
    pub fn ret(&mut self, value: Operand) -> Result<(), CodeGenError> {
        // 1OP:139 ret value
        self.ops.op1(&opcodes::RET, value, None, None)
    }

    /// Pops the stack and returns that value (one byte cheaper than
    /// `ret sp`).
    pub fn ret_popped(&mut self) -> Result<(), CodeGenError> {
        // 0OP:184 ret_popped
        self.ops.op0(&opcodes::RET_POPPED, None, None)
    }

    /// Returns false (0) from the current routine.
    pub fn rfalse(&mut self) -> Result<(), CodeGenError> {
        // 0OP:177 rfalse
        self.ops.op0(&opcodes::RFALSE, None, None)
    }

    /// Returns true (1) from the current routine.
    pub fn rtrue(&mut self) -> Result<(), CodeGenError> {
        // 0OP:176 rtrue
        self.ops.op0(&opcodes::RTRUE, None, None)
    }

    /// Saves the game, branching on success.
    pub fn save(&mut self, branch_when: bool, target: Label) -> Result<(), CodeGenError> {
        // 0OP:181 save ?(label)
        self.ops.op0(
            &opcodes::SAVE,
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }

    /// Sets the numbered attribute on the object.
    pub fn set_attr(&mut self, object: Operand, attribute: Operand) -> Result<(), CodeGenError> {
        // 2OP:11 set_attr object attribute
        self.plain_op2(&opcodes::SET_ATTR, object, attribute)
    }

    /// Reads a command into the text buffer and tokenizes it against the
    /// dictionary into the parse buffer.
    pub fn sread(
        &mut self,
        text_buffer: impl Into<Arg>,
        parse_buffer: impl Into<Arg>,
    ) -> Result<(), CodeGenError> {
        // VAR:228 sread text parse
        self.ops.op_var(
            &opcodes::SREAD,
            &[text_buffer.into(), parse_buffer.into()],
            None,
            None,
        )
    }

    /// Sets the referenced slot to the value.
    pub fn store(&mut self, variable: Variable, value: impl Into<Arg>) -> Result<(), CodeGenError> {
        // 2OP:13 store (variable) value
        self.ops
            .op2(&opcodes::STORE, &[variable.into(), value.into()], None, None)
    }

    /// Stores a byte at `array + index` (dynamic memory only).
    pub fn storeb(
        &mut self,
        array: Operand,
        index: Operand,
        value: Operand,
    ) -> Result<(), CodeGenError> {
        // VAR:226 storeb array byte-index value
        self.ops.op_var(
            &opcodes::STOREB,
            &[array.into(), index.into(), value.into()],
            None,
            None,
        )
    }

    /// Stores a word at `array + 2 * index` (dynamic memory only).
    pub fn storew(
        &mut self,
        array: Operand,
        index: Operand,
        value: Operand,
    ) -> Result<(), CodeGenError> {
        // VAR:225 storew array word-index value
        self.ops.op_var(
            &opcodes::STOREW,
            &[array.into(), index.into(), value.into()],
            None,
            None,
        )
    }

    /// Signed 16-bit subtraction.
    pub fn sub(
        &mut self,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        // 2OP:21 sub a b -> (result)
        self.store_op2(&opcodes::SUB, left, right, result)
    }

    /// Branches if `bitmap & flags == flags`.
    pub fn test(
        &mut self,
        branch_when: bool,
        bitmap: Operand,
        flags: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:7 test bitmap flags ?(label)
        self.branch_op2(&opcodes::TEST, branch_when, bitmap, flags, target)
    }

    /// Branches if the object has the numbered attribute.
    pub fn test_attr(
        &mut self,
        branch_when: bool,
        object: Operand,
        attribute: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        // 2OP:10 test_attr object attribute ?(label)
        self.branch_op2(&opcodes::TEST_ATTR, branch_when, object, attribute, target)
    }

    fn store_op2(
        &mut self,
        op: &OpcodeMeta,
        left: Operand,
        right: Operand,
        result: StoreTarget,
    ) -> Result<Operand, CodeGenError> {
        self.ops
            .op2(op, &[left.into(), right.into()], Some(result), None)?;
        Ok(Operand::variable(result.slot()))
    }

    fn plain_op2(
        &mut self,
        op: &OpcodeMeta,
        left: Operand,
        right: Operand,
    ) -> Result<(), CodeGenError> {
        self.ops.op2(op, &[left.into(), right.into()], None, None)
    }

    fn branch_op2(
        &mut self,
        op: &OpcodeMeta,
        branch_when: bool,
        left: Operand,
        right: Operand,
        target: Label,
    ) -> Result<(), CodeGenError> {
        self.ops.op2(
            op,
            &[left.into(), right.into()],
            None,
            Some((BranchTarget::To(target), branch_when)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LabelAllocator;
    use test_log::test;

    fn subroutine(labels: &mut LabelAllocator) -> Routine {
        let name = labels.fresh("r");
        let code = labels.fresh("r code");
        Routine::subroutine(name, code)
    }

    fn code_bytes(routine: Routine) -> Vec<u8> {
        let (_, ops) = routine.into_parts();
        ops.extract().unwrap()
    }

    #[test]
    fn locals_count_byte_tracks_allocations() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);

        let first = routine.alloc_var(None).unwrap();
        let second = routine.alloc_var(Some(-2)).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);

        let (vars, _) = routine.into_parts();
        match vars {
            VarTable::Locals { header, count } => {
                assert_eq!(count, 2);
                let bytes = header.extract().unwrap();
                // Count byte, then one initial-value word per local.
                assert_eq!(bytes, vec![2, 0x00, 0x00, 0xFF, 0xFE]);
            }
            VarTable::Globals { .. } => panic!("subroutine has a locals table"),
        }
    }

    #[test]
    fn sixteenth_local_is_fatal() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        for _ in 0..15 {
            routine.alloc_var(None).unwrap();
        }
        assert!(matches!(
            routine.alloc_var(None),
            Err(CodeGenError::TooManyLocals)
        ));
    }

    #[test]
    fn globals_start_at_slot_sixteen_and_cap_at_240() {
        let mut labels = LabelAllocator::new();
        let name = labels.fresh("main");
        let globals = labels.fresh("globals");
        let mut main = Routine::main(name, globals);

        let first = main.alloc_var(None).unwrap();
        assert_eq!(first.value(), 16);

        for _ in 1..240 {
            main.alloc_var(None).unwrap();
        }
        assert!(matches!(
            main.alloc_var(None),
            Err(CodeGenError::TooManyGlobals)
        ));
    }

    #[test]
    fn call_reserves_the_leading_word_for_the_packed_address() {
        let mut labels = LabelAllocator::new();
        let callee = labels.fresh("callee");
        let mut routine = subroutine(&mut labels);
        routine
            .call(callee, &[Operand::byte(7).into()], StoreTarget::stack())
            .unwrap();

        let (_, ops) = routine.into_parts();
        assert_eq!(ops.undefined_labels(), vec![callee]);
    }

    #[test]
    fn call_with_four_arguments_is_fatal() {
        let mut labels = LabelAllocator::new();
        let callee = labels.fresh("callee");
        let mut routine = subroutine(&mut labels);
        let arg = Arg::Op(Operand::byte(0));
        assert!(matches!(
            routine.call(callee, &[arg, arg, arg, arg], StoreTarget::stack()),
            Err(CodeGenError::InstructionShape(_))
        ));
    }

    #[test]
    fn jump_is_a_word_operand_patched_relative() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        let top = labels.fresh("top");

        routine.label(top).unwrap();
        routine.nop().unwrap();
        routine.jump(top).unwrap();

        let bytes = code_bytes(routine);
        // nop, then jump with a word operand: offset = 0 - 2 = -2.
        assert_eq!(bytes, vec![0xB4, 0x8C, 0xFF, 0xFE]);
    }

    #[test]
    fn inc_returns_the_slot_for_direct_targets_only() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        let slot = routine.alloc_var(None).unwrap();

        let direct = routine.inc(Variable::from_operand(slot).unwrap()).unwrap();
        assert_eq!(direct, Some(Operand::variable(1)));

        let deref = routine.inc(Variable::deref(slot).unwrap()).unwrap();
        assert_eq!(deref, None);
    }

    #[test]
    fn inc_on_the_stack_top_returns_the_stack() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        let returned = routine.inc(Variable::top()).unwrap();
        assert_eq!(returned, Some(Operand::stack()));
        assert!(returned.map(Operand::is_stack).unwrap_or(false));
    }

    #[test]
    fn get_child_defaults_to_a_return_false_branch() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        routine
            .get_child(Operand::byte(1), StoreTarget::stack(), None)
            .unwrap();

        let bytes = code_bytes(routine);
        // 1OP get_child with byte operand, store to stack, then the
        // single-byte branch: polarity false, offset 0.
        assert_eq!(bytes, vec![0x92, 0x01, 0x00, 0x40]);
    }

    #[test]
    fn get_sibling_with_an_explicit_label_links_to_it() {
        let mut labels = LabelAllocator::new();
        let target = labels.fresh("found");
        let mut routine = subroutine(&mut labels);
        routine
            .get_sibling(Operand::byte(1), StoreTarget::stack(), Some((target, true)))
            .unwrap();
        routine.label(target).unwrap();

        let bytes = code_bytes(routine);
        // Branch field at 3..5, target at 5: offset 2 is the fallthrough.
        assert_eq!(&bytes[3..5], &[0x80, 0x02]);
    }

    #[test]
    fn print_embeds_the_compressed_text() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        routine.print("pass").unwrap();
        routine.quit().unwrap();

        let bytes = code_bytes(routine);
        assert_eq!(bytes[0], 0xB2);
        assert_eq!(bytes.last(), Some(&0xBA));
        // "pass" is four Z-characters: two words, end bit on the second.
        assert_eq!(bytes.len(), 1 + 4 + 1);
        assert_eq!(bytes[3] & 0x80, 0x80);
    }

    #[test]
    fn storew_and_storeb_emit_distinct_opcodes() {
        let mut labels = LabelAllocator::new();

        let mut routine = subroutine(&mut labels);
        routine
            .storew(Operand::byte(0), Operand::byte(0), Operand::byte(0))
            .unwrap();
        assert_eq!(code_bytes(routine)[0], 0xE1);

        let mut routine = subroutine(&mut labels);
        routine
            .storeb(Operand::byte(0), Operand::byte(0), Operand::byte(0))
            .unwrap();
        assert_eq!(code_bytes(routine)[0], 0xE2);
    }

    #[test]
    fn store_uses_the_compact_form_for_small_values() {
        let mut labels = LabelAllocator::new();
        let mut routine = subroutine(&mut labels);
        let slot = routine.alloc_var(None).unwrap();
        routine
            .store(Variable::from_operand(slot).unwrap(), Operand::byte(42))
            .unwrap();

        // Both operands are bytes: compact 2OP form.
        assert_eq!(code_bytes(routine), vec![0x0D, 0x01, 0x2A]);
    }
}
