// Z-machine version-3 opcode metadata.
//
// These records carry RAW opcode numbers within each form, not encoded
// instruction bytes: the instruction encoder folds the form and the operand
// types into the first byte. The same raw number names different
// instructions in different forms (0x01 is je as 2OP but get_sibling as
// 1OP), so an opcode is only meaningful together with its kind.
//
// Store and branch flags come from the Z-Machine Standards Document,
// section 15: http://inform-fiction.org/zmachine/standards/z1point1/sect15.html

/// Instruction encoding family, by operand count and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeKind {
    Op0,
    Op1,
    Op2,
    Var,
}

/// Everything the encoder needs to know about one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeMeta {
    pub mnemonic: &'static str,
    pub kind: OpcodeKind,
    pub code: u8,
    pub store: bool,
    pub branch: bool,
}

const fn op(mnemonic: &'static str, kind: OpcodeKind, code: u8, store: bool, branch: bool) -> OpcodeMeta {
    OpcodeMeta {
        mnemonic,
        kind,
        code,
        store,
        branch,
    }
}

// 2OP instructions

/// je a b ?(label)
pub const JE: OpcodeMeta = op("je", OpcodeKind::Op2, 0x01, false, true);
/// jl a b ?(label)
pub const JL: OpcodeMeta = op("jl", OpcodeKind::Op2, 0x02, false, true);
/// jg a b ?(label)
pub const JG: OpcodeMeta = op("jg", OpcodeKind::Op2, 0x03, false, true);
/// dec_chk (variable) value ?(label)
pub const DEC_CHK: OpcodeMeta = op("dec_chk", OpcodeKind::Op2, 0x04, false, true);
/// inc_chk (variable) value ?(label)
pub const INC_CHK: OpcodeMeta = op("inc_chk", OpcodeKind::Op2, 0x05, false, true);
/// jin obj1 obj2 ?(label)
pub const JIN: OpcodeMeta = op("jin", OpcodeKind::Op2, 0x06, false, true);
/// test bitmap flags ?(label)
pub const TEST: OpcodeMeta = op("test", OpcodeKind::Op2, 0x07, false, true);
/// or a b -> (result)
pub const OR: OpcodeMeta = op("or", OpcodeKind::Op2, 0x08, true, false);
/// and a b -> (result)
pub const AND: OpcodeMeta = op("and", OpcodeKind::Op2, 0x09, true, false);
/// test_attr object attribute ?(label)
pub const TEST_ATTR: OpcodeMeta = op("test_attr", OpcodeKind::Op2, 0x0A, false, true);
/// set_attr object attribute
pub const SET_ATTR: OpcodeMeta = op("set_attr", OpcodeKind::Op2, 0x0B, false, false);
/// clear_attr object attribute
pub const CLEAR_ATTR: OpcodeMeta = op("clear_attr", OpcodeKind::Op2, 0x0C, false, false);
/// store (variable) value
pub const STORE: OpcodeMeta = op("store", OpcodeKind::Op2, 0x0D, false, false);
/// insert_obj object destination
pub const INSERT_OBJ: OpcodeMeta = op("insert_obj", OpcodeKind::Op2, 0x0E, false, false);
/// loadw array word-index -> (result)
pub const LOADW: OpcodeMeta = op("loadw", OpcodeKind::Op2, 0x0F, true, false);
/// loadb array byte-index -> (result)
pub const LOADB: OpcodeMeta = op("loadb", OpcodeKind::Op2, 0x10, true, false);
/// get_prop object property -> (result)
pub const GET_PROP: OpcodeMeta = op("get_prop", OpcodeKind::Op2, 0x11, true, false);
/// get_prop_addr object property -> (result)
pub const GET_PROP_ADDR: OpcodeMeta = op("get_prop_addr", OpcodeKind::Op2, 0x12, true, false);
/// get_next_prop object property -> (result)
pub const GET_NEXT_PROP: OpcodeMeta = op("get_next_prop", OpcodeKind::Op2, 0x13, true, false);
/// add a b -> (result)
pub const ADD: OpcodeMeta = op("add", OpcodeKind::Op2, 0x14, true, false);
/// sub a b -> (result)
pub const SUB: OpcodeMeta = op("sub", OpcodeKind::Op2, 0x15, true, false);
/// mul a b -> (result)
pub const MUL: OpcodeMeta = op("mul", OpcodeKind::Op2, 0x16, true, false);
/// div a b -> (result)
pub const DIV: OpcodeMeta = op("div", OpcodeKind::Op2, 0x17, true, false);
/// mod a b -> (result)
pub const MOD: OpcodeMeta = op("mod", OpcodeKind::Op2, 0x18, true, false);

// 1OP instructions

/// jz a ?(label)
pub const JZ: OpcodeMeta = op("jz", OpcodeKind::Op1, 0x00, false, true);
/// get_sibling object -> (result) ?(label)
pub const GET_SIBLING: OpcodeMeta = op("get_sibling", OpcodeKind::Op1, 0x01, true, true);
/// get_child object -> (result) ?(label)
pub const GET_CHILD: OpcodeMeta = op("get_child", OpcodeKind::Op1, 0x02, true, true);
/// get_parent object -> (result)
pub const GET_PARENT: OpcodeMeta = op("get_parent", OpcodeKind::Op1, 0x03, true, false);
/// get_prop_len property-address -> (result)
pub const GET_PROP_LEN: OpcodeMeta = op("get_prop_len", OpcodeKind::Op1, 0x04, true, false);
/// inc (variable)
pub const INC: OpcodeMeta = op("inc", OpcodeKind::Op1, 0x05, false, false);
/// dec (variable)
pub const DEC: OpcodeMeta = op("dec", OpcodeKind::Op1, 0x06, false, false);
/// print_addr byte-address-of-string
pub const PRINT_ADDR: OpcodeMeta = op("print_addr", OpcodeKind::Op1, 0x07, false, false);
/// remove_obj object
pub const REMOVE_OBJ: OpcodeMeta = op("remove_obj", OpcodeKind::Op1, 0x09, false, false);
/// print_obj object
pub const PRINT_OBJ: OpcodeMeta = op("print_obj", OpcodeKind::Op1, 0x0A, false, false);
/// ret value
pub const RET: OpcodeMeta = op("ret", OpcodeKind::Op1, 0x0B, false, false);
/// jump (16-bit signed offset, not a branch field)
pub const JUMP: OpcodeMeta = op("jump", OpcodeKind::Op1, 0x0C, false, false);
/// print_paddr packed-address-of-string
pub const PRINT_PADDR: OpcodeMeta = op("print_paddr", OpcodeKind::Op1, 0x0D, false, false);
/// load (variable) -> (result)
pub const LOAD: OpcodeMeta = op("load", OpcodeKind::Op1, 0x0E, true, false);
/// not value -> (result) (1OP in versions 3 and 4 only)
pub const NOT: OpcodeMeta = op("not", OpcodeKind::Op1, 0x0F, true, false);

// 0OP instructions

/// rtrue
pub const RTRUE: OpcodeMeta = op("rtrue", OpcodeKind::Op0, 0x00, false, false);
/// rfalse
pub const RFALSE: OpcodeMeta = op("rfalse", OpcodeKind::Op0, 0x01, false, false);
/// print (literal-string)
pub const PRINT: OpcodeMeta = op("print", OpcodeKind::Op0, 0x02, false, false);
/// print_ret (literal-string)
pub const PRINT_RET: OpcodeMeta = op("print_ret", OpcodeKind::Op0, 0x03, false, false);
/// nop
pub const NOP: OpcodeMeta = op("nop", OpcodeKind::Op0, 0x04, false, false);
/// save ?(label) (branch form in version 3)
pub const SAVE: OpcodeMeta = op("save", OpcodeKind::Op0, 0x05, false, true);
/// restore ?(label) (branch form in version 3)
pub const RESTORE: OpcodeMeta = op("restore", OpcodeKind::Op0, 0x06, false, true);
/// restart
pub const RESTART: OpcodeMeta = op("restart", OpcodeKind::Op0, 0x07, false, false);
/// ret_popped
pub const RET_POPPED: OpcodeMeta = op("ret_popped", OpcodeKind::Op0, 0x08, false, false);
/// pop (version 3 and 4 only)
pub const POP: OpcodeMeta = op("pop", OpcodeKind::Op0, 0x09, false, false);
/// quit
pub const QUIT: OpcodeMeta = op("quit", OpcodeKind::Op0, 0x0A, false, false);
/// new_line
pub const NEW_LINE: OpcodeMeta = op("new_line", OpcodeKind::Op0, 0x0B, false, false);

// VAR instructions

/// call routine ...0 to 3 args... -> (result)
pub const CALL: OpcodeMeta = op("call", OpcodeKind::Var, 0x00, true, false);
/// storew array word-index value
pub const STOREW: OpcodeMeta = op("storew", OpcodeKind::Var, 0x01, false, false);
/// storeb array byte-index value
pub const STOREB: OpcodeMeta = op("storeb", OpcodeKind::Var, 0x02, false, false);
/// put_prop object property value
pub const PUT_PROP: OpcodeMeta = op("put_prop", OpcodeKind::Var, 0x03, false, false);
/// sread text parse
pub const SREAD: OpcodeMeta = op("sread", OpcodeKind::Var, 0x04, false, false);
/// print_char output-character-code
pub const PRINT_CHAR: OpcodeMeta = op("print_char", OpcodeKind::Var, 0x05, false, false);
/// print_num value
pub const PRINT_NUM: OpcodeMeta = op("print_num", OpcodeKind::Var, 0x06, false, false);
/// random range -> (result)
pub const RANDOM: OpcodeMeta = op("random", OpcodeKind::Var, 0x07, true, false);
/// push value
pub const PUSH: OpcodeMeta = op("push", OpcodeKind::Var, 0x08, false, false);
/// pull (variable)
pub const PULL: OpcodeMeta = op("pull", OpcodeKind::Var, 0x09, false, false);

/// Every opcode the builder exposes, for table-level sanity checks.
pub const ALL: &[&OpcodeMeta] = &[
    &JE, &JL, &JG, &DEC_CHK, &INC_CHK, &JIN, &TEST, &OR, &AND, &TEST_ATTR, &SET_ATTR,
    &CLEAR_ATTR, &STORE, &INSERT_OBJ, &LOADW, &LOADB, &GET_PROP, &GET_PROP_ADDR,
    &GET_NEXT_PROP, &ADD, &SUB, &MUL, &DIV, &MOD, &JZ, &GET_SIBLING, &GET_CHILD,
    &GET_PARENT, &GET_PROP_LEN, &INC, &DEC, &PRINT_ADDR, &REMOVE_OBJ, &PRINT_OBJ, &RET,
    &JUMP, &PRINT_PADDR, &LOAD, &NOT, &RTRUE, &RFALSE, &PRINT, &PRINT_RET, &NOP, &SAVE,
    &RESTORE, &RESTART, &RET_POPPED, &POP, &QUIT, &NEW_LINE, &CALL, &STOREW, &STOREB,
    &PUT_PROP, &SREAD, &PRINT_CHAR, &PRINT_NUM, &RANDOM, &PUSH, &PULL,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_unique_within_each_kind() {
        let mut seen = HashSet::new();
        for op in ALL {
            assert!(
                seen.insert((op.kind, op.code)),
                "duplicate opcode {:?}:{:#04x}",
                op.kind,
                op.code
            );
        }
    }

    #[test]
    fn raw_codes_fit_their_form() {
        for op in ALL {
            let max = match op.kind {
                OpcodeKind::Op2 | OpcodeKind::Var => 0x1F,
                OpcodeKind::Op1 | OpcodeKind::Op0 => 0x0F,
            };
            assert!(op.code <= max, "{} code out of range", op.mnemonic);
        }
    }

    #[test]
    fn storew_and_storeb_are_distinct_opcodes() {
        assert_eq!(STOREW.code, 0x01);
        assert_eq!(STOREB.code, 0x02);
        assert_ne!(STOREW.code, STOREB.code);
    }
}
