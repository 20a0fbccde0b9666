//! The instruction set (§4.1).
//!
//! Grounded on `ouros::bytecode::op::Opcode` (inferred from its uses
//! throughout `ouros::bytecode::builder` — `#[repr(u8)]`,
//! `stack_effect() -> Option<i16>` for opcodes with a fixed stack delta,
//! `TryFrom<u8>` for decoding), instantiated here with the instruction set
//! §4.1 names instead of Python's opcode set.
//!
//! Per §6 "Instruction encoding": one opcode byte followed by 0-3 fixed-size
//! 4-byte immediates (pool index / jump offset / code index / plain
//! integer). Unlike `ouros`'s variable-width packed encoding, this core
//! always uses 4-byte immediates — simpler, and it is exactly what §6 pins
//! down for this instruction set.

/// A type tag tested by `is_`, matching the predicate groups §4.1 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TypeTag {
    /// Matches `Value::Nil` (`LISTSXP` also matches nil per §4.1).
    Nil = 0,
    /// Matches `Value::Vector` (a "VECSXP also matches list" per §4.1 — in
    /// this core lists *are* `Value::Vector`, so this tag and `List` below
    /// are equivalent; both are kept so the compiler can name the source
    /// predicate it is lowering (`is.null`/`is.list`/`is.pairlist`).
    Vec = 1,
    /// Matches `Value::Nil` or `Value::Pair` (pairlist).
    List = 2,
}

impl TypeTag {
    #[must_use]
    pub fn matches(self, v: &crate::value::Value) -> bool {
        match self {
            Self::Nil => v.is_null(),
            Self::Vec => v.is_list() || v.is_null(),
            Self::List => v.is_pair(),
        }
    }
}

/// Bytecode operation. `#[repr(u8)]` so the discriminant doubles as the
/// encoded opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum Opcode {
    // --- constants/loads ---
    Push,
    LdFun,
    LdVar,
    LdDdVar,
    PushCode,

    // --- promises ---
    Promise,
    Force,

    // --- calls ---
    Call,
    CallStack,
    Dispatch,

    // --- control ---
    Br,
    BrTrue,
    BrFalse,
    BrObj,
    BeginLoop,
    EndContext,
    Ret,

    // --- stack ops ---
    Pop,
    Dup,
    Dup2,
    Swap,
    Pick,
    Put,

    // --- booleans/type tests ---
    AsBool,
    AsLogical,
    LglAnd,
    LglOr,
    Is,

    // --- binding ---
    StVar,

    // --- fast paths ---
    Lt,
    Add,
    Sub,
    Inc,
    Extract1,
    Subset1,

    // --- misc ---
    Invisible,
    Uniq,
    AsAst,
    IsFun,
    IsSpecial,
}

/// How many 4-byte immediate operands an opcode carries, and what each one
/// means (purely documentary beyond operand *count*, which the builder and
/// VM need agree on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    One,
    Two,
    Three,
}

impl Opcode {
    #[must_use]
    pub fn operand_count(self) -> usize {
        match self.operand_shape() {
            OperandShape::None => 0,
            OperandShape::One => 1,
            OperandShape::Two => 2,
            OperandShape::Three => 3,
        }
    }

    #[must_use]
    pub fn operand_shape(self) -> OperandShape {
        use Opcode::{
            Add, AsAst, AsBool, AsLogical, BeginLoop, Br, BrFalse, BrObj, BrTrue, Call, CallStack, Dispatch, Dup,
            Dup2, EndContext, Extract1, Force, Inc, Invisible, Is, IsFun, IsSpecial, LdDdVar, LdFun, LdVar, LglAnd,
            LglOr, Lt, Pick, Pop, Promise, Push, PushCode, Put, Ret, StVar, Sub, Subset1, Swap, Uniq,
        };
        match self {
            Push | LdFun | LdVar | LdDdVar | PushCode | Promise | StVar | IsSpecial | Pick | Put => {
                OperandShape::One
            }
            Call | CallStack => OperandShape::Two,
            Dispatch => OperandShape::Three,
            Br | BrTrue | BrFalse | BrObj | BeginLoop => OperandShape::One,
            Is => OperandShape::One,
            Force
            | EndContext
            | Ret
            | Pop
            | Dup
            | Dup2
            | Swap
            | AsBool
            | AsLogical
            | LglAnd
            | LglOr
            | Lt
            | Add
            | Sub
            | Inc
            | Extract1
            | Subset1
            | Invisible
            | Uniq
            | AsAst
            | IsFun => OperandShape::None,
        }
    }

    /// Fixed stack effect (pushes minus pops), or `None` when the effect
    /// depends on an operand (`call_stack_`) and must be computed by the
    /// emitter instead.
    #[must_use]
    pub fn stack_effect(self) -> Option<i32> {
        use Opcode::{
            Add, AsAst, AsBool, AsLogical, BeginLoop, Br, BrFalse, BrObj, BrTrue, Call, CallStack, Dispatch, Dup,
            Dup2, EndContext, Extract1, Force, Inc, Invisible, Is, IsFun, IsSpecial, LdDdVar, LdFun, LdVar, LglAnd,
            LglOr, Lt, Pick, Pop, Promise, Push, PushCode, Put, Ret, StVar, Sub, Subset1, Swap, Uniq,
        };
        match self {
            Push | LdFun | LdVar | LdDdVar | PushCode | Promise => Some(1),
            Force | AsBool | AsLogical | Is | Inc | Uniq | AsAst | Invisible | Call | Dispatch => Some(0),
            BrTrue | BrFalse | LglAnd | LglOr | Lt | Add | Sub | Extract1 | Subset1 | StVar | Pop => Some(-1),
            Dup => Some(1),
            Dup2 => Some(2),
            Br | BrObj | BeginLoop | EndContext | Ret | Swap | Pick | Put | IsSpecial | IsFun => Some(0),
            // CallStack's effect is -(n) and depends on its first operand;
            // the emitter computes it directly rather than through this table.
            CallStack => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_round_trips() {
        for byte in 0u8..=(Opcode::IsSpecial as u8) {
            assert!(Opcode::from_repr(byte).is_some(), "missing opcode for byte {byte}");
        }
    }

    #[test]
    fn type_tag_matches_expected_values() {
        assert!(TypeTag::Nil.matches(&crate::value::Value::Nil));
        assert!(TypeTag::List.matches(&crate::value::Value::Nil));
        assert!(!TypeTag::Vec.matches(&crate::value::Value::Int(1)));
    }
}
