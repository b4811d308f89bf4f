//! The CIL opcode table (ECMA-335 Partition III).
//!
//! Single-byte opcodes carry their byte as value. Two-byte opcodes share the `0xFE` prefix,
//! which is kept in the high byte of [`OpCode::value`] (e.g. `ceq` is `0xFE01`).
#![allow(missing_docs)]

use std::{collections::HashMap, sync::OnceLock};

use crate::assembly::instruction::{FlowType, OperandType};

/// First byte of every two-byte opcode.
pub const FE_PREFIX: u8 = 0xFE;

opcodes! {
    Nop = 0x00, "nop", None, Sequential;
    Break = 0x01, "break", None, Sequential;
    Ldarg0 = 0x02, "ldarg.0", None, Sequential;
    Ldarg1 = 0x03, "ldarg.1", None, Sequential;
    Ldarg2 = 0x04, "ldarg.2", None, Sequential;
    Ldarg3 = 0x05, "ldarg.3", None, Sequential;
    Ldloc0 = 0x06, "ldloc.0", None, Sequential;
    Ldloc1 = 0x07, "ldloc.1", None, Sequential;
    Ldloc2 = 0x08, "ldloc.2", None, Sequential;
    Ldloc3 = 0x09, "ldloc.3", None, Sequential;
    Stloc0 = 0x0A, "stloc.0", None, Sequential;
    Stloc1 = 0x0B, "stloc.1", None, Sequential;
    Stloc2 = 0x0C, "stloc.2", None, Sequential;
    Stloc3 = 0x0D, "stloc.3", None, Sequential;
    LdargS = 0x0E, "ldarg.s", ShortInlineVar, Sequential;
    LdargaS = 0x0F, "ldarga.s", ShortInlineVar, Sequential;
    StargS = 0x10, "starg.s", ShortInlineVar, Sequential;
    LdlocS = 0x11, "ldloc.s", ShortInlineVar, Sequential;
    LdlocaS = 0x12, "ldloca.s", ShortInlineVar, Sequential;
    StlocS = 0x13, "stloc.s", ShortInlineVar, Sequential;
    Ldnull = 0x14, "ldnull", None, Sequential;
    LdcI4M1 = 0x15, "ldc.i4.m1", None, Sequential;
    LdcI40 = 0x16, "ldc.i4.0", None, Sequential;
    LdcI41 = 0x17, "ldc.i4.1", None, Sequential;
    LdcI42 = 0x18, "ldc.i4.2", None, Sequential;
    LdcI43 = 0x19, "ldc.i4.3", None, Sequential;
    LdcI44 = 0x1A, "ldc.i4.4", None, Sequential;
    LdcI45 = 0x1B, "ldc.i4.5", None, Sequential;
    LdcI46 = 0x1C, "ldc.i4.6", None, Sequential;
    LdcI47 = 0x1D, "ldc.i4.7", None, Sequential;
    LdcI48 = 0x1E, "ldc.i4.8", None, Sequential;
    LdcI4S = 0x1F, "ldc.i4.s", ShortInlineI, Sequential;
    LdcI4 = 0x20, "ldc.i4", InlineI, Sequential;
    LdcI8 = 0x21, "ldc.i8", InlineI8, Sequential;
    LdcR4 = 0x22, "ldc.r4", ShortInlineR, Sequential;
    LdcR8 = 0x23, "ldc.r8", InlineR, Sequential;
    Dup = 0x25, "dup", None, Sequential;
    Pop = 0x26, "pop", None, Sequential;
    Jmp = 0x27, "jmp", InlineMethod, Call;
    Call = 0x28, "call", InlineMethod, Call;
    Calli = 0x29, "calli", InlineSig, Call;
    Ret = 0x2A, "ret", None, Return;
    BrS = 0x2B, "br.s", ShortInlineBrTarget, UnconditionalBranch;
    BrfalseS = 0x2C, "brfalse.s", ShortInlineBrTarget, ConditionalBranch;
    BrtrueS = 0x2D, "brtrue.s", ShortInlineBrTarget, ConditionalBranch;
    BeqS = 0x2E, "beq.s", ShortInlineBrTarget, ConditionalBranch;
    BgeS = 0x2F, "bge.s", ShortInlineBrTarget, ConditionalBranch;
    BgtS = 0x30, "bgt.s", ShortInlineBrTarget, ConditionalBranch;
    BleS = 0x31, "ble.s", ShortInlineBrTarget, ConditionalBranch;
    BltS = 0x32, "blt.s", ShortInlineBrTarget, ConditionalBranch;
    BneUnS = 0x33, "bne.un.s", ShortInlineBrTarget, ConditionalBranch;
    BgeUnS = 0x34, "bge.un.s", ShortInlineBrTarget, ConditionalBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortInlineBrTarget, ConditionalBranch;
    BleUnS = 0x36, "ble.un.s", ShortInlineBrTarget, ConditionalBranch;
    BltUnS = 0x37, "blt.un.s", ShortInlineBrTarget, ConditionalBranch;
    Br = 0x38, "br", InlineBrTarget, UnconditionalBranch;
    Brfalse = 0x39, "brfalse", InlineBrTarget, ConditionalBranch;
    Brtrue = 0x3A, "brtrue", InlineBrTarget, ConditionalBranch;
    Beq = 0x3B, "beq", InlineBrTarget, ConditionalBranch;
    Bge = 0x3C, "bge", InlineBrTarget, ConditionalBranch;
    Bgt = 0x3D, "bgt", InlineBrTarget, ConditionalBranch;
    Ble = 0x3E, "ble", InlineBrTarget, ConditionalBranch;
    Blt = 0x3F, "blt", InlineBrTarget, ConditionalBranch;
    BneUn = 0x40, "bne.un", InlineBrTarget, ConditionalBranch;
    BgeUn = 0x41, "bge.un", InlineBrTarget, ConditionalBranch;
    BgtUn = 0x42, "bgt.un", InlineBrTarget, ConditionalBranch;
    BleUn = 0x43, "ble.un", InlineBrTarget, ConditionalBranch;
    BltUn = 0x44, "blt.un", InlineBrTarget, ConditionalBranch;
    Switch = 0x45, "switch", InlineSwitch, Switch;
    LdindI1 = 0x46, "ldind.i1", None, Sequential;
    LdindU1 = 0x47, "ldind.u1", None, Sequential;
    LdindI2 = 0x48, "ldind.i2", None, Sequential;
    LdindU2 = 0x49, "ldind.u2", None, Sequential;
    LdindI4 = 0x4A, "ldind.i4", None, Sequential;
    LdindU4 = 0x4B, "ldind.u4", None, Sequential;
    LdindI8 = 0x4C, "ldind.i8", None, Sequential;
    LdindI = 0x4D, "ldind.i", None, Sequential;
    LdindR4 = 0x4E, "ldind.r4", None, Sequential;
    LdindR8 = 0x4F, "ldind.r8", None, Sequential;
    LdindRef = 0x50, "ldind.ref", None, Sequential;
    StindRef = 0x51, "stind.ref", None, Sequential;
    StindI1 = 0x52, "stind.i1", None, Sequential;
    StindI2 = 0x53, "stind.i2", None, Sequential;
    StindI4 = 0x54, "stind.i4", None, Sequential;
    StindI8 = 0x55, "stind.i8", None, Sequential;
    StindR4 = 0x56, "stind.r4", None, Sequential;
    StindR8 = 0x57, "stind.r8", None, Sequential;
    Add = 0x58, "add", None, Sequential;
    Sub = 0x59, "sub", None, Sequential;
    Mul = 0x5A, "mul", None, Sequential;
    Div = 0x5B, "div", None, Sequential;
    DivUn = 0x5C, "div.un", None, Sequential;
    Rem = 0x5D, "rem", None, Sequential;
    RemUn = 0x5E, "rem.un", None, Sequential;
    And = 0x5F, "and", None, Sequential;
    Or = 0x60, "or", None, Sequential;
    Xor = 0x61, "xor", None, Sequential;
    Shl = 0x62, "shl", None, Sequential;
    Shr = 0x63, "shr", None, Sequential;
    ShrUn = 0x64, "shr.un", None, Sequential;
    Neg = 0x65, "neg", None, Sequential;
    Not = 0x66, "not", None, Sequential;
    ConvI1 = 0x67, "conv.i1", None, Sequential;
    ConvI2 = 0x68, "conv.i2", None, Sequential;
    ConvI4 = 0x69, "conv.i4", None, Sequential;
    ConvI8 = 0x6A, "conv.i8", None, Sequential;
    ConvR4 = 0x6B, "conv.r4", None, Sequential;
    ConvR8 = 0x6C, "conv.r8", None, Sequential;
    ConvU4 = 0x6D, "conv.u4", None, Sequential;
    ConvU8 = 0x6E, "conv.u8", None, Sequential;
    Callvirt = 0x6F, "callvirt", InlineMethod, Call;
    Cpobj = 0x70, "cpobj", InlineType, Sequential;
    Ldobj = 0x71, "ldobj", InlineType, Sequential;
    Ldstr = 0x72, "ldstr", InlineString, Sequential;
    Newobj = 0x73, "newobj", InlineMethod, Call;
    Castclass = 0x74, "castclass", InlineType, Sequential;
    Isinst = 0x75, "isinst", InlineType, Sequential;
    Unbox = 0x79, "unbox", InlineType, Sequential;
    Throw = 0x7A, "throw", None, Throw;
    Ldfld = 0x7B, "ldfld", InlineField, Sequential;
    Ldflda = 0x7C, "ldflda", InlineField, Sequential;
    Stfld = 0x7D, "stfld", InlineField, Sequential;
    Ldsfld = 0x7E, "ldsfld", InlineField, Sequential;
    Ldsflda = 0x7F, "ldsflda", InlineField, Sequential;
    Stsfld = 0x80, "stsfld", InlineField, Sequential;
    Stobj = 0x81, "stobj", InlineType, Sequential;
    Box = 0x8C, "box", InlineType, Sequential;
    Newarr = 0x8D, "newarr", InlineType, Sequential;
    Ldlen = 0x8E, "ldlen", None, Sequential;
    Ldelema = 0x8F, "ldelema", InlineType, Sequential;
    LdelemRef = 0x9A, "ldelem.ref", None, Sequential;
    StelemRef = 0xA2, "stelem.ref", None, Sequential;
    UnboxAny = 0xA5, "unbox.any", InlineType, Sequential;
    Ldtoken = 0xD0, "ldtoken", InlineTok, Sequential;
    ConvU2 = 0xD1, "conv.u2", None, Sequential;
    ConvU1 = 0xD2, "conv.u1", None, Sequential;
    ConvI = 0xD3, "conv.i", None, Sequential;
    Endfinally = 0xDC, "endfinally", None, EndFinally;
    Leave = 0xDD, "leave", InlineBrTarget, Leave;
    LeaveS = 0xDE, "leave.s", ShortInlineBrTarget, Leave;
    Arglist = 0xFE00, "arglist", None, Sequential;
    Ceq = 0xFE01, "ceq", None, Sequential;
    Cgt = 0xFE02, "cgt", None, Sequential;
    CgtUn = 0xFE03, "cgt.un", None, Sequential;
    Clt = 0xFE04, "clt", None, Sequential;
    CltUn = 0xFE05, "clt.un", None, Sequential;
    Ldftn = 0xFE06, "ldftn", InlineMethod, Sequential;
    Ldvirtftn = 0xFE07, "ldvirtftn", InlineMethod, Sequential;
    Ldarg = 0xFE09, "ldarg", InlineVar, Sequential;
    Ldarga = 0xFE0A, "ldarga", InlineVar, Sequential;
    Starg = 0xFE0B, "starg", InlineVar, Sequential;
    Ldloc = 0xFE0C, "ldloc", InlineVar, Sequential;
    Ldloca = 0xFE0D, "ldloca", InlineVar, Sequential;
    Stloc = 0xFE0E, "stloc", InlineVar, Sequential;
    Endfilter = 0xFE11, "endfilter", None, Return;
    Initobj = 0xFE15, "initobj", InlineType, Sequential;
    Rethrow = 0xFE1A, "rethrow", None, Throw;
    Sizeof = 0xFE1C, "sizeof", InlineType, Sequential;
}

impl OpCode {
    /// Look up an opcode by its encoded value.
    #[must_use]
    pub fn from_value(value: u16) -> Option<OpCode> {
        static TABLE: OnceLock<HashMap<u16, OpCode>> = OnceLock::new();
        TABLE
            .get_or_init(|| OpCode::ALL.iter().map(|op| (op.value(), *op)).collect())
            .get(&value)
            .copied()
    }

    /// Look up an opcode by its mnemonic.
    #[must_use]
    pub fn from_mnemonic(mnemonic: &str) -> Option<OpCode> {
        static TABLE: OnceLock<HashMap<&'static str, OpCode>> = OnceLock::new();
        TABLE
            .get_or_init(|| OpCode::ALL.iter().map(|op| (op.mnemonic(), *op)).collect())
            .get(mnemonic)
            .copied()
    }

    /// Encoded length of the opcode itself (without operand).
    #[must_use]
    pub fn len(self) -> usize {
        if self.value() > 0xFF {
            2
        } else {
            1
        }
    }

    /// The long-form equivalent of a short branch, or `self`.
    #[must_use]
    pub fn long_form(self) -> OpCode {
        match self {
            OpCode::BrS => OpCode::Br,
            OpCode::BrfalseS => OpCode::Brfalse,
            OpCode::BrtrueS => OpCode::Brtrue,
            OpCode::BeqS => OpCode::Beq,
            OpCode::BgeS => OpCode::Bge,
            OpCode::BgtS => OpCode::Bgt,
            OpCode::BleS => OpCode::Ble,
            OpCode::BltS => OpCode::Blt,
            OpCode::BneUnS => OpCode::BneUn,
            OpCode::BgeUnS => OpCode::BgeUn,
            OpCode::BgtUnS => OpCode::BgtUn,
            OpCode::BleUnS => OpCode::BleUn,
            OpCode::BltUnS => OpCode::BltUn,
            OpCode::LeaveS => OpCode::Leave,
            other => other,
        }
    }

    /// `true` for `ldc.i4.*` shorthand forms and the inline integer loads.
    #[must_use]
    pub fn is_ldc_i4(self) -> bool {
        matches!(
            self,
            OpCode::LdcI4M1
                | OpCode::LdcI40
                | OpCode::LdcI41
                | OpCode::LdcI42
                | OpCode::LdcI43
                | OpCode::LdcI44
                | OpCode::LdcI45
                | OpCode::LdcI46
                | OpCode::LdcI47
                | OpCode::LdcI48
                | OpCode::LdcI4S
                | OpCode::LdcI4
        )
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_value_and_mnemonic() {
        assert_eq!(OpCode::from_value(0x28), Some(OpCode::Call));
        assert_eq!(OpCode::from_value(0xFE01), Some(OpCode::Ceq));
        assert_eq!(OpCode::from_value(0x24), None);
        assert_eq!(OpCode::from_mnemonic("brtrue.s"), Some(OpCode::BrtrueS));
        assert_eq!(OpCode::Ldsfld.value(), 0x7E);
    }

    #[test]
    fn table_is_consistent() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::from_value(op.value()), Some(*op), "{op}");
            assert_eq!(OpCode::from_mnemonic(op.mnemonic()), Some(*op));
            let expected = if op.value() > 0xFF { 2 } else { 1 };
            assert_eq!(op.len(), expected);
        }
    }

    #[test]
    fn short_branches_widen() {
        assert_eq!(OpCode::BrtrueS.long_form(), OpCode::Brtrue);
        assert_eq!(OpCode::LeaveS.long_form(), OpCode::Leave);
        assert_eq!(OpCode::Call.long_form(), OpCode::Call);
        assert_eq!(OpCode::Brtrue.operand_type(), OperandType::InlineBrTarget);
    }
}
