//! The closed IR opcode set and the fixed-layout instruction record.

use crate::ids::IrBlockId;
use crate::operand::IrOperand;
use std::fmt;

/// Maximum number of operands an instruction can carry.
pub const MAX_OPERANDS: usize = 6;

const_assert!(MAX_OPERANDS == 6);

/// How an instruction uses one of its operand slots.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperandDirection {
    /// Read by the instruction.
    In,
    /// Written by the instruction.
    Out,
    /// Read, then written.
    InOut,
    /// Present, but not a register use (block targets, immediates, helper addresses).
    NotAnOperand,
    /// Must be [`IrOperand::None`].
    Unused,
}

impl OperandDirection {
    pub fn is_use(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    pub fn is_def(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }

    const fn parse(c: u8) -> Self {
        match c {
            b'I' => Self::In,
            b'O' => Self::Out,
            b'B' => Self::InOut,
            b'N' => Self::NotAnOperand,
            b'X' => Self::Unused,
            _ => panic!("invalid operand direction"),
        }
    }
}

/// Static information about an [`Opcode`].
#[derive(Debug)]
pub struct OpcodeDescriptor {
    pub mnemonic: &'static str,
    pub format: [OperandDirection; MAX_OPERANDS],
    pub has_side_effects: bool,
}

impl OpcodeDescriptor {
    const fn new(mnemonic: &'static str, format: &[u8; MAX_OPERANDS], side_effects: bool) -> Self {
        let mut directions = [OperandDirection::Unused; MAX_OPERANDS];
        let mut i = 0;
        while i < MAX_OPERANDS {
            directions[i] = OperandDirection::parse(format[i]);
            i += 1;
        }
        Self {
            mnemonic,
            format: directions,
            has_side_effects: side_effects,
        }
    }
}

macro_rules! opcodes {
    ( $( $variant:ident => $mnemonic:literal, $format:literal, $side_effects:literal; )* ) => {
        /// Every operation the IR can express. This set is closed.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub enum Opcode {
            $( $variant, )*
        }

        static DESCRIPTORS: &[OpcodeDescriptor] = &[
            $( OpcodeDescriptor::new($mnemonic, $format, $side_effects), )*
        ];

        impl Opcode {
            /// All opcodes, in declaration order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )* ];
        }
    };
}

opcodes! {
    Verify => "verify", b"NXXXXX", true;
    Count => "count", b"NNXXXX", true;
    IntCheck => "int_check", b"XXXXXX", true;
    Nop => "nop", b"XXXXXX", false;
    Trap => "trap", b"XXXXXX", true;

    Mov => "mov", b"IOXXXX", false;
    Cmov => "cmov", b"IIBXXX", false;
    Ldpc => "ldpc", b"OXXXXX", false;
    IncPc => "inc-pc", b"IXXXXX", true;

    Add => "add", b"IBXXXX", false;
    Sub => "sub", b"IBXXXX", false;
    Imul => "imul", b"IBXXXX", false;
    Umul => "umul", b"IBXXXX", false;
    Udiv => "udiv", b"IBXXXX", false;
    Sdiv => "sdiv", b"IBXXXX", false;
    Mod => "mod", b"IBXXXX", false;

    Shl => "shl", b"IBXXXX", false;
    Shr => "shr", b"IBXXXX", false;
    Sar => "sar", b"IBXXXX", false;
    Ror => "ror", b"IBXXXX", false;
    Rol => "rol", b"IBXXXX", false;
    Clz => "clz", b"IOXXXX", false;
    Popcnt => "popcnt", b"IOXXXX", false;
    Bswap => "bswap", b"IOXXXX", false;

    And => "and", b"IBXXXX", false;
    Or => "or", b"IBXXXX", false;
    Xor => "xor", b"IBXXXX", false;

    CmpEq => "cmp eq", b"IIOXXX", false;
    CmpNe => "cmp ne", b"IIOXXX", false;
    CmpGt => "cmp gt", b"IIOXXX", false;
    CmpGte => "cmp gte", b"IIOXXX", false;
    CmpLt => "cmp lt", b"IIOXXX", false;
    CmpLte => "cmp lte", b"IIOXXX", false;

    MovSx => "mov sx", b"IOXXXX", false;
    MovZx => "mov zx", b"IOXXXX", false;
    MovTrunc => "mov trunc", b"IOXXXX", false;

    Ldreg => "ldreg", b"IOXXXX", false;
    Streg => "streg", b"IIXXXX", true;
    Ldmem => "ldmem", b"NIOXXX", true;
    Stmem => "stmem", b"NIIXXX", true;

    Call => "call", b"NIIIII", true;
    Jmp => "jmp", b"NXXXXX", true;
    Branch => "branch", b"INNXXX", true;
    Ret => "ret", b"XXXXXX", true;
    Dispatch => "dispatch", b"NNNNXX", true;

    SetCpuMode => "scm", b"IXXXXX", true;
    SetFeature => "set_feature", b"NNXXXX", true;
    Stdev => "stdev", b"IIIXXX", true;
    Lddev => "lddev", b"IIOXXX", false;
    Probedev => "probedev", b"IOXXXX", false;

    Flush => "flush", b"XXXXXX", true;
    FlushItlb => "flush itlb", b"XXXXXX", true;
    FlushDtlb => "flush dtlb", b"XXXXXX", true;
    FlushItlbEntry => "flush itlb entry", b"IXXXXX", true;
    FlushDtlbEntry => "flush dtlb entry", b"IXXXXX", true;

    AdcFlags => "adc flags", b"IIIXXX", true;
    SbcFlags => "sbc flags", b"IIIXXX", true;
    ZnFlags => "zn flags", b"IXXXXX", true;

    Barrier => "barrier", b"NXXXXX", true;
    TakeException => "exception", b"IIXXXX", true;
    Profile => "profile", b"NXXXXX", true;

    CmpsGt => "cmps gt", b"IIOXXX", false;
    CmpsGte => "cmps gte", b"IIOXXX", false;
    CmpsLt => "cmps lt", b"IIOXXX", false;
    CmpsLte => "cmps lte", b"IIOXXX", false;

    Fmul => "fmul", b"IIOXXX", false;
    Fdiv => "fdiv", b"IIOXXX", false;
    Fadd => "fadd", b"IIOXXX", false;
    Fsub => "fsub", b"IIOXXX", false;
    Fsqrt => "fsqrt", b"IOXXXX", false;
    Fabs => "fabs", b"IOXXXX", false;

    FcmpLt => "fcmp_lt", b"IIOXXX", false;
    FcmpLte => "fcmp_lte", b"IIOXXX", false;
    FcmpGt => "fcmp_gt", b"IIOXXX", false;
    FcmpGte => "fcmp_gte", b"IIOXXX", false;
    FcmpEq => "fcmp_eq", b"IIOXXX", false;
    FcmpNe => "fcmp_ne", b"IIOXXX", false;

    FcvtUiToF => "fcvt_ui_to_f", b"IOXXXX", false;
    FcvtFToUi => "fcvt_f_to_ui", b"IOXXXX", false;
    FcvttFToUi => "fcvtt_f_to_ui", b"IOXXXX", false;
    FcvtSiToF => "fcvt_si_to_f", b"IOXXXX", false;
    FcvtFToSi => "fcvt_f_to_si", b"IOXXXX", false;
    FcvttFToSi => "fcvtt_f_to_si", b"IOXXXX", false;
    FcvtSToD => "fcvt_s_to_d", b"IOXXXX", false;
    FcvtDToS => "fcvt_d_to_s", b"IOXXXX", false;

    FctrlSetRound => "fctrl_setrnd", b"IXXXXX", true;
    FctrlGetRound => "fctrl_getrnd", b"OXXXXX", false;
    FctrlSetFlush => "fctrl_setflush", b"IXXXXX", true;
    FctrlGetFlush => "fctrl_getflush", b"OXXXXX", false;

    VAddI => "vaddi", b"NIIOXX", false;
    VAddF => "vaddf", b"NIIOXX", false;
    VSubI => "vsubi", b"NIIOXX", false;
    VSubF => "vsubf", b"NIIOXX", false;
    VMulI => "vmuli", b"NIIOXX", false;
    VMulF => "vmulf", b"NIIOXX", false;
    VOrI => "vori", b"NIIOXX", false;
    VAndI => "vandi", b"NIIOXX", false;
    VXorI => "vxori", b"NIIOXX", false;
    VCmpEqI => "vcmpeqi", b"NIIOXX", false;
    VCmpGtI => "vcmpgti", b"NIIOXX", false;
    VCmpGteI => "vcmpgtei", b"NIIOXX", false;
}

impl Opcode {
    pub fn descriptor(self) -> &'static OpcodeDescriptor {
        &DESCRIPTORS[self as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        self.descriptor().mnemonic
    }

    pub fn has_side_effects(self) -> bool {
        self.descriptor().has_side_effects
    }

    /// Returns `true` if this opcode ends a block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::Branch | Self::Ret | Self::Dispatch | Self::Trap
        )
    }
}

/// One fixed-layout IR instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct IrInstruction {
    pub block: IrBlockId,
    pub opcode: Opcode,
    pub operands: [IrOperand; MAX_OPERANDS],
}

impl IrInstruction {
    /// Creates an instruction not yet stamped with a block.
    ///
    /// Operands beyond `operands.len()` are set to [`IrOperand::None`].
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_OPERANDS`] operands are passed.
    pub fn new(opcode: Opcode, operands: &[IrOperand]) -> Self {
        assert!(operands.len() <= MAX_OPERANDS, "too many operands");
        let mut slots = [IrOperand::None; MAX_OPERANDS];
        slots[..operands.len()].copy_from_slice(operands);
        Self {
            block: IrBlockId::NOP,
            opcode,
            operands: slots,
        }
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, &[])
    }

    /// Number of leading operands that are not [`IrOperand::None`].
    pub fn operand_count(&self) -> usize {
        self.operands
            .iter()
            .position(IrOperand::is_none)
            .unwrap_or(MAX_OPERANDS)
    }

    pub fn has_side_effects(&self) -> bool {
        self.opcode.has_side_effects()
    }

    /// Iterates over the present operands together with how they are used.
    pub fn operands_with_direction(
        &self,
    ) -> impl Iterator<Item = (usize, &IrOperand, OperandDirection)> + '_ {
        let format = &self.opcode.descriptor().format;
        self.operands[..self.operand_count()]
            .iter()
            .enumerate()
            .map(move |(i, operand)| (i, operand, format[i]))
    }

    /// Makes this instruction a no-op in place, keeping its block stamp.
    pub fn make_nop(&mut self) {
        let block = self.block;
        *self = Self::nop();
        self.block = block;
    }
}

impl fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        for (i, operand) in self.operands[..self.operand_count()].iter().enumerate() {
            let separator = if i == 0 { " " } else { ", " };
            write!(f, "{separator}{operand}")?;
        }
        Ok(())
    }
}
