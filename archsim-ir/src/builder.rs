//! Instruction emission on top of a [`TranslationBuffer`].

use crate::buffer::TranslationBuffer;
use crate::error::IrError;
use crate::ids::IrBlockId;
use crate::instruction::{IrInstruction, Opcode, OperandDirection, MAX_OPERANDS};
use crate::operand::IrOperand;

macro_rules! emitters {
    ( $( $name:ident ( $( $arg:ident ),* ) => $opcode:ident; )* ) => {
        $(
            #[doc = concat!("Emits a `", stringify!($opcode), "` instruction into the current block.")]
            pub fn $name(&mut self $(, $arg: IrOperand )*) -> Result<(), IrError> {
                self.emit(Opcode::$opcode, &[$( $arg ),*])
            }
        )*
    };
}

/// Appends instructions to a [`TranslationBuffer`], stamping each with the current block.
///
/// The builder never allocates ids itself; [`alloc_block`](Self::alloc_block) and
/// [`alloc_reg`](Self::alloc_reg) forward to the buffer.
///
/// ```
/// use archsim_ir::buffer::TranslationBuffer;
/// use archsim_ir::builder::IrBuilder;
/// use archsim_ir::operand::IrOperand;
///
/// let mut buffer = TranslationBuffer::new();
/// let mut builder = IrBuilder::new(&mut buffer);
/// let entry = builder.alloc_block().unwrap();
/// builder.set_block(entry);
/// let r = builder.alloc_reg(4).unwrap();
/// builder.mov(IrOperand::const32(1), r).unwrap();
/// builder.ret().unwrap();
/// assert_eq!(buffer.count(), 2);
/// ```
#[derive(Debug)]
pub struct IrBuilder<'b> {
    buffer: &'b mut TranslationBuffer,
    current_block: IrBlockId,
}

impl<'b> IrBuilder<'b> {
    pub fn new(buffer: &'b mut TranslationBuffer) -> Self {
        Self {
            buffer,
            current_block: IrBlockId::NOP,
        }
    }

    /// A second builder over the same buffer, starting in the same block.
    ///
    /// Useful for nested translation phases: ids still come from the shared buffer.
    pub fn reborrow(&mut self) -> IrBuilder<'_> {
        IrBuilder {
            buffer: &mut *self.buffer,
            current_block: self.current_block,
        }
    }

    pub fn alloc_block(&mut self) -> Result<IrBlockId, IrError> {
        self.buffer.alloc_block()
    }

    /// Allocates a fresh virtual register of `size` bytes and returns it as an operand.
    pub fn alloc_reg(&mut self, size: u8) -> Result<IrOperand, IrError> {
        Ok(IrOperand::vreg(self.buffer.alloc_reg()?, size))
    }

    pub fn set_block(&mut self, block: IrBlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> Option<IrBlockId> {
        (!self.current_block.is_nop()).then_some(self.current_block)
    }

    pub fn buffer(&self) -> &TranslationBuffer {
        self.buffer
    }

    /// Validates `operands` against the opcode format and appends the instruction.
    pub fn emit(&mut self, opcode: Opcode, operands: &[IrOperand]) -> Result<(), IrError> {
        if self.current_block.is_nop() {
            return Err(IrError::NoCurrentBlock);
        }
        if operands.len() > MAX_OPERANDS {
            return Err(IrError::InvalidOperand {
                opcode,
                index: MAX_OPERANDS,
            });
        }
        let format = &opcode.descriptor().format;
        for (index, direction) in format.iter().enumerate() {
            let operand = operands.get(index).copied().unwrap_or_default();
            let valid = match direction {
                OperandDirection::Unused => operand.is_none(),
                OperandDirection::Out | OperandDirection::InOut => operand.is_vreg(),
                OperandDirection::In | OperandDirection::NotAnOperand => true,
            };
            if !valid {
                return Err(IrError::InvalidOperand { opcode, index });
            }
            match operand {
                IrOperand::VReg { id, .. } if id.index() >= self.buffer.reg_count() => {
                    return Err(IrError::UnknownRegister(id));
                }
                IrOperand::Block(block) if block.index() >= self.buffer.block_count() => {
                    return Err(IrError::UnknownBlock(block));
                }
                _ => {}
            }
        }
        self.buffer
            .add_instruction(self.current_block, IrInstruction::new(opcode, operands));
        Ok(())
    }

    /// Emits a call to the helper at `func` with up to five arguments.
    pub fn call(&mut self, func: IrOperand, args: &[IrOperand]) -> Result<(), IrError> {
        if args.len() >= MAX_OPERANDS {
            return Err(IrError::InvalidOperand {
                opcode: Opcode::Call,
                index: MAX_OPERANDS,
            });
        }
        let mut operands = [IrOperand::None; MAX_OPERANDS];
        operands[0] = func;
        operands[1..=args.len()].copy_from_slice(args);
        self.emit(Opcode::Call, &operands[..=args.len()])
    }

    emitters! {
        verify(pc) => Verify;
        count(counter, amount) => Count;
        int_check() => IntCheck;
        nop() => Nop;
        trap() => Trap;

        mov(src, dst) => Mov;
        cmov(cond, src, dst) => Cmov;
        ldpc(dst) => Ldpc;
        inc_pc(amount) => IncPc;

        add(src, dst) => Add;
        sub(src, dst) => Sub;
        imul(src, dst) => Imul;
        umul(src, dst) => Umul;
        udiv(src, dst) => Udiv;
        sdiv(src, dst) => Sdiv;
        modulo(src, dst) => Mod;

        shl(amount, dst) => Shl;
        shr(amount, dst) => Shr;
        sar(amount, dst) => Sar;
        ror(amount, dst) => Ror;
        rol(amount, dst) => Rol;
        clz(src, dst) => Clz;
        popcnt(src, dst) => Popcnt;
        bswap(src, dst) => Bswap;

        and(src, dst) => And;
        or(src, dst) => Or;
        xor(src, dst) => Xor;

        cmp_eq(lhs, rhs, dst) => CmpEq;
        cmp_ne(lhs, rhs, dst) => CmpNe;
        cmp_gt(lhs, rhs, dst) => CmpGt;
        cmp_gte(lhs, rhs, dst) => CmpGte;
        cmp_lt(lhs, rhs, dst) => CmpLt;
        cmp_lte(lhs, rhs, dst) => CmpLte;
        cmps_gt(lhs, rhs, dst) => CmpsGt;
        cmps_gte(lhs, rhs, dst) => CmpsGte;
        cmps_lt(lhs, rhs, dst) => CmpsLt;
        cmps_lte(lhs, rhs, dst) => CmpsLte;

        sx(src, dst) => MovSx;
        zx(src, dst) => MovZx;
        trunc(src, dst) => MovTrunc;

        ldreg(offset, dst) => Ldreg;
        streg(value, offset) => Streg;
        ldmem(interface, address, dst) => Ldmem;
        stmem(interface, address, value) => Stmem;

        jmp(target) => Jmp;
        branch(cond, taken, not_taken) => Branch;
        ret() => Ret;
        dispatch(target, fallthrough, target_block, fallthrough_block) => Dispatch;

        set_cpu_mode(mode) => SetCpuMode;
        set_feature(feature, level) => SetFeature;
        stdev(device, register, value) => Stdev;
        lddev(device, register, dst) => Lddev;
        probedev(device, dst) => Probedev;

        flush() => Flush;
        flush_itlb() => FlushItlb;
        flush_dtlb() => FlushDtlb;
        flush_itlb_entry(address) => FlushItlbEntry;
        flush_dtlb_entry(address) => FlushDtlbEntry;

        adc_flags(lhs, rhs, carry) => AdcFlags;
        sbc_flags(lhs, rhs, carry) => SbcFlags;
        zn_flags(value) => ZnFlags;

        barrier(kind) => Barrier;
        take_exception(category, data) => TakeException;
        profile(counter) => Profile;

        fmul(lhs, rhs, dst) => Fmul;
        fdiv(lhs, rhs, dst) => Fdiv;
        fadd(lhs, rhs, dst) => Fadd;
        fsub(lhs, rhs, dst) => Fsub;
        fsqrt(src, dst) => Fsqrt;
        fabs(src, dst) => Fabs;

        fcmp_lt(lhs, rhs, dst) => FcmpLt;
        fcmp_lte(lhs, rhs, dst) => FcmpLte;
        fcmp_gt(lhs, rhs, dst) => FcmpGt;
        fcmp_gte(lhs, rhs, dst) => FcmpGte;
        fcmp_eq(lhs, rhs, dst) => FcmpEq;
        fcmp_ne(lhs, rhs, dst) => FcmpNe;

        fcvt_ui_to_f(src, dst) => FcvtUiToF;
        fcvt_f_to_ui(src, dst) => FcvtFToUi;
        fcvt_f_to_ui_trunc(src, dst) => FcvttFToUi;
        fcvt_si_to_f(src, dst) => FcvtSiToF;
        fcvt_f_to_si(src, dst) => FcvtFToSi;
        fcvt_f_to_si_trunc(src, dst) => FcvttFToSi;
        fcvt_single_to_double(src, dst) => FcvtSToD;
        fcvt_double_to_single(src, dst) => FcvtDToS;

        fctrl_set_round(mode) => FctrlSetRound;
        fctrl_get_round(dst) => FctrlGetRound;
        fctrl_set_flush(mode) => FctrlSetFlush;
        fctrl_get_flush(dst) => FctrlGetFlush;

        vaddi(width, lhs, rhs, dst) => VAddI;
        vaddf(width, lhs, rhs, dst) => VAddF;
        vsubi(width, lhs, rhs, dst) => VSubI;
        vsubf(width, lhs, rhs, dst) => VSubF;
        vmuli(width, lhs, rhs, dst) => VMulI;
        vmulf(width, lhs, rhs, dst) => VMulF;
        vori(width, lhs, rhs, dst) => VOrI;
        vandi(width, lhs, rhs, dst) => VAndI;
        vxori(width, lhs, rhs, dst) => VXorI;
        vcmpeqi(width, lhs, rhs, dst) => VCmpEqI;
        vcmpgti(width, lhs, rhs, dst) => VCmpGtI;
        vcmpgtei(width, lhs, rhs, dst) => VCmpGteI;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_block_fails() {
        let mut buffer = TranslationBuffer::new();
        let mut builder = IrBuilder::new(&mut buffer);
        assert_eq!(builder.ret(), Err(IrError::NoCurrentBlock));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_instructions_stamped_with_current_block() {
        let mut buffer = TranslationBuffer::new();
        let mut builder = IrBuilder::new(&mut buffer);
        let b0 = builder.alloc_block().unwrap();
        let b1 = builder.alloc_block().unwrap();
        let r = builder.alloc_reg(4).unwrap();

        builder.set_block(b0);
        builder.mov(IrOperand::const32(5), r).unwrap();
        builder.jmp(IrOperand::block(b1)).unwrap();
        builder.set_block(b1);
        builder.ret().unwrap();

        let blocks: Vec<_> = buffer.iter().map(|i| i.block).collect();
        assert_eq!(blocks, [b0, b0, b1]);
    }

    #[test]
    fn test_output_operand_must_be_register() {
        let mut buffer = TranslationBuffer::new();
        let mut builder = IrBuilder::new(&mut buffer);
        let b0 = builder.alloc_block().unwrap();
        builder.set_block(b0);
        assert_eq!(
            builder.add(IrOperand::const32(1), IrOperand::const32(2)),
            Err(IrError::InvalidOperand {
                opcode: Opcode::Add,
                index: 1
            })
        );
    }

    #[test]
    fn test_foreign_ids_rejected() {
        let mut other = TranslationBuffer::new();
        let _ = other.alloc_block().unwrap();
        let foreign_block = other.alloc_block().unwrap();
        let foreign_reg = other.alloc_reg().unwrap();

        let mut buffer = TranslationBuffer::new();
        let mut builder = IrBuilder::new(&mut buffer);
        let b0 = builder.alloc_block().unwrap();
        builder.set_block(b0);
        assert_eq!(
            builder.jmp(IrOperand::block(foreign_block)),
            Err(IrError::UnknownBlock(foreign_block))
        );
        assert_eq!(
            builder.ldpc(IrOperand::vreg(foreign_reg, 4)),
            Err(IrError::UnknownRegister(foreign_reg))
        );
    }

    #[test]
    fn test_nested_builders_share_id_space() {
        let mut buffer = TranslationBuffer::new();
        let mut outer = IrBuilder::new(&mut buffer);
        let b0 = outer.alloc_block().unwrap();
        outer.set_block(b0);
        let r0 = outer.alloc_reg(4).unwrap();
        let r1 = {
            let mut inner = outer.reborrow();
            assert_eq!(inner.current_block(), Some(b0));
            let r1 = inner.alloc_reg(4).unwrap();
            inner.mov(r0, r1).unwrap();
            r1
        };
        assert!(r1.reg_id() > r0.reg_id());
        let r2 = outer.alloc_reg(4).unwrap();
        assert!(r2.reg_id() > r1.reg_id());
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn test_call_arity() {
        let mut buffer = TranslationBuffer::new();
        let mut builder = IrBuilder::new(&mut buffer);
        let b0 = builder.alloc_block().unwrap();
        builder.set_block(b0);
        builder
            .call(IrOperand::func(0x1000), &[IrOperand::const32(1); 5])
            .unwrap();
        assert!(builder
            .call(IrOperand::func(0x1000), &[IrOperand::const32(1); 6])
            .is_err());
        assert_eq!(buffer.at(0).unwrap().operand_count(), 6);
    }
}
