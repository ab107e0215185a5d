//! Instruction decoding: the external-decoder contract and its Capstone
//! implementation.

use capstone::arch::arm::{ArchMode, ArmCC, ArmInsn, ArmOperandType, ArmReg};
use capstone::arch::{ArchDetail, BuildsCapstone, DetailsArchInsn};
use capstone::{Capstone, InsnId, RegId};

use crate::Address;

/// Register identifier in the decoder's own numbering.
///
/// The id space belongs to whichever backend produced the instruction; the
/// follower never interprets values beyond equality checks against
/// [`Decoder::pc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u32);

/// One operand of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Reg(Reg),
    Mem { base: Reg, disp: i64 },
    /// Operand kinds the follower has no use for.
    Other,
}

/// Condition code attached to an instruction; `Al` executes unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Al,
    Other,
}

/// Mnemonic classes the control-flow follower dispatches on.
///
/// Everything else decodes as `Other` and is treated as straight-line code
/// with no control-flow effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    B,
    Cbz,
    Cbnz,
    Bx,
    Pop,
    Bl,
    Blx,
    Tbb,
    Ldr,
    Other,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub kind: InsnKind,
    /// Instruction mnemonic (e.g. "ldr", "b").
    pub mnemonic: String,
    /// Operands as the backend prints them.
    pub op_str: String,
    /// Size in bytes; 2 or 4 for Thumb.
    pub size: u8,
    pub operands: Vec<Operand>,
    pub cond: Cond,
}

/// Errors reported by a decoder.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The backing disassembly engine failed to open or decode.
    #[error("disassembly backend error: {0}")]
    Backend(#[from] capstone::Error),

    /// The bytes at `addr` do not form a valid instruction.
    #[error("invalid instruction encoding at 0x{0:X}")]
    InvalidInsn(Address),
}

/// Architecture-specific single-instruction decoder.
///
/// Implementations other than [`ThumbDecoder`] exist mainly so tests can
/// inject scripted instruction streams into the follower.
pub trait Decoder {
    /// Decode one instruction from `code` (the image tail beginning at the
    /// instruction) located at absolute address `addr`.
    fn decode(&self, code: &[u8], addr: Address) -> Result<Insn, DecodeError>;

    /// The backend's spelling of a register id.
    fn reg_name(&self, reg: Reg) -> String;

    /// The register id the backend uses for the program counter.
    fn pc(&self) -> Reg;
}

/// Capstone-backed decoder for ARM Thumb (including Thumb-2).
pub struct ThumbDecoder {
    cs: Capstone,
}

impl ThumbDecoder {
    /// Open a Capstone handle in Thumb mode with operand detail enabled.
    ///
    /// Detail is required: the follower reads structured operands and the
    /// condition code off every instruction.
    pub fn new() -> Result<Self, DecodeError> {
        let cs = Capstone::new()
            .arm()
            .mode(ArchMode::Thumb)
            .detail(true)
            .build()?;
        Ok(ThumbDecoder { cs })
    }
}

/// Map a Capstone instruction id onto the follower's mnemonic classes.
fn classify(id: InsnId) -> InsnKind {
    const B: u32 = ArmInsn::ARM_INS_B as u32;
    const CBZ: u32 = ArmInsn::ARM_INS_CBZ as u32;
    const CBNZ: u32 = ArmInsn::ARM_INS_CBNZ as u32;
    const BX: u32 = ArmInsn::ARM_INS_BX as u32;
    const POP: u32 = ArmInsn::ARM_INS_POP as u32;
    const BL: u32 = ArmInsn::ARM_INS_BL as u32;
    const BLX: u32 = ArmInsn::ARM_INS_BLX as u32;
    const TBB: u32 = ArmInsn::ARM_INS_TBB as u32;
    const LDR: u32 = ArmInsn::ARM_INS_LDR as u32;

    match id.0 {
        B => InsnKind::B,
        CBZ => InsnKind::Cbz,
        CBNZ => InsnKind::Cbnz,
        BX => InsnKind::Bx,
        POP => InsnKind::Pop,
        BL => InsnKind::Bl,
        BLX => InsnKind::Blx,
        TBB => InsnKind::Tbb,
        LDR => InsnKind::Ldr,
        _ => InsnKind::Other,
    }
}

fn convert_operand(op: &ArmOperandType) -> Operand {
    match op {
        ArmOperandType::Reg(reg) => Operand::Reg(Reg(reg.0 as u32)),
        ArmOperandType::Imm(imm) => Operand::Imm(*imm as i64),
        ArmOperandType::Mem(mem) => Operand::Mem {
            base: Reg(mem.base().0 as u32),
            disp: mem.disp() as i64,
        },
        _ => Operand::Other,
    }
}

impl Decoder for ThumbDecoder {
    fn decode(&self, code: &[u8], addr: Address) -> Result<Insn, DecodeError> {
        let decoded = self.cs.disasm_count(code, addr, 1)?;
        let insn = decoded
            .iter()
            .next()
            .ok_or(DecodeError::InvalidInsn(addr))?;

        let detail = self.cs.insn_detail(insn)?;
        let (operands, cond) = match detail.arch_detail() {
            ArchDetail::ArmDetail(arm) => {
                let operands = arm
                    .operands()
                    .map(|op| convert_operand(&op.op_type))
                    .collect();
                let cond = if arm.cc() == ArmCC::ARM_CC_AL {
                    Cond::Al
                } else {
                    Cond::Other
                };
                (operands, cond)
            }
            _ => (Vec::new(), Cond::Other),
        };

        Ok(Insn {
            kind: classify(insn.id()),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            op_str: insn.op_str().unwrap_or("").to_string(),
            size: insn.bytes().len() as u8,
            operands,
            cond,
        })
    }

    fn reg_name(&self, reg: Reg) -> String {
        self.cs
            .reg_name(RegId(reg.0 as u16))
            .unwrap_or_else(|| format!("reg{}", reg.0))
    }

    fn pc(&self) -> Reg {
        Reg(ArmReg::ARM_REG_PC as u32)
    }
}
