//! The image model: control-flow follower and the public analysis surface.

use std::collections::VecDeque;

use log::{debug, error};

use crate::decoder::{Cond, DecodeError, Decoder, InsnKind, Operand, Reg, ThumbDecoder};
use crate::{emit, Address, Image, Label, LabelKind, ModelError, RefDb, RefElem, RefFlags, Render};

/// A pending disassembly request on the work list.
///
/// `thumb_func` rides along for targets resolved from indirect branches, so
/// the target record picks up its `.thumb_func` marker whether the job
/// decodes fresh code or lands on an already-analysed address.
struct Job {
    addr: Address,
    label: Label,
    thumb_func: bool,
}

/// What the immediately preceding instruction loaded, if it was a
/// PC-relative LDR: destination register, the literal's file offset, and the
/// 32-bit value read from the pool.
struct LdrTrack {
    reg: Reg,
    offset: Address,
    data: u32,
}

/// Recursive-descent disassembler over a loaded firmware image.
///
/// The model owns the reference database that maps every analysed file
/// offset to its meaning, and drives an external [`Decoder`] to classify
/// instructions. See the crate docs for the expected call sequence:
/// [`load_image`](ImageModel::load_image), one or more
/// [`add_entry`](ImageModel::add_entry) calls, then
/// [`make_code`](ImageModel::make_code).
pub struct ImageModel {
    decoder: Box<dyn Decoder>,
    image: Image,
    refs: RefDb,
}

impl ImageModel {
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        ImageModel {
            decoder,
            image: Image::default(),
            refs: RefDb::new(),
        }
    }

    /// Convenience constructor over the Capstone Thumb backend.
    pub fn thumb() -> Result<Self, DecodeError> {
        Ok(ImageModel::new(Box::new(ThumbDecoder::new()?)))
    }

    /// Install the binary and its load base address, discarding any previous
    /// analysis.
    pub fn load_image(&mut self, bytes: impl Into<Vec<u8>>, base: Address) {
        self.image = Image::new(bytes, base);
        self.refs = RefDb::new();
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn refs(&self) -> &RefDb {
        &self.refs
    }

    /// Seed analysis at `addr`, optionally naming the entry point.
    ///
    /// May be called repeatedly; re-entering analysed code only reconciles
    /// labels. Returns the number of instructions newly decoded along this
    /// entry's flow, which is advisory only.
    pub fn add_entry(&mut self, addr: Address, name: Option<&str>) -> u64 {
        let label = match name {
            Some(name) if !name.is_empty() => Label::named(name),
            _ => Label::named(format!("loc_{:X}", addr)),
        };
        self.disassemble_from(addr, label)
    }

    /// Render the current reference database as a GNU-as Thumb listing.
    pub fn make_code(&self) -> Result<String, ModelError> {
        emit::render(&self.image, &self.refs)
    }

    /// Drain the work list seeded with `start`. Discovered branch targets,
    /// call targets, and table cases queue behind the seeding job; visit
    /// order does not affect the final database beyond same-priority label
    /// tie-breaks.
    fn disassemble_from(&mut self, start: Address, label: Label) -> u64 {
        let mut work = VecDeque::new();
        work.push_back(Job {
            addr: start,
            label,
            thumb_func: false,
        });

        let mut total = 0;
        while let Some(job) = work.pop_front() {
            total += self.follow(job, &mut work);
        }
        total
    }

    /// Run one job: reconcile the label if the address is already analysed,
    /// otherwise decode linearly until the flow ends, queueing every
    /// discovered target.
    fn follow(&mut self, job: Job, work: &mut VecDeque<Job>) -> u64 {
        let Job {
            addr: start,
            label,
            thumb_func,
        } = job;

        // A re-arrival only reconciles the label at the landing site: keep
        // the stronger kind, let equal kinds take the newer name.
        if let Ok(off) = self.image.offset_of(start) {
            if let Some(elem) = self.refs.get_mut(off) {
                if label.kind <= elem.ltype {
                    if !elem.label.is_empty() && elem.label != label.name {
                        debug!("rename {} -> {}", elem.label, label.name);
                    }
                    elem.ltype = label.kind;
                    elem.label = label.name;
                }
                if thumb_func {
                    elem.flags |= RefFlags::THUMB_FUNC;
                }
                return 0;
            }
        }

        debug!("disassemble from 0x{:X}", start);

        let mut offset = match self.image.offset_of(start) {
            Ok(off) => off,
            Err(err) => {
                error!("entry rejected: {}", err);
                return 0;
            }
        };

        let mut total = 0;
        let mut ldr: Option<LdrTrack> = None;

        loop {
            let tail = self.image.bytes().get(offset as usize..).unwrap_or(&[]);
            let insn = match self.decoder.decode(tail, self.image.base() + offset) {
                Ok(insn) => insn,
                Err(err) => {
                    error!(
                        "disassemble error at 0x{:X}: {}",
                        self.image.base() + offset,
                        err
                    );
                    break;
                }
            };

            if self.refs.contains(offset) {
                // ran into already disassembled code
                break;
            }

            let mut elem = RefElem::code(insn.size, format!("{} {}", insn.mnemonic, insn.op_str));
            if self.image.base() + offset == start {
                elem.ltype = label.kind;
                elem.label = label.name.clone();
                if thumb_func {
                    elem.flags |= RefFlags::THUMB_FUNC;
                }
            }
            self.refs.add(offset, elem);

            // Valid for this iteration only.
            let ldr_prev = ldr.take();
            let mut stop = false;

            match insn.kind {
                InsnKind::B => {
                    let [Operand::Imm(imm)] = insn.operands.as_slice() else {
                        panic!("direct branch without a single immediate operand");
                    };
                    let target = *imm as Address;

                    let elem = self.refs.get_mut(offset).expect("just inserted");
                    elem.render = Render::Target;
                    elem.target = target;
                    elem.text = format!("{} ", insn.mnemonic);

                    let name = format!("jump_{:X}", target);
                    debug!("jump {}", name);
                    work.push_back(Job {
                        addr: target,
                        label: Label::new(LabelKind::Jump, name),
                        thumb_func: false,
                    });

                    if insn.cond == Cond::Al {
                        stop = true;
                    }
                }

                InsnKind::Cbz | InsnKind::Cbnz => {
                    let [Operand::Reg(reg), Operand::Imm(imm)] = insn.operands.as_slice() else {
                        panic!("compare-and-branch without register and immediate operands");
                    };
                    let target = *imm as Address;
                    let reg_name = self.decoder.reg_name(*reg);

                    let elem = self.refs.get_mut(offset).expect("just inserted");
                    elem.render = Render::Target;
                    elem.target = target;
                    elem.text = format!("{} {}, ", insn.mnemonic, reg_name);

                    let name = format!("jump_{:X}", target);
                    debug!("jump {}", name);
                    work.push_back(Job {
                        addr: target,
                        label: Label::new(LabelKind::Jump, name),
                        thumb_func: false,
                    });
                }

                InsnKind::Bx => {
                    match (&ldr_prev, insn.operands.as_slice()) {
                        (Some(track), [Operand::Reg(reg)]) if *reg == track.reg => {
                            // The just-loaded literal is the branch target;
                            // clear its Thumb bit.
                            let target = (track.data as Address) & !1;
                            let name = format!("jump_{:X}", target);
                            debug!("jump {}", name);
                            self.retarget_indirect(
                                offset,
                                track,
                                target,
                                Label::new(LabelKind::Jump, name),
                                work,
                            );
                        }
                        _ => debug!("branch reg"),
                    }
                    stop = true;
                }

                InsnKind::Pop => {
                    let pc = self.decoder.pc();
                    if insn
                        .operands
                        .iter()
                        .any(|op| matches!(op, Operand::Reg(reg) if *reg == pc))
                    {
                        debug!("pop pc");
                        stop = true;
                    }
                }

                InsnKind::Bl => {
                    let [Operand::Imm(imm)] = insn.operands.as_slice() else {
                        panic!("direct call without a single immediate operand");
                    };
                    let target = *imm as Address;

                    let elem = self.refs.get_mut(offset).expect("just inserted");
                    elem.render = Render::Target;
                    elem.target = target;
                    elem.text = format!("{} ", insn.mnemonic);

                    let name = format!("call_{:X}", target);
                    debug!("call {}", name);
                    work.push_back(Job {
                        addr: target,
                        label: Label::new(LabelKind::Call, name),
                        thumb_func: false,
                    });
                }

                InsnKind::Blx => {
                    if let (Some(track), [Operand::Reg(reg)]) =
                        (&ldr_prev, insn.operands.as_slice())
                    {
                        if *reg == track.reg {
                            // Function pointers carry the Thumb tag.
                            let target = (track.data as Address).wrapping_sub(1);
                            let name = format!("call_{:X}", target);
                            debug!("call {}", name);
                            self.retarget_indirect(
                                offset,
                                track,
                                target,
                                Label::new(LabelKind::Call, name),
                                work,
                            );
                        }
                    }
                }

                InsnKind::Tbb => {
                    if let [Operand::Mem { base, .. }] = insn.operands.as_slice() {
                        if *base == self.decoder.pc() {
                            self.expand_byte_table(offset + insn.size as Address, work);
                        }
                    }
                    // The table bytes follow inline; whatever comes after
                    // them is unreachable from this path.
                    return total;
                }

                InsnKind::Ldr => {
                    if let [Operand::Reg(rd), Operand::Mem { base, disp }] =
                        insn.operands.as_slice()
                    {
                        if *base == self.decoder.pc() {
                            self.track_literal_load(offset, *rd, *disp, &mut ldr);
                        }
                    }
                }

                InsnKind::Other => {}
            }

            total += 1;
            offset += insn.size as Address;

            if stop {
                break;
            }
        }

        total
    }

    /// Rewrite a resolved indirect branch/call site and its literal pool
    /// word to render through the target's label, and queue the target with
    /// the Thumb-function marker.
    fn retarget_indirect(
        &mut self,
        offset: Address,
        track: &LdrTrack,
        target: Address,
        label: Label,
        work: &mut VecDeque<Job>,
    ) {
        let elem = self.refs.get_mut(offset).expect("just inserted");
        elem.render = Render::Target;
        elem.target = target;
        elem.text.push_str(" /* ");
        elem.suffix = " */ ".to_string();

        let lit = self.refs.get_mut(track.offset).expect("tracked literal");
        lit.render = Render::Target;
        lit.text = ".word ".to_string();
        lit.target = target;

        work.push_back(Job {
            addr: target,
            label,
            thumb_func: true,
        });
    }

    /// Handle a PC-relative LDR: read the literal word, register the pool
    /// entry, decorate the load site, and remember the load for the next
    /// instruction.
    fn track_literal_load(
        &mut self,
        offset: Address,
        rd: Reg,
        disp: i64,
        ldr: &mut Option<LdrTrack>,
    ) {
        // Thumb reads PC as the instruction address plus 4, word-aligned.
        let pc = (self.image.base() + offset + 4) & !3;
        let laddr = pc.wrapping_add(disp as Address);

        let word = self
            .image
            .offset_of(laddr)
            .and_then(|loff| Ok((loff, self.image.read_u32_le(loff)?)));
        let (loff, word) = match word {
            Ok(read) => read,
            Err(err) => {
                error!("literal pool read failed: {}", err);
                return;
            }
        };

        *ldr = Some(LdrTrack {
            reg: rd,
            offset: loff,
            data: word,
        });

        let elem = self.refs.get_mut(offset).expect("just inserted");
        elem.render = Render::Target;
        elem.target = laddr;
        elem.text.push_str(" /* ");
        elem.suffix = " */ ".to_string();

        debug!("load data_{:X} (0x{:X})", laddr, word);

        // Two loads may share one pool word; keep the first record.
        if !self.refs.contains(loff) {
            self.refs.add(loff, RefElem::data(word, laddr));
        }
    }

    /// Expand the byte table following a PC-relative TBB at file offset
    /// `table`. Walks table bytes for as long as they lie before the
    /// earliest case target seen so far: the first case begins where the
    /// table ends, so reaching it means the whole table has been read.
    fn expand_byte_table(&self, table: Address, work: &mut VecDeque<Job>) {
        let table_addr = self.image.base() + table;
        let mut min = Address::MAX;

        let mut i = 0;
        while table_addr + i < min {
            let byte = match self.image.byte(table + i) {
                Ok(byte) => byte,
                Err(_) => break,
            };
            let case = table_addr + ((byte as Address) << 1);
            // Case targets land after the table; anything else ends the scan.
            if case <= table_addr + i {
                break;
            }
            min = min.min(case);

            let name = format!("switch_{:X}", case);
            debug!("switch {}", name);
            work.push_back(Job {
                addr: case,
                label: Label::new(LabelKind::Switch, name),
                thumb_func: false,
            });
            i += 1;
        }
    }
}
