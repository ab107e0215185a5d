//! Core image model for recursive-descent disassembly of ARM Thumb firmware.
//!
//! This library takes a raw binary blob plus a load base address, follows
//! control flow from one or more entry points, and records what every reached
//! byte of the image *means* — a decoded instruction, a literal pool word, or
//! a raw byte — in an offset-keyed reference database. The database can then
//! be rendered back into a GNU-assembler-compatible Thumb listing that
//! reassembles to equivalent machine code.
//!
//! Instruction decoding itself is external: the model drives any
//! [`Decoder`](decoder::Decoder) implementation, with
//! [`ThumbDecoder`](decoder::ThumbDecoder) wrapping Capstone for real images.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use rethumb::ImageModel;
//!
//! // Open a Capstone-backed model and install the firmware image.
//! let mut model = ImageModel::thumb().unwrap();
//! let blob = std::fs::read("firmware.bin").unwrap();
//! model.load_image(blob, 0x0800_0000);
//!
//! // Seed analysis; entries may be added repeatedly.
//! model.add_entry(0x0800_0000, Some("reset_handler"));
//!
//! // Render the reference database as assembler source.
//! let listing = model.make_code().unwrap();
//! print!("{}", listing);
//! ```

pub mod decoder;
pub mod emit;
pub mod image;
pub mod model;
pub mod refdb;

pub use decoder::{Cond, DecodeError, Decoder, Insn, InsnKind, Operand, Reg, ThumbDecoder};
pub use image::Image;
pub use model::ImageModel;
pub use refdb::RefDb;

/// An address or file offset within an image.
pub type Address = u64;

/// Label kinds in priority order: a lower ordinal wins over a higher one.
///
/// When an address is rediscovered, its label is replaced only by a label of
/// equal or higher priority; ties overwrite so the newest name wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LabelKind {
    /// Explicitly named by the caller (entry points).
    Named,
    /// Discovered as the target of a direct or indirect call.
    Call,
    /// Discovered as the target of a branch.
    Jump,
    /// Discovered as a jump-table case.
    Switch,
    /// No label.
    None,
}

/// A label proposal carried alongside a disassembly request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub kind: LabelKind,
    pub name: String,
}

impl Label {
    pub fn new(kind: LabelKind, name: impl Into<String>) -> Self {
        Label {
            kind,
            name: name.into(),
        }
    }

    /// A caller-supplied entry-point label.
    pub fn named(name: impl Into<String>) -> Self {
        Label::new(LabelKind::Named, name)
    }
}

/// What a region of the image holds.
///
/// `Raw` never appears in the reference database; the emitter uses it to
/// track uncovered gaps between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// A decoded instruction.
    Code,
    /// A literal pool word (always 4 bytes).
    Data,
    /// Bytes not covered by any record.
    Raw,
}

/// How a reference is rendered by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    /// Emit the stored text verbatim.
    Literal,
    /// Emit `text`, then the label found at `target`, then `suffix`.
    Target,
}

bitflags::bitflags! {
    /// Marker flags attached to a reference.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefFlags: u32 {
        /// Emit a `.thumb_func` directive ahead of this record's label.
        const THUMB_FUNC = 1;
    }
}

/// One record of the reference database: the meaning of the bytes at
/// `[offset, offset + size)` and how to render them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefElem {
    pub kind: RefKind,
    pub size: Address,
    pub ltype: LabelKind,
    pub label: String,
    pub render: Render,
    pub text: String,
    pub suffix: String,
    pub target: Address,
    pub flags: RefFlags,
}

impl RefElem {
    /// A freshly decoded, unlabelled instruction.
    pub fn code(size: u8, text: String) -> Self {
        RefElem {
            kind: RefKind::Code,
            size: size as Address,
            ltype: LabelKind::None,
            label: String::new(),
            render: Render::Literal,
            text,
            suffix: String::new(),
            target: 0,
            flags: RefFlags::empty(),
        }
    }

    /// A literal pool word at absolute address `addr`.
    pub fn data(word: u32, addr: Address) -> Self {
        RefElem {
            kind: RefKind::Data,
            size: 4,
            ltype: LabelKind::None,
            label: format!("data_{:X}", addr),
            render: Render::Literal,
            text: format!(".word 0x{:X}", word),
            suffix: String::new(),
            target: 0,
            flags: RefFlags::empty(),
        }
    }
}

/// Error type for image-model operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// An address or read fell outside the loaded image.
    #[error("address 0x{0:X} is outside the loaded image")]
    OutOfRange(Address),

    /// A target reference pointed at an address with no usable label.
    #[error("no label at target 0x{target:X}, referenced from 0x{addr:X}")]
    MissingTargetLabel { addr: Address, target: Address },
}
