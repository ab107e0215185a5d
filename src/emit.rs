//! Rendering the reference database back into GNU-as Thumb source.

use log::error;

use crate::{Address, Image, ModelError, RefDb, RefElem, RefFlags, RefKind, Render};

/// Fixed listing prologue.
const PROLOGUE: &str = ".syntax unified\n.cpu cortex-m3\n.text\n.thumb\n\n";

/// Render `refs` over `image` as assembler source.
///
/// A deterministic linear sweep: every covered offset emits its record
/// (label line first, instruction text indented four spaces), every
/// uncovered byte emits a `.byte` directive, and adjacent regions of
/// different kinds are separated by a blank line. Fails with
/// [`ModelError::MissingTargetLabel`] when a target-style record points at
/// an address that has no labelled record — the listing would not
/// reassemble.
pub fn render(image: &Image, refs: &RefDb) -> Result<String, ModelError> {
    let mut out = String::from(PROLOGUE);
    let mut prev = RefKind::Data;

    let mut i: Address = 0;
    while i < image.len() {
        match refs.get(i) {
            Some(elem) => {
                if prev != elem.kind {
                    out.push('\n');
                }
                if elem.flags.contains(RefFlags::THUMB_FUNC) {
                    out.push_str(".thumb_func\n");
                }
                if !elem.label.is_empty() {
                    out.push_str(&elem.label);
                    out.push_str(":\n");
                }

                let text = match elem.render {
                    Render::Literal => elem.text.clone(),
                    Render::Target => target_text(image, refs, i, elem)?,
                };
                out.push_str("    ");
                out.push_str(&text);
                out.push('\n');

                prev = elem.kind;
                i += elem.size;
            }
            None => {
                if prev == RefKind::Code || prev == RefKind::Data {
                    out.push('\n');
                }
                out.push_str(&format!(".byte 0x{:02X}\n", image.byte(i)?));

                prev = RefKind::Raw;
                i += 1;
            }
        }
    }

    // close a listing that ends inside a covered region
    if !image.is_empty() && prev != RefKind::Raw {
        out.push('\n');
    }
    Ok(out)
}

/// Resolve a target-style record against the label at its destination.
fn target_text(
    image: &Image,
    refs: &RefDb,
    offset: Address,
    elem: &RefElem,
) -> Result<String, ModelError> {
    let target = elem
        .target
        .checked_sub(image.base())
        .and_then(|toff| refs.get(toff));
    match target {
        Some(target) if !target.label.is_empty() => {
            Ok(format!("{}{}{}", elem.text, target.label, elem.suffix))
        }
        _ => {
            error!(
                "missing target label 0x{:X} -> 0x{:X}",
                image.base() + offset,
                elem.target
            );
            Err(ModelError::MissingTargetLabel {
                addr: image.base() + offset,
                target: elem.target,
            })
        }
    }
}
