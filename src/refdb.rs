//! The reference database: an offset-ordered map of classified image regions.

use std::collections::BTreeMap;

use crate::{Address, RefElem};

/// Offset-keyed store of [`RefElem`] records.
///
/// Keys are file offsets and records never overlap: for any stored
/// `(offset, elem)`, the interval `[offset, offset + elem.size)` contains no
/// other key. Records are never removed once installed; the follower only
/// upgrades their label fields in place. Iteration is ordered by offset,
/// which is what the emitter's linear sweep relies on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefDb {
    refs: BTreeMap<Address, RefElem>,
}

impl RefDb {
    pub fn new() -> Self {
        RefDb::default()
    }

    pub fn contains(&self, offset: Address) -> bool {
        self.refs.contains_key(&offset)
    }

    /// Install a record. Inserting over an existing offset is a programming
    /// error in the follower.
    pub fn add(&mut self, offset: Address, elem: RefElem) {
        let prev = self.refs.insert(offset, elem);
        debug_assert!(prev.is_none(), "duplicate ref at offset 0x{:X}", offset);
    }

    pub fn get(&self, offset: Address) -> Option<&RefElem> {
        self.refs.get(&offset)
    }

    pub fn get_mut(&mut self, offset: Address) -> Option<&mut RefElem> {
        self.refs.get_mut(&offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &RefElem)> {
        self.refs.iter().map(|(&offset, elem)| (offset, elem))
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefElem;

    #[test]
    fn records_are_found_by_offset() {
        let mut db = RefDb::new();
        assert!(!db.contains(0));
        db.add(0, RefElem::code(2, "nop ".to_string()));
        db.add(2, RefElem::code(2, "nop ".to_string()));
        assert!(db.contains(0));
        assert!(db.contains(2));
        assert!(!db.contains(1));
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn iteration_is_ordered_by_offset() {
        let mut db = RefDb::new();
        db.add(6, RefElem::code(2, "c".to_string()));
        db.add(0, RefElem::code(2, "a".to_string()));
        db.add(2, RefElem::code(4, "b".to_string()));
        let offsets: Vec<Address> = db.iter().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 2, 6]);
    }

    #[test]
    fn labels_can_be_upgraded_in_place() {
        let mut db = RefDb::new();
        db.add(0, RefElem::code(2, "b ".to_string()));
        let elem = db.get_mut(0).unwrap();
        elem.label = "main".to_string();
        assert_eq!(db.get(0).unwrap().label, "main");
    }
}
