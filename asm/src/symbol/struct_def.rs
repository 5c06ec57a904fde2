use std::collections::HashMap;

use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I8,
    I16,
    I32,
    /// A nested struct, named by index into the owning `.struct` table's
    /// parent registry rather than by a raw pointer, so struct defs stay
    /// cheap to clone.
    Struct(usize),
}

impl FieldKind {
    const fn size(self, structs: &[StructDef]) -> u32 {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::Struct(idx) => structs[idx].size,
        }
    }

    const fn align(self, structs: &[StructDef]) -> u32 {
        self.size(structs)
    }
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub kind: FieldKind,
    pub offset: u32,
}

/// A `.struct` layout: every member is placed at an offset aligned to its
/// own width, and the whole struct's size is rounded up to the widest
/// member's alignment, mirroring the padding rules the byte emitter already
/// applies to plain `.i16`/`.i32` directives.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<StructField>,
    pub size: u32,
    pub align: u32,
}

pub struct StructRegistry {
    defs: Vec<StructDef>,
    by_name: HashMap<String, usize>,
}

impl StructRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { defs: Vec::new(), by_name: HashMap::new() }
    }

    pub fn define(
        &mut self,
        name: String,
        raw_fields: Vec<(String, FieldKind)>,
        pos: &FilePos,
    ) -> AsmResult<usize> {
        if self.by_name.contains_key(&name) {
            return Err(AsmError::DuplicateConstant { pos: pos.clone(), name });
        }
        let mut offset = 0u32;
        let mut align = 1u32;
        let mut fields = Vec::with_capacity(raw_fields.len());
        for (fname, kind) in raw_fields {
            let field_align = kind.align(&self.defs);
            offset = align_up(offset, field_align);
            fields.push(StructField { name: fname, kind, offset });
            offset += kind.size(&self.defs);
            align = align.max(field_align);
        }
        let size = align_up(offset, align);
        let idx = self.defs.len();
        self.defs.push(StructDef { name: name.clone(), fields, size, align });
        self.by_name.insert(name, idx);
        Ok(idx)
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> &StructDef {
        &self.defs[idx]
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn member_offset(&self, idx: usize, member: &str) -> Option<u32> {
        self.defs[idx].fields.iter().find(|f| f.name == member).map(|f| f.offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructDef> {
        self.defs.iter()
    }
}

impl Default for StructRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos() -> FilePos {
        FilePos::new(std::rc::Rc::from("t"), 1, 1)
    }

    #[test]
    fn fields_are_aligned_and_padded() {
        let mut reg = StructRegistry::new();
        let idx = reg
            .define(
                "Sprite".into(),
                vec![
                    ("flag".into(), FieldKind::I8),
                    ("x".into(), FieldKind::I16),
                    ("tile".into(), FieldKind::I32),
                ],
                &pos(),
            )
            .unwrap();
        let def = reg.get(idx);
        assert_eq!(def.fields[0].offset, 0);
        assert_eq!(def.fields[1].offset, 2);
        assert_eq!(def.fields[2].offset, 4);
        assert_eq!(def.size, 8);
    }

    #[test]
    fn nested_struct_inherits_widest_alignment() {
        let mut reg = StructRegistry::new();
        let inner = reg
            .define("Vec2".into(), vec![("x".into(), FieldKind::I16), ("y".into(), FieldKind::I16)], &pos())
            .unwrap();
        let outer = reg
            .define(
                "Entity".into(),
                vec![("tag".into(), FieldKind::I8), ("pos".into(), FieldKind::Struct(inner))],
                &pos(),
            )
            .unwrap();
        let def = reg.get(outer);
        assert_eq!(def.fields[1].offset, 2);
        assert_eq!(def.size, 6);
    }
}
