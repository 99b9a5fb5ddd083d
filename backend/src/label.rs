/// A branch target inside a block under construction.
///
/// Labels support forward references: a jump can name a label
/// before it is placed, and the displacement is back-patched once
/// the label's offset is known.
#[derive(Debug, Clone)]
pub struct Label {
    /// Offset in the code buffer, once placed.
    pub value: Option<usize>,
    /// Forward references that need back-patching.
    pub uses: Vec<LabelUse>,
}

/// Where a jump to a label was emitted.
#[derive(Debug, Clone, Copy)]
pub struct LabelUse {
    /// Offset of the 32-bit displacement field.
    pub offset: usize,
    pub kind: RelocKind,
}

/// Relocation types for label back-patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// x86-64 rel32, relative to the end of the displacement.
    Rel32,
}

/// Handle to a label in a `Labels` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(pub u32);

/// All labels of one block.
#[derive(Debug, Default)]
pub struct Labels {
    labels: Vec<Label>,
}

impl Labels {
    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(Label {
            value: None,
            uses: Vec::new(),
        });
        LabelId(self.labels.len() as u32 - 1)
    }

    pub fn add_use(&mut self, id: LabelId, offset: usize, kind: RelocKind) {
        self.labels[id.0 as usize].uses.push(LabelUse { offset, kind });
    }

    pub fn set_value(&mut self, id: LabelId, offset: usize) {
        self.labels[id.0 as usize].value = Some(offset);
    }

    pub fn value(&self, id: LabelId) -> Option<usize> {
        self.labels[id.0 as usize].value
    }

    pub fn iter(&self) -> impl Iterator<Item = (LabelId, &Label)> {
        self.labels
            .iter()
            .enumerate()
            .map(|(i, l)| (LabelId(i as u32), l))
    }
}
