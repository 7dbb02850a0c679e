//------------------------------------------

/// Classification of one block range as reported by `delta-tool`/`dump-tool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    LeftOnly,
    RightOnly,
    Different,
    Same,
}

impl DeltaKind {
    pub fn from_tag(tag: &str) -> Option<DeltaKind> {
        match tag {
            "left_only" => Some(DeltaKind::LeftOnly),
            "right_only" => Some(DeltaKind::RightOnly),
            "different" => Some(DeltaKind::Different),
            "same" => Some(DeltaKind::Same),
            _ => None,
        }
    }
}

/// One entry of the delta stream: a non-overlapping, ascending-order range of
/// blocks and how it differs between the two snapshots being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRecord {
    pub kind: DeltaKind,
    pub begin: u64,
    pub length: u64,
}

impl DeltaRecord {
    pub fn new(kind: DeltaKind, begin: u64, length: u64) -> Self {
        DeltaRecord {
            kind,
            begin,
            length,
        }
    }

    pub fn end(&self) -> u64 {
        self.begin + self.length
    }
}

//------------------------------------------
