use bytes::Bytes;
use sidb_transaction::Timestamp;

/// What a stored cell means to the SI layer, derived from its family and qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// A user column.
    UserData,
    /// Per-writer commit-timestamp marker.
    CommitTimestamp,
    /// Row deletion written by the writer transaction.
    Tombstone,
    /// Written by an insert that follows a delete; does not delete anything.
    AntiTombstone,
    /// An SI-family cell this layer does not know how to read.
    Other,
}

/// One physical version of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cell {
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    timestamp: Timestamp,
    value: Bytes,
}

impl Cell {
    pub fn new(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        timestamp: Timestamp,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            value: value.into(),
        }
    }

    pub fn row(&self) -> &Bytes {
        &self.row
    }

    pub fn family(&self) -> &Bytes {
        &self.family
    }

    pub fn qualifier(&self) -> &Bytes {
        &self.qualifier
    }

    /// The writer timestamp, i.e. the id of the transaction that wrote this version.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Same coordinates, new value.
    pub fn with_value(&self, value: impl Into<Bytes>) -> Self {
        Self {
            row: self.row.clone(),
            family: self.family.clone(),
            qualifier: self.qualifier.clone(),
            timestamp: self.timestamp,
            value: value.into(),
        }
    }
}
