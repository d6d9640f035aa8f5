use uuid::Uuid;

use crate::status::IntWidth;

/// A node in a service record's attribute tree. Sequences and alternatives contain ordered
///  children, everything else is a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    Sequence(Vec<DataElement>),
    Alternative(Vec<DataElement>),
    Uuid(Uuid),
    UnsignedInt {
        width: IntWidth,
        value: u64,
    },
    Text(String),
    Bool(bool),
}
impl DataElement {
    pub fn u8(value: u8) -> DataElement {
        DataElement::UnsignedInt { width: IntWidth::U8, value: value.into() }
    }

    pub fn u16(value: u16) -> DataElement {
        DataElement::UnsignedInt { width: IntWidth::U16, value: value.into() }
    }

    /// children for sequence and alternative nodes, `None` for leaves
    pub fn children(&self) -> Option<&[DataElement]> {
        match self {
            DataElement::Sequence(children) | DataElement::Alternative(children) => Some(children),
            _ => None,
        }
    }
}
