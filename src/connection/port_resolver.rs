use uuid::Uuid;

use crate::radio::data_element::DataElement;
use crate::status::IntWidth;


/// Find the port bound to `protocol` in a protocol descriptor list.
///
/// The tree is walked depth first, left to right. A nested sequence or alternative that yields a
///  port wins immediately. Otherwise a node yields a port only if among its *direct* children
///  there is both a leaf with the protocol's identifier and an unsigned integer leaf of
///  `port_width`. A leaf at the root yields nothing.
///
/// For an RFCOMM descriptor list this looks like
/// ```ascii
/// Sequence[
///   Sequence[Uuid(L2CAP)],
///   Sequence[Uuid(RFCOMM), U8(channel)],
/// ]
/// ```
pub fn resolve_port(root: &DataElement, protocol: Uuid, port_width: IntWidth) -> Option<u16> {
    let children = root.children()?;

    let mut protocol_found = false;
    let mut port = None;

    for child in children {
        match child {
            DataElement::Sequence(_) | DataElement::Alternative(_) => {
                if let Some(p) = resolve_port(child, protocol, port_width) {
                    return Some(p);
                }
            }
            DataElement::Uuid(uuid) => {
                if *uuid == protocol {
                    protocol_found = true;
                }
            }
            DataElement::UnsignedInt { width, value } => {
                if *width == port_width && port.is_none() {
                    port = valid_port(*value);
                }
            }
            DataElement::Text(_) | DataElement::Bool(_) => {}
        }
    }

    if protocol_found {
        port
    }
    else {
        None
    }
}

fn valid_port(value: u64) -> Option<u16> {
    match u16::try_from(value) {
        Ok(0) | Err(_) => None,
        Ok(p) => Some(p),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{bluetooth_uuid, L2CAP_PROTOCOL, RFCOMM_PROTOCOL};
    use rstest::rstest;
    use DataElement::{Alternative, Sequence, Text};

    fn rfcomm() -> DataElement {
        DataElement::Uuid(bluetooth_uuid(RFCOMM_PROTOCOL))
    }
    fn l2cap() -> DataElement {
        DataElement::Uuid(bluetooth_uuid(L2CAP_PROTOCOL))
    }

    #[rstest]
    #[case::flat_match(Sequence(vec![rfcomm(), DataElement::u8(5)]), Some(5))]
    #[case::regular_descriptor_list(Sequence(vec![Sequence(vec![l2cap()]), Sequence(vec![rfcomm(), DataElement::u8(12)])]), Some(12))]
    #[case::alternative(Alternative(vec![Sequence(vec![Text("x".into())]), Sequence(vec![rfcomm(), DataElement::u8(3)])]), Some(3))]
    #[case::port_before_uuid(Sequence(vec![DataElement::u8(7), rfcomm()]), Some(7))]
    #[case::uuid_without_port(Sequence(vec![rfcomm()]), None)]
    #[case::wrong_width(Sequence(vec![rfcomm(), DataElement::u16(5)]), None)]
    #[case::port_for_other_protocol(Sequence(vec![l2cap(), DataElement::u8(5)]), None)]
    #[case::uuid_and_port_in_different_nodes(Sequence(vec![Sequence(vec![rfcomm()]), Sequence(vec![DataElement::u8(5)])]), None)]
    #[case::zero_port(Sequence(vec![rfcomm(), DataElement::u8(0)]), None)]
    #[case::leaf_root(rfcomm(), None)]
    #[case::empty(Sequence(vec![]), None)]
    fn test_resolve_stream_port(#[case] root: DataElement, #[case] expected: Option<u16>) {
        assert_eq!(resolve_port(&root, bluetooth_uuid(RFCOMM_PROTOCOL), IntWidth::U8), expected);
    }

    #[rstest]
    #[case::psm(Sequence(vec![Sequence(vec![l2cap(), DataElement::u16(0x1001)])]), Some(0x1001))]
    #[case::one_byte_psm_ignored(Sequence(vec![Sequence(vec![l2cap(), DataElement::u8(0x25)])]), None)]
    fn test_resolve_packet_port(#[case] root: DataElement, #[case] expected: Option<u16>) {
        assert_eq!(resolve_port(&root, bluetooth_uuid(L2CAP_PROTOCOL), IntWidth::U16), expected);
    }

    #[test]
    fn test_nested_match_wins_over_parent() {
        let root = Sequence(vec![
            rfcomm(),
            DataElement::u8(1),
            Sequence(vec![rfcomm(), DataElement::u8(2)]),
        ]);
        assert_eq!(resolve_port(&root, bluetooth_uuid(RFCOMM_PROTOCOL), IntWidth::U8), Some(2));
    }
}
