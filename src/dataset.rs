//! Small accessors over in-memory DICOM data sets.

use dicom::{
    core::{DataElement, PrimitiveValue, Tag, VR, value::DataSetSequence},
    object::InMemDicomObject,
};

/// Text value with DICOM padding removed. Empty values read as `None`.
pub(crate) fn read_string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = object.get(tag)?.to_str().ok()?;
    let value = value.trim_end_matches(['\0', ' ']).trim_start();
    (!value.is_empty()).then(|| value.to_string())
}

pub(crate) fn read_i32(object: &InMemDicomObject, tag: Tag) -> Option<i32> {
    object.get(tag)?.to_int::<i32>().ok()
}

pub(crate) fn read_u32(object: &InMemDicomObject, tag: Tag) -> Option<u32> {
    object.get(tag)?.to_int::<u32>().ok()
}

pub(crate) fn read_u16s(object: &InMemDicomObject, tag: Tag) -> Option<Vec<u16>> {
    object.get(tag)?.to_multi_int::<u16>().ok()
}

pub(crate) fn read_items(object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    object
        .get(tag)
        .and_then(|element| element.items())
        .unwrap_or(&[])
}

pub(crate) fn first_item(object: &InMemDicomObject, tag: Tag) -> Option<&InMemDicomObject> {
    read_items(object, tag).first()
}

pub(crate) fn put_string(
    object: &mut InMemDicomObject,
    tag: Tag,
    vr: VR,
    value: impl Into<String>,
) {
    object.put(DataElement::new(tag, vr, PrimitiveValue::from(value.into())));
}

pub(crate) fn put_u16(object: &mut InMemDicomObject, tag: Tag, value: u16) {
    object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

pub(crate) fn put_u16s(object: &mut InMemDicomObject, tag: Tag, values: &[u16]) {
    object.put(DataElement::new(
        tag,
        VR::US,
        PrimitiveValue::U16(values.iter().copied().collect()),
    ));
}

pub(crate) fn put_u32s(object: &mut InMemDicomObject, tag: Tag, values: &[u32]) {
    object.put(DataElement::new(
        tag,
        VR::UL,
        PrimitiveValue::U32(values.iter().copied().collect()),
    ));
}

pub(crate) fn put_bytes(object: &mut InMemDicomObject, tag: Tag, vr: VR, bytes: Vec<u8>) {
    object.put(DataElement::new(tag, vr, PrimitiveValue::from(bytes)));
}

pub(crate) fn put_sequence(object: &mut InMemDicomObject, tag: Tag, items: Vec<InMemDicomObject>) {
    object.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
}
