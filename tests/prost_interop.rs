//! Cross-checks against prost: encode with a reference protobuf
//! implementation, decode with ours, compare field by field.

use fastwire::{decode, decode_with_options, Arena, DecodeOptions, FieldKind, LayoutBuilder};
use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
struct Inner {
    #[prost(uint32, tag = "1")]
    id: u32,
    #[prost(string, tag = "2")]
    name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct Outer {
    #[prost(int32, tag = "1")]
    count: i32,
    #[prost(string, tag = "2")]
    label: String,
    #[prost(uint64, repeated, tag = "3")]
    values: Vec<u64>,
    #[prost(message, optional, tag = "4")]
    inner: Option<Inner>,
    #[prost(sint32, tag = "5")]
    delta: i32,
    #[prost(double, tag = "6")]
    ratio: f64,
    #[prost(bool, tag = "7")]
    flag: bool,
    #[prost(fixed64, tag = "8")]
    stamp: u64,
}

fn layouts() -> (
    std::sync::Arc<fastwire::MessageLayout>,
    std::sync::Arc<fastwire::MessageLayout>,
) {
    let inner = LayoutBuilder::new()
        .scalar(1, FieldKind::UInt32)
        .scalar(2, FieldKind::String)
        .finish();
    let outer = LayoutBuilder::new()
        .scalar(1, FieldKind::Int32)
        .scalar(2, FieldKind::String)
        .packed(3, FieldKind::UInt64)
        .message(4, inner.clone())
        .scalar(5, FieldKind::SInt32)
        .scalar(6, FieldKind::Double)
        .scalar(7, FieldKind::Bool)
        .scalar(8, FieldKind::Fixed64)
        .finish();
    (outer, inner)
}

fn sample() -> Outer {
    Outer {
        count: -123,
        label: "interop".to_string(),
        values: vec![1, 300, u64::MAX, 0],
        inner: Some(Inner { id: 77, name: "nested".to_string() }),
        delta: -40,
        ratio: 2.5,
        flag: true,
        stamp: 0xFEED_FACE_CAFE_BEEF,
    }
}

#[test]
fn prost_encoded_message_round_trips() {
    let (outer, inner) = layouts();
    let encoded = sample().encode_to_vec();
    let arena = Arena::new();
    let msg = decode(&encoded, &outer, &arena).unwrap();

    assert_eq!(msg.scalar::<i32>(&outer, 1), -123);
    assert_eq!(msg.bytes(&outer, 2), b"interop");
    assert_eq!(msg.repeated::<u64>(&outer, 3), &[1, 300, u64::MAX, 0]);
    let sub = msg.message(&outer, 4).unwrap();
    assert_eq!(sub.scalar::<u32>(&inner, 1), 77);
    assert_eq!(sub.bytes(&inner, 2), b"nested");
    assert_eq!(msg.scalar::<i32>(&outer, 5), -40);
    assert_eq!(msg.scalar::<f64>(&outer, 6), 2.5);
    assert!(msg.scalar::<bool>(&outer, 7));
    assert_eq!(msg.scalar::<u64>(&outer, 8), 0xFEED_FACE_CAFE_BEEF);
}

#[test]
fn prost_encoded_message_round_trips_with_aliasing() {
    let (outer, _) = layouts();
    let encoded = sample().encode_to_vec();
    let arena = Arena::new();
    let opts = DecodeOptions { alias_strings: true, depth_limit: 100 };
    let msg = decode_with_options(&encoded, &outer, &arena, opts).unwrap();
    assert_eq!(msg.bytes(&outer, 2), b"interop");
    let addr = msg.str_view(&outer, 2).as_ptr() as usize;
    let range = encoded.as_ptr() as usize..encoded.as_ptr() as usize + encoded.len();
    assert!(range.contains(&addr));
}

#[test]
fn unknown_fields_from_a_newer_schema_are_tolerated() {
    // Decode with a layout that only knows half the fields.
    let old = LayoutBuilder::new()
        .scalar(1, FieldKind::Int32)
        .scalar(5, FieldKind::SInt32)
        .finish();
    let encoded = sample().encode_to_vec();
    let arena = Arena::new();
    let msg = decode(&encoded, &old, &arena).unwrap();
    assert_eq!(msg.scalar::<i32>(&old, 1), -123);
    assert_eq!(msg.scalar::<i32>(&old, 5), -40);
}
