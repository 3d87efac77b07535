//! Property-based tests for the rendering pipeline.
//!
//! These tests use proptest to generate random inputs and check properties that must always hold.

use pdf_x_display::core::chunked_stream::ChunkedStream;
use pdf_x_display::core::network_utils::validate_range_request_capabilities;
use pdf_x_display::core::operator_list::{OpArgs, OpCode, OperatorListChunk, numbers};
use pdf_x_display::core::*;
use pdf_x_display::rendering::smask::{compose_alpha, compose_luminosity};
use proptest::prelude::*;

// ============================================================================
// Operator List Properties
// ============================================================================

fn chunk(ops: usize, last_chunk: bool, sent_before: usize) -> OperatorListChunk {
    OperatorListChunk {
        fn_array: vec![OpCode::Save.id(); ops],
        args_array: vec![OpArgs::new(); ops],
        last_chunk,
        length: sent_before + ops,
    }
}

/// Property: appending chunks only ever grows the list, and the final length
/// is the sum of the chunk sizes
proptest! {
    #[test]
    fn prop_operator_list_grows_monotonically(sizes in prop::collection::vec(0usize..40, 1..12)) {
        let mut list = OperatorList::new();
        let mut sent = 0;
        for (i, size) in sizes.iter().enumerate() {
            let before = list.len();
            let last = i + 1 == sizes.len();
            list.append_chunk(chunk(*size, last, sent));
            sent += size;
            prop_assert!(list.len() >= before);
            prop_assert_eq!(list.len(), sent);
            prop_assert_eq!(list.fn_array.len(), list.args_array.len());
            prop_assert_eq!(list.last_chunk, last);
        }
    }
}

/// Property: opcodes survive their wire id
proptest! {
    #[test]
    fn prop_opcode_ids_are_stable(id in 0u8..=255) {
        if let Some(op) = OpCode::from_id(id) {
            prop_assert_eq!(op.id(), id);
        }
    }
}

/// Property: a settled list is copied intact by value
proptest! {
    #[test]
    fn prop_operator_list_clone_is_independent(values in prop::collection::vec(-1000.0f64..1000.0, 1..8)) {
        let mut list = OperatorList::new();
        list.add_op(OpCode::Transform, numbers(&values));
        let copy = list.clone();
        list.add_op(OpCode::Restore, OpArgs::new());
        prop_assert_eq!(copy.len(), 1);
        let copied: Vec<f64> = copy.args_array[0].iter().filter_map(|arg| arg.as_f64()).collect();
        prop_assert_eq!(copied, values);
    }
}

// ============================================================================
// Soft Mask Properties
// ============================================================================

/// Property: a gray luminosity mask over an opaque layer yields the gray
/// level as alpha
proptest! {
    #[test]
    fn prop_luminosity_of_gray_is_identity(gray in 0u8..=255) {
        let mask = [gray, gray, gray, 255];
        let mut layer = [10, 20, 30, 255];
        compose_luminosity(&mask, &mut layer, None);
        prop_assert_eq!(layer[3], gray);
        prop_assert_eq!(&layer[..3], &[10, 20, 30]);
    }
}

/// Property: masking never raises a layer's alpha
proptest! {
    #[test]
    fn prop_masks_never_add_coverage(
        mask in prop::array::uniform4(0u8..=255),
        layer in prop::array::uniform4(0u8..=255),
    ) {
        let mut luminosity = layer;
        compose_luminosity(&mask, &mut luminosity, None);
        prop_assert!(luminosity[3] <= layer[3]);

        let mut alpha = layer;
        compose_alpha(&mask, &mut alpha, None);
        prop_assert!(alpha[3] <= layer[3]);
    }
}

// ============================================================================
// Byte Source Properties
// ============================================================================

/// Property: ranges are only allowed over HTTP for documents larger than
/// two chunks that advertise byte ranges without content encoding
proptest! {
    #[test]
    fn prop_range_negotiation(
        length in 0u64..400_000,
        chunk_size in 1usize..100_000,
        is_http in any::<bool>(),
        disable_range in any::<bool>(),
        accept_bytes in any::<bool>(),
        gzip in any::<bool>(),
    ) {
        let headers = move |name: &str| match name {
            "Content-Length" => Some(length.to_string()),
            "Accept-Ranges" => Some(if accept_bytes { "bytes" } else { "none" }.to_string()),
            "Content-Encoding" if gzip => Some("gzip".to_string()),
            _ => None,
        };
        let capabilities =
            validate_range_request_capabilities(headers, is_http, chunk_size, disable_range);

        let expected = length > 2 * chunk_size as u64 && is_http && !disable_range && accept_bytes && !gzip;
        prop_assert_eq!(capabilities.allow_range_requests, expected);
        prop_assert_eq!(capabilities.suggested_length, Some(length));
    }
}

/// Property: filling every missing range assembles the source bytes
proptest! {
    #[test]
    fn prop_missing_ranges_assemble_document(
        length in 1usize..5_000,
        chunk_size in 1usize..700,
        prefix in 0usize..5_000,
        max_chunks in 1usize..6,
    ) {
        let data: Vec<u8> = (0..length).map(|i| (i % 253) as u8).collect();
        let mut stream = ChunkedStream::new(length, chunk_size);
        let prefix = prefix.min(length);
        stream.on_receive_progressive_data(&data[..prefix]).unwrap();

        let ranges = stream.missing_ranges(max_chunks);
        for &(begin, end) in &ranges {
            prop_assert!(begin < end && end <= length);
            prop_assert_eq!(begin % chunk_size, 0);
            prop_assert!(end - begin <= max_chunks * chunk_size);
        }
        for (begin, end) in ranges {
            stream.on_receive_data(begin, &data[begin..end]).unwrap();
        }
        prop_assert!(stream.is_data_loaded());
        prop_assert_eq!(&stream.into_bytes().unwrap()[..], &data[..]);
    }
}

// ============================================================================
// Capability Properties
// ============================================================================

/// Property: only the first settle wins, whatever follows
proptest! {
    #[test]
    fn prop_capability_settles_once(attempts in prop::collection::vec(any::<Option<u32>>(), 1..10)) {
        let capability = Capability::<u32>::new();
        for (i, attempt) in attempts.iter().enumerate() {
            let accepted = match attempt {
                Some(value) => capability.resolve(*value),
                None => capability.reject(PDFError::abort("rejected")),
            };
            prop_assert_eq!(accepted, i == 0);
        }
        match (attempts[0], capability.try_get().unwrap()) {
            (Some(expected), Ok(value)) => prop_assert_eq!(value, expected),
            (None, Err(error)) => prop_assert_eq!(error.message(), "rejected"),
            (first, outcome) => prop_assert!(false, "{first:?} settled as {outcome:?}"),
        }
    }
}
