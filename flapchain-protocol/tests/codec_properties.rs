//! Property-based tests for the wire codecs

use flapchain_protocol::cobs;
use flapchain_protocol::{
    checksum, checksum_valid, decode_frame, encode_frame, Action, ActionHeader, DecodedFrame,
    FrameAccumulator, HeaderError, PropertyId, PAYLOAD_SIZE_MAX, PROPERTY_SIZE_MAX,
};
use proptest::prelude::*;

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Read),
        Just(Action::Write),
        Just(Action::Broadcast),
    ]
}

proptest! {
    /// Stuffed blocks never contain a zero before the terminator
    #[test]
    fn cobs_roundtrip(data in prop::collection::vec(any::<u8>(), 0..=PROPERTY_SIZE_MAX)) {
        let mut encoded = [0u8; PAYLOAD_SIZE_MAX];
        let len = cobs::encode(&mut encoded, &data).unwrap();
        prop_assert!(len <= cobs::max_encoded_len(data.len()));
        prop_assert_eq!(encoded[len - 1], 0);
        prop_assert!(encoded[..len - 1].iter().all(|&b| b != 0));

        let mut decoded = [0u8; PAYLOAD_SIZE_MAX];
        let n = cobs::decode(&mut decoded, &encoded[..len]).unwrap();
        prop_assert_eq!(&decoded[..n], &data[..]);
    }

    /// Data plus its checksum always sums to the sentinel
    #[test]
    fn checksum_sentinel(data in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut body = data.clone();
        body.push(checksum(&data));
        prop_assert!(checksum_valid(&body));
    }

    /// Frames survive byte-wise accumulation unchanged
    #[test]
    fn frame_through_accumulator(data in prop::collection::vec(any::<u8>(), 1..=PROPERTY_SIZE_MAX)) {
        let frame = encode_frame(&data).unwrap();
        let mut acc = FrameAccumulator::new();
        let mut done = false;
        for &b in frame.iter() {
            done = acc.feed(b).unwrap();
        }
        prop_assert!(done);
        match acc.decode().unwrap() {
            DecodedFrame::Data(value) => prop_assert_eq!(&value[..], &data[..]),
            other => prop_assert!(false, "unexpected frame {:?}", other),
        }
    }

    /// A single flipped bit anywhere in the body is caught
    #[test]
    fn frame_bit_flip_detected(
        data in prop::collection::vec(1u8..0x80, 1..32),
        index in any::<prop::sample::Index>(),
    ) {
        let frame = encode_frame(&data).unwrap();
        let mut corrupted = frame.clone();
        // leave the leading code byte and the terminator alone
        let i = 1 + index.index(corrupted.len() - 2);
        corrupted[i] ^= 0x01;
        prop_assert!(decode_frame(&corrupted) != decode_frame(&frame));
    }

    /// Headers round-trip and any single flipped bit fails parity
    #[test]
    fn header_roundtrip(
        action in action_strategy(),
        flag in any::<bool>(),
        property in 0u8..=0x7F,
        count in 0u16..=0x1FFF,
        bit in 0usize..24,
    ) {
        let header = ActionHeader::new(action, flag, PropertyId(property), count).unwrap();
        let bytes = header.pack();
        prop_assert_eq!(ActionHeader::unpack(bytes), Ok(header));

        let mut flipped = bytes;
        flipped[bit / 8] ^= 0x80 >> (bit % 8);
        match ActionHeader::unpack(flipped) {
            Err(HeaderError::Parity) | Err(HeaderError::UnexpectedAction) => {}
            other => prop_assert!(false, "flip went unnoticed: {:?}", other),
        }
    }
}
