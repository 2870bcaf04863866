use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;
use proptest::test_runner::TestRunner;

use vsm::buf::IoBuffer;
use vsm::sync::Mutex;
use vsm_mavlink::{MavlinkDecoder, MavlinkEncoder, msgid};

fn decode_all(frames: &[IoBuffer]) -> Vec<(Vec<u8>, u32, u8, u8)> {
  let mut decoder = MavlinkDecoder::new();
  let sink = Arc::new(Mutex::new(Vec::new()));
  let sink2 = Arc::clone(&sink);
  decoder.register_handler(Box::new(move |payload, id, sys, comp| {
    sink2.lock().push((payload.to_vec(), id, sys, comp));
  }));
  for frame in frames {
    decoder.decode(frame);
  }
  let result = sink.lock().clone();
  result
}

#[test]
fn prop_test_v1_roundtrip_arbitrary_payloads() {
  let mut runner = TestRunner::new(proptest::test_runner::Config::default());
  runner
    .run(
      &(
        proptest::collection::vec(any::<u8>(), 0..=255),
        any::<u8>(),
        any::<u8>(),
      ),
      |(payload, sys, comp)| {
        let mut encoder = MavlinkEncoder::new();
        let frame = encoder
          .encode_v1(msgid::HEARTBEAT as u8, &payload, sys, comp)
          .unwrap();
        let decoded = decode_all(&[frame]);
        prop_assert_eq!(decoded.len(), 1);
        let (got, id, got_sys, got_comp) = &decoded[0];
        prop_assert_eq!(got, &payload);
        prop_assert_eq!(*id, msgid::HEARTBEAT);
        prop_assert_eq!((*got_sys, *got_comp), (sys, comp));
        Ok(())
      },
    )
    .unwrap();
}

#[test]
fn prop_test_v2_roundtrip_up_to_zero_trim() {
  let mut runner = TestRunner::new(proptest::test_runner::Config::default());
  runner
    .run(
      &(
        proptest::collection::vec(any::<u8>(), 1..=255),
        any::<u8>(),
        any::<u8>(),
      ),
      |(payload, sys, comp)| {
        let mut encoder = MavlinkEncoder::new();
        let frame = encoder
          .encode_v2(msgid::COMMAND_LONG, &payload, sys, comp)
          .unwrap();
        let decoded = decode_all(&[frame]);
        prop_assert_eq!(decoded.len(), 1);

        let mut trimmed = payload.len();
        while trimmed > 1 && payload[trimmed - 1] == 0 {
          trimmed -= 1;
        }
        let (got, id, got_sys, got_comp) = &decoded[0];
        prop_assert_eq!(got, &payload[..trimmed].to_vec());
        prop_assert_eq!(*id, msgid::COMMAND_LONG);
        prop_assert_eq!((*got_sys, *got_comp), (sys, comp));
        Ok(())
      },
    )
    .unwrap();
}

#[test]
fn prop_test_stream_with_junk_between_frames() {
  let mut runner = TestRunner::new(proptest::test_runner::Config::default());
  runner
    .run(
      &(
        proptest::collection::vec(any::<u8>(), 1..=64),
        // Junk without start signs, so frame boundaries stay unambiguous.
        proptest::collection::vec(0u8..0xfd, 0..=64),
        1u8..=20,
      ),
      |(payload, junk, frame_count)| {
        let mut encoder = MavlinkEncoder::new();
        let mut stream = Vec::new();
        for _ in 0..frame_count {
          stream.extend_from_slice(&junk);
          let frame = encoder
            .encode_v1(msgid::SYS_STATUS as u8, &payload, 9, 8)
            .unwrap();
          stream.extend_from_slice(frame.as_slice());
        }

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let mut decoder = MavlinkDecoder::new();
        decoder.register_handler(Box::new(move |_, _, _, _| {
          count2.fetch_add(1, Ordering::SeqCst);
        }));
        // Feed in odd-sized chunks to exercise partial frame assembly.
        for chunk in stream.chunks(7) {
          decoder.decode(&IoBuffer::copy_from_slice(chunk));
        }
        prop_assert_eq!(
          count.load(Ordering::SeqCst),
          frame_count as usize
        );
        Ok(())
      },
    )
    .unwrap();
}
