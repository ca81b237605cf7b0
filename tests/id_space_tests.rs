//! Query-id allocation behavior at and near the 16-bit boundary.

mod common;

use std::time::Instant;

use common::*;
use hermod::{DnsError, RecordClass, RecordType};

#[test]
fn test_id_space_can_fill_completely_and_then_refuses() {
    let base = Instant::now();
    let mut channel = mock_channel(&["10.0.0.1"], |options| {
        // Keep deadlines far away so nothing expires while we fill up.
        options.timeout = Some(ms(120_000));
    });
    let out = outcomes();

    let mut ids = vec![false; 65536];
    for _ in 0..65536u32 {
        let id = channel
            .submit_at("example.com", RecordType::A, RecordClass::IN, base, record(&out))
            .unwrap();
        assert!(!ids[id as usize], "id {} handed out twice", id);
        ids[id as usize] = true;
    }
    assert_eq!(channel.live_queries(), 65536);
    assert!(out.borrow().is_empty());

    // Every id is taken; one more submission must fail cleanly.
    let err = channel
        .submit_at("overflow.example.com", RecordType::A, RecordClass::IN, base, record(&out))
        .unwrap_err();
    assert_eq!(err, DnsError::NoMem);
    assert_eq!(channel.live_queries(), 65536);

    channel.destroy();
    assert_eq!(out.borrow().len(), 65536);
    assert!(
        out.borrow()
            .iter()
            .all(|o| o.result.as_ref().unwrap_err() == &DnsError::Destruction)
    );
}

#[test]
fn test_ids_are_not_sequential() {
    let base = Instant::now();
    let mut channel = mock_channel(&["10.0.0.1"], |_| {});
    let out = outcomes();

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(
            channel
                .submit_at("example.com", RecordType::A, RecordClass::IN, base, record(&out))
                .unwrap(),
        );
    }
    let sequential = ids.windows(2).all(|w| w[1] == w[0].wrapping_add(1));
    assert!(!sequential, "query ids look like a counter: {:?}", ids);
}
