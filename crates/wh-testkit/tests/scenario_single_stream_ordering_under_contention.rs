//! S1 — Single-stream ordering under contention. Two instances, one stream:
//! the claiming instance holds the lease until it acks, and a competitor
//! sees none of the claimed rows until the lease lapses.

use uuid::Uuid;
use wh_db::{process_work_batch, ProcessWorkBatchInput};
use wh_envelope::WorkDomain;

#[tokio::test]
async fn only_the_claiming_instance_sees_the_stream_until_it_acks() {
    let Some(pool) = wh_testkit::maybe_test_pool().await.unwrap() else {
        eprintln!("SKIP: WH_DATABASE_URL not set");
        return;
    };

    let stream_id = Uuid::new_v4();
    let instance_a = wh_testkit::test_identity("a");
    let instance_b = wh_testkit::test_identity("b");
    let config = wh_testkit::test_config();

    let m1 = wh_testkit::new_outbox_message(stream_id, 1);
    let m2 = wh_testkit::new_outbox_message(stream_id, 2);
    let m3 = wh_testkit::new_outbox_message(stream_id, 3);
    let (m1_id, m2_id, m3_id) = (m1.message_id, m2.message_id, m3.message_id);

    let mut input = ProcessWorkBatchInput::heartbeat_only(instance_a.clone());
    input.config = config;
    input.new_outbox_messages = vec![m1, m2, m3];
    let claimed_a = process_work_batch(&pool, input).await.unwrap();

    let claimed_ids: Vec<Uuid> = claimed_a.iter().map(|r| r.message_id).collect();
    assert!(claimed_ids.contains(&m1_id));
    assert!(claimed_ids.contains(&m2_id));
    assert!(claimed_ids.contains(&m3_id));

    // Ordering: the batch for this stream is returned in sequence_order.
    let stream_rows: Vec<_> = claimed_a.iter().filter(|r| r.stream_id == stream_id).collect();
    for w in stream_rows.windows(2) {
        assert!(w[0].sequence_order <= w[1].sequence_order);
    }

    let mut input_b = ProcessWorkBatchInput::heartbeat_only(instance_b.clone());
    input_b.config = config;
    let claimed_b = process_work_batch(&pool, input_b).await.unwrap();
    let claimed_b_ids: Vec<Uuid> = claimed_b.iter().map(|r| r.message_id).collect();
    assert!(!claimed_b_ids.contains(&m1_id), "instance B must not see m1 while A's lease is live");
    assert!(!claimed_b_ids.contains(&m2_id));
    assert!(!claimed_b_ids.contains(&m3_id));

    // A acks m1 as published; the next call returns m2 as the head of the stream.
    let mut ack_input = ProcessWorkBatchInput::heartbeat_only(instance_a.clone());
    ack_input.config = config;
    ack_input.outbox_completions = vec![wh_db::Completion { message_id: m1_id, status_flags: wh_envelope::status::PUBLISHED }];
    let after_ack = process_work_batch(&pool, ack_input).await.unwrap();
    let still_claimed: Vec<Uuid> = after_ack
        .iter()
        .filter(|r| r.source == WorkDomain::Outbox && r.stream_id == stream_id)
        .map(|r| r.message_id)
        .collect();
    assert!(still_claimed.contains(&m2_id) || still_claimed.contains(&m3_id));
    assert!(!still_claimed.contains(&m1_id), "m1 is acked, must not resurrect (property 5)");
}
