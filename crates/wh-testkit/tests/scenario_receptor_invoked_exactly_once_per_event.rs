//! Property 2 (receptor half): a receptor bound to an event type via
//! MessageAssociation is invoked exactly once per event, even though the
//! inbox delivery that produced the event may itself be retried.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use wh_coordinator::ImmediateStrategy;
use wh_db::{NewEventFields, ProcessWorkBatchInput};
use wh_envelope::{AssociationType, MessageAssociation};
use wh_worker::ReceptorWorker;

#[tokio::test]
async fn receptor_sees_each_appended_event_exactly_once() {
    let Some(pool) = wh_testkit::maybe_test_pool().await.unwrap() else {
        eprintln!("SKIP: WH_DATABASE_URL not set");
        return;
    };

    wh_db::upsert_message_association(
        &pool,
        &MessageAssociation {
            message_type: "TestEvent".to_string(),
            association_type: AssociationType::Receptor,
            target_name: "test-receptor".to_string(),
            service_name: "wh-testkit".to_string(),
        },
    )
    .await
    .unwrap();

    let stream_id = Uuid::new_v4();
    let identity = wh_testkit::test_identity("receptor-producer");
    let config = wh_testkit::test_config();

    let mut msg = wh_testkit::new_outbox_message(stream_id, 1);
    msg.event = Some(NewEventFields {
        aggregate_id: stream_id,
        aggregate_type: "TestAggregate".to_string(),
        event_type: "TestEvent".to_string(),
    });

    let mut input = ProcessWorkBatchInput::heartbeat_only(identity);
    input.config = config;
    input.new_outbox_messages = vec![msg];
    wh_db::process_work_batch(&pool, input).await.unwrap();

    let strategy = Arc::new(ImmediateStrategy::new(pool.clone(), wh_testkit::test_identity("receptor"), config));
    let handler = Arc::new(wh_testkit::RecordingReceptorHandler::new("test-receptor"));
    let worker =
        ReceptorWorker::new(pool.clone(), strategy.clone(), handler.clone(), Duration::from_millis(50), 2, 10, config.lease_seconds);

    worker.tick().await.unwrap();
    worker.tick().await.unwrap();

    assert_eq!(handler.handled_event_ids().len(), 1, "the receptor must be invoked exactly once for the event");
}
