//! Outbox round trip: unit of work, commit, relocation.

use chrono::Duration;
use futures_util::FutureExt;
use keel_core::{Clock, Envelope, KeelError, QueueError};
use keel_storage::{in_unit_of_work, DurableQueue, InMemorySessionFactory, OutboxMover, UnitOfWork};
use keel_test_utils::fixtures::{
    manual_clock, memory_queue, memory_transport, memory_uri, node, ready_envelope,
    scheduled_envelope,
};

#[tokio::test]
async fn test_committed_work_reaches_queues() {
    let clock = manual_clock();
    let transport = memory_transport(&clock);
    let orders = memory_queue(&transport, "orders").await;
    let billing = memory_queue(&transport, "billing").await;
    let factory = InMemorySessionFactory::new(transport.store().clone(), node(1));
    let mover = OutboxMover::new(transport.clone());

    let now_message = ready_envelope(memory_uri("orders"));
    let later_message = scheduled_envelope(memory_uri("billing"), clock.now() + Duration::hours(1));
    let (a, b) = (now_message.clone(), later_message.clone());

    let value = in_unit_of_work(&factory, &mover, move |session| {
        async move {
            session.publish(a).await?;
            session.publish(b).await?;
            Ok::<_, KeelError>(42)
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(transport.store().outgoing_count(), 0);
    assert_eq!(orders.count().await.unwrap(), 1);
    assert_eq!(billing.count().await.unwrap(), 0);
    assert_eq!(billing.scheduled_count().await.unwrap(), 1);

    let popped = orders.pop_direct(5).await.unwrap();
    assert_eq!(popped[0].id, now_message.id);
}

#[tokio::test]
async fn test_failed_work_publishes_nothing() {
    let clock = manual_clock();
    let transport = memory_transport(&clock);
    let orders = memory_queue(&transport, "orders").await;
    let factory = InMemorySessionFactory::new(transport.store().clone(), node(1));
    let mover = OutboxMover::new(transport.clone());
    let message = ready_envelope(memory_uri("orders"));

    let result: Result<(), KeelError> = in_unit_of_work(&factory, &mover, move |session| {
        async move {
            session.publish(message).await?;
            Err(QueueError::SessionFinished.into())
        }
        .boxed()
    })
    .await;

    assert!(result.is_err());
    assert_eq!(transport.store().outgoing_count(), 0);
    assert_eq!(orders.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unaddressed_envelope_rejected_by_session() {
    let clock = manual_clock();
    let transport = memory_transport(&clock);
    let factory = InMemorySessionFactory::new(transport.store().clone(), node(1));
    let mover = OutboxMover::new(transport.clone());

    let result = in_unit_of_work(&factory, &mover, |session| {
        async move {
            session.publish(Envelope::new("Orphan", Vec::new())).await?;
            Ok::<_, KeelError>(())
        }
        .boxed()
    })
    .await;

    assert!(matches!(
        result,
        Err(KeelError::Queue(QueueError::MissingDestination { .. }))
    ));
}
