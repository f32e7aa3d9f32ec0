use super::*;

use pipeline::{StatAdjustment, StatsStore};
use shared::domain::{JobId, JobStatus, StatusCounts};
use storage::NewJob;

async fn seeded() -> (Storage, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let owner = storage.create_user("alice").await.expect("user");
    (storage, owner)
}

fn ctx() -> TriggerContext {
    TriggerContext {
        params: Default::default(),
        attempt: 1,
    }
}

#[tokio::test]
async fn write_publishes_job_then_counters() {
    let (storage, owner) = seeded().await;
    let (events, mut rx) = broadcast::channel(8);
    let live = LiveQuery::new(storage.clone(), events);

    let change = storage
        .insert_job(NewJob {
            owner: owner.clone(),
            title: "SRE".into(),
            company: "Initech".into(),
            status: JobStatus::Offer,
            logo_url: None,
            notes: None,
        })
        .await
        .expect("insert");
    storage
        .apply_stat_adjustments(&owner, &[StatAdjustment::increment(JobStatus::Offer)])
        .await
        .expect("count");
    live.on_write(&change, &ctx()).await.expect("publish");

    match rx.recv().await.expect("job event") {
        ServerEvent::JobChanged { owner: o, job_id, job } => {
            assert_eq!(o, owner);
            assert_eq!(job_id, change.job_id);
            assert_eq!(job, change.after);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match rx.recv().await.expect("stats event") {
        ServerEvent::StatsUpdated { counts, .. } => {
            assert_eq!(counts.get(JobStatus::Offer), 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn no_subscribers_is_not_an_error() {
    let (storage, owner) = seeded().await;
    let (events, rx) = broadcast::channel(8);
    drop(rx);
    let live = LiveQuery::new(storage.clone(), events);

    let change = storage
        .insert_job(NewJob {
            owner,
            title: "SRE".into(),
            company: "Initech".into(),
            status: JobStatus::Applied,
            logo_url: None,
            notes: None,
        })
        .await
        .expect("insert");
    live.on_write(&change, &ctx()).await.expect("no-op");
}

#[test]
fn events_are_scoped_to_their_owner() {
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let stats = ServerEvent::StatsUpdated {
        owner: alice.clone(),
        counts: StatusCounts::default(),
    };
    let changed = ServerEvent::JobChanged {
        owner: bob.clone(),
        job_id: JobId::from("job-1"),
        job: None,
    };

    assert!(visible_to(&stats, &alice));
    assert!(!visible_to(&stats, &bob));
    assert!(visible_to(&changed, &bob));
    assert!(!visible_to(&changed, &alice));
}
