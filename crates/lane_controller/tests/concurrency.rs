mod common;

use common::{connected_player, controller, ready_instance};
use futures::future::join_all;
use lane_controller::{ControllerError, RejectReason, RouteConstraints, RouteState};
use lane_protocol::Message;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_assignment_wins_the_last_slot() {
    let (controller, _store) = controller();
    let (arena, _rx) = ready_instance(&controller, "arena-1", "arena", 3);
    for _ in 0..2 {
        let seated = connected_player(&controller);
        controller.directory().assign(&seated, &arena).unwrap();
    }

    let contenders: Vec<_> = (0..32).map(|_| connected_player(&controller)).collect();
    let tasks: Vec<_> = contenders
        .into_iter()
        .map(|player| {
            let controller = controller.clone();
            let arena = arena.clone();
            tokio::spawn(async move { controller.directory().assign(&player, &arena) })
        })
        .collect();

    let mut won = 0;
    for result in join_all(tasks).await {
        match result.unwrap() {
            Ok(_) => won += 1,
            Err(ControllerError::CapacityExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(won, 1);
    let snapshot = controller.registry().snapshot(&arena).unwrap();
    assert_eq!(snapshot.occupancy, 3);
    assert!(snapshot.occupancy <= snapshot.capacity);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_routes_never_overbook() {
    let (controller, _store) = controller();
    let (arena, _rx) = ready_instance(&controller, "arena-1", "arena", 5);

    let players: Vec<_> = (0..40).map(|_| connected_player(&controller)).collect();
    let tasks: Vec<_> = players
        .into_iter()
        .map(|player| {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .route_player(player, RouteConstraints::game_type("arena"))
                    .unwrap()
            })
        })
        .collect();

    let mut matched = 0;
    let mut rejected = 0;
    for handle in join_all(tasks).await {
        match handle.unwrap().state() {
            RouteState::Matched { .. } => matched += 1,
            RouteState::Rejected(RejectReason::NoEligibleInstance) => rejected += 1,
            other => panic!("unexpected state {other:?}"),
        }
    }

    assert_eq!(matched, 5);
    assert_eq!(rejected, 35);
    let snapshot = controller.registry().snapshot(&arena).unwrap();
    assert_eq!(snapshot.reserved, 5);
    assert_eq!(snapshot.free_slots(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_request_reaches_a_terminal_state() {
    let (controller, _store) = controller();
    let (arena, mut directives) = ready_instance(&controller, "arena-1", "arena", 100);

    let mut handles = Vec::new();
    for _ in 0..40 {
        let player = connected_player(&controller);
        handles.push(
            controller
                .route_player(player, RouteConstraints::game_type("arena"))
                .unwrap(),
        );
    }

    // Answer each directive differently: ack, nack, cancel, or leave it to expire.
    let mut requests = Vec::new();
    while let Ok(Message::RouteDirective { request_id, .. }) = directives.try_recv() {
        requests.push(request_id);
    }
    assert_eq!(requests.len(), 40);

    let engine = controller.engine().clone();
    let mut work = Vec::new();
    for (i, request) in requests.iter().copied().enumerate() {
        let engine = engine.clone();
        let arena = arena.clone();
        work.push(tokio::spawn(async move {
            match i % 4 {
                0 => {
                    engine.acknowledge(&arena, request).await.ok();
                }
                1 => {
                    engine.decline(&arena, request, "busy").ok();
                }
                2 => {
                    engine.cancel(request).ok();
                }
                _ => {}
            }
        }));
    }
    for result in join_all(work).await {
        result.unwrap();
    }
    controller.run_maintenance_at(Instant::now() + controller.config().route_confirm_timeout).await;

    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
            .await
            .unwrap();
        assert!(outcome.is_terminal(), "request ended as {outcome:?}");
    }
    assert_eq!(controller.engine().active_count(), 0);

    let snapshot = controller.registry().snapshot(&arena).unwrap();
    assert_eq!(snapshot.reserved, 0);
    assert_eq!(snapshot.occupancy, 10);
}
