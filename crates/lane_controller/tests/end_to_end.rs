mod common;

use common::connected_player;
use lane_controller::{
    Controller, ControllerConfig, ControllerServer, HealthStatus, InstanceDescriptor, InstanceId,
    Lifecycle, RouteConstraints, RouteState, SessionState,
};
use lane_protocol::{ClientConfig, Envelope, FramedConnection, InstanceClient, Message, RejectCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (Arc<Controller>, SocketAddr, broadcast::Sender<()>) {
    let config = ControllerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let (controller, _store) = common::controller_with(config);
    let server = ControllerServer::bind(controller.clone()).unwrap();
    let addr = server.local_addr();
    let shutdown = server.shutdown_sender();
    tokio::spawn(server.run());
    (controller, addr, shutdown)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        controller_address: addr.to_string(),
        register_timeout: WAIT,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn instance_registers_acks_directive_and_player_is_confirmed() {
    let (controller, addr, shutdown) = start_server().await;

    let client = InstanceClient::connect(
        &client_config(addr),
        InstanceDescriptor::new("arena", "10.2.0.1:25565", 8).with_id("arena-e2e"),
    )
    .await
    .unwrap();
    let instance = InstanceId::new("arena-e2e");
    assert_eq!(client.instance_id(), &instance);
    assert_eq!(client.heartbeat_interval(), Duration::from_millis(100));
    assert_eq!(
        controller.registry().snapshot(&instance).unwrap().lifecycle,
        Lifecycle::Registering
    );

    client.heartbeat(HealthStatus::Healthy).await.unwrap();
    wait_until(|| {
        controller
            .registry()
            .get(&instance)
            .is_some_and(|s| s.lifecycle == Lifecycle::Available)
    })
    .await;

    let player = connected_player(&controller);
    let handle = controller
        .route_player(player, RouteConstraints::game_type("arena"))
        .unwrap();

    let directive = timeout(WAIT, client.next_directive()).await.unwrap().unwrap();
    assert_eq!(directive.request_id, handle.id());
    assert_eq!(directive.players, vec![player]);
    client.ack(directive.request_id).await.unwrap();

    let outcome = timeout(WAIT, handle.outcome()).await.unwrap();
    assert_eq!(outcome, RouteState::Confirmed { instance: instance.clone() });
    let session = controller.locate_player(player).await.unwrap();
    assert_eq!(session.instance, Some(instance.clone()));

    client.deregister().await.unwrap();
    wait_until(|| !controller.registry().contains(&instance)).await;
    assert_eq!(
        controller.directory().lookup(&player).unwrap().state,
        SessionState::Orphaned
    );

    shutdown.send(()).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn nack_from_instance_releases_reservation() {
    let (controller, addr, shutdown) = start_server().await;
    let client = InstanceClient::connect(
        &client_config(addr),
        InstanceDescriptor::new("arena", "10.2.0.2:25565", 4).with_id("arena-nack"),
    )
    .await
    .unwrap();
    let instance = InstanceId::new("arena-nack");
    client.heartbeat(HealthStatus::Healthy).await.unwrap();
    wait_until(|| controller.registry().get(&instance).is_some_and(|s| s.is_routable())).await;

    let handle = controller
        .route_player(connected_player(&controller), RouteConstraints::game_type("arena"))
        .unwrap();
    let directive = timeout(WAIT, client.next_directive()).await.unwrap().unwrap();
    client.nack(directive.request_id, "map rotation").await.unwrap();

    let outcome = timeout(WAIT, handle.outcome()).await.unwrap();
    assert!(outcome.is_terminal());
    assert!(!matches!(outcome, RouteState::Confirmed { .. }));
    assert_eq!(controller.registry().snapshot(&instance).unwrap().reserved, 0);

    shutdown.send(()).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_healthy_registration_is_rejected() {
    let (_controller, addr, shutdown) = start_server().await;
    let descriptor = InstanceDescriptor::new("arena", "10.2.0.3:25565", 4).with_id("arena-dup");

    let _first = InstanceClient::connect(&client_config(addr), descriptor.clone())
        .await
        .unwrap();
    let second = InstanceClient::connect(&client_config(addr), descriptor).await;
    assert!(second.is_err());

    shutdown.send(()).ok();
}

async fn send(writer: &mut lane_protocol::FrameWriter<tokio::net::tcp::OwnedWriteHalf>, seq: u64, message: Message) {
    writer.write_envelope(&Envelope::new(seq, message)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_state_update_is_discarded() {
    let (controller, addr, shutdown) = start_server().await;
    let connection = FramedConnection::connect(&addr.to_string()).await.unwrap();
    let (mut reader, mut writer) = connection.into_split();
    let instance = InstanceId::new("arena-raw");

    send(
        &mut writer,
        1,
        Message::Register {
            descriptor: InstanceDescriptor::new("arena", "10.2.0.4:25565", 10).with_id("arena-raw"),
        },
    )
    .await;
    let reply = reader.read_envelope().await.unwrap().unwrap();
    assert!(matches!(reply.message, Message::Registered { .. }));

    let update = |occupancy| Message::StateUpdate {
        occupancy,
        capacity: 10,
        closing: false,
    };
    send(&mut writer, 2, update(6)).await;
    send(&mut writer, 2, update(1)).await;
    send(&mut writer, 3, Message::Heartbeat { status: HealthStatus::Healthy }).await;

    // Frames are applied in order, so the ack means the replay was handled.
    let ack = timeout(WAIT, reader.read_envelope()).await.unwrap().unwrap().unwrap();
    assert_eq!(ack.message, Message::HeartbeatAck);
    assert_eq!(controller.registry().snapshot(&instance).unwrap().reported, 6);

    shutdown.send(()).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn first_frame_must_be_register() {
    let (_controller, addr, shutdown) = start_server().await;
    let connection = FramedConnection::connect(&addr.to_string()).await.unwrap();
    let (mut reader, mut writer) = connection.into_split();

    send(&mut writer, 1, Message::Heartbeat { status: HealthStatus::Healthy }).await;
    let reply = timeout(WAIT, reader.read_envelope()).await.unwrap().unwrap().unwrap();
    assert!(matches!(
        reply.message,
        Message::Rejected {
            code: RejectCode::NotRegistered,
            ..
        }
    ));
    let closed = timeout(WAIT, reader.read_envelope()).await.unwrap().unwrap();
    assert!(closed.is_none());

    shutdown.send(()).ok();
}
