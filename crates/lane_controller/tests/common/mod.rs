#![allow(dead_code)]

use lane_controller::{
    Controller, ControllerConfig, InstanceDescriptor, InstanceId, LoggingAdapter, PlayerId,
};
use lane_controller::persistence::MemorySessionStore;
use lane_protocol::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn controller_with(config: ControllerConfig) -> (Arc<Controller>, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let controller = Controller::new(config, store.clone(), Arc::new(LoggingAdapter));
    (Arc::new(controller), store)
}

pub fn controller() -> (Arc<Controller>, Arc<MemorySessionStore>) {
    controller_with(ControllerConfig::default())
}

/// Registers an available instance with a fake link that collects directives.
pub fn ready_instance(
    controller: &Controller,
    id: &str,
    game_type: &str,
    capacity: u32,
) -> (InstanceId, mpsc::Receiver<Message>) {
    let id = controller
        .on_instance_ready(InstanceDescriptor::new(game_type, format!("10.1.0.1:{capacity}"), capacity).with_id(id))
        .unwrap();
    let (tx, rx) = mpsc::channel(64);
    controller.links().attach(id.clone(), tx);
    (id, rx)
}

pub fn connected_player(controller: &Controller) -> PlayerId {
    let player = PlayerId::new();
    controller.on_player_connect(player);
    player
}
