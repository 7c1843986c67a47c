use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use clap::Parser;
use driver_rust::elevio::elev as e;
use env_logger::Env;
use log::{error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use elevator_fleet::modules::common::{ElevatorState, FleetError};
use elevator_fleet::modules::config::Args;
use elevator_fleet::modules::decision::Decision;
use elevator_fleet::modules::elevator::ElevatorController;
use elevator_fleet::modules::hardware::{spawn_pollers, ElevatorIo};
use elevator_fleet::modules::network::{create_socket, network_receiver, network_sender};
use elevator_fleet::modules::peers::{heartbeat_receiver, heartbeat_sender};

async fn run_controller<I: ElevatorIo>(mut controller: ElevatorController<I>) -> Result<(), FleetError> {
    loop {
        controller.step().await?;
    }
}

async fn run_decision(mut decision: Decision) -> Result<(), FleetError> {
    loop {
        decision.step().await?;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(args.log_filter())).init();
    let config = args.into_config().context("invalid configuration")?;
    let timing = config.timing.clone();
    let me = config.node_id;
    info!(
        "Starting node {} of {} ({} floors, driver at {})",
        me, config.num_nodes, config.num_floors, config.driver_addr
    );

    let elevator = e::Elevator::init(&config.driver_addr, config.num_floors)
        .with_context(|| format!("could not connect to the elevator at {}", config.driver_addr))?;
    let start_floor = elevator.floor_sensor();
    let shutdown_handle = elevator.clone();

    // Setup channels
    let (hardware_tx, hardware_rx) = mpsc::channel(100);
    let (controller_command_tx, controller_command_rx) = mpsc::unbounded_channel();
    let (controller_event_tx, controller_event_rx) = mpsc::unbounded_channel();
    let (elevator_state_tx, elevator_state_rx) = watch::channel(ElevatorState::new(
        me,
        config.num_nodes,
        config.num_floors,
    ));

    // Setup network channels
    let (decision_to_network_tx, decision_to_network_rx) = mpsc::channel(100);
    let (network_to_decision_tx, network_to_decision_rx) = mpsc::channel(100);
    let (peer_tx, peer_rx) = mpsc::channel(100);

    spawn_pollers(elevator.clone(), timing.poll_period, hardware_tx);
    let controller = ElevatorController::new(
        &config,
        elevator,
        start_floor,
        hardware_rx,
        controller_command_rx,
        controller_event_tx,
        elevator_state_tx,
    );
    let decision = Decision::new(
        &config,
        elevator_state_rx,
        controller_event_rx,
        controller_command_tx,
        network_to_decision_rx,
        decision_to_network_tx,
        peer_rx,
    );

    let bcast_target = SocketAddr::V4(SocketAddrV4::new(config.broadcast_addr, config.bcast_port));
    let peer_target = SocketAddr::V4(SocketAddrV4::new(config.broadcast_addr, config.peer_port));

    let mut tasks = JoinSet::new();
    tasks.spawn(network_sender(
        create_socket(0).context("could not open the broadcast sender socket")?,
        bcast_target,
        timing.clone(),
        decision_to_network_rx,
    ));
    tasks.spawn(network_receiver(
        create_socket(config.bcast_port)
            .with_context(|| format!("could not bind broadcast port {}", config.bcast_port))?,
        me,
        timing.clone(),
        network_to_decision_tx,
    ));
    tasks.spawn(heartbeat_sender(
        create_socket(0).context("could not open the heartbeat socket")?,
        peer_target,
        me,
        timing.clone(),
    ));
    tasks.spawn(heartbeat_receiver(
        create_socket(config.peer_port).with_context(|| format!("could not bind peer port {}", config.peer_port))?,
        me,
        config.num_nodes,
        timing.clone(),
        peer_tx,
    ));
    tasks.spawn(run_controller(controller));
    tasks.spawn(run_decision(decision));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => Err(anyhow::anyhow!("a node task stopped unexpectedly")),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("node task failed")),
            Err(e) => Err(anyhow::Error::new(e).context("node task panicked")),
        },
    };

    shutdown_handle.motor_direction(e::DIRN_STOP);
    tasks.abort_all();
    if let Err(e) = &outcome {
        error!("Node {me} stopping: {e:#}");
    }
    outcome
}
