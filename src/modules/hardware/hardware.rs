//! The physical elevator, reached through `driver-rust`.
//!
//! The driver speaks the 4-byte request/response protocol over one TCP
//! connection guarded by a mutex, and panics if that connection is lost.
//! The crate is built with `panic = "abort"`, so that takes the node down.

use std::thread::spawn;
use std::time::Duration;

use crossbeam_channel as cbc;
use driver_rust::elevio;
use driver_rust::elevio::elev as e;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::modules::common::{ButtonType, Direction};

/// Output side of the hardware used by the controller.
pub trait ElevatorIo: Send + 'static {
    fn motor_direction(&self, dirn: Direction);
    fn button_lamp(&self, floor: u8, button: ButtonType, on: bool);
    fn floor_indicator(&self, floor: u8);
    fn door_lamp(&self, on: bool);
    fn stop_lamp(&self, on: bool);
}

impl ElevatorIo for e::Elevator {
    fn motor_direction(&self, dirn: Direction) {
        let dirn = match dirn {
            Direction::Up => e::DIRN_UP,
            Direction::Down => e::DIRN_DOWN,
            Direction::Stop => e::DIRN_STOP,
        };
        e::Elevator::motor_direction(self, dirn);
    }

    fn button_lamp(&self, floor: u8, button: ButtonType, on: bool) {
        let call = match button {
            ButtonType::HallUp => e::HALL_UP,
            ButtonType::HallDown => e::HALL_DOWN,
            ButtonType::Cab => e::CAB,
        };
        self.call_button_light(floor, call, on);
    }

    fn floor_indicator(&self, floor: u8) {
        e::Elevator::floor_indicator(self, floor);
    }

    fn door_lamp(&self, on: bool) {
        self.door_light(on);
    }

    fn stop_lamp(&self, on: bool) {
        self.stop_button_light(on);
    }
}

/// Input events from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    Button { floor: u8, button: ButtonType },
    FloorArrival(u8),
    StopButton(bool),
    Obstruction(bool),
}

/// Starts the driver's poller threads and a bridge thread that forwards
/// their crossbeam channels into the controller's tokio channel.
pub fn spawn_pollers(elevator: e::Elevator, poll_period: Duration, events_tx: mpsc::Sender<HardwareEvent>) {
    let (call_button_tx, call_button_rx) = cbc::unbounded::<elevio::poll::CallButton>();
    {
        let elevator = elevator.clone();
        spawn(move || elevio::poll::call_buttons(elevator, call_button_tx, poll_period));
    }

    let (floor_sensor_tx, floor_sensor_rx) = cbc::unbounded::<u8>();
    {
        let elevator = elevator.clone();
        spawn(move || elevio::poll::floor_sensor(elevator, floor_sensor_tx, poll_period));
    }

    let (stop_button_tx, stop_button_rx) = cbc::unbounded::<bool>();
    {
        let elevator = elevator.clone();
        spawn(move || elevio::poll::stop_button(elevator, stop_button_tx, poll_period));
    }

    let (obstruction_tx, obstruction_rx) = cbc::unbounded::<bool>();
    {
        let elevator = elevator.clone();
        spawn(move || elevio::poll::obstruction(elevator, obstruction_tx, poll_period));
    }

    spawn(move || loop {
        let event = cbc::select! {
            recv(call_button_rx) -> a => a.map(|call_button| {
                ButtonType::from_call(call_button.call).map(|button| HardwareEvent::Button {
                    floor: call_button.floor,
                    button,
                })
            }),
            recv(floor_sensor_rx) -> a => a.map(|floor| Some(HardwareEvent::FloorArrival(floor))),
            recv(stop_button_rx) -> a => a.map(|stop| Some(HardwareEvent::StopButton(stop))),
            recv(obstruction_rx) -> a => a.map(|obstr| Some(HardwareEvent::Obstruction(obstr))),
        };

        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(_) => {
                warn!("hardware poller stopped");
                return;
            }
        };
        debug!("hardware event: {event:?}");
        if events_tx.blocking_send(event).is_err() {
            warn!("controller gone, stopping hardware bridge");
            return;
        }
    });
}
