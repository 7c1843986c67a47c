//! Node configuration.
//!
//! Everything tunable is parsed once from the command line into an immutable
//! [`Config`] which is cloned into each task.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

use crate::modules::common::{FleetError, NodeId, Result};

pub const DEFAULT_FLOORS: u8 = 4;
pub const DEFAULT_NODES: usize = 3;
pub const DEFAULT_DRIVER_ADDR: &str = "localhost:15657";
pub const DEFAULT_PEER_PORT: u16 = 19738;
pub const DEFAULT_BCAST_PORT: u16 = 19735;

#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    /// Copies sent per logical broadcast
    pub send_repeats: usize,
    pub repeat_spacing: Duration,
    pub read_deadline: Duration,
    pub bid_timeout: Duration,
    pub door_open: Duration,
    pub travel_per_floor: Duration,
    pub poll_period: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            heartbeat_interval: Duration::from_millis(15),
            peer_timeout: Duration::from_millis(500),
            send_repeats: 3,
            repeat_spacing: Duration::from_millis(2),
            read_deadline: Duration::from_millis(100),
            bid_timeout: Duration::from_millis(400),
            door_open: Duration::from_secs(3),
            travel_per_floor: Duration::from_millis(2500),
            poll_period: Duration::from_millis(25),
        }
    }
}

impl Timing {
    /// How long a fresh node stays quiet before it may broadcast its own syncs.
    pub fn join_grace(&self) -> Duration {
        self.peer_timeout * 4
    }

    /// How long late bids for an already resolved order are ignored.
    pub fn resolved_memory(&self) -> Duration {
        self.bid_timeout * 2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub node_id: NodeId,
    pub num_nodes: usize,
    pub num_floors: u8,
    pub driver_addr: String,
    pub peer_port: u16,
    pub bcast_port: u16,
    pub broadcast_addr: Ipv4Addr,
    pub timing: Timing,
}

impl Config {
    /// Default configuration for `node_id`, mostly useful in tests.
    pub fn new(node_id: NodeId, num_nodes: usize, num_floors: u8) -> Self {
        Config {
            node_id,
            num_nodes,
            num_floors,
            driver_addr: DEFAULT_DRIVER_ADDR.to_string(),
            peer_port: DEFAULT_PEER_PORT,
            bcast_port: DEFAULT_BCAST_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            timing: Timing::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 || self.num_nodes > NodeId::MAX as usize + 1 {
            return Err(FleetError::config(format!(
                "node count must be between 1 and {}, got {}",
                NodeId::MAX as usize + 1,
                self.num_nodes
            )));
        }
        if self.node_id as usize >= self.num_nodes {
            return Err(FleetError::config(format!(
                "node id {} is outside 0..{}",
                self.node_id, self.num_nodes
            )));
        }
        if self.num_floors < 2 {
            return Err(FleetError::config(format!(
                "an elevator needs at least two floors, got {}",
                self.num_floors
            )));
        }
        if self.peer_port == self.bcast_port {
            return Err(FleetError::config("peer and broadcast ports must differ"));
        }
        if self.timing.send_repeats == 0 {
            return Err(FleetError::config("send repeats must be at least 1"));
        }
        Ok(())
    }
}

/// Command-line arguments for one elevator node
#[derive(Parser, Debug)]
#[command(
    name = "elevator-fleet",
    about = "Peer-to-peer elevator controller with auction-based hall call assignment",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Args {
    /// Node id, unique in the fleet (0-based)
    #[arg(long, value_name = "ID")]
    pub id: NodeId,

    /// Number of nodes the order matrix has room for
    #[arg(long, value_name = "N", default_value_t = DEFAULT_NODES)]
    pub nodes: usize,

    #[arg(long, value_name = "N", default_value_t = DEFAULT_FLOORS)]
    pub floors: u8,

    /// Address of the elevator server or simulator
    #[arg(long, value_name = "HOST:PORT", default_value = DEFAULT_DRIVER_ADDR)]
    pub driver_addr: String,

    #[arg(long, value_name = "PORT", default_value_t = DEFAULT_PEER_PORT)]
    pub peer_port: u16,

    /// Port for bids and order syncs
    #[arg(long, value_name = "PORT", default_value_t = DEFAULT_BCAST_PORT)]
    pub bcast_port: u16,

    #[arg(long, value_name = "ADDR", default_value_t = Ipv4Addr::BROADCAST)]
    pub broadcast_addr: Ipv4Addr,

    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        help = "Set logging level (error, warn, info, debug, trace)"
    )]
    pub log_level: String,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn log_filter(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn into_config(self) -> Result<Config> {
        let config = Config {
            node_id: self.id,
            num_nodes: self.nodes,
            num_floors: self.floors,
            driver_addr: self.driver_addr,
            peer_port: self.peer_port,
            bcast_port: self.bcast_port,
            broadcast_addr: self.broadcast_addr,
            timing: Timing::default(),
        };
        config.validate()?;
        Ok(config)
    }
}
