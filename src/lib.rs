//! # EtherNet/IP Scanner for Rust
//!
//! An async EtherNet/IP originator for talking to CIP adapter-class
//! devices: remote I/O blocks, drives, valve terminals and similar
//! field devices.
//!
//! ## Features
//!
//! - **Device discovery** - List Identity broadcast over UDP with
//!   per-device identity records
//! - **Explicit assembly I/O** - Get/Set Attribute Single against the
//!   Assembly object, with instance discovery
//! - **Symbolic tag I/O** - Read/Write Tag services for controllers
//!   that expose named tags
//! - **Implicit Class-1 I/O** - cyclic UDP exchange negotiated with
//!   Forward Open, up to 8 concurrent connections with watchdog
//!   supervision
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use eip_scan::{EipEngine, EngineConfig, ImplicitConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = EipEngine::new(EngineConfig::default());
//!
//!     // Find adapters on the local subnet.
//!     for device in engine.scan_devices(Duration::from_secs(2)).await? {
//!         println!("{}: {}", device.address, device.product_name);
//!     }
//!
//!     // One explicit read of assembly instance 101.
//!     let target = "192.168.1.50".parse()?;
//!     let input = engine.read_assembly(target, 101).await?;
//!     println!("{} bytes in {:?}", input.data.len(), input.response_time);
//!
//!     // Cyclic I/O at a 20 ms RPI.
//!     let mut inputs = engine
//!         .implicit_open(ImplicitConfig {
//!             target,
//!             consumed_instance: 100,
//!             produced_instance: 101,
//!             consumed_size: None,
//!             produced_size: None,
//!             rpi_ms: 20,
//!             exclusive_owner: true,
//!         })
//!         .await?;
//!     engine.implicit_write_data(target, &[0x01, 0x00]).await?;
//!     if let Some(frame) = inputs.recv().await {
//!         println!("T->O: {frame:02X?}");
//!     }
//!     engine.implicit_close(target).await?;
//!     Ok(())
//! }
//! ```

pub mod assembly;
mod bytes;
pub mod cip;
pub mod connection;
pub mod discovery;
pub mod encap;
pub mod error;
pub mod session;
pub mod tag;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

pub use assembly::{AssemblyData, AssemblyInstance};
pub use connection::{ConnectionState, ImplicitConfig, MAX_CONNECTIONS, MAX_RPI_MS, MIN_RPI_MS};
pub use discovery::DeviceRecord;
pub use error::{EipError, Result};
pub use tag::TagValue;

use connection::ConnectionManager;
use session::Session;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local interface address: derives the discovery target list and
    /// binds the shared implicit I/O socket. Unspecified falls back to
    /// the limited broadcast for discovery and binds I/O on all
    /// interfaces.
    pub local_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// TCP connect deadline for explicit sessions.
    pub connect_timeout: Duration,
    /// Per-response deadline on an established session.
    pub io_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_address: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// The EtherNet/IP originator engine.
///
/// Explicit operations open a session, perform the exchange and
/// unregister; they hold no state between calls. Implicit connections
/// are tracked in a fixed 8-slot table, at most one per target, each
/// owning its session and cyclic tasks until closed.
pub struct EipEngine {
    config: EngineConfig,
    connections: ConnectionManager,
}

impl EipEngine {
    pub fn new(config: EngineConfig) -> Self {
        let connections = ConnectionManager::new(
            config.local_address,
            config.connect_timeout,
            config.io_timeout,
        );
        Self {
            config,
            connections,
        }
    }

    // --- discovery ---

    /// Probes the configured subnet with List Identity and collects
    /// replies for the full `wait` window, one record per responding
    /// device.
    pub async fn scan_devices(&self, wait: Duration) -> Result<Vec<DeviceRecord>> {
        let hosts = discovery::subnet_targets(self.config.local_address, self.config.netmask);
        let targets = discovery::to_probe_addrs(&hosts);
        discovery::scan_targets(&targets, wait).await
    }

    /// Probes an explicit host list instead of the configured subnet.
    pub async fn scan_hosts(
        &self,
        hosts: &[Ipv4Addr],
        wait: Duration,
    ) -> Result<Vec<DeviceRecord>> {
        let targets = discovery::to_probe_addrs(hosts);
        discovery::scan_targets(&targets, wait).await
    }

    // --- explicit assembly I/O ---

    async fn session(&self, target: Ipv4Addr) -> Result<Session> {
        Session::connect(target, self.config.connect_timeout, self.config.io_timeout).await
    }

    /// Reads the process data of one assembly instance.
    pub async fn read_assembly(&self, target: Ipv4Addr, instance: u16) -> Result<AssemblyData> {
        let mut session = self.session(target).await?;
        let started = Instant::now();
        let result = assembly::read_instance(&mut session, instance).await;
        session.unregister().await;
        Ok(AssemblyData {
            data: result?,
            response_time: started.elapsed(),
        })
    }

    /// Writes the process data of one assembly instance.
    pub async fn write_assembly(&self, target: Ipv4Addr, instance: u16, data: &[u8]) -> Result<()> {
        let mut session = self.session(target).await?;
        let result = assembly::write_instance(&mut session, instance, data).await;
        session.unregister().await;
        result
    }

    /// Whether an assembly instance accepts writes.
    ///
    /// Approximated as "the instance is readable": adapters do not expose
    /// writability directly, and a probe write would disturb outputs. A
    /// `true` here can still be followed by CIP status 0x0E (attribute not
    /// settable) on an actual write to an input assembly.
    pub async fn is_assembly_writable(&self, target: Ipv4Addr, instance: u16) -> Result<bool> {
        match self.read_assembly(target, instance).await {
            Ok(_) => Ok(true),
            Err(EipError::Cip { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Enumerates readable assembly instances on the target.
    pub async fn discover_assemblies(&self, target: Ipv4Addr) -> Result<Vec<AssemblyInstance>> {
        let mut session = self.session(target).await?;
        let result = assembly::discover_instances(&mut session).await;
        session.unregister().await;
        let found = result?;
        debug!(target = %target, found = found.len(), "assembly discovery complete");
        Ok(found)
    }

    // --- symbolic tag I/O ---

    /// Reads one element of a named tag.
    pub async fn read_tag(&self, target: Ipv4Addr, tag_name: &str) -> Result<TagValue> {
        let mut session = self.session(target).await?;
        let result = tag::read_tag(&mut session, tag_name).await;
        session.unregister().await;
        result
    }

    /// Writes one element of a named tag.
    pub async fn write_tag(
        &self,
        target: Ipv4Addr,
        tag_name: &str,
        value: &TagValue,
    ) -> Result<()> {
        let mut session = self.session(target).await?;
        let result = tag::write_tag(&mut session, tag_name, value).await;
        session.unregister().await;
        result
    }

    // --- implicit Class-1 I/O ---

    /// Opens a cyclic connection and returns the queue T->O frames are
    /// delivered on. The queue is bounded; when the consumer falls behind,
    /// the newest frame is dropped rather than stalling the receiver.
    pub async fn implicit_open(&self, config: ImplicitConfig) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.connections.open(config).await
    }

    /// Closes the cyclic connection to `target` with Forward Close and
    /// releases its slot.
    pub async fn implicit_close(&self, target: Ipv4Addr) -> Result<()> {
        self.connections.close(target).await
    }

    /// Replaces the O->T output image. Data shorter than the negotiated
    /// size is zero-padded; the change goes out on the next cycle.
    pub async fn implicit_write_data(&self, target: Ipv4Addr, data: &[u8]) -> Result<()> {
        self.connections.write_output(target, data).await
    }

    /// Returns a copy of the O->T output image as it will next be sent.
    pub async fn implicit_read_output(&self, target: Ipv4Addr) -> Result<Vec<u8>> {
        self.connections.read_output(target).await
    }

    /// Lifecycle state of the implicit connection to `target`, if one
    /// exists.
    pub async fn implicit_state(&self, target: Ipv4Addr) -> Option<ConnectionState> {
        self.connections.state(target).await
    }
}
