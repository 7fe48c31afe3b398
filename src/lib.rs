//! # cpc-core
//!
//! Reliable, multiplexed link layer for a serial bus between a host and a
//! co-processor (Co-Processor Communication).
//!
//! Up to 255 logical endpoints share one bus. Each connected endpoint gets
//! in-order, acknowledged delivery through a sliding-window ARQ with
//! retransmission, and can also send unacknowledged unnumbered frames.
//! Endpoint 0 is the system endpoint: it carries the sequence-reset
//! handshake and the property exchange used to connect and close the others.
//!
//! ## Architecture
//!
//! - **Protocol**: 7-byte HDLC-style header, CRC-16 checksums, control byte
//!   codec, system command codec
//! - **Pools**: fixed-capacity buffer pools and counting budgets; nothing is
//!   allocated per frame outside them
//! - **Instance**: endpoint table, ARQ engine and system endpoint, all run
//!   from [`Instance::process`]
//! - **Driver**: the [`Driver`] trait a transport implements, plus an
//!   in-memory [`LoopbackDriver`]
//! - **Runtime**: optional tokio task wrapping an instance
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use cpc_core::{spawn_core_task, Instance, LoopbackDriver, OpenOptions, Role};
//!
//! #[tokio::main]
//! async fn main() -> cpc_core::Result<()> {
//!     let (a, b, _tap) = LoopbackDriver::pair();
//!     let mut host = Instance::builder(a).role(Role::Primary).build();
//!     let mut device = Instance::builder(b).role(Role::Secondary).build();
//!     for instance in [&mut host, &mut device] {
//!         instance.init()?;
//!         instance.start()?;
//!     }
//!     let (host, _) = spawn_core_task(host);
//!     let (device, _) = spawn_core_task(device);
//!
//!     let wait = Duration::from_secs(1);
//!     host.wait_handshake(wait).await?;
//!     device.open(5, OpenOptions::default()).await?;
//!     host.open(5, OpenOptions::default()).await?;
//!     host.connect(5, wait).await?;
//!
//!     host.write(5, Bytes::from_static(b"ping")).await?;
//!     let rx = device.recv(5, wait).await?;
//!     assert_eq!(rx.to_bytes(), Bytes::from_static(b"ping"));
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod instance;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod security;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, InstanceBuilder, PoolConfig, RetransmitConfig, Role};
pub use driver::{Driver, DriverCapabilities, DriverContext, LinkTap, LoopbackDriver, TxFrame};
pub use endpoint::{
    EndpointCallbacks, EndpointFlags, EndpointId, EndpointInfo, EndpointState, OpenOptions,
    WriteFlags, WriteStatus, WriteToken,
};
pub use error::{CpcError, FaultCause, Result};
pub use instance::{Instance, Lifecycle};
pub use pool::{PoolKind, PoolUsage, RxBuffer};
pub use runtime::{spawn_core_task, CoreHandle};
pub use security::{FrameSecurity, SecurityError};
