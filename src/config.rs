//! Instance configuration.
//!
//! [`CoreConfig`] can be built in code, parsed from JSON, or assembled with
//! the fluent [`InstanceBuilder`]. It is validated at early init.
//!
//! # Example
//!
//! ```
//! use cpc_core::config::{CoreConfig, Role};
//!
//! let config = CoreConfig::from_json_str(r#"{
//!     "role": "secondary",
//!     "max_rx_payload": 512,
//!     "retransmit": { "max_retries": 3 }
//! }"#).unwrap();
//!
//! assert_eq!(config.role, Role::Secondary);
//! assert_eq!(config.retransmit.max_retries, 3);
//! assert_eq!(config.retransmit.min_timeout_ms, 100);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::clock::{Clock, SystemClock};
use crate::driver::Driver;
use crate::error::{CpcError, Result};
use crate::instance::Instance;
use crate::protocol::{ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::security::FrameSecurity;

/// Default bound on outstanding system endpoint commands.
pub const DEFAULT_SYSTEM_COMMAND_QUEUE: usize = 8;

/// Default number of simultaneously open endpoints.
pub const DEFAULT_MAX_OPEN_ENDPOINTS: usize = 32;

/// Which side initiates the sequence reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Host side. Sends the reset and retries it.
    Primary,
    /// Co-processor side. Answers the reset.
    Secondary,
}

/// Retransmission bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    pub initial_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Expiries tolerated before the destination is declared unreachable.
    pub max_retries: u8,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 250,
            min_timeout_ms: 100,
            max_timeout_ms: 2_000,
            max_retries: 5,
        }
    }
}

impl RetransmitConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// Pool and budget capacities.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub buffer_handles: usize,
    pub header_buffers: usize,
    pub reject_buffers: usize,
    pub rx_data_buffers: usize,
    pub rx_queue_items: usize,
    pub tx_data_buffers: usize,
    pub supervisory_frames: usize,
    pub command_contexts: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_handles: 48,
            header_buffers: 48,
            reject_buffers: 4,
            rx_data_buffers: 16,
            rx_queue_items: 16,
            tx_data_buffers: 16,
            supervisory_frames: 8,
            command_contexts: 8,
        }
    }
}

/// Complete instance configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub role: Role,
    /// Stamped on every buffer handle.
    pub instance_id: u32,
    /// Largest payload this side accepts; advertised as the receive capability.
    pub max_rx_payload: usize,
    /// Capability bits advertised to the peer.
    pub capabilities: u32,
    /// Capability bits the peer must advertise.
    pub required_capabilities: u32,
    pub reset_retry_interval_ms: u64,
    pub system_command_queue: usize,
    pub max_open_endpoints: usize,
    /// Default wait used by the runtime's blocking write.
    pub tx_wait_timeout_ms: u64,
    pub pools: PoolConfig,
    pub retransmit: RetransmitConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            instance_id: 0,
            max_rx_payload: DEFAULT_MAX_PAYLOAD_SIZE,
            capabilities: 0,
            required_capabilities: 0,
            reset_retry_interval_ms: 500,
            system_command_queue: DEFAULT_SYSTEM_COMMAND_QUEUE,
            max_open_endpoints: DEFAULT_MAX_OPEN_ENDPOINTS,
            tx_wait_timeout_ms: 1_000,
            pools: PoolConfig::default(),
            retransmit: RetransmitConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn reset_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reset_retry_interval_ms)
    }

    pub fn tx_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_wait_timeout_ms)
    }

    /// Check every bound. Called by early init.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CpcError::InvalidConfig(msg));

        if self.max_rx_payload == 0 || self.max_rx_payload > ABSOLUTE_MAX_PAYLOAD_SIZE {
            return invalid(format!(
                "max_rx_payload must be within 1..={ABSOLUTE_MAX_PAYLOAD_SIZE}, got {}",
                self.max_rx_payload
            ));
        }
        if self.max_open_endpoints == 0 || self.max_open_endpoints > 256 {
            return invalid(format!(
                "max_open_endpoints must be within 1..=256, got {}",
                self.max_open_endpoints
            ));
        }
        if self.system_command_queue == 0 {
            return invalid("system_command_queue must be non-zero".into());
        }
        if self.reset_retry_interval_ms == 0 {
            return invalid("reset_retry_interval_ms must be non-zero".into());
        }

        let pools = &self.pools;
        let capacities = [
            ("buffer_handles", pools.buffer_handles),
            ("header_buffers", pools.header_buffers),
            ("reject_buffers", pools.reject_buffers),
            ("rx_data_buffers", pools.rx_data_buffers),
            ("rx_queue_items", pools.rx_queue_items),
            ("tx_data_buffers", pools.tx_data_buffers),
            ("supervisory_frames", pools.supervisory_frames),
            ("command_contexts", pools.command_contexts),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return invalid(format!("pools.{name} must be non-zero"));
            }
            if capacity > u16::MAX as usize {
                return invalid(format!("pools.{name} exceeds {}", u16::MAX));
            }
        }

        let rt = &self.retransmit;
        if rt.min_timeout_ms == 0 || rt.min_timeout_ms > rt.max_timeout_ms {
            return invalid(format!(
                "retransmit timeouts must satisfy 0 < min <= max, got {}..{}",
                rt.min_timeout_ms, rt.max_timeout_ms
            ));
        }
        if rt.initial_timeout_ms < rt.min_timeout_ms || rt.initial_timeout_ms > rt.max_timeout_ms {
            return invalid(format!(
                "retransmit.initial_timeout_ms {} outside {}..={}",
                rt.initial_timeout_ms, rt.min_timeout_ms, rt.max_timeout_ms
            ));
        }
        if rt.max_retries == 0 {
            return invalid("retransmit.max_retries must be non-zero".into());
        }
        Ok(())
    }
}

/// Fluent builder for an [`Instance`].
///
/// # Example
///
/// ```
/// use cpc_core::config::{InstanceBuilder, Role};
/// use cpc_core::driver::LoopbackDriver;
///
/// let (driver, _tap) = LoopbackDriver::standalone();
/// let instance = InstanceBuilder::new(driver)
///     .role(Role::Secondary)
///     .max_rx_payload(512)
///     .max_retries(3)
///     .build();
///
/// assert_eq!(instance.config().max_rx_payload, 512);
/// ```
pub struct InstanceBuilder<D> {
    driver: D,
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    security: Option<Box<dyn FrameSecurity>>,
}

impl<D: Driver> InstanceBuilder<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            config: CoreConfig::default(),
            clock: Arc::new(SystemClock),
            security: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    pub fn instance_id(mut self, id: u32) -> Self {
        self.config.instance_id = id;
        self
    }

    /// Set the largest payload accepted from the peer.
    ///
    /// Default: 256
    pub fn max_rx_payload(mut self, len: usize) -> Self {
        self.config.max_rx_payload = len;
        self
    }

    pub fn capabilities(mut self, bits: u32) -> Self {
        self.config.capabilities = bits;
        self
    }

    pub fn required_capabilities(mut self, bits: u32) -> Self {
        self.config.required_capabilities = bits;
        self
    }

    pub fn retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.config.retransmit = retransmit;
        self
    }

    /// Set how many retransmit expiries are tolerated.
    ///
    /// Default: 5
    pub fn max_retries(mut self, retries: u8) -> Self {
        self.config.retransmit.max_retries = retries;
        self
    }

    pub fn pools(mut self, pools: PoolConfig) -> Self {
        self.config.pools = pools;
        self
    }

    /// Set the sequence reset retry interval.
    ///
    /// Default: 500 ms
    pub fn reset_retry_interval(mut self, interval: Duration) -> Self {
        self.config.reset_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Use a custom time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install a security module for endpoint payloads.
    pub fn security(mut self, security: Box<dyn FrameSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Build an uninitialized instance.
    pub fn build(self) -> Instance<D> {
        Instance::with_parts(self.driver, self.config, self.clock, self.security)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_json_partial_override() {
        let config = CoreConfig::from_json_str(
            r#"{"role":"secondary","pools":{"buffer_handles":8},"reset_retry_interval_ms":50}"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Secondary);
        assert_eq!(config.pools.buffer_handles, 8);
        assert_eq!(config.pools.header_buffers, PoolConfig::default().header_buffers);
        assert_eq!(config.reset_retry_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_json_errors_surface() {
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"role":"observer"}"#),
            Err(CpcError::Json(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = CoreConfig {
            max_rx_payload: ABSOLUTE_MAX_PAYLOAD_SIZE + 1,
            ..CoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(CpcError::InvalidConfig(_))));

        config.max_rx_payload = 128;
        config.pools.rx_queue_items = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rx_queue_items"));

        config.pools.rx_queue_items = 4;
        config.retransmit.min_timeout_ms = 500;
        config.retransmit.max_timeout_ms = 100;
        assert!(config.validate().is_err());

        config.retransmit = RetransmitConfig {
            initial_timeout_ms: 50,
            ..RetransmitConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
