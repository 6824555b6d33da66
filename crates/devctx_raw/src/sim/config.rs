//! Description of the devices exposed by [`SimDriver`](super::SimDriver).

use crate::{ctx_flags, limit, UNBOUNDED_PRIORITY};
use std::env;
use tracing::warn;

/// Environment variable holding the number of simulated devices.
pub const DEVICES_ENV: &str = "DEVCTX_SIM_DEVICES";
/// Environment variable holding the reported driver version, e.g. `12040`.
pub const DRIVER_VERSION_ENV: &str = "DEVCTX_SIM_DRIVER_VERSION";

const DEFAULT_DRIVER_VERSION: i32 = 12040;
const DEFAULT_API_VERSION: u32 = 3020;

/// Properties of a single simulated device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimDeviceSpec {
    pub(crate) name: String,
    pub(crate) max_contexts: usize,
    pub(crate) prohibited: bool,
    pub(crate) least_priority: i32,
    pub(crate) greatest_priority: i32,
    pub(crate) default_limits: [usize; limit::COUNT],
    pub(crate) limit_ceiling: usize,
    pub(crate) configurable_banks: bool,
    pub(crate) primary_flags: u32,
}

impl SimDeviceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_contexts: 16,
            prohibited: false,
            least_priority: 0,
            greatest_priority: -5,
            default_limits: [1024, 1 << 20, 8 << 20, 2, 2048, 64],
            limit_ceiling: 1 << 33,
            configurable_banks: true,
            primary_flags: ctx_flags::SCHED_AUTO | ctx_flags::MAP_HOST,
        }
    }

    /// Maximum number of explicitly created contexts alive at once. Creating more fails with
    /// `OutOfMemory`.
    pub fn max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    /// Puts the device in a prohibited compute mode: no context can be retained or created.
    pub fn prohibited(mut self, prohibited: bool) -> Self {
        self.prohibited = prohibited;
        self
    }

    /// Stream priorities, numerically `greatest <= least`.
    pub fn stream_priority_range(mut self, least: i32, greatest: i32) -> Self {
        self.least_priority = least;
        self.greatest_priority = greatest;
        self
    }

    /// Reports [`UNBOUNDED_PRIORITY`] as the least stream priority.
    pub fn unbounded_priorities(mut self) -> Self {
        self.least_priority = UNBOUNDED_PRIORITY;
        self
    }

    /// Initial value of a resource limit in freshly created contexts.
    pub fn default_limit(mut self, code: u32, value: usize) -> Self {
        if let Some(slot) = self.default_limits.get_mut(code as usize) {
            *slot = value;
        }
        self
    }

    /// Values above this are rejected by `ctx_set_limit` with `InvalidValue`.
    pub fn limit_ceiling(mut self, ceiling: usize) -> Self {
        self.limit_ceiling = ceiling;
        self
    }

    /// Whether the shared memory bank size can be changed. When it can't, writes are accepted
    /// and ignored and reads report four byte banks.
    pub fn configurable_banks(mut self, configurable: bool) -> Self {
        self.configurable_banks = configurable;
        self
    }

    /// Flags the primary context starts with. Unknown bits are dropped, and when several
    /// scheduling bits are given only the lowest one is kept.
    pub fn primary_flags(mut self, flags: u32) -> Self {
        let sched = flags & ctx_flags::SCHED_MASK;
        let sched = sched & sched.wrapping_neg();
        self.primary_flags = (flags & ctx_flags::FLAGS_MASK & !ctx_flags::SCHED_MASK) | sched;
        self
    }
}

/// The whole simulated platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimConfig {
    pub(crate) devices: Vec<SimDeviceSpec>,
    pub(crate) driver_version: i32,
    pub(crate) api_version: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::with_devices(1)
    }
}

impl SimConfig {
    /// A platform without any device.
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            driver_version: DEFAULT_DRIVER_VERSION,
            api_version: DEFAULT_API_VERSION,
        }
    }

    /// A platform with `count` identical default devices.
    pub fn with_devices(count: usize) -> Self {
        let mut config = Self::empty();
        for ordinal in 0..count {
            config
                .devices
                .push(SimDeviceSpec::new(format!("Simulated Device {ordinal}")));
        }
        config
    }

    /// Builds a configuration from `DEVCTX_SIM_DEVICES` and `DEVCTX_SIM_DRIVER_VERSION`,
    /// falling back to a single device and the default version.
    pub fn from_env() -> Self {
        let count = read_env(DEVICES_ENV).unwrap_or(1usize);
        let mut config = Self::with_devices(count);
        if let Some(version) = read_env(DRIVER_VERSION_ENV) {
            config.driver_version = version;
        }
        config
    }

    /// Appends a device; it gets the next ordinal.
    pub fn device(mut self, spec: SimDeviceSpec) -> Self {
        self.devices.push(spec);
        self
    }

    /// Version reported by `driver_get_version`, encoded as `1000 * major + 10 * minor`.
    pub fn driver_version(mut self, version: i32) -> Self {
        self.driver_version = version;
        self
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "ignoring unparsable environment value");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_has_one_device() {
        let config = SimConfig::default();
        assert_eq!(config.device_count(), 1);
        assert_eq!(config.devices[0].name, "Simulated Device 0");
        assert_eq!(config.driver_version, DEFAULT_DRIVER_VERSION);
    }

    #[test]
    fn test_default_limit_ignores_unknown_code() {
        let spec = SimDeviceSpec::new("dev")
            .default_limit(limit::PRINTF_FIFO_SIZE, 4096)
            .default_limit(42, 1);
        assert_eq!(spec.default_limits[limit::PRINTF_FIFO_SIZE as usize], 4096);
    }

    #[test]
    fn test_primary_flags_are_masked() {
        let spec = SimDeviceSpec::new("dev").primary_flags(0xff);
        assert_eq!(
            spec.primary_flags,
            ctx_flags::SCHED_SPIN | ctx_flags::MAP_HOST | ctx_flags::LMEM_RESIZE_TO_MAX
        );
        assert_eq!(super::super::check_flags(spec.primary_flags), Ok(()));
    }

    #[test]
    fn test_primary_flags_keep_single_policy() {
        let spec = SimDeviceSpec::new("dev")
            .primary_flags(ctx_flags::SCHED_YIELD | ctx_flags::SCHED_BLOCKING_SYNC);
        assert_eq!(spec.primary_flags, ctx_flags::SCHED_YIELD);

        let spec = SimDeviceSpec::new("dev")
            .primary_flags(ctx_flags::SCHED_BLOCKING_SYNC | ctx_flags::MAP_HOST);
        assert_eq!(
            spec.primary_flags,
            ctx_flags::SCHED_BLOCKING_SYNC | ctx_flags::MAP_HOST
        );
    }
}
