use crate::device::CompletionHandle;
use crate::environment::Environment;
use crate::errors::{Error, FatalPolicy};
use crate::host::HostRuntime;
use std::convert::TryFrom;
use std::sync::Arc;

/// Environment variable holding the polling period, in microseconds.
pub const POLLING_FREQUENCY_ENV: &str = "TASKAWARE_POLLING_FREQUENCY";

/// Environment variable selecting the polling service backend over polling
/// tasks.
pub const POLLING_SERVICES_ENV: &str = "TASKAWARE_POLLING_SERVICES";

/// Default polling period in microseconds.
const POLLING_FREQUENCY_US: u64 = 500;

/// Slots in the ingestion channel. Large enough to absorb submission bursts
/// from every worker between two polling ticks.
const INGESTION_CAPACITY: usize = 63 * 1024;

const POLLING_NAME: &str = "taskaware";

#[derive(Debug, Clone)]
pub struct Builder {
    /// Period between two invocations of the polling callback. Only honored
    /// by the polling task backend, polling services are timed by the host.
    polling_frequency_us: u64,

    /// Prefer the host's polling services. Forced to true at startup if the
    /// host cannot spawn and pause polling tasks.
    polling_services: bool,

    /// Capacity of the bounded ingestion channel.
    ingestion_capacity: usize,

    /// Whether the `Unreported` completion status counts as still pending.
    /// Some device runtimes transiently report this value for in-flight work.
    unreported_is_pending: bool,

    /// What to do when a runtime invariant is violated. Aborts by default.
    on_fatal: FatalPolicy,

    /// Name of the polling instance registered with the host.
    polling_name: String,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            polling_frequency_us: POLLING_FREQUENCY_US,
            polling_services: false,
            ingestion_capacity: INGESTION_CAPACITY,
            unreported_is_pending: true,
            on_fatal: FatalPolicy::default(),
            polling_name: POLLING_NAME.to_string(),
        }
    }

    /// Returns a builder initialized from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Returns a builder initialized from an arbitrary key lookup. Unset keys
    /// keep their default value.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::new();

        if let Some(raw) = lookup(POLLING_FREQUENCY_ENV) {
            let frequency = raw.trim().parse::<u64>().map_err(|e| {
                Error::invalid_config(POLLING_FREQUENCY_ENV, format!("{:?}: {}", raw, e))
            })?;

            if frequency == 0 {
                return Err(Error::invalid_config(
                    POLLING_FREQUENCY_ENV,
                    "must be greater than 0",
                ));
            }

            builder.polling_frequency_us = frequency;
        }

        if let Some(raw) = lookup(POLLING_SERVICES_ENV) {
            builder.polling_services = parse_bool(POLLING_SERVICES_ENV, &raw)?;
        }

        Ok(builder)
    }

    #[track_caller]
    pub fn polling_frequency_us(mut self, val: u64) -> Self {
        assert!(val > 0, "polling_frequency_us must be greater than 0");
        self.polling_frequency_us = val;
        self
    }

    pub fn polling_services(mut self, val: bool) -> Self {
        self.polling_services = val;
        self
    }

    #[track_caller]
    pub fn ingestion_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "ingestion_capacity must be greater than 0");
        self.ingestion_capacity = val;
        self
    }

    pub fn unreported_is_pending(mut self, val: bool) -> Self {
        self.unreported_is_pending = val;
        self
    }

    pub fn on_fatal(mut self, policy: FatalPolicy) -> Self {
        self.on_fatal = policy;
        self
    }

    #[track_caller]
    pub fn polling_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        assert!(!val.is_empty(), "polling_name must not be empty");
        self.polling_name = val;
        self
    }

    /// Creates the configured [`Environment`] on top of `host`.
    ///
    /// Fails if the host lacks the capabilities needed by the polling
    /// backend. The returned environment is already polling.
    pub fn try_build<H: CompletionHandle>(
        self,
        host: Arc<dyn HostRuntime>,
    ) -> Result<Environment<H>, Error> {
        let cfg = Config::try_from(self)?;
        Environment::try_new(cfg, host)
    }
}

/// Validated, immutable configuration shared by every component of an
/// [`Environment`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) polling_frequency_us: u64,
    pub(crate) polling_services: bool,
    pub(crate) ingestion_capacity: usize,
    pub(crate) unreported_is_pending: bool,
    pub(crate) on_fatal: FatalPolicy,
    pub(crate) polling_name: String,
}

impl Config {
    pub fn polling_frequency_us(&self) -> u64 {
        self.polling_frequency_us
    }

    pub fn polling_services(&self) -> bool {
        self.polling_services
    }

    pub fn ingestion_capacity(&self) -> usize {
        self.ingestion_capacity
    }

    pub fn unreported_is_pending(&self) -> bool {
        self.unreported_is_pending
    }

    pub fn on_fatal(&self) -> FatalPolicy {
        self.on_fatal
    }

    pub fn polling_name(&self) -> &str {
        &self.polling_name
    }

    fn validate(&self) -> Result<(), Error> {
        if self.polling_frequency_us == 0 {
            return Err(Error::invalid_config(
                "polling_frequency_us",
                "must be greater than 0",
            ));
        }

        if self.ingestion_capacity == 0 {
            return Err(Error::invalid_config(
                "ingestion_capacity",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_frequency_us: POLLING_FREQUENCY_US,
            polling_services: false,
            ingestion_capacity: INGESTION_CAPACITY,
            unreported_is_pending: true,
            on_fatal: FatalPolicy::default(),
            polling_name: POLLING_NAME.to_string(),
        }
    }
}

impl TryFrom<Builder> for Config {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = Config {
            polling_frequency_us: builder.polling_frequency_us,
            polling_services: builder.polling_services,
            ingestion_capacity: builder.ingestion_capacity,
            unreported_is_pending: builder.unreported_is_pending,
            on_fatal: builder.on_fatal,
            polling_name: builder.polling_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, Error> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::invalid_config(
            key,
            format!("expected a boolean, got {:?}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::collections::HashMap;

    assert_impl_all!(Config: Send, Sync, Clone);

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();

        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let cfg = Config::try_from(Builder::new())?;

        assert_eq!(cfg.polling_frequency_us(), 500);
        assert!(!cfg.polling_services());
        assert_eq!(cfg.ingestion_capacity(), 63 * 1024);
        assert!(cfg.unreported_is_pending());
        assert_eq!(cfg.on_fatal(), FatalPolicy::Abort);
        assert_eq!(cfg.polling_name(), "taskaware");

        Ok(())
    }

    #[test]
    fn test_from_env_unset_keeps_defaults() -> Result<()> {
        let cfg = Config::try_from(Builder::from_env_with(lookup(&[]))?)?;

        assert_eq!(cfg.polling_frequency_us(), 500);
        assert!(!cfg.polling_services());
        assert_eq!(cfg.on_fatal(), FatalPolicy::Abort);
        assert_eq!(Config::default().on_fatal(), FatalPolicy::Abort);

        Ok(())
    }

    #[rstest]
    #[case("1", true)]
    #[case("true", true)]
    #[case("YES", true)]
    #[case(" on ", true)]
    #[case("0", false)]
    #[case("False", false)]
    #[case("no", false)]
    #[case("off", false)]
    fn test_from_env_polling_services(#[case] raw: &str, #[case] expected: bool) -> Result<()> {
        let builder = Builder::from_env_with(lookup(&[(POLLING_SERVICES_ENV, raw)]))?;
        assert_eq!(Config::try_from(builder)?.polling_services(), expected);
        Ok(())
    }

    #[test]
    fn test_from_env_polling_frequency() -> Result<()> {
        let builder = Builder::from_env_with(lookup(&[(POLLING_FREQUENCY_ENV, "1000")]))?;
        assert_eq!(Config::try_from(builder)?.polling_frequency_us(), 1000);
        Ok(())
    }

    #[rstest]
    #[case(POLLING_FREQUENCY_ENV, "fast")]
    #[case(POLLING_FREQUENCY_ENV, "-5")]
    #[case(POLLING_FREQUENCY_ENV, "0")]
    #[case(POLLING_SERVICES_ENV, "maybe")]
    fn test_from_env_rejects_malformed(#[case] key: &str, #[case] raw: &str) {
        let res = Builder::from_env_with(lookup(&[(key, raw)]));
        assert!(matches!(res, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    #[should_panic(expected = "polling_frequency_us must be greater than 0")]
    fn test_builder_rejects_zero_frequency() {
        let _ = Builder::new().polling_frequency_us(0);
    }

    #[test]
    fn test_builder_overrides() -> Result<()> {
        let cfg = Config::try_from(
            Builder::new()
                .polling_frequency_us(50)
                .polling_services(true)
                .ingestion_capacity(8)
                .unreported_is_pending(false)
                .on_fatal(FatalPolicy::Panic)
                .polling_name("gpu"),
        )?;

        assert_eq!(cfg.polling_frequency_us(), 50);
        assert!(cfg.polling_services());
        assert_eq!(cfg.ingestion_capacity(), 8);
        assert!(!cfg.unreported_is_pending());
        assert_eq!(cfg.on_fatal(), FatalPolicy::Panic);
        assert_eq!(cfg.polling_name(), "gpu");

        Ok(())
    }
}
