//! Declarative configuration of the lifecycle layers.
//!
//! Every section is optional. Durations are human readable (`"150ms"`, `"2s"`,
//! `"1m 30s"`) and body ceilings accept a [`ByteSize`] string or a byte count:
//!
//! ```toml
//! [throttle]
//! concurrency = 64
//!
//! [runtime]
//! min = "100ms"
//! max = "30s"
//!
//! [limit]
//! ceiling = "4MiB"
//! ```

use std::num::NonZeroUsize;
use std::time::Duration;

use http::Request;
use serde::Deserialize;
use serde::Serialize;
use serve_limit::ByteSize;

use crate::LimitLayer;
use crate::ProtectLayer;
use crate::RuntimeLayer;
use crate::ThrottleLayer;
use crate::TimeoutLayer;
use crate::compose::Stage;

/// A configuration that cannot produce working layers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("throttle concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("runtime min ({min:?}) must not exceed max ({max:?})")]
    MinExceedsMax { min: Duration, max: Duration },
    #[error("protect rate must be at least 1")]
    ZeroRate,
    #[error("protect period must not be zero")]
    ZeroPeriod,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protect: Option<ProtectConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    pub concurrency: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(with = "duration_str")]
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(with = "duration_str", default)]
    pub min: Duration,
    #[serde(with = "duration_str")]
    pub max: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    pub ceiling: ByteSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtectConfig {
    pub rate: usize,
    #[serde(with = "duration_str")]
    pub period: Duration,
}

impl ServeConfig {
    /// Check every present section.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(throttle) = &self.throttle {
            throttle.layer()?;
        }
        if let Some(runtime) = &self.runtime {
            runtime.layer()?;
        }
        if let Some(protect) = &self.protect {
            protect.validate()?;
        }
        Ok(())
    }

    /// The configured stages in the order requests pass through them: protect,
    /// timeout, runtime, throttle.
    ///
    /// The body limit changes the request body type, so it is not a stage; apply
    /// [`LimitConfig::layer`] around the composed handler instead.
    ///
    /// # Errors
    ///
    /// Fails like [`ServeConfig::validate`].
    pub fn stages<B, Res>(&self) -> Result<Vec<Stage<Request<B>, Res>>, ConfigError>
    where
        B: Send + 'static,
        Res: Send + 'static,
    {
        let mut stages = Vec::new();
        if let Some(protect) = &self.protect {
            stages.push(Stage::layer(protect.layer()?));
        }
        if let Some(timeout) = &self.timeout {
            stages.push(Stage::layer(timeout.layer()));
        }
        if let Some(runtime) = &self.runtime {
            stages.push(Stage::layer(runtime.layer()?));
        }
        if let Some(throttle) = &self.throttle {
            stages.push(Stage::layer(throttle.layer()?));
        }
        Ok(stages)
    }
}

impl ThrottleConfig {
    pub fn layer(&self) -> Result<ThrottleLayer, ConfigError> {
        let concurrency = NonZeroUsize::new(self.concurrency).ok_or(ConfigError::ZeroConcurrency)?;
        Ok(ThrottleLayer::new(concurrency))
    }
}

impl TimeoutConfig {
    pub fn layer(&self) -> TimeoutLayer {
        TimeoutLayer::new(self.duration)
    }
}

impl RuntimeConfig {
    pub fn layer(&self) -> Result<RuntimeLayer, ConfigError> {
        RuntimeLayer::new(self.min, self.max)
    }
}

impl LimitConfig {
    pub fn layer(&self) -> LimitLayer {
        LimitLayer::new(self.ceiling)
    }
}

impl ProtectConfig {
    fn validate(&self) -> Result<NonZeroUsize, ConfigError> {
        let rate = NonZeroUsize::new(self.rate).ok_or(ConfigError::ZeroRate)?;
        if self.period.is_zero() {
            return Err(ConfigError::ZeroPeriod);
        }
        Ok(rate)
    }

    pub fn layer(&self) -> Result<ProtectLayer, ConfigError> {
        let rate = self.validate()?;
        Ok(ProtectLayer::new(rate, self.period))
    }
}

/// Serde adapter for durations written as `humantime` strings.
mod duration_str {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use serde::de::Error;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }
}
