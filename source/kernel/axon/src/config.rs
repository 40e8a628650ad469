// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time sizing of the emulated machine
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, ConfigError
//! INVARIANTS: Non-zero frame pool; env slots addressable by the EnvId index bits

use core::fmt;

use axon_abi::MAX_ENV_SLOTS;

/// Default number of physical frames (4 MiB of emulated RAM).
pub const DEFAULT_FRAMES: usize = 1024;
/// Default number of environment slots.
pub const DEFAULT_MAX_ENVS: usize = 64;

/// Sizing parameters for a [`crate::Kernel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames in the pool, including those used for paging structures.
    pub frames: usize,
    /// Environment slots in the registry.
    pub max_envs: usize,
}

/// Rejected configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The frame pool would be empty.
    NoFrames,
    /// The environment registry would be empty.
    NoEnvSlots,
    /// More slots than an environment id can index.
    TooManyEnvs { requested: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFrames => f.write_str("frame pool must not be empty"),
            Self::NoEnvSlots => f.write_str("at least one environment slot is required"),
            Self::TooManyEnvs { requested, max } => {
                write!(f, "{requested} environment slots requested, ids address at most {max}")
            }
        }
    }
}

impl KernelConfig {
    /// Creates a configuration with explicit sizes.
    pub const fn new(frames: usize, max_envs: usize) -> Self {
        Self { frames, max_envs }
    }

    /// Replaces the frame count.
    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Replaces the environment slot count.
    pub const fn with_max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs;
        self
    }

    /// Checks the configuration before the kernel is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.max_envs == 0 {
            return Err(ConfigError::NoEnvSlots);
        }
        if self.max_envs > MAX_ENV_SLOTS {
            return Err(ConfigError::TooManyEnvs {
                requested: self.max_envs,
                max: MAX_ENV_SLOTS,
            });
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMES, DEFAULT_MAX_ENVS)
    }
}
