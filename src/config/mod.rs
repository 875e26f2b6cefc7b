//! Configuration module

mod config;

pub use config::{
    parse_cpu_string, parse_duration_string, parse_memory_string, Configuration,
    ContainerConfiguration, DeployConfiguration, EngineConfiguration, EngineDriver,
    PoolConfiguration, SessionConfiguration,
};
