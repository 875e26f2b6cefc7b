//! Container engine drivers
//!
//! The bridge talks to the container engine through the [`ContainerEngine`]
//! trait. Two drivers are provided: a library driver speaking the engine API
//! directly and a CLI driver shelling out to the docker binary.

mod cli;
mod docker;
mod traits;

pub use cli::CliEngine;
pub use docker::DockerEngine;
pub use traits::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult,
    DEBUG_PORT,
};
