//! Container pool and runtime client.

mod container;
mod error;
mod pool;
mod runtime;

pub use container::{
    ContainerHandle, ContainerInfo, ContainerSpec, ContainerState, ContainerStatsSample,
    HealthState, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};
pub use pool::{
    AcquireOptions, ContainerPool, MANAGED_LABEL, PROFILE_LABEL, PoolConfig, PoolContainerView,
    PoolStats, ReleaseMode,
};
pub use runtime::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
