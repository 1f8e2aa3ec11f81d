//! RPC plumbing: the endpoint pool and network fee sampling.

pub mod gas;
pub mod pool;

pub use gas::{GasSampler, GasSource};
pub use pool::{Endpoint, EndpointHandle, EndpointPool, HealthCheck, PoolOptions};
