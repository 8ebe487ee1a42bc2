//! Test support: scripted in-memory bus, fake command executor, and
//! fixture builders. Used by unit tests and the integration scenarios.

pub mod exec;
pub mod fixtures;
pub mod mock_bus;

#[cfg(test)]
pub mod temp;
