//! VM Runtime Client
//!
//! Client for the node agent that performs VM power operations.
//! The controller only depends on the [`RuntimeDriver`] trait; the HTTP
//! implementation talks to the agent's REST API and the mock (feature
//! `test-util`) keeps VM states in memory.
//!
//! # Example
//!
//! ```no_run
//! use vm_runtime_client::{HttpRuntimeDriver, RuntimeDriver, VmIdentity};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = HttpRuntimeDriver::new("http://vm-runtime:8080".to_string(), None)?;
//! let vm = VmIdentity::new("default", "builder", "ubuntu:24.04");
//!
//! driver.power_on(&vm).await?;
//! let state = driver.query_state(&vm).await?;
//! println!("{} is {:?}", vm, state);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod driver_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::HttpRuntimeDriver;
pub use driver_trait::RuntimeDriver;
pub use error::RuntimeError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{DriverCall, MockRuntimeDriver};
