//! Address management core
//!
//! Provides:
//! - CIDR range handling
//! - Static and dynamic reservation tables
//! - The IPPool model and its wire form
//! - The allocator resolving concurrent allocations against a versioned store

pub mod allocator;
pub mod pool;
pub mod range;
pub mod reservation;
pub mod resource;

pub use allocator::{Allocation, Allocator, AllocatorOptions};
pub use pool::Pool;
pub use resource::PoolResource;
