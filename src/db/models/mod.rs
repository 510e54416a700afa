//! Database models split into domain-specific modules.

pub mod audit;
pub mod common;
pub mod credit;
pub mod image_description;
pub mod payment_request;
pub mod setting;
pub mod stats;
pub mod user;

pub use audit::*;
pub use common::*;
pub use credit::*;
pub use image_description::*;
pub use payment_request::*;
pub use setting::*;
pub use stats::*;
pub use user::*;
