pub mod v2;

pub use v2::{registry_router, RequestContext};
