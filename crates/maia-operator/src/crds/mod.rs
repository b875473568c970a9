pub mod common;
pub mod instance;
pub mod tenant;

pub use instance::{MaiaInstance, MaiaInstanceSpec, MaiaInstanceStatus};
pub use tenant::{MaiaTenant, MaiaTenantSpec, MaiaTenantStatus};
