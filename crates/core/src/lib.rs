pub mod config;
pub mod envelope;
pub mod error;
pub mod paths;

pub use config::{
    AuditLogConfig, DomainsConfig, RateLimitConfig, SecurityConfig, SecurityUpdate,
    SensitiveActionsConfig,
};
pub use envelope::{ActionRequest, ActionResponse, Envelope};
pub use error::{BlockReason, Error, Result};
pub use paths::Paths;
