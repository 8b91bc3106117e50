pub mod bridge;
pub mod gateway;
pub mod security_cmd;
pub mod status;
