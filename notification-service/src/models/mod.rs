pub mod audit;
pub mod circuit_breaker;
pub mod health;
pub mod message;
pub mod provider;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
