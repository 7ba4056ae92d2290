pub mod circuit_breaker;
pub mod health;
pub mod providers;
pub mod queue;
pub mod rate_limiter;
pub mod rbmq;
pub mod redis;
pub mod template;
