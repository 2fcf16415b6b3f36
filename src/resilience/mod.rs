pub mod circuit_breaker;
pub mod fallback;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
pub use fallback::{
    FallbackAttempt, FallbackChain, FallbackOptions, FallbackOutcome, FallbackSuccess, SpecialistExecutor,
};
