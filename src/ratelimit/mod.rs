//! Rate limiting logic.

mod identity;
mod limiter;
mod rules;

pub use identity::{Identity, ADDRESS_PREFIX, TOKEN_PREFIX};
pub use limiter::{Policy, RateLimiter, WINDOW};
pub use rules::PolicyRules;
