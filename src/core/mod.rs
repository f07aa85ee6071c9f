// Core primitives: error model, record envelope, lock decisions, retry, pacing, schema glue.
pub mod error;
pub mod lock;
pub mod record;
pub mod retry;
pub mod schema;
pub mod throttle;
