pub mod breaker;
pub mod channel;
pub mod governor;
pub mod pool;
pub mod session;
pub mod throttle;

pub use breaker::{CircuitBreaker, CircuitState};
pub use channel::{ChannelManager, ChannelRuntime, ChannelStatus, RuntimeDeps, TS_PACKET};
pub use governor::{Decision, RestartCause, RestartGovernor};
pub use pool::{AcquireError, PoolLease, PoolStats, ProcessPool};
pub use session::{SessionManager, SessionRejection};
pub use throttle::Throttler;
