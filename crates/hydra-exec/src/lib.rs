//! Request execution: per-provider executors plus the manager that drives
//! selection, breaker, retry and translation for every gateway call.

pub mod executor;
pub mod manager;
pub mod providers;
pub mod report;

pub use executor::{ExecContext, GatewayResponse, ProviderExecutor, StreamSender};
pub use manager::{ExecuteOptions, GatewayRequest, Manager, ManagerBuilder};
pub use report::{NoopReporter, RequestRecord, UsageReporter};
