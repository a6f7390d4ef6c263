//! Runtime services around the strategy engines

pub mod activation;
pub mod activity_log;
pub mod execution;
pub mod metrics;
pub mod order_errors;
pub mod price_feed;
pub mod retry;
pub mod supervisor;
pub mod worker;

pub use activation::ActivationService;
pub use activity_log::{ActivityAction, ActivityLog};
pub use execution::{OrderExecutor, OrderRequest, PaperExecutor};
pub use metrics::{Metrics, MetricsSnapshot};
pub use order_errors::ExecutionError;
pub use price_feed::{replay_file, PriceFeed};
pub use retry::{submit_with_retry, RetryPolicy, Submission};
pub use supervisor::{StartBotRequest, Supervisor};
