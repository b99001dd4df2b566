pub mod metrics;
pub mod optimizer;
pub mod ppo;
pub mod scheduler;
