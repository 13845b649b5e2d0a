//! # stampede
//!
//! A staged, concurrency-ramping load-test engine for HTTP targets.
//!
//! The engine is organized leaves-first:
//!
//! - [`clock`] -- monotonic run clock driving stage transitions and pacing
//! - [`stage`] -- linear stage interpolation for VU counts and arrival rates
//! - [`metrics`] -- concurrent sample aggregation with approximate percentiles
//! - [`threshold`] -- pass/fail expressions such as `p(99) < 1500`
//! - [`pool`] -- the virtual-user pool shared by every scenario of a run
//! - [`executor`] -- the six scheduling strategies (`constant-vus`,
//!   `ramping-vus`, `shared-iterations`, `per-vu-iterations`,
//!   `constant-arrival-rate`, `ramping-arrival-rate`)
//! - [`runner`] -- runs named scenarios in parallel and produces a [`RunResult`]
//!
//! Configuration lives in [`config`], HTTP plumbing in [`http`], and the
//! per-iteration API handed to user code in [`vu`]. [`script`] runs
//! requests declared in the config, and [`summary`] renders the end-of-run
//! report.
//!
//! # Example
//!
//! ```no_run
//! use stampede::config::LoadTestConfig;
//! use stampede::runner::ScenarioRunner;
//! use stampede::vu::VuContext;
//! use stampede::error::IterationError;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadTestConfig::from_toml(
//!     r#"
//!     [[stages]]
//!     duration = "30s"
//!     target = 10
//!
//!     [thresholds]
//!     http_req_duration = ["p(99) < 1500"]
//!     "#,
//! )?;
//!
//! let runner = ScenarioRunner::new(config.plan()?, |vu: VuContext| async move {
//!     let res = vu.get("https://test.k6.io").await?;
//!     vu.check("status was 200", res.status == 200);
//!     vu.sleep(std::time::Duration::from_secs(1)).await;
//!     Ok::<(), IterationError>(())
//! });
//! let result = runner.run().await?;
//! std::process::exit(result.exit_code());
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod durations;
pub mod error;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod script;
pub mod stage;
pub mod summary;
pub mod threshold;
pub mod vu;

pub use config::{LoadTestConfig, RunPlan};
pub use error::{HttpError, IterationError, LoadTestError, PoolError};
pub use runner::{RunResult, ScenarioRunner};
pub use vu::VuContext;
