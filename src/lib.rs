//! MirrorSentry - Git mirror reconciliation service
//!
//! MirrorSentry keeps a directory of bare git mirrors in step with a
//! desired-state list of repositories and publishes every ready mirror
//! through a supervised `git daemon`.
//!
//! ## Core Features
//!
//! - **Reconciliation passes**: an incremental pass creates mirrors for newly
//!   desired repositories, a full pass fetches into every existing mirror
//! - **Per-repository leases**: overlapping passes and ad-hoc requests never
//!   operate on the same mirror at once
//! - **Export supervision**: one `git daemon` serving marker-bearing mirrors
//! - **Ad-hoc trigger**: `POST /mirrors/<url>` creates a mirror on demand
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`store`]: Persistent mirror state records
//! - [`lifecycle`]: Create/update operations on a single mirror
//! - [`engine`]: Lease-guarded reconciliation passes
//! - [`scheduler`]: Periodic pass driver
//! - [`supervisor`]: Export daemon process supervision

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod git;
pub mod health;
pub mod http;
pub mod lease;
pub mod lifecycle;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use daemon::Service;
pub use engine::{MirrorEngine, PassKind, PassSummary, ReconcileOutcome};
pub use error::{MirrorError, MirrorResult};
pub use gateway::{DesiredStateGateway, MemoryGateway, RepositoryDescriptor, SqliteGateway};
pub use git::{GitCli, Vcs};
pub use health::HealthCheck;
pub use lease::LeaseTable;
pub use lifecycle::{ExportAddress, MirrorAction, MirrorManager, MirrorOutcome};
pub use scheduler::Scheduler;
pub use store::{MirrorRecord, MirrorState, MirrorStore};
pub use supervisor::{DaemonCommand, DaemonState, ExportSupervisor};
