//! Agora: a discrete-time, agent-based economic simulation kernel.
//!
//! The crate hosts a population of heterogeneous members (agents, goods,
//! markets, and auxiliary optimizer objects) that interact across discrete
//! periods through a fixed multi-phase update protocol:
//!
//! - [`sim::Simulation`] keeps the live membership set (stable unique ids,
//!   dependency-cascaded removal) and runs each period as a sequence of
//!   optimization stages dispatched in priority order across a worker pool.
//! - [`lock::MemberLock`] is the composable shared/exclusive multi-member
//!   lock members use to safely mutate each other during a stage, with a
//!   deadlock-free acquisition algorithm.
//! - [`bundle`] provides exact multi-good quantity containers with
//!   two-level sign discipline, nestable transactions, and approximate
//!   atomic transfer.
//! - [`belief`] provides the Bayesian linear regression beliefs (plain and
//!   inequality-restricted) agents use to form expectations, including the
//!   Gibbs/rejection samplers over the restricted posterior.
//!
//! Concrete market-clearing algorithms, production and utility functions,
//! and persistence formats are left to downstream models.

pub mod belief;
pub mod bundle;
pub mod error;
pub mod good;
pub mod id;
pub mod lock;
pub mod member;
pub mod random;
pub mod sim;

pub use belief::{BayesianLinear, BayesianLinearRestricted, DrawMode};
pub use bundle::{Bundle, BundleSigned, DEFAULT_TRANSFER_EPSILON};
pub use error::{Error, Result};
pub use good::Good;
pub use id::{GoodId, MemberId};
pub use lock::MemberLock;
pub use member::{Member, MemberClass, MemberCore, MemberHandle};
pub use sim::scheduler::{Stage, Subscription};
pub use sim::Simulation;
