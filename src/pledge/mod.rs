//! Pledge workflow: the custody state machine over warehouse receipts

pub mod model;
pub mod reconcile;
pub mod service;
pub mod transitions;

pub use model::{AcceptRequest, InitiateRequest, RejectRequest, ReleaseRequest};
pub use reconcile::ReconcileSummary;
pub use service::PledgeWorkflowService;
