//! Membership view and lowest-id leader election

pub mod election;
pub mod view;

pub use election::{Membership, Outcome, RoleChange};
pub use view::{MembershipView, Peer};
