pub mod auth;
pub mod control_group;
pub mod identity;
pub mod lease;
pub mod lockout;
pub mod mfa;
pub mod request;
pub mod response;

pub use auth::{AliasInfo, Auth};
pub use control_group::{Approval, ControlGroupMarker, ControlGroupRequest, ControlGroupStatus};
pub use identity::{Alias, AliasCreation, AliasKey, Entity};
pub use lease::{Lease, TokenEntry};
pub use lockout::{FailedLoginInfo, FailedLoginUser};
pub use mfa::{MfaCachedAuthResponse, RequestFingerprint};
pub use request::{ConnectionInfo, Operation, ReplicationState, Request};
pub use response::{ControlGroupPending, Response, SecretLease};
