//! Scripted compromise of a seeded AWS demo account: MFA takeover of a
//! devops user, resource enumeration, privilege escalation, GuardDuty and
//! CloudTrail suppression, then a drain-delete-ransom pass over S3 and
//! DynamoDB. Ships an offline in-memory rehearsal of the drain engine so
//! the state machine can be exercised without an account.

pub mod cleanup;
pub mod config;
pub mod drain;
pub mod enumerate;
pub mod error;
pub mod escalate;
pub mod loot;
pub mod mfa;
pub mod outputs;
pub mod scenario;
pub mod session;
pub mod suppress;
