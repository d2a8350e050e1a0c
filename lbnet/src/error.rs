//! Crate-wide error type returned by the control API.

use crate::counter::CounterError;
use crate::dp::DatapathError;
use crate::fdb::FdbError;
use crate::l3::L3Error;
use crate::mirror::MirrorError;
use crate::neighbor::NeighError;
use crate::policer::PolicerError;
use crate::port::PortError;
use crate::route::RouteError;
use crate::rules::RuleError;
use crate::session::SessionError;
use crate::vlan::VlanError;
use crate::xsync::XsyncError;
use crate::zone::ZoneError;
use thiserror::Error;

/// Any table error, tagged with the table it came from.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Vlan(#[from] VlanError),

    #[error(transparent)]
    Fdb(#[from] FdbError),

    #[error(transparent)]
    L3(#[from] L3Error),

    #[error(transparent)]
    Neigh(#[from] NeighError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Policer(#[from] PolicerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error(transparent)]
    Datapath(#[from] DatapathError),

    #[error(transparent)]
    Xsync(#[from] XsyncError),

    /// Malformed request that never reached a table.
    #[error("invalid argument: {0}")]
    Args(String),
}

impl NetError {
    /// Integer result code of the error.
    pub fn code(&self) -> i32 {
        match self {
            NetError::Counter(_) => -10,
            NetError::Port(e) => e.code(),
            NetError::Vlan(e) => e.code(),
            NetError::Fdb(e) => e.code(),
            NetError::L3(e) => e.code(),
            NetError::Neigh(e) => e.code(),
            NetError::Route(e) => e.code(),
            NetError::Rule(e) => e.code(),
            NetError::Mirror(e) => e.code(),
            NetError::Policer(e) => e.code(),
            NetError::Session(e) => e.code(),
            NetError::Zone(e) => e.code(),
            NetError::Datapath(e) => e.code(),
            NetError::Xsync(e) => e.code(),
            NetError::Args(_) => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_pass_through() {
        let e: NetError = RuleError::Exists("k".into()).into();
        assert_eq!(e.code(), -8003);
        let e: NetError = MirrorError::NotExist("m".into()).into();
        assert_eq!(e.code(), -101003);
        let e: NetError = PolicerError::Info("p".into()).into();
        assert_eq!(e.code(), -100001);
        assert_eq!(NetError::Args("x".into()).code(), -1);
    }

    #[test]
    fn test_message_is_transparent() {
        let e: NetError = RuleError::NotExists("k".into()).into();
        assert_eq!(e.to_string(), "rule k does not exist");
    }
}
