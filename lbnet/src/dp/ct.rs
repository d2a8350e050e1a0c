//! Connection-tracking records exchanged with the datapath and cluster peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// One connection-tracking entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtInfo {
    pub dip: IpAddr,
    pub sip: IpAddr,
    pub dport: u16,
    pub sport: u16,
    pub proto: String,
    pub cstate: String,
    pub cact: String,
    pub ci: String,
    pub packets: u64,
    pub bytes: u64,
    pub deleted: bool,
    #[serde(default)]
    pub pkey: Vec<u8>,
    #[serde(default)]
    pub pval: Vec<u8>,
    #[serde(default)]
    pub xsync: bool,
    pub service_ip: IpAddr,
    pub serv_proto: String,
    pub l4_serv_port: u16,
    pub block_num: u16,
}

impl Default for CtInfo {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            dip: any,
            sip: any,
            dport: 0,
            sport: 0,
            proto: String::new(),
            cstate: String::new(),
            cact: String::new(),
            ci: String::new(),
            packets: 0,
            bytes: 0,
            deleted: false,
            pkey: Vec::new(),
            pval: Vec::new(),
            xsync: false,
            service_ip: any,
            serv_proto: String::new(),
            l4_serv_port: 0,
            block_num: 0,
        }
    }
}

impl CtInfo {
    /// Flow identity: addresses, ports and protocol.
    pub fn key(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.dip, self.sip, self.dport, self.sport, self.proto
        )
    }
}

impl fmt::Display for CtInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{} ({}), {}:{} [{}:{}]",
            self.sip,
            self.sport,
            self.dip,
            self.dport,
            self.proto,
            self.cstate,
            self.cact,
            self.packets,
            self.bytes
        )
    }
}
