//! Typed work items for the forwarding engine.

use super::{CtInfo, DpMap, DpWorkOp, SyncTarget};
use crate::model::{MacAddr, PortProp, TunnelType};
use crossbeam_channel::Sender;
use ipnet::IpNet;
use std::net::IpAddr;

/// One queued request.
#[derive(Debug, Clone)]
pub struct DpWork {
    pub op: DpWorkOp,
    /// Mark of the owning zone, used to route the completion back.
    pub zone: u32,
    /// Object whose `sync` status receives the outcome.
    pub target: Option<SyncTarget>,
    pub kind: DpWorkKind,
}

impl DpWork {
    pub fn new(op: DpWorkOp, zone: u32, target: Option<SyncTarget>, kind: DpWorkKind) -> Self {
        Self {
            op,
            zone,
            target,
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DpWorkKind {
    Port(PortDpWork),
    L2Addr(L2AddrDpWork),
    RouterMac(RouterMacDpWork),
    NextHop(NextHopDpWork),
    Route(RouteDpWork),
    NatLb(NatDpWork),
    Fw(FwDpWork),
    Pol(PolDpWork),
    Mirr(MirrDpWork),
    UlCl(UlClDpWork),
    Stat(StatDpWork),
    Table(TableDpWork),
}

impl DpWorkKind {
    pub fn name(&self) -> &'static str {
        match self {
            DpWorkKind::Port(_) => "port",
            DpWorkKind::L2Addr(_) => "l2addr",
            DpWorkKind::RouterMac(_) => "rmac",
            DpWorkKind::NextHop(_) => "nexthop",
            DpWorkKind::Route(_) => "route",
            DpWorkKind::NatLb(_) => "nat",
            DpWorkKind::Fw(_) => "fw",
            DpWorkKind::Pol(_) => "pol",
            DpWorkKind::Mirr(_) => "mirr",
            DpWorkKind::UlCl(_) => "ulcl",
            DpWorkKind::Stat(_) => "stat",
            DpWorkKind::Table(_) => "table",
        }
    }
}

/// Port attachment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortDpWork {
    pub os_port_num: i32,
    pub port_num: u32,
    pub ing_vlan: u32,
    pub set_bd: u32,
    pub set_zone_num: u32,
    pub prop: PortProp,
    pub set_mirr: u32,
    pub set_pol: u32,
    /// Interface to (un)load the forwarding program on.
    pub load_ebpf: Option<String>,
}

/// L2 forwarding entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2AddrDpWork {
    pub l2_addr: MacAddr,
    pub tun: Option<TunnelType>,
    pub nh_num: u32,
    pub port_num: u32,
    pub bd: u32,
    pub tagged: bool,
}

/// Router MAC, optionally terminating a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterMacDpWork {
    pub l2_addr: MacAddr,
    pub port_num: u32,
    pub bd: u32,
    pub tun_id: u32,
    pub tun_type: Option<TunnelType>,
    pub nh_num: u32,
}

/// Next hop, either a plain neighbor or a tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopDpWork {
    pub tun_nh: bool,
    pub tun_id: u32,
    pub tun_type: Option<TunnelType>,
    pub rip: Option<IpAddr>,
    pub sip: Option<IpAddr>,
    /// Next hop that actually carries the traffic of a recursive neighbor.
    pub nnh_num: u32,
    pub nh_num: u32,
    pub resolved: bool,
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub bd: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDpWork {
    pub zone_num: u32,
    pub dst: IpNet,
    pub rt_type: u32,
    pub rt_mark: u32,
    pub nh_marks: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Snat = 1,
    Dnat = 2,
    FullNat = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatSel {
    Rr = 1,
    Hash = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEp {
    pub xip: IpAddr,
    pub rip: IpAddr,
    pub xport: u16,
    pub weight: u8,
    pub inactive: bool,
}

/// Load-balancer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDpWork {
    pub zone_num: u32,
    pub service_ip: IpAddr,
    pub l4_port: u16,
    pub block: u16,
    pub dsr: bool,
    pub proto: u8,
    pub mark: u32,
    pub nat_type: NatType,
    pub ep_sel: NatSel,
    pub inact_timeout: u32,
    pub endpoints: Vec<NatEp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwType {
    Drop = 1,
    Fwd = 2,
    Rdr = 3,
    Trap = 4,
}

/// Firewall entry. `None` prefixes match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwDpWork {
    pub zone_num: u32,
    pub src: Option<IpNet>,
    pub dst: Option<IpNet>,
    pub l4_src_min: u16,
    pub l4_src_max: u16,
    pub l4_dst_min: u16,
    pub l4_dst_max: u16,
    pub port: u32,
    pub pref: u16,
    pub proto: u8,
    pub mark: u32,
    pub fw_type: FwType,
    pub fw_val1: u32,
    pub fw_val2: u32,
    pub record: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolDpWork {
    pub name: String,
    pub mark: u32,
    pub cir: u64,
    pub pir: u64,
    pub cbs: u64,
    pub ebs: u64,
    pub color_aware: bool,
    pub block_on_red: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrDpWork {
    pub name: String,
    pub mark: u32,
    pub mi_port_num: u32,
    pub mi_bd: u32,
}

/// Uplink/downlink classifier for GTP sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UlClDpWork {
    pub mdip: IpAddr,
    pub msip: IpAddr,
    pub mteid: u32,
    pub zone: u32,
    pub qfi: u8,
    pub mark: u32,
    pub tdip: IpAddr,
    pub tsip: IpAddr,
    pub tteid: u32,
    pub uplink: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatDpWork {
    pub map: DpMap,
    pub mark: u32,
}

/// Table dump; the result is sent on `reply` when present.
#[derive(Debug, Clone)]
pub struct TableDpWork {
    pub map: DpMap,
    pub reply: Option<Sender<Vec<CtInfo>>>,
}
