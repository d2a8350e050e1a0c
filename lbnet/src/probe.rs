//! Endpoint health probes.
//!
//! A probe is a blocking socket exchange: TCP and SCTP probes connect, a UDP
//! probe waits for a port unreachable, and ping sends ICMP echo requests on a
//! raw socket. [`EpCheckers`] runs one tokio task per checker slot; each task
//! collects due jobs under the zone lock, probes on the blocking pool and
//! folds the results back in.

use crate::rules::{ProbeJob, ProbeOutcome, ProbeType};
use crate::zone::ZoneH;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Icmpv6Message, Icmpv6Packet};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Connect and receive timeout of one L4 probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Wait for one echo reply.
const PING_TIMEOUT: Duration = Duration::from_millis(500);
const PING_INTERVAL: Duration = Duration::from_millis(200);
const PING_PAYLOAD: [u8; 100] = [0x5a; 100];
/// Default checker wake-up period, also the time budget of one sweep.
pub const CHECKER_PERIOD: Duration = Duration::from_secs(2);

const IPPROTO_SCTP: i32 = 132;

/// Run one probe.
pub fn probe(job: &ProbeJob) -> ProbeOutcome {
    let dst = SocketAddr::new(job.host, job.port);
    let res = match job.probe_type {
        ProbeType::None => Ok(None),
        ProbeType::Tcp => connect(dst, job.src, Protocol::TCP).map(|()| None),
        ProbeType::Sctp => connect(dst, job.src, Protocol::from(IPPROTO_SCTP)).map(|()| None),
        ProbeType::Udp => udp(dst, job.src).map(|()| None),
        ProbeType::Ping => ping(job.host, job.src, job.count.max(1)).map(Some),
    };
    match res {
        Ok(rtt) => ProbeOutcome {
            key: job.key.clone(),
            ok: true,
            rtt,
        },
        Err(e) => {
            trace!(host = %job.host, probe = %job.probe_type, error = %e, "Probe failed");
            ProbeOutcome {
                key: job.key.clone(),
                ok: false,
                rtt: None,
            }
        }
    }
}

/// Probe jobs in order until the sweep budget is used up.
pub fn run_jobs(jobs: Vec<ProbeJob>, budget: Duration) -> Vec<ProbeOutcome> {
    let begin = Instant::now();
    let mut out = Vec::with_capacity(jobs.len());
    for job in &jobs {
        out.push(probe(job));
        if begin.elapsed() >= budget {
            break;
        }
    }
    out
}

fn bound_socket(dst: SocketAddr, ty: Type, proto: Protocol, src: Option<IpAddr>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(dst), ty, Some(proto))?;
    if let Some(src) = src.filter(|s| s.is_ipv4() == dst.is_ipv4()) {
        socket.bind(&SocketAddr::new(src, 0).into())?;
    }
    Ok(socket)
}

fn connect(dst: SocketAddr, src: Option<IpAddr>, proto: Protocol) -> io::Result<()> {
    let socket = bound_socket(dst, Type::STREAM, proto, src)?;
    socket.connect_timeout(&dst.into(), PROBE_TIMEOUT)
}

/// A UDP service is up unless the host answers with port unreachable.
fn udp(dst: SocketAddr, src: Option<IpAddr>) -> io::Result<()> {
    let socket = bound_socket(dst, Type::DGRAM, Protocol::UDP, src)?;
    socket.connect(&dst.into())?;
    socket.set_read_timeout(Some(PROBE_TIMEOUT))?;
    socket.send(b"probe")?;

    let mut buf = [0u8; 512];
    match (&socket).read(&mut buf) {
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Send `count` echo requests; returns (min, avg, max) round trip of the
/// replies received.
fn ping(host: IpAddr, src: Option<IpAddr>, count: u32) -> io::Result<(Duration, Duration, Duration)> {
    let (domain, proto) = match host {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::RAW, Some(proto))?;
    socket.set_read_timeout(Some(PING_TIMEOUT))?;
    if let Some(src) = src.filter(|s| s.is_ipv4() == host.is_ipv4()) {
        socket.bind(&SocketAddr::new(src, 0).into())?;
    }

    let ident = std::process::id() as u16;
    let dst: SockAddr = SocketAddr::new(host, 0).into();
    let mut rtts = Vec::new();
    for seq in 0..count {
        let seq = seq as u16;
        let req = match host {
            IpAddr::V4(_) => echo_request_v4(ident, seq),
            IpAddr::V6(_) => echo_request_v6(ident, seq),
        };
        let sent = Instant::now();
        socket.send_to(&req, &dst)?;
        if let Some(rtt) = wait_reply(&socket, host, ident, seq, sent)? {
            rtts.push(rtt);
        }
        if seq as u32 + 1 < count {
            std::thread::sleep(PING_INTERVAL);
        }
    }

    let (Some(min), Some(max)) = (rtts.iter().min().copied(), rtts.iter().max().copied()) else {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "no echo reply"));
    };
    let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
    Ok((min, avg, max))
}

fn wait_reply(
    socket: &Socket,
    host: IpAddr,
    ident: u16,
    seq: u16,
    sent: Instant,
) -> io::Result<Option<Duration>> {
    let mut buf = [0u8; 1500];
    while sent.elapsed() < PING_TIMEOUT {
        let n = match (&*socket).read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let matched = match host {
            IpAddr::V4(_) => is_echo_reply_v4(&buf[..n], ident, seq),
            IpAddr::V6(_) => is_echo_reply_v6(&buf[..n], ident, seq),
        };
        if matched {
            return Ok(Some(sent.elapsed()));
        }
    }
    Ok(None)
}

fn echo_request_v4(ident: u16, seq_no: u16) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data: &PING_PAYLOAD,
    };
    let mut buf = vec![0u8; repr.buffer_len()];
    let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    buf
}

/// The kernel fills in the ICMPv6 checksum on raw sockets.
fn echo_request_v6(ident: u16, seq_no: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + PING_PAYLOAD.len()];
    let mut packet = Icmpv6Packet::new_unchecked(&mut buf);
    packet.set_msg_type(Icmpv6Message::EchoRequest);
    packet.set_msg_code(0);
    packet.set_echo_ident(ident);
    packet.set_echo_seq_no(seq_no);
    packet.payload_mut().copy_from_slice(&PING_PAYLOAD);
    buf
}

/// IPv4 raw sockets deliver the IP header too.
fn is_echo_reply_v4(buf: &[u8], ident: u16, seq: u16) -> bool {
    if buf.len() < 20 {
        return false;
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if buf.len() < ihl + 8 {
        return false;
    }
    let Ok(icmp) = Icmpv4Packet::new_checked(&buf[ihl..]) else {
        return false;
    };
    icmp.msg_type() == Icmpv4Message::EchoReply
        && icmp.echo_ident() == ident
        && icmp.echo_seq_no() == seq
}

fn is_echo_reply_v6(buf: &[u8], ident: u16, seq: u16) -> bool {
    let Ok(icmp) = Icmpv6Packet::new_checked(buf) else {
        return false;
    };
    icmp.msg_type() == Icmpv6Message::EchoReply
        && icmp.echo_ident() == ident
        && icmp.echo_seq_no() == seq
}

/// Endpoint checker tasks.
pub struct EpCheckers {
    tasks: Vec<JoinHandle<()>>,
}

impl EpCheckers {
    /// Start `checkers` tasks probing the endpoint hosts of every zone.
    pub fn start(zh: Arc<ZoneH>, checkers: usize, period: Duration) -> Self {
        let tasks = (0..checkers.max(1))
            .map(|checker| {
                let zh = Arc::clone(&zh);
                tokio::spawn(async move {
                    checker_loop(zh, checker, period).await;
                })
            })
            .collect::<Vec<_>>();
        info!(checkers = tasks.len(), "Endpoint checkers started");
        Self { tasks }
    }

    pub fn stop(self) {
        for t in &self.tasks {
            t.abort();
        }
        info!("Endpoint checkers stopped");
    }
}

async fn checker_loop(zh: Arc<ZoneH>, checker: usize, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut run: u64 = 0;

    loop {
        interval.tick().await;
        for zone in zh.zones() {
            let jobs = {
                let mut z = zone.write().unwrap_or_else(PoisonError::into_inner);
                let mut jobs = z.rules.ep_probe_jobs(checker, run, Instant::now());
                for job in &mut jobs {
                    job.src = z.ifa_select_any(job.host, true).map(|(addr, _)| addr);
                }
                jobs
            };
            if jobs.is_empty() {
                continue;
            }
            debug!(checker, jobs = jobs.len(), "Probing endpoint hosts");

            let outcomes = match task::spawn_blocking(move || run_jobs(jobs, period)).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!(checker, error = %e, "Probe task failed");
                    continue;
                }
            };
            zone.write()
                .unwrap_or_else(PoisonError::into_inner)
                .rules
                .ep_probe_apply(outcomes, Instant::now());
        }
        run = run.wrapping_add(1);
    }
}
