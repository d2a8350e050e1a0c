//! Endpoint hosts.
//!
//! Every distinct (address, probe type, probe port) used by a load-balancer
//! endpoint is an [`EpHost`]. Hosts are reference counted by the rules that
//! use them and may also be created through the API. Probing happens outside
//! the zone lock: a checker collects [`ProbeJob`]s, runs them, and hands the
//! [`ProbeOutcome`]s back.

use super::{
    DFL_HOST_PROBE_TIMEOUT, DFL_INACT_TRIES, INIT_HOST_PROBE_TIMEOUT, MAX_EP_SWEEPS,
    MAX_HOST_PROBE_TIME, MAX_INACT_TRIES, Result, RuleError, RuleTable,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    #[default]
    None,
    Ping,
    Tcp,
    Udp,
    Sctp,
}

impl ProbeType {
    /// Connect-style probes need a port.
    pub fn needs_port(self) -> bool {
        matches!(self, ProbeType::Tcp | ProbeType::Udp | ProbeType::Sctp)
    }

    /// Probe matching an L4 protocol number.
    pub fn for_proto(proto: u8) -> Self {
        match proto {
            6 => ProbeType::Tcp,
            17 => ProbeType::Udp,
            132 => ProbeType::Sctp,
            _ => ProbeType::Ping,
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeType::None => "none",
            ProbeType::Ping => "ping",
            ProbeType::Tcp => "tcp",
            ProbeType::Udp => "udp",
            ProbeType::Sctp => "sctp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpHostOpts {
    pub probe_type: ProbeType,
    pub probe_port: u16,
    /// Seconds between probes of a healthy host.
    pub probe_duration: u32,
    /// Consecutive failures before the host is marked inactive.
    pub inact_tries: u32,
    /// Hosts that are not activated are always reported healthy.
    pub probe_activated: bool,
}

impl Default for EpHostOpts {
    fn default() -> Self {
        Self {
            probe_type: ProbeType::None,
            probe_port: 0,
            probe_duration: DFL_HOST_PROBE_TIMEOUT,
            inact_tries: DFL_INACT_TRIES,
            probe_activated: false,
        }
    }
}

pub fn ep_key(host: IpAddr, probe_type: ProbeType, port: u16) -> String {
    format!("{host}_{probe_type}_{port}")
}

#[derive(Debug, Clone)]
pub struct EpHost {
    pub key: String,
    pub host: IpAddr,
    pub opts: EpHostOpts,
    /// Rules referring to this host.
    pub rule_count: u32,
    pub inactive: bool,
    pub inact_tries: u32,
    /// Current probe interval, stretched while the host stays down.
    pub curr_probe_duration: u32,
    pub init_prober_on: bool,
    /// Checker task responsible for this host.
    pub checker: usize,
    pub last_probe: Option<Instant>,
    pub min_delay: Duration,
    pub avg_delay: Duration,
    pub max_delay: Duration,
}

impl EpHost {
    fn new(key: String, host: IpAddr, opts: EpHostOpts, checker: usize) -> Self {
        Self {
            key,
            host,
            curr_probe_duration: opts.probe_duration,
            opts,
            rule_count: 0,
            inactive: false,
            inact_tries: 0,
            init_prober_on: true,
            checker,
            last_probe: None,
            min_delay: Duration::ZERO,
            avg_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn transition(&mut self, ok: bool, thr: u32) {
        if ok {
            if self.inactive {
                self.inactive = false;
                self.curr_probe_duration = self.opts.probe_duration;
                debug!(ep = %self.key, avg = ?self.avg_delay, "Endpoint host active");
            }
            self.inact_tries = 0;
            return;
        }

        if self.inact_tries < thr {
            self.inact_tries += 1;
            if self.inact_tries >= thr && !self.inactive {
                self.inactive = true;
                debug!(ep = %self.key, next = self.curr_probe_duration, "Endpoint host inactive");
            }
        } else {
            self.inact_tries += 1;
            // Dead hosts are probed less and less often
            if self.curr_probe_duration < 3 * DFL_HOST_PROBE_TIMEOUT {
                self.curr_probe_duration += 20;
            }
        }
    }

    fn due(&self, run: u64, now: Instant) -> bool {
        let elapsed = self
            .last_probe
            .map_or(u64::MAX, |t| now.saturating_duration_since(t).as_secs());
        let init_due = self.init_prober_on && elapsed >= u64::from(INIT_HOST_PROBE_TIMEOUT);
        if run % 2 == 0 {
            (self.opts.probe_type == ProbeType::Ping && self.avg_delay.is_zero())
                || self.inactive
                || init_due
        } else {
            init_due || elapsed >= u64::from(self.curr_probe_duration)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpHostDump {
    pub name: String,
    pub host: IpAddr,
    pub probe_type: ProbeType,
    pub probe_port: u16,
    pub probe_duration: u32,
    pub inact_tries: u32,
    pub min_delay_us: u64,
    pub avg_delay_us: u64,
    pub max_delay_us: u64,
    /// "ok" or "nok".
    pub state: String,
}

/// A probe to run outside the zone lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeJob {
    pub key: String,
    pub host: IpAddr,
    pub probe_type: ProbeType,
    pub port: u16,
    /// Preferred source address.
    pub src: Option<IpAddr>,
    /// Echo requests per ping probe.
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub key: String,
    pub ok: bool,
    /// Round trip (min, avg, max) of a ping probe.
    pub rtt: Option<(Duration, Duration, Duration)>,
}

pub(super) struct EpHostTable {
    hosts: HashMap<String, EpHost>,
    next_checker: usize,
    checkers: usize,
}

impl EpHostTable {
    pub(super) fn new(checkers: usize) -> Self {
        Self {
            hosts: HashMap::new(),
            next_checker: 0,
            checkers,
        }
    }

    pub(super) fn find(&self, key: &str) -> Option<&EpHost> {
        self.hosts.get(key)
    }
}

fn validate_opts(opts: &EpHostOpts) -> Result<()> {
    if opts.inact_tries > MAX_INACT_TRIES || opts.probe_duration > MAX_HOST_PROBE_TIME {
        return Err(RuleError::Args(format!(
            "probe tries {} duration {}",
            opts.inact_tries, opts.probe_duration
        )));
    }
    if opts.probe_type.needs_port() && opts.probe_port == 0 {
        return Err(RuleError::Args(format!(
            "{} probe needs a port",
            opts.probe_type
        )));
    }
    Ok(())
}

impl RuleTable {
    /// Add or reference an endpoint host and return its key.
    ///
    /// API calls create or reconfigure a host; rule calls take a reference
    /// on it. `name` overrides the derived key.
    pub fn ep_host_add(
        &mut self,
        api: bool,
        host: IpAddr,
        name: Option<&str>,
        mut opts: EpHostOpts,
    ) -> Result<String> {
        if api && opts.probe_type != ProbeType::None {
            opts.probe_activated = true;
        }
        validate_opts(&opts)?;

        let key = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => ep_key(host, opts.probe_type, opts.probe_port),
        };

        if let Some(ep) = self.eps.hosts.get_mut(&key) {
            if api {
                ep.curr_probe_duration = opts.probe_duration;
                ep.opts = opts;
                ep.init_prober_on = true;
            } else {
                ep.rule_count += 1;
            }
            return Ok(key);
        }

        // UDP probes share one checker so their ICMP errors are not raced
        let checker = if opts.probe_type == ProbeType::Udp {
            0
        } else {
            let c = self.eps.next_checker % self.eps.checkers;
            self.eps.next_checker += 1;
            c
        };
        let mut ep = EpHost::new(key.clone(), host, opts, checker);
        if !api {
            ep.rule_count = 1;
        }
        debug!(ep = %key, checker, "Endpoint host added");
        self.eps.hosts.insert(key.clone(), ep);
        Ok(key)
    }

    /// Release a reference (rule calls) or delete (API calls) a host.
    pub fn ep_host_delete(&mut self, api: bool, key: &str) -> Result<()> {
        let Some(ep) = self.eps.hosts.get_mut(key) else {
            return Err(RuleError::EpNotExist(key.to_string()));
        };
        if !api {
            ep.rule_count = ep.rule_count.saturating_sub(1);
        }
        if ep.rule_count > 0 {
            return Err(RuleError::EpInUse(key.to_string()));
        }
        self.eps.hosts.remove(key);
        debug!(ep = %key, "Endpoint host deleted");
        Ok(())
    }

    pub fn ep_hosts_get(&self) -> Vec<EpHostDump> {
        self.eps
            .hosts
            .values()
            .map(|h| EpHostDump {
                name: h.key.clone(),
                host: h.host,
                probe_type: if h.opts.probe_activated {
                    h.opts.probe_type
                } else {
                    ProbeType::None
                },
                probe_port: h.opts.probe_port,
                probe_duration: h.opts.probe_duration,
                inact_tries: h.opts.inact_tries,
                min_delay_us: h.min_delay.as_micros() as u64,
                avg_delay_us: h.avg_delay.as_micros() as u64,
                max_delay_us: h.max_delay.as_micros() as u64,
                state: if h.inactive { "nok" } else { "ok" }.to_string(),
            })
            .collect()
    }

    /// Hosts of `checker` due for a probe in sweep number `run`.
    ///
    /// Hosts without active probing are marked healthy on the spot.
    pub(crate) fn ep_probe_jobs(&mut self, checker: usize, run: u64, now: Instant) -> Vec<ProbeJob> {
        let mut jobs = Vec::new();
        let mut keys: Vec<&String> = self.eps.hosts.keys().collect();
        keys.sort();
        let keys: Vec<String> = keys.into_iter().cloned().collect();

        for key in keys {
            let Some(h) = self.eps.hosts.get_mut(&key) else {
                continue;
            };
            if h.checker != checker {
                continue;
            }
            if !h.opts.probe_activated || h.opts.probe_type == ProbeType::None {
                h.inactive = false;
                h.inact_tries = 0;
                continue;
            }
            if !h.due(run, now) {
                continue;
            }
            jobs.push(ProbeJob {
                key: h.key.clone(),
                host: h.host,
                probe_type: h.opts.probe_type,
                port: h.opts.probe_port,
                src: None,
                count: h.opts.inact_tries.max(1),
            });
            if jobs.len() >= MAX_EP_SWEEPS {
                break;
            }
        }
        jobs
    }

    /// Fold probe results into host state.
    pub(crate) fn ep_probe_apply(&mut self, outcomes: Vec<ProbeOutcome>, now: Instant) {
        for o in outcomes {
            let Some(h) = self.eps.hosts.get_mut(&o.key) else {
                continue;
            };
            let mut thr = h.opts.inact_tries;
            if h.init_prober_on {
                thr = 1;
                h.init_prober_on = false;
            }
            if h.opts.probe_type == ProbeType::Ping {
                let (min, avg, max) = o.rtt.unwrap_or_default();
                h.min_delay = min;
                h.avg_delay = avg;
                h.max_delay = max;
                thr = 1;
            }
            h.transition(o.ok, thr);
            h.last_probe = Some(now);
        }
    }
}
