//! Noise suppression rules.
//!
//! Evaluation is a pure function of the event, the rule set, and the
//! [`FilterContext`] captured at startup. Rules are independent: any match
//! drops the event, and no rule can keep an event another rule drops.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use conntrail_common::config::FilterRuleSet;
use conntrail_common::constants::DNS_PORTS;
use conntrail_common::types::ConnectionEvent;

/// Facts about the running agent that the self-traffic rule needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    /// Pid of the agent process.
    pub agent_pid: u32,
    /// Resolved endpoints of the network sinks.
    pub sink_endpoints: Vec<SocketAddr>,
}

/// The rule that dropped an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Unattributed connection to a non-unicast destination.
    NonProcess,
    /// DNS or mDNS traffic.
    Dns,
    /// Traffic generated by the agent itself.
    SelfTraffic,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonProcess => write!(f, "non-process"),
            Self::Dns => write!(f, "dns"),
            Self::SelfTraffic => write!(f, "self-traffic"),
        }
    }
}

/// Filter decision for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the event on.
    Keep,
    /// Suppress the event.
    Drop(DropReason),
}

/// Applies a [`FilterRuleSet`] within a fixed [`FilterContext`].
#[derive(Debug, Clone)]
pub struct FilterEngine {
    rules: FilterRuleSet,
    context: FilterContext,
}

fn is_unicast_peer(address: IpAddr) -> bool {
    match address.to_canonical() {
        IpAddr::V4(v4) => !(v4.is_multicast() || v4.is_broadcast() || v4.is_unspecified()),
        IpAddr::V6(v6) => !(v6.is_multicast() || v6.is_unspecified()),
    }
}

impl FilterEngine {
    /// Creates an engine for the given rules and context.
    pub const fn new(rules: FilterRuleSet, context: FilterContext) -> Self {
        Self { rules, context }
    }

    /// Evaluates every enabled rule against `event`.
    ///
    /// CLOSEs carry no attribution, so a CLOSE paired with an emitted OPEN
    /// must not be evaluated here; it keeps the OPEN's verdict.
    pub fn evaluate(&self, event: &ConnectionEvent) -> Verdict {
        let tuple = &event.tuple;
        let attribution = event.attribution.as_ref();

        if self.rules.suppress_non_process_connections
            && attribution.is_none()
            && !is_unicast_peer(tuple.destination_address)
        {
            return Verdict::Drop(DropReason::NonProcess);
        }

        if self.rules.suppress_dns
            && (DNS_PORTS.contains(&tuple.source_port) || DNS_PORTS.contains(&tuple.destination_port))
        {
            return Verdict::Drop(DropReason::Dns);
        }

        if self.rules.suppress_self_traffic {
            let is_self = match attribution {
                Some(attribution) => attribution.pid == self.context.agent_pid,
                None => {
                    let destination = SocketAddr::new(tuple.destination_address.to_canonical(), tuple.destination_port);
                    self.context
                        .sink_endpoints
                        .iter()
                        .any(|sink| SocketAddr::new(sink.ip().to_canonical(), sink.port()) == destination)
                }
            };
            if is_self {
                return Verdict::Drop(DropReason::SelfTraffic);
            }
        }

        Verdict::Keep
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;
    use conntrail_common::types::{ConnectionTuple, CorrelationHash, Phase, ProcessAttribution, Protocol};
    use uuid::Uuid;

    use super::*;

    const AGENT_PID: u32 = 4242;

    fn event(destination: &str, source_port: u16, pid: Option<u32>) -> ConnectionEvent {
        let destination: SocketAddr = destination.parse().unwrap();
        ConnectionEvent {
            tuple: ConnectionTuple {
                protocol: Protocol::Udp,
                source_address: "10.0.0.8".parse().unwrap(),
                source_port,
                destination_address: destination.ip(),
                destination_port: destination.port(),
            },
            phase: Phase::Open,
            kernel_inode: None,
            correlation_hash: CorrelationHash::new(1),
            connection_id: Uuid::nil(),
            timestamp: Utc::now(),
            observed_at: Instant::now(),
            attribution: pid.map(|pid| ProcessAttribution {
                pid,
                process_name: "proc".into(),
                command_line: Vec::new(),
                uid: 1000,
                username: None,
            }),
        }
    }

    fn engine(rules: FilterRuleSet) -> FilterEngine {
        FilterEngine::new(
            rules,
            FilterContext {
                agent_pid: AGENT_PID,
                sink_endpoints: vec!["10.0.0.5:514".parse().unwrap()],
            },
        )
    }

    fn all_rules() -> FilterRuleSet {
        FilterRuleSet {
            suppress_non_process_connections: true,
            suppress_dns: true,
            suppress_self_traffic: true,
        }
    }

    fn no_rules() -> FilterRuleSet {
        FilterRuleSet {
            suppress_non_process_connections: false,
            suppress_dns: false,
            suppress_self_traffic: false,
        }
    }

    #[test]
    fn dns_suppression_toggles() {
        let lookup = event("10.0.0.1:53", 40000, Some(77));
        let reply_side = event("10.0.0.1:40000", 5353, Some(77));
        assert_eq!(engine(all_rules()).evaluate(&lookup), Verdict::Drop(DropReason::Dns));
        assert_eq!(engine(all_rules()).evaluate(&reply_side), Verdict::Drop(DropReason::Dns));
        assert_eq!(engine(no_rules()).evaluate(&lookup), Verdict::Keep);
    }

    #[test]
    fn non_process_rule_only_hits_unattributed_non_unicast() {
        let filter = engine(all_rules());
        assert_eq!(
            filter.evaluate(&event("224.0.0.251:1900", 40000, None)),
            Verdict::Drop(DropReason::NonProcess)
        );
        assert_eq!(
            filter.evaluate(&event("255.255.255.255:67", 68, None)),
            Verdict::Drop(DropReason::NonProcess)
        );
        assert_eq!(filter.evaluate(&event("[ff02::fb]:1900", 40000, None)), Verdict::Drop(DropReason::NonProcess));
        assert_eq!(filter.evaluate(&event("224.0.0.251:1900", 40000, Some(77))), Verdict::Keep);
        assert_eq!(filter.evaluate(&event("93.184.216.34:443", 40000, None)), Verdict::Keep);
    }

    #[test]
    fn self_traffic_by_pid_and_by_sink_endpoint() {
        let filter = engine(all_rules());
        assert_eq!(
            filter.evaluate(&event("93.184.216.34:443", 40000, Some(AGENT_PID))),
            Verdict::Drop(DropReason::SelfTraffic)
        );
        assert_eq!(
            filter.evaluate(&event("10.0.0.5:514", 40000, None)),
            Verdict::Drop(DropReason::SelfTraffic)
        );
        assert_eq!(
            filter.evaluate(&event("[::ffff:10.0.0.5]:514", 40000, None)),
            Verdict::Drop(DropReason::SelfTraffic)
        );
        // Another process talking to the same collector is reported.
        assert_eq!(filter.evaluate(&event("10.0.0.5:514", 40000, Some(77))), Verdict::Keep);
        assert_eq!(engine(no_rules()).evaluate(&event("10.0.0.5:514", 40000, Some(AGENT_PID))), Verdict::Keep);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let filter = engine(all_rules());
        let samples = [
            event("10.0.0.1:53", 40000, Some(77)),
            event("224.0.0.251:1900", 40000, None),
            event("10.0.0.5:514", 40000, None),
            event("93.184.216.34:443", 40000, Some(77)),
        ];
        for sample in &samples {
            let first = filter.evaluate(sample);
            assert_eq!(filter.evaluate(sample), first);
            assert_eq!(filter.evaluate(sample), first);
        }
    }
}
