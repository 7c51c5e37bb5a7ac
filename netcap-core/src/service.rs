//! Service fingerprinting.
//!
//! Every server endpoint (`ip:port`) seen with a completed conversation gets a
//! [`ServiceRecord`]. The store keeps the longest banner observed for the
//! endpoint, the flows that contributed to it, and the product details found
//! by the probe table. Records are written once, at shutdown.
//!
//! Probes are regexes over the banner with `$N` references in their metadata
//! templates. Probes of the category expected for the port run first.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use compact_str::CompactString;
use parking_lot::Mutex;
use regex::bytes::{Captures, Regex};
use tracing::{debug, warn};

use crate::context::Context;
use crate::record::{Record, ServiceRecord};
use crate::stats::Stats;

/// Well-known service name of a port.
pub fn port_service(port: u16, transport: &str) -> Option<&'static str> {
    let name = match (transport, port) {
        ("TCP", 21) => "FTP",
        ("TCP", 22) => "SSH",
        ("TCP", 23) => "Telnet",
        ("TCP", 25) | ("TCP", 465) | ("TCP", 587) => "SMTP",
        ("TCP", 80) | ("TCP", 8080) => "HTTP",
        ("TCP", 110) => "POP3",
        ("TCP", 143) => "IMAP",
        ("TCP", 443) => "HTTPS",
        ("TCP", 445) => "SMB",
        ("TCP", 993) => "IMAPS",
        ("TCP", 995) => "POP3S",
        ("TCP", 3306) => "MySQL",
        ("TCP", 5432) => "PostgreSQL",
        ("UDP", 53) | ("TCP", 53) => "DNS",
        ("UDP", 67) | ("UDP", 68) => "DHCP",
        ("UDP", 123) => "NTP",
        ("UDP", 137) => "NetBIOS-NS",
        ("UDP", 161) => "SNMP",
        ("UDP", 514) => "Syslog",
        ("UDP", 1900) => "SSDP",
        ("UDP", 5353) => "mDNS",
        _ => return None,
    };
    Some(name)
}

struct ProbeSpec {
    category: &'static str,
    ident: &'static str,
    pattern: &'static str,
    product: &'static str,
    vendor: &'static str,
    version: &'static str,
    os: &'static str,
    hostname: &'static str,
}

const PROBE_SPECS: &[ProbeSpec] = &[
    ProbeSpec {
        category: "SSH",
        ident: "openssh",
        pattern: r"^SSH-[\d.]+-OpenSSH[_-]([\w.]+)(?:[ -]+(Ubuntu|Debian|FreeBSD|Raspbian))?",
        product: "OpenSSH",
        vendor: "OpenBSD",
        version: "$1",
        os: "$2",
        hostname: "",
    },
    ProbeSpec {
        category: "SSH",
        ident: "dropbear",
        pattern: r"^SSH-[\d.]+-dropbear_([\w.]+)",
        product: "Dropbear sshd",
        vendor: "",
        version: "$1",
        os: "Linux",
        hostname: "",
    },
    ProbeSpec {
        category: "FTP",
        ident: "vsftpd",
        pattern: r"^220 \(vsFTPd ([\w.]+)\)",
        product: "vsftpd",
        vendor: "",
        version: "$1",
        os: "Unix",
        hostname: "",
    },
    ProbeSpec {
        category: "FTP",
        ident: "proftpd",
        pattern: r"^220 ProFTPD ([\w.]+) Server(?: \(([^)]*)\))?",
        product: "ProFTPD",
        vendor: "",
        version: "$1",
        os: "Unix",
        hostname: "$2",
    },
    ProbeSpec {
        category: "SMTP",
        ident: "postfix",
        pattern: r"^220 ([-.\w]+) ESMTP Postfix(?: \((\w+)\))?",
        product: "Postfix smtpd",
        vendor: "",
        version: "",
        os: "$2",
        hostname: "$1",
    },
    ProbeSpec {
        category: "SMTP",
        ident: "exim",
        pattern: r"^220[- ]([-.\w]+) ESMTP Exim ([\d.]+)",
        product: "Exim smtpd",
        vendor: "",
        version: "$2",
        os: "",
        hostname: "$1",
    },
    ProbeSpec {
        category: "POP3",
        ident: "dovecot-pop3",
        pattern: r"^\+OK (?:\[[^\]]*\] )?Dovecot(?: \(([\w ]+)\))? ready",
        product: "Dovecot pop3d",
        vendor: "",
        version: "",
        os: "$1",
        hostname: "",
    },
    ProbeSpec {
        category: "IMAP",
        ident: "dovecot-imap",
        pattern: r"^\* OK (?:\[[^\]]*\] )?Dovecot(?: \(([\w ]+)\))? ready",
        product: "Dovecot imapd",
        vendor: "",
        version: "",
        os: "$1",
        hostname: "",
    },
    ProbeSpec {
        category: "HTTP",
        ident: "nginx",
        pattern: r"(?s)^HTTP/1\.[01] \d\d\d .*?\r\n[Ss]erver: nginx(?:/([\d.]+))?",
        product: "nginx",
        vendor: "",
        version: "$1",
        os: "",
        hostname: "",
    },
    ProbeSpec {
        category: "HTTP",
        ident: "apache",
        pattern: r"(?s)^HTTP/1\.[01] \d\d\d .*?\r\n[Ss]erver: Apache(?:/([\d.]+))?(?: \((\w+)\))?",
        product: "Apache httpd",
        vendor: "Apache",
        version: "$1",
        os: "$2",
        hostname: "",
    },
    ProbeSpec {
        category: "HTTP",
        ident: "iis",
        pattern: r"(?s)^HTTP/1\.[01] \d\d\d .*?\r\n[Ss]erver: Microsoft-IIS/([\d.]+)",
        product: "Microsoft IIS httpd",
        vendor: "Microsoft",
        version: "$1",
        os: "Windows",
        hostname: "",
    },
];

struct Probe {
    spec: &'static ProbeSpec,
    regex: Regex,
}

fn probes() -> &'static [Probe] {
    static PROBES: OnceLock<Vec<Probe>> = OnceLock::new();
    PROBES.get_or_init(|| {
        PROBE_SPECS
            .iter()
            .filter_map(|spec| match Regex::new(spec.pattern) {
                Ok(regex) => Some(Probe { spec, regex }),
                Err(e) => {
                    warn!(probe = spec.ident, error = %e, "Skipping service probe");
                    None
                }
            })
            .collect()
    })
}

/// Substitute the first `$N` group reference in a template.
fn expand(template: &str, caps: &Captures<'_>) -> String {
    let Some(pos) = template.find('$') else {
        return template.to_string();
    };
    let Some(index) = template[pos + 1..].chars().next().and_then(|c| c.to_digit(10)) else {
        return template.to_string();
    };
    let index = index as usize;
    if index >= caps.len() {
        return template.to_string();
    }
    let value = caps
        .get(index)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default();
    format!("{}{}{}", &template[..pos], value, &template[pos + 2..])
}

/// Append `new` to `old` with a ` | ` separator unless already present.
fn add_info(old: &mut String, new: String) {
    if new.is_empty() || old.contains(new.as_str()) {
        return;
    }
    if !old.is_empty() {
        old.push_str(" | ");
    }
    old.push_str(&new);
}

/// Run the probes of one category over a banner. Returns whether any matched.
fn match_probes<'a>(
    service: &mut ServiceRecord,
    probes: impl Iterator<Item = &'a Probe>,
    banner: &[u8],
    ident: &str,
    stop_after_match: bool,
) -> bool {
    let mut found = false;
    for probe in probes {
        let Some(caps) = probe.regex.captures(banner) else {
            continue;
        };
        let spec = probe.spec;
        add_info(&mut service.product, expand(spec.product, &caps));
        add_info(&mut service.vendor, expand(spec.vendor, &caps));
        add_info(&mut service.hostname, expand(spec.hostname, &caps));
        add_info(&mut service.os, expand(spec.os, &caps));
        add_info(&mut service.version, expand(spec.version, &caps));
        debug!(ident = %ident, probe = spec.ident, product = %service.product, "Service probe matched");

        found = true;
        if stop_after_match {
            break;
        }
    }
    found
}

/// Run the probe table over a banner, expected category first.
fn identify(service: &mut ServiceRecord, banner: &[u8], ident: &str, stop_after_match: bool) {
    if banner.is_empty() {
        return;
    }
    let expected = port_service(service.port, &service.protocol);

    let mut found = false;
    if let Some(category) = expected {
        let same = probes().iter().filter(|p| p.spec.category == category);
        found = match_probes(service, same, banner, ident, stop_after_match);
    }
    if found && stop_after_match {
        return;
    }

    let others = probes().iter().filter(|p| Some(p.spec.category) != expected);
    match_probes(service, others, banner, ident, stop_after_match);
}

/// What a completed conversation tells about its server endpoint.
#[derive(Debug, Clone)]
pub struct ServiceObservation<'a> {
    pub timestamp: i64,
    pub ip: IpAddr,
    pub port: u16,
    pub transport: &'static str,
    /// Start of the server direction, already cut to the banner size.
    pub banner: &'a [u8],
    pub ident: &'a str,
    pub server_bytes: u64,
    pub client_bytes: u64,
}

/// Service records keyed by server endpoint.
pub struct ServiceStore {
    items: Mutex<HashMap<String, ServiceRecord>>,
    stop_after_probe_match: bool,
}

impl ServiceStore {
    pub fn new(stop_after_probe_match: bool) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            stop_after_probe_match,
        }
    }

    /// Merge an observation into the store. Returns `true` for a new endpoint.
    ///
    /// Conversations without server data are ignored.
    pub fn observe(&self, obs: ServiceObservation<'_>) -> bool {
        if obs.server_bytes == 0 {
            return false;
        }
        let key = SocketAddr::new(obs.ip, obs.port).to_string();
        let mut items = self.items.lock();

        if let Some(service) = items.get_mut(&key) {
            identify(service, obs.banner, obs.ident, self.stop_after_probe_match);
            if service.flows.iter().any(|f| f == obs.ident) {
                return false;
            }
            service.flows.push(obs.ident.to_string());
            service.bytes_server += obs.server_bytes;
            service.bytes_client += obs.client_bytes;
            if service.banner.len() < obs.banner.len() {
                service.banner = obs.banner.to_vec();
                service.timestamp = obs.timestamp;
            }
            return false;
        }

        let mut service = ServiceRecord {
            timestamp: obs.timestamp,
            ip: obs.ip.to_string(),
            port: obs.port,
            name: port_service(obs.port, obs.transport).unwrap_or_default().to_string(),
            protocol: CompactString::new(obs.transport),
            banner: obs.banner.to_vec(),
            flows: vec![obs.ident.to_string()],
            bytes_server: obs.server_bytes,
            bytes_client: obs.client_bytes,
            ..Default::default()
        };
        identify(&mut service, obs.banner, obs.ident, self.stop_after_probe_match);
        debug!(service = %key, name = %service.name, product = %service.product, "New service");
        items.insert(key, service);
        true
    }

    /// Copy of the record for an endpoint.
    pub fn get(&self, ip: IpAddr, port: u16) -> Option<ServiceRecord> {
        self.items.lock().get(&SocketAddr::new(ip, port).to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every service record, ordered by endpoint.
    pub fn write_all(&self, ctx: &Context) {
        let mut services: Vec<ServiceRecord> = self.items.lock().values().cloned().collect();
        services.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));

        for service in services {
            Stats::incr(&ctx.stats.services);
            if !ctx.write(Record::Service(service)) {
                return;
            }
        }
    }
}
