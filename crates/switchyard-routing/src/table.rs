//! Routing table
//!
//! A [`Table`] maps a host to its routes, longest path first, plus a catch-all
//! bucket under the empty host. Tables are built from a route program and are
//! never modified afterwards; an update compiles a new table.
//!
//! Each [`Route`] precomputes what selection needs: the normalized cumulative
//! weight distribution for random picks and a slot ring for round-robin.

use std::collections::{BTreeMap, HashMap};

use switchyard_core::command::{Command, HostPath, RouteAdd, RouteDel, RouteWeight};
use switchyard_core::error::ParseErrors;
use switchyard_core::target::{Scheme, TargetOptions, target_key};
use switchyard_core::parse_program;
use url::Url;

use crate::matcher::{MatcherKind, PathMatcher};

/// Slots per target in the round-robin ring
const RING_SLOTS_PER_TARGET: usize = 100;

/// A forwarding endpoint within a route
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub service: String,
    pub scheme: Scheme,
    pub dst: Url,
    /// Raw weight as written in the program
    pub weight: f64,
    pub tags: Vec<String>,
    pub opts: TargetOptions,
    key: String,
}

impl Target {
    fn from_add(add: &RouteAdd) -> Self {
        Self {
            service: add.service.clone(),
            scheme: add.scheme,
            dst: add.dst.clone(),
            weight: add.weight,
            tags: add.tags.clone(),
            opts: add.opts.clone(),
            key: target_key(&add.service, add.dst.as_str()),
        }
    }

    /// Identity shared by timers: `service|dst`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dst(&self) -> &str {
        self.dst.as_str()
    }

    /// Protocol used to reach the upstream, honoring `proto=`
    pub fn upstream_scheme(&self) -> Scheme {
        self.opts.proto.unwrap_or(self.scheme)
    }

    /// `host:port` of the destination
    pub fn authority(&self) -> String {
        let host = self.dst.host_str().unwrap_or_default();
        let port = self
            .dst
            .port()
            .unwrap_or_else(|| self.upstream_scheme().default_port());
        format!("{}:{}", host, port)
    }

    pub fn is_redirect(&self) -> bool {
        self.scheme == Scheme::Redirect || self.opts.redirect.is_some()
    }

    /// Status and `Location` for a redirect target
    ///
    /// `$path` in the location is replaced by `path_and_query`.
    pub fn redirect(&self, path_and_query: &str) -> Option<(u16, String)> {
        if !self.is_redirect() {
            return None;
        }
        let code = self.opts.redirect.as_ref().map_or(302, |r| r.code);
        let location = match self.opts.redirect.as_ref().and_then(|r| r.location.clone()) {
            Some(loc) => loc,
            None if self.scheme == Scheme::Redirect => {
                let dst = self.dst.as_str();
                format!("https{}", &dst[Scheme::Redirect.as_str().len()..])
            }
            None => self.dst.to_string(),
        };
        let location = if path_and_query.starts_with('/') {
            location.replace("/$path", path_and_query)
        } else {
            location
        };
        Some((code, location.replace("$path", path_and_query)))
    }

    fn to_command(&self, host_path: &HostPath) -> Command {
        Command::Add(RouteAdd {
            service: self.service.clone(),
            host_path: host_path.clone(),
            scheme: self.scheme,
            dst: self.dst.clone(),
            weight: self.weight,
            tags: self.tags.clone(),
            opts: self.opts.clone(),
        })
    }
}

/// A host/path match with its ordered targets
#[derive(Debug, Clone)]
pub struct Route {
    pub host: String,
    pub path: String,
    pub targets: Vec<Target>,
    matcher: PathMatcher,
    /// Normalized cumulative weights; empty when all weights are zero
    cumulative: Vec<f64>,
    /// Target index per round-robin slot
    ring: Vec<usize>,
    id: String,
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.path == other.path && self.targets == other.targets
    }
}

impl Route {
    fn new(host_path: HostPath, targets: Vec<Target>, matcher: PathMatcher) -> Self {
        let cumulative = cumulative_weights(&targets);
        let ring = slot_ring(&targets, &cumulative);
        let id = host_path.to_string();
        Self {
            host: host_path.host,
            path: host_path.path,
            targets,
            matcher,
            cumulative,
            ring,
            id,
        }
    }

    /// Stable identity of the route across tables (`host` + `path`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical `route add` command for one of this route's targets
    pub fn command_for(&self, target: &Target) -> Command {
        target.to_command(&HostPath::new(self.host.clone(), self.path.clone()))
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }

    pub fn cumulative(&self) -> &[f64] {
        &self.cumulative
    }

    pub fn ring(&self) -> &[usize] {
        &self.ring
    }

    /// Weight of each target after normalization
    pub fn normalized_weights(&self) -> Vec<f64> {
        let mut prev = 0.0;
        self.cumulative
            .iter()
            .map(|c| {
                let w = c - prev;
                prev = *c;
                w
            })
            .collect()
    }
}

fn cumulative_weights(targets: &[Target]) -> Vec<f64> {
    let total: f64 = targets.iter().map(|t| t.weight).sum();
    if total <= 0.0 {
        return Vec::new();
    }
    let mut running = 0.0;
    let mut cumulative: Vec<f64> = targets
        .iter()
        .map(|t| {
            running += t.weight;
            running / total
        })
        .collect();
    if let Some(last) = cumulative.last_mut() {
        *last = 1.0;
    }
    cumulative
}

/// Interleaved slot ring where each target holds `round(weight * K)` slots
fn slot_ring(targets: &[Target], cumulative: &[f64]) -> Vec<usize> {
    let k = RING_SLOTS_PER_TARGET * targets.len();
    let counts: Vec<usize> = if cumulative.is_empty() {
        vec![1; targets.len()]
    } else {
        let mut prev = 0.0;
        cumulative
            .iter()
            .map(|c| {
                let share = c - prev;
                prev = *c;
                (share * k as f64).round() as usize
            })
            .collect()
    };

    // Smooth weighted round-robin spreads each target's slots over the ring.
    let total: usize = counts.iter().sum();
    let mut current = vec![0i64; counts.len()];
    let mut ring = Vec::with_capacity(total);
    for _ in 0..total {
        let mut best = 0;
        for (i, count) in counts.iter().enumerate() {
            current[i] += *count as i64;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total as i64;
        ring.push(best);
    }
    ring
}

/// Lowercase a Host value and remove any port
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.to_ascii_lowercase()
}

/// Immutable routing table
#[derive(Debug, Default, PartialEq)]
pub struct Table {
    /// host -> routes sorted by path length descending, then path ascending
    hosts: HashMap<String, Vec<Route>>,
    route_count: usize,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and compile a program
    pub fn compile(program: &str, matcher: MatcherKind) -> Result<Self, ParseErrors> {
        let commands = parse_program(program)?;
        Ok(Self::from_commands(&commands, matcher))
    }

    /// Apply commands in order and build the resulting table
    pub fn from_commands(commands: &[Command], matcher: MatcherKind) -> Self {
        let mut builder = TableBuilder::default();
        for command in commands {
            builder.apply(command);
        }
        builder.build(matcher)
    }

    /// Find the route for a request
    ///
    /// The host is matched exactly after normalization; a host with no
    /// routes falls back to the catch-all bucket.
    pub fn lookup(&self, host: &str, path: &str) -> Option<&Route> {
        let host = normalize_host(host);
        let routes = self.hosts.get(&host).or_else(|| self.hosts.get(""))?;
        routes.iter().find(|r| r.matches(path))
    }

    /// All routes, hosts in ascending order and each host's routes in match order
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        let mut hosts: Vec<&String> = self.hosts.keys().collect();
        hosts.sort();
        hosts
            .into_iter()
            .flat_map(move |h| self.hosts[h].iter())
    }

    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }

    /// Whether any route forwards to `dst`
    pub fn has_destination(&self, dst: &str) -> bool {
        self.routes()
            .any(|r| r.targets.iter().any(|t| t.dst() == dst))
    }

    /// Render the table as canonical `route add` commands
    pub fn to_commands(&self) -> Vec<Command> {
        self.routes()
            .flat_map(|route| {
                let host_path = HostPath::new(route.host.clone(), route.path.clone());
                route
                    .targets
                    .iter()
                    .map(move |t| t.to_command(&host_path))
            })
            .collect()
    }

    pub fn to_program(&self) -> String {
        self.to_commands()
            .iter()
            .map(|c| format!("{}\n", c))
            .collect()
    }
}

#[derive(Default)]
struct TableBuilder {
    routes: BTreeMap<HostPath, Vec<Target>>,
}

impl TableBuilder {
    fn apply(&mut self, command: &Command) {
        match command {
            Command::Add(add) => self.add(add),
            Command::Del(del) => self.del(del),
            Command::Weight(weight) => self.weight(weight),
        }
    }

    fn add(&mut self, add: &RouteAdd) {
        let targets = self.routes.entry(add.host_path.clone()).or_default();
        match targets
            .iter_mut()
            .find(|t| t.service == add.service && t.dst == add.dst)
        {
            Some(existing) => {
                existing.scheme = add.scheme;
                existing.weight = add.weight;
                existing.tags = add.tags.clone();
                existing.opts = add.opts.clone();
            }
            None => targets.push(Target::from_add(add)),
        }
    }

    fn del(&mut self, del: &RouteDel) {
        self.routes.retain(|host_path, targets| {
            targets.retain(|t| !del.matches(&t.service, host_path, t.dst()));
            !targets.is_empty()
        });
    }

    fn weight(&mut self, cmd: &RouteWeight) {
        let mut matched = 0;
        if let Some(targets) = self.routes.get_mut(&cmd.host_path) {
            for target in targets.iter_mut().filter(|t| t.service == cmd.service) {
                target.weight = cmd.weight;
                if let Some(tags) = &cmd.tags {
                    target.tags = tags.clone();
                }
                matched += 1;
            }
        }
        if matched == 0 {
            tracing::warn!(
                service = %cmd.service,
                route = %cmd.host_path,
                "route weight matched no targets"
            );
        }
    }

    fn build(self, kind: MatcherKind) -> Table {
        let mut hosts: HashMap<String, Vec<Route>> = HashMap::new();
        let mut route_count = 0;

        for (host_path, targets) in self.routes {
            let matcher = match PathMatcher::new(kind, &host_path.path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(route = %host_path, error = %e, "skipping route with invalid matcher");
                    continue;
                }
            };
            route_count += 1;
            hosts
                .entry(host_path.host.clone())
                .or_default()
                .push(Route::new(host_path, targets, matcher));
        }

        for routes in hosts.values_mut() {
            routes.sort_by(|a, b| {
                b.path
                    .len()
                    .cmp(&a.path.len())
                    .then_with(|| a.path.cmp(&b.path))
            });
        }

        Table { hosts, route_count }
    }
}
