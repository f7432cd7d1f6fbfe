//! Per-sandbox network namespace, links, routes and NAT.
//!
//! End state for slot `i` (`hi.lo` are the index octets):
//!
//! - namespace `ns-i` with `lo` up, `tap0` at `169.254.0.22/30`, `vpeer0` at
//!   `10.hi.lo.2/30` and a default route via `10.hi.lo.1`;
//! - SNAT/DNAT inside the namespace mapping the guest's `169.254.0.21` to
//!   and from `192.168.hi.lo` on `vpeer0`;
//! - on the host, `veth<i>` at `10.hi.lo.1/30`, a `/32` route to
//!   `192.168.hi.lo` via the namespace, forwarding enabled on `veth<i>`,
//!   `FORWARD` accept rules and a `MASQUERADE` rule for the VM IP;
//! - a DNS entry `sandbox_id → 192.168.hi.lo`.
//!
//! Everything inside the namespace goes away with it, so undo steps only
//! cover the namespace, the host-side objects, and the DNS entry.

use std::sync::Arc;

use ember_core::addressing::{self, GUEST_IP, TAP_NAME, VPEER_NAME};
use ember_core::{CleanupStack, Slot};

use crate::dns::DnsPublisher;
use crate::host::{run_idempotent, CommandFailure, HostNet, NetCommand};
use crate::NetworkError;

/// An `iptables` rule, addable and deletable with the same spec.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    fn command(&self, namespace: Option<&str>, action: &str) -> NetCommand {
        let mut args = vec!["-t", self.table, action, self.chain];
        args.extend(self.spec.iter().map(String::as_str));
        NetCommand::iptables(namespace, &args)
    }
}

fn namespace_rules(index: u16) -> Vec<Rule> {
    let vm_ip = addressing::host_vm_ip(index).to_string();
    let guest = GUEST_IP.to_string();
    vec![
        Rule::new(
            "nat",
            "POSTROUTING",
            &["-o", VPEER_NAME, "-s", &guest, "-j", "SNAT", "--to", &vm_ip],
        ),
        Rule::new(
            "nat",
            "PREROUTING",
            &["-i", VPEER_NAME, "-d", &vm_ip, "-j", "DNAT", "--to", &guest],
        ),
    ]
}

fn host_rules(index: u16) -> Vec<Rule> {
    let veth = addressing::veth_name(index);
    let vm_cidr = addressing::host_vm_cidr(index).to_string();
    vec![
        Rule::new("filter", "FORWARD", &["-i", &veth, "-j", "ACCEPT"]),
        Rule::new("filter", "FORWARD", &["-o", &veth, "-j", "ACCEPT"]),
        Rule::new("nat", "POSTROUTING", &["-s", &vm_cidr, "-j", "MASQUERADE"]),
    ]
}

/// Builds and tears down sandbox networks.
#[derive(Clone)]
pub struct NetworkBuilder {
    host: Arc<dyn HostNet>,
    dns: Arc<DnsPublisher>,
}

impl std::fmt::Debug for NetworkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkBuilder")
            .field("dns", &self.dns)
            .finish_non_exhaustive()
    }
}

impl NetworkBuilder {
    #[must_use]
    pub fn new(host: Arc<dyn HostNet>, dns: Arc<DnsPublisher>) -> Self {
        Self { host, dns }
    }

    #[must_use]
    pub fn dns(&self) -> &Arc<DnsPublisher> {
        &self.dns
    }

    /// Build the full network for `slot` and publish `sandbox_id`.
    ///
    /// On failure every step already taken is undone before returning. On
    /// success the caller owns teardown via [`teardown`](Self::teardown).
    ///
    /// # Errors
    /// Returns the [`NetworkError`] variant of the step that failed.
    pub async fn build(&self, slot: &Slot, sandbox_id: &str) -> Result<(), NetworkError> {
        let ns = addressing::namespace_name(slot.index());
        let mut undo = CleanupStack::new(format!("network {ns}"));
        match self.build_into(slot, sandbox_id, &mut undo).await {
            Ok(()) => {
                undo.dismiss();
                Ok(())
            }
            Err(e) => {
                let _ = undo.unwind().await;
                Err(e)
            }
        }
    }

    /// Like [`build`](Self::build), but pushes each undo step onto the
    /// caller's `undo` stack as soon as its do step has succeeded, and leaves
    /// unwinding to the caller.
    ///
    /// The push follows the do step with no suspension point in between, so
    /// dropping this future midway still leaves `undo` describing exactly
    /// what exists.
    ///
    /// # Errors
    /// Returns the [`NetworkError`] variant of the step that failed.
    pub async fn build_into(
        &self,
        slot: &Slot,
        sandbox_id: &str,
        undo: &mut CleanupStack,
    ) -> Result<(), NetworkError> {
        let index = slot.index();
        let ns = addressing::namespace_name(index);
        tracing::info!(namespace = %ns, sandbox_id, "building sandbox network");
        let result = self.build_steps(index, &ns, sandbox_id, undo).await;
        if let Err(e) = &result {
            tracing::warn!(namespace = %ns, error = %e, "network build failed");
        }
        result
    }

    async fn build_steps(
        &self,
        index: u16,
        ns: &str,
        sandbox_id: &str,
        undo: &mut CleanupStack,
    ) -> Result<(), NetworkError> {
        let veth = addressing::veth_name(index);
        let veth_cidr = addressing::veth_cidr(index).to_string();
        let vpeer_cidr = addressing::vpeer_cidr(index).to_string();
        let veth_ip = addressing::veth_ip(index).to_string();
        let vpeer_ip = addressing::vpeer_ip(index).to_string();
        let vm_cidr = addressing::host_vm_cidr(index).to_string();
        let tap_cidr = addressing::tap_cidr().to_string();

        let namespace = || ns.to_owned();
        let namespace_create = |source: CommandFailure| NetworkError::NamespaceCreate {
            namespace: namespace(),
            source,
        };
        let link_create = |source: CommandFailure| NetworkError::LinkCreate {
            namespace: namespace(),
            source,
        };
        let addr_assign = |source: CommandFailure| NetworkError::AddrAssign {
            namespace: namespace(),
            source,
        };
        let route_install = |source: CommandFailure| NetworkError::RouteInstall {
            namespace: namespace(),
            source,
        };
        let nat_install = |source: CommandFailure| NetworkError::NatInstall {
            namespace: namespace(),
            source,
        };

        // 1. Namespace. A pre-existing one is not ours and is never deleted.
        self.run(NetCommand::ip(&["netns", "add", ns]))
            .await
            .map_err(namespace_create)?;
        self.push_undo(undo, "delete namespace", NetCommand::ip(&["netns", "del", ns]));

        // 2. veth pair, peer end created directly inside the namespace.
        let veth_pair: [&str; 10] = [
            "link", "add", &veth, "type", "veth", "peer", "name", VPEER_NAME, "netns", ns,
        ];
        self.run(NetCommand::ip(&veth_pair))
            .await
            .map_err(link_create)?;
        self.push_undo(undo, "delete veth", NetCommand::ip(&["link", "del", &veth]));

        // 3. Inside the namespace.
        self.run(NetCommand::ip_in(ns, &["link", "set", "lo", "up"]))
            .await
            .map_err(link_create)?;
        self.run(NetCommand::ip_in(ns, &["tuntap", "add", "dev", TAP_NAME, "mode", "tap"]))
            .await
            .map_err(link_create)?;
        self.run(NetCommand::ip_in(ns, &["addr", "add", &tap_cidr, "dev", TAP_NAME]))
            .await
            .map_err(addr_assign)?;
        self.run(NetCommand::ip_in(ns, &["link", "set", TAP_NAME, "up"]))
            .await
            .map_err(link_create)?;
        self.run(NetCommand::ip_in(ns, &["addr", "add", &vpeer_cidr, "dev", VPEER_NAME]))
            .await
            .map_err(addr_assign)?;
        self.run(NetCommand::ip_in(ns, &["link", "set", VPEER_NAME, "up"]))
            .await
            .map_err(link_create)?;
        self.run(NetCommand::ip_in(ns, &["route", "add", "default", "via", &veth_ip]))
            .await
            .map_err(route_install)?;

        // 4. Host side of the veth and the route to the guest.
        self.run(NetCommand::ip(&["addr", "add", &veth_cidr, "dev", &veth]))
            .await
            .map_err(addr_assign)?;
        self.run(NetCommand::ip(&["link", "set", &veth, "up"]))
            .await
            .map_err(link_create)?;
        self.run(NetCommand::ip(&["route", "add", &vm_cidr, "via", &vpeer_ip]))
            .await
            .map_err(route_install)?;
        self.push_undo(undo, "delete host route", NetCommand::ip(&["route", "del", &vm_cidr]));

        // 5. NAT and forwarding.
        self.host
            .write_sysctl(Some(ns), "net.ipv4.ip_forward", "1")
            .await
            .map_err(nat_install)?;
        for rule in namespace_rules(index) {
            self.run(rule.command(Some(ns), "-A")).await.map_err(nat_install)?;
        }
        self.host
            .write_sysctl(None, &format!("net.ipv4.conf.{veth}.forwarding"), "1")
            .await
            .map_err(nat_install)?;
        for rule in host_rules(index) {
            self.run(rule.command(None, "-A")).await.map_err(nat_install)?;
            self.push_undo(undo, "delete host rule", rule.command(None, "-D"));
        }

        // 6. DNS.
        let vm_ip = addressing::host_vm_ip(index);
        self.dns
            .add(sandbox_id, vm_ip)
            .await
            .map_err(|source| NetworkError::DnsPublish {
                sandbox_id: sandbox_id.to_owned(),
                source,
            })?;
        let dns = Arc::clone(&self.dns);
        let id = sandbox_id.to_owned();
        undo.push("remove dns entry", async move { dns.remove(&id).await });

        tracing::info!(namespace = %ns, sandbox_id, %vm_ip, "sandbox network ready");
        Ok(())
    }

    /// Remove everything [`build`](Self::build) may have created for `index`.
    ///
    /// Needs no state beyond the index and id, so it also cleans up after a
    /// build that was cancelled midway. Idempotent; every step runs even if
    /// an earlier one fails.
    ///
    /// # Errors
    /// Returns [`NetworkError::Teardown`] listing the failed steps.
    pub async fn teardown(&self, index: u16, sandbox_id: &str) -> Result<(), NetworkError> {
        let ns = addressing::namespace_name(index);
        let veth = addressing::veth_name(index);
        let vm_cidr = addressing::host_vm_cidr(index).to_string();

        // Pushed in build order so the unwind mirrors a failed build.
        let mut undo = CleanupStack::new(format!("network {ns}"));
        self.push_undo(&mut undo, "delete namespace", NetCommand::ip(&["netns", "del", &ns]));
        self.push_undo(&mut undo, "delete veth", NetCommand::ip(&["link", "del", &veth]));
        self.push_undo(&mut undo, "delete host route", NetCommand::ip(&["route", "del", &vm_cidr]));
        for rule in host_rules(index) {
            self.push_undo(&mut undo, "delete host rule", rule.command(None, "-D"));
        }
        let dns = Arc::clone(&self.dns);
        let id = sandbox_id.to_owned();
        undo.push("remove dns entry", async move { dns.remove(&id).await });

        let failures = undo.unwind().await;
        if failures.is_empty() {
            tracing::info!(namespace = %ns, sandbox_id, "sandbox network removed");
            Ok(())
        } else {
            Err(NetworkError::Teardown {
                namespace: ns,
                failures: failures.iter().map(ToString::to_string).collect(),
            })
        }
    }

    async fn run(&self, command: NetCommand) -> Result<(), CommandFailure> {
        self.host.run(&command).await
    }

    fn push_undo(&self, undo: &mut CleanupStack, label: &'static str, command: NetCommand) {
        let host = Arc::clone(&self.host);
        undo.push(label, async move { run_idempotent(host.as_ref(), &command).await });
    }
}
