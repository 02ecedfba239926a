//! Forwarding and dispatch: route selection, local delivery and the
//! transit queue.

use ferry_core::admin::{CtReason, SrReason};
use ferry_core::config::RecvRule;
use ferry_core::eid::MAX_EID_LEN;
use ferry_core::wire::{BDL_DEST_IS_SINGLETON, SRR_DELIVERED};
use ferry_core::MetaEid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::stats::{DelReason, StateStat};
use crate::store::Object;

impl Engine<'_> {
    /// Push `eid` onto the bundle's station stack and queue it for the
    /// forwarder of the EID's scheme.
    pub fn forward_bundle(&mut self, obj: Object, eid: &str) -> Result<()> {
        let meta = match MetaEid::parse(eid) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(bundle = %obj, eid, error = %e, "unparseable station");
                return self.abandon(obj, DelReason::NoRoute);
            }
        };
        if meta.null || eid.len() > MAX_EID_LEN {
            return self.abandon(obj, DelReason::NoRoute);
        }
        if self.db.bundle(obj)?.stations.iter().any(|s| s == eid) {
            tracing::debug!(bundle = %obj, eid, "routing loop");
            return self.abandon(obj, DelReason::NoRoute);
        }
        let Some(scheme) = self.db.schemes.get(&meta.scheme) else {
            tracing::debug!(bundle = %obj, scheme = %meta.scheme, "no forwarder for scheme");
            return self.abandon(obj, DelReason::NoRoute);
        };
        let queue = scheme.forward_queue;

        let bundle = self.db.bundle_mut(obj)?;
        bundle.stations.insert(0, eid.to_string());
        self.env.hooks.extension.on_forward(bundle);
        let elt = self.db.lists.insert_last(queue, obj)?;
        self.db.bundle_mut(obj)?.holders.forward = Some(elt);
        self.env.vdb.give_scheme(&meta.scheme);
        Ok(())
    }

    /// Route the first bundle waiting for a scheme's forwarder. Returns
    /// false when the queue is empty.
    pub fn forwarder_step(&mut self, scheme: &str) -> Result<bool> {
        let queue = self
            .db
            .schemes
            .get(&scheme.to_string())
            .ok_or_else(|| EngineError::UnknownScheme(scheme.to_string()))?
            .forward_queue;
        let Some(elt) = self.db.lists.first(queue)? else {
            return Ok(false);
        };
        let obj = self.db.lists.delete(elt)?;
        let (station, delivered) = {
            let bundle = self.db.bundle_mut(obj)?;
            bundle.holders.forward = None;
            (bundle.stations.first().cloned(), bundle.delivered)
        };
        let Some(station) = station else {
            self.abandon(obj, DelReason::NoRoute)?;
            return Ok(true);
        };
        let meta = MetaEid::parse(&station)?;

        let own_node = !meta.is_multicast() && meta.node() == Some(self.env.own_node);
        if own_node && delivered {
            tracing::debug!(bundle = %obj, station = %station, "delivered copy has nowhere further to go");
            self.destroy(obj, false)?;
            return Ok(true);
        }
        let local_endpoint = self.db.endpoints.contains(&station) && !delivered;
        if own_node || local_endpoint {
            self.dispatch(obj)?;
            return Ok(true);
        }

        let neighbor = meta.node_eid().unwrap_or_else(|| station.clone());
        let dest_node = self.destination_meta(obj)?.and_then(|d| d.node());
        if let Some(key) = self.lookup_plan(&neighbor) {
            let plan_node = MetaEid::parse(&key).ok().and_then(|m| m.node());
            let snubbed = matches!((dest_node, plan_node), (Some(d), Some(n)) if self.env.vdb.is_snubbed(d, n));
            if !snubbed {
                self.enqueue_on_plan(obj, &key)?;
                return Ok(true);
            }
        }

        let env = self.env;
        let snubbed = |via: &str| match (dest_node, MetaEid::parse(via).ok().and_then(|m| m.node())) {
            (Some(d), Some(n)) => env.vdb.is_snubbed(d, n),
            _ => false,
        };
        match env.router.route(&meta, &snubbed) {
            Some(via) => self.forward_bundle(obj, &via)?,
            None if delivered => {
                tracing::debug!(bundle = %obj, station = %station, "no onward route after local delivery");
                self.destroy(obj, false)?;
            }
            None => {
                tracing::debug!(bundle = %obj, station = %station, "no route");
                self.abandon(obj, DelReason::NoRoute)?;
            }
        }
        Ok(true)
    }

    fn destination_meta(&self, obj: Object) -> Result<Option<MetaEid>> {
        let dest = self.db.bundle(obj)?.destination_eid()?;
        Ok(MetaEid::parse(&dest).ok())
    }

    /// Queue on the chosen plan, or park in limbo while it is blocked.
    /// Critical bundles also go out on every other candidate plan.
    fn enqueue_on_plan(&mut self, obj: Object, key: &str) -> Result<()> {
        let blocked = self.db.plans.get(&key.to_string()).is_some_and(|p| p.blocked);
        if blocked {
            self.enqueue_to_limbo(obj)?;
        } else {
            self.bp_enqueue(key, obj)?;
        }

        let (critical, len) = {
            let bundle = self.db.bundle(obj)?;
            (bundle.is_critical(), bundle.payload.length)
        };
        if critical {
            if let Some(dest) = self.destination_meta(obj)? {
                for via in self.env.router.candidates(&dest) {
                    let Some(other) = self.lookup_plan(&via) else { continue };
                    if other == key || self.db.plans.get(&other).is_some_and(|p| p.blocked) {
                        continue;
                    }
                    let copy = self.clone_bundle(obj, 0, len)?;
                    self.purge_stations(copy)?;
                    self.bp_enqueue(&other, copy)?;
                }
            }
        }
        self.accept(obj)?;
        if critical && blocked {
            self.destroy(obj, false)?;
        }
        Ok(())
    }

    /// Conclude the routing attempt: take custody if asked and send any
    /// pending status report.
    pub fn accept(&mut self, obj: Object) -> Result<()> {
        self.purge_stations(obj)?;
        let bundle = self.db.bundle(obj)?;
        if bundle.flags.is_custodial() && !bundle.custody_taken && !bundle.is_anonymous() {
            self.take_custody(obj)?;
        }
        let bundle = self.db.bundle_mut(obj)?;
        if bundle.accepted {
            return Ok(());
        }
        bundle.accepted = true;
        let (flags, reason) = (bundle.status_rpt.flags, bundle.status_rpt.reason);
        if flags != 0 {
            self.send_status_report(obj, flags, reason)?;
            self.db.bundle_mut(obj)?.status_rpt.flags = 0;
        }
        Ok(())
    }

    /// Decide what a bundle for this node does next: delivery, transit or
    /// abandonment.
    pub fn dispatch(&mut self, obj: Object) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        let dest = bundle.destination_eid()?;
        let singleton = bundle.flags.has(BDL_DEST_IS_SINGLETON);
        let is_admin = bundle.flags.is_admin();
        let meta = MetaEid::parse(&dest).ok();

        let scheme_admin = meta
            .as_ref()
            .and_then(|m| self.db.schemes.get(&m.scheme))
            .is_some_and(|s| s.admin_eid == dest);
        if is_admin && (dest == self.env.custodian_eid || scheme_admin) {
            return self.handle_admin(obj);
        }

        let group = meta.as_ref().is_some_and(|m| self.env.hooks.multicast.is_group(m));
        let local = self.db.endpoints.contains(&dest);
        if local {
            self.deliver(obj, &dest)?;
            if singleton && !group {
                return self.destroy(obj, false);
            }
        }

        if !self.db.bundles.contains(&obj) {
            return Ok(());
        }
        let own_node = meta.as_ref().and_then(|m| m.node()) == Some(self.env.own_node);
        if !local && !group && own_node {
            self.accept(obj)?;
            return self.abandon(obj, DelReason::NoRoute);
        }

        let bundle = self.db.bundle(obj)?;
        let forwarded = if bundle.delivered || bundle.holders.fragment.is_some() {
            let len = bundle.payload.length;
            self.clone_bundle(obj, 0, len)?
        } else {
            obj
        };
        self.purge_stations(forwarded)?;
        let elt = self.db.lists.insert_last(self.db.transit, forwarded)?;
        self.db.bundle_mut(forwarded)?.holders.transit = Some(elt);
        self.env.vdb.transit.give();
        if forwarded != obj {
            self.destroy(obj, false)?;
        }
        Ok(())
    }

    /// Hand a bundle to a local endpoint, collecting fragments until the
    /// whole ADU is here.
    pub fn deliver(&mut self, obj: Object, endpoint: &str) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        if bundle.custody_taken {
            self.release_custody(obj)?;
        } else if bundle.flags.is_custodial() && !bundle.is_anonymous() {
            self.send_ct_signal(obj, true, CtReason::NoAdditionalInfo)?;
        }

        if let Some(inc) = self.incomplete_for(obj, endpoint)? {
            if self.extend_incomplete(inc, obj)? {
                self.check_incomplete(inc)?;
            }
        } else if self.db.bundle(obj)?.flags.is_fragment() {
            let inc = self.create_incomplete(obj, endpoint)?;
            self.check_incomplete(inc)?;
        } else {
            self.enqueue_for_delivery(obj, endpoint)?;
        }
        // Reassembly may already have consumed the fragment.
        if let Some(bundle) = self.db.bundles.stage(&obj) {
            bundle.delivered = true;
        }
        Ok(())
    }

    /// Put a complete bundle on the endpoint's delivery queue. A closed
    /// endpoint may run its script; a closed endpoint that discards leaves
    /// the bundle to be destroyed and returns false.
    pub(crate) fn enqueue_for_delivery(&mut self, obj: Object, endpoint: &str) -> Result<bool> {
        let ep = self
            .db
            .endpoints
            .get(&endpoint.to_string())
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_string()))?;
        let (queue, rule, script) = (ep.delivery_queue, ep.recv_rule, ep.script.clone());
        let vep = self.env.vdb.endpoint(endpoint);
        let closed = vep.as_ref().map_or(true, |v| !v.is_open());

        if closed {
            if let Some(script) = script {
                run_script(endpoint, &script);
            }
            if rule == RecvRule::Discard {
                tracing::debug!(bundle = %obj, endpoint, "endpoint closed, bundle discarded");
                return Ok(false);
            }
        }

        let elt = self.db.lists.insert_last(queue, obj)?;
        let bundle = self.db.bundle_mut(obj)?;
        bundle.holders.delivery = Some(elt);
        let (priority, len, srr) = (bundle.priority(), bundle.payload.length, bundle.flags.srr());
        self.db.stats_mut().tally(StateStat::Delivered, priority, len);
        if srr & SRR_DELIVERED != 0 {
            self.send_status_report(obj, SRR_DELIVERED, SrReason::NoInfo)?;
        }
        tracing::debug!(bundle = %obj, endpoint, len, "bundle queued for delivery");
        if let Some(vep) = vep {
            vep.semaphore.give();
        }
        Ok(true)
    }

    /// Pop the oldest bundle off an endpoint's delivery queue. The bundle
    /// stays in the database until the caller destroys or detains it.
    pub fn take_delivery(&mut self, endpoint: &str) -> Result<Option<Object>> {
        let queue = self
            .db
            .endpoints
            .get(&endpoint.to_string())
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_string()))?
            .delivery_queue;
        let Some(elt) = self.db.lists.first(queue)? else {
            return Ok(None);
        };
        let obj = self.db.lists.delete(elt)?;
        self.db.bundle_mut(obj)?.holders.delivery = None;
        Ok(Some(obj))
    }

    /// Send the first transit bundle on toward its destination. Returns
    /// false when the transit queue is empty.
    pub fn transit_step(&mut self) -> Result<bool> {
        let Some(elt) = self.db.lists.first(self.db.transit)? else {
            return Ok(false);
        };
        let obj = self.db.lists.delete(elt)?;
        let bundle = self.db.bundle_mut(obj)?;
        bundle.holders.transit = None;
        let dest = bundle.destination_eid()?;
        self.forward_bundle(obj, &dest)?;
        Ok(true)
    }

    /// Start a fresh routing attempt for a bundle, wherever it is queued.
    pub fn reforward(&mut self, obj: Object) -> Result<()> {
        if self.db.bundle(obj)?.is_critical() {
            return self.destroy(obj, false);
        }
        self.purge_stations(obj)?;
        self.remove_from_queue(obj)?;
        let elts = {
            let bundle = self.db.bundle_mut(obj)?;
            bundle.prox_node_eid = None;
            [bundle.holders.limbo.take(), bundle.holders.duct.take(), bundle.holders.forward.take()]
        };
        for elt in elts.into_iter().flatten() {
            self.db.lists.delete(elt)?;
        }
        self.cancel_overdue(obj)?;
        let dest = self.db.bundle(obj)?.destination_eid()?;
        self.forward_bundle(obj, &dest)
    }
}

/// Start an endpoint's reanimation script and reap it once it exits.
fn run_script(endpoint: &str, script: &str) {
    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(endpoint, script, error = %e, "reanimation script failed");
            return;
        }
    };
    let (endpoint, script) = (endpoint.to_string(), script.to_string());
    let reap = async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(endpoint, script, %status, "reanimation script exited with failure");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(endpoint, script, error = %e, "reanimation script wait failed"),
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(reap);
        }
        Err(_) => {
            // No runtime on this thread: drive the wait on a thread of its own.
            std::thread::spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(reap),
                    Err(e) => tracing::warn!(error = %e, "cannot reap reanimation script"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, Rig};
    use ferry_core::config::{EndpointConfig, RouteConfig};

    #[test]
    fn routing_loop_is_abandoned() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"x");
        let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
        rig.db.lists.delete(elt).unwrap();

        rig.engine().forward_bundle(obj, "ipn:2.1").unwrap();
        assert!(!rig.db.bundles.contains(&obj));
        let stats = rig.db.stats.get();
        assert_eq!(stats.forward_failed, 1);
        assert_eq!(stats.deleted(DelReason::NoRoute).count, 1);
    }

    #[test]
    fn unknown_scheme_and_null_eid_are_abandoned() {
        let mut rig = Rig::new();
        for eid in ["xyz:elsewhere", "ipn:0.0", "bad"] {
            let mut req = rig.request("ipn:2.1");
            req.destination = eid.into();
            let content = rig.payload(b"x");
            let result = rig.engine().send(&req, content);
            if let Ok(Some(obj)) = result {
                assert!(!rig.db.bundles.contains(&obj), "{eid} should be abandoned");
            }
        }
        assert!(rig.db.bundles.is_empty());
    }

    #[test]
    fn static_route_reaches_a_plan() {
        let mut cfg = testkit::config();
        cfg.routes.push(RouteConfig { destination: "ipn:7.*".into(), via: "ipn:2.0".into() });
        let mut rig = Rig::with_config(cfg);
        let obj = rig.send("ipn:7.1", b"far");
        rig.forward_all();
        let bundle = rig.db.bundle(obj).unwrap();
        assert_eq!(bundle.prox_node_eid.as_deref(), Some("ipn:2.0"));
        assert!(bundle.holders.plan.is_some());
        assert!(bundle.stations.is_empty());
    }

    #[test]
    fn snubbed_plan_falls_back_to_router() {
        let mut cfg = testkit::config();
        cfg.plans.push(ferry_core::config::PlanConfig {
            neighbor: "ipn:3.0".into(),
            nominal_rate: 0,
            max_payload_len: 0,
            outducts: vec!["tcp/3".into()],
        });
        cfg.routes.push(RouteConfig { destination: "ipn:2.*".into(), via: "ipn:3.0".into() });
        let mut rig = Rig::with_config(cfg);
        rig.env.vdb.snubs.insert(crate::vdb::Snub { destination: 2, neighbor: 2 });
        let obj = rig.send("ipn:2.1", b"around");
        rig.forward_all();
        assert_eq!(rig.db.bundle(obj).unwrap().prox_node_eid.as_deref(), Some("ipn:3.0"));
    }

    #[test]
    fn local_bundle_is_delivered() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.1", b"to me");
        rig.forward_all();
        assert_eq!(rig.take_delivery("ipn:1.1"), Some(obj));
        assert_eq!(rig.db.stats.get().total(StateStat::Delivered).count, 1);
    }

    #[test]
    fn own_node_without_endpoint_is_abandoned() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.77", b"nobody");
        rig.forward_all();
        assert!(!rig.db.bundles.contains(&obj));
        assert_eq!(rig.db.stats.get().deleted(DelReason::NoRoute).count, 1);
    }

    #[test]
    fn discarding_endpoint_drops_when_closed() {
        let mut cfg = testkit::config();
        cfg.schemes[0].endpoints.push(EndpointConfig {
            nss: "1.9".into(),
            recv_rule: RecvRule::Discard,
            script: None,
        });
        let mut rig = Rig::with_config(cfg);
        let obj = rig.send("ipn:1.9", b"dropped");
        rig.forward_all();
        assert!(!rig.db.bundles.contains(&obj));
        assert_eq!(rig.db.stats.get().total(StateStat::Delivered).count, 0);

        rig.env.vdb.endpoint("ipn:1.9").unwrap().open.store(true, std::sync::atomic::Ordering::SeqCst);
        let kept = rig.send("ipn:1.9", b"kept");
        rig.forward_all();
        assert_eq!(rig.take_delivery("ipn:1.9"), Some(kept));
    }

    #[test]
    fn transit_bundle_is_forwarded() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"through");
        let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
        rig.db.lists.delete(elt).unwrap();
        rig.engine().dispatch(obj).unwrap();
        assert!(rig.db.bundle(obj).unwrap().holders.transit.is_some());
        rig.forward_all();
        assert!(rig.db.bundle(obj).unwrap().holders.plan.is_some());
    }

    #[test]
    fn reforward_pulls_a_bundle_from_its_duct() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"again");
        rig.forward_all();
        rig.engine().plan_step("ipn:2.0").unwrap();
        assert!(rig.db.bundle(obj).unwrap().holders.duct.is_some());

        rig.engine().reforward(obj).unwrap();
        let bundle = rig.db.bundle(obj).unwrap();
        assert!(bundle.holders.duct.is_none());
        assert!(bundle.holders.forward.is_some());
        let duct = rig.db.outducts.get(&"tcp/2".to_string()).unwrap();
        assert_eq!(rig.db.lists.len(duct.xmit_buffer).unwrap(), 0);
    }

    fn group_config(route: bool) -> ferry_core::config::FerryConfig {
        let mut cfg = testkit::config();
        cfg.forwarding.hooks.multicast = true;
        cfg.schemes.push(ferry_core::config::SchemeConfig {
            name: "imc".into(),
            endpoints: vec![EndpointConfig { nss: "5.1".into(), recv_rule: RecvRule::Enqueue, script: None }],
        });
        if route {
            cfg.routes.push(RouteConfig { destination: "imc:5.*".into(), via: "ipn:2.0".into() });
        }
        cfg
    }

    #[test]
    fn non_singleton_local_bundle_is_delivered_once() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.1", b"just once");
        rig.db.bundle_mut(obj).unwrap().flags.clear(BDL_DEST_IS_SINGLETON);
        rig.forward_all();

        assert_eq!(rig.take_delivery("ipn:1.1"), Some(obj));
        assert_eq!(rig.take_delivery("ipn:1.1"), None);
        assert_eq!(rig.db.stats.get().total(StateStat::Delivered).count, 1);
        assert_eq!(rig.db.stats.get().deleted(DelReason::NoRoute).count, 0);
        assert_eq!(rig.db.bundles.len(), 1);

        rig.engine().destroy(obj, false).unwrap();
        assert!(rig.db.bundles.is_empty());
    }

    #[test]
    fn group_bundle_is_delivered_and_sent_on() {
        let mut rig = Rig::with_config(group_config(true));
        let obj = rig.send("imc:5.1", b"everyone");
        assert!(!rig.db.bundle(obj).unwrap().flags.has(BDL_DEST_IS_SINGLETON));
        rig.forward_all();

        assert_eq!(rig.db.bundles.len(), 2);
        let original = rig.db.bundle(obj).unwrap();
        assert!(original.delivered);
        assert!(original.holders.delivery.is_some());
        assert!(original.holders.plan.is_none());

        let copy = rig.db.bundles.keys().copied().find(|o| *o != obj).unwrap();
        let bundle = rig.db.bundle(copy).unwrap();
        assert!(bundle.delivered);
        assert!(bundle.holders.plan.is_some());
        assert!(bundle.holders.delivery.is_none());
        assert_eq!(bundle.prox_node_eid.as_deref(), Some("ipn:2.0"));

        assert_eq!(rig.take_delivery("imc:5.1"), Some(obj));
        assert_eq!(rig.take_delivery("imc:5.1"), None);
        assert_eq!(rig.db.stats.get().total(StateStat::Delivered).count, 1);
    }

    #[test]
    fn delivered_group_bundle_without_route_is_not_abandoned() {
        let mut rig = Rig::with_config(group_config(false));
        let obj = rig.send("imc:5.1", b"only here");
        rig.forward_all();

        let stats = rig.db.stats.get();
        assert_eq!(stats.total(StateStat::Delivered).count, 1);
        assert_eq!(stats.total(StateStat::Abandoned).count, 0);
        assert_eq!(stats.deleted(DelReason::NoRoute).count, 0);
        assert_eq!(rig.db.bundles.keys().copied().collect::<Vec<_>>(), vec![obj]);
        assert_eq!(rig.take_delivery("imc:5.1"), Some(obj));
    }

    #[test]
    fn delivered_flag_survives_cloning() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.1", b"copy me");
        rig.db.bundle_mut(obj).unwrap().delivered = true;
        let copy = rig.engine().clone_bundle(obj, 0, 7).unwrap();
        assert!(rig.db.bundle(copy).unwrap().delivered);
    }

    fn scripted_config() -> ferry_core::config::FerryConfig {
        let mut cfg = testkit::config();
        cfg.schemes[0].endpoints.push(EndpointConfig {
            nss: "1.8".into(),
            recv_rule: RecvRule::Enqueue,
            script: Some("true".into()),
        });
        cfg
    }

    #[test]
    fn closed_endpoint_script_runs_without_a_runtime() {
        let mut rig = Rig::with_config(scripted_config());
        let obj = rig.send("ipn:1.8", b"wake up");
        rig.forward_all();
        assert_eq!(rig.take_delivery("ipn:1.8"), Some(obj));
    }

    #[tokio::test]
    async fn closed_endpoint_script_is_reaped_on_the_runtime() {
        let mut rig = Rig::with_config(scripted_config());
        let obj = rig.send("ipn:1.8", b"wake up");
        rig.forward_all();
        assert_eq!(rig.take_delivery("ipn:1.8"), Some(obj));
        tokio::task::yield_now().await;
    }
}
