//! Fragmentation and reassembly.

use ferry_core::wire::BDL_IS_FRAGMENT;

use crate::bundle::{IncompleteBundle, ListOwner, Memberships, Payload};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::store::Object;

impl Engine<'_> {
    /// A new bundle carrying `length` bytes of `obj`'s payload from
    /// `offset`. Anything short of the whole payload is a fragment, with its
    /// offset relative to the original ADU.
    pub fn clone_bundle(&mut self, obj: Object, offset: u64, length: u64) -> Result<Object> {
        let old = self.db.bundle(obj)?;
        let payload_len = old.payload.length;
        let bad_range = || EngineError::BadCloneRange { offset, length, payload: payload_len };
        if offset.checked_add(length).map_or(true, |end| end > payload_len) {
            return Err(bad_range());
        }
        let content = old.payload.content.clone_range(offset, length).ok_or_else(bad_range)?;

        let mut new = old.clone();
        new.holders = Memberships::default();
        new.catalogued = false;
        new.detained = false;
        new.prox_node_eid = None;
        new.payload = Payload { length, content };
        if offset != 0 || length != payload_len {
            if !old.flags.is_fragment() {
                new.total_adu_length = payload_len;
                new.id.fragment_offset = 0;
            }
            new.flags.set(BDL_IS_FRAGMENT);
            new.id.fragment_offset += offset;
            new.id.fragment_length = length;
        }

        let clone = self.db.new_object();
        self.db.bundles.insert(clone, new);
        self.catalogue(clone)?;
        self.set_ttl(clone)?;
        self.db.stats_mut().note_inserted(length);
        Ok(clone)
    }

    /// Split a bundle after `first_len` payload bytes. Both fragments
    /// inherit custody and the original is destroyed.
    pub fn fragment(&mut self, obj: Object, first_len: u64) -> Result<(Object, Object)> {
        let total = self.db.bundle(obj)?.payload.length;
        if first_len == 0 || first_len >= total {
            return Err(EngineError::BadCloneRange { offset: first_len, length: 0, payload: total });
        }
        let first = self.clone_bundle(obj, 0, first_len)?;
        let second = self.clone_bundle(obj, first_len, total - first_len)?;

        let stats = self.db.stats_mut();
        stats.fragments_produced += 2;
        stats.bundles_fragmented += 1;

        let bundle = self.db.bundle_mut(obj)?;
        bundle.custody_taken = false;
        tracing::debug!(bundle = %obj, first = %first, second = %second, first_len, "bundle fragmented");
        self.destroy(obj, false)?;
        Ok((first, second))
    }

    // ── Reassembly ──

    /// The incomplete bundle at `endpoint` that `obj` belongs to, if any.
    pub(crate) fn incomplete_for(&self, obj: Object, endpoint: &str) -> Result<Option<Object>> {
        let id = &self.db.bundle(obj)?.id;
        let Some(ep) = self.db.endpoints.get(&endpoint.to_string()) else {
            return Ok(None);
        };
        for (_, inc_obj) in self.db.lists.to_vec(ep.incompletes)? {
            if self.db.incompletes.get(&inc_obj).is_some_and(|inc| inc.matches(id)) {
                return Ok(Some(inc_obj));
            }
        }
        Ok(None)
    }

    /// Start collecting fragments of a new ADU at `endpoint`.
    pub(crate) fn create_incomplete(&mut self, obj: Object, endpoint: &str) -> Result<Object> {
        let ep = self
            .db
            .endpoints
            .get(&endpoint.to_string())
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_string()))?
            .clone();
        let bundle = self.db.bundle(obj)?;
        let (source, creation, total) =
            (bundle.id.source.clone(), bundle.id.creation, bundle.total_adu_length);

        let inc_obj = self.db.new_object();
        let fragments = self.db.lists.create(ListOwner::Fragments(inc_obj));
        let frag_elt = self.db.lists.insert_last(fragments, obj)?;
        let elt = self.db.lists.insert_last(ep.incompletes, inc_obj)?;
        self.db.incompletes.insert(
            inc_obj,
            IncompleteBundle {
                source,
                creation,
                endpoint: endpoint.to_string(),
                fragments,
                total_adu_length: total,
                elt: Some(elt),
            },
        );
        self.db.bundle_mut(obj)?.holders.fragment = Some(frag_elt);
        Ok(inc_obj)
    }

    /// Insert a fragment in offset order. A fragment whose offset is
    /// already present is a duplicate and is left out.
    pub(crate) fn extend_incomplete(&mut self, inc_obj: Object, obj: Object) -> Result<bool> {
        let fragments = self.incomplete(inc_obj)?.fragments;
        let offset = self.db.bundle(obj)?.id.fragment_offset;
        let mut before = None;
        for (elt, frag) in self.db.lists.to_vec(fragments)? {
            let at = self.db.bundle(frag)?.id.fragment_offset;
            if at == offset {
                tracing::debug!(bundle = %obj, offset, "duplicate fragment");
                return Ok(false);
            }
            if at > offset {
                before = Some(elt);
                break;
            }
        }
        let elt = match before {
            Some(next) => self.db.lists.insert_before(next, obj)?,
            None => self.db.lists.insert_last(fragments, obj)?,
        };
        self.db.bundle_mut(obj)?.holders.fragment = Some(elt);
        Ok(true)
    }

    fn incomplete(&self, inc_obj: Object) -> Result<&IncompleteBundle> {
        Ok(self
            .db
            .incompletes
            .get(&inc_obj)
            .ok_or(crate::error::StoreError::NoSuchObject(inc_obj.0))?)
    }

    /// Reassemble if the fragments now cover the whole ADU without a gap.
    /// Returns the reassembled bundle once it is queued for delivery. One
    /// the endpoint refuses is destroyed.
    pub fn check_incomplete(&mut self, inc_obj: Object) -> Result<Option<Object>> {
        let inc = self.incomplete(inc_obj)?.clone();
        let frags = self.db.lists.to_vec(inc.fragments)?;

        let mut furthest = 0;
        for (_, frag) in &frags {
            let bundle = self.db.bundle(*frag)?;
            if bundle.id.fragment_offset > furthest {
                return Ok(None);
            }
            furthest = furthest.max(bundle.id.fragment_offset + bundle.payload.length);
        }
        if furthest < inc.total_adu_length {
            return Ok(None);
        }
        let Some(((first_elt, aggregate), rest)) = frags.split_first() else {
            return Ok(None);
        };
        let aggregate = *aggregate;

        self.db.lists.delete(*first_elt)?;
        self.uncatalogue(aggregate)?;
        let removed = {
            let agg = self.db.bundle_mut(aggregate)?;
            agg.holders.fragment = None;
            agg.payload.length
        };
        self.db.stats_mut().note_removed(removed);

        for (elt, frag) in rest {
            let (offset, len, content) = {
                let f = self.db.bundle(*frag)?;
                (f.id.fragment_offset, f.payload.length, f.payload.content.clone())
            };
            let agg = self.db.bundle_mut(aggregate)?;
            let skip = agg.payload.length.saturating_sub(offset);
            if skip < len {
                if let Some(tail) = content.clone_range(skip, len - skip) {
                    agg.payload.content.append(&tail);
                    agg.payload.length += len - skip;
                }
            }
            self.db.lists.delete(*elt)?;
            self.db.bundle_mut(*frag)?.holders.fragment = None;
            self.destroy(*frag, false)?;
        }

        let len = {
            let agg = self.db.bundle_mut(aggregate)?;
            agg.flags.clear(BDL_IS_FRAGMENT);
            agg.total_adu_length = 0;
            agg.id.fragment_offset = 0;
            agg.id.fragment_length = 0;
            agg.payload.length
        };
        self.catalogue(aggregate)?;
        self.db.stats_mut().note_inserted(len);
        self.drop_incomplete(inc_obj)?;
        tracing::debug!(bundle = %aggregate, len, "bundle reassembled");

        if !self.enqueue_for_delivery(aggregate, &inc.endpoint)? {
            self.destroy(aggregate, false)?;
            return Ok(None);
        }
        Ok(Some(aggregate))
    }

    fn drop_incomplete(&mut self, inc_obj: Object) -> Result<()> {
        if let Some(inc) = self.db.incompletes.remove(&inc_obj) {
            self.db.lists.destroy(inc.fragments)?;
            if let Some(elt) = inc.elt {
                self.db.lists.delete(elt)?;
            }
        }
        Ok(())
    }

    /// Take a bundle out of its fragment list, discarding the incomplete
    /// bundle if it was the last fragment.
    pub(crate) fn leave_incomplete(&mut self, obj: Object) -> Result<()> {
        let Some(elt) = self.db.bundle_mut(obj)?.holders.fragment.take() else {
            return Ok(());
        };
        let list = self.db.lists.list_of(elt)?;
        self.db.lists.delete(elt)?;
        if self.db.lists.len(list)? == 0 {
            if let ListOwner::Fragments(inc_obj) = self.db.lists.user_data(list)?.clone() {
                self.drop_incomplete(inc_obj)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Rig;

    #[test]
    fn clone_shares_the_payload_range() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"0123456789");
        let part = rig.engine().clone_bundle(obj, 3, 4).unwrap();

        let bundle = rig.db.bundle(part).unwrap();
        assert_eq!(&bundle.payload.content.read().unwrap()[..], b"3456");
        assert!(bundle.flags.is_fragment());
        assert_eq!(bundle.id.fragment_offset, 3);
        assert_eq!(bundle.total_adu_length, 10);
        assert!(bundle.holders.ttl.is_some());

        let whole = rig.engine().clone_bundle(obj, 0, 10).unwrap();
        assert!(!rig.db.bundle(whole).unwrap().flags.is_fragment());

        assert!(matches!(
            rig.engine().clone_bundle(obj, 8, 3),
            Err(EngineError::BadCloneRange { .. })
        ));
    }

    #[test]
    fn fragment_offsets_compose() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"0123456789");
        let tail = rig.engine().clone_bundle(obj, 4, 6).unwrap();
        let inner = rig.engine().clone_bundle(tail, 2, 3).unwrap();
        let bundle = rig.db.bundle(inner).unwrap();
        assert_eq!(bundle.id.fragment_offset, 6);
        assert_eq!(bundle.total_adu_length, 10);
        assert_eq!(&bundle.payload.content.read().unwrap()[..], b"678");
    }

    #[test]
    fn fragmenting_moves_custody_to_both_halves() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"abcdefgh");
        {
            let b = rig.db.bundle_mut(obj).unwrap();
            let elt = b.holders.forward.take().unwrap();
            b.custody_taken = true;
            rig.db.lists.delete(elt).unwrap();
        }
        let (a, b) = rig.engine().fragment(obj, 3).unwrap();
        assert!(!rig.db.bundles.contains(&obj));
        for (frag, bytes) in [(a, &b"abc"[..]), (b, &b"defgh"[..])] {
            let bundle = rig.db.bundle(frag).unwrap();
            assert!(bundle.custody_taken);
            assert_eq!(&bundle.payload.content.read().unwrap()[..], bytes);
        }
        assert_eq!(rig.db.stats.get().fragments_produced, 2);
    }

    #[test]
    fn reassembly_in_any_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for cut in [1u64, 333, 999] {
            for reverse in [false, true] {
                let mut rig = Rig::new();
                let obj = rig.send("ipn:1.1", &payload);
                let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
                rig.db.lists.delete(elt).unwrap();
                let (a, b) = rig.engine().fragment(obj, cut).unwrap();
                let order = if reverse { [b, a] } else { [a, b] };

                for frag in order {
                    rig.engine().deliver(frag, "ipn:1.1").unwrap();
                }
                let delivered = rig.take_delivery("ipn:1.1").expect("reassembled bundle");
                let bundle = rig.db.bundle(delivered).unwrap();
                assert!(!bundle.flags.is_fragment());
                assert_eq!(&bundle.payload.content.read().unwrap()[..], &payload[..]);
                assert!(rig.db.incompletes.is_empty());
                assert_eq!(rig.db.bundles.len(), 1);
            }
        }
    }

    #[test]
    fn overlapping_fragments_keep_only_new_bytes() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.1", b"abcdefghij");
        let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
        rig.db.lists.delete(elt).unwrap();
        let head = rig.engine().clone_bundle(obj, 0, 6).unwrap();
        let tail = rig.engine().clone_bundle(obj, 4, 6).unwrap();
        rig.engine().destroy(obj, false).unwrap();

        rig.engine().deliver(tail, "ipn:1.1").unwrap();
        assert_eq!(rig.db.incompletes.len(), 1);
        rig.engine().deliver(head, "ipn:1.1").unwrap();
        let delivered = rig.take_delivery("ipn:1.1").unwrap();
        assert_eq!(
            &rig.db.bundle(delivered).unwrap().payload.content.read().unwrap()[..],
            b"abcdefghij"
        );
    }

    #[test]
    fn expiring_the_last_fragment_drops_the_incomplete() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:1.1", b"abcdef");
        let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
        rig.db.lists.delete(elt).unwrap();
        let (a, b) = rig.engine().fragment(obj, 2).unwrap();
        rig.engine().deliver(a, "ipn:1.1").unwrap();
        rig.engine().destroy(b, false).unwrap();
        assert_eq!(rig.db.incompletes.len(), 1);

        rig.engine().destroy(a, true).unwrap();
        assert!(rig.db.incompletes.is_empty());
        assert!(rig.db.bundles.is_empty());
    }

    #[test]
    fn reassembly_at_a_closed_discarding_endpoint_leaves_nothing() {
        let mut cfg = crate::testkit::config();
        cfg.schemes[0].endpoints.push(ferry_core::config::EndpointConfig {
            nss: "1.9".into(),
            recv_rule: ferry_core::config::RecvRule::Discard,
            script: None,
        });
        let mut rig = Rig::with_config(cfg);
        let obj = rig.send("ipn:1.9", b"0123456789");
        let elt = rig.db.bundle_mut(obj).unwrap().holders.forward.take().unwrap();
        rig.db.lists.delete(elt).unwrap();
        let (a, b) = rig.engine().fragment(obj, 4).unwrap();

        rig.engine().dispatch(a).unwrap();
        assert_eq!(rig.db.incompletes.len(), 1);
        rig.engine().dispatch(b).unwrap();

        assert!(rig.db.incompletes.is_empty());
        assert!(rig.db.bundles.is_empty());
        assert!(rig.db.bundle_sets.is_empty());
        assert_eq!(rig.take_delivery("ipn:1.9"), None);
        assert_eq!(rig.db.stats.get().current.count, 0);
    }
}
