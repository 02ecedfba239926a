//! The bundle identity index: bundles by (source, creation time, fragment
//! offset, fragment length).

use crate::bundle::{BundleId, BundleSet, Found, BUNDLES_HASH_KEY_LEN};
use crate::engine::Engine;
use crate::error::Result;
use crate::store::Object;

impl Engine<'_> {
    pub fn catalogue(&mut self, obj: Object) -> Result<()> {
        let key = self.db.bundle(obj)?.id.key();
        if key.len() > BUNDLES_HASH_KEY_LEN {
            tracing::warn!(key = %key, "bundle key too long to index");
            return Ok(());
        }
        match self.db.bundle_sets.stage(&key) {
            Some(set) => set.members.push(obj),
            None => {
                self.db.bundle_sets.insert(key, BundleSet { members: vec![obj] });
            }
        }
        self.db.bundle_mut(obj)?.catalogued = true;
        Ok(())
    }

    pub fn uncatalogue(&mut self, obj: Object) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        if !bundle.catalogued {
            return Ok(());
        }
        let key = bundle.id.key();
        let emptied = match self.db.bundle_sets.stage(&key) {
            Some(set) => {
                set.members.retain(|o| *o != obj);
                set.members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.db.bundle_sets.remove(&key);
        }
        self.db.bundle_mut(obj)?.catalogued = false;
        Ok(())
    }

    pub fn find(&self, id: &BundleId) -> Found {
        match self.db.bundle_sets.get(&id.key()).map(|set| set.members.as_slice()) {
            None | Some([]) => Found::Absent,
            Some([obj]) => Found::Unique(*obj),
            Some(many) => Found::Ambiguous(many.len() as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Rig;

    #[test]
    fn lookup_by_identity() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"x");
        let id = rig.db.bundle(obj).unwrap().id.clone();
        assert_eq!(rig.engine().find(&id), Found::Unique(obj));

        let mut other = id.clone();
        other.fragment_offset = 5;
        assert_eq!(rig.engine().find(&other), Found::Absent);
    }

    #[test]
    fn collisions_are_ambiguous_until_one_remains() {
        let mut rig = Rig::new();
        let a = rig.send("ipn:2.1", b"x");
        let id = rig.db.bundle(a).unwrap().id.clone();

        let b = rig.db.new_object();
        let mut copy = rig.db.bundle(a).unwrap().clone();
        copy.catalogued = false;
        rig.db.bundles.insert(b, copy);
        rig.engine().catalogue(b).unwrap();
        assert_eq!(rig.engine().find(&id), Found::Ambiguous(2));

        rig.engine().uncatalogue(a).unwrap();
        assert_eq!(rig.engine().find(&id), Found::Unique(b));
        rig.engine().uncatalogue(b).unwrap();
        assert_eq!(rig.engine().find(&id), Found::Absent);
    }

    #[test]
    fn shrinking_set_names_the_survivor() {
        let mut rig = Rig::new();
        let first = rig.send("ipn:2.1", b"x");
        let id = rig.db.bundle(first).unwrap().id.clone();
        let copies: Vec<Object> = (0..2)
            .map(|_| {
                let obj = rig.db.new_object();
                let mut copy = rig.db.bundle(first).unwrap().clone();
                copy.catalogued = false;
                rig.db.bundles.insert(obj, copy);
                rig.engine().catalogue(obj).unwrap();
                obj
            })
            .collect();
        assert_eq!(rig.engine().find(&id), Found::Ambiguous(3));

        rig.engine().uncatalogue(copies[0]).unwrap();
        assert_eq!(rig.engine().find(&id), Found::Ambiguous(2));
        rig.engine().uncatalogue(first).unwrap();
        assert_eq!(rig.engine().find(&id), Found::Unique(copies[1]));
        assert_eq!(rig.db.bundle_sets.get(&id.key()).unwrap().members, vec![copies[1]]);
    }

    #[test]
    fn overlong_keys_are_not_indexed() {
        let mut rig = Rig::new();
        let obj = rig.send("ipn:2.1", b"x");
        rig.engine().uncatalogue(obj).unwrap();
        rig.db.bundle_mut(obj).unwrap().id.source = format!("dtn://{}", "n".repeat(70));
        rig.engine().catalogue(obj).unwrap();
        assert!(!rig.db.bundle(obj).unwrap().catalogued);
        assert!(rig.db.bundle_sets.is_empty());
    }
}
