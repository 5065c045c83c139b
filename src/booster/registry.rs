//! In-process indexes of live boosters and live puppets.
//!
//! Neither survives a restart; the persisted mirror rows and the salvage
//! sweep reconcile whatever was live when the process went down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

use crate::booster::campaign::Booster;
use crate::booster::types::{BoosterKind, StartRejection};

// ============================================================================
// BOOSTERS
// ============================================================================

#[derive(Default)]
pub struct BoosterRegistry {
    boosters: RwLock<HashMap<Uuid, Arc<Booster>>>,
}

impl BoosterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn vacancy(boosters: &HashMap<Uuid, Arc<Booster>>, owner_id: &str, token: &Pubkey, kind: BoosterKind) -> Result<(), StartRejection> {
        for booster in boosters.values().filter(|b| b.owner_id == owner_id) {
            if booster.kind == kind && booster.token == *token {
                return Err(StartRejection::DuplicateActive { kind });
            }
            if kind.is_exclusive() && booster.kind.is_exclusive() {
                return Err(StartRejection::OwnerBusy {
                    kind: booster.kind,
                    token: booster.token.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Would a new booster for this key be allowed right now?
    pub fn check_vacancy(&self, owner_id: &str, token: &Pubkey, kind: BoosterKind) -> Result<(), StartRejection> {
        Self::vacancy(&self.boosters.read(), owner_id, token, kind)
    }

    /// Register `booster`, re-checking vacancy under the write lock so two
    /// concurrent starts for the same key cannot both succeed.
    pub fn insert(&self, booster: Arc<Booster>) -> Result<(), StartRejection> {
        let mut boosters = self.boosters.write();
        Self::vacancy(&boosters, &booster.owner_id, &booster.token, booster.kind)?;
        boosters.insert(booster.id, booster);
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Booster>> {
        self.boosters.write().remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Booster>> {
        self.boosters.read().get(id).cloned()
    }

    pub fn find(&self, owner_id: &str, token: &Pubkey, kind: BoosterKind) -> Option<Arc<Booster>> {
        self.boosters
            .read()
            .values()
            .find(|b| b.owner_id == owner_id && b.token == *token && b.kind == kind)
            .cloned()
    }

    /// The owner's running trading booster, if any (salvage runs excluded).
    pub fn any_active_for(&self, owner_id: &str) -> Option<Arc<Booster>> {
        self.boosters
            .read()
            .values()
            .find(|b| b.owner_id == owner_id && b.kind.is_exclusive())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.boosters.read().len()
    }
}

// ============================================================================
// PUPPETS
// ============================================================================

/// Shared handle between a running puppet and whoever may stop it.
#[derive(Debug)]
pub struct PuppetControl {
    pub booster_id: Uuid,
    stop_requested: AtomicBool,
}

impl PuppetControl {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct PuppetRegistry {
    live: DashMap<Pubkey, Arc<PuppetControl>>,
}

impl PuppetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `pubkey` for `booster_id`. Fails if the wallet is already live,
    /// which is what keeps two sweeps from draining the same wallet.
    pub fn claim(&self, pubkey: Pubkey, booster_id: Uuid) -> Option<Arc<PuppetControl>> {
        match self.live.entry(pubkey) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let control = Arc::new(PuppetControl {
                    booster_id,
                    stop_requested: AtomicBool::new(false),
                });
                slot.insert(control.clone());
                Some(control)
            }
        }
    }

    pub fn release(&self, pubkey: &Pubkey) {
        self.live.remove(pubkey);
    }

    pub fn is_live(&self, pubkey: &Pubkey) -> bool {
        self.live.contains_key(pubkey)
    }

    pub fn count_for(&self, booster_id: Uuid) -> usize {
        self.live.iter().filter(|entry| entry.value().booster_id == booster_id).count()
    }

    /// Flag every puppet of `booster_id`; returns how many were flagged.
    pub fn request_stop_for(&self, booster_id: Uuid) -> usize {
        let mut flagged = 0;
        for entry in self.live.iter().filter(|entry| entry.value().booster_id == booster_id) {
            entry.value().request_stop();
            flagged += 1;
        }
        flagged
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}
